//! MQTT 5 rendition of the durable broker seam.
//!
//! A queue is a topic plus the persistent session subscribed to it. The
//! broker only retains a topic's QoS 1 messages for sessions subscribed to
//! it, so a queue exists once its session (`queue_session_id`) has
//! subscribed; publishers call `declare_queue` first to make sure of that.
//! Unacknowledged messages stay with the session until a PUBACK arrives and
//! are redelivered after a reconnect. Consumer sessions advertise a receive
//! maximum of one, so at most one delivery is outstanding at a time.
pub mod channel;
pub mod config;
pub mod connector;

pub use channel::MqttChannel;
pub use config::{queue_session_id, MqttBrokerConfig, Role};
pub use connector::MqttConnector;
