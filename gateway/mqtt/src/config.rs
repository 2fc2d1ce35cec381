use std::time::Duration;

use relaycore::config::BrokerArgs;
use rumqttc::v5::{mqttbytes::v5::ConnectProperties, MqttOptions};

/// Unacknowledged deliveries the broker may push to a consumer session.
pub const CONSUMER_RECEIVE_MAXIMUM: u16 = 1;

/// MQTT 5 reserves `u32::MAX` for a session that never expires.
pub const QUEUE_SESSION_EXPIRY: u32 = u32::MAX;

/// Client id of the persistent session that holds `queue`.
///
/// A topic only retains messages for sessions subscribed to it, so the
/// session that declares a queue and the one that consumes it must be the
/// same session.
pub fn queue_session_id(queue: &str) -> String {
    format!("persistence-consumer-{queue}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttBrokerConfig {
    pub host: String,
    pub port: u16,
    /// Publisher sessions only; consumer sessions are named after their queue.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK/SUBACK.
    pub connect_timeout: Duration,
    /// How long to wait for a PUBACK before calling a publish unconfirmed.
    pub confirm_timeout: Duration,
    /// Capacity of the rumqttc request channel.
    pub request_capacity: usize,
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "udp-relay".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(10),
            request_capacity: 16,
        }
    }
}

/// What a connection is used for; decides the session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Publisher,
    /// Persistent session subscribed to `queue`, one delivery in flight.
    Consumer { queue: String },
}

impl MqttBrokerConfig {
    pub fn from_args(args: &BrokerArgs, role_name: &str) -> Self {
        let (username, password) = match args.credentials() {
            Some((u, p)) => (Some(u), Some(p)),
            None => (None, None),
        };
        Self {
            host: args.broker_host.clone(),
            port: args.broker_port,
            client_id: args.client_id(role_name),
            username,
            password,
            keep_alive_secs: args.broker_keep_alive_secs,
            ..Self::default()
        }
    }

    pub fn options(&self, role: &Role) -> MqttOptions {
        let client_id = match role {
            Role::Publisher => self.client_id.clone(),
            Role::Consumer { queue } => queue_session_id(queue),
        };
        let mut opts = MqttOptions::new(client_id, &self.host, self.port);
        opts.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));

        if let (Some(u), Some(p)) = (self.username.clone(), self.password.clone()) {
            opts.set_credentials(u, p);
        }

        match role {
            Role::Publisher => {
                opts.set_clean_start(true);
            }
            Role::Consumer { .. } => {
                // Broker must keep our unacked messages across reconnects,
                // and only an explicit ack may release them.
                opts.set_clean_start(false);
                opts.set_manual_acks(true);
                let mut props = ConnectProperties::new();
                props.session_expiry_interval = Some(QUEUE_SESSION_EXPIRY);
                props.receive_maximum = Some(CONSUMER_RECEIVE_MAXIMUM);
                opts.set_connect_properties(props);
            }
        }
        opts
    }
}
