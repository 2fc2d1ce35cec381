use async_trait::async_trait;
use relaycore::{connection::ConnectionFactory, upstream::ibroker::BrokerError};
use rumqttc::v5::{
    mqttbytes::{
        v5::{ConnectReturnCode, Packet, SubscribeReasonCode},
        QoS,
    },
    AsyncClient, Event,
};
use tracing::info;

use crate::{
    channel::MqttChannel,
    config::{MqttBrokerConfig, Role},
};

/// Dials an `MqttChannel` and waits until the session is usable.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttBrokerConfig,
    role: Role,
}

impl MqttConnector {
    pub fn publisher(config: MqttBrokerConfig) -> Self {
        Self {
            config,
            role: Role::Publisher,
        }
    }

    /// Consumer sessions are persistent and named after `queue`, so dialing
    /// one also declares the queue.
    pub fn consumer(config: MqttBrokerConfig, queue: impl Into<String>) -> Self {
        Self {
            config,
            role: Role::Consumer { queue: queue.into() },
        }
    }

    pub fn config(&self) -> &MqttBrokerConfig {
        &self.config
    }

    async fn handshake(&self) -> Result<MqttChannel, BrokerError> {
        let opts = self.config.options(&self.role);
        let client_id = opts.client_id();
        let (client, eventloop) = AsyncClient::new(opts, self.config.request_capacity);

        let queue = match &self.role {
            Role::Publisher => None,
            Role::Consumer { queue } => {
                // Queued now, sent by the event loop right after CONNECT.
                client
                    .subscribe(queue.as_str(), QoS::AtLeastOnce)
                    .await
                    .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
                Some(queue.clone())
            }
        };
        let mut channel = MqttChannel::new(client, eventloop, self.config.clone(), queue.clone());

        let mut connected = false;
        let mut subscribed = queue.is_none();
        while !(connected && subscribed) {
            let ev = channel
                .eventloop_mut()
                .poll()
                .await
                .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
            match ev {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BrokerError::Unavailable(format!("connection refused: {:?}", ack.code)));
                    }
                    info!(
                        event = "mqtt_session",
                        client_id = %client_id,
                        session_present = ack.session_present,
                    );
                    connected = true;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    // A downgrade to QoS 0 would make the queue lossy.
                    let granted = SubscribeReasonCode::Success(QoS::AtLeastOnce);
                    if let Some(code) = ack.return_codes.iter().find(|c| **c != granted) {
                        return Err(BrokerError::Protocol(format!("subscription refused: {code:?}")));
                    }
                    subscribed = true;
                }
                // Redeliveries from a persistent session can beat the SUBACK.
                Event::Incoming(Packet::Publish(p)) => channel.park(p),
                _ => {}
            }
        }
        Ok(channel)
    }
}

#[async_trait]
impl ConnectionFactory for MqttConnector {
    type Conn = MqttChannel;
    type Error = BrokerError;

    fn name(&self) -> &str {
        "broker"
    }

    async fn connect(&self) -> Result<MqttChannel, BrokerError> {
        match tokio::time::timeout(self.config.connect_timeout, self.handshake()).await {
            Ok(res) => res,
            Err(_) => Err(BrokerError::Unavailable(format!(
                "no CONNACK from {}:{} within {:?}",
                self.config.host, self.config.port, self.config.connect_timeout
            ))),
        }
    }
}
