use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use relaycore::{
    connection::ConnectionFactory,
    upstream::ibroker::{BrokerConsumer, BrokerError, BrokerPublisher, Delivery, QueueMessage},
};
use rumqttc::{
    v5::{
        mqttbytes::{
            v5::{Packet, PubAckReason, Publish},
            QoS,
        },
        AsyncClient, Event, EventLoop,
    },
    Outgoing,
};
use tracing::{debug, info, warn};

use crate::{
    config::{queue_session_id, MqttBrokerConfig},
    connector::MqttConnector,
};

/// One live MQTT session.
///
/// rumqttc only makes progress while its event loop is polled, so every
/// operation here drives `eventloop.poll()` itself until the packet it is
/// waiting for shows up. Publishes that arrive meanwhile are parked in
/// `backlog` and handed out by `next_delivery` in arrival order.
pub struct MqttChannel {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttBrokerConfig,
    /// Subscribed topic, if this is a consumer session.
    queue: Option<String>,
    backlog: VecDeque<Publish>,
    in_flight: Option<(u64, Publish)>,
    next_tag: u64,
    broken: bool,
}

impl std::fmt::Debug for MqttChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttChannel")
            .field("queue", &self.queue)
            .field("backlog", &self.backlog.len())
            .field("in_flight", &self.in_flight.as_ref().map(|(tag, _)| *tag))
            .field("broken", &self.broken)
            .finish()
    }
}

fn lost(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

fn topic_of(publish: &Publish) -> String {
    String::from_utf8_lossy(&publish.topic).into_owned()
}

impl MqttChannel {
    pub(crate) fn new(client: AsyncClient, eventloop: EventLoop, config: MqttBrokerConfig, queue: Option<String>) -> Self {
        Self {
            client,
            eventloop,
            config,
            queue,
            backlog: VecDeque::new(),
            in_flight: None,
            next_tag: 1,
            broken: false,
        }
    }

    pub(crate) fn eventloop_mut(&mut self) -> &mut EventLoop {
        &mut self.eventloop
    }

    /// Messages received but not yet handed out.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// False once the session has failed or been closed by the broker.
    pub fn is_live(&self) -> bool {
        !self.broken
    }

    fn confirm_timeout(&self) -> Duration {
        self.config.confirm_timeout
    }

    fn ensure_live(&self) -> Result<(), BrokerError> {
        if self.broken {
            Err(BrokerError::Unavailable("session closed".into()))
        } else {
            Ok(())
        }
    }

    async fn poll(&mut self) -> Result<Event, BrokerError> {
        match self.eventloop.poll().await {
            Ok(ev) => Ok(ev),
            Err(e) => {
                // rumqttc would silently reconnect on the next poll; the
                // caller owns reconnects, so the session is done here.
                self.broken = true;
                Err(lost(e))
            }
        }
    }

    pub(crate) fn park(&mut self, publish: Publish) {
        match &self.queue {
            Some(q) if q.as_bytes() == publish.topic.as_ref() => self.backlog.push_back(publish),
            _ => debug!(event = "mqtt_unexpected_publish", topic = %topic_of(&publish)),
        }
    }

    /// Poll until `want` accepts an event, parking incoming publishes.
    async fn wait_for<T>(
        &mut self,
        what: &str,
        mut want: impl FnMut(&Event) -> Option<T> + Send,
    ) -> Result<T, BrokerError>
    where
        T: Send,
    {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout();
        loop {
            let ev = match tokio::time::timeout_at(deadline, self.poll()).await {
                Ok(ev) => ev?,
                Err(_) => {
                    self.broken = true;
                    return Err(BrokerError::NotConfirmed(format!(
                        "no {what} within {:?}",
                        self.confirm_timeout()
                    )));
                }
            };
            if let Some(found) = want(&ev) {
                return Ok(found);
            }
            match ev {
                Event::Incoming(Packet::Publish(p)) => self.park(p),
                Event::Incoming(Packet::Disconnect(d)) => {
                    self.broken = true;
                    return Err(lost(format!("broker disconnected: {:?}", d.reason_code)));
                }
                _ => {}
            }
        }
    }

    /// QoS 1 publish, returned once the broker has PUBACKed it.
    async fn publish_confirmed(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(lost)?;

        let pkid = self
            .wait_for("outgoing publish", |ev| match ev {
                Event::Outgoing(Outgoing::Publish(pkid)) => Some(*pkid),
                _ => None,
            })
            .await?;

        // Error reason codes surface as a poll error; these two are successes.
        let reason = self
            .wait_for("PUBACK", |ev| match ev {
                Event::Incoming(Packet::PubAck(ack)) if ack.pkid == pkid => Some(ack.reason),
                _ => None,
            })
            .await?;
        if reason == PubAckReason::NoMatchingSubscribers {
            warn!(event = "mqtt_no_subscribers", topic, pkid);
        }
        Ok(())
    }

    async fn publish_unconfirmed(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(lost)?;
        self.wait_for("outgoing publish", |ev| match ev {
            Event::Outgoing(Outgoing::Publish(_)) => Some(()),
            _ => None,
        })
        .await
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> Result<Publish, BrokerError> {
        match self.in_flight.take() {
            Some((tag, publish)) if tag == delivery.tag => Ok(publish),
            other => {
                self.in_flight = other;
                Err(BrokerError::UnknownDelivery(delivery.tag))
            }
        }
    }

    async fn send_puback(&mut self, publish: &Publish) -> Result<(), BrokerError> {
        self.client.ack(publish).await.map_err(lost)?;
        let pkid = publish.pkid;
        self.wait_for("PUBACK flush", |ev| match ev {
            Event::Outgoing(Outgoing::PubAck(id)) if *id == pkid => Some(()),
            _ => None,
        })
        .await
    }

    /// Send DISCONNECT and wait for it to leave. Anything delivered but not
    /// acked stays with the broker.
    pub async fn close(mut self) {
        if self.broken {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(event = "mqtt_disconnect_failed", error = %e);
            return;
        }
        let flushed = self
            .wait_for("DISCONNECT flush", |ev| {
                matches!(ev, Event::Outgoing(Outgoing::Disconnect)).then_some(())
            })
            .await;
        if let Err(e) = flushed {
            debug!(event = "mqtt_disconnect_failed", error = %e);
        }
    }
}

#[async_trait]
impl BrokerPublisher for MqttChannel {
    /// Opens the queue's own persistent session, subscribes it, and leaves.
    /// From then on the broker keeps the queue's messages for that session
    /// until the consumer connects under the same client id.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_live()?;
        if self.queue.as_deref() == Some(queue) {
            return Ok(());
        }
        let holder = MqttConnector::consumer(self.config.clone(), queue).connect().await?;
        holder.close().await;
        info!(event = "mqtt_queue_session", queue, client_id = %queue_session_id(queue));
        Ok(())
    }

    async fn publish(&mut self, msg: &QueueMessage) -> Result<(), BrokerError> {
        self.ensure_live()?;
        if msg.persistent {
            self.publish_confirmed(&msg.queue, msg.payload.clone()).await
        } else {
            self.publish_unconfirmed(&msg.queue, msg.payload.clone()).await
        }
    }

    /// Polling is what sends PINGREQ; without it the broker drops an idle
    /// session after one and a half keep-alive periods.
    async fn keep_alive(&mut self) -> BrokerError {
        loop {
            if let Err(e) = self.ensure_live() {
                return e;
            }
            match self.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => self.park(p),
                Ok(Event::Incoming(Packet::Disconnect(d))) => {
                    self.broken = true;
                    return lost(format!("broker disconnected: {:?}", d.reason_code));
                }
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }
}

#[async_trait]
impl BrokerConsumer for MqttChannel {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        if self.in_flight.is_some() {
            return Err(BrokerError::PrefetchExceeded(1));
        }
        if self.queue.is_none() {
            return Err(BrokerError::Protocol("channel has no subscription".into()));
        }
        self.ensure_live()?;

        let publish = loop {
            if let Some(p) = self.backlog.pop_front() {
                break p;
            }
            match self.poll().await? {
                Event::Incoming(Packet::Publish(p)) => self.park(p),
                Event::Incoming(Packet::Disconnect(_)) => {
                    self.broken = true;
                    return Ok(None);
                }
                _ => {}
            }
        };

        let tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            tag,
            payload: publish.payload.to_vec(),
            redelivered: publish.dup,
        };
        self.in_flight = Some((tag, publish));
        Ok(Some(delivery))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let publish = self.take_in_flight(delivery)?;
        self.ensure_live()?;
        self.send_puback(&publish).await
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let publish = self.take_in_flight(delivery)?;
        self.ensure_live()?;
        if requeue {
            // MQTT has no reject; hand the broker a fresh copy first so the
            // old delivery can be released without a window where neither exists.
            let topic = topic_of(&publish);
            if let Err(e) = self.publish_confirmed(&topic, publish.payload.to_vec()).await {
                warn!(event = "mqtt_requeue_failed", topic = %topic, error = %e);
                return Err(e);
            }
        }
        self.send_puback(&publish).await
    }
}
