//! In-process durable broker.
//!
//! Behaves like the real thing where the relay depends on it: queues outlive
//! channels, unacknowledged deliveries are requeued (flagged redelivered)
//! when their channel goes away or they are nacked with requeue, and each
//! channel has an in-flight limit. Outages and dropped connections can be
//! injected, which is what the relay and consumer tests drive it with.
//!
//! With `discard_undeclared` it also reproduces the MQTT trap of a topic
//! nobody holds a session for: the publish is confirmed and then dropped.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use super::ibroker::{BrokerConsumer, BrokerError, BrokerPublisher, Delivery, QueueMessage};
use crate::connection::ConnectionFactory;

#[derive(Debug, Clone)]
struct Stored {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    /// Bumped whenever existing connections are severed.
    epoch: u64,
    queues: HashMap<String, VecDeque<Stored>>,
    declared: HashSet<String>,
    discard_undeclared: bool,
    discarded: u64,
    unacked: HashMap<u64, (String, Stored)>,
    next_tag: u64,
    fail_publishes: u32,
    fail_declares: u32,
    published: u64,
    connections: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState {
                available: true,
                epoch: 0,
                queues: HashMap::new(),
                declared: HashSet::new(),
                discard_undeclared: false,
                discarded: 0,
                unacked: HashMap::new(),
                next_tag: 1,
                fail_publishes: 0,
                fail_declares: 0,
                published: 0,
                connections: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the broker down (severing every channel) or bring it back.
    pub fn set_available(&self, available: bool) {
        let mut st = self.state();
        if st.available && !available {
            st.epoch += 1;
        }
        st.available = available;
    }

    /// Sever every open channel; new connections still succeed.
    pub fn drop_connections(&self) {
        self.state().epoch += 1;
    }

    /// The next `n` publishes fail as a lost connection.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state().fail_publishes = n;
    }

    /// The next `n` queue declarations fail as a lost connection.
    pub fn fail_next_declares(&self, n: u32) {
        self.state().fail_declares = n;
    }

    /// From now on, confirm and drop publishes to queues nobody declared.
    pub fn discard_undeclared(&self) {
        self.state().discard_undeclared = true;
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.state().declared.contains(queue)
    }

    /// Publishes confirmed but dropped for want of a declared queue.
    pub fn discarded(&self) -> u64 {
        self.state().discarded
    }

    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut st = self.state();
        st.declared.insert(queue.to_string());
        st.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Stored {
                payload: payload.into(),
                redelivered: false,
            });
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked_len(&self) -> usize {
        self.state().unacked.len()
    }

    /// Snapshot of the payloads waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.iter().map(|s| s.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> u64 {
        self.state().published
    }

    pub fn connections(&self) -> u64 {
        self.state().connections
    }

    pub fn channel(&self, queue: impl Into<String>, prefetch: usize) -> Result<MemoryChannel, BrokerError> {
        let mut st = self.state();
        if !st.available {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        st.connections += 1;
        Ok(MemoryChannel {
            broker: self.clone(),
            queue: queue.into(),
            prefetch: prefetch.max(1),
            epoch: st.epoch,
            outstanding: HashSet::new(),
        })
    }

    pub fn connector(&self, queue: impl Into<String>, prefetch: usize) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            queue: queue.into(),
            prefetch,
        }
    }
}

/// One connection + channel to a `MemoryBroker`.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    queue: String,
    prefetch: usize,
    epoch: u64,
    outstanding: HashSet<u64>,
}

impl MemoryChannel {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let st = self.broker.state();
        if st.available && st.epoch == self.epoch {
            Ok(st)
        } else {
            Err(BrokerError::Unavailable("connection reset".into()))
        }
    }

    fn settle(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        if !self.outstanding.contains(&tag) {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        let mut st = self.live()?;
        let entry = st.unacked.remove(&tag);
        if let (true, Some((queue, mut stored))) = (requeue, entry) {
            stored.redelivered = true;
            st.queues.entry(queue).or_default().push_front(stored);
        }
        drop(st);
        self.outstanding.remove(&tag);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut st = self.broker.state();
        for tag in self.outstanding.drain() {
            if let Some((queue, mut stored)) = st.unacked.remove(&tag) {
                stored.redelivered = true;
                st.queues.entry(queue).or_default().push_front(stored);
            }
        }
    }
}

#[async_trait]
impl BrokerPublisher for MemoryChannel {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        let mut st = self.live()?;
        if st.fail_declares > 0 {
            st.fail_declares -= 1;
            st.epoch += 1;
            return Err(BrokerError::Unavailable("connection lost during declare".into()));
        }
        st.declared.insert(queue.to_string());
        st.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&mut self, msg: &QueueMessage) -> Result<(), BrokerError> {
        let mut st = self.live()?;
        if st.fail_publishes > 0 {
            st.fail_publishes -= 1;
            st.epoch += 1;
            return Err(BrokerError::Unavailable("connection lost during publish".into()));
        }
        if st.discard_undeclared && !st.declared.contains(&msg.queue) {
            st.discarded += 1;
            return Ok(());
        }
        st.queues
            .entry(msg.queue.clone())
            .or_default()
            .push_back(Stored {
                payload: msg.payload.clone(),
                redelivered: false,
            });
        st.published += 1;
        Ok(())
    }

    async fn keep_alive(&mut self) -> BrokerError {
        loop {
            if let Some(e) = self.live().err() {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryChannel {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        if self.outstanding.len() >= self.prefetch {
            return Err(BrokerError::PrefetchExceeded(self.prefetch));
        }
        let mut st = self.live()?;
        // Consuming a queue is a subscription to it.
        if !st.declared.contains(&self.queue) {
            st.declared.insert(self.queue.clone());
        }
        let Some(stored) = st.queues.get_mut(&self.queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        let tag = st.next_tag;
        st.next_tag += 1;
        let delivery = Delivery {
            tag,
            payload: stored.payload.clone(),
            redelivered: stored.redelivered,
        };
        st.unacked.insert(tag, (self.queue.clone(), stored));
        drop(st);

        self.outstanding.insert(tag);
        Ok(Some(delivery))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.settle(delivery.tag, false)
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.settle(delivery.tag, requeue)
    }
}

/// Dials `MemoryChannel`s bound to one queue.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    queue: String,
    prefetch: usize,
}

#[async_trait]
impl ConnectionFactory for MemoryConnector {
    type Conn = MemoryChannel;
    type Error = BrokerError;

    fn name(&self) -> &str {
        "broker"
    }

    async fn connect(&self) -> Result<MemoryChannel, BrokerError> {
        self.broker.channel(self.queue.clone(), self.prefetch)
    }
}
