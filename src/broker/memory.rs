//! In-process broker implementing the transport seam.
//!
//! Supports direct, fanout and topic routing, per-queue backlogs, and failure
//! injection (unreachable broker, severed links). Used by single-host
//! deployments and throughout the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::broker::connection::{
    BrokerAddress, BrokerLink, Connector, DeliverySink, LossNotifier,
};
use crate::broker::exchange::{ExchangeKind, ExchangeSpec, QueueSpec, topic_matches};
use crate::error::BrokerError;
use crate::packet::Packet;

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Vec<u8>>,
    consumer: Option<(u64, DeliverySink)>,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    links: HashMap<u64, LossNotifier>,
    next_link: u64,
    published: u64,
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make new connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Drop every open link, notifying each owner of the loss.
    pub fn sever(&self) {
        let notifiers: Vec<LossNotifier> = {
            let mut state = self.lock();
            for queue in state.queues.values_mut() {
                queue.consumer = None;
            }
            state.links.drain().map(|(_, n)| n).collect()
        };
        for notify in notifiers {
            notify("connection reset by broker".to_string());
        }
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.lock().exchanges.entry(name.to_string()).or_insert(kind);
    }

    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_default();
        let bindings = state.bindings.entry(exchange.to_string()).or_default();
        let binding = (queue.to_string(), routing_key.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    /// Attach a consumer outside of any link, e.g. a routing stand-in in tests.
    pub fn consume(&self, queue: &str, sink: DeliverySink) {
        self.attach(u64::MAX, queue, sink);
    }

    fn attach(&self, link: u64, queue: &str, sink: DeliverySink) {
        let backlog: Vec<Vec<u8>> = {
            let mut state = self.lock();
            let queue = state.queues.entry(queue.to_string()).or_default();
            queue.consumer = Some((link, sink.clone()));
            queue.backlog.drain(..).collect()
        };
        for body in backlog {
            sink(body);
        }
    }

    fn detach(&self, link: u64, queue: &str) {
        if let Some(queue) = self.lock().queues.get_mut(queue) {
            if matches!(queue.consumer, Some((id, _)) if id == link) {
                queue.consumer = None;
            }
        }
    }

    /// Route a message body through an exchange.
    ///
    /// Messages matching no binding are dropped, as a real broker would.
    pub fn publish(&self, exchange: &str, kind: ExchangeKind, routing_key: &str, body: &[u8]) {
        let deliveries: Vec<DeliverySink> = {
            let mut state = self.lock();
            state.published += 1;
            let kind = state.exchanges.get(exchange).copied().unwrap_or(kind);
            let targets: Vec<String> = state
                .bindings
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(_, key)| match kind {
                            ExchangeKind::Fanout => true,
                            ExchangeKind::Direct => key == routing_key,
                            ExchangeKind::Topic => topic_matches(key, routing_key),
                        })
                        .map(|(queue, _)| queue.clone())
                        .collect()
                })
                .unwrap_or_default();

            let mut deliveries = Vec::new();
            for name in targets {
                let queue = state.queues.entry(name).or_default();
                match &queue.consumer {
                    Some((_, sink)) => deliveries.push(sink.clone()),
                    None => queue.backlog.push_back(body.to_vec()),
                }
            }
            deliveries
        };

        for sink in deliveries {
            sink(body.to_vec());
        }
    }

    /// Drain the backlog of an unconsumed queue, decoding each message.
    pub fn take(&self, queue: &str) -> Vec<Packet> {
        let bodies: Vec<Vec<u8>> = self
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.backlog.drain(..).collect())
            .unwrap_or_default();
        bodies
            .iter()
            .filter_map(|body| Packet::decode(body).ok())
            .collect()
    }

    /// Total number of publishes seen.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    fn open_link(&self, on_loss: LossNotifier) -> Option<u64> {
        let mut state = self.lock();
        if state.unreachable {
            return None;
        }
        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(id, on_loss);
        Some(id)
    }

    fn link_open(&self, link: u64) -> bool {
        self.lock().links.contains_key(&link)
    }

    fn close_link(&self, link: u64) {
        let mut state = self.lock();
        state.links.remove(&link);
        for queue in state.queues.values_mut() {
            if matches!(queue.consumer, Some((id, _)) if id == link) {
                queue.consumer = None;
            }
        }
    }
}

/// A link to a [`MemoryBroker`].
pub struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
    label: String,
    closed: AtomicBool,
}

impl MemoryLink {
    fn check(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || !self.broker.link_open(self.id) {
            return Err(BrokerError::Io {
                id: self.label.clone(),
                reason: "link closed".to_string(),
            });
        }
        Ok(())
    }
}

impl BrokerLink for MemoryLink {
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.check()?;
        self.broker.declare_exchange(&exchange.name, exchange.kind);
        Ok(())
    }

    fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.check()?;
        self.broker.declare_queue(&queue.name);
        Ok(())
    }

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.broker.bind(queue, exchange, routing_key);
        Ok(())
    }

    fn consume(&self, queue: &str, sink: DeliverySink) -> Result<(), BrokerError> {
        self.check()?;
        self.broker.attach(self.id, queue, sink);
        Ok(())
    }

    fn cancel(&self, queue: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.broker.detach(self.id, queue);
        Ok(())
    }

    fn publish(
        &self,
        exchange: &ExchangeSpec,
        routing_key: &str,
        body: &[u8],
        _persistent: bool,
    ) -> Result<(), BrokerError> {
        self.check()?;
        self.broker
            .publish(&exchange.name, exchange.kind, routing_key, body);
        Ok(())
    }

    fn prefetch(&self, _count: u16) -> Result<(), BrokerError> {
        self.check()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_link(self.id);
        }
    }
}

/// Connects to in-process brokers by host and port.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    brokers: HashMap<(String, u16), MemoryBroker>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, host: impl Into<String>, port: u16, broker: MemoryBroker) -> Self {
        self.brokers.insert((host.into(), port), broker);
        self
    }

    pub fn broker(&self, host: &str, port: u16) -> Option<&MemoryBroker> {
        self.brokers.get(&(host.to_string(), port))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &BrokerAddress,
        on_loss: LossNotifier,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let label = address.id().to_string();
        let broker = self
            .brokers
            .get(&(address.host.clone(), address.port))
            .ok_or_else(|| BrokerError::ConnectFailed {
                id: label.clone(),
                reason: "connection refused".to_string(),
            })?;
        let id = broker
            .open_link(on_loss)
            .ok_or_else(|| BrokerError::ConnectFailed {
                id: label.clone(),
                reason: "broker unreachable".to_string(),
            })?;

        Ok(Arc::new(MemoryLink {
            broker: broker.clone(),
            id,
            label,
            closed: AtomicBool::new(false),
        }))
    }
}
