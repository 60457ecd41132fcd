//! Pool of interchangeable broker connections.
//!
//! The pool presents one logical publish/subscribe channel over several
//! physically distinct brokers. Connection attempts run on spawned tasks and
//! report back through [`BrokerEvent`]s; the owner feeds those events into
//! [`BrokerPool::handle_event`] from its coordinating loop, which is the only
//! place connection state changes.

pub mod amqp;
mod connection;
mod exchange;
pub mod memory;

pub use connection::{
    BrokerAddress, BrokerId, BrokerLink, ConnectionStatus, Connector, DEFAULT_BROKER_PORT,
    DeliverySink, LossNotifier,
};
pub use exchange::{
    ADVERTISE_EXCHANGE, ExchangeKind, ExchangeSpec, PublishOptions, QueueSpec,
    REGISTRATION_EXCHANGE, REQUEST_EXCHANGE, STATS_EXCHANGE, SubscribeOptions, topic_matches,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::BrokerError;
use crate::packet::{Packet, PacketKind};
use crate::stats::{ExceptionCallback, ExceptionStats, ExceptionSummary, nil_if_zero};

/// Upper bound on the number of polls skipped between reconnect attempts.
pub const MAX_FAILED_BACKOFF: u32 = 64;

/// Invoked for every packet delivered on a subscribed queue.
pub type PacketHandler = Arc<dyn Fn(&BrokerId, Packet) + Send + Sync>;

/// Outcome of a connection attempt or a lost link, posted to the owner's loop.
pub enum BrokerEvent {
    Connected {
        id: BrokerId,
        generation: u64,
        link: Arc<dyn BrokerLink>,
    },
    ConnectFailed {
        id: BrokerId,
        generation: u64,
        reason: String,
    },
    Lost {
        id: BrokerId,
        generation: u64,
        reason: String,
    },
}

impl fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { id, generation, .. } => f
                .debug_struct("Connected")
                .field("id", id)
                .field("generation", generation)
                .finish(),
            Self::ConnectFailed {
                id,
                generation,
                reason,
            } => f
                .debug_struct("ConnectFailed")
                .field("id", id)
                .field("generation", generation)
                .field("reason", reason)
                .finish(),
            Self::Lost {
                id,
                generation,
                reason,
            } => f
                .debug_struct("Lost")
                .field("id", id)
                .field("generation", generation)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// A connection status transition produced by [`BrokerPool::handle_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: BrokerId,
    pub status: ConnectionStatus,
}

/// Summary of one connection for status queries and statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub id: BrokerId,
    pub alias: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnects: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerPoolStats {
    pub brokers: Vec<BrokerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<BTreeMap<String, ExceptionSummary>>,
}

/// Exponential spacing of reconnect attempts for a failed connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Backoff {
    skip: u32,
    interval: u32,
}

impl Backoff {
    /// Whether a reconnect should be attempted on this poll.
    fn poll(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        self.interval = if self.interval == 0 {
            1
        } else {
            (self.interval * 2).min(MAX_FAILED_BACKOFF)
        };
        self.skip = self.interval;
        true
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct BrokerClient {
    address: BrokerAddress,
    id: BrokerId,
    status: ConnectionStatus,
    link: Option<Arc<dyn BrokerLink>>,
    generation: u64,
    backoff: Backoff,
    connecting: Option<AbortHandle>,
    disconnects: u64,
    failures: u64,
}

impl BrokerClient {
    fn new(address: BrokerAddress) -> Self {
        Self {
            id: address.id(),
            address,
            status: ConnectionStatus::Disconnected,
            link: None,
            generation: 0,
            backoff: Backoff::default(),
            connecting: None,
            disconnects: 0,
            failures: 0,
        }
    }

    fn drop_link(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    fn summary(&self) -> BrokerStatus {
        BrokerStatus {
            id: self.id.clone(),
            alias: self.address.alias(),
            status: self.status,
            disconnects: nil_if_zero(self.disconnects),
            failures: nil_if_zero(self.failures),
        }
    }
}

struct Subscription {
    queue: QueueSpec,
    exchange: Option<ExchangeSpec>,
    options: SubscribeOptions,
    handler: PacketHandler,
}

impl Subscription {
    fn applies_to(&self, id: &BrokerId) -> bool {
        self.options
            .brokers
            .as_ref()
            .is_none_or(|ids| ids.contains(id))
    }

    /// Declare, bind and consume the queue on one connection.
    fn install(&self, link: &dyn BrokerLink, id: &BrokerId) -> Result<(), BrokerError> {
        if self.queue.declare {
            link.declare_queue(&self.queue)?;
        }
        for exchange in self.exchange.iter().chain(self.options.extra_exchange.iter()) {
            if exchange.declare {
                link.declare_exchange(exchange)?;
            }
            link.bind(&self.queue.name, &exchange.name, exchange.default_routing_key())?;
        }
        link.consume(&self.queue.name, self.sink(id.clone()))
    }

    fn sink(&self, id: BrokerId) -> DeliverySink {
        let queue = self.queue.name.clone();
        let accept: Vec<PacketKind> = self.options.accept.clone();
        let handler = self.handler.clone();
        Arc::new(move |body: Vec<u8>| match Packet::decode(&body) {
            Ok(packet) if accept.is_empty() || accept.contains(&packet.kind()) => {
                handler(&id, packet)
            }
            Ok(packet) => {
                tracing::debug!(broker = %id, queue = %queue, "Ignoring {} packet", packet.kind());
            }
            Err(e) => {
                tracing::warn!(broker = %id, queue = %queue, error = %e, "Dropping undecodable message");
            }
        })
    }
}

/// Owns every broker connection of one agent.
pub struct BrokerPool {
    clients: Vec<BrokerClient>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    subscriptions: Vec<Subscription>,
    connect_timeout: Duration,
    prefetch: Option<u16>,
    exceptions: ExceptionStats,
}

impl BrokerPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<BrokerEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            clients: Vec::new(),
            connector,
            events,
            subscriptions: Vec::new(),
            connect_timeout,
            prefetch: None,
            exceptions: ExceptionStats::default(),
        }
    }

    pub fn set_exception_callback(&mut self, callback: Option<ExceptionCallback>) {
        self.exceptions.set_callback(callback);
    }

    fn position(&self, id: &BrokerId) -> Option<usize> {
        self.clients.iter().position(|c| &c.id == id)
    }

    /// Position of the client if `generation` is still its current attempt.
    fn current(&self, id: &BrokerId, generation: u64) -> Option<usize> {
        self.position(id)
            .filter(|&pos| self.clients[pos].generation == generation)
    }

    /// Start connecting to a broker.
    ///
    /// Does nothing if the broker is already connected or connecting, unless
    /// `force` is set, in which case the existing link is closed and a fresh
    /// attempt replaces it. A known broker keeps its place in the preference
    /// order unless `priority` moves it. The outcome arrives later as a
    /// [`BrokerEvent`]. Returns an error description if the attempt could not
    /// be started.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        index: usize,
        priority: Option<usize>,
        force: bool,
    ) -> Option<String> {
        if host.is_empty() {
            return Some(format!("Invalid broker address ':{port}'"));
        }

        let address = BrokerAddress::new(host, port, index).with_priority(priority);
        let id = address.id();
        let pos = match self.position(&id) {
            Some(pos) => {
                let status = self.clients[pos].status;
                if !force
                    && matches!(
                        status,
                        ConnectionStatus::Connected | ConnectionStatus::Connecting
                    )
                {
                    return None;
                }
                let mut client = self.clients.remove(pos);
                client.drop_link();
                client.address = address;
                self.insert(client, Some(priority.unwrap_or(pos)))
            }
            None => self.insert(BrokerClient::new(address), priority),
        };

        self.start_connect(pos);
        None
    }

    fn insert(&mut self, client: BrokerClient, priority: Option<usize>) -> usize {
        let pos = priority.unwrap_or(self.clients.len()).min(self.clients.len());
        self.clients.insert(pos, client);
        pos
    }

    fn start_connect(&mut self, pos: usize) {
        let client = &mut self.clients[pos];
        client.generation += 1;
        client.status = ConnectionStatus::Connecting;

        let generation = client.generation;
        let id = client.id.clone();
        let address = client.address.clone();
        let connector = self.connector.clone();
        let events = self.events.clone();
        let timeout = self.connect_timeout;

        let loss_events = events.clone();
        let loss_id = id.clone();
        let on_loss: LossNotifier = Arc::new(move |reason| {
            let _ = loss_events.send(BrokerEvent::Lost {
                id: loss_id.clone(),
                generation,
                reason,
            });
        });

        tracing::info!(broker = %id, alias = %address.alias(), "Connecting to broker");
        let handle = tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, connector.connect(&address, on_loss))
                .await
            {
                Ok(Ok(link)) => BrokerEvent::Connected {
                    id,
                    generation,
                    link,
                },
                Ok(Err(e)) => BrokerEvent::ConnectFailed {
                    id,
                    generation,
                    reason: e.to_string(),
                },
                Err(_) => {
                    let reason = BrokerError::ConnectTimeout {
                        id: id.to_string(),
                        seconds: timeout.as_secs(),
                    }
                    .to_string();
                    BrokerEvent::ConnectFailed {
                        id,
                        generation,
                        reason,
                    }
                }
            };
            let _ = events.send(event);
        });
        client.connecting = Some(handle.abort_handle());
    }

    /// Apply a connection event. Events from superseded attempts are ignored.
    pub fn handle_event(&mut self, event: BrokerEvent) -> Option<StatusChange> {
        match event {
            BrokerEvent::Connected {
                id,
                generation,
                link,
            } => {
                let Some(pos) = self.current(&id, generation) else {
                    link.close();
                    return None;
                };
                if self.clients[pos].status != ConnectionStatus::Connecting {
                    link.close();
                    return None;
                }

                let client = &mut self.clients[pos];
                client.connecting = None;
                client.link = Some(link.clone());
                client.status = ConnectionStatus::Connected;
                client.backoff.reset();
                tracing::info!(broker = %id, "Connected to broker");

                if let Some(count) = self.prefetch {
                    if let Err(e) = link.prefetch(count) {
                        tracing::warn!(broker = %id, error = %e, "Failed to set prefetch");
                        self.exceptions.track("prefetch", &e, None);
                    }
                }
                self.resubscribe(&id, link.as_ref());

                Some(StatusChange {
                    id,
                    status: ConnectionStatus::Connected,
                })
            }
            BrokerEvent::ConnectFailed {
                id,
                generation,
                reason,
            } => {
                let pos = self.current(&id, generation)?;
                let client = &mut self.clients[pos];
                if client.status != ConnectionStatus::Connecting {
                    return None;
                }
                client.connecting = None;
                client.status = ConnectionStatus::Failed;
                client.failures += 1;
                tracing::warn!(broker = %id, reason = %reason, "Failed to connect to broker");

                Some(StatusChange {
                    id,
                    status: ConnectionStatus::Failed,
                })
            }
            BrokerEvent::Lost {
                id,
                generation,
                reason,
            } => {
                let pos = self.current(&id, generation)?;
                let client = &mut self.clients[pos];
                if client.status != ConnectionStatus::Connected {
                    return None;
                }
                client.drop_link();
                client.status = ConnectionStatus::Failed;
                client.disconnects += 1;
                tracing::warn!(broker = %id, reason = %reason, "Lost connection to broker");

                Some(StatusChange {
                    id,
                    status: ConnectionStatus::Failed,
                })
            }
        }
    }

    /// Re-install every subscription on a newly connected link.
    fn resubscribe(&mut self, id: &BrokerId, link: &dyn BrokerLink) {
        let mut errors = Vec::new();
        for subscription in self.subscriptions.iter().filter(|s| s.applies_to(id)) {
            if let Err(e) = subscription.install(link, id) {
                errors.push((subscription.queue.name.clone(), e));
            }
        }
        for (queue, e) in errors {
            tracing::warn!(broker = %id, queue = %queue, error = %e, "Failed to resubscribe");
            self.exceptions.track("subscribe", &e, None);
        }
    }

    /// Serialize a packet once and publish it.
    ///
    /// Candidates are tried in preference order; the first success ends the
    /// publish unless `fanout` is set. A connection whose link errors is
    /// marked failed. Returns the connections actually used.
    pub fn publish(
        &mut self,
        exchange: &ExchangeSpec,
        packet: &Packet,
        options: &PublishOptions,
    ) -> Result<Vec<BrokerId>, BrokerError> {
        let body = packet.encode()?;
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or(exchange.default_routing_key())
            .to_string();

        let candidates: Vec<usize> = match &options.brokers {
            Some(ids) => ids.iter().filter_map(|id| self.position(id)).collect(),
            None => (0..self.clients.len()).collect(),
        };

        let mut used = Vec::new();
        for pos in candidates {
            let client = &mut self.clients[pos];
            if client.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(link) = client.link.clone() else {
                continue;
            };

            let result = if exchange.declare {
                link.declare_exchange(exchange)
            } else {
                Ok(())
            }
            .and_then(|()| link.publish(exchange, &routing_key, &body, options.persistent));

            match result {
                Ok(()) => {
                    tracing::debug!(broker = %client.id, exchange = %exchange.name, "SEND {}", packet.trace());
                    used.push(client.id.clone());
                    if !options.fanout {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(broker = %client.id, error = %e, "Failed to publish {}", packet.trace());
                    client.drop_link();
                    client.status = ConnectionStatus::Failed;
                    client.failures += 1;
                    self.exceptions.track("publish", &e, Some(packet));
                }
            }
        }

        if used.is_empty() {
            Err(BrokerError::NoConnectedBrokers)
        } else {
            Ok(used)
        }
    }

    /// Declare and consume a queue on every (selected) connected broker.
    ///
    /// The subscription is remembered and re-installed whenever a broker
    /// (re)connects. Returns the connections the subscribe was issued on.
    pub fn subscribe(
        &mut self,
        queue: QueueSpec,
        exchange: Option<ExchangeSpec>,
        options: SubscribeOptions,
        handler: PacketHandler,
    ) -> Vec<BrokerId> {
        let subscription = Subscription {
            queue,
            exchange,
            options,
            handler,
        };

        let mut ids = Vec::new();
        let mut errors = Vec::new();
        for client in &self.clients {
            if client.status != ConnectionStatus::Connected || !subscription.applies_to(&client.id)
            {
                continue;
            }
            let Some(link) = &client.link else {
                continue;
            };
            match subscription.install(link.as_ref(), &client.id) {
                Ok(()) => ids.push(client.id.clone()),
                Err(e) => errors.push((client.id.clone(), e)),
            }
        }
        for (id, e) in errors {
            tracing::warn!(broker = %id, queue = %subscription.queue.name, error = %e, "Failed to subscribe");
            self.exceptions.track("subscribe", &e, None);
        }

        tracing::info!(queue = %subscription.queue.name, brokers = ?ids, "[setup] Subscribed to queue");
        self.subscriptions
            .retain(|s| s.queue.name != subscription.queue.name);
        self.subscriptions.push(subscription);
        ids
    }

    /// Stop consuming the named queues everywhere and forget them.
    pub fn unsubscribe(&mut self, queues: &[String]) -> Vec<BrokerId> {
        let mut ids = Vec::new();
        for client in &self.clients {
            if client.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(link) = &client.link else {
                continue;
            };
            let mut issued = false;
            for queue in queues {
                match link.cancel(queue) {
                    Ok(()) => issued = true,
                    Err(e) => {
                        tracing::warn!(broker = %client.id, queue = %queue, error = %e, "Failed to unsubscribe");
                    }
                }
            }
            if issued {
                ids.push(client.id.clone());
            }
        }
        self.subscriptions
            .retain(|s| !queues.contains(&s.queue.name));
        ids
    }

    /// Connections in the failed state.
    ///
    /// With `backoff`, a connection is only returned on polls spaced by an
    /// interval that doubles per consecutive failure, so callers polling on a
    /// timer do not hammer an unreachable broker.
    pub fn failed(&mut self, backoff: bool) -> Vec<BrokerId> {
        self.clients
            .iter_mut()
            .filter(|c| c.status == ConnectionStatus::Failed)
            .filter_map(|c| (!backoff || c.backoff.poll()).then(|| c.id.clone()))
            .collect()
    }

    /// Mark connections unusable without closing them, so a later explicit
    /// reconnect can still recover them.
    pub fn declare_unusable(&mut self, ids: &[BrokerId]) -> Result<(), BrokerError> {
        for id in ids {
            let pos = self.position(id).ok_or_else(|| BrokerError::NotConfigured {
                id: id.to_string(),
            })?;
            let client = &mut self.clients[pos];
            if matches!(
                client.status,
                ConnectionStatus::Connected | ConnectionStatus::Failed
            ) {
                tracing::info!(broker = %id, "Marking broker unusable");
                client.status = ConnectionStatus::Unusable;
            }
        }
        Ok(())
    }

    /// Close one connection, keeping it configured.
    pub fn close_one(&mut self, id: &BrokerId) -> Result<(), BrokerError> {
        let pos = self.position(id).ok_or_else(|| BrokerError::NotConfigured {
            id: id.to_string(),
        })?;
        let client = &mut self.clients[pos];
        client.drop_link();
        client.status = ConnectionStatus::Closed;
        tracing::info!(broker = %id, "Closed broker connection");
        Ok(())
    }

    /// Close and forget a connection.
    pub fn remove(&mut self, host: &str, port: u16) -> Option<BrokerId> {
        let id = BrokerId::new(host, port);
        let pos = self.position(&id)?;
        let mut client = self.clients.remove(pos);
        client.drop_link();
        tracing::info!(broker = %id, "Removed broker");
        Some(id)
    }

    /// Close every connection.
    pub fn close(&mut self) {
        for client in &mut self.clients {
            client.drop_link();
            client.status = ConnectionStatus::Closed;
        }
        tracing::info!("[stop] Closed all broker connections");
    }

    /// Apply a prefetch limit to current and future connections.
    pub fn prefetch(&mut self, count: u16) {
        self.prefetch = Some(count);
        let mut errors = Vec::new();
        for client in &self.clients {
            if let (ConnectionStatus::Connected, Some(link)) = (client.status, &client.link) {
                if let Err(e) = link.prefetch(count) {
                    errors.push(e);
                }
            }
        }
        for e in errors {
            self.exceptions.track("prefetch", &e, None);
        }
    }

    pub fn connected(&self) -> Vec<BrokerId> {
        self.with_status(|s| s == ConnectionStatus::Connected)
    }

    /// Connections that are connected or on their way there.
    pub fn usable(&self) -> Vec<BrokerId> {
        self.with_status(|s| {
            matches!(
                s,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
        })
    }

    pub fn unusable(&self) -> Vec<BrokerId> {
        self.with_status(|s| s == ConnectionStatus::Unusable)
    }

    pub fn all(&self) -> Vec<BrokerId> {
        self.clients.iter().map(|c| c.id.clone()).collect()
    }

    fn with_status(&self, pred: impl Fn(ConnectionStatus) -> bool) -> Vec<BrokerId> {
        self.clients
            .iter()
            .filter(|c| pred(c.status))
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn is_connected(&self, id: &BrokerId) -> bool {
        self.status_of(id) == Some(ConnectionStatus::Connected)
    }

    pub fn status_of(&self, id: &BrokerId) -> Option<ConnectionStatus> {
        self.position(id).map(|pos| self.clients[pos].status)
    }

    /// Address details of a configured connection.
    pub fn identity_parts(&self, id: &BrokerId) -> Option<BrokerAddress> {
        self.position(id).map(|pos| self.clients[pos].address.clone())
    }

    /// Aliases (`b<index>`) of the given connections, in the same order.
    pub fn aliases(&self, ids: &[BrokerId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.identity_parts(id))
            .map(|address| address.alias())
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.address.host.clone()).collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.clients.iter().map(|c| c.address.port).collect()
    }

    pub fn status(&self) -> Vec<BrokerStatus> {
        self.clients.iter().map(BrokerClient::summary).collect()
    }

    pub fn stats(&mut self, reset: bool) -> BrokerPoolStats {
        let stats = BrokerPoolStats {
            brokers: self.status(),
            exceptions: self.exceptions.stats(),
        };
        if reset {
            for client in &mut self.clients {
                client.disconnects = 0;
                client.failures = 0;
            }
            self.exceptions.reset();
        }
        stats
    }
}
