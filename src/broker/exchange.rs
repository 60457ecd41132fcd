//! Exchange, queue and option descriptors used by the broker pool.

use serde::Serialize;

use crate::broker::BrokerId;
use crate::packet::PacketKind;

/// Fanout exchange carrying requests, pushes and results to coordinators.
pub const REQUEST_EXCHANGE: &str = "request";
/// Fanout exchange for service registration and withdrawal.
pub const REGISTRATION_EXCHANGE: &str = "registration";
/// Fanout exchange on which coordinators ask agents to re-advertise.
pub const ADVERTISE_EXCHANGE: &str = "advertise";
/// Topic exchange for periodic statistics.
pub const STATS_EXCHANGE: &str = "stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub kind: ExchangeKind,
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Whether to declare the exchange; disabled in secure mode where agents
    /// lack permission to declare.
    pub declare: bool,
}

impl ExchangeSpec {
    fn new(kind: ExchangeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            durable: false,
            auto_delete: false,
            declare: true,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(ExchangeKind::Direct, name)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(ExchangeKind::Fanout, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(ExchangeKind::Topic, name)
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn no_declare(mut self, no_declare: bool) -> Self {
        self.declare = !no_declare;
        self
    }

    /// The request exchange used for outbound requests and results.
    pub fn request(secure: bool) -> Self {
        Self::fanout(REQUEST_EXCHANGE).durable().no_declare(secure)
    }

    /// The registration exchange used for advertisements.
    pub fn registration(secure: bool) -> Self {
        Self::fanout(REGISTRATION_EXCHANGE).durable().no_declare(secure)
    }

    pub fn advertise() -> Self {
        Self::fanout(ADVERTISE_EXCHANGE).durable()
    }

    pub fn stats() -> Self {
        Self::topic(STATS_EXCHANGE).no_declare(true)
    }

    /// Routing key used when a publish does not supply one.
    pub fn default_routing_key(&self) -> &str {
        match self.kind {
            ExchangeKind::Direct => &self.name,
            ExchangeKind::Fanout | ExchangeKind::Topic => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub declare: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            declare: true,
        }
    }

    pub fn no_declare(mut self, no_declare: bool) -> Self {
        self.declare = !no_declare;
        self
    }
}

/// Options for [`crate::broker::BrokerPool::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Packet kinds delivered to the handler; empty accepts all.
    pub accept: Vec<PacketKind>,
    /// Restrict the subscription to these connections.
    pub brokers: Option<Vec<BrokerId>>,
    /// Additional exchange to bind the queue to.
    pub extra_exchange: Option<ExchangeSpec>,
}

/// Options for [`crate::broker::BrokerPool::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub persistent: bool,
    /// Overrides [`ExchangeSpec::default_routing_key`].
    pub routing_key: Option<String>,
    /// Candidate connections in preference order; defaults to all usable.
    pub brokers: Option<Vec<BrokerId>>,
    /// Publish on every candidate instead of the first that succeeds.
    pub fanout: bool,
}

impl PublishOptions {
    pub fn persistent(persistent: bool) -> Self {
        Self {
            persistent,
            ..Self::default()
        }
    }

    pub fn on_brokers(mut self, brokers: Option<Vec<BrokerId>>) -> Self {
        self.brokers = brokers;
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

/// Match an AMQP-style topic binding (`*` one word, `#` zero or more words).
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
