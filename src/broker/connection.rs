//! Broker connection identity, status and the transport seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::exchange::{ExchangeSpec, QueueSpec};
use crate::error::{BrokerError, ConfigError};

/// Port used when an address omits one.
pub const DEFAULT_BROKER_PORT: u16 = 5672;

/// Identity of a broker connection, derived from host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(String);

impl BrokerId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("rs-broker-{}-{}", host.replace('-', "~"), port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a broker lives and how this agent ranks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    /// Small unique number used to form the alias `b<index>`.
    pub index: usize,
    /// Position in the preference order; `None` appends.
    pub priority: Option<usize>,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16, index: usize) -> Self {
        Self {
            host: host.into(),
            port,
            index,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Option<usize>) -> Self {
        self.priority = priority;
        self
    }

    /// Parse `host[:port]`.
    pub fn parse(address: &str, index: usize) -> Result<Self, ConfigError> {
        let address = address.trim();
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidBroker(address.to_string()))?;
                (host, port)
            }
            None => (address, DEFAULT_BROKER_PORT),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidBroker(address.to_string()));
        }
        Ok(Self::new(host, port, index))
    }

    pub fn id(&self) -> BrokerId {
        BrokerId::new(&self.host, self.port)
    }

    pub fn alias(&self) -> String {
        format!("b{}", self.index)
    }
}

/// Lifecycle of one broker connection.
///
/// `disconnected → connecting → {connected | failed}`; `connected → failed` on
/// I/O error; `failed → connecting` on reconnect; `connected | failed →
/// unusable` administratively; `closed` on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Unusable,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Unusable => "unusable",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Receives raw message bodies delivered to a consumed queue.
pub type DeliverySink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked by a link when its underlying connection is lost.
pub type LossNotifier = Arc<dyn Fn(String) + Send + Sync>;

/// Opens links to brokers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a link. `on_loss` must be called if the link later fails.
    async fn connect(
        &self,
        address: &BrokerAddress,
        on_loss: LossNotifier,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError>;
}

/// An established connection to one broker.
///
/// Operations enqueue work on the connection and return without waiting for
/// the network, so they are safe to call from the coordinating loop.
pub trait BrokerLink: Send + Sync {
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Start delivering messages from `queue` to `sink`.
    fn consume(&self, queue: &str, sink: DeliverySink) -> Result<(), BrokerError>;

    /// Stop consuming from `queue`.
    fn cancel(&self, queue: &str) -> Result<(), BrokerError>;

    fn publish(
        &self,
        exchange: &ExchangeSpec,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries; 0 means unlimited.
    fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let address = BrokerAddress::parse("mq-1.example.com:5673", 2).unwrap();
        assert_eq!(address.host, "mq-1.example.com");
        assert_eq!(address.port, 5673);
        assert_eq!(address.alias(), "b2");
        assert_eq!(address.id().as_str(), "rs-broker-mq~1.example.com-5673");

        let address = BrokerAddress::parse("localhost", 0).unwrap();
        assert_eq!(address.port, DEFAULT_BROKER_PORT);

        assert!(BrokerAddress::parse(":5672", 0).is_err());
        assert!(BrokerAddress::parse("host:port", 0).is_err());
    }
}
