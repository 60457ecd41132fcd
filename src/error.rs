//! Error types for the agent runtime.

use std::path::PathBuf;

/// Errors raised while encoding, decoding or interpreting packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode packet: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Invalid agent identity '{0}'")]
    InvalidIdentity(String),
}

/// Errors from the broker pool and its transports.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No connection is currently usable. Callers treat the message as dropped.
    #[error("No connected brokers")]
    NoConnectedBrokers,

    #[error("Broker {id} is not configured for this agent")]
    NotConfigured { id: String },

    #[error("Failed to connect to broker {id}: {reason}")]
    ConnectFailed { id: String, reason: String },

    #[error("Timed out connecting to broker {id} after {seconds} seconds")]
    ConnectTimeout { id: String, seconds: u64 },

    #[error("Broker {id} I/O failure: {reason}")]
    Io { id: String, reason: String },

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Errors returned by actor methods.
///
/// These never escape the dispatcher; they are converted into an error result.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

impl ActorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for ActorError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid broker address '{0}'")]
    InvalidBroker(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Errors surfaced by the agent itself.
///
/// Only startup failures are returned from [`crate::agent::Agent::run`]; everything
/// after the agent is running is logged and counted instead.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Agent failed to connect to any brokers")]
    NoBrokers,

    #[error("Agent startup failed: {0}")]
    Startup(String),

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Agent has stopped")]
    Stopped,
}
