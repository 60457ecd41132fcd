//! Agent configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! `COURIER_*` environment variables (a `.env` file is honored). Timeouts are
//! whole seconds; zero means unset.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerAddress;
use crate::broker::amqp::AmqpSettings;
use crate::error::ConfigError;
use crate::packet::AgentIdentity;

const ENV_PREFIX: &str = "COURIER_";

/// Which outbound packets the broker is asked to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    #[default]
    None,
    All,
    Push,
    Request,
}

impl PersistMode {
    pub fn requests(self) -> bool {
        matches!(self, Self::All | Self::Request)
    }

    pub fn pushes(self) -> bool {
        matches!(self, Self::All | Self::Push)
    }
}

impl FromStr for PersistMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "push" => Ok(Self::Push),
            "request" => Ok(Self::Request),
            other => Err(ConfigError::InvalidValue {
                key: "persist".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// How the binary reaches its brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Amqp,
    /// In-process brokers, one per configured address.
    Memory,
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "amqp" => Ok(Self::Amqp),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "transport".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Serialized agent identity; generated when absent.
    pub identity: Option<String>,
    /// Broker addresses as `host[:port]`, in preference order.
    pub brokers: Vec<String>,
    /// Queue shared with other agents of the same kind.
    pub shared_queue: Option<String>,
    /// Reject inbound requests older than this many seconds.
    pub fresh_timeout: Option<u64>,
    /// Reject requests that already completed.
    pub dup_check: bool,
    pub retry_interval: Option<u64>,
    pub retry_timeout: Option<u64>,
    pub connect_timeout: u64,
    /// Inbound silence that triggers a connectivity probe.
    pub ping_interval: u64,
    /// Interval of broker health checks and statistics publication.
    pub check_interval: u64,
    /// Longest wait for outstanding work on shutdown.
    pub grace_timeout: u64,
    /// Unacknowledged deliveries allowed per connection.
    pub prefetch: Option<u16>,
    pub persist: PersistMode,
    /// Skip declaring shared exchanges (agent lacks permission).
    pub secure: bool,
    /// Interval of completed-request cache purges.
    pub completed_interval: u64,
    pub tags: Vec<String>,
    /// Service paths advertised in addition to the registered actors.
    pub services: Vec<String>,
    pub transport: Transport,
    /// AMQP account and virtual host.
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// AMQP heartbeat in seconds; zero accepts the broker's.
    pub heartbeat: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: None,
            brokers: vec!["localhost:5672".to_string()],
            shared_queue: None,
            fresh_timeout: None,
            dup_check: false,
            retry_interval: None,
            retry_timeout: None,
            connect_timeout: 60,
            ping_interval: 0,
            check_interval: 300,
            grace_timeout: 30,
            prefetch: Some(1),
            persist: PersistMode::None,
            secure: false,
            completed_interval: 60,
            tags: Vec::new(),
            services: Vec::new(),
            transport: Transport::Amqp,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: 0,
        }
    }
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.filter(|&s| s > 0).map(Duration::from_secs)
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AgentConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from `COURIER_<FIELD>` variables supplied by `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |field: &str| {
            let key = format!("{ENV_PREFIX}{field}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("IDENTITY") {
            self.identity = Some(v).filter(|v| !v.is_empty());
        }
        if let Some((_, v)) = get("BROKERS") {
            self.brokers = parse_list(&v);
        }
        if let Some((_, v)) = get("SHARED_QUEUE") {
            self.shared_queue = Some(v).filter(|v| !v.is_empty());
        }
        if let Some((k, v)) = get("FRESH_TIMEOUT") {
            self.fresh_timeout = Some(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("DUP_CHECK") {
            self.dup_check = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_INTERVAL") {
            self.retry_interval = Some(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("RETRY_TIMEOUT") {
            self.retry_timeout = Some(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("CONNECT_TIMEOUT") {
            self.connect_timeout = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("PING_INTERVAL") {
            self.ping_interval = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("CHECK_INTERVAL") {
            self.check_interval = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("GRACE_TIMEOUT") {
            self.grace_timeout = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("PREFETCH") {
            let count: u16 = parse(&k, &v)?;
            self.prefetch = (count > 0).then_some(count);
        }
        if let Some((_, v)) = get("PERSIST") {
            self.persist = v.parse()?;
        }
        if let Some((k, v)) = get("SECURE") {
            self.secure = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = get("COMPLETED_INTERVAL") {
            self.completed_interval = parse(&k, &v)?;
        }
        if let Some((_, v)) = get("TAGS") {
            self.tags = parse_list(&v);
        }
        if let Some((_, v)) = get("SERVICES") {
            self.services = parse_list(&v);
        }
        if let Some((_, v)) = get("TRANSPORT") {
            self.transport = v.parse()?;
        }
        if let Some((_, v)) = get("USER") {
            self.user = v;
        }
        if let Some((_, v)) = get("PASSWORD") {
            self.password = v;
        }
        if let Some((_, v)) = get("VHOST") {
            self.vhost = v;
        }
        if let Some((k, v)) = get("HEARTBEAT") {
            self.heartbeat = parse(&k, &v)?;
        }
        Ok(())
    }

    /// Check settings that can only be judged together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_addresses()?;
        if let Some(identity) = &self.identity {
            let parsed = AgentIdentity::parse(identity).map_err(|_| ConfigError::InvalidValue {
                key: "identity".to_string(),
                value: identity.clone(),
            })?;
            if parsed.is_instance_agent() && self.shared_queue.is_some() {
                return Err(ConfigError::InvalidValue {
                    key: "shared_queue".to_string(),
                    value: "instance agents cannot use a shared queue".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The configured identity, or a generated one.
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| AgentIdentity::new("rs", "agent", AgentIdentity::generate()).to_string())
    }

    /// Parsed broker addresses; the position in the list is the priority.
    pub fn broker_addresses(&self) -> Result<Vec<BrokerAddress>, ConfigError> {
        self.brokers
            .iter()
            .enumerate()
            .map(|(index, address)| {
                BrokerAddress::parse(address, index).map(|a| a.with_priority(Some(index)))
            })
            .collect()
    }

    pub fn fresh_timeout(&self) -> Option<Duration> {
        seconds(self.fresh_timeout)
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        seconds(self.retry_interval)
    }

    pub fn retry_timeout(&self) -> Option<Duration> {
        seconds(self.retry_timeout)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        seconds(Some(self.ping_interval))
    }

    pub fn check_interval(&self) -> Option<Duration> {
        seconds(Some(self.check_interval))
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(Some(self.connect_timeout)).unwrap_or(Duration::from_secs(60))
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout)
    }

    pub fn amqp_settings(&self) -> AmqpSettings {
        AmqpSettings {
            user: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            heartbeat: (self.heartbeat > 0).then_some(self.heartbeat),
        }
    }

    pub fn completed_interval(&self) -> Duration {
        seconds(Some(self.completed_interval)).unwrap_or(Duration::from_secs(60))
    }
}
