//! Agent identities and request tokens.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PacketError;

/// Agent type name used by leaf (instance) agents.
pub const INSTANCE_AGENT_TYPE: &str = "instance";

/// Unique token correlating a request with its results.
///
/// A new token is generated for every retry of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Parsed form of an agent identity such as `rs-instance-4c2f-1`.
///
/// The identity string itself is opaque to the rest of the system; this type
/// only exposes the fields derived from it. Older identities use `-` as the
/// separator, newer ones `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    prefix: String,
    agent_type: String,
    base_id: String,
    delimiter: char,
}

impl AgentIdentity {
    /// Create an identity from its parts using the `-` separator.
    pub fn new(
        prefix: impl Into<String>,
        agent_type: impl Into<String>,
        base_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            agent_type: agent_type.into(),
            base_id: base_id.into(),
            delimiter: '-',
        }
    }

    /// Generate a random identity token, as used for unnamed agents.
    pub fn generate() -> String {
        Token::generate().0
    }

    /// Parse a serialized identity.
    pub fn parse(serialized: &str) -> Result<Self, PacketError> {
        let delimiter = if serialized.contains('*') { '*' } else { '-' };
        let mut parts = serialized.splitn(3, delimiter);
        let (Some(prefix), Some(agent_type), Some(base_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(PacketError::InvalidIdentity(serialized.to_string()));
        };

        if prefix.is_empty() || agent_type.is_empty() || base_id.is_empty() {
            return Err(PacketError::InvalidIdentity(serialized.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            agent_type: agent_type.to_string(),
            base_id: base_id.to_string(),
            delimiter,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Agent type name, e.g. `instance` or `mapper`.
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// Whether this is a leaf agent running on a managed instance.
    pub fn is_instance_agent(&self) -> bool {
        self.agent_type == INSTANCE_AGENT_TYPE
    }

    /// Routing key for statistics published to the stats exchange.
    pub fn stats_routing_key(&self) -> String {
        format!("stats.{}.{}", self.agent_type, self.base_id)
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.delimiter;
        write!(f, "{}{d}{}{d}{}", self.prefix, self.agent_type, self.base_id)
    }
}
