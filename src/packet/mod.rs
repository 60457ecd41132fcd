//! Packet model exchanged with remote agents through the brokers.
//!
//! Every packet serializes to a JSON object tagged by a `packet` field. Requests
//! and pushes share the [`Envelope`] shape; results use [`Reply`].

mod identity;
mod result;

pub use identity::{AgentIdentity, INSTANCE_AGENT_TYPE, Token};
pub use result::{OperationResult, TTL_EXPIRATION};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

/// Current wall-clock time in fractional seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Envelope for two-way requests and one-way pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dispatch route, e.g. `/foo/bar`.
    #[serde(rename = "type")]
    pub route: String,
    /// Current token; replaced on every retry.
    pub token: Token,
    /// Identity of the sender.
    pub from: String,
    /// Specific agent this request is aimed at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Tags used to select target agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Creation time in seconds since the epoch; 0 when unknown.
    #[serde(default)]
    pub created_at: f64,
    /// Tokens this request was previously sent under, oldest first.
    #[serde(default)]
    pub tries: Vec<Token>,
    /// Whether the broker should persist the message.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Identity the result should be routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh token stamped with the current time.
    pub fn new(route: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            route: route.into(),
            token: Token::generate(),
            from: String::new(),
            target: None,
            tags: Vec::new(),
            created_at: now_secs(),
            tries: Vec::new(),
            persistent: false,
            payload,
            reply_to: None,
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn from_agent(mut self, identity: impl Into<String>) -> Self {
        self.from = identity.into();
        self
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn created_at(mut self, created_at: f64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn reply_to(mut self, identity: impl Into<String>) -> Self {
        self.reply_to = Some(identity.into());
        self
    }

    /// Last path segment of the route, used to categorize statistics.
    pub fn method(&self) -> &str {
        self.route.rsplit('/').next().unwrap_or_default()
    }
}

/// Result of a request, routed back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Token of the request (or retry) being answered.
    pub token: Token,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub results: OperationResult,
    pub from: String,
}

impl Reply {
    pub fn new(
        token: Token,
        to: Option<String>,
        results: OperationResult,
        from: impl Into<String>,
    ) -> Self {
        Self {
            token,
            to,
            results,
            from: from.into(),
        }
    }
}

/// Announcement of the services an agent provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub identity: String,
    pub services: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_queue: Option<String>,
}

/// Withdrawal of a previous registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnRegister {
    pub identity: String,
}

/// Request from a coordinator for agents to re-advertise their services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advertise {}

/// Periodic statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub data: serde_json::Value,
    pub from: String,
}

/// Any packet that travels through the brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "packet", rename_all = "snake_case")]
pub enum Packet {
    Request(Envelope),
    Push(Envelope),
    Result(Reply),
    Advertise(Advertise),
    Register(Register),
    UnRegister(UnRegister),
    Stats(Stats),
}

/// Discriminant of a [`Packet`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Request,
    Push,
    Result,
    Advertise,
    Register,
    UnRegister,
    Stats,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Push => "push",
            Self::Result => "result",
            Self::Advertise => "advertise",
            Self::Register => "register",
            Self::UnRegister => "unregister",
            Self::Stats => "stats",
        };
        f.write_str(name)
    }
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Request(_) => PacketKind::Request,
            Self::Push(_) => PacketKind::Push,
            Self::Result(_) => PacketKind::Result,
            Self::Advertise(_) => PacketKind::Advertise,
            Self::Register(_) => PacketKind::Register,
            Self::UnRegister(_) => PacketKind::UnRegister,
            Self::Stats(_) => PacketKind::Stats,
        }
    }

    /// Token carried by requests, pushes and results.
    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Request(e) | Self::Push(e) => Some(&e.token),
            Self::Result(r) => Some(&r.token),
            _ => None,
        }
    }

    /// Envelope of a request or push.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Request(e) | Self::Push(e) => Some(e),
            _ => None,
        }
    }

    pub fn persistent(&self) -> bool {
        match self {
            Self::Request(e) | Self::Push(e) => e.persistent,
            _ => false,
        }
    }

    /// Compact description for log lines: kind, token and route.
    pub fn trace(&self) -> String {
        match self {
            Self::Request(e) | Self::Push(e) => {
                format!("{} <{}> {}", self.kind(), e.token, e.route)
            }
            Self::Result(r) => format!("result <{}> {}", r.token, r.results.status()),
            other => other.kind().to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(PacketError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        serde_json::from_slice(bytes).map_err(PacketError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_fields() {
        let request = Envelope::new("/foo/bar", serde_json::json!("you"))
            .with_token(Token::from("t1"))
            .from_agent("rs-instance-1-1")
            .created_at(12.5)
            .reply_to("rs-instance-1-1");
        let value = serde_json::to_value(Packet::Request(request)).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "packet": "request",
                "type": "/foo/bar",
                "token": "t1",
                "from": "rs-instance-1-1",
                "created_at": 12.5,
                "tries": [],
                "persistent": false,
                "payload": "you",
                "reply_to": "rs-instance-1-1"
            })
        );
    }

    #[test]
    fn test_result_wire_fields() {
        let reply = Reply::new(
            Token::from("t1"),
            Some("rs-a-b".into()),
            OperationResult::error("boom"),
            "rs-c-d",
        );
        let decoded = Packet::decode(&Packet::Result(reply.clone()).encode().unwrap()).unwrap();
        assert_eq!(decoded, Packet::Result(reply));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let packet = Packet::decode(br#"{"packet":"push","type":"/a/b","token":"x","from":"y"}"#)
            .unwrap();
        let envelope = packet.envelope().unwrap();
        assert_eq!(envelope.created_at, 0.0);
        assert!(envelope.tries.is_empty());
        assert_eq!(envelope.method(), "b");
        assert_eq!(packet.kind(), PacketKind::Push);
    }

    #[test]
    fn test_trace() {
        let packet = Packet::Push(Envelope::new("/a/b", serde_json::Value::Null).with_token("k".into()));
        assert_eq!(packet.trace(), "push <k> /a/b");
    }
}
