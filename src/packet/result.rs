//! Operation results carried by result packets.

use serde::{Deserialize, Serialize};

/// Reason attached to non-delivery results for requests that arrived stale.
pub const TTL_EXPIRATION: &str = "TTL expiration";

/// Outcome of a request as seen by the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "snake_case")]
pub enum OperationResult {
    /// The handler returned a value.
    Success(serde_json::Value),
    /// The handler failed.
    Error(String),
    /// No result arrived before the retry budget ran out.
    Timeout(String),
    /// The request could not be delivered, e.g. it expired in transit.
    NonDelivery(String),
    /// The request fanned out; one further result per listed target follows.
    Multicast(Vec<String>),
    /// The request path did not resolve to an actor method.
    NotFound(String),
    /// The receiver asked for the request to be retried.
    Retry(String),
    /// The request was cancelled by the receiver.
    Cancel(String),
}

impl OperationResult {
    pub fn success(value: impl Into<serde_json::Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn non_delivery(reason: impl Into<String>) -> Self {
        Self::NonDelivery(reason.into())
    }

    pub fn multicast(targets: Vec<String>) -> Self {
        Self::Multicast(targets)
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Targets of a multicast announcement, if this is one.
    pub fn multicast_targets(&self) -> Option<&[String]> {
        match self {
            Self::Multicast(targets) => Some(targets),
            _ => None,
        }
    }

    /// Short status name used in logs and statistics.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Error(_) => "error",
            Self::Timeout(_) => "timeout",
            Self::NonDelivery(_) => "non_delivery",
            Self::Multicast(_) => "multicast",
            Self::NotFound(_) => "not_found",
            Self::Retry(_) => "retry",
            Self::Cancel(_) => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(OperationResult::success(vec!["hello", "you"])).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status": "success", "content": ["hello", "you"]})
        );

        let value = serde_json::to_value(OperationResult::non_delivery(TTL_EXPIRATION)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status": "non_delivery", "content": "TTL expiration"})
        );
    }

    #[test]
    fn test_multicast_targets() {
        let result = OperationResult::multicast(vec!["a".into(), "b".into()]);
        assert_eq!(result.multicast_targets().map(<[String]>::len), Some(2));
        assert!(OperationResult::error("x").multicast_targets().is_none());
    }
}
