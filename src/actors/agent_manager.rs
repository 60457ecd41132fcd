//! Built-in actor for remote management of an agent.
//!
//! Exposed under `/agent_manager`:
//! - `ping`: liveness check, answers with the agent identity
//! - `stats`: statistics snapshot, optionally resetting counters
//! - `connect` / `disconnect`: add, replace or drop a broker connection
//! - `connect_failed`: a peer could not reach this agent on some brokers

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::actors::Actor;
use crate::agent::AgentHandle;
use crate::broker::BrokerId;
use crate::error::{ActorError, AgentError};
use crate::packet::Envelope;

const METHODS: &[&str] = &["ping", "stats", "connect", "disconnect", "connect_failed"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatsParams {
    reset: bool,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    host: String,
    port: u16,
    /// Alias index of the broker.
    id: usize,
    #[serde(default)]
    priority: Option<usize>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct DisconnectParams {
    host: String,
    port: u16,
    #[serde(default)]
    remove: bool,
}

#[derive(Debug, Deserialize)]
struct ConnectFailedParams {
    brokers: Vec<BrokerId>,
}

/// Answers management requests by forwarding them to the agent's loop.
pub struct AgentManager {
    agent: AgentHandle,
}

impl AgentManager {
    pub fn new(agent: AgentHandle) -> Self {
        Self { agent }
    }
}

fn params<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, ActorError> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    Ok(serde_json::from_value(payload)?)
}

/// Error results for management calls that could not be carried out.
fn outcome(error: Option<String>) -> Result<serde_json::Value, ActorError> {
    match error {
        Some(error) => Err(ActorError::failed(error)),
        None => Ok(serde_json::Value::Null),
    }
}

#[async_trait]
impl Actor for AgentManager {
    fn prefix(&self) -> &str {
        "agent_manager"
    }

    fn methods(&self) -> &[&'static str] {
        METHODS
    }

    async fn invoke(
        &self,
        method: &str,
        payload: serde_json::Value,
        _request: &Envelope,
    ) -> Result<serde_json::Value, ActorError> {
        let stopped = |e: AgentError| ActorError::failed(e.to_string());
        match method {
            "ping" => Ok(json!({ "identity": self.agent.identity() })),
            "stats" => {
                let StatsParams { reset } = params(payload)?;
                let stats = self.agent.stats(reset).await.map_err(stopped)?;
                Ok(serde_json::to_value(stats)?)
            }
            "connect" => {
                let p: ConnectParams = params(payload)?;
                let error = self
                    .agent
                    .connect(p.host, p.port, p.id, p.priority, p.force)
                    .await
                    .map_err(stopped)?;
                outcome(error)
            }
            "disconnect" => {
                let p: DisconnectParams = params(payload)?;
                let error = self
                    .agent
                    .disconnect(p.host, p.port, p.remove)
                    .await
                    .map_err(stopped)?;
                outcome(error)
            }
            "connect_failed" => {
                let p: ConnectFailedParams = params(payload)?;
                self.agent.connect_failed(p.brokers).map_err(stopped)?;
                Ok(serde_json::Value::Null)
            }
            other => Err(ActorError::failed(format!("Unknown method {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> AgentManager {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        AgentManager::new(AgentHandle::new("rs-core-1", tx))
    }

    #[test]
    fn test_params() {
        let StatsParams { reset } = params(serde_json::Value::Null).unwrap();
        assert!(!reset);

        let p: ConnectParams = params(json!({"host": "b1", "port": 5672, "id": 1})).unwrap();
        assert_eq!((p.host.as_str(), p.port, p.id, p.priority, p.force), ("b1", 5672, 1, None, false));

        let err = params::<ConnectParams>(json!({"port": 5672})).unwrap_err();
        assert!(matches!(err, ActorError::InvalidPayload(_)));

        let p: ConnectFailedParams =
            params(json!({"brokers": ["rs-broker-b1-5672"]})).unwrap();
        assert_eq!(p.brokers, vec![BrokerId::new("b1", 5672)]);
    }

    #[tokio::test]
    async fn test_ping_and_stopped_agent() {
        let manager = manager();
        let request = Envelope::new("/agent_manager/ping", serde_json::Value::Null);

        let pong = manager
            .invoke("ping", serde_json::Value::Null, &request)
            .await
            .unwrap();
        assert_eq!(pong, json!({"identity": "rs-core-1"}));

        let err = manager
            .invoke("stats", serde_json::Value::Null, &request)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Agent has stopped");
    }
}
