//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use courier::actors::Actor;
use courier::agent::{Agent, AgentHandle};
use courier::broker::memory::{MemoryBroker, MemoryConnector};
use courier::broker::{ExchangeKind, REQUEST_EXCHANGE};
use courier::config::AgentConfig;
use courier::error::{ActorError, AgentError};
use courier::mapper_proxy::PING_ROUTE;
use courier::packet::{Envelope, OperationResult, Packet, Reply};

pub const ROUTER_QUEUE: &str = "mapper";

/// Stands in for the mapper: routes targeted requests and results between
/// agents on one broker, and optionally answers pings.
pub struct Router;

impl Router {
    pub fn attach(broker: &MemoryBroker, answer_pings: bool) {
        broker.declare_exchange(REQUEST_EXCHANGE, ExchangeKind::Fanout);
        broker.bind(ROUTER_QUEUE, REQUEST_EXCHANGE, "");
        let routed = broker.clone();
        broker.consume(
            ROUTER_QUEUE,
            Arc::new(move |body: Vec<u8>| {
                let Ok(packet) = Packet::decode(&body) else {
                    return;
                };
                match &packet {
                    Packet::Request(request) if request.route == PING_ROUTE => {
                        if answer_pings {
                            let reply = Reply::new(
                                request.token.clone(),
                                Some(request.from.clone()),
                                OperationResult::success(serde_json::Value::Null),
                                "rs-mapper-1",
                            );
                            if let Ok(body) = Packet::Result(reply).encode() {
                                forward(&routed, &request.from, &body);
                            }
                        }
                    }
                    Packet::Request(envelope) | Packet::Push(envelope) => {
                        if let Some(target) = &envelope.target {
                            forward(&routed, target, &body);
                        }
                    }
                    Packet::Result(reply) => {
                        if let Some(to) = &reply.to {
                            forward(&routed, to, &body);
                        }
                    }
                    _ => {}
                }
            }),
        );
    }
}

fn forward(broker: &MemoryBroker, identity: &str, body: &[u8]) {
    broker.publish(identity, ExchangeKind::Direct, identity, body);
}

/// Echoes payloads back; `slow` sleeps for `payload` seconds first.
pub struct Echo;

#[async_trait]
impl Actor for Echo {
    fn prefix(&self) -> &str {
        "echo"
    }

    fn methods(&self) -> &[&'static str] {
        &["say", "slow", "fail"]
    }

    async fn invoke(
        &self,
        method: &str,
        payload: serde_json::Value,
        _request: &Envelope,
    ) -> Result<serde_json::Value, ActorError> {
        match method {
            "say" => Ok(payload),
            "slow" => {
                let seconds = payload.as_u64().unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                Ok(payload)
            }
            _ => Err(ActorError::failed("echo failed on purpose")),
        }
    }
}

pub fn config(identity: &str, brokers: &[&str]) -> AgentConfig {
    AgentConfig {
        identity: Some(identity.to_string()),
        brokers: brokers.iter().map(|b| b.to_string()).collect(),
        ..AgentConfig::default()
    }
}

/// A broker at `localhost:port` with a router attached.
pub fn routed_broker(answer_pings: bool) -> MemoryBroker {
    let broker = MemoryBroker::new();
    Router::attach(&broker, answer_pings);
    broker
}

pub type AgentTask = JoinHandle<(Agent, Result<(), AgentError>)>;

/// Build an agent, let `setup` register actors, and run it on its own task.
pub fn spawn_agent(
    config: AgentConfig,
    connector: Arc<MemoryConnector>,
    setup: impl FnOnce(&mut Agent),
) -> (AgentHandle, AgentTask) {
    let mut agent = Agent::new(config, connector).expect("valid agent config");
    setup(&mut agent);
    let handle = agent.handle();
    let task = tokio::spawn(async move {
        let result = agent.run().await;
        (agent, result)
    });
    (handle, task)
}

/// Terminate an agent and wait for its loop to exit.
pub async fn stop(handle: &AgentHandle, task: AgentTask) -> Agent {
    handle.terminate().expect("agent is running");
    let (agent, result) = task.await.expect("agent task panicked");
    result.expect("agent ran");
    agent
}
