//! Commands submitted to a running agent, and the handle that submits them.
//!
//! Everything outside the coordinating loop talks to the agent through an
//! [`AgentHandle`]: actors, the binary's signal handling, and embedders.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::agent::{AgentState, AgentStats};
use crate::broker::BrokerId;
use crate::error::AgentError;
use crate::mapper_proxy::{RequestOptions, ResultHandler};
use crate::packet::{Reply, Token};

/// A command for the coordinating loop.
pub(crate) enum Command {
    /// Send a two-way request.
    Request {
        route: String,
        payload: serde_json::Value,
        options: RequestOptions,
        handler: ResultHandler,
    },

    /// Send a one-way push.
    Push {
        route: String,
        payload: serde_json::Value,
        options: RequestOptions,
    },

    /// Abandon a pending request.
    Cancel { token: Token },

    /// Begin graceful termination, or stop at once if already terminating.
    Terminate,

    Stats {
        reset: bool,
        reply: oneshot::Sender<AgentStats>,
    },

    /// Connect to a broker, possibly replacing an existing connection.
    Connect {
        host: String,
        port: u16,
        index: usize,
        priority: Option<usize>,
        force: bool,
        reply: oneshot::Sender<Option<String>>,
    },

    /// Close (and optionally forget) a broker connection.
    Disconnect {
        host: String,
        port: u16,
        remove: bool,
        reply: oneshot::Sender<Option<String>>,
    },

    /// Brokers that a peer failed to reach this agent through.
    ConnectFailed { ids: Vec<BrokerId> },

    UpdateTags {
        new_tags: Vec<String>,
        obsolete_tags: Vec<String>,
    },

    /// Publish a fresh service registration.
    Advertise,

    State { reply: oneshot::Sender<AgentState> },
}

/// Cloneable handle to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    identity: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl AgentHandle {
    pub(crate) fn new(identity: &str, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            identity: Arc::from(identity),
            commands,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn send(&self, command: Command) -> Result<(), AgentError> {
        self.commands.send(command).map_err(|_| AgentError::Stopped)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Send a request; `handler` receives its results. Returns the token.
    pub fn request(
        &self,
        route: impl Into<String>,
        payload: serde_json::Value,
        mut options: RequestOptions,
        handler: ResultHandler,
    ) -> Result<Token, AgentError> {
        let token = options.token.get_or_insert_with(Token::generate).clone();
        self.send(Command::Request {
            route: route.into(),
            payload,
            options,
            handler,
        })?;
        Ok(token)
    }

    /// Send a request and wait for its first result.
    pub async fn request_reply(
        &self,
        route: impl Into<String>,
        payload: serde_json::Value,
        options: RequestOptions,
    ) -> Result<Reply, AgentError> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handler: ResultHandler = Arc::new(move |reply| {
            if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(reply);
            }
            Ok(())
        });
        self.request(route, payload, options, handler)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    pub fn push(
        &self,
        route: impl Into<String>,
        payload: serde_json::Value,
        options: RequestOptions,
    ) -> Result<(), AgentError> {
        self.send(Command::Push {
            route: route.into(),
            payload,
            options,
        })
    }

    pub fn cancel(&self, token: Token) -> Result<(), AgentError> {
        self.send(Command::Cancel { token })
    }

    pub fn terminate(&self) -> Result<(), AgentError> {
        self.send(Command::Terminate)
    }

    pub async fn stats(&self, reset: bool) -> Result<AgentStats, AgentError> {
        self.ask(|reply| Command::Stats { reset, reply }).await
    }

    /// Returns an error description if the connection could not be started.
    pub async fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        index: usize,
        priority: Option<usize>,
        force: bool,
    ) -> Result<Option<String>, AgentError> {
        let host = host.into();
        self.ask(|reply| Command::Connect {
            host,
            port,
            index,
            priority,
            force,
            reply,
        })
        .await
    }

    /// Returns an error description if the broker was not disconnected.
    pub async fn disconnect(
        &self,
        host: impl Into<String>,
        port: u16,
        remove: bool,
    ) -> Result<Option<String>, AgentError> {
        let host = host.into();
        self.ask(|reply| Command::Disconnect {
            host,
            port,
            remove,
            reply,
        })
        .await
    }

    pub fn connect_failed(&self, ids: Vec<BrokerId>) -> Result<(), AgentError> {
        self.send(Command::ConnectFailed { ids })
    }

    pub fn update_tags(
        &self,
        new_tags: Vec<String>,
        obsolete_tags: Vec<String>,
    ) -> Result<(), AgentError> {
        self.send(Command::UpdateTags {
            new_tags,
            obsolete_tags,
        })
    }

    pub fn advertise_services(&self) -> Result<(), AgentError> {
        self.send(Command::Advertise)
    }

    pub async fn state(&self) -> Result<AgentState, AgentError> {
        self.ask(|reply| Command::State { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_token_is_known_before_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AgentHandle::new("rs-instance-1-1", tx);
        let token = handle
            .request(
                "/foo/bar",
                serde_json::Value::Null,
                RequestOptions::default(),
                Arc::new(|_| Ok(())),
            )
            .unwrap();

        let Some(Command::Request { options, route, .. }) = rx.recv().await else {
            panic!("expected a request command");
        };
        assert_eq!(route, "/foo/bar");
        assert_eq!(options.token, Some(token));
    }

    #[tokio::test]
    async fn test_stopped_agent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AgentHandle::new("rs-instance-1-1", tx);
        drop(rx);
        assert!(matches!(handle.terminate(), Err(AgentError::Stopped)));
        assert!(matches!(handle.stats(false).await, Err(AgentError::Stopped)));
    }
}
