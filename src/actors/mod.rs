//! Actors: named groups of methods that inbound requests are dispatched to.
//!
//! An actor is registered under a path prefix; a request for
//! `/<prefix>/<method>` reaches [`Actor::invoke`] with `method` set. Actors
//! are shared with worker tasks, so they must be `Send + Sync` and keep any
//! mutable state behind their own synchronization.

pub mod agent_manager;
mod registry;

pub use agent_manager::AgentManager;
pub use registry::{ActorRegistry, ResolveError, Route};

use async_trait::async_trait;

use crate::error::ActorError;
use crate::packet::Envelope;

#[async_trait]
pub trait Actor: Send + Sync {
    /// Default path prefix, used when registering without an explicit one.
    fn prefix(&self) -> &str;

    /// Names of the methods this actor exposes.
    fn methods(&self) -> &[&'static str];

    /// Method used when a request path omits one.
    fn default_method(&self) -> Option<&str> {
        None
    }

    /// Run a method. `request` is the full inbound envelope.
    async fn invoke(
        &self,
        method: &str,
        payload: serde_json::Value,
        request: &Envelope,
    ) -> Result<serde_json::Value, ActorError>;

    /// Called after [`Actor::invoke`] fails, before the error is returned to
    /// the requester.
    fn on_exception(&self, method: &str, request: &Envelope, error: &ActorError) {
        let _ = (method, request, error);
    }
}
