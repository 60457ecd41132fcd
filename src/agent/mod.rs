//! The agent: composition root and lifecycle.
//!
//! An [`Agent`] owns its identity, configuration, broker pool, dispatcher and
//! mapper proxy, and runs them on one coordinating loop. Everything else
//! talks to it through an [`AgentHandle`].

mod agent_loop;
mod command;
mod state;

pub use agent_loop::Agent;
pub use command::AgentHandle;
pub use state::{AgentActivity, AgentState, AgentStats};
