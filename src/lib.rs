//! Courier: a messaging agent runtime.
//!
//! An agent exchanges asynchronous messages with remote peers over a pool of
//! interchangeable brokers. Inbound requests are dispatched to registered
//! actors; outbound requests are correlated with their results, retried
//! under new tokens, and timed out locally when no result arrives.

pub mod actors;
pub mod agent;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mapper_proxy;
pub mod packet;
pub mod stats;

/// Version of the packet protocol spoken by this agent.
pub const PROTOCOL_VERSION: u32 = 11;
