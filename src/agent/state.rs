//! Lifecycle states and the statistics snapshot of an agent.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::broker::BrokerStatus;
use crate::dispatcher::DispatcherStats;
use crate::mapper_proxy::ProxyStats;
use crate::stats::{ActivitySummary, ExceptionSummary};

/// Where an agent is in its lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    ConnectingBrokers,
    Running,
    Terminating,
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::ConnectingBrokers => "connecting_brokers",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Agent-level counters that belong to no single component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentActivity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_requests: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<BTreeMap<String, ExceptionSummary>>,
}

/// Snapshot published on the stats exchange and returned by the
/// `agent_manager` stats method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub identity: String,
    pub hostname: String,
    pub version: u32,
    pub state: AgentState,
    pub brokers: Vec<BrokerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_exceptions: Option<BTreeMap<String, ExceptionSummary>>,
    pub agent_stats: AgentActivity,
    pub receive_stats: DispatcherStats,
    pub send_stats: ProxyStats,
    /// Seconds since the epoch of the last reset.
    pub last_reset_time: i64,
    pub stat_time: i64,
    /// Seconds since the agent started.
    pub service_uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_uptime: Option<u64>,
}

/// Name of this host, or `unknown`.
pub(crate) fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Host uptime in whole seconds, where the OS exposes it.
pub(crate) fn machine_uptime() -> Option<u64> {
    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    parse_uptime(&uptime)
}

fn parse_uptime(contents: &str) -> Option<u64> {
    let seconds: f64 = contents.split_whitespace().next()?.parse().ok()?;
    Some(seconds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_only_move_forward() {
        assert!(AgentState::Starting < AgentState::ConnectingBrokers);
        assert!(AgentState::Running < AgentState::Terminating);
        assert!(AgentState::Terminating < AgentState::Stopped);
        assert_eq!(AgentState::ConnectingBrokers.to_string(), "connecting_brokers");
        assert_eq!(
            serde_json::to_value(AgentState::Terminating).unwrap(),
            serde_json::json!("terminating")
        );
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_uptime("garbage"), None);
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }
}
