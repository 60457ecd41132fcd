//! Rolling activity and exception counters.
//!
//! Every component keeps its own counters and resets them independently when a
//! statistics snapshot is taken with `reset = true`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use crate::packet::Packet;

/// Weight given to history when smoothing intervals and durations.
const RECENT_SIZE: f64 = 10.0;

/// Number of distinct recent exceptions kept per category.
const MAX_RECENT_EXCEPTIONS: usize = 10;

/// Callback notified of every tracked exception: category, message, packet.
pub type ExceptionCallback = Arc<dyn Fn(&str, &str, Option<&Packet>) + Send + Sync>;

/// Summary of the most recent activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastActivity {
    #[serde(rename = "type")]
    pub kind: String,
    pub elapsed: u64,
}

/// Snapshot of an [`ActivityStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub total: u64,
    /// Percentage of the total per activity type.
    pub percent: BTreeMap<String, f64>,
    pub last: LastActivity,
    /// Recent rate in activities per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

/// Counts activities by type and tracks rate and duration.
#[derive(Debug, Clone)]
pub struct ActivityStats {
    measure_rate: bool,
    total: u64,
    counts: HashMap<String, u64>,
    last: Option<(String, Instant)>,
    interval: f64,
    started: Instant,
    avg_duration: Option<f64>,
}

impl ActivityStats {
    pub fn new(measure_rate: bool) -> Self {
        Self {
            measure_rate,
            total: 0,
            counts: HashMap::new(),
            last: None,
            interval: 0.0,
            started: Instant::now(),
            avg_duration: None,
        }
    }

    /// Record an activity of the given type; returns its start time.
    pub fn update(&mut self, kind: &str) -> Instant {
        let now = Instant::now();
        if self.measure_rate {
            let since = self.last.as_ref().map_or(self.started, |(_, at)| *at);
            let elapsed = now.duration_since(since).as_secs_f64();
            self.interval = ((self.interval * (RECENT_SIZE - 1.0)) + elapsed) / RECENT_SIZE;
        }
        self.total += 1;
        *self.counts.entry(kind.to_string()).or_default() += 1;
        self.last = Some((kind.to_string(), now));
        now
    }

    /// Record completion of an activity started at `start`.
    pub fn finish(&mut self, start: Instant) {
        let duration = Instant::now().duration_since(start).as_secs_f64();
        self.avg_duration = Some(match self.avg_duration {
            Some(avg) => ((avg * (RECENT_SIZE - 1.0)) + duration) / RECENT_SIZE,
            None => duration,
        });
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Count recorded for one activity type.
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    /// Smoothed average duration in seconds of finished activities.
    pub fn avg_duration(&self) -> Option<f64> {
        self.avg_duration
    }

    /// Snapshot of all counters, or `None` if nothing was recorded.
    pub fn all(&self) -> Option<ActivitySummary> {
        let (kind, at) = self.last.as_ref()?;
        let percent = self
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), (*v as f64 / self.total as f64) * 100.0))
            .collect();
        let rate = if self.measure_rate && self.interval > 0.0 {
            Some(1.0 / self.interval)
        } else {
            None
        };

        Some(ActivitySummary {
            total: self.total,
            percent,
            last: LastActivity {
                kind: kind.clone(),
                elapsed: at.elapsed().as_secs(),
            },
            rate,
        })
    }
}

impl Default for ActivityStats {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One distinct recent exception.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionRecord {
    pub count: u64,
    pub message: String,
    /// Unix time of the latest occurrence.
    pub when: i64,
    /// Packet being processed, if any.
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Exceptions tracked for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExceptionSummary {
    pub total: u64,
    pub recent: VecDeque<ExceptionRecord>,
}

/// Exceptions grouped by category, e.g. `publish` or `dispatch`.
#[derive(Clone, Default)]
pub struct ExceptionStats {
    categories: BTreeMap<String, ExceptionSummary>,
    callback: Option<ExceptionCallback>,
}

impl ExceptionStats {
    pub fn new(callback: Option<ExceptionCallback>) -> Self {
        Self {
            categories: BTreeMap::new(),
            callback,
        }
    }

    pub fn set_callback(&mut self, callback: Option<ExceptionCallback>) {
        self.callback = callback;
    }

    pub fn callback(&self) -> Option<ExceptionCallback> {
        self.callback.clone()
    }

    /// Record an exception and notify the callback.
    pub fn track(&mut self, category: &str, error: &dyn fmt::Display, packet: Option<&Packet>) {
        let message = error.to_string();
        if let Some(callback) = &self.callback {
            callback(category, &message, packet);
        }

        let summary = self.categories.entry(category.to_string()).or_default();
        summary.total += 1;
        let when = chrono::Utc::now().timestamp();
        let location = packet.map(Packet::trace);

        if let Some(record) = summary.recent.iter_mut().find(|r| r.message == message) {
            record.count += 1;
            record.when = when;
            record.location = location;
            return;
        }

        if summary.recent.len() >= MAX_RECENT_EXCEPTIONS {
            summary.recent.pop_front();
        }
        summary.recent.push_back(ExceptionRecord {
            count: 1,
            message,
            when,
            location,
        });
    }

    /// Total exceptions recorded in a category.
    pub fn total(&self, category: &str) -> u64 {
        self.categories.get(category).map_or(0, |s| s.total)
    }

    /// Snapshot of all categories, or `None` if there were no exceptions.
    pub fn stats(&self) -> Option<BTreeMap<String, ExceptionSummary>> {
        if self.categories.is_empty() {
            None
        } else {
            Some(self.categories.clone())
        }
    }

    /// Clear recorded exceptions, keeping the callback.
    pub fn reset(&mut self) {
        self.categories.clear();
    }
}

impl fmt::Debug for ExceptionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionStats")
            .field("categories", &self.categories)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Convert zero to `None`, for counters reported only when non-zero.
pub fn nil_if_zero<T: Default + PartialEq>(value: T) -> Option<T> {
    if value == T::default() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_activity_percent_and_last() {
        let mut stats = ActivityStats::new(true);
        assert!(stats.all().is_none());

        stats.update("ping");
        stats.update("ping");
        stats.update("request");
        tokio::time::advance(Duration::from_secs(5)).await;

        let summary = stats.all().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.last.kind, "request");
        assert_eq!(summary.last.elapsed, 5);
        let ping = summary.percent["ping"];
        assert!((ping - 66.666).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_duration() {
        let mut stats = ActivityStats::new(false);
        let start = stats.update("bar");
        tokio::time::advance(Duration::from_secs(2)).await;
        stats.finish(start);
        assert_eq!(stats.avg_duration(), Some(2.0));
        assert!(stats.all().unwrap().rate.is_none());
    }

    #[test]
    fn test_exceptions_grouped_by_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ExceptionCallback = Arc::new(move |category, message, _| {
            sink.lock().unwrap().push(format!("{category}: {message}"));
        });
        let mut stats = ExceptionStats::new(Some(callback));

        stats.track("publish", &"broker down", None);
        stats.track("publish", &"broker down", None);
        stats.track("dispatch", &"boom", None);

        let all = stats.stats().unwrap();
        assert_eq!(all["publish"].total, 2);
        assert_eq!(all["publish"].recent.len(), 1);
        assert_eq!(all["publish"].recent[0].count, 2);
        assert_eq!(stats.total("dispatch"), 1);
        assert_eq!(seen.lock().unwrap().len(), 3);

        stats.reset();
        assert!(stats.stats().is_none());
    }

    #[test]
    fn test_nil_if_zero() {
        assert_eq!(nil_if_zero(0u64), None);
        assert_eq!(nil_if_zero(3usize), Some(3));
    }
}
