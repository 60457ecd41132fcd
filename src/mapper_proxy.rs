//! Outbound request/response correlation.
//!
//! The proxy publishes requests and pushes through the broker pool, keeps the
//! table of requests awaiting results, retries unanswered requests under new
//! tokens until a timeout budget runs out, and probes connectivity with pings
//! when traffic goes quiet. Timers run as spawned sleeps that post a
//! [`ProxyEvent`] back to the owner's loop; every table mutation happens in
//! [`MapperProxy::handle_event`] and the other `&mut self` methods.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::broker::{BrokerId, BrokerPool, ExchangeSpec, PublishOptions};
use crate::config::PersistMode;
use crate::error::BrokerError;
use crate::packet::{Envelope, OperationResult, Packet, Reply, Token};
use crate::stats::{
    ActivityStats, ActivitySummary, ExceptionCallback, ExceptionStats, ExceptionSummary,
};

/// Minimum time between restarts of the inactivity timer.
pub const MIN_RESTART_INACTIVITY_TIMER_INTERVAL: Duration = Duration::from_secs(60);

/// How long a connectivity probe waits for its reply.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);

pub const PING_ROUTE: &str = "/mapper/ping";

/// Entries listed by [`MapperProxy::dump_requests`].
pub const MAX_DUMPED_REQUESTS: usize = 50;

/// Receives the results of a request.
pub type ResultHandler = Arc<dyn Fn(Reply) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub identity: String,
    pub retry_interval: Option<Duration>,
    pub retry_timeout: Option<Duration>,
    /// Probe connectivity after this much inbound silence.
    pub ping_interval: Option<Duration>,
    pub persist: PersistMode,
    pub secure: bool,
}

impl ProxyConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            retry_interval: None,
            retry_timeout: None,
            ping_interval: None,
            persist: PersistMode::None,
            secure: false,
        }
    }
}

/// Per-call overrides for [`MapperProxy::request`] and [`MapperProxy::push`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the configured persistence mode.
    pub persistent: Option<bool>,
    pub target: Option<String>,
    pub tags: Vec<String>,
    /// Use this token instead of generating one.
    pub token: Option<Token>,
}

/// A scheduled re-send of an unanswered request.
#[derive(Debug)]
pub struct RetryAttempt {
    request: Envelope,
    /// Token of the original request heading the retry chain.
    parent: Token,
    count: u32,
    multiplier: u32,
    elapsed: Duration,
    delay: Duration,
    broker: BrokerId,
}

/// Timer expirations posted back to the owning loop.
#[derive(Debug)]
pub enum ProxyEvent {
    RetryDue(Box<RetryAttempt>),
    PingTimeout { probe: Token },
    InactivityElapsed,
}

#[derive(Clone)]
enum Responder {
    Handler(ResultHandler),
    Ping,
}

/// One logical request, shared by every token of its retry chain.
struct PendingRequest {
    responder: Responder,
    receive_time: Instant,
    received_wall: DateTime<Utc>,
    /// Replies still expected after a multicast announcement.
    multicast: Option<usize>,
}

impl PendingRequest {
    fn is_ping(&self) -> bool {
        matches!(self.responder, Responder::Ping)
    }
}

struct Probe {
    token: Token,
    broker: BrokerId,
    timer: AbortHandle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingStats {
    pub count: usize,
    /// Age in seconds of the oldest pending request.
    pub oldest_age: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pings: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushes: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_timeouts: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<BTreeMap<String, ExceptionSummary>>,
}

pub struct MapperProxy {
    config: ProxyConfig,
    events: mpsc::UnboundedSender<ProxyEvent>,
    pending: HashMap<Token, PendingRequest>,
    /// Retry tokens mapped to the original token heading their chain.
    chained: HashMap<Token, Token>,
    probe: Option<Probe>,
    inactivity: Option<AbortHandle>,
    inactivity_restarted: Option<Instant>,
    pings: ActivityStats,
    requests: ActivityStats,
    pushes: ActivityStats,
    retries: ActivityStats,
    retry_timeouts: ActivityStats,
    exceptions: ExceptionStats,
}

impl MapperProxy {
    pub fn new(config: ProxyConfig, events: mpsc::UnboundedSender<ProxyEvent>) -> Self {
        Self {
            config,
            events,
            pending: HashMap::new(),
            chained: HashMap::new(),
            probe: None,
            inactivity: None,
            inactivity_restarted: None,
            pings: ActivityStats::new(false),
            requests: ActivityStats::new(true),
            pushes: ActivityStats::new(true),
            retries: ActivityStats::new(false),
            retry_timeouts: ActivityStats::new(false),
            exceptions: ExceptionStats::default(),
        }
    }

    pub fn set_exception_callback(&mut self, callback: Option<ExceptionCallback>) {
        self.exceptions.set_callback(callback);
    }

    /// Start the inactivity timer, if pinging is enabled.
    pub fn start(&mut self) {
        self.restart_inactivity_timer();
    }

    fn schedule(&self, delay: Duration, event: ProxyEvent) -> AbortHandle {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
        .abort_handle()
    }

    fn outbound(
        &self,
        route: &str,
        payload: serde_json::Value,
        options: RequestOptions,
    ) -> Envelope {
        let token = options.token.unwrap_or_else(Token::generate);
        Envelope::new(route, payload)
            .with_token(token)
            .from_agent(self.config.identity.clone())
            .with_target(options.target)
            .with_tags(options.tags)
    }

    fn publish(
        &mut self,
        pool: &mut BrokerPool,
        packet: &Packet,
        brokers: Option<Vec<BrokerId>>,
    ) -> Result<Vec<BrokerId>, BrokerError> {
        let options = PublishOptions::persistent(packet.persistent()).on_brokers(brokers);
        pool.publish(&ExchangeSpec::request(self.config.secure), packet, &options)
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Failed to send {}", packet.trace());
                self.exceptions.track("send", e, Some(packet));
            })
    }

    /// Send a one-way push.
    pub fn push(
        &mut self,
        pool: &mut BrokerPool,
        route: &str,
        payload: serde_json::Value,
        options: RequestOptions,
    ) -> Result<Token, BrokerError> {
        let persistent = options.persistent.unwrap_or(self.config.persist.pushes());
        let push = self.outbound(route, payload, options).persistent(persistent);
        let token = push.token.clone();
        self.pushes.update(push.method());
        self.publish(pool, &Packet::Push(push), None)?;
        Ok(token)
    }

    /// Send a two-way request; `handler` receives every result for it.
    pub fn request(
        &mut self,
        pool: &mut BrokerPool,
        route: &str,
        payload: serde_json::Value,
        options: RequestOptions,
        handler: ResultHandler,
    ) -> Token {
        let persistent = options.persistent.unwrap_or(self.config.persist.requests());
        let request = self
            .outbound(route, payload, options)
            .persistent(persistent)
            .reply_to(self.config.identity.clone());
        let token = request.token.clone();

        self.requests.update(request.method());
        self.pending.insert(
            token.clone(),
            PendingRequest {
                responder: Responder::Handler(handler),
                receive_time: Instant::now(),
                received_wall: Utc::now(),
                multicast: None,
            },
        );
        self.request_with_retry(pool, request, token.clone(), 0, 1, Duration::ZERO);
        token
    }

    /// Publish and, if retry is configured and the publish went out, schedule
    /// the next attempt `retry_interval * multiplier` from now.
    fn request_with_retry(
        &mut self,
        pool: &mut BrokerPool,
        request: Envelope,
        parent: Token,
        count: u32,
        multiplier: u32,
        elapsed: Duration,
    ) {
        let ids = self
            .publish(pool, &Packet::Request(request.clone()), None)
            .unwrap_or_default();

        let (Some(interval), Some(_)) = (self.config.retry_interval, self.config.retry_timeout)
        else {
            return;
        };
        let Some(broker) = ids.into_iter().next() else {
            return;
        };

        let delay = interval * multiplier;
        let attempt = RetryAttempt {
            request,
            parent,
            count,
            multiplier,
            elapsed,
            delay,
            broker,
        };
        self.schedule(delay, ProxyEvent::RetryDue(Box::new(attempt)));
    }

    fn retry_due(&mut self, pool: &mut BrokerPool, attempt: RetryAttempt) {
        let RetryAttempt {
            mut request,
            parent,
            count,
            multiplier,
            elapsed,
            delay,
            broker,
        } = attempt;

        let Some(entry) = self.pending.get(&parent) else {
            return;
        };
        if entry.multicast.is_some() {
            return;
        }

        let count = count + 1;
        let elapsed = elapsed + delay;
        let timeout = self.config.retry_timeout.unwrap_or_default();

        if elapsed <= timeout {
            request.tries.push(request.token.clone());
            request.token = Token::generate();
            tracing::info!(retry_of = %parent, attempt = count, "RE-SEND {}", Packet::Request(request.clone()).trace());
            self.chained.insert(request.token.clone(), parent.clone());
            self.retries.update(request.method());
            self.request_with_retry(pool, request, parent, count, multiplier * 4, elapsed);
        } else {
            tracing::warn!(token = %request.token, "RE-SEND TIMEOUT after {} seconds and {count} attempts", elapsed.as_secs());
            let result = OperationResult::timeout(format!(
                "Timeout after {} seconds and {count} attempts",
                elapsed.as_secs()
            ));
            let method = request.method().to_string();
            self.handle_result(Reply::new(
                request.token.clone(),
                Some(self.config.identity.clone()),
                result,
                self.config.identity.clone(),
            ));
            self.retry_timeouts.update(&method);
        }

        if count == 1 {
            self.check_connection(pool, Some(broker));
        }
    }

    /// Deliver a result to the handler of the matching pending request.
    ///
    /// A result for any token of a retry chain answers the whole chain. A
    /// multicast announcement sets the number of replies still expected; the
    /// entry is purged once that reaches zero, or immediately for an ordinary
    /// result.
    pub fn handle_result(&mut self, reply: Reply) {
        let token = reply.token.clone();
        let head = self.head_of(&token);
        let Some(entry) = self.pending.get_mut(&head) else {
            tracing::debug!(token = %token, "No pending request for {}", reply.results.status());
            return;
        };

        let finished = match reply.results.multicast_targets() {
            Some(targets) => {
                entry.multicast = Some(targets.len());
                targets.is_empty()
            }
            None => match entry.multicast.as_mut() {
                Some(remaining) => {
                    *remaining = remaining.saturating_sub(1);
                    *remaining == 0
                }
                None => true,
            },
        };
        let responder = entry.responder.clone();
        if finished {
            self.purge(&head);
        }

        match responder {
            Responder::Ping => self.ping_replied(&token),
            Responder::Handler(handler) => {
                if let Err(e) = handler(reply) {
                    tracing::warn!(token = %token, error = %e, "Result handler failed");
                    self.exceptions.track("result", &e, None);
                }
            }
        }
    }

    fn head_of(&self, token: &Token) -> Token {
        self.chained.get(token).unwrap_or(token).clone()
    }

    /// Remove a pending request together with its whole retry chain.
    fn purge(&mut self, token: &Token) {
        let head = self.head_of(token);
        let Some(entry) = self.pending.remove(&head) else {
            return;
        };
        self.chained.retain(|_, parent| parent != &head);
        if !entry.is_ping() {
            self.requests.finish(entry.receive_time);
        }
    }

    /// Abandon a pending request. Returns whether it was pending.
    pub fn cancel(&mut self, token: &Token) -> bool {
        let pending = self.is_pending(token);
        self.purge(token);
        pending
    }

    /// Send a ping unless one is already outstanding.
    ///
    /// With `broker`, the ping goes out on that connection, and is skipped if
    /// it is not connected.
    pub fn check_connection(&mut self, pool: &mut BrokerPool, broker: Option<BrokerId>) {
        if self.probe.is_some() {
            return;
        }
        if let Some(id) = &broker {
            if !pool.is_connected(id) {
                return;
            }
        }

        let ping = self
            .outbound(PING_ROUTE, serde_json::Value::Null, RequestOptions::default())
            .reply_to(self.config.identity.clone());
        let token = ping.token.clone();
        let Ok(ids) = self.publish(pool, &Packet::Request(ping), broker.map(|id| vec![id])) else {
            return;
        };
        let Some(used) = ids.into_iter().next() else {
            return;
        };

        tracing::debug!(broker = %used, token = %token, "Probing broker connectivity");
        self.pending.insert(
            token.clone(),
            PendingRequest {
                responder: Responder::Ping,
                receive_time: Instant::now(),
                received_wall: Utc::now(),
                multicast: None,
            },
        );
        let timer = self.schedule(
            PING_TIMEOUT,
            ProxyEvent::PingTimeout {
                probe: token.clone(),
            },
        );
        self.probe = Some(Probe {
            token,
            broker: used,
            timer,
        });
    }

    fn ping_replied(&mut self, token: &Token) {
        if self.probe.as_ref().is_some_and(|p| &p.token == token) {
            if let Some(probe) = self.probe.take() {
                probe.timer.abort();
            }
            self.pings.update("success");
        }
    }

    /// Returns the broker to force-reconnect if the probe is still outstanding.
    fn ping_timed_out(&mut self, token: &Token) -> Option<BrokerId> {
        if !self.probe.as_ref().is_some_and(|p| &p.token == token) {
            return None;
        }
        let probe = self.probe.take()?;
        self.pending.remove(&probe.token);
        self.pings.update("timeout");
        tracing::warn!(broker = %probe.broker, "Mapper ping via broker timed out after {} seconds", PING_TIMEOUT.as_secs());
        Some(probe.broker)
    }

    /// Note inbound traffic, pushing back the inactivity timer.
    pub fn message_received(&mut self) {
        let due = self
            .inactivity_restarted
            .is_none_or(|at| at.elapsed() > MIN_RESTART_INACTIVITY_TIMER_INTERVAL);
        if due {
            self.restart_inactivity_timer();
        }
    }

    fn restart_inactivity_timer(&mut self) {
        let Some(interval) = self.config.ping_interval else {
            return;
        };
        if let Some(timer) = self.inactivity.take() {
            timer.abort();
        }
        self.inactivity = Some(self.schedule(interval, ProxyEvent::InactivityElapsed));
        self.inactivity_restarted = Some(Instant::now());
    }

    /// Apply a timer event. Returns a broker that should be force-reconnected.
    pub fn handle_event(&mut self, pool: &mut BrokerPool, event: ProxyEvent) -> Option<BrokerId> {
        match event {
            ProxyEvent::RetryDue(attempt) => {
                self.retry_due(pool, *attempt);
                None
            }
            ProxyEvent::PingTimeout { probe } => self.ping_timed_out(&probe),
            ProxyEvent::InactivityElapsed => {
                self.inactivity = None;
                self.check_connection(pool, None);
                self.restart_inactivity_timer();
                None
            }
        }
    }

    /// Stop the inactivity timer and any outstanding probe.
    pub fn stop(&mut self) {
        if let Some(timer) = self.inactivity.take() {
            timer.abort();
        }
        if let Some(probe) = self.probe.take() {
            probe.timer.abort();
            self.pending.remove(&probe.token);
        }
    }

    fn requests_pending(&self) -> impl Iterator<Item = (&Token, &PendingRequest)> {
        self.pending.iter().filter(|(_, p)| !p.is_ping())
    }

    /// Number of requests awaiting results, excluding probes. A retried
    /// request counts once.
    pub fn pending_count(&self) -> usize {
        self.requests_pending().count()
    }

    pub fn is_pending(&self, token: &Token) -> bool {
        self.pending.contains_key(token) || self.chained.contains_key(token)
    }

    /// Age in whole seconds of the oldest pending request.
    pub fn request_age(&self) -> Option<u64> {
        self.requests_pending()
            .map(|(_, p)| p.receive_time)
            .min()
            .map(|at| at.elapsed().as_secs())
    }

    /// Receive time and token of each pending request, newest first.
    pub fn dump_requests(&self) -> Vec<String> {
        let mut entries: Vec<(&Token, &PendingRequest)> = self.requests_pending().collect();
        entries.sort_by(|a, b| b.1.receive_time.cmp(&a.1.receive_time));
        let mut dump: Vec<String> = entries
            .iter()
            .take(MAX_DUMPED_REQUESTS)
            .map(|(token, p)| format!("{} <{}>", p.received_wall.to_rfc3339(), token))
            .collect();
        if entries.len() > MAX_DUMPED_REQUESTS {
            dump.push("...".to_string());
        }
        dump
    }

    pub fn stats(&mut self, reset: bool) -> ProxyStats {
        let count = self.pending_count();
        let stats = ProxyStats {
            pings: self.pings.all(),
            requests: self.requests.all(),
            pushes: self.pushes.all(),
            retries: self.retries.all(),
            retry_timeouts: self.retry_timeouts.all(),
            pending: (count > 0).then(|| PendingStats {
                count,
                oldest_age: self.request_age().unwrap_or_default(),
            }),
            response_time: self.requests.avg_duration(),
            exceptions: self.exceptions.stats(),
        };
        if reset {
            self.pings = ActivityStats::new(false);
            self.requests = ActivityStats::new(true);
            self.pushes = ActivityStats::new(true);
            self.retries = ActivityStats::new(false);
            self.retry_timeouts = ActivityStats::new(false);
            self.exceptions.reset();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryConnector};
    use crate::broker::{BrokerEvent, REQUEST_EXCHANGE};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Fixture {
        proxy: MapperProxy,
        events: mpsc::UnboundedReceiver<ProxyEvent>,
        pool: BrokerPool,
        broker: MemoryBroker,
        results: Arc<Mutex<Vec<Reply>>>,
    }

    impl Fixture {
        fn handler(&self) -> ResultHandler {
            let results = self.results.clone();
            Arc::new(move |reply| {
                results.lock().unwrap().push(reply);
                Ok(())
            })
        }

        /// Sent requests and pushes, excluding probes.
        fn sent(&self) -> Vec<Envelope> {
            self.broker
                .take("mapper")
                .into_iter()
                .filter_map(|p| p.envelope().cloned())
                .filter(|e| e.route != PING_ROUTE)
                .collect()
        }

        fn result(&self, token: &Token, results: OperationResult) -> Reply {
            Reply::new(token.clone(), Some("rs-instance-1-1".into()), results, "rs-mapper-1-1")
        }
    }

    async fn fixture(config: ProxyConfig) -> Fixture {
        let broker = MemoryBroker::new();
        broker.bind("mapper", REQUEST_EXCHANGE, "");
        let connector = MemoryConnector::new().with_broker("localhost", 5672, broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerEvent>();
        let mut pool = BrokerPool::new(Arc::new(connector), tx, Duration::from_secs(5));
        pool.connect("localhost", 5672, 0, None, false);
        let event = rx.recv().await.unwrap();
        pool.handle_event(event);

        let (events_tx, events) = mpsc::unbounded_channel();
        Fixture {
            proxy: MapperProxy::new(config, events_tx),
            events,
            pool,
            broker,
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn retry_config() -> ProxyConfig {
        ProxyConfig {
            retry_interval: Some(Duration::from_secs(10)),
            retry_timeout: Some(Duration::from_secs(60)),
            ..ProxyConfig::new("rs-instance-1-1")
        }
    }

    #[tokio::test]
    async fn test_request_and_result() {
        let mut f = fixture(ProxyConfig::new("rs-instance-1-1")).await;
        let handler = f.handler();
        let token = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::json!({"a": 1}),
            RequestOptions::default(),
            handler,
        );

        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, token);
        assert_eq!(sent[0].reply_to.as_deref(), Some("rs-instance-1-1"));
        assert!(!sent[0].persistent);
        assert_eq!(f.proxy.pending_count(), 1);

        let reply = f.result(&token, OperationResult::success("ok"));
        f.proxy.handle_result(reply.clone());
        assert_eq!(*f.results.lock().unwrap(), vec![reply]);
        assert!(!f.proxy.is_pending(&token));
        assert!(f.proxy.request_age().is_none());
    }

    #[tokio::test]
    async fn test_persistence_policy() {
        let config = ProxyConfig {
            persist: PersistMode::Push,
            ..ProxyConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        f.proxy
            .push(&mut f.pool, "/foo/bar", serde_json::Value::Null, RequestOptions::default())
            .unwrap();
        let handler = f.handler();
        f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler.clone(),
        );
        let forced = RequestOptions {
            persistent: Some(true),
            ..RequestOptions::default()
        };
        f.proxy
            .request(&mut f.pool, "/foo/bar", serde_json::Value::Null, forced, handler);

        let persistent: Vec<bool> = f.sent().iter().map(|e| e.persistent).collect();
        assert_eq!(persistent, vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_timeout_purges_chain() {
        let mut f = fixture(retry_config()).await;
        let started = Instant::now();
        let handler = f.handler();
        let first = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler,
        );

        let mut reconnect = Vec::new();
        while f.proxy.pending_count() > 0 {
            let event = f.events.recv().await.unwrap();
            if let Some(id) = f.proxy.handle_event(&mut f.pool, event) {
                reconnect.push(id);
            }
        }

        let sent = f.sent();
        let tokens: Vec<Token> = sent.iter().map(|e| e.token.clone()).collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], first);
        assert_eq!(sent[1].tries, vec![tokens[0].clone()]);
        assert_eq!(sent[2].tries, vec![tokens[0].clone(), tokens[1].clone()]);

        let results = f.results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].token, tokens[2]);
        assert_eq!(
            results[0].results,
            OperationResult::timeout("Timeout after 210 seconds and 3 attempts")
        );
        assert_eq!(started.elapsed(), Duration::from_secs(210));
        for token in &tokens {
            assert!(!f.proxy.is_pending(token));
        }

        // The first retry probed the connection, which nobody answered.
        assert_eq!(reconnect, vec![BrokerId::new("localhost", 5672)]);
        let stats = f.proxy.stats(false);
        assert_eq!(stats.retries.unwrap().total, 2);
        assert_eq!(stats.retry_timeouts.unwrap().total, 1);
        assert_eq!(stats.pings.unwrap().percent["timeout"], 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_for_original_token_stops_retries() {
        let mut f = fixture(retry_config()).await;
        let handler = f.handler();
        let first = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler,
        );

        let event = f.events.recv().await.unwrap();
        f.proxy.handle_event(&mut f.pool, event);
        let sent = f.sent();
        assert_eq!(sent.len(), 2);
        let retry = sent[1].token.clone();
        assert!(f.proxy.is_pending(&retry));
        assert_eq!(f.proxy.pending_count(), 1);

        let reply = f.result(&first, OperationResult::success("late"));
        f.proxy.handle_result(reply);
        assert_eq!(f.proxy.pending_count(), 0);
        assert!(!f.proxy.is_pending(&retry));

        // The probe timeout and the next retry still fire; the retry is a no-op.
        for _ in 0..2 {
            let event = f.events.recv().await.unwrap();
            f.proxy.handle_event(&mut f.pool, event);
        }
        assert!(f.sent().is_empty());
        assert_eq!(f.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_multicast_waits_for_every_reply() {
        let mut f = fixture(ProxyConfig::new("rs-instance-1-1")).await;
        let handler = f.handler();
        let token = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler,
        );

        let targets = vec!["rs-a-1".to_string(), "rs-a-2".to_string()];
        f.proxy
            .handle_result(f.result(&token, OperationResult::multicast(targets)));
        f.proxy
            .handle_result(f.result(&token, OperationResult::success(1)));
        assert!(f.proxy.is_pending(&token));
        f.proxy
            .handle_result(f.result(&token, OperationResult::success(2)));
        assert!(!f.proxy.is_pending(&token));
        assert_eq!(f.results.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_answering_a_retry_stops_retries() {
        let mut f = fixture(retry_config()).await;
        let handler = f.handler();
        let first = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler,
        );

        let event = f.events.recv().await.unwrap();
        f.proxy.handle_event(&mut f.pool, event);
        let sent = f.sent();
        assert_eq!(sent.len(), 2);
        let retry = sent[1].token.clone();

        let targets = vec!["rs-a-1".to_string(), "rs-a-2".to_string()];
        f.proxy
            .handle_result(f.result(&retry, OperationResult::multicast(targets)));

        // Probe timeout at 40s, then the retry due at 50s; neither re-sends.
        for _ in 0..2 {
            let event = f.events.recv().await.unwrap();
            f.proxy.handle_event(&mut f.pool, event);
        }
        assert!(f.sent().is_empty());
        assert!(f.proxy.is_pending(&first));

        f.proxy
            .handle_result(f.result(&retry, OperationResult::success(1)));
        assert!(f.proxy.is_pending(&first));
        f.proxy
            .handle_result(f.result(&first, OperationResult::success(2)));
        assert!(!f.proxy.is_pending(&first));
        assert!(!f.proxy.is_pending(&retry));

        let statuses: Vec<&str> = f
            .results
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.results.status())
            .collect();
        assert_eq!(statuses, vec!["multicast", "success", "success"]);
        assert!(f.proxy.stats(false).retry_timeouts.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_is_tracked() {
        let mut f = fixture(ProxyConfig::new("rs-instance-1-1")).await;
        let token = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            Arc::new(|_: Reply| -> anyhow::Result<()> { anyhow::bail!("handler broke") }),
        );
        f.proxy
            .handle_result(f.result(&token, OperationResult::success(1)));
        let stats = f.proxy.stats(true);
        assert_eq!(stats.exceptions.unwrap()["result"].total, 1);
        assert!(f.proxy.stats(false).exceptions.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_age_and_dump() {
        let mut f = fixture(ProxyConfig::new("rs-instance-1-1")).await;
        assert!(f.proxy.request_age().is_none());
        let handler = f.handler();
        let first = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler.clone(),
        );
        tokio::time::advance(Duration::from_secs(100)).await;
        let second = f.proxy.request(
            &mut f.pool,
            "/foo/bar",
            serde_json::Value::Null,
            RequestOptions::default(),
            handler,
        );
        assert_eq!(f.proxy.request_age(), Some(100));

        let dump = f.proxy.dump_requests();
        assert_eq!(dump.len(), 2);
        assert!(dump[0].ends_with(&format!("<{second}>")));
        assert!(dump[1].ends_with(&format!("<{first}>")));

        assert!(f.proxy.cancel(&first));
        assert_eq!(f.proxy.request_age(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_probe_reply_cancels_timeout() {
        let config = ProxyConfig {
            ping_interval: Some(Duration::from_secs(120)),
            ..ProxyConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        let started = Instant::now();
        f.proxy.start();

        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::InactivityElapsed));
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert!(f.proxy.handle_event(&mut f.pool, event).is_none());

        let probes: Vec<Envelope> = f
            .broker
            .take("mapper")
            .into_iter()
            .filter_map(|p| p.envelope().cloned())
            .collect();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].route, PING_ROUTE);

        // A second trigger while the probe is outstanding sends nothing.
        f.proxy.check_connection(&mut f.pool, None);
        assert!(f.broker.take("mapper").is_empty());

        let reply = f.result(&probes[0].token, OperationResult::success("pong"));
        f.proxy.handle_result(reply);

        // Next to fire is the restarted inactivity timer, not the probe timeout.
        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::InactivityElapsed));
        assert_eq!(started.elapsed(), Duration::from_secs(240));
        assert_eq!(f.proxy.stats(false).pings.unwrap().percent["success"], 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_requests_reconnect() {
        let config = ProxyConfig {
            ping_interval: Some(Duration::from_secs(120)),
            ..ProxyConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        f.proxy.start();

        let event = f.events.recv().await.unwrap();
        f.proxy.handle_event(&mut f.pool, event);
        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::PingTimeout { .. }));
        assert_eq!(
            f.proxy.handle_event(&mut f.pool, event),
            Some(BrokerId::new("localhost", 5672))
        );
        assert_eq!(f.proxy.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_restart_is_rate_limited() {
        let config = ProxyConfig {
            ping_interval: Some(Duration::from_secs(90)),
            ..ProxyConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        let started = Instant::now();
        f.proxy.start();

        tokio::time::advance(Duration::from_secs(30)).await;
        f.proxy.message_received();
        tokio::time::advance(Duration::from_secs(40)).await;
        f.proxy.message_received();

        // Only the second message, 70s after start, pushed the timer back.
        let event = f.events.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::InactivityElapsed));
        assert_eq!(started.elapsed(), Duration::from_secs(160));
    }
}
