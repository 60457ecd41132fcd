//! Inbound request dispatch.
//!
//! Turns each inbound request or push into exactly one actor invocation and,
//! for requests, exactly one result. Admission (freshness, duplicates, path
//! resolution) and completion bookkeeping run on the coordinating loop; the
//! invocation itself is a [`Job`] that may run on any task.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::actors::{ActorRegistry, Route};
use crate::broker::{BrokerPool, ExchangeSpec, PublishOptions};
use crate::error::ActorError;
use crate::packet::{
    Envelope, OperationResult, Packet, PacketKind, Reply, TTL_EXPIRATION, Token, now_secs,
};
use crate::stats::{
    ActivityStats, ActivitySummary, ExceptionCallback, ExceptionStats, ExceptionSummary,
    nil_if_zero,
};

/// Minimum spacing between re-advertisements triggered by stale requests.
const READVERTISE_INTERVAL: Duration = Duration::from_secs(3600);

/// Completed-request retention when no freshness window is configured.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity stamped on results.
    pub identity: String,
    /// Requests older than this are rejected.
    pub fresh_timeout: Option<Duration>,
    /// Reject requests whose token (or retry lineage) already completed.
    pub dup_check: bool,
    /// How long completed tokens are remembered.
    pub completed_retention: Duration,
    pub secure: bool,
}

impl DispatcherConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            fresh_timeout: None,
            dup_check: false,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            secure: false,
        }
    }
}

/// Notifications from the dispatcher to its owner's loop.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A job finished; feed it to [`Dispatcher::complete`].
    Completed(Completion),
    /// A stale request suggests remote routing is out of date.
    AdvertiseRequested,
}

/// Result of admitting an inbound packet.
#[derive(Debug)]
pub enum Admission {
    /// Rejected as stale or duplicate; no handler runs.
    Rejected,
    /// Handled without invoking an actor, possibly with a reply already sent.
    Done(Option<Reply>),
    /// Ready to invoke.
    Accepted(Job),
}

/// An admitted invocation, independent of dispatcher state.
#[derive(Debug)]
pub struct Job {
    route: Route,
    request: Envelope,
    kind: PacketKind,
    started: Instant,
}

impl Job {
    pub fn token(&self) -> &Token {
        &self.request.token
    }

    /// Invoke the actor. Errors and panics become an error outcome after the
    /// actor's exception hook has seen them.
    pub async fn run(self) -> Completion {
        let Job {
            route,
            request,
            kind,
            started,
        } = self;

        let invocation = route
            .actor
            .invoke(&route.method, request.payload.clone(), &request);
        let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                route.actor.on_exception(&route.method, &request, &e);
                Err(e.to_string())
            }
            Err(panic) => {
                let e = ActorError::failed(format!(
                    "{} panicked: {}",
                    request.route,
                    panic_message(panic.as_ref())
                ));
                route.actor.on_exception(&route.method, &request, &e);
                Err(e.to_string())
            }
        };

        Completion {
            request,
            kind,
            started,
            outcome,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Outcome of a [`Job`].
#[derive(Debug)]
pub struct Completion {
    pub request: Envelope,
    pub kind: PacketKind,
    started: Instant,
    pub outcome: Result<serde_json::Value, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejects: Option<ActivitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<BTreeMap<String, ExceptionSummary>>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: ActorRegistry,
    events: mpsc::UnboundedSender<DispatchEvent>,
    /// Accepted two-way requests not yet answered.
    pending: HashMap<Token, Instant>,
    /// Tokens (and retry lineage) of admitted jobs still running, when
    /// duplicate checking is on.
    in_flight: HashSet<Token>,
    completed: HashMap<Token, Instant>,
    last_advertised: Option<Instant>,
    wall_clock: fn() -> f64,
    dispatches: ActivityStats,
    rejects: ActivityStats,
    exceptions: ExceptionStats,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: ActorRegistry,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            completed: HashMap::new(),
            last_advertised: None,
            wall_clock: now_secs,
            dispatches: ActivityStats::new(true),
            rejects: ActivityStats::new(false),
            exceptions: ExceptionStats::default(),
        }
    }

    /// Replace the wall clock used for freshness checks.
    pub fn with_wall_clock(mut self, clock: fn() -> f64) -> Self {
        self.wall_clock = clock;
        self
    }

    pub fn set_exception_callback(&mut self, callback: Option<ExceptionCallback>) {
        self.exceptions.set_callback(callback);
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ActorRegistry {
        &mut self.registry
    }

    /// Record that services were just advertised.
    pub fn note_advertised(&mut self) {
        self.last_advertised = Some(Instant::now());
    }

    /// Admit an inbound packet.
    pub fn accept(&mut self, pool: &mut BrokerPool, packet: Packet) -> Admission {
        let kind = packet.kind();
        let request = match packet {
            Packet::Request(e) | Packet::Push(e) => e,
            other => {
                tracing::debug!("Dispatcher ignoring {}", other.trace());
                return Admission::Done(None);
            }
        };
        let trace = format!("{kind} <{}> {}", request.token, request.route);

        if let Some(age) = self.stale_age(&request) {
            tracing::info!(age, "REJECT STALE {trace}");
            self.rejects.update("stale");
            if kind == PacketKind::Request && request.reply_to.is_some() {
                let result = OperationResult::non_delivery(TTL_EXPIRATION);
                self.reply(pool, &request, result);
            }
            self.readvertise();
            return Admission::Rejected;
        }

        if self.config.dup_check {
            if self.seen(&request.token) {
                tracing::info!("REJECT DUP {trace}");
                self.rejects.update("duplicate");
                return Admission::Rejected;
            }
            if let Some(token) = request.tries.iter().find(|t| self.seen(t)) {
                tracing::info!(retry_of = %token, "REJECT RETRY DUP {trace}");
                self.rejects.update("retry duplicate");
                return Admission::Rejected;
            }
        }

        let route = match self.registry.resolve(&request.route) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to dispatch {trace}");
                self.exceptions.track("dispatch", &e, None);
                if kind == PacketKind::Request {
                    let reply = self.reply(pool, &request, OperationResult::not_found(e.to_string()));
                    return Admission::Done(Some(reply));
                }
                return Admission::Done(None);
            }
        };

        tracing::info!("RECV {trace}");
        let started = self.dispatches.update(&route.method);
        if kind == PacketKind::Request {
            self.pending.insert(request.token.clone(), started);
        }
        if self.config.dup_check {
            self.in_flight.insert(request.token.clone());
            self.in_flight.extend(request.tries.iter().cloned());
        }

        Admission::Accepted(Job {
            route,
            request,
            kind,
            started,
        })
    }

    /// Run a job on its own task; its completion is posted back as a
    /// [`DispatchEvent::Completed`].
    pub fn spawn(&self, job: Job) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let completion = job.run().await;
            let _ = events.send(DispatchEvent::Completed(completion));
        });
    }

    /// Record a finished job and send the reply for two-way requests.
    pub fn complete(&mut self, pool: &mut BrokerPool, completion: Completion) -> Option<Reply> {
        let Completion {
            request,
            kind,
            started,
            outcome,
        } = completion;

        self.pending.remove(&request.token);
        self.dispatches.finish(started);
        if self.config.dup_check {
            let now = Instant::now();
            for token in std::iter::once(&request.token).chain(&request.tries) {
                self.in_flight.remove(token);
                self.completed.insert(token.clone(), now);
            }
        }

        let result = match outcome {
            Ok(value) => OperationResult::success(value),
            Err(message) => {
                tracing::warn!(token = %request.token, error = %message, "Failed to handle {}", request.route);
                let packet = match kind {
                    PacketKind::Request => Packet::Request(request.clone()),
                    _ => Packet::Push(request.clone()),
                };
                self.exceptions.track("dispatch", &message, Some(&packet));
                OperationResult::error(message)
            }
        };

        if kind != PacketKind::Request {
            return None;
        }
        Some(self.reply(pool, &request, result))
    }

    /// Admit, invoke and complete in one call.
    pub async fn dispatch(&mut self, pool: &mut BrokerPool, packet: Packet) -> Option<Reply> {
        match self.accept(pool, packet) {
            Admission::Rejected => None,
            Admission::Done(reply) => reply,
            Admission::Accepted(job) => {
                let completion = job.run().await;
                self.complete(pool, completion)
            }
        }
    }

    fn reply(&mut self, pool: &mut BrokerPool, request: &Envelope, result: OperationResult) -> Reply {
        let reply = Reply::new(
            request.token.clone(),
            request.reply_to.clone(),
            result,
            self.config.identity.clone(),
        );
        let packet = Packet::Result(reply.clone());
        let exchange = ExchangeSpec::request(self.config.secure);
        if let Err(e) = pool.publish(&exchange, &packet, &PublishOptions::persistent(request.persistent)) {
            tracing::warn!(token = %request.token, error = %e, "Failed to send result");
            self.exceptions.track("reply", &e, Some(&packet));
        }
        reply
    }

    /// Whether `token` completed or is still being handled.
    fn seen(&self, token: &Token) -> bool {
        self.completed.contains_key(token) || self.in_flight.contains(token)
    }

    /// Age in whole seconds if the request is outside the freshness window.
    fn stale_age(&self, request: &Envelope) -> Option<i64> {
        let window = self.config.fresh_timeout?;
        if request.created_at <= 0.0 {
            return None;
        }
        let age = ((self.wall_clock)().floor() - request.created_at.floor()) as i64;
        (age > window.as_secs() as i64).then_some(age)
    }

    fn readvertise(&mut self) {
        let due = self
            .last_advertised
            .is_none_or(|at| at.elapsed() >= READVERTISE_INTERVAL);
        if due {
            self.last_advertised = Some(Instant::now());
            let _ = self.events.send(DispatchEvent::AdvertiseRequested);
        }
    }

    /// Forget completed tokens older than the retention window.
    pub fn purge_completed(&mut self) {
        let retention = self.config.completed_retention;
        let before = self.completed.len();
        self.completed.retain(|_, at| at.elapsed() <= retention);
        let purged = before - self.completed.len();
        if purged > 0 {
            tracing::debug!(purged, "Purged completed requests");
        }
    }

    /// Remember a token as completed without dispatching it.
    pub fn mark_completed(&mut self, token: Token) {
        self.completed.insert(token, Instant::now());
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Age in whole seconds of the oldest unanswered request.
    pub fn dispatch_age(&self) -> Option<u64> {
        self.pending
            .values()
            .min()
            .map(|started| started.elapsed().as_secs())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&mut self, reset: bool) -> DispatcherStats {
        let stats = DispatcherStats {
            dispatched: self.dispatches.all(),
            rejects: self.rejects.all(),
            pending: nil_if_zero(self.pending.len()),
            response_time: self.dispatches.avg_duration(),
            exceptions: self.exceptions.stats(),
        };
        if reset {
            self.dispatches = ActivityStats::new(true);
            self.rejects = ActivityStats::new(false);
            self.exceptions.reset();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::Actor;
    use crate::broker::memory::{MemoryBroker, MemoryConnector};
    use crate::broker::{BrokerEvent, REQUEST_EXCHANGE};
    use crate::error::ActorError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    const NOW: f64 = 1_000_000.25;

    #[derive(Default)]
    struct Foo {
        calls: Mutex<Vec<String>>,
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Actor for Foo {
        fn prefix(&self) -> &str {
            "foo"
        }

        fn methods(&self) -> &[&'static str] {
            &["bar", "fail", "explode"]
        }

        async fn invoke(
            &self,
            method: &str,
            payload: serde_json::Value,
            _request: &Envelope,
        ) -> Result<serde_json::Value, ActorError> {
            self.calls.lock().unwrap().push(method.to_string());
            match method {
                "fail" => Err(ActorError::failed("boom")),
                "explode" => panic!("kaboom"),
                _ => Ok(serde_json::json!(["hello", payload])),
            }
        }

        fn on_exception(&self, method: &str, _request: &Envelope, error: &ActorError) {
            self.failures
                .lock()
                .unwrap()
                .push(format!("{method}: {error}"));
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        events: mpsc::UnboundedReceiver<DispatchEvent>,
        pool: BrokerPool,
        broker: MemoryBroker,
        actor: Arc<Foo>,
    }

    async fn fixture(config: DispatcherConfig) -> Fixture {
        let broker = MemoryBroker::new();
        broker.bind("results", REQUEST_EXCHANGE, "");
        let connector = MemoryConnector::new().with_broker("localhost", 5672, broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerEvent>();
        let mut pool = BrokerPool::new(Arc::new(connector), tx, Duration::from_secs(5));
        pool.connect("localhost", 5672, 0, None, false);
        let event = rx.recv().await.unwrap();
        pool.handle_event(event);

        let actor = Arc::new(Foo::default());
        let mut registry = ActorRegistry::new();
        registry.register(actor.clone(), None);

        let (events_tx, events) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(config, registry, events_tx).with_wall_clock(|| NOW);
        Fixture {
            dispatcher,
            events,
            pool,
            broker,
            actor,
        }
    }

    fn request(route: &str, created_at: f64) -> Envelope {
        Envelope::new(route, serde_json::json!("you"))
            .from_agent("rs-mapper-1-1")
            .reply_to("rs-mapper-1-1")
            .created_at(created_at)
    }

    fn fresh_config() -> DispatcherConfig {
        DispatcherConfig {
            fresh_timeout: Some(Duration::from_secs(15)),
            ..DispatcherConfig::new("rs-instance-1-1")
        }
    }

    #[tokio::test]
    async fn test_dispatch_request_returns_result() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let envelope = request("/foo/bar", NOW);
        let token = envelope.token.clone();

        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Request(envelope))
            .await
            .unwrap();
        assert_eq!(reply.token, token);
        assert_eq!(reply.to.as_deref(), Some("rs-mapper-1-1"));
        assert_eq!(
            reply.results,
            OperationResult::success(serde_json::json!(["hello", "you"]))
        );
        assert_eq!(f.broker.take("results"), vec![Packet::Result(reply)]);
        assert_eq!(f.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_push_produces_no_result() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Push(request("/foo/bar", NOW)))
            .await;
        assert!(reply.is_none());
        assert_eq!(*f.actor.calls.lock().unwrap(), vec!["bar"]);
        assert!(f.broker.take("results").is_empty());
    }

    #[tokio::test]
    async fn test_stale_request_gets_non_delivery() {
        let mut f = fixture(fresh_config()).await;
        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Request(request("/foo/bar", NOW - 16.0)))
            .await;
        assert!(reply.is_none());
        assert!(f.actor.calls.lock().unwrap().is_empty());

        let sent = f.broker.take("results");
        assert_eq!(sent.len(), 1);
        let Packet::Result(result) = &sent[0] else {
            panic!("expected a result, got {:?}", sent[0]);
        };
        assert_eq!(result.results, OperationResult::non_delivery(TTL_EXPIRATION));
        assert!(matches!(
            f.events.try_recv(),
            Ok(DispatchEvent::AdvertiseRequested)
        ));

        // Only one re-advertise per interval.
        f.dispatcher
            .dispatch(&mut f.pool, Packet::Push(request("/foo/bar", NOW - 100.0)))
            .await;
        assert!(f.events.try_recv().is_err());
        assert!(f.broker.take("results").is_empty());
    }

    #[tokio::test]
    async fn test_freshness_boundary_and_missing_timestamp() {
        let mut f = fixture(fresh_config()).await;
        let at_boundary = request("/foo/bar", NOW.floor() - 15.0 + 0.9);
        assert!(
            f.dispatcher
                .dispatch(&mut f.pool, Packet::Request(at_boundary))
                .await
                .is_some()
        );

        let untimed = request("/foo/bar", 0.0);
        assert!(
            f.dispatcher
                .dispatch(&mut f.pool, Packet::Request(untimed))
                .await
                .is_some()
        );
        assert_eq!(f.actor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_retry_duplicate_rejected() {
        let config = DispatcherConfig {
            dup_check: true,
            ..DispatcherConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;

        let first = request("/foo/bar", NOW);
        f.dispatcher
            .dispatch(&mut f.pool, Packet::Request(first.clone()))
            .await
            .unwrap();
        assert!(
            f.dispatcher
                .dispatch(&mut f.pool, Packet::Request(first.clone()))
                .await
                .is_none()
        );

        let mut retry = request("/foo/bar", NOW);
        retry.tries = vec![first.token.clone()];
        assert!(
            f.dispatcher
                .dispatch(&mut f.pool, Packet::Request(retry))
                .await
                .is_none()
        );
        assert_eq!(f.actor.calls.lock().unwrap().len(), 1);

        let rejects = f.dispatcher.stats(false).rejects.unwrap();
        assert_eq!(rejects.total, 2);
    }

    #[tokio::test]
    async fn test_redelivery_while_running_is_rejected() {
        let config = DispatcherConfig {
            dup_check: true,
            ..DispatcherConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        let first = request("/foo/bar", NOW);

        let Admission::Accepted(job) = f.dispatcher.accept(&mut f.pool, Packet::Request(first.clone())) else {
            panic!("request not accepted");
        };
        assert!(matches!(
            f.dispatcher.accept(&mut f.pool, Packet::Request(first.clone())),
            Admission::Rejected
        ));
        let mut retry = request("/foo/bar", NOW);
        retry.tries = vec![first.token.clone()];
        assert!(matches!(
            f.dispatcher.accept(&mut f.pool, Packet::Request(retry)),
            Admission::Rejected
        ));

        let completion = job.run().await;
        assert!(f.dispatcher.complete(&mut f.pool, completion).is_some());
        assert!(matches!(
            f.dispatcher.accept(&mut f.pool, Packet::Request(first)),
            Admission::Rejected
        ));

        assert_eq!(f.actor.calls.lock().unwrap().len(), 1);
        assert_eq!(f.broker.take("results").len(), 1);
        assert_eq!(f.dispatcher.stats(false).rejects.unwrap().total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_cache_is_purged() {
        let config = DispatcherConfig {
            dup_check: true,
            completed_retention: Duration::from_secs(15),
            ..DispatcherConfig::new("rs-instance-1-1")
        };
        let mut f = fixture(config).await;
        f.dispatcher.mark_completed(Token::from("old"));
        tokio::time::advance(Duration::from_secs(10)).await;
        f.dispatcher.mark_completed(Token::from("new"));
        tokio::time::advance(Duration::from_secs(6)).await;

        f.dispatcher.purge_completed();
        assert_eq!(f.dispatcher.completed_len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_result() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Request(request("/foo/fail", NOW)))
            .await
            .unwrap();
        assert_eq!(reply.results, OperationResult::error("boom"));
        assert_eq!(*f.actor.failures.lock().unwrap(), vec!["fail: boom"]);

        let stats = f.dispatcher.stats(true);
        assert_eq!(stats.exceptions.unwrap()["dispatch"].total, 1);
        assert!(f.dispatcher.stats(false).exceptions.is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_reaches_exception_hook() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Request(request("/foo/explode", NOW)))
            .await
            .unwrap();
        assert_eq!(
            reply.results,
            OperationResult::error("/foo/explode panicked: kaboom")
        );
        assert_eq!(
            *f.actor.failures.lock().unwrap(),
            vec!["explode: /foo/explode panicked: kaboom"]
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let reply = f
            .dispatcher
            .dispatch(&mut f.pool, Packet::Request(request("/nope/bar", NOW)))
            .await
            .unwrap();
        assert_eq!(reply.results.status(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_age_tracks_oldest_request() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        assert!(f.dispatcher.dispatch_age().is_none());

        let Admission::Accepted(push) = f.dispatcher.accept(&mut f.pool, Packet::Push(request("/foo/bar", NOW))) else {
            panic!("push not accepted");
        };
        assert!(f.dispatcher.dispatch_age().is_none());

        let Admission::Accepted(job) = f.dispatcher.accept(&mut f.pool, Packet::Request(request("/foo/bar", NOW))) else {
            panic!("request not accepted");
        };
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(f.dispatcher.dispatch_age(), Some(100));

        let completion = job.run().await;
        f.dispatcher.complete(&mut f.pool, completion);
        let completion = push.run().await;
        f.dispatcher.complete(&mut f.pool, completion);
        assert!(f.dispatcher.dispatch_age().is_none());
    }

    #[tokio::test]
    async fn test_spawned_job_posts_completion() {
        let mut f = fixture(DispatcherConfig::new("rs-instance-1-1")).await;
        let Admission::Accepted(job) = f.dispatcher.accept(&mut f.pool, Packet::Request(request("/foo/bar", NOW))) else {
            panic!("request not accepted");
        };
        f.dispatcher.spawn(job);

        let Some(DispatchEvent::Completed(completion)) = f.events.recv().await else {
            panic!("expected completion");
        };
        assert!(f.dispatcher.complete(&mut f.pool, completion).is_some());
    }
}
