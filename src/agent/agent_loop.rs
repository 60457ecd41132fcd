//! The agent's coordinating loop.
//!
//! One task owns the broker pool, the dispatcher and the mapper proxy, and
//! applies every event to them in turn: commands from handles, broker
//! connection events, inbound packets, proxy timers, finished jobs and the
//! periodic status check. Nothing else mutates that state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::PROTOCOL_VERSION;
use crate::actors::{Actor, ActorRegistry};
use crate::agent::command::{AgentHandle, Command};
use crate::agent::state::{AgentActivity, AgentState, AgentStats, hostname, machine_uptime};
use crate::broker::{
    BrokerEvent, BrokerId, BrokerPool, ConnectionStatus, Connector, ExchangeSpec, PacketHandler,
    PublishOptions, QueueSpec, SubscribeOptions,
};
use crate::config::AgentConfig;
use crate::dispatcher::{Admission, DispatchEvent, Dispatcher, DispatcherConfig};
use crate::error::AgentError;
use crate::mapper_proxy::{MapperProxy, ProxyConfig, ProxyEvent, RequestOptions};
use crate::packet::{AgentIdentity, Packet, PacketKind, Register, Stats, UnRegister};
use crate::stats::{ActivityStats, ExceptionCallback, ExceptionStats};

const REGISTRAR_CONNECT_ROUTE: &str = "/registrar/connect";
const UPDATE_TAGS_ROUTE: &str = "/mapper/update_tags";

struct Mailboxes {
    commands: mpsc::UnboundedReceiver<Command>,
    broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
    inbound: mpsc::UnboundedReceiver<(BrokerId, Packet)>,
    proxy_events: mpsc::UnboundedReceiver<ProxyEvent>,
    dispatch_events: mpsc::UnboundedReceiver<DispatchEvent>,
}

/// A messaging agent: identity, broker connections, inbound dispatch and
/// outbound requests, driven by [`Agent::run`].
pub struct Agent {
    config: AgentConfig,
    identity: String,
    parsed: AgentIdentity,
    state: AgentState,
    pool: BrokerPool,
    dispatcher: Dispatcher,
    proxy: MapperProxy,
    handle: AgentHandle,
    mailboxes: Option<Mailboxes>,
    inbound_tx: mpsc::UnboundedSender<(BrokerId, Packet)>,
    connect_requests: ActivityStats,
    exceptions: ExceptionStats,
    started: Instant,
    last_reset: i64,
    stats_broker: usize,
    grace_deadline: Option<Instant>,
}

impl Agent {
    pub fn new(mut config: AgentConfig, connector: Arc<dyn Connector>) -> Result<Self, AgentError> {
        config.validate()?;
        let identity = config.identity();
        config.identity = Some(identity.clone());
        let parsed =
            AgentIdentity::parse(&identity).map_err(|e| AgentError::Startup(e.to_string()))?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (broker_tx, broker_events) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (proxy_tx, proxy_events) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_events) = mpsc::unbounded_channel();

        let mut pool = BrokerPool::new(connector, broker_tx, config.connect_timeout());
        if let Some(count) = config.prefetch {
            pool.prefetch(count);
        }

        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                identity: identity.clone(),
                fresh_timeout: config.fresh_timeout(),
                dup_check: config.dup_check,
                completed_retention: config
                    .fresh_timeout()
                    .unwrap_or(crate::dispatcher::DEFAULT_COMPLETED_RETENTION),
                secure: config.secure,
            },
            ActorRegistry::new(),
            dispatch_tx,
        );

        let proxy = MapperProxy::new(
            ProxyConfig {
                identity: identity.clone(),
                retry_interval: config.retry_interval(),
                retry_timeout: config.retry_timeout(),
                ping_interval: config.ping_interval(),
                persist: config.persist,
                secure: config.secure,
            },
            proxy_tx,
        );

        Ok(Self {
            handle: AgentHandle::new(&identity, command_tx),
            config,
            identity,
            parsed,
            state: AgentState::Starting,
            pool,
            dispatcher,
            proxy,
            mailboxes: Some(Mailboxes {
                commands,
                broker_events,
                inbound,
                proxy_events,
                dispatch_events,
            }),
            inbound_tx,
            connect_requests: ActivityStats::new(false),
            exceptions: ExceptionStats::default(),
            started: Instant::now(),
            last_reset: Utc::now().timestamp(),
            stats_broker: 0,
            grace_deadline: None,
        })
    }

    /// Route exceptions from every component to `callback`.
    pub fn with_exception_callback(mut self, callback: ExceptionCallback) -> Self {
        self.pool.set_exception_callback(Some(callback.clone()));
        self.dispatcher.set_exception_callback(Some(callback.clone()));
        self.proxy.set_exception_callback(Some(callback.clone()));
        self.exceptions.set_callback(Some(callback));
        self
    }

    /// Register an actor under `prefix`, or its own prefix if `None`.
    pub fn register(&mut self, actor: Arc<dyn Actor>, prefix: Option<&str>) {
        self.dispatcher.registry_mut().register(actor, prefix);
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Connect, set up queues and serve until terminated.
    ///
    /// Only startup failures are returned.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        let mut mailboxes = self.mailboxes.take().ok_or(AgentError::AlreadyRunning)?;
        tracing::info!(identity = %self.identity, "[setup] Starting agent");

        self.connect_brokers(&mut mailboxes.broker_events).await?;
        self.start_running();

        let mut check = every(self.config.check_interval());
        let mut purge = every(Some(self.config.completed_interval()));

        while self.state != AgentState::Stopped {
            let grace = self.grace_deadline;
            // Deliveries are applied before commands issued after them.
            tokio::select! {
                biased;
                Some(event) = mailboxes.broker_events.recv() => self.broker_event(event),
                Some((broker, packet)) = mailboxes.inbound.recv() => self.receive(broker, packet),
                Some(event) = mailboxes.dispatch_events.recv() => self.dispatch_event(event),
                Some(event) = mailboxes.proxy_events.recv() => self.proxy_event(event),
                Some(command) = mailboxes.commands.recv() => self.handle_command(command),
                () = until(grace) => {
                    tracing::warn!("[stop] Grace period expired with work outstanding");
                    self.finish_termination();
                }
                () = tick(&mut check) => self.check_status(),
                () = tick(&mut purge) => self.dispatcher.purge_completed(),
            }
        }
        Ok(())
    }

    async fn connect_brokers(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> Result<(), AgentError> {
        self.state = AgentState::ConnectingBrokers;
        for address in self.config.broker_addresses()? {
            if let Some(error) = self.pool.connect(
                &address.host,
                address.port,
                address.index,
                address.priority,
                false,
            ) {
                tracing::error!(broker = %address.id(), error = %error, "[setup] Failed to start connecting");
                self.exceptions.track("connect", &error, None);
            }
        }

        while !self.pool.usable().is_empty() {
            let Some(event) = events.recv().await else {
                break;
            };
            if let Some(change) = self.pool.handle_event(event) {
                if change.status == ConnectionStatus::Connected {
                    return Ok(());
                }
            }
        }

        tracing::error!(status = ?self.pool.status(), "[setup] Failed to connect to any brokers");
        self.state = AgentState::Stopped;
        Err(AgentError::NoBrokers)
    }

    fn start_running(&mut self) {
        self.state = AgentState::Running;
        self.setup_queues();
        self.advertise_services(None);
        self.proxy.start();
        tracing::info!(
            identity = %self.identity,
            brokers = ?self.pool.aliases(&self.pool.connected()),
            "[setup] Agent running"
        );
    }

    fn inbound_handler(&self) -> PacketHandler {
        let inbound = self.inbound_tx.clone();
        Arc::new(move |broker: &BrokerId, packet| {
            let _ = inbound.send((broker.clone(), packet));
        })
    }

    /// Subscribe the identity queue and, if configured, the shared queue.
    fn setup_queues(&mut self) {
        let secure = self.config.secure;
        let advertise = (!self.parsed.is_instance_agent()).then(ExchangeSpec::advertise);
        self.pool.subscribe(
            QueueSpec::new(self.identity.clone()).no_declare(secure),
            Some(ExchangeSpec::direct(self.identity.clone()).no_declare(secure)),
            SubscribeOptions {
                accept: vec![
                    PacketKind::Request,
                    PacketKind::Push,
                    PacketKind::Result,
                    PacketKind::Advertise,
                ],
                brokers: None,
                extra_exchange: advertise,
            },
            self.inbound_handler(),
        );

        if let Some(shared) = self.config.shared_queue.clone() {
            self.pool.subscribe(
                QueueSpec::new(shared.clone()).no_declare(secure),
                Some(ExchangeSpec::direct(shared).no_declare(secure)),
                SubscribeOptions {
                    accept: vec![PacketKind::Request, PacketKind::Push],
                    ..SubscribeOptions::default()
                },
                self.inbound_handler(),
            );
        }
    }

    /// Publish a registration of this agent's services.
    fn advertise_services(&mut self, brokers: Option<Vec<BrokerId>>) {
        let mut services = self.dispatcher.registry().services();
        services.extend(self.config.services.iter().cloned());
        services.sort();
        services.dedup();

        let packet = Packet::Register(Register {
            identity: self.identity.clone(),
            services,
            tags: self.config.tags.clone(),
            brokers: self.pool.all().iter().map(ToString::to_string).collect(),
            shared_queue: self.config.shared_queue.clone(),
        });
        let options = PublishOptions {
            fanout: true,
            ..PublishOptions::persistent(true)
        }
        .on_brokers(brokers);

        match self
            .pool
            .publish(&ExchangeSpec::registration(self.config.secure), &packet, &options)
        {
            Ok(ids) => {
                tracing::info!(brokers = ?self.pool.aliases(&ids), "Advertised services");
                self.dispatcher.note_advertised();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to advertise services");
                self.exceptions.track("advertise", &e, Some(&packet));
            }
        }
    }

    fn un_register(&mut self) {
        let packet = Packet::UnRegister(UnRegister {
            identity: self.identity.clone(),
        });
        let options = PublishOptions {
            fanout: true,
            ..PublishOptions::persistent(true)
        };
        if let Err(e) = self.pool.publish(
            &ExchangeSpec::registration(self.config.secure),
            &packet,
            &options,
        ) {
            tracing::warn!(error = %e, "Failed to unregister");
            self.exceptions.track("unregister", &e, Some(&packet));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                route,
                payload,
                options,
                handler,
            } => {
                self.proxy
                    .request(&mut self.pool, &route, payload, options, handler);
            }
            Command::Push {
                route,
                payload,
                options,
            } => {
                // Failures are logged and counted by the proxy.
                let _ = self.proxy.push(&mut self.pool, &route, payload, options);
            }
            Command::Cancel { token } => {
                self.proxy.cancel(&token);
                self.check_drained();
            }
            Command::Terminate => self.terminate(),
            Command::Stats { reset, reply } => {
                let _ = reply.send(self.stats(reset));
            }
            Command::Connect {
                host,
                port,
                index,
                priority,
                force,
                reply,
            } => {
                self.connect_requests.update("connect");
                let _ = reply.send(self.pool.connect(&host, port, index, priority, force));
            }
            Command::Disconnect {
                host,
                port,
                remove,
                reply,
            } => {
                let _ = reply.send(self.disconnect(&host, port, remove));
            }
            Command::ConnectFailed { ids } => self.connect_failed(ids),
            Command::UpdateTags {
                new_tags,
                obsolete_tags,
            } => self.update_tags(new_tags, obsolete_tags),
            Command::Advertise => self.advertise_services(None),
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    fn broker_event(&mut self, event: BrokerEvent) {
        let Some(change) = self.pool.handle_event(event) else {
            return;
        };
        if change.status == ConnectionStatus::Connected && self.state == AgentState::Running {
            self.advertise_services(Some(vec![change.id]));
        }
    }

    fn receive(&mut self, broker: BrokerId, packet: Packet) {
        self.proxy.message_received();
        match packet {
            Packet::Result(reply) => {
                self.proxy.handle_result(reply);
                self.check_drained();
            }
            Packet::Advertise(_) => {
                if self.state == AgentState::Running {
                    self.advertise_services(None);
                }
            }
            Packet::Request(_) | Packet::Push(_) => {
                if self.state != AgentState::Running {
                    tracing::info!(broker = %broker, state = %self.state, "Ignoring {}", packet.trace());
                    return;
                }
                if let Admission::Accepted(job) = self.dispatcher.accept(&mut self.pool, packet) {
                    self.dispatcher.spawn(job);
                }
            }
            other => {
                tracing::debug!(broker = %broker, "Ignoring unexpected {}", other.trace());
            }
        }
    }

    fn proxy_event(&mut self, event: ProxyEvent) {
        if let Some(id) = self.proxy.handle_event(&mut self.pool, event) {
            self.reconnect(&id);
        }
        self.check_drained();
    }

    fn dispatch_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Completed(completion) => {
                self.dispatcher.complete(&mut self.pool, completion);
                self.check_drained();
            }
            DispatchEvent::AdvertiseRequested => {
                if self.state == AgentState::Running {
                    self.advertise_services(None);
                }
            }
        }
    }

    /// Force a fresh connection attempt, keeping the broker's place.
    fn reconnect(&mut self, id: &BrokerId) {
        let Some(address) = self.pool.identity_parts(id) else {
            return;
        };
        self.connect_requests.update("reconnect");
        if let Some(error) = self
            .pool
            .connect(&address.host, address.port, address.index, None, true)
        {
            tracing::warn!(broker = %id, error = %error, "Failed to reconnect");
            self.exceptions.track("reconnect", &error, None);
        }
    }

    /// Periodic broker recovery and statistics publication.
    fn check_status(&mut self) {
        if self.state != AgentState::Running {
            return;
        }
        for id in self.pool.failed(true) {
            if self.parsed.is_instance_agent() {
                self.request_registrar_connect(&id);
            } else {
                self.reconnect(&id);
            }
        }
        self.publish_stats();
    }

    /// Ask the registrar to have this agent reconnect to a failed broker.
    fn request_registrar_connect(&mut self, id: &BrokerId) {
        let Some(address) = self.pool.identity_parts(id) else {
            return;
        };
        tracing::info!(broker = %id, "Asking registrar to reconnect broker");
        self.connect_requests.update("registrar");
        let payload = json!({
            "agent_identity": self.identity,
            "host": address.host,
            "port": address.port,
            "id": address.index,
            "priority": address.priority,
        });
        let _ = self.proxy.push(
            &mut self.pool,
            REGISTRAR_CONNECT_ROUTE,
            payload,
            RequestOptions::default(),
        );
    }

    /// Publish statistics on one connected broker, rotating between calls.
    fn publish_stats(&mut self) {
        let connected = self.pool.connected();
        if connected.is_empty() {
            return;
        }
        let broker = connected[self.stats_broker % connected.len()].clone();
        self.stats_broker = self.stats_broker.wrapping_add(1);

        let data = match serde_json::to_value(self.stats(false)) {
            Ok(data) => data,
            Err(e) => {
                self.exceptions.track("check status", &e, None);
                return;
            }
        };
        let packet = Packet::Stats(Stats {
            data,
            from: self.identity.clone(),
        });
        let options = PublishOptions::default()
            .routing_key(self.parsed.stats_routing_key())
            .on_brokers(Some(vec![broker]));
        if let Err(e) = self.pool.publish(&ExchangeSpec::stats(), &packet, &options) {
            tracing::warn!(error = %e, "Failed to publish stats");
            self.exceptions.track("check status", &e, None);
        }
    }

    fn stats(&mut self, reset: bool) -> AgentStats {
        let now = Utc::now().timestamp();
        let pool = self.pool.stats(reset);
        let stats = AgentStats {
            identity: self.identity.clone(),
            hostname: hostname(),
            version: PROTOCOL_VERSION,
            state: self.state,
            brokers: pool.brokers,
            broker_exceptions: pool.exceptions,
            agent_stats: AgentActivity {
                connect_requests: self.connect_requests.all(),
                exceptions: self.exceptions.stats(),
            },
            receive_stats: self.dispatcher.stats(reset),
            send_stats: self.proxy.stats(reset),
            last_reset_time: self.last_reset,
            stat_time: now,
            service_uptime: self.started.elapsed().as_secs(),
            machine_uptime: machine_uptime(),
        };
        if reset {
            self.connect_requests = ActivityStats::new(false);
            self.exceptions.reset();
            self.last_reset = now;
        }
        stats
    }

    /// Close (or forget) a broker; the last connected broker is kept.
    fn disconnect(&mut self, host: &str, port: u16, remove: bool) -> Option<String> {
        let id = BrokerId::new(host, port);
        let Some(status) = self.pool.status_of(&id) else {
            return Some(format!("Broker {id} is not configured"));
        };
        if status == ConnectionStatus::Connected && self.pool.connected().len() == 1 {
            let error = format!("Not disconnecting from {id} because it is the last connected broker");
            tracing::warn!("{error}");
            return Some(error);
        }

        if remove {
            self.pool.remove(host, port);
            // Withdraw the broker from routing while still reachable elsewhere.
            if status == ConnectionStatus::Connected {
                self.advertise_services(None);
            }
        } else if let Err(e) = self.pool.close_one(&id) {
            return Some(e.to_string());
        }
        None
    }

    /// A peer could not reach this agent through `ids`.
    fn connect_failed(&mut self, ids: Vec<BrokerId>) {
        tracing::info!(brokers = ?self.pool.aliases(&ids), "Peer reported failed broker connections");
        let (connected, candidates): (Vec<BrokerId>, Vec<BrokerId>) = ids
            .into_iter()
            .filter(|id| self.pool.status_of(id).is_some())
            .partition(|id| self.pool.is_connected(id));
        if !connected.is_empty() {
            tracing::info!(
                brokers = ?self.pool.aliases(&connected),
                "Not marking brokers unusable because currently connected"
            );
        }
        if let Err(e) = self.pool.declare_unusable(&candidates) {
            self.exceptions.track("connect failed", &e, None);
        }

        if self.pool.connected().is_empty() {
            tracing::warn!("No connected brokers left, reconnecting all");
            for id in self.pool.all() {
                self.reconnect(&id);
            }
        }
    }

    fn update_tags(&mut self, new_tags: Vec<String>, obsolete_tags: Vec<String>) {
        let tags = &mut self.config.tags;
        tags.retain(|tag| !obsolete_tags.contains(tag));
        for tag in &new_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let payload = json!({ "new_tags": new_tags, "obsolete_tags": obsolete_tags });
        let options = RequestOptions {
            persistent: Some(true),
            ..RequestOptions::default()
        };
        let _ = self
            .proxy
            .push(&mut self.pool, UPDATE_TAGS_ROUTE, payload, options);
    }

    /// Begin graceful termination; a second call stops immediately.
    fn terminate(&mut self) {
        match self.state {
            AgentState::Terminating => {
                tracing::info!("[stop] Terminating immediately");
                self.finish_termination();
            }
            AgentState::Stopped => {}
            _ => {
                tracing::info!("[stop] Agent terminating");
                self.state = AgentState::Terminating;
                self.un_register();
                for id in self.pool.unusable() {
                    let _ = self.pool.close_one(&id);
                }
                if let Some(shared) = self.config.shared_queue.clone() {
                    self.pool.unsubscribe(&[shared]);
                }

                let requests = self.proxy.pending_count();
                let dispatches = self.dispatcher.pending_count();
                if requests == 0 && dispatches == 0 {
                    self.finish_termination();
                    return;
                }
                let age = self
                    .proxy
                    .request_age()
                    .max(self.dispatcher.dispatch_age())
                    .unwrap_or(0);
                let wait = self
                    .config
                    .grace_timeout()
                    .saturating_sub(Duration::from_secs(age));
                tracing::info!(
                    requests,
                    dispatches,
                    wait = wait.as_secs(),
                    "[stop] Waiting for outstanding work"
                );
                self.grace_deadline = Some(Instant::now() + wait);
            }
        }
    }

    /// Finish a graceful termination once nothing is outstanding.
    fn check_drained(&mut self) {
        if self.state == AgentState::Terminating
            && self.proxy.pending_count() == 0
            && self.dispatcher.pending_count() == 0
        {
            self.finish_termination();
        }
    }

    fn finish_termination(&mut self) {
        if self.state == AgentState::Stopped {
            return;
        }
        let dropped = self.proxy.pending_count();
        if dropped > 0 {
            tracing::warn!(
                count = dropped,
                "[stop] Dropping pending requests:\n{}",
                self.proxy.dump_requests().join("\n")
            );
        }
        let abandoned = self.dispatcher.pending_count();
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "[stop] Abandoning unfinished dispatches");
        }

        self.proxy.stop();
        self.pool.close();
        self.grace_deadline = None;
        self.state = AgentState::Stopped;
        tracing::info!(identity = %self.identity, "[stop] Agent stopped");
    }
}

fn every(period: Option<Duration>) -> Option<Interval> {
    let period = period.filter(|p| !p.is_zero())?;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
