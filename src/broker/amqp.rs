//! AMQP 0-9-1 transport over `lapin`.
//!
//! Each link owns one connection and one channel. Link operations are queued
//! to a worker task that applies them in order, so the coordinating loop never
//! waits on the network. A failed operation, a consumer error or a connection
//! error reports the link lost exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::connection::{
    BrokerAddress, BrokerLink, Connector, DeliverySink, LossNotifier,
};
use crate::broker::exchange::{ExchangeKind, ExchangeSpec, QueueSpec};
use crate::error::BrokerError;

/// AMQP delivery mode for messages the broker writes to disk.
const PERSISTENT_DELIVERY: u8 = 2;

/// Credentials and virtual host shared by every broker of an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat in seconds; `None` accepts the broker's.
    pub heartbeat: Option<u16>,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: None,
        }
    }
}

fn escape(part: &str) -> String {
    url::form_urlencoded::byte_serialize(part.as_bytes()).collect()
}

impl AmqpSettings {
    pub fn uri(&self, address: &BrokerAddress) -> String {
        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            escape(&self.user),
            escape(&self.password),
            address.host,
            address.port,
            escape(&self.vhost)
        );
        if let Some(heartbeat) = self.heartbeat {
            uri.push_str(&format!("?heartbeat={heartbeat}"));
        }
        uri
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

/// Reports a lost link at most once, and never after a deliberate close.
struct LossGuard {
    fired: AtomicBool,
    notify: LossNotifier,
}

impl LossGuard {
    fn lost(&self, reason: String) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.notify)(reason);
        }
    }

    fn disarm(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

enum Op {
    DeclareExchange(ExchangeSpec),
    DeclareQueue(QueueSpec),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        sink: DeliverySink,
    },
    Cancel {
        queue: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        persistent: bool,
    },
    Prefetch(u16),
    Close,
}

/// Opens links to AMQP brokers.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    settings: AmqpSettings,
}

impl AmqpConnector {
    pub fn new(settings: AmqpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        address: &BrokerAddress,
        on_loss: LossNotifier,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let id = address.id().to_string();
        let failed = |e: lapin::Error| BrokerError::ConnectFailed {
            id: id.clone(),
            reason: e.to_string(),
        };

        let connection =
            Connection::connect(&self.settings.uri(address), ConnectionProperties::default())
                .await
                .map_err(failed)?;
        let channel = connection.create_channel().await.map_err(failed)?;

        let guard = Arc::new(LossGuard {
            fired: AtomicBool::new(false),
            notify: on_loss,
        });
        let on_error = guard.clone();
        connection.on_error(move |e| on_error.lost(e.to_string()));

        let (ops, queued) = mpsc::unbounded_channel();
        tokio::spawn(drive(connection, channel, queued, guard, id.clone()));
        tracing::debug!(broker = %id, "AMQP link open");
        Ok(Arc::new(AmqpLink { id, ops }))
    }
}

/// Apply queued operations until the link closes or fails.
async fn drive(
    connection: Connection,
    channel: Channel,
    mut ops: mpsc::UnboundedReceiver<Op>,
    guard: Arc<LossGuard>,
    id: String,
) {
    let mut consumers: HashMap<String, JoinHandle<()>> = HashMap::new();
    while let Some(op) = ops.recv().await {
        if matches!(op, Op::Close) {
            break;
        }
        if let Err(e) = apply(&channel, op, &mut consumers, &guard).await {
            tracing::warn!(broker = %id, error = %e, "AMQP operation failed");
            guard.lost(e.to_string());
            break;
        }
    }

    guard.disarm();
    for (_, consumer) in consumers.drain() {
        consumer.abort();
    }
    if let Err(e) = connection.close(200, "closing").await {
        tracing::debug!(broker = %id, error = %e, "AMQP connection already closed");
    }
}

async fn apply(
    channel: &Channel,
    op: Op,
    consumers: &mut HashMap<String, JoinHandle<()>>,
    guard: &Arc<LossGuard>,
) -> Result<(), lapin::Error> {
    match op {
        Op::DeclareExchange(spec) => {
            let options = ExchangeDeclareOptions {
                durable: spec.durable,
                auto_delete: spec.auto_delete,
                ..ExchangeDeclareOptions::default()
            };
            channel
                .exchange_declare(
                    &spec.name,
                    exchange_kind(spec.kind),
                    options,
                    FieldTable::default(),
                )
                .await?;
        }
        Op::DeclareQueue(spec) => {
            let options = QueueDeclareOptions {
                durable: spec.durable,
                ..QueueDeclareOptions::default()
            };
            channel
                .queue_declare(&spec.name, options, FieldTable::default())
                .await?;
        }
        Op::Bind {
            queue,
            exchange,
            routing_key,
        } => {
            channel
                .queue_bind(
                    &queue,
                    &exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Op::Consume { queue, sink } => {
            // The queue name doubles as the consumer tag; replace any earlier one.
            if let Some(previous) = consumers.remove(&queue) {
                previous.abort();
                channel
                    .basic_cancel(&queue, BasicCancelOptions::default())
                    .await?;
            }
            let consumer = channel
                .basic_consume(
                    &queue,
                    &queue,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            let task = tokio::spawn(deliver(consumer, sink, guard.clone()));
            consumers.insert(queue, task);
        }
        Op::Cancel { queue } => {
            if let Some(consumer) = consumers.remove(&queue) {
                consumer.abort();
                channel
                    .basic_cancel(&queue, BasicCancelOptions::default())
                    .await?;
            }
        }
        Op::Publish {
            exchange,
            routing_key,
            body,
            persistent,
        } => {
            let properties = if persistent {
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY)
            } else {
                BasicProperties::default()
            };
            channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await?;
        }
        Op::Prefetch(count) => {
            channel.basic_qos(count, BasicQosOptions::default()).await?;
        }
        Op::Close => {}
    }
    Ok(())
}

/// Acknowledge and hand over each delivery of one consumer.
async fn deliver(mut consumer: Consumer, sink: DeliverySink, guard: Arc<LossGuard>) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                guard.lost(e.to_string());
                return;
            }
        };
        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
            guard.lost(e.to_string());
            return;
        }
        sink(delivery.data);
    }
}

/// A link to one AMQP broker.
pub struct AmqpLink {
    id: String,
    ops: mpsc::UnboundedSender<Op>,
}

impl AmqpLink {
    fn queue(&self, op: Op) -> Result<(), BrokerError> {
        self.ops.send(op).map_err(|_| BrokerError::Io {
            id: self.id.clone(),
            reason: "link closed".to_string(),
        })
    }
}

impl BrokerLink for AmqpLink {
    fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.queue(Op::DeclareExchange(exchange.clone()))
    }

    fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.queue(Op::DeclareQueue(queue.clone()))
    }

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.queue(Op::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    fn consume(&self, queue: &str, sink: DeliverySink) -> Result<(), BrokerError> {
        self.queue(Op::Consume {
            queue: queue.to_string(),
            sink,
        })
    }

    fn cancel(&self, queue: &str) -> Result<(), BrokerError> {
        self.queue(Op::Cancel {
            queue: queue.to_string(),
        })
    }

    fn publish(
        &self,
        exchange: &ExchangeSpec,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        self.queue(Op::Publish {
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            persistent,
        })
    }

    fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.queue(Op::Prefetch(count))
    }

    fn close(&self) {
        let _ = self.ops.send(Op::Close);
    }
}
