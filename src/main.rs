//! Courier agent - main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use courier::{
    actors::AgentManager,
    agent::Agent,
    broker::{
        BrokerAddress, Connector,
        amqp::AmqpConnector,
        memory::{MemoryBroker, MemoryConnector},
    },
    config::{AgentConfig, Transport},
};

#[derive(Parser, Debug)]
#[command(name = "courier-agent")]
#[command(about = "Messaging agent serving actors over a pool of brokers")]
#[command(version)]
struct Args {
    /// Configuration file path (optional, uses env vars by default)
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Agent identity, overriding the configuration
    #[arg(long)]
    identity: Option<String>,

    /// Broker address as host[:port]; repeat for several brokers
    #[arg(long = "broker")]
    brokers: Vec<String>,

    /// Broker transport: amqp or memory
    #[arg(long)]
    transport: Option<Transport>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(identity) = args.identity {
        config.identity = Some(identity);
    }
    if !args.brokers.is_empty() {
        config.brokers = args.brokers;
    }

    if let Some(transport) = args.transport {
        config.transport = transport;
    }

    let connector: Arc<dyn Connector> = match config.transport {
        Transport::Amqp => Arc::new(AmqpConnector::new(config.amqp_settings())),
        // Every configured address gets its own in-process broker.
        Transport::Memory => Arc::new(config.broker_addresses()?.iter().fold(
            MemoryConnector::new(),
            |connector, address: &BrokerAddress| {
                connector.with_broker(address.host.clone(), address.port, MemoryBroker::new())
            },
        )),
    };
    tracing::info!(transport = ?config.transport, brokers = ?config.brokers, "Using broker transport");

    let mut agent = Agent::new(config, connector)?;
    let handle = agent.handle();
    agent.register(Arc::new(AgentManager::new(handle.clone())), None);
    tracing::info!(identity = %agent.identity(), "Agent initialized, starting main loop...");

    tokio::spawn(async move {
        // First Ctrl-C drains outstanding work, the second stops at once.
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            if handle.terminate().is_err() {
                break;
            }
        }
    });

    agent.run().await?;

    tracing::info!("Agent shutdown complete");
    Ok(())
}
