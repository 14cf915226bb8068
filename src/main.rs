//! CLI for memq
//!
//! Subcommands:
//! - `consume`: run the memory worker until Ctrl-C or SIGTERM
//! - `publish`: enqueue a single memory message
//! - `declare`: declare the exchange, queue and binding, then exit

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use memq::broker::amqp::AmqpConnector;
use memq::client::{ConnectionManager, Producer, connection};
use memq::config::{Settings, load_config};
use memq::consumer::{Consumer, JournalProcessor};
use memq::transport::{MemoryMessage, MessageKind};
use memq::utils::{Result, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "memq", version, about = "Asynchronous memory offload over AMQP")]
struct Cli {
    /// Log level used when RUST_LOG is unset (overrides `log.level`)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume memory messages and append them to the journal
    Consume {
        /// Journal file (defaults to `memory.journal_path`)
        #[arg(long)]
        journal: Option<String>,
    },
    /// Publish one memory message
    Publish {
        /// Message type: extract or summarize
        #[arg(long = "type")]
        kind: MessageKind,
        #[arg(long)]
        text: String,
        /// Unix timestamp in seconds (defaults to now)
        #[arg(long)]
        ts: Option<f64>,
    },
    /// Declare the topology and exit
    Declare,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init(cli.log_level.as_deref().unwrap_or("info"));
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log.level));

    let outcome = match cli.command {
        Command::Consume { journal } => run_consumer(&settings, journal).await,
        Command::Publish { kind, text, ts } => run_publish(&settings, kind, text, ts).await,
        Command::Declare => run_declare(&settings).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("memq failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_consumer(settings: &Settings, journal: Option<String>) -> Result<()> {
    let path = journal.unwrap_or_else(|| settings.memory.journal_path.clone());
    info!(journal = %path, "starting memory consumer");

    let consumer = Consumer::from_settings(settings, JournalProcessor::new(path));
    consumer.run(shutdown_signal()).await
}

async fn run_publish(
    settings: &Settings,
    kind: MessageKind,
    text: String,
    ts: Option<f64>,
) -> Result<()> {
    let mut message = MemoryMessage::new(kind, text);
    if let Some(ts) = ts {
        message = message.with_timestamp(ts);
    }

    connection::shared(settings)
        .scope(|connections| async move { Producer::new(connections).send(&message).await })
        .await
}

async fn run_declare(settings: &Settings) -> Result<()> {
    let connections = ConnectionManager::<AmqpConnector>::from_settings(settings);
    let declared = connections.acquire().await;
    connections.close().await;
    declared?;

    let topology = connections.topology();
    info!(
        exchange = %topology.exchange,
        queue = %topology.queue,
        routing_key = %topology.routing_key,
        "topology declared"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received. Exiting gracefully.");
}
