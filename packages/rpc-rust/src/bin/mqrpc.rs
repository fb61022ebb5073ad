//! `mqrpc` command line: run the server role or make a single call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mqrpc::config::{DEFAULT_BROKER_URL, DEFAULT_REQUEST_QUEUE};
use mqrpc::telemetry::{self, LogFormat};
use mqrpc::{
    AmqpBroker, BackoffConfig, Broker, HandlerRegistry, InMemoryBroker, RpcClient, RpcConfig,
    RpcServer,
};
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mqrpc", version, about = "Request/response RPC over a message broker")]
struct Cli {
    /// Broker URL, credentials included
    #[arg(long, env = "MQRPC_BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    broker_url: String,

    /// Shared queue requests are published to
    #[arg(long, env = "MQRPC_REQUEST_QUEUE", default_value = DEFAULT_REQUEST_QUEUE)]
    request_queue: String,

    /// Client-side deadline per request, in milliseconds
    #[arg(long, env = "MQRPC_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Server-side deadline per handler invocation, in milliseconds
    #[arg(long, env = "MQRPC_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    /// Concurrent handler invocations before the server sheds load
    #[arg(long, env = "MQRPC_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent_operations: u32,

    /// Queue receiving malformed requests (dropped when unset)
    #[arg(long, env = "MQRPC_DEAD_LETTER_QUEUE")]
    dead_letter_queue: Option<String>,

    /// Connect attempts before giving up
    #[arg(long, env = "MQRPC_CONNECT_ATTEMPTS", default_value_t = 5)]
    connect_attempts: u32,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "MQRPC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "MQRPC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Use an in-process broker instead of connecting to one
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer requests with the built-in handlers until Ctrl-C
    Serve,
    /// Send one request and print the reply body
    Call {
        /// Operation tag, e.g. NOTIFY
        operation: String,
        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
    },
}

impl Cli {
    fn config(&self) -> RpcConfig {
        RpcConfig {
            broker_url: self.broker_url.clone(),
            request_queue: self.request_queue.clone(),
            default_request_timeout: Duration::from_millis(self.timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            max_concurrent_operations: self.max_concurrent_operations,
            dead_letter_queue: self.dead_letter_queue.clone(),
            backoff: BackoffConfig {
                max_attempts: self.connect_attempts,
                ..BackoffConfig::default()
            },
            ..RpcConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_format)?;
    if let Some(addr) = cli.metrics_addr {
        telemetry::install_prometheus(addr)?;
    }

    let config = Arc::new(cli.config());
    let broker: Arc<dyn Broker> = if cli.in_memory {
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpBroker::new(config.broker_url.clone()))
    };

    match cli.command {
        Command::Serve => serve(broker, config).await,
        Command::Call { operation, payload } => {
            call(broker, config, cli.in_memory, &operation, &payload).await
        }
    }
}

async fn serve(broker: Arc<dyn Broker>, config: Arc<RpcConfig>) -> anyhow::Result<()> {
    let server = RpcServer::new(broker, config, HandlerRegistry::with_builtins());
    server
        .initialize()
        .await
        .context("failed to start server")?;
    info!(queue = server.request_queue(), "serving requests, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    server.close().await?;
    Ok(())
}

async fn call(
    broker: Arc<dyn Broker>,
    config: Arc<RpcConfig>,
    in_memory: bool,
    operation: &str,
    payload: &str,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;

    // With an in-process broker nobody else can answer, so run a server here.
    let server = if in_memory {
        let server = RpcServer::new(
            Arc::clone(&broker),
            Arc::clone(&config),
            HandlerRegistry::with_builtins(),
        );
        server.initialize().await?;
        Some(server)
    } else {
        None
    };

    let client = RpcClient::new(broker, config);
    let outcome = client.produce(operation, &payload).await;
    client.close().await?;
    if let Some(server) = server {
        server.close().await?;
    }

    let body = outcome?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
