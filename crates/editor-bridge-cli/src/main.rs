//! # editor-bridge-cli
//!
//! Command-line client for the editor bridge. Sends single requests,
//! measures round trips, and watches the link while the editor reloads.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use editor_bridge::protocol::PING_METHOD;
use editor_bridge::{
    BridgeClient, BridgeConfig, BridgeError, BridgeResult, Request, RequestOptions,
};

/// Command-line client for the editor bridge.
#[derive(Parser)]
#[command(name = "editor-bridge-cli", version, about)]
struct Cli {
    /// Path to editor-bridge.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Editor host override
    #[arg(long)]
    host: Option<String>,

    /// Editor port override
    #[arg(long)]
    port: Option<u16>,

    /// Name announced to the editor in the handshake
    #[arg(long)]
    client_name: Option<String>,

    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one request and print its result as JSON
    Send {
        /// Method name
        method: String,

        /// Params as a JSON document
        params: Option<String>,

        /// Fail immediately instead of queueing while the editor is away
        #[arg(long)]
        no_queue: bool,

        /// Response deadline override
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Correlation id to use instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// Round-trip the ping method and report the latency
    Ping,

    /// Print connection state changes until interrupted
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Block until the editor link drops and comes back
    WaitReconnect {
        #[arg(long, default_value_t = 60_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "editor_bridge=debug,editor_bridge_cli=debug"
    } else {
        "editor_bridge=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} error: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> BridgeResult<BridgeConfig> {
    let mut config = BridgeConfig::discover(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(name) = &cli.client_name {
        config.client_name.clone_from(name);
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> BridgeResult<()> {
    let config = load_config(&cli)?;
    tracing::debug!(url = %config.url(), "Loaded configuration");

    let client_name = config.client_name.clone();
    let client = BridgeClient::new(config);

    let outcome = match cli.command {
        Command::Send {
            method,
            params,
            no_queue,
            timeout_ms,
            id,
        } => {
            let params = match params.as_deref() {
                Some(raw) => serde_json::from_str(raw).map_err(|e| BridgeError::Validation {
                    reason: format!("params are not valid JSON: {e}"),
                })?,
                None => json!({}),
            };
            let mut request = Request::new(method, params);
            if let Some(id) = id {
                request = request.with_id(id);
            }
            let mut options = RequestOptions::default();
            if no_queue {
                options = options.without_queue();
            }
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }

            // Queued sends retry the connection themselves.
            if let Err(e) = client.start(&client_name).await {
                if no_queue {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Editor not reachable yet, request will be queued");
            }
            send(&client, request, options).await
        }

        Command::Ping => {
            client.start(&client_name).await?;
            let started = Instant::now();
            let result = client.call(PING_METHOD, json!({})).await;
            result.map(|value| {
                println!("{value}");
                println!("round trip: {}ms", started.elapsed().as_millis());
            })
        }

        Command::Watch { seconds } => {
            let _subscription = client.on_connection_state_change(|change| {
                match &change.reason {
                    Some(reason) => println!("{} -> {} ({reason})", change.previous, change.current),
                    None => println!("{} -> {}", change.previous, change.current),
                }
            });
            if let Err(e) = client.start(&client_name).await {
                eprintln!("initial connect failed: {e}");
            }
            match seconds {
                Some(seconds) => {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => {
                    tokio::signal::ctrl_c().await?;
                }
            }
            Ok(())
        }

        Command::WaitReconnect { timeout_ms } => {
            client.start(&client_name).await?;
            let started = Instant::now();
            client
                .wait_for_reconnect(Duration::from_millis(timeout_ms))
                .await
                .map(|()| {
                    println!("reconnected after {}ms", started.elapsed().as_millis());
                })
        }
    };

    let stats = client.queue_stats();
    tracing::debug!(
        enqueued = stats.enqueued,
        replayed = stats.replayed,
        rejected = stats.rejected,
        dropped = stats.dropped,
        expired = stats.expired,
        "Queue statistics"
    );
    client.stop();
    outcome
}

async fn send(client: &BridgeClient, request: Request, options: RequestOptions) -> BridgeResult<()> {
    let result = client.send_request(request, options).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
