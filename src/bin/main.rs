use clap::{Parser, Subcommand};
use log::{info, warn};
use pathprobe::events::{self, format_metrics};
use pathprobe::{Config, Orchestrator, RunOutcome, Server, ServerProfile};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pathprobe")]
#[command(about = "Active quality measurement of private network paths", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<String>,

        /// Concurrency advertised to clients
        #[arg(short = 'P', long, default_value = "8")]
        max_concurrency: usize,

        /// Payload chunk size in bytes
        #[arg(short = 'l', long, default_value = "65536")]
        chunk_size: usize,

        /// Use the secure profile (100 MB upload ceiling)
        #[arg(long)]
        secure: bool,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Measurement duration per direction in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Output the final report in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            max_concurrency,
            chunk_size,
            secure,
        } => {
            let profile = if secure {
                ServerProfile::Secure
            } else {
                ServerProfile::Basic
            };

            let mut config = Config::server(port)
                .with_profile(profile)
                .with_max_concurrency(max_concurrency)
                .with_chunk_size(chunk_size);

            if let Some(bind_addr) = bind {
                config.bind_addr = Some(bind_addr.parse()?);
            }

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    trigger.cancel();
                }
            });

            let server = Server::new(config)?;
            server.run_until(shutdown).await?;
        }

        Commands::Client {
            server,
            port,
            time,
            json,
        } => {
            let config = Config::client(server, port)
                .with_measure_duration(Duration::from_secs(time))
                .with_json(json);
            let capacity = config.event_capacity;

            let orchestrator = Orchestrator::from_config(config)?;

            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run");
                    cancel.cancel();
                }
            });

            let (reporter, run_events) = events::channel(capacity);
            let events::RunEvents {
                mut phases,
                mut metrics,
                outcome: _,
            } = run_events;

            if !json {
                tokio::spawn(async move {
                    while let Some(change) = phases.recv().await {
                        println!(
                            "[{:6.2} sec] entering {}",
                            change.elapsed_ms as f64 / 1000.0,
                            change.phase
                        );
                    }
                });
                tokio::spawn(async move {
                    while let Some(update) = metrics.recv().await {
                        println!("{}", format_metrics(&update));
                    }
                });
            }

            match orchestrator.run(reporter).await {
                RunOutcome::Complete(report) => {
                    if json {
                        println!("{}", report.to_json()?);
                    } else {
                        println!("{}", report);
                    }
                }
                RunOutcome::Cancelled => {
                    println!("Run cancelled");
                }
                RunOutcome::Error(msg) => {
                    anyhow::bail!("run failed: {}", msg);
                }
            }
        }
    }

    Ok(())
}
