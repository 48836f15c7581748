//! Data-plane server.
//!
//! Serves the capability descriptor, bounded download streams, the upload
//! sink and the echo WebSocket on one HTTP listener.

mod download;
mod echo;
pub mod stats;
mod upload;

use crate::config::Config;
use crate::payload::PayloadGenerator;
use crate::protocol::{
    Capabilities, CAPABILITIES_PATH, DOWNLOAD_PATH, ECHO_PATH, MAX_DOWNLOAD_SECS, PROTOCOL_VERSION,
    UPLOAD_PATH,
};
use crate::Result;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use stats::{ServerStats, StatsSnapshot, StreamKind};

/// State shared by every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<Config>,
    payload: Arc<PayloadGenerator>,
    stats: Arc<ServerStats>,
}

/// Measurement server.
///
/// # Examples
///
/// ```no_run
/// use pathprobe::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(8080);
/// let server = Server::new(config)?;
///
/// println!("Starting server on port 8080...");
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    state: AppState,
}

impl Server {
    /// Creates a server from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when the configuration fails
    /// validation.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let payload = PayloadGenerator::new(config.chunk_size, config.payload_refresh_probability);
        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                payload: Arc::new(payload),
                stats: Arc::new(ServerStats::new()),
            },
        })
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Live counters of this server.
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.state.stats)
    }

    /// The descriptor returned by the capabilities route.
    pub fn capabilities(&self) -> Capabilities {
        describe(&self.state.config)
    }

    /// Routes of the data plane.
    pub fn router(&self) -> Router {
        Router::new()
            .route(CAPABILITIES_PATH, get(capabilities))
            .route(DOWNLOAD_PATH, get(download::download))
            .route(
                UPLOAD_PATH,
                post(upload::upload).layer(DefaultBodyLimit::disable()),
            )
            .route(ECHO_PATH, get(echo::echo))
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until the process ends.
    pub async fn run(&self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let config = &self.state.config;
        let ip = config
            .bind_addr
            .unwrap_or_else(|| std::net::Ipv4Addr::UNSPECIFIED.into());
        let listener = TcpListener::bind(SocketAddr::new(ip, config.port)).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let config = &self.state.config;
        info!(
            "pathprobe server listening on {} ({:?} profile, {} streams advertised)",
            listener.local_addr()?,
            config.profile,
            config.max_concurrency
        );
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("Server stopped");
        Ok(())
    }
}

fn describe(config: &Config) -> Capabilities {
    Capabilities {
        version: PROTOCOL_VERSION,
        max_concurrency: config.max_concurrency,
        chunk_size: config.chunk_size,
        echo_supported: true,
        server_time_ms: chrono::Utc::now().timestamp_millis(),
        download_ceiling: config.download_ceiling,
        upload_ceiling: config.upload_ceiling,
        max_duration_secs: MAX_DOWNLOAD_SECS,
    }
}

async fn capabilities(State(state): State<AppState>) -> Json<Capabilities> {
    Json(describe(&state.config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerProfile;

    #[test]
    fn test_capabilities_reflect_config() {
        let server = Server::new(
            Config::server(0)
                .with_max_concurrency(6)
                .with_profile(ServerProfile::Secure),
        )
        .unwrap();
        let caps = server.capabilities();
        assert_eq!(caps.version, PROTOCOL_VERSION);
        assert_eq!(caps.max_concurrency, 6);
        assert_eq!(caps.upload_ceiling, 100_000_000);
        assert_eq!(caps.max_duration_secs, 120);
        assert!(caps.echo_supported);
        assert!(caps.server_time_ms > 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(Server::new(Config::server(0).with_chunk_size(0)).is_err());
    }
}
