//! pathprobe - active quality measurement for private network paths
//!
//! This library measures throughput, latency, jitter, packet loss and an
//! aggregate stability score between a client and a pathprobe server. The
//! server exposes non-compressible download streams, an upload sink and a
//! WebSocket echo; the client drives them through a fixed sequence of
//! phases and turns the raw samples into statistics.
//!
//! # Features
//!
//! - Multi-stream download and upload phases with a concurrency cap
//! - Echo probes with per-probe timeouts for RTT, jitter and loss
//! - Rolling-window throughput with interpolated percentiles
//! - Cooperative cancellation of a run at any point
//! - Phase, live metric and outcome events over bounded channels
//! - JSON run reports with the raw sample lists
//! - Asynchronous I/O using tokio

pub mod config;
pub mod echo;
pub mod error;
pub mod events;
pub mod measurements;
pub mod orchestrator;
pub mod payload;
pub mod protocol;
pub mod report;
pub mod server;
pub mod stream_manager;
pub mod transport;

pub use config::{Config, Mode, ServerProfile};
pub use error::{Error, Result};
pub use events::{EventReporter, LiveMetrics, PhaseChange, RunEvents, RunOutcome};
pub use measurements::{Measurements, MeasurementsCollector};
pub use orchestrator::{Orchestrator, Phase, RunState};
pub use report::RunReport;
pub use server::Server;
pub use transport::{HttpTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
