//! Run event delivery.
//!
//! The orchestrator publishes phase changes and periodic live metrics on
//! bounded channels, one per event kind, and hands the terminal outcome
//! over a oneshot. Formatting and printing happen on the receiving side,
//! away from the stream tasks.

use crate::orchestrator::Phase;
use crate::report::RunReport;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// A phase the run has entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: Phase,
    /// Milliseconds since the start of the run
    pub elapsed_ms: u64,
}

/// Snapshot of the statistics while stream phases run.
///
/// # Examples
///
/// ```
/// use pathprobe::events::{format_metrics, LiveMetrics};
/// use pathprobe::orchestrator::Phase;
///
/// let metrics = LiveMetrics {
///     phase: Phase::MeasureDownload,
///     elapsed_ms: 7_500,
///     current_mbps: 94.2,
///     download_mbps: 93.8,
///     upload_mbps: 0.0,
///     latency_ms: 12.5,
///     jitter_ms: 0.8,
///     packet_loss_percent: 0.0,
///     active_streams: 8,
/// };
/// assert!(format_metrics(&metrics).contains("94.2 Mbits/sec"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub phase: Phase,
    pub elapsed_ms: u64,
    /// Rate of the most recent window in the active direction
    pub current_mbps: f64,
    /// Median download rate so far
    pub download_mbps: f64,
    /// Median upload rate so far
    pub upload_mbps: f64,
    /// Median round-trip time so far
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub active_streams: usize,
}

/// How a run ended. Exactly one outcome is produced per run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// All phases finished; carries the final report
    Complete(Box<RunReport>),
    /// An orchestrator-level failure aborted the run
    Error(String),
    /// The run was stopped on request
    Cancelled,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunOutcome::Complete(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }

    /// The final report, if the run completed.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Complete(report) => Some(report),
            _ => None,
        }
    }
}

/// Sending half, owned by the orchestrator for the duration of one run.
#[derive(Debug)]
pub struct EventReporter {
    phases: mpsc::Sender<PhaseChange>,
    metrics: mpsc::Sender<LiveMetrics>,
    outcome: oneshot::Sender<RunOutcome>,
}

/// Receiving half, handed to whoever renders the run.
#[derive(Debug)]
pub struct RunEvents {
    pub phases: mpsc::Receiver<PhaseChange>,
    pub metrics: mpsc::Receiver<LiveMetrics>,
    pub outcome: oneshot::Receiver<RunOutcome>,
}

/// Creates the event channels of one run.
///
/// `capacity` bounds each of the phase and metrics channels; events that
/// do not fit are dropped.
pub fn channel(capacity: usize) -> (EventReporter, RunEvents) {
    let (phase_tx, phase_rx) = mpsc::channel(capacity.max(1));
    let (metrics_tx, metrics_rx) = mpsc::channel(capacity.max(1));
    let (outcome_tx, outcome_rx) = oneshot::channel();
    (
        EventReporter {
            phases: phase_tx,
            metrics: metrics_tx,
            outcome: outcome_tx,
        },
        RunEvents {
            phases: phase_rx,
            metrics: metrics_rx,
            outcome: outcome_rx,
        },
    )
}

impl EventReporter {
    /// Publishes a phase change.
    pub fn phase(&self, change: PhaseChange) {
        if let Err(e) = self.phases.try_send(change) {
            debug!("Phase event {:?} not delivered: {}", change.phase, e);
        }
    }

    /// Publishes a live metrics snapshot.
    pub fn metrics(&self, metrics: LiveMetrics) {
        if let Err(e) = self.metrics.try_send(metrics) {
            debug!("Metrics event not delivered: {}", e);
        }
    }

    /// Delivers the terminal outcome and closes every channel.
    pub fn finish(self, outcome: RunOutcome) {
        if self.outcome.send(outcome).is_err() {
            debug!("Run outcome not delivered: receiver dropped");
        }
    }
}

/// Formats a metrics snapshot as one human-readable line.
pub fn format_metrics(metrics: &LiveMetrics) -> String {
    format!(
        "[{:>16}] {:6.2} sec  {:8.1} Mbits/sec  rtt {:6.1} ms  jitter {:5.1} ms  loss {:4.1}%  streams {}",
        metrics.phase.to_string(),
        metrics.elapsed_ms as f64 / 1000.0,
        metrics.current_mbps,
        metrics.latency_ms,
        metrics.jitter_ms,
        metrics.packet_loss_percent,
        metrics.active_streams
    )
}
