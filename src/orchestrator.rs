//! Phase orchestrator.
//!
//! A run walks `idle → discovery → warmup → ramp → measure-download →
//! measure-upload → cooldown → complete`, with `error` and `cancelled`
//! reachable from every non-terminal phase. The echo loop runs beside all
//! stream phases. Every run gets a fresh [`RunState`]; nothing survives
//! from one run to the next.

use crate::config::{Config, CONCURRENCY_HARD_CAP};
use crate::echo::{run_echo_loop, EchoSettings, EchoStats};
use crate::events::{EventReporter, LiveMetrics, PhaseChange, RunOutcome};
use crate::measurements::MeasurementsCollector;
use crate::payload::PayloadGenerator;
use crate::protocol::{Capabilities, Direction};
use crate::report::{RunHeader, RunReport};
use crate::stream_manager::{BatchPlan, BatchReport, StreamManager};
use crate::transport::{EchoChannel, HttpTransport, Transport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stage of a measurement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Discovery,
    Warmup,
    Ramp,
    MeasureDownload,
    MeasureUpload,
    Cooldown,
    Complete,
    Error,
    Cancelled,
}

impl Phase {
    /// `complete`, `error` and `cancelled` end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error | Phase::Cancelled)
    }

    /// The phase that follows on the normal path.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Discovery),
            Phase::Discovery => Some(Phase::Warmup),
            Phase::Warmup => Some(Phase::Ramp),
            Phase::Ramp => Some(Phase::MeasureDownload),
            Phase::MeasureDownload => Some(Phase::MeasureUpload),
            Phase::MeasureUpload => Some(Phase::Cooldown),
            Phase::Cooldown => Some(Phase::Complete),
            Phase::Complete | Phase::Error | Phase::Cancelled => None,
        }
    }

    /// Whether a run in `self` may move to `next`.
    ///
    /// # Examples
    ///
    /// ```
    /// use pathprobe::orchestrator::Phase;
    ///
    /// assert!(Phase::Warmup.can_transition_to(Phase::Ramp));
    /// assert!(Phase::Warmup.can_transition_to(Phase::Cancelled));
    /// assert!(!Phase::Warmup.can_transition_to(Phase::MeasureUpload));
    /// assert!(!Phase::Complete.can_transition_to(Phase::Error));
    /// ```
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Phase::Error | Phase::Cancelled) || self.successor() == Some(next)
    }

    /// Direction of the traffic a stream phase moves.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Phase::Warmup | Phase::Ramp | Phase::MeasureDownload => Some(Direction::Download),
            Phase::MeasureUpload => Some(Direction::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Discovery => "discovery",
            Phase::Warmup => "warmup",
            Phase::Ramp => "ramp",
            Phase::MeasureDownload => "measure-download",
            Phase::MeasureUpload => "measure-upload",
            Phase::Cooldown => "cooldown",
            Phase::Complete => "complete",
            Phase::Error => "error",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Holds the single active phase and rejects out-of-order moves.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: Phase,
    visited: Vec<Phase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: Phase::Idle,
            visited: vec![Phase::Idle],
        }
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Every phase entered so far, in order.
    pub fn visited(&self) -> &[Phase] {
        &self.visited
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when `next` is not reachable
    /// from the current phase.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.visited.push(next);
        Ok(())
    }
}

/// All mutable state of one run.
///
/// Built fresh for every run; [`reset`](Self::reset) produces a clean
/// instance instead of clearing fields in place.
pub struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    start: Instant,
    tracker: PhaseTracker,
    collector: MeasurementsCollector,
    parent: CancellationToken,
    cancel: CancellationToken,
    echo: Option<(JoinHandle<EchoStats>, CancellationToken)>,
    echo_stats: EchoStats,
    /// Fired by the echo task when the channel dies under a live run
    echo_lost: CancellationToken,
    capabilities: Option<Capabilities>,
    concurrency: usize,
    batches: Vec<BatchReport>,
}

impl RunState {
    /// Creates the state of a new run, cancelled together with `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            start: Instant::now(),
            tracker: PhaseTracker::new(),
            collector: MeasurementsCollector::sealed_on(cancel.clone()),
            parent: parent.clone(),
            cancel,
            echo: None,
            echo_stats: EchoStats::default(),
            echo_lost: CancellationToken::new(),
            capabilities: None,
            concurrency: 0,
            batches: Vec::new(),
        }
    }

    /// Discards this run and returns a clean one under the same parent token.
    pub fn reset(self) -> Self {
        Self::new(&self.parent)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> Phase {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    pub fn collector(&self) -> &MeasurementsCollector {
        &self.collector
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Working concurrency derived during discovery.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn batches(&self) -> &[BatchReport] {
        &self.batches
    }

    pub fn echo_stats(&self) -> EchoStats {
        self.echo_stats
    }

    /// Cancels this run only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this run only; take it before handing the state
    /// to [`Orchestrator::run_with`].
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn start_echo(&mut self, channel: EchoChannel, settings: EchoSettings) {
        let token = self.cancel.child_token();
        let echo = run_echo_loop(channel, self.collector.clone(), settings, token.clone());
        let lost = self.echo_lost.clone();
        let handle = tokio::spawn(async move {
            let stats = echo.await;
            if stats.channel_lost {
                lost.cancel();
            }
            stats
        });
        self.echo = Some((handle, token));
    }

    fn check_echo(&self) -> std::result::Result<(), Stop> {
        if self.echo_lost.is_cancelled() {
            return Err(echo_lost().into());
        }
        Ok(())
    }

    async fn stop_echo(&mut self) -> EchoStats {
        if let Some((handle, token)) = self.echo.take() {
            token.cancel();
            match handle.await {
                Ok(stats) => self.echo_stats = stats,
                Err(e) => warn!("Echo loop ended abnormally: {}", e),
            }
        }
        self.echo_stats
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        if let Some((handle, token)) = self.echo.take() {
            token.cancel();
            handle.abort();
        }
    }
}

fn echo_lost() -> Error {
    Error::EchoLost("channel closed during the run".to_string())
}

/// Why a run stopped before completing.
enum Stop {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Stop::Failed(e)
    }
}

/// Drives measurement runs against one server.
///
/// # Examples
///
/// ```no_run
/// use pathprobe::{events, Config, Orchestrator};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("10.0.0.2".to_string(), 8080);
/// let orchestrator = Orchestrator::from_config(config)?;
///
/// let (reporter, mut run_events) = events::channel(64);
/// tokio::spawn(async move {
///     while let Some(change) = run_events.phases.recv().await {
///         println!("phase: {}", change.phase);
///     }
/// });
///
/// let outcome = orchestrator.run(reporter).await;
/// if let Some(report) = outcome.report() {
///     println!("{}", report);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator<T: Transport> {
    config: Config,
    transport: Arc<T>,
    cancel: Mutex<CancellationToken>,
}

impl Orchestrator<HttpTransport> {
    /// Creates an orchestrator speaking HTTP to the configured server.
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = HttpTransport::from_config(&config)?;
        Self::new(config, transport)
    }
}

impl<T: Transport> Orchestrator<T> {
    /// Creates an orchestrator over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the configuration fails validation.
    pub fn new(config: Config, transport: T) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport: Arc::new(transport),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token cancelling the run in progress and any run started before it
    /// fires.
    ///
    /// Once cancelled, the token is replaced when the next run starts, so
    /// later runs need a freshly fetched token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Builds a clean state for the next run.
    pub fn new_run(&self) -> RunState {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            debug!("Replacing the cancelled orchestrator token");
            *cancel = CancellationToken::new();
        }
        RunState::new(&cancel)
    }

    /// Performs one complete run on fresh state.
    pub async fn run(&self, reporter: EventReporter) -> RunOutcome {
        let mut state = self.new_run();
        self.run_with(&mut state, reporter).await
    }

    /// Performs one run on `state`, which should come from
    /// [`new_run`](Self::new_run).
    ///
    /// The outcome is returned and also delivered through `reporter`,
    /// exactly once either way.
    pub async fn run_with(&self, state: &mut RunState, reporter: EventReporter) -> RunOutcome {
        info!("Starting run {}", state.run_id);
        let result = self.execute(state, &reporter).await;

        state.cancel.cancel();
        state.collector.seal();
        state.stop_echo().await;

        let outcome = match result {
            Ok(report) => {
                info!("Run {} complete", state.run_id);
                RunOutcome::Complete(Box::new(report))
            }
            Err(Stop::Cancelled) => {
                if let Err(e) = state.tracker.advance(Phase::Cancelled) {
                    warn!("{}", e);
                }
                info!("Run {} cancelled", state.run_id);
                RunOutcome::Cancelled
            }
            Err(Stop::Failed(e)) => {
                if let Err(e) = state.tracker.advance(Phase::Error) {
                    warn!("{}", e);
                }
                error!("Run {} failed: {}", state.run_id, e);
                RunOutcome::Error(e.to_string())
            }
        };

        reporter.finish(outcome.clone());
        outcome
    }

    async fn execute(
        &self,
        state: &mut RunState,
        reporter: &EventReporter,
    ) -> std::result::Result<RunReport, Stop> {
        let config = &self.config;

        self.enter(state, reporter, Phase::Discovery)?;
        let capabilities = tokio::select! {
            _ = state.cancel.cancelled() => return Err(Stop::Cancelled),
            caps = self.transport.capabilities() => {
                caps.map_err(|e| Error::Discovery(e.to_string()))?
            }
        };
        let concurrency = capabilities.max_concurrency.clamp(1, CONCURRENCY_HARD_CAP);
        info!(
            "Server advertises {} streams, using {}",
            capabilities.max_concurrency, concurrency
        );
        let download_ceiling = config.download_ceiling.min(capabilities.download_ceiling);
        let upload_ceiling = config.upload_ceiling.min(capabilities.upload_ceiling);
        state.concurrency = concurrency;
        state.capabilities = Some(capabilities);

        let channel = tokio::select! {
            _ = state.cancel.cancelled() => return Err(Stop::Cancelled),
            channel = self.transport.connect_echo() => {
                channel.map_err(|e| Error::EchoConnect(e.to_string()))?
            }
        };
        state.start_echo(
            channel,
            EchoSettings {
                interval: config.echo_interval,
                timeout: config.echo_timeout,
                run_start: state.start,
            },
        );

        let manager = StreamManager::new(
            Arc::clone(&self.transport),
            Arc::new(PayloadGenerator::new(
                config.chunk_size,
                config.payload_refresh_probability,
            )),
            state.start,
            config.sample_interval,
            config.chunk_size,
        );

        let plans = [
            (
                BatchPlan {
                    direction: Direction::Download,
                    streams: (concurrency / 2).max(2),
                    duration: config.warmup_duration,
                    phase: Phase::Warmup,
                    byte_ceiling: download_ceiling,
                },
                false,
            ),
            (
                BatchPlan {
                    direction: Direction::Download,
                    streams: concurrency,
                    duration: config.ramp_duration,
                    phase: Phase::Ramp,
                    byte_ceiling: download_ceiling,
                },
                true,
            ),
            (
                BatchPlan {
                    direction: Direction::Download,
                    streams: concurrency,
                    duration: config.measure_duration,
                    phase: Phase::MeasureDownload,
                    byte_ceiling: download_ceiling,
                },
                true,
            ),
            (
                BatchPlan {
                    direction: Direction::Upload,
                    streams: concurrency,
                    duration: config.measure_duration,
                    phase: Phase::MeasureUpload,
                    byte_ceiling: upload_ceiling,
                },
                true,
            ),
        ];
        for (plan, record) in plans {
            self.run_phase(state, reporter, &manager, plan, record).await?;
        }

        self.enter(state, reporter, Phase::Cooldown)?;
        tokio::select! {
            _ = state.cancel.cancelled() => return Err(Stop::Cancelled),
            _ = state.echo_lost.cancelled() => return Err(echo_lost().into()),
            _ = time::sleep(config.cooldown) => {}
        }

        let echo = state.stop_echo().await;
        state.check_echo()?;
        state.collector.seal();
        let header = RunHeader {
            run_id: state.run_id,
            started_at: state.started_at,
            duration_ms: state.elapsed_ms(),
            capabilities: state.capabilities.clone(),
            concurrency,
        };
        let report = state.collector.with(|m| {
            RunReport::from_measurements(header, m, &state.batches, config.throughput_window, echo)
        });
        state.tracker.advance(Phase::Complete)?;
        Ok(report)
    }

    fn enter(
        &self,
        state: &mut RunState,
        reporter: &EventReporter,
        phase: Phase,
    ) -> std::result::Result<(), Stop> {
        if state.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        state.check_echo()?;
        state.tracker.advance(phase)?;
        info!("Entering {} phase", phase);
        reporter.phase(PhaseChange {
            phase,
            elapsed_ms: state.elapsed_ms(),
        });
        Ok(())
    }

    async fn run_phase(
        &self,
        state: &mut RunState,
        reporter: &EventReporter,
        manager: &StreamManager<T>,
        plan: BatchPlan,
        record: bool,
    ) -> std::result::Result<(), Stop> {
        self.enter(state, reporter, plan.phase)?;
        if plan.duration.is_zero() {
            return Ok(());
        }

        let cancel = state.cancel.clone();
        let collector = state.collector.clone();
        let echo_lost = state.echo_lost.clone();
        let report = {
            let batch = manager.run_batch(plan, record.then_some(&collector), &cancel);
            tokio::pin!(batch);

            let period = self.config.metrics_interval;
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    report = &mut batch => break Some(report),
                    _ = echo_lost.cancelled() => break None,
                    _ = ticker.tick() => {
                        reporter.metrics(self.live_metrics(state, plan.phase, manager.active_streams()));
                    }
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        let Some(report) = report else {
            return Err(self::echo_lost().into());
        };
        if report.requested > 0 && report.completed == 0 {
            warn!("Every stream of the {} phase failed", plan.phase);
        }
        state.batches.push(report);
        Ok(())
    }

    fn live_metrics(&self, state: &RunState, phase: Phase, active_streams: usize) -> LiveMetrics {
        let window = self.config.throughput_window;
        let discard = self.config.warmup_discard;
        let direction = phase.direction().unwrap_or(Direction::Download);
        let elapsed_ms = state.elapsed_ms();
        state.collector.with(|m| LiveMetrics {
            phase,
            elapsed_ms,
            current_mbps: m.current_rate_mbps(direction, window),
            download_mbps: m
                .throughput_summary(|s| s.direction == Direction::Download, discard, window)
                .median_mbps,
            upload_mbps: m
                .throughput_summary(|s| s.direction == Direction::Upload, discard, window)
                .median_mbps,
            latency_ms: m.latency_summary().median_ms,
            jitter_ms: m.jitter_summary().mean_ms,
            packet_loss_percent: m.packet_loss_percent(),
            active_streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: [Phase; 8] = [
        Phase::Idle,
        Phase::Discovery,
        Phase::Warmup,
        Phase::Ramp,
        Phase::MeasureDownload,
        Phase::MeasureUpload,
        Phase::Cooldown,
        Phase::Complete,
    ];

    #[test]
    fn test_strict_order() {
        let mut tracker = PhaseTracker::new();
        for phase in &ORDER[1..] {
            tracker.advance(*phase).unwrap();
        }
        assert_eq!(tracker.current(), Phase::Complete);
        assert_eq!(tracker.visited(), &ORDER);
    }

    #[test]
    fn test_skipping_is_rejected() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(Phase::Discovery).unwrap();
        let err = tracker.advance(Phase::Ramp).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(tracker.current(), Phase::Discovery);
    }

    #[test]
    fn test_backwards_is_rejected() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(Phase::Discovery).unwrap();
        tracker.advance(Phase::Warmup).unwrap();
        assert!(tracker.advance(Phase::Discovery).is_err());
    }

    #[test]
    fn test_error_and_cancel_from_any_live_phase() {
        for (i, phase) in ORDER[..7].iter().enumerate() {
            for terminal in [Phase::Error, Phase::Cancelled] {
                let mut tracker = PhaseTracker::new();
                for step in &ORDER[1..=i] {
                    tracker.advance(*step).unwrap();
                }
                assert_eq!(tracker.current(), *phase);
                tracker.advance(terminal).unwrap();
                assert!(tracker.current().is_terminal());
            }
        }
    }

    #[test]
    fn test_terminal_phases_are_final() {
        for terminal in [Phase::Complete, Phase::Error, Phase::Cancelled] {
            for next in ORDER.iter().chain(&[Phase::Error, Phase::Cancelled]) {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::MeasureDownload.to_string(), "measure-download");
        assert_eq!(
            serde_json::to_string(&Phase::MeasureUpload).unwrap(),
            "\"measure-upload\""
        );
        assert_eq!(Phase::MeasureUpload.direction(), Some(Direction::Upload));
        assert_eq!(Phase::Cooldown.direction(), None);
    }

    #[tokio::test]
    async fn test_reset_returns_clean_state() {
        let parent = CancellationToken::new();
        let mut state = RunState::new(&parent);
        state.tracker.advance(Phase::Discovery).unwrap();
        state.collector.record_rtt(12.0, 0);
        state.concurrency = 8;
        let old_id = state.run_id();

        let state = state.reset();
        assert_ne!(state.run_id(), old_id);
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.concurrency(), 0);
        assert!(state.collector().get().rtt_samples().is_empty());
        assert!(state.batches().is_empty());

        parent.cancel();
        assert!(state.cancel.is_cancelled());
    }

    #[test]
    fn test_run_cancel_does_not_touch_parent() {
        let parent = CancellationToken::new();
        let state = RunState::new(&parent);
        state.cancel();
        assert!(!parent.is_cancelled());
        assert!(!RunState::new(&parent).cancel.is_cancelled());
    }
}
