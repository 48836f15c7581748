//! Statistics engine.
//!
//! Raw samples go in, throughput / latency / jitter / loss / stability
//! figures come out. Every calculator is a pure function over the samples
//! it is given; none of them reorder or otherwise touch the stored lists.

use crate::orchestrator::Phase;
use crate::protocol::Direction;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bytes moved by one stream during one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub bytes: u64,
    /// Milliseconds since the start of the run
    pub timestamp_ms: u64,
    pub stream_id: u32,
    pub direction: Direction,
    pub phase: Phase,
}

/// Round-trip time of one matched echo probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttSample {
    pub rtt_ms: f64,
    /// Milliseconds since the start of the run
    pub timestamp_ms: u64,
}

/// Summary of the rolling-window throughput rates, in Mbps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub median_mbps: f64,
    pub p95_mbps: f64,
    pub p99_mbps: f64,
    pub avg_mbps: f64,
    pub max_mbps: f64,
    /// Number of window rates the figures were computed from
    pub windows: usize,
}

/// Round-trip latency summary, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

/// Jitter summary, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JitterSummary {
    /// Current RFC 3550 estimate
    pub mean_ms: f64,
    /// 95th percentile of the successive RTT differences
    pub p95_ms: f64,
}

/// Linear-interpolated percentile of an ascending slice.
///
/// The rank is `p / 100 * (len - 1)`; a fractional rank interpolates between
/// its floor and ceiling elements. An empty slice yields `0.0`.
///
/// # Examples
///
/// ```
/// use pathprobe::measurements::percentile;
///
/// let sorted = [10.0, 20.0, 30.0, 40.0];
/// assert_eq!(percentile(&sorted, 0.0), 10.0);
/// assert_eq!(percentile(&sorted, 50.0), 25.0);
/// assert_eq!(percentile(&sorted, 100.0), 40.0);
/// ```
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = p.clamp(0.0, 100.0) / 100.0 * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let weight = rank - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * weight
            }
        }
    }
}

/// Converts a byte count over `window` into megabits per second.
pub fn mbps(bytes: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0 / 1_000_000.0) / secs
    } else {
        0.0
    }
}

/// Computes one rate per anchor sample.
///
/// Samples are ordered by timestamp, those closer than `warmup_offset` to
/// the first sample are dropped, and each remaining sample anchors a
/// window `[t, t + window)` whose byte total becomes one Mbps figure.
pub fn window_rates(
    samples: &[ThroughputSample],
    warmup_offset: Duration,
    window: Duration,
) -> Vec<f64> {
    if samples.is_empty() || window.is_zero() {
        return Vec::new();
    }

    let mut sorted: Vec<(u64, u64)> = samples.iter().map(|s| (s.timestamp_ms, s.bytes)).collect();
    sorted.sort_by_key(|(ts, _)| *ts);

    let first = sorted[0].0;
    let offset_ms = warmup_offset.as_millis() as u64;
    let kept: Vec<(u64, u64)> = sorted
        .into_iter()
        .filter(|(ts, _)| ts - first >= offset_ms)
        .collect();

    let window_ms = window.as_millis() as u64;
    kept.iter()
        .map(|(anchor, _)| {
            let start = kept.partition_point(|(ts, _)| ts < anchor);
            let end = kept.partition_point(|(ts, _)| *ts < anchor + window_ms);
            let bytes: u64 = kept[start..end].iter().map(|(_, b)| b).sum();
            mbps(bytes, window)
        })
        .collect()
}

/// Summarizes throughput samples into median / p95 / p99 / average / max.
///
/// An empty sample set yields an all-zero summary.
pub fn summarize_throughput(
    samples: &[ThroughputSample],
    warmup_offset: Duration,
    window: Duration,
) -> ThroughputSummary {
    let mut rates = window_rates(samples, warmup_offset, window);
    if rates.is_empty() {
        return ThroughputSummary::default();
    }
    rates.sort_by(|a, b| a.total_cmp(b));

    let avg = rates.iter().sum::<f64>() / rates.len() as f64;
    ThroughputSummary {
        median_mbps: percentile(&rates, 50.0),
        p95_mbps: percentile(&rates, 95.0),
        p99_mbps: percentile(&rates, 99.0),
        avg_mbps: avg,
        max_mbps: rates[rates.len() - 1],
        windows: rates.len(),
    }
}

/// Summarizes round-trip samples.
pub fn summarize_latency(samples: &[RttSample]) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    let mut rtts: Vec<f64> = samples.iter().map(|s| s.rtt_ms).collect();
    rtts.sort_by(|a, b| a.total_cmp(b));

    LatencySummary {
        min_ms: rtts[0],
        avg_ms: rtts.iter().sum::<f64>() / rtts.len() as f64,
        median_ms: percentile(&rtts, 50.0),
        p95_ms: percentile(&rtts, 95.0),
        p99_ms: percentile(&rtts, 99.0),
        samples: rtts.len(),
    }
}

/// Loss ratio in percent; no probes sent means no loss.
pub fn packet_loss_percent(sent: u64, lost: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        lost as f64 / sent as f64 * 100.0
    }
}

/// Composite 0-100 score of throughput variability and tail latency.
///
/// # Examples
///
/// ```
/// use pathprobe::measurements::{stability_score, LatencySummary, ThroughputSummary};
///
/// let idle = stability_score(&ThroughputSummary::default(), &LatencySummary::default());
/// assert_eq!(idle, 100);
/// ```
pub fn stability_score(throughput: &ThroughputSummary, latency: &LatencySummary) -> u8 {
    let cv = if throughput.avg_mbps > 0.0 {
        (throughput.median_mbps - throughput.avg_mbps).abs() / throughput.avg_mbps
    } else {
        0.0
    };
    let latency_penalty = (latency.p95_ms / 10.0).min(50.0);
    let score = (100.0 - cv * 100.0 - latency_penalty).clamp(0.0, 100.0);
    score.round() as u8
}

/// Recursive jitter estimator (RFC 3550, section 6.4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JitterEstimator {
    previous_rtt: Option<f64>,
    estimate: f64,
    deltas: Vec<f64>,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one RTT. The first value only primes the estimator.
    pub fn update(&mut self, rtt_ms: f64) {
        if let Some(previous) = self.previous_rtt {
            let d = (rtt_ms - previous).abs();
            self.estimate += (d - self.estimate) / 16.0;
            self.deltas.push(d);
        }
        self.previous_rtt = Some(rtt_ms);
    }

    /// Current smoothed estimate in milliseconds.
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// All successive differences recorded so far.
    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    pub fn summary(&self) -> JitterSummary {
        let mut sorted = self.deltas.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        JitterSummary {
            mean_ms: self.estimate,
            p95_ms: percentile(&sorted, 95.0),
        }
    }
}

/// Accumulated sample state of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurements {
    throughput: Vec<ThroughputSample>,
    rtt: Vec<RttSample>,
    jitter: JitterEstimator,
    echoes_sent: u64,
    echoes_lost: u64,
    #[serde(skip)]
    sealed: bool,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a throughput sample unless the state is sealed.
    pub fn record_throughput(&mut self, sample: ThroughputSample) -> bool {
        if self.sealed {
            return false;
        }
        self.throughput.push(sample);
        true
    }

    /// Appends an RTT sample and feeds the jitter estimator.
    pub fn record_rtt(&mut self, rtt_ms: f64, timestamp_ms: u64) -> bool {
        if self.sealed {
            return false;
        }
        self.rtt.push(RttSample {
            rtt_ms,
            timestamp_ms,
        });
        self.jitter.update(rtt_ms);
        true
    }

    pub fn record_echo_sent(&mut self) -> bool {
        if self.sealed {
            return false;
        }
        self.echoes_sent += 1;
        true
    }

    pub fn record_echo_lost(&mut self) -> bool {
        if self.sealed {
            return false;
        }
        self.echoes_lost += 1;
        true
    }

    /// Stops accepting samples; everything recorded so far stays readable.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn throughput_samples(&self) -> &[ThroughputSample] {
        &self.throughput
    }

    pub fn rtt_samples(&self) -> &[RttSample] {
        &self.rtt
    }

    pub fn echoes_sent(&self) -> u64 {
        self.echoes_sent
    }

    pub fn echoes_lost(&self) -> u64 {
        self.echoes_lost
    }

    /// Throughput summary over the samples matching `filter`.
    pub fn throughput_summary<F>(
        &self,
        filter: F,
        warmup_offset: Duration,
        window: Duration,
    ) -> ThroughputSummary
    where
        F: Fn(&ThroughputSample) -> bool,
    {
        let selected: Vec<ThroughputSample> =
            self.throughput.iter().filter(|s| filter(s)).copied().collect();
        summarize_throughput(&selected, warmup_offset, window)
    }

    /// Rate of the most recent window for one direction, in Mbps.
    pub fn current_rate_mbps(&self, direction: Direction, window: Duration) -> f64 {
        let latest = self
            .throughput
            .iter()
            .filter(|s| s.direction == direction)
            .map(|s| s.timestamp_ms)
            .max();
        let Some(latest) = latest else {
            return 0.0;
        };
        let window_ms = window.as_millis() as u64;
        let bytes: u64 = self
            .throughput
            .iter()
            .filter(|s| s.direction == direction && s.timestamp_ms + window_ms > latest)
            .map(|s| s.bytes)
            .sum();
        mbps(bytes, window)
    }

    pub fn latency_summary(&self) -> LatencySummary {
        summarize_latency(&self.rtt)
    }

    pub fn jitter_summary(&self) -> JitterSummary {
        self.jitter.summary()
    }

    pub fn packet_loss_percent(&self) -> f64 {
        packet_loss_percent(self.echoes_sent, self.echoes_lost)
    }

    /// Total bytes recorded for one stream of one direction.
    pub fn stream_bytes(&self, direction: Direction, stream_id: u32) -> u64 {
        self.throughput
            .iter()
            .filter(|s| s.direction == direction && s.stream_id == stream_id)
            .map(|s| s.bytes)
            .sum()
    }
}

/// Thread-safe measurements collector shared by stream tasks and the echo loop.
///
/// A collector built with [`sealed_on`](Self::sealed_on) seals itself the
/// moment its token is cancelled: a record call that observes the
/// cancellation is refused, whichever task makes it.
#[derive(Debug, Clone, Default)]
pub struct MeasurementsCollector {
    inner: Arc<Mutex<Measurements>>,
    seal_on: Option<CancellationToken>,
}

impl MeasurementsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector that stops accepting samples once `token` fires.
    pub fn sealed_on(token: CancellationToken) -> Self {
        Self {
            inner: Arc::default(),
            seal_on: Some(token),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Measurements> {
        let mut guard = self.inner.lock();
        if !guard.is_sealed() && self.seal_on.as_ref().is_some_and(|t| t.is_cancelled()) {
            guard.seal();
        }
        guard
    }

    pub fn record_throughput(&self, sample: ThroughputSample) -> bool {
        self.lock().record_throughput(sample)
    }

    pub fn record_rtt(&self, rtt_ms: f64, timestamp_ms: u64) -> bool {
        self.lock().record_rtt(rtt_ms, timestamp_ms)
    }

    pub fn record_echo_sent(&self) -> bool {
        self.lock().record_echo_sent()
    }

    pub fn record_echo_lost(&self) -> bool {
        self.lock().record_echo_lost()
    }

    pub fn seal(&self) {
        self.inner.lock().seal();
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().is_sealed()
    }

    /// Runs `f` against the current state without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&Measurements) -> R) -> R {
        f(&self.lock())
    }

    /// Snapshot of the accumulated state.
    pub fn get(&self) -> Measurements {
        self.lock().clone()
    }
}
