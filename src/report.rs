//! Final run artifacts.

use crate::echo::EchoStats;
use crate::measurements::{
    stability_score, JitterSummary, LatencySummary, Measurements, RttSample, ThroughputSample,
    ThroughputSummary,
};
use crate::orchestrator::Phase;
use crate::protocol::{Capabilities, Direction};
use crate::stream_manager::BatchReport;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity and context of a run.
#[derive(Debug, Clone)]
pub struct RunHeader {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub capabilities: Option<Capabilities>,
    pub concurrency: usize,
}

/// Measured figures for one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionSummary {
    pub direction: Direction,
    pub throughput: ThroughputSummary,
    /// Bytes recorded during the measurement phase
    pub bytes: u64,
    pub streams: usize,
    pub failed_streams: usize,
}

/// Everything a run produced: summaries plus the raw samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub capabilities: Option<Capabilities>,
    pub concurrency: usize,
    pub download: DirectionSummary,
    pub upload: DirectionSummary,
    pub latency: LatencySummary,
    pub jitter: JitterSummary,
    pub packet_loss_percent: f64,
    pub stability_score: u8,
    pub echoes_sent: u64,
    pub echoes_lost: u64,
    /// Probes matched to a response
    pub echoes_answered: u64,
    /// Responses that matched no pending probe
    pub echoes_unmatched: u64,
    /// Probes still in flight when the echo loop stopped
    pub echoes_abandoned: u64,
    pub throughput_samples: Vec<ThroughputSample>,
    pub rtt_samples: Vec<RttSample>,
}

/// Kind of a flattened sample row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Throughput,
    Rtt,
}

/// One sample as a flat record, for tabular export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub kind: SampleKind,
    pub timestamp_ms: u64,
    pub stream_id: Option<u32>,
    pub direction: Option<Direction>,
    pub phase: Option<Phase>,
    pub bytes: Option<u64>,
    pub rtt_ms: Option<f64>,
}

impl RunReport {
    /// Builds the report of a finished run.
    ///
    /// Per-direction summaries only use samples tagged with that
    /// direction's measurement phase, without any timestamp offset; ramp
    /// samples never reach them.
    pub fn from_measurements(
        header: RunHeader,
        measurements: &Measurements,
        batches: &[BatchReport],
        window: Duration,
        echo: EchoStats,
    ) -> Self {
        let download = direction_summary(measurements, batches, Phase::MeasureDownload, window);
        let upload = direction_summary(measurements, batches, Phase::MeasureUpload, window);
        let latency = measurements.latency_summary();
        let stability = stability_score(&download.throughput, &latency);

        Self {
            run_id: header.run_id,
            started_at: header.started_at,
            duration_ms: header.duration_ms,
            capabilities: header.capabilities,
            concurrency: header.concurrency,
            download,
            upload,
            latency,
            jitter: measurements.jitter_summary(),
            packet_loss_percent: measurements.packet_loss_percent(),
            stability_score: stability,
            echoes_sent: measurements.echoes_sent(),
            echoes_lost: measurements.echoes_lost(),
            echoes_answered: echo.answered,
            echoes_unmatched: echo.unmatched,
            echoes_abandoned: echo.abandoned,
            throughput_samples: measurements.throughput_samples().to_vec(),
            rtt_samples: measurements.rtt_samples().to_vec(),
        }
    }

    /// Flattens both sample lists into rows ordered by timestamp.
    pub fn rows(&self) -> Vec<SampleRow> {
        let throughput = self.throughput_samples.iter().map(|s| SampleRow {
            kind: SampleKind::Throughput,
            timestamp_ms: s.timestamp_ms,
            stream_id: Some(s.stream_id),
            direction: Some(s.direction),
            phase: Some(s.phase),
            bytes: Some(s.bytes),
            rtt_ms: None,
        });
        let rtt = self.rtt_samples.iter().map(|s| SampleRow {
            kind: SampleKind::Rtt,
            timestamp_ms: s.timestamp_ms,
            stream_id: None,
            direction: None,
            phase: None,
            bytes: None,
            rtt_ms: Some(s.rtt_ms),
        });
        let mut rows: Vec<SampleRow> = throughput.chain(rtt).collect();
        rows.sort_by_key(|r| r.timestamp_ms);
        rows
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn direction_summary(
    measurements: &Measurements,
    batches: &[BatchReport],
    phase: Phase,
    window: Duration,
) -> DirectionSummary {
    let direction = phase.direction().unwrap_or(Direction::Download);
    let throughput = measurements.throughput_summary(|s| s.phase == phase, Duration::ZERO, window);
    let bytes = measurements
        .throughput_samples()
        .iter()
        .filter(|s| s.phase == phase)
        .map(|s| s.bytes)
        .sum();
    let batch = batches.iter().find(|b| b.phase == phase);
    DirectionSummary {
        direction,
        throughput,
        bytes,
        streams: batch.map(|b| b.requested).unwrap_or(0),
        failed_streams: batch.map(|b| b.failed).unwrap_or(0),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.2} GBytes", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.2} MBytes", bytes as f64 / 1_000_000.0)
    } else {
        format!("{:.2} KBytes", bytes as f64 / 1_000.0)
    }
}

impl fmt::Display for DirectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<9} {:>12}  median {:8.2}  p95 {:8.2}  p99 {:8.2}  avg {:8.2}  max {:8.2} Mbits/sec  [{} streams, {} failed]",
            self.direction.to_string(),
            format_bytes(self.bytes),
            self.throughput.median_mbps,
            self.throughput.p95_mbps,
            self.throughput.p99_mbps,
            self.throughput.avg_mbps,
            self.throughput.max_mbps,
            self.streams,
            self.failed_streams
        )
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "- - - - - - - - - - - - - - - - - - - - - - - - -")?;
        writeln!(f, "Run {} ({} streams)", self.run_id, self.concurrency)?;
        writeln!(f, "{}", self.download)?;
        writeln!(f, "{}", self.upload)?;
        writeln!(
            f,
            "latency   min {:.2}  avg {:.2}  median {:.2}  p95 {:.2}  p99 {:.2} ms",
            self.latency.min_ms,
            self.latency.avg_ms,
            self.latency.median_ms,
            self.latency.p95_ms,
            self.latency.p99_ms
        )?;
        writeln!(
            f,
            "jitter    {:.2} ms (p95 {:.2} ms)",
            self.jitter.mean_ms, self.jitter.p95_ms
        )?;
        writeln!(
            f,
            "loss      {:.2}% ({}/{} echoes)",
            self.packet_loss_percent, self.echoes_lost, self.echoes_sent
        )?;
        write!(f, "stability {}/100", self.stability_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RunHeader {
        RunHeader {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 20_000,
            capabilities: None,
            concurrency: 4,
        }
    }

    fn sample(bytes: u64, timestamp_ms: u64, direction: Direction, phase: Phase) -> ThroughputSample {
        ThroughputSample {
            bytes,
            timestamp_ms,
            stream_id: 0,
            direction,
            phase,
        }
    }

    #[test]
    fn test_ramp_samples_excluded_from_final_summary() {
        let mut m = Measurements::new();
        // A huge ramp burst would dominate if it leaked into the summary.
        m.record_throughput(sample(100_000_000, 0, Direction::Download, Phase::Ramp));
        m.record_throughput(sample(125_000, 1_000, Direction::Download, Phase::MeasureDownload));
        m.record_throughput(sample(250_000, 5_000, Direction::Upload, Phase::MeasureUpload));

        let report = RunReport::from_measurements(
            header(),
            &m,
            &[],
            Duration::from_millis(1000),
            EchoStats::default(),
        );
        assert_eq!(report.download.throughput.max_mbps, 1.0);
        assert_eq!(report.download.bytes, 125_000);
        assert_eq!(report.upload.throughput.max_mbps, 2.0);
        assert_eq!(report.upload.direction, Direction::Upload);
        assert_eq!(report.throughput_samples.len(), 3);
    }

    #[test]
    fn test_empty_run_reports_zeros() {
        let report = RunReport::from_measurements(
            header(),
            &Measurements::new(),
            &[],
            Duration::from_millis(1000),
            EchoStats::default(),
        );
        assert_eq!(report.download.throughput, ThroughputSummary::default());
        assert_eq!(report.packet_loss_percent, 0.0);
        assert_eq!(report.stability_score, 100);
    }

    #[test]
    fn test_echo_counters_are_carried() {
        let echo = EchoStats {
            sent: 40,
            answered: 36,
            lost: 2,
            unmatched: 1,
            abandoned: 2,
            channel_lost: false,
        };
        let report = RunReport::from_measurements(
            header(),
            &Measurements::new(),
            &[],
            Duration::from_millis(1000),
            echo,
        );
        assert_eq!(report.echoes_answered, 36);
        assert_eq!(report.echoes_unmatched, 1);
        assert_eq!(report.echoes_abandoned, 2);
    }

    #[test]
    fn test_rows_are_time_ordered() {
        let mut m = Measurements::new();
        m.record_throughput(sample(1000, 500, Direction::Download, Phase::Ramp));
        m.record_rtt(12.5, 250);
        m.record_throughput(sample(2000, 750, Direction::Download, Phase::Ramp));

        let report = RunReport::from_measurements(
            header(),
            &m,
            &[],
            Duration::from_millis(1000),
            EchoStats::default(),
        );
        let rows = report.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, SampleKind::Rtt);
        assert_eq!(rows[0].rtt_ms, Some(12.5));
        assert_eq!(rows[1].bytes, Some(1000));
        assert_eq!(rows[2].phase, Some(Phase::Ramp));
    }

    #[test]
    fn test_json_export() {
        let report = RunReport::from_measurements(
            header(),
            &Measurements::new(),
            &[],
            Duration::from_millis(1000),
            EchoStats::default(),
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["concurrency"], 4);
        assert_eq!(value["echoes_abandoned"], 0);
        assert_eq!(value["download"]["direction"], "download");
        assert!(value["throughput_samples"].as_array().unwrap().is_empty());
    }
}
