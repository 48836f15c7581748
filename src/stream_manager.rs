//! Parallel stream batches.
//!
//! A batch launches N independent download or upload streams and returns
//! once every one of them has finished, failed or been cancelled. Stream
//! failures stay inside the batch: they are logged, counted and never
//! abort a sibling.

use crate::measurements::{MeasurementsCollector, ThroughputSample};
use crate::orchestrator::Phase;
use crate::payload::PayloadGenerator;
use crate::protocol::{clamp_duration_secs, stream_tag, Direction};
use crate::transport::Transport;
use crate::Result;
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// What one batch should do.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlan {
    pub direction: Direction,
    pub streams: usize,
    pub duration: Duration,
    /// Phase tag attached to recorded samples
    pub phase: Phase,
    /// Most bytes any single stream may move
    pub byte_ceiling: u64,
}

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

/// Per-stream state, owned by the manager for one batch.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub id: u32,
    pub direction: Direction,
    pub bytes: u64,
    pub state: StreamState,
    /// Transport error that ended the stream, if any
    pub error: Option<String>,
}

impl StreamHandle {
    fn open(id: u32, direction: Direction) -> Self {
        Self {
            id,
            direction,
            bytes: 0,
            state: StreamState::Open,
            error: None,
        }
    }
}

/// Result of one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub direction: Direction,
    pub phase: Phase,
    pub requested: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub duration: Duration,
    pub streams: Vec<StreamHandle>,
}

/// Accumulates bytes and turns them into one sample per interval.
///
/// Whatever is still pending when the sampler is dropped is flushed, so a
/// stream's bytes are recorded exactly once on every exit path.
struct Sampler {
    recorder: Option<MeasurementsCollector>,
    run_start: Instant,
    interval: Duration,
    last: Instant,
    pending: u64,
    total: Arc<AtomicU64>,
    stream_id: u32,
    direction: Direction,
    phase: Phase,
}

impl Sampler {
    fn add(&mut self, bytes: u64) {
        self.pending += bytes;
        self.total.fetch_add(bytes, Ordering::Relaxed);
        if self.last.elapsed() >= self.interval {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let now = Instant::now();
        if self.pending > 0 {
            if let Some(recorder) = &self.recorder {
                recorder.record_throughput(ThroughputSample {
                    bytes: self.pending,
                    timestamp_ms: now.saturating_duration_since(self.run_start).as_millis() as u64,
                    stream_id: self.stream_id,
                    direction: self.direction,
                    phase: self.phase,
                });
            }
        }
        self.pending = 0;
        self.last = now;
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Everything a stream task needs, cloned into each task.
struct StreamContext<T> {
    transport: Arc<T>,
    payload: Arc<PayloadGenerator>,
    recorder: Option<MeasurementsCollector>,
    run_start: Instant,
    sample_interval: Duration,
    chunk_size: usize,
    plan: BatchPlan,
    cancel: CancellationToken,
}

impl<T> Clone for StreamContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            payload: Arc::clone(&self.payload),
            recorder: self.recorder.clone(),
            run_start: self.run_start,
            sample_interval: self.sample_interval,
            chunk_size: self.chunk_size,
            plan: self.plan,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> StreamContext<T> {
    fn sampler(&self, stream_id: u32, total: Arc<AtomicU64>) -> Sampler {
        Sampler {
            recorder: self.recorder.clone(),
            run_start: self.run_start,
            interval: self.sample_interval,
            last: Instant::now(),
            pending: 0,
            total,
            stream_id,
            direction: self.plan.direction,
            phase: self.plan.phase,
        }
    }
}

/// Launches and joins parallel stream batches against one transport.
pub struct StreamManager<T: Transport> {
    transport: Arc<T>,
    payload: Arc<PayloadGenerator>,
    run_start: Instant,
    sample_interval: Duration,
    chunk_size: usize,
    active: Arc<AtomicUsize>,
}

impl<T: Transport> StreamManager<T> {
    pub fn new(
        transport: Arc<T>,
        payload: Arc<PayloadGenerator>,
        run_start: Instant,
        sample_interval: Duration,
        chunk_size: usize,
    ) -> Self {
        Self {
            transport,
            payload,
            run_start,
            sample_interval,
            chunk_size,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams currently open across all batches.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Runs one batch to completion.
    ///
    /// Samples go to `recorder` when one is given; pass `None` to move
    /// traffic without recording it. Cancelling `cancel` stops every
    /// stream at its next chunk boundary.
    pub async fn run_batch(
        &self,
        plan: BatchPlan,
        recorder: Option<&MeasurementsCollector>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let cancel = cancel.child_token();
        let ctx = StreamContext {
            transport: Arc::clone(&self.transport),
            payload: Arc::clone(&self.payload),
            recorder: recorder.cloned(),
            run_start: self.run_start,
            sample_interval: self.sample_interval,
            chunk_size: self.chunk_size,
            plan,
            cancel: cancel.clone(),
        };

        info!(
            "Starting {} {} stream(s) for {:.1}s ({})",
            plan.streams,
            plan.direction,
            plan.duration.as_secs_f64(),
            plan.phase
        );

        let mut tasks = JoinSet::new();
        for id in 0..plan.streams as u32 {
            let ctx = ctx.clone();
            let active = Arc::clone(&self.active);
            tasks.spawn(async move {
                active.fetch_add(1, Ordering::Relaxed);
                let handle = run_stream(ctx, id).await;
                active.fetch_sub(1, Ordering::Relaxed);
                handle
            });
        }

        let mut streams = Vec::with_capacity(plan.streams);
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(handle) => {
                    if handle.error.is_some() {
                        failed += 1;
                    }
                    streams.push(handle);
                }
                Err(e) => {
                    warn!("{} stream task aborted: {}", plan.direction, e);
                    failed += 1;
                }
            }
        }
        streams.sort_by_key(|s| s.id);

        let total_bytes = streams.iter().map(|s| s.bytes).sum();
        let report = BatchReport {
            direction: plan.direction,
            phase: plan.phase,
            requested: plan.streams,
            completed: plan.streams - failed,
            failed,
            total_bytes,
            duration: started.elapsed(),
            streams,
        };
        info!(
            "{} batch finished: {}/{} streams ok, {} bytes",
            plan.phase, report.completed, report.requested, report.total_bytes
        );
        report
    }
}

async fn run_stream<T: Transport>(ctx: StreamContext<T>, id: u32) -> StreamHandle {
    let mut handle = StreamHandle::open(id, ctx.plan.direction);
    let total = Arc::new(AtomicU64::new(0));

    let result = match ctx.plan.direction {
        Direction::Download => download(&ctx, id, Arc::clone(&total)).await,
        Direction::Upload => upload(&ctx, id, Arc::clone(&total)).await,
    };

    handle.bytes = total.load(Ordering::Relaxed);
    handle.state = StreamState::Closed;
    if let Err(e) = result {
        warn!("{} stream {} failed: {}", ctx.plan.direction, id, e);
        handle.error = Some(e.to_string());
    }
    handle
}

fn request_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    clamp_duration_secs(secs)
}

async fn download<T: Transport>(ctx: &StreamContext<T>, id: u32, total: Arc<AtomicU64>) -> Result<()> {
    let tag = stream_tag(Direction::Download, id);
    let deadline = Instant::now() + ctx.plan.duration;
    let ceiling = ctx.plan.byte_ceiling;

    let mut body = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(()),
        opened = ctx.transport.open_download(request_secs(ctx.plan.duration), &tag) => opened?,
    };

    let mut sampler = ctx.sampler(id, total);
    let mut received = 0u64;
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = time::sleep_until(deadline) => break,
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let counted = (chunk.len() as u64).min(ceiling - received);
                received += counted;
                sampler.add(counted);
                if received >= ceiling {
                    debug!("{} reached its {} byte ceiling", tag, ceiling);
                    break;
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(())
}

struct UploadSource {
    payload: Arc<PayloadGenerator>,
    chunk_size: usize,
    remaining: u64,
    deadline: Instant,
    cancel: CancellationToken,
    sampler: Sampler,
}

async fn upload<T: Transport>(ctx: &StreamContext<T>, id: u32, total: Arc<AtomicU64>) -> Result<()> {
    let tag = stream_tag(Direction::Upload, id);
    let source = UploadSource {
        payload: Arc::clone(&ctx.payload),
        chunk_size: ctx.chunk_size,
        remaining: ctx.plan.byte_ceiling,
        deadline: Instant::now() + ctx.plan.duration,
        cancel: ctx.cancel.clone(),
        sampler: ctx.sampler(id, total),
    };

    // The body is pulled by the HTTP client only when the connection can
    // take more data.
    let body = futures::stream::unfold(source, |mut src| async move {
        if src.remaining == 0 || src.cancel.is_cancelled() || Instant::now() >= src.deadline {
            src.sampler.flush();
            return None;
        }
        let len = (src.chunk_size as u64).min(src.remaining) as usize;
        let chunk = src.payload.next_chunk(len);
        src.remaining -= chunk.len() as u64;
        src.sampler.add(chunk.len() as u64);
        Some((Ok::<_, std::io::Error>(chunk), src))
    })
    .boxed();

    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(()),
        result = ctx.transport.upload(&tag, body) => {
            let result = result?;
            debug!("{} acknowledged {} bytes", result.stream_id, result.received_bytes);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Capabilities, UploadResult};
    use crate::transport::{DownloadStream, EchoChannel, UploadBody};
    use crate::Error;
    use bytes::Bytes;

    struct ScriptedTransport {
        chunk: usize,
        failing_stream: Option<String>,
    }

    impl Transport for ScriptedTransport {
        async fn capabilities(&self) -> Result<Capabilities> {
            Err(Error::Test("unused".to_string()))
        }

        async fn open_download(&self, _secs: u64, stream_id: &str) -> Result<DownloadStream> {
            if self.failing_stream.as_deref() == Some(stream_id) {
                return Err(Error::Connection("connection refused".to_string()));
            }
            let chunk = self.chunk;
            Ok(futures::stream::unfold((), move |_| async move {
                time::sleep(Duration::from_millis(10)).await;
                Some((Ok::<_, Error>(Bytes::from(vec![0u8; chunk])), ()))
            })
            .boxed())
        }

        async fn upload(&self, stream_id: &str, mut body: UploadBody) -> Result<UploadResult> {
            let mut received = 0u64;
            while let Some(chunk) = body.next().await {
                received += chunk?.len() as u64;
                time::sleep(Duration::from_millis(10)).await;
            }
            Ok(UploadResult {
                received_bytes: received,
                duration_ms: 0,
                stream_id: stream_id.to_string(),
            })
        }

        async fn connect_echo(&self) -> Result<EchoChannel> {
            Err(Error::Test("unused".to_string()))
        }
    }

    fn manager(transport: ScriptedTransport) -> StreamManager<ScriptedTransport> {
        StreamManager::new(
            Arc::new(transport),
            Arc::new(PayloadGenerator::with_seed(4096, 0.1, 5)),
            Instant::now(),
            Duration::from_millis(250),
            4096,
        )
    }

    fn plan(direction: Direction, streams: usize, byte_ceiling: u64) -> BatchPlan {
        BatchPlan {
            direction,
            streams,
            duration: Duration::from_secs(2),
            phase: Phase::Ramp,
            byte_ceiling,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_does_not_abort_siblings() {
        let manager = manager(ScriptedTransport {
            chunk: 1000,
            failing_stream: Some("download-1".to_string()),
        });
        let collector = MeasurementsCollector::new();
        let report = manager
            .run_batch(plan(Direction::Download, 4, u64::MAX), Some(&collector), &CancellationToken::new())
            .await;

        assert_eq!(report.requested, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 3);
        assert!(report.streams[1].error.is_some());
        assert!(report.streams.iter().all(|s| s.state == StreamState::Closed));
        for id in [0, 2, 3] {
            assert!(report.streams[id].bytes > 0);
        }
        assert_eq!(manager.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorded_bytes_respect_ceiling() {
        let manager = manager(ScriptedTransport {
            chunk: 4096,
            failing_stream: None,
        });
        let collector = MeasurementsCollector::new();
        let report = manager
            .run_batch(plan(Direction::Download, 2, 10_000), Some(&collector), &CancellationToken::new())
            .await;

        let m = collector.get();
        for id in 0..2 {
            assert_eq!(m.stream_bytes(Direction::Download, id), 10_000);
            assert_eq!(report.streams[id as usize].bytes, 10_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_ordered_per_stream() {
        let manager = manager(ScriptedTransport {
            chunk: 1000,
            failing_stream: None,
        });
        let collector = MeasurementsCollector::new();
        manager
            .run_batch(plan(Direction::Download, 3, u64::MAX), Some(&collector), &CancellationToken::new())
            .await;

        let m = collector.get();
        for id in 0..3 {
            let timestamps: Vec<u64> = m
                .throughput_samples()
                .iter()
                .filter(|s| s.stream_id == id)
                .map(|s| s.timestamp_ms)
                .collect();
            assert!(timestamps.len() >= 7, "stream {} has {} samples", id, timestamps.len());
            assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        }
        assert!(m.throughput_samples().iter().all(|s| s.phase == Phase::Ramp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_batch_still_moves_traffic() {
        let manager = manager(ScriptedTransport {
            chunk: 1000,
            failing_stream: None,
        });
        let report = manager
            .run_batch(plan(Direction::Download, 2, u64::MAX), None, &CancellationToken::new())
            .await;
        assert_eq!(report.failed, 0);
        assert!(report.streams.iter().all(|s| s.bytes > 0));
        assert_eq!(report.total_bytes, report.streams.iter().map(|s| s.bytes).sum::<u64>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_streams_do_not_flush_into_sealed_collector() {
        let manager = manager(ScriptedTransport {
            chunk: 1000,
            failing_stream: None,
        });
        let cancel = CancellationToken::new();
        let collector = MeasurementsCollector::sealed_on(cancel.clone());
        let trigger = cancel.clone();
        let watched = collector.clone();
        let at_cancel = tokio::spawn(async move {
            // between two sample ticks, so every stream holds pending bytes
            time::sleep(Duration::from_millis(600)).await;
            trigger.cancel();
            watched.with(|m| m.throughput_samples().len())
        });

        let report = manager
            .run_batch(plan(Direction::Download, 4, u64::MAX), Some(&collector), &cancel)
            .await;
        let at_cancel = at_cancel.await.unwrap();

        assert!(at_cancel > 0);
        assert_eq!(collector.get().throughput_samples().len(), at_cancel);
        let recorded: u64 = collector.get().throughput_samples().iter().map(|s| s.bytes).sum();
        assert!(recorded < report.total_bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_batch_counts_sent_bytes() {
        let manager = manager(ScriptedTransport {
            chunk: 0,
            failing_stream: None,
        });
        let collector = MeasurementsCollector::new();
        let report = manager
            .run_batch(plan(Direction::Upload, 2, 20_000), Some(&collector), &CancellationToken::new())
            .await;

        assert_eq!(report.failed, 0);
        assert_eq!(report.total_bytes, 40_000);
        assert_eq!(collector.get().stream_bytes(Direction::Upload, 1), 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_batch_promptly() {
        let manager = manager(ScriptedTransport {
            chunk: 1000,
            failing_stream: None,
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = manager
            .run_batch(plan(Direction::Download, 4, u64::MAX), None, &cancel)
            .await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_request_secs_rounds_up() {
        assert_eq!(request_secs(Duration::from_millis(200)), 1);
        assert_eq!(request_secs(Duration::from_millis(2500)), 3);
        assert_eq!(request_secs(Duration::from_secs(600)), 120);
    }
}
