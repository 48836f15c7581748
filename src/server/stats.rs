//! Server-side gauges and byte meters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of stream a gauge tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Download,
    Upload,
    Echo,
}

/// Counters shared by every handler of one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_downloads: AtomicUsize,
    active_uploads: AtomicUsize,
    active_echo: AtomicUsize,
    bytes_served: AtomicU64,
    bytes_received: AtomicU64,
    downloads_finished: AtomicU64,
    uploads_finished: AtomicU64,
    uploads_rejected: AtomicU64,
    download_time_ms: AtomicU64,
    upload_time_ms: AtomicU64,
    echo_messages: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub active_downloads: usize,
    pub active_uploads: usize,
    pub active_echo: usize,
    pub bytes_served: u64,
    pub bytes_received: u64,
    pub downloads_finished: u64,
    pub uploads_finished: u64,
    pub uploads_rejected: u64,
    /// Summed wall-clock time of finished downloads
    pub download_time_ms: u64,
    /// Summed wall-clock time of finished uploads
    pub upload_time_ms: u64,
    pub echo_messages: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn gauge(&self, kind: StreamKind) -> &AtomicUsize {
        match kind {
            StreamKind::Download => &self.active_downloads,
            StreamKind::Upload => &self.active_uploads,
            StreamKind::Echo => &self.active_echo,
        }
    }

    /// Increments the gauge of `kind`; the returned guard decrements it
    /// when dropped.
    pub fn begin(self: &Arc<Self>, kind: StreamKind) -> ActiveStreamGuard {
        self.gauge(kind).fetch_add(1, Ordering::Relaxed);
        ActiveStreamGuard {
            stats: Arc::clone(self),
            kind,
        }
    }

    pub fn active(&self, kind: StreamKind) -> usize {
        self.gauge(kind).load(Ordering::Relaxed)
    }

    /// Final totals of one download stream.
    pub fn record_download(&self, bytes: u64, duration: Duration) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        self.download_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.downloads_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Final totals of one accepted upload stream.
    pub fn record_upload(&self, bytes: u64, duration: Duration) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.upload_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.uploads_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// An upload refused for exceeding the ceiling.
    pub fn record_rejected_upload(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_message(&self) {
        self.echo_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_downloads: self.active_downloads.load(Ordering::Relaxed),
            active_uploads: self.active_uploads.load(Ordering::Relaxed),
            active_echo: self.active_echo.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            downloads_finished: self.downloads_finished.load(Ordering::Relaxed),
            uploads_finished: self.uploads_finished.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            download_time_ms: self.download_time_ms.load(Ordering::Relaxed),
            upload_time_ms: self.upload_time_ms.load(Ordering::Relaxed),
            echo_messages: self.echo_messages.load(Ordering::Relaxed),
        }
    }
}

/// Holds one unit of an active-stream gauge.
#[derive(Debug)]
pub struct ActiveStreamGuard {
    stats: Arc<ServerStats>,
    kind: StreamKind,
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        self.stats.gauge(self.kind).fetch_sub(1, Ordering::Relaxed);
    }
}
