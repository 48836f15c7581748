//! Bounded download streams.

use super::stats::{ActiveStreamGuard, ServerStats, StreamKind};
use super::AppState;
use crate::payload::PayloadGenerator;
use crate::protocol::{clamp_duration_secs, DownloadQuery, DEFAULT_DOWNLOAD_SECS, STREAM_ID_HEADER};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use log::{debug, info};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Response body of one download stream.
///
/// Chunks are produced on demand: the HTTP connection polls the body only
/// when it can write more, so a slow reader suspends production instead of
/// growing a buffer. The stream ends at the deadline or the byte ceiling,
/// whichever comes first. Totals are reported once, either at the end or
/// when the body is dropped because the client went away.
pub(crate) struct DownloadBody {
    payload: Arc<PayloadGenerator>,
    stats: Arc<ServerStats>,
    chunk_size: usize,
    ceiling: u64,
    duration: Duration,
    started: Instant,
    sent: u64,
    stream_id: String,
    reported: bool,
    _guard: ActiveStreamGuard,
}

impl DownloadBody {
    pub(crate) fn new(
        payload: Arc<PayloadGenerator>,
        stats: Arc<ServerStats>,
        chunk_size: usize,
        ceiling: u64,
        duration: Duration,
        stream_id: String,
    ) -> Self {
        let guard = stats.begin(StreamKind::Download);
        Self {
            payload,
            stats,
            chunk_size,
            ceiling,
            duration,
            started: Instant::now(),
            sent: 0,
            stream_id,
            reported: false,
            _guard: guard,
        }
    }

    fn finish(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        let elapsed = self.started.elapsed();
        self.stats.record_download(self.sent, elapsed);
        info!(
            "Download {} finished: {} bytes in {:.2}s",
            self.stream_id,
            self.sent,
            elapsed.as_secs_f64()
        );
    }
}

impl Stream for DownloadBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.reported {
            return Poll::Ready(None);
        }
        if this.sent >= this.ceiling || this.started.elapsed() >= this.duration {
            this.finish();
            return Poll::Ready(None);
        }

        let remaining = this.ceiling - this.sent;
        let len = (this.chunk_size as u64).min(remaining) as usize;
        let chunk = this.payload.next_chunk(len);
        this.sent += chunk.len() as u64;
        Poll::Ready(Some(Ok(chunk)))
    }
}

impl Drop for DownloadBody {
    fn drop(&mut self) {
        if !self.reported {
            debug!("Download {} closed by client", self.stream_id);
        }
        self.finish();
    }
}

pub(crate) async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let secs = clamp_duration_secs(query.duration.unwrap_or(DEFAULT_DOWNLOAD_SECS));
    let stream_id = query.stream.unwrap_or_else(|| "download".to_string());
    debug!("Download {} requested for {}s", stream_id, secs);

    let tag = HeaderValue::from_str(&stream_id).ok();
    let body = DownloadBody::new(
        Arc::clone(&state.payload),
        Arc::clone(&state.stats),
        state.config.chunk_size,
        state.config.download_ceiling,
        Duration::from_secs(secs),
        stream_id,
    );

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(tag) = tag {
        headers.insert(STREAM_ID_HEADER, tag);
    }
    response
}
