//! Upload sink.

use super::stats::StreamKind;
use super::AppState;
use crate::protocol::{UploadQuery, UploadResult};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use log::{info, warn};
use serde_json::json;
use std::time::Instant;

/// Consumes one upload stream.
///
/// Bytes are counted frame by frame. Crossing the ceiling answers `413`
/// at once and asks for the connection to be closed, leaving the rest of
/// the body unread. The active-upload guard lives in this future, so the
/// gauge is released on every exit, including the client vanishing.
pub(crate) async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Response {
    let _guard = state.stats.begin(StreamKind::Upload);
    let stream_id = query.stream.unwrap_or_else(|| "upload".to_string());
    let ceiling = state.config.upload_ceiling;
    let started = Instant::now();
    let mut received = 0u64;

    let mut frames = body.into_data_stream();
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(data) => {
                received += data.len() as u64;
                if received > ceiling {
                    state.stats.record_rejected_upload(received);
                    warn!(
                        "Upload {} exceeded the {} byte ceiling, closing",
                        stream_id, ceiling
                    );
                    return (
                        StatusCode::PAYLOAD_TOO_LARGE,
                        [(header::CONNECTION, "close")],
                        Json(json!({ "error": "payload too large", "limit": ceiling })),
                    )
                        .into_response();
                }
            }
            Err(e) => {
                warn!("Upload {} aborted after {} bytes: {}", stream_id, received, e);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        }
    }

    let elapsed = started.elapsed();
    state.stats.record_upload(received, elapsed);
    info!(
        "Upload {} finished: {} bytes in {:.2}s",
        stream_id,
        received,
        elapsed.as_secs_f64()
    );

    Json(UploadResult {
        received_bytes: received,
        duration_ms: elapsed.as_millis() as u64,
        stream_id,
    })
    .into_response()
}
