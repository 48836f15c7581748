use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version advertised in the capability descriptor.
pub const PROTOCOL_VERSION: u32 = 1;

/// Route serving the capability descriptor.
pub const CAPABILITIES_PATH: &str = "/capabilities";
/// Route serving bounded download streams.
pub const DOWNLOAD_PATH: &str = "/download";
/// Route accepting upload streams.
pub const UPLOAD_PATH: &str = "/upload";
/// WebSocket route echoing probes.
pub const ECHO_PATH: &str = "/echo";

/// Response header carrying the stream identifier of a download.
pub const STREAM_ID_HEADER: &str = "x-stream-id";

/// Shortest download a client may request, in seconds.
pub const MIN_DOWNLOAD_SECS: u64 = 1;
/// Longest download a client may request, in seconds.
pub const MAX_DOWNLOAD_SECS: u64 = 120;
/// Download duration used when the request does not name one.
pub const DEFAULT_DOWNLOAD_SECS: u64 = 10;

/// Clamps a requested download duration into the served range.
///
/// # Examples
///
/// ```
/// use pathprobe::protocol::clamp_duration_secs;
///
/// assert_eq!(clamp_duration_secs(0), 1);
/// assert_eq!(clamp_duration_secs(30), 30);
/// assert_eq!(clamp_duration_secs(600), 120);
/// ```
pub fn clamp_duration_secs(requested: u64) -> u64 {
    requested.clamp(MIN_DOWNLOAD_SECS, MAX_DOWNLOAD_SECS)
}

/// Transfer direction of a stream, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server to client
    Download,
    /// Client to server
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Builds the wire identifier of a stream.
///
/// # Examples
///
/// ```
/// use pathprobe::protocol::{stream_tag, Direction};
///
/// assert_eq!(stream_tag(Direction::Download, 3), "download-3");
/// ```
pub fn stream_tag(direction: Direction, stream_id: u32) -> String {
    format!("{}-{}", direction, stream_id)
}

/// Read-only capability descriptor fetched once during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub version: u32,
    pub max_concurrency: usize,
    pub chunk_size: usize,
    pub echo_supported: bool,
    pub server_time_ms: i64,
    pub download_ceiling: u64,
    pub upload_ceiling: u64,
    pub max_duration_secs: u64,
}

/// Query parameters of a download request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadQuery {
    /// Requested duration in seconds, clamped by the server
    pub duration: Option<u64>,
    /// Stream identifier echoed back in [`STREAM_ID_HEADER`]
    pub stream: Option<String>,
}

/// Query parameters of an upload request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadQuery {
    pub stream: Option<String>,
}

/// Server's answer to a completed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub received_bytes: u64,
    pub duration_ms: u64,
    pub stream_id: String,
}

/// Timing probe sent over the echo channel.
///
/// The server never parses probes; it returns them byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoProbe {
    /// Monotonically increasing sequence number
    pub seq: u64,
    /// Send timestamp in milliseconds since the start of the run
    pub t: u64,
}

impl EchoProbe {
    /// Serializes the probe to its JSON text frame.
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a probe from a JSON text frame.
    pub fn from_text(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
