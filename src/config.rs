use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Hard upper bound on the number of parallel streams a client will open,
/// regardless of what the server advertises.
pub const CONCURRENCY_HARD_CAP: usize = 12;

/// Default per-stream download ceiling (25 MB).
pub const DEFAULT_DOWNLOAD_CEILING: u64 = 25 * 1000 * 1000;

/// Default upload ceiling in basic mode (25 MB).
pub const BASIC_UPLOAD_CEILING: u64 = 25 * 1000 * 1000;

/// Default upload ceiling in secure mode (100 MB).
pub const SECURE_UPLOAD_CEILING: u64 = 100 * 1000 * 1000;

/// Run mode: client or server.
///
/// Determines whether this instance serves the data-plane endpoints or
/// drives a measurement run against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - serves download, upload, echo and capability endpoints
    Server,
    /// Client mode - runs the phase orchestrator against a server
    Client,
}

/// Server deployment profile.
///
/// The profile only selects the default upload ceiling; an explicit
/// [`Config::with_upload_ceiling`] always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerProfile {
    /// Basic deployment: 25 MB upload ceiling
    Basic,
    /// Secure deployment: 100 MB upload ceiling
    Secure,
}

impl ServerProfile {
    /// Default upload ceiling in bytes for this profile.
    pub fn upload_ceiling(self) -> u64 {
        match self {
            ServerProfile::Basic => BASIC_UPLOAD_CEILING,
            ServerProfile::Secure => SECURE_UPLOAD_CEILING,
        }
    }
}

/// Configuration for pathprobe servers and measurement runs.
///
/// One structure carries the parameters of both modes. Use the builder
/// methods to customize it.
///
/// # Examples
///
/// ## Client run with a shorter measurement window
///
/// ```
/// use pathprobe::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 8080)
///     .with_measure_duration(Duration::from_secs(5))
///     .with_echo_interval(Duration::from_millis(200));
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Server in secure mode
///
/// ```
/// use pathprobe::{Config, ServerProfile};
///
/// let config = Config::server(8080).with_profile(ServerProfile::Secure);
/// assert_eq!(config.upload_ceiling, 100_000_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Port number to listen on / connect to
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode)
    pub bind_addr: Option<IpAddr>,

    /// Size of one payload chunk in bytes
    pub chunk_size: usize,

    /// Concurrency the server advertises during discovery
    pub max_concurrency: usize,

    /// Server deployment profile
    pub profile: ServerProfile,

    /// Per-stream download byte ceiling
    pub download_ceiling: u64,

    /// Upload byte ceiling
    pub upload_ceiling: u64,

    /// Largest echo message the server accepts, in bytes
    pub echo_max_message: usize,

    /// Probability that the payload buffer is regenerated on a send
    pub payload_refresh_probability: f64,

    /// Warm-up phase duration (samples are not recorded)
    pub warmup_duration: Duration,

    /// Ramp phase duration
    pub ramp_duration: Duration,

    /// Measurement duration, applied once per direction
    pub measure_duration: Duration,

    /// Idle delay before the run completes
    pub cooldown: Duration,

    /// Throughput sampling cadence per stream
    pub sample_interval: Duration,

    /// Rolling window used to turn samples into rates
    pub throughput_window: Duration,

    /// Offset from the first sample inside which samples are discarded
    pub warmup_discard: Duration,

    /// Interval between echo probes
    pub echo_interval: Duration,

    /// Per-probe timeout after which an echo counts as lost
    pub echo_timeout: Duration,

    /// Interval between live metric updates
    pub metrics_interval: Duration,

    /// Capacity of each bounded event channel
    pub event_capacity: usize,

    /// Output in JSON format
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            port: 8080,
            server_addr: None,
            bind_addr: None,
            chunk_size: 64 * 1024, // 64 KB
            max_concurrency: 8,
            profile: ServerProfile::Basic,
            download_ceiling: DEFAULT_DOWNLOAD_CEILING,
            upload_ceiling: BASIC_UPLOAD_CEILING,
            echo_max_message: 1024,
            payload_refresh_probability: 0.1,
            warmup_duration: Duration::from_secs(2),
            ramp_duration: Duration::from_secs(3),
            measure_duration: Duration::from_secs(10),
            cooldown: Duration::from_secs(1),
            sample_interval: Duration::from_millis(250),
            throughput_window: Duration::from_millis(1000),
            warmup_discard: Duration::from_millis(3000),
            echo_interval: Duration::from_millis(250),
            echo_timeout: Duration::from_millis(1000),
            metrics_interval: Duration::from_millis(500),
            event_capacity: 64,
            json: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use pathprobe::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 8080);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Base HTTP URL of the server, e.g. `http://10.0.0.2:8080`.
    ///
    /// # Errors
    ///
    /// Returns an error when no server address is configured.
    pub fn base_url(&self) -> Result<String> {
        let addr = self
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;
        Ok(format!("http://{}:{}", addr, self.port))
    }

    /// Sets the payload chunk size in bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the concurrency advertised by the server.
    pub fn with_max_concurrency(mut self, streams: usize) -> Self {
        self.max_concurrency = streams;
        self
    }

    /// Selects the server profile and its default upload ceiling.
    pub fn with_profile(mut self, profile: ServerProfile) -> Self {
        self.profile = profile;
        self.upload_ceiling = profile.upload_ceiling();
        self
    }

    /// Sets the per-stream download ceiling in bytes.
    pub fn with_download_ceiling(mut self, bytes: u64) -> Self {
        self.download_ceiling = bytes;
        self
    }

    /// Sets the upload ceiling in bytes.
    pub fn with_upload_ceiling(mut self, bytes: u64) -> Self {
        self.upload_ceiling = bytes;
        self
    }

    /// Sets the largest accepted echo message in bytes.
    pub fn with_echo_max_message(mut self, bytes: usize) -> Self {
        self.echo_max_message = bytes;
        self
    }

    /// Sets the per-send payload refresh probability.
    pub fn with_payload_refresh_probability(mut self, probability: f64) -> Self {
        self.payload_refresh_probability = probability;
        self
    }

    /// Sets the warm-up phase duration.
    pub fn with_warmup_duration(mut self, duration: Duration) -> Self {
        self.warmup_duration = duration;
        self
    }

    /// Sets the ramp phase duration.
    pub fn with_ramp_duration(mut self, duration: Duration) -> Self {
        self.ramp_duration = duration;
        self
    }

    /// Sets the measurement duration used for each direction.
    ///
    /// # Examples
    ///
    /// ```
    /// use pathprobe::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 8080)
    ///     .with_measure_duration(Duration::from_secs(30));
    /// assert_eq!(config.measure_duration, Duration::from_secs(30));
    /// ```
    pub fn with_measure_duration(mut self, duration: Duration) -> Self {
        self.measure_duration = duration;
        self
    }

    /// Sets the cooldown delay.
    pub fn with_cooldown(mut self, duration: Duration) -> Self {
        self.cooldown = duration;
        self
    }

    /// Sets the per-stream sampling interval.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Sets the rolling throughput window.
    pub fn with_throughput_window(mut self, window: Duration) -> Self {
        self.throughput_window = window;
        self
    }

    /// Sets the timestamp offset used to discard early samples.
    pub fn with_warmup_discard(mut self, offset: Duration) -> Self {
        self.warmup_discard = offset;
        self
    }

    /// Sets the echo probe interval.
    pub fn with_echo_interval(mut self, interval: Duration) -> Self {
        self.echo_interval = interval;
        self
    }

    /// Sets the per-probe echo timeout.
    pub fn with_echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    /// Sets the live metrics publishing interval.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Sets the capacity of each event channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enables or disables JSON output format.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Checks the configuration for values that cannot drive a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be non-zero".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be non-zero".to_string()));
        }
        if self.download_ceiling == 0 || self.upload_ceiling == 0 {
            return Err(Error::Config("byte ceilings must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.payload_refresh_probability) {
            return Err(Error::Config(
                "payload_refresh_probability must be within [0, 1]".to_string(),
            ));
        }
        let timers = [
            ("sample_interval", self.sample_interval),
            ("throughput_window", self.throughput_window),
            ("echo_interval", self.echo_interval),
            ("echo_timeout", self.echo_timeout),
            ("metrics_interval", self.metrics_interval),
            ("measure_duration", self.measure_duration),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = Config::default();
        assert_eq!(config.sample_interval, Duration::from_millis(250));
        assert_eq!(config.echo_interval, Duration::from_millis(250));
        assert_eq!(config.echo_timeout, Duration::from_millis(1000));
        assert_eq!(config.warmup_discard, Duration::from_millis(3000));
        assert_eq!(config.download_ceiling, 25_000_000);
        assert_eq!(config.echo_max_message, 1024);
    }

    #[test]
    fn test_profile_sets_upload_ceiling() {
        let basic = Config::server(8080);
        assert_eq!(basic.upload_ceiling, BASIC_UPLOAD_CEILING);

        let secure = Config::server(8080).with_profile(ServerProfile::Secure);
        assert_eq!(secure.upload_ceiling, SECURE_UPLOAD_CEILING);

        let explicit = Config::server(8080)
            .with_profile(ServerProfile::Secure)
            .with_upload_ceiling(1024);
        assert_eq!(explicit.upload_ceiling, 1024);
    }

    #[test]
    fn test_base_url() {
        let config = Config::client("10.0.0.2".to_string(), 9000);
        assert_eq!(config.base_url().unwrap(), "http://10.0.0.2:9000");
        assert!(Config::server(9000).base_url().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().with_chunk_size(0).validate().is_err());
        assert!(Config::default()
            .with_payload_refresh_probability(1.5)
            .validate()
            .is_err());
        assert!(Config::default()
            .with_echo_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
