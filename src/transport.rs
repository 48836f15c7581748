//! Client side of the data plane.
//!
//! The orchestrator and stream manager only talk to a [`Transport`]; the
//! production implementation is [`HttpTransport`], which speaks the HTTP
//! routes and the echo WebSocket served by [`crate::server::Server`].

use crate::config::Config;
use crate::protocol::{
    Capabilities, EchoProbe, UploadResult, CAPABILITIES_PATH, DOWNLOAD_PATH, ECHO_PATH, UPLOAD_PATH,
};
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt, TryStreamExt};
use log::{debug, warn};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Inbound bytes of one download stream.
pub type DownloadStream = BoxStream<'static, Result<Bytes>>;

/// Outbound bytes of one upload stream.
pub type UploadBody = BoxStream<'static, io::Result<Bytes>>;

/// Queue depth between the echo loop and the socket pump.
const ECHO_QUEUE: usize = 64;

/// Access to the measurement server.
///
/// Implementations must be shareable across stream tasks; every method may
/// be called concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Fetches the capability descriptor.
    fn capabilities(&self) -> impl Future<Output = Result<Capabilities>> + Send;

    /// Opens one download stream of `duration_secs` tagged `stream_id`.
    fn open_download(
        &self,
        duration_secs: u64,
        stream_id: &str,
    ) -> impl Future<Output = Result<DownloadStream>> + Send;

    /// Sends `body` as one upload stream and waits for the server's totals.
    fn upload(
        &self,
        stream_id: &str,
        body: UploadBody,
    ) -> impl Future<Output = Result<UploadResult>> + Send;

    /// Opens the echo channel.
    fn connect_echo(&self) -> impl Future<Output = Result<EchoChannel>> + Send;
}

/// Probe channel to the echo service.
///
/// Dropping the channel tears down the underlying connection.
#[derive(Debug)]
pub struct EchoChannel {
    outgoing: Option<mpsc::Sender<EchoProbe>>,
    incoming: mpsc::Receiver<EchoProbe>,
    pump: Option<JoinHandle<()>>,
}

impl EchoChannel {
    /// Wraps a pair of probe queues.
    pub fn new(outgoing: mpsc::Sender<EchoProbe>, incoming: mpsc::Receiver<EchoProbe>) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
            pump: None,
        }
    }

    /// Attaches the task moving probes between the queues and the socket.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Queues one probe for sending.
    pub async fn send(&self, probe: EchoProbe) -> Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| Error::Connection("echo channel closed".to_string()))?;
        outgoing
            .send(probe)
            .await
            .map_err(|_| Error::Connection("echo channel closed".to_string()))
    }

    /// Waits for the next echoed probe; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<EchoProbe> {
        self.incoming.recv().await
    }

    /// Closes the channel, letting the pump send a close frame first.
    pub async fn close(mut self) {
        self.outgoing.take();
        self.incoming.close();
        if let Some(pump) = self.pump.take() {
            let abort = pump.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), pump).await.is_err() {
                debug!("Echo pump did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for EchoChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[derive(Deserialize)]
struct TooLargeBody {
    limit: u64,
}

/// [`Transport`] over HTTP streaming bodies and a WebSocket echo channel.
///
/// # Examples
///
/// ```
/// use pathprobe::transport::HttpTransport;
///
/// let transport = HttpTransport::new("http://127.0.0.1:8080").unwrap();
/// assert_eq!(transport.base_url(), "http://127.0.0.1:8080");
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for the server at `base_url` (`http://host:port`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::Config(format!("Unsupported server URL: {}", base_url)));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Creates a transport for the server named by a client configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.base_url()?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn echo_url(&self) -> String {
        format!("{}{}", self.base_url.replacen("http", "ws", 1), ECHO_PATH)
    }
}

impl Transport for HttpTransport {
    async fn capabilities(&self) -> Result<Capabilities> {
        let response = self
            .client
            .get(self.url(CAPABILITIES_PATH))
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn open_download(&self, duration_secs: u64, stream_id: &str) -> Result<DownloadStream> {
        let response = self
            .client
            .get(self.url(DOWNLOAD_PATH))
            .query(&[("duration", duration_secs.to_string()), ("stream", stream_id.to_string())])
            .send()
            .await?
            .error_for_status()?;
        debug!("Download stream {} opened", stream_id);
        Ok(response.bytes_stream().map_err(Error::from).boxed())
    }

    async fn upload(&self, stream_id: &str, body: UploadBody) -> Result<UploadResult> {
        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .query(&[("stream", stream_id)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
            let limit = response
                .json::<TooLargeBody>()
                .await
                .map(|body| body.limit)
                .unwrap_or(0);
            return Err(Error::PayloadTooLarge { limit });
        }

        Ok(response.error_for_status()?.json().await?)
    }

    async fn connect_echo(&self) -> Result<EchoChannel> {
        let url = self.echo_url();
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!("Echo channel connected to {}", url);

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<EchoProbe>(ECHO_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<EchoProbe>(ECHO_QUEUE);

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    probe = out_rx.recv() => {
                        let Some(probe) = probe else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match probe.to_text() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode echo probe: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!("Echo send failed: {}", e);
                            break;
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => match EchoProbe::from_text(text.as_str()) {
                            Ok(probe) => {
                                if in_tx.send(probe).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("Ignoring malformed echo: {}", e),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Echo channel closed by server: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Echo channel error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(EchoChannel::new(out_tx, in_rx).with_pump(pump))
    }
}
