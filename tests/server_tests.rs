use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pathprobe::protocol::{EchoProbe, STREAM_ID_HEADER};
use pathprobe::server::ServerStats;
use pathprobe::transport::{HttpTransport, Transport};
use pathprobe::{Config, Error, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base_url: String,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(config: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(config).unwrap();
    let stats = server.stats();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        server.serve(listener, token).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{}", addr),
        stats,
        shutdown,
    }
}

/// Polls `check` until it holds or a second has passed.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn upload_body(chunks: usize, size: usize) -> pathprobe::transport::UploadBody {
    futures::stream::iter((0..chunks).map(move |_| Ok(Bytes::from(vec![7u8; size])))).boxed()
}

#[tokio::test]
async fn test_capabilities_round_trip() {
    let server = start(Config::server(0).with_max_concurrency(6).with_chunk_size(32 * 1024)).await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let caps = transport.capabilities().await.unwrap();
    assert_eq!(caps.max_concurrency, 6);
    assert_eq!(caps.chunk_size, 32 * 1024);
    assert_eq!(caps.download_ceiling, 25_000_000);
    assert_eq!(caps.upload_ceiling, 25_000_000);
    assert!(caps.echo_supported);
}

#[tokio::test]
async fn test_download_respects_ceiling() {
    let server = start(
        Config::server(0)
            .with_chunk_size(4096)
            .with_download_ceiling(100_000),
    )
    .await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let mut stream = transport.open_download(5, "download-0").await.unwrap();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        total += chunk.unwrap().len() as u64;
    }
    assert_eq!(total, 100_000);

    let stats = Arc::clone(&server.stats);
    assert!(eventually(|| stats.snapshot().downloads_finished == 1).await);
    assert_eq!(server.stats.snapshot().bytes_served, 100_000);
    assert!(eventually(|| stats.snapshot().active_downloads == 0).await);
}

#[tokio::test]
async fn test_download_echoes_stream_id() {
    let server = start(Config::server(0).with_download_ceiling(10_000)).await;
    let response = reqwest::get(format!(
        "{}/download?duration=1&stream=download-7",
        server.base_url
    ))
    .await
    .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()[STREAM_ID_HEADER], "download-7");
    assert_eq!(response.bytes().await.unwrap().len(), 10_000);
}

#[tokio::test]
async fn test_download_client_close_releases_gauge() {
    let server = start(Config::server(0).with_chunk_size(1024)).await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let mut stream = transport.open_download(60, "download-1").await.unwrap();
    stream.next().await.unwrap().unwrap();
    assert_eq!(server.stats.snapshot().active_downloads, 1);
    drop(stream);

    let stats = Arc::clone(&server.stats);
    assert!(eventually(|| stats.snapshot().active_downloads == 0).await);
    assert_eq!(stats.snapshot().downloads_finished, 1);
}

#[tokio::test]
async fn test_upload_reports_totals() {
    let server = start(Config::server(0)).await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let result = transport.upload("upload-3", upload_body(10, 1000)).await.unwrap();
    assert_eq!(result.received_bytes, 10_000);
    assert_eq!(result.stream_id, "upload-3");

    let snap = server.stats.snapshot();
    assert_eq!(snap.uploads_finished, 1);
    assert_eq!(snap.bytes_received, 10_000);
    assert_eq!(snap.active_uploads, 0);
}

#[tokio::test]
async fn test_upload_over_ceiling_is_refused() {
    let server = start(Config::server(0).with_upload_ceiling(4096)).await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let err = transport
        .upload("upload-0", upload_body(3, 4096))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { limit: 4096 }), "{:?}", err);

    let stats = Arc::clone(&server.stats);
    assert!(eventually(|| stats.snapshot().active_uploads == 0).await);
    assert_eq!(stats.snapshot().uploads_rejected, 1);
    assert_eq!(stats.snapshot().uploads_finished, 0);
}

#[tokio::test]
async fn test_echo_returns_probe() {
    let server = start(Config::server(0)).await;
    let transport = HttpTransport::new(&server.base_url).unwrap();

    let mut channel = transport.connect_echo().await.unwrap();
    for seq in 0..3 {
        let probe = EchoProbe { seq, t: seq * 250 };
        channel.send(probe).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .unwrap();
        assert_eq!(echoed, Some(probe));
    }
    assert_eq!(server.stats.snapshot().echo_messages, 3);

    channel.close().await;
    let stats = Arc::clone(&server.stats);
    assert!(eventually(|| stats.snapshot().active_echo == 0).await);
}

#[tokio::test]
async fn test_echo_is_byte_exact() {
    let server = start(Config::server(0)).await;
    let url = format!("{}/echo", server.base_url.replacen("http", "ws", 1));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let text = r#"{"seq":1,"t":2,"extra":"  spaced  "}"#;
    socket.send(Message::text(text)).await.unwrap();
    match socket.next().await.unwrap().unwrap() {
        Message::Text(echoed) => assert_eq!(echoed.as_str(), text),
        other => panic!("unexpected frame {:?}", other),
    }

    socket
        .send(Message::Binary(Bytes::from_static(&[0, 1, 2, 255])))
        .await
        .unwrap();
    match socket.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(&data[..], &[0, 1, 2, 255]),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_echo_answers_ping() {
    let server = start(Config::server(0)).await;
    let url = format!("{}/echo", server.base_url.replacen("http", "ws", 1));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    socket
        .send(Message::Ping(Bytes::from_static(b"alive")))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Pong(Bytes::from_static(b"alive")));
}

#[tokio::test]
async fn test_oversized_echo_closes_with_policy_code() {
    let server = start(Config::server(0).with_echo_max_message(1024)).await;
    let url = format!("{}/echo", server.base_url.replacen("http", "ws", 1));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    socket.send(Message::text("x".repeat(2000))).await.unwrap();
    match socket.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert_eq!(server.stats.snapshot().echo_messages, 0);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let server = start(Config::server(0)).await;
    let response = reqwest::get(format!("{}/nope", server.base_url)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
