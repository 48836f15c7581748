use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Echo channel setup failed: {0}")]
    EchoConnect(String),

    #[error("Echo channel lost: {0}")]
    EchoLost(String),

    #[error("Payload exceeds the {limit} byte ceiling")]
    PayloadTooLarge { limit: u64 },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Test error: {0}")]
    Test(String),
}

pub type Result<T> = std::result::Result<T, Error>;
