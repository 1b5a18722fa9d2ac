use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no usable transport endpoint for channel '{0}'")]
    NoUsableTransport(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json error: {0}")]
    Json(#[from] simd_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
