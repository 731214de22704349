use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateWatchError {
    #[error("Rate fetch failed: {0}")]
    Fetch(String),

    #[error("Quote provider rejected credentials: {0}")]
    Auth(String),

    #[error("Ledger store failed: {0}")]
    Store(String),

    #[error("Retention cleanup failed: {0}")]
    Prune(String),

    #[error("Alert delivery failed: {0}")]
    Notify(String),

    #[error("Invalid ledger entry: {0}")]
    InvalidEntry(String),

    #[error("Invalid rate snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A pipeline run is already in progress")]
    PipelineBusy,

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP server error: {0}")]
    ServerError(#[from] hyper::Error),

    #[error("WebSocket error: {0}")]
    WebsocketError(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RateWatchError>;

impl From<tokio_tungstenite::tungstenite::Error> for RateWatchError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebsocketError(Box::new(value))
    }
}

impl RateWatchError {
    /// HTTP status the thin request layer answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PipelineBusy => 409,
            Self::Auth(_) | Self::Fetch(_) | Self::HttpError(_) => 502,
            _ => 500,
        }
    }
}
