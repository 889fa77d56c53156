use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("erasure codec failed: {0}")]
    Codec(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
