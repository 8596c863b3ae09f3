/// Core error type.
///
/// Adapter crates map their specific errors into this type so the bridge can
/// contain failures consistently at component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid storage key part {part:?}: {reason}")]
    InvalidKey { part: String, reason: &'static str },

    #[error("handler error: {0}")]
    Handler(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
