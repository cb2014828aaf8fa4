use thiserror::Error;

#[derive(Error, Debug)]
pub enum TierwayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Frame too large: {0} bytes (max 80 bytes)")]
    FrameTooLarge(usize),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Supervision error: {0}")]
    Supervision(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TierwayError>;
