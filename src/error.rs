//! Error types for the Agent Chat daemon

use thiserror::Error;

/// Main error type for daemon operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay communication error
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local state persistence error
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Sink delivery error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Cryptographic errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Signature verification failed: {0}")]
    Verification(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),
}

/// Relay transport errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Relay returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid relay response: {0}")]
    InvalidResponse(String),

    #[error("Streaming session unavailable: {0}")]
    StreamingUnavailable(String),

    #[error("Streaming session closed")]
    StreamClosed,

    #[error("Request timed out")]
    Timeout,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Another daemon already owns {path} (pid {pid})")]
    LockHeld { path: String, pid: u32 },

    #[error("State write failed for {path}: {source_msg}")]
    WriteFailed { path: String, source_msg: String },

    #[error("State read failed for {path}: {source_msg}")]
    ReadFailed { path: String, source_msg: String },
}

/// Sink delivery errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Messenger API send failed: {0}")]
    Messenger(String),

    #[error("Delivery command failed: {0}")]
    Command(String),

    #[error("AI sink invocation failed: {0}")]
    AiSink(String),

    #[error("Delivery timed out")]
    Timeout,
}

/// Convenient Result type for daemon operations
pub type Result<T> = std::result::Result<T, ChatError>;

impl From<String> for ChatError {
    fn from(msg: String) -> Self {
        ChatError::Generic(msg)
    }
}

impl From<&str> for ChatError {
    fn from(msg: &str) -> Self {
        ChatError::Generic(msg.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Relay(RelayError::Timeout)
        } else {
            ChatError::Relay(RelayError::Request(err.to_string()))
        }
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::Relay(RelayError::Request(err.to_string()))
    }
}
