use thiserror::Error;

/// Errors that can occur in the endpoint
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Server channel error: {0}")]
    Server(String),

    #[error("Signalling buffer overflow toward server")]
    SignalOverflow,

    #[error("No private key found in key file")]
    NoPrivateKey,
}

pub type Result<T> = std::result::Result<T, EndpointError>;
