//! Gateway error taxonomy

use thiserror::Error;

use crate::ocpp::frame::FrameError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Malformed OCPP frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Charger {0} is not connected")]
    NotConnected(String),

    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS setup error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
