use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Unsupported key format: {0}")]
    UnsupportedKeyFormat(String),

    #[error("Connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session disconnected")]
    SessionDisconnected,

    #[error("Port forwarding failed: {0}")]
    PortForwardFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Scan cancelled")]
    ScanCancelled,

    #[error("A command is already running")]
    TerminalBusy,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),
}

/// Serializable error for the UI collaborator
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (code, message, details) = match err {
            AppError::AuthenticationFailed(msg) => {
                ("AUTH_FAILED", "Authentication failed".to_string(), Some(msg.clone()))
            }
            AppError::UnsupportedKeyFormat(msg) => ("UNSUPPORTED_KEY", msg.clone(), None),
            AppError::ConnectTimeout { .. } => ("CONNECT_TIMEOUT", err.to_string(), None),
            AppError::Connection(msg) => ("CONNECTION_ERROR", msg.clone(), None),
            AppError::Io(e) => ("IO_ERROR", e.to_string(), None),
            AppError::SessionDisconnected => ("SESSION_DISCONNECTED", err.to_string(), None),
            AppError::PortForwardFailed(msg) => ("PORT_FORWARD_FAILED", msg.clone(), None),
            AppError::Channel(msg) => ("CHANNEL_ERROR", msg.clone(), None),
            AppError::ScanCancelled => ("SCAN_CANCELLED", err.to_string(), None),
            AppError::TerminalBusy => ("TERMINAL_BUSY", err.to_string(), None),
            AppError::Config(msg) => ("CONFIG_ERROR", msg.clone(), None),
            AppError::Serialization(msg) => ("SERIALIZATION_ERROR", msg.clone(), None),
            AppError::ProfileNotFound(id) => {
                ("PROFILE_NOT_FOUND", format!("Profile {} not found", id), None)
            }
            AppError::InvalidProfile(msg) => ("INVALID_PROFILE", msg.clone(), None),
        };

        SerializableError {
            code: code.to_string(),
            message: crate::logging::sanitize(&message),
            details: details.map(|d| crate::logging::sanitize(&d)),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Channel(format!("Background task failed: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
