//! Error types for Dixi

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("malformed inbound message: {0}")]
    MalformedMessage(String),

    #[error("send to client {client} failed: {reason}")]
    SendFailed { client: String, reason: String },

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn send_failed(client: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SendFailed {
            client: client.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage(message.into())
    }
}
