use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body the chat server returns alongside non-2xx REST responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiErrorBody {
    /// The first non-blank of `error` and `message`.
    pub fn reason(&self) -> Option<&str> {
        [self.error.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .find(|reason| !reason.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("frame field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
