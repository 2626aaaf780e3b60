//! The queue message carried from the trigger to both consumers.

use serde::{Deserialize, Serialize};

use super::entry::validate_path;
use super::error::DomainError;

/// A single revalidation request: the origin host that received the request
/// and the logical path to invalidate (no query string, no CDN suffixes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationMessage {
    pub host: String,
    pub url: String,
}

impl RevalidationMessage {
    pub fn new(host: impl Into<String>, url: impl Into<String>) -> Result<Self, DomainError> {
        let message = Self {
            host: host.into(),
            url: url.into(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Parse a raw queue body. Malformed bodies are a permanent input error;
    /// the caller isolates them to the offending message.
    pub fn parse(body: &str) -> Result<Self, DomainError> {
        let message: Self = serde_json::from_str(body)
            .map_err(|err| DomainError::validation(format!("malformed message body: {err}")))?;
        message.validate()?;
        Ok(message)
    }

    pub fn to_body(&self) -> Result<String, DomainError> {
        serde_json::to_string(self)
            .map_err(|err| DomainError::invariant(format!("message serialization failed: {err}")))
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.host.is_empty() {
            return Err(DomainError::validation("host must not be empty"));
        }
        validate_path(&self.url)
    }
}
