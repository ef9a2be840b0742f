//! Error types for the transfer pool and command layer.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::command::Command;
use crate::http::HttpResponse;
use crate::request::RequestId;
use crate::transfer::{TransferCode, TransferInfo};

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the toolkit.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// A single transfer finished with a non-zero result code
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// One or more failures collected during a single `send()` cycle
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A command batch was executed with commands that cannot run
    #[error("Validation error: {message} ({} invalid command(s))", .commands.len())]
    Validation {
        message: String,
        commands: Vec<Command>,
    },

    /// The multiplexer itself reported a failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request completed with a 4xx or 5xx response
    #[error(
        "Unsuccessful response from {url}: {} {}",
        .response.status,
        .response.reason
    )]
    BadResponse {
        request: RequestId,
        url: String,
        response: Box<HttpResponse>,
    },

    /// Request is in an invalid state for the requested operation
    #[error("Invalid state transition: request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// A command was used before a client was associated with it
    #[error("Command '{0}' has no associated client")]
    MissingClient(String),

    /// A request was expected to carry a response but does not
    #[error("Request {0} has no response")]
    MissingResponse(RequestId),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// The failed response, when this error was raised by an unsuccessful status code.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            VolleyError::BadResponse { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// A transfer-level failure for one request.
///
/// Carries enough diagnostic context (transfer info plus the verbose log captured by the
/// multiplexer) to debug a failed connection without re-running it.
#[derive(Debug, Clone)]
pub struct TransferError {
    pub request: RequestId,
    pub url: String,
    pub code: TransferCode,
    pub message: String,
    pub info: TransferInfo,
    pub debug: String,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[transfer] {}: {} [url] {} [info] {:?} [debug] {}",
            self.code.code(),
            self.message,
            self.url,
            self.info,
            self.debug
        )
    }
}

impl std::error::Error for TransferError {}

/// Every failure collected while a pool drained one send scope, in occurrence order.
#[derive(Debug, Clone)]
pub struct AggregateError {
    message: String,
    errors: Vec<Arc<VolleyError>>,
}

impl AggregateError {
    pub fn new(message: impl Into<String>, errors: Vec<Arc<VolleyError>>) -> Self {
        Self {
            message: message.into(),
            errors,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errors(&self) -> &[Arc<VolleyError>] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<VolleyError>> {
        self.errors.iter()
    }

    pub fn into_errors(self) -> Vec<Arc<VolleyError>> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} error(s))", self.message, self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            write!(f, "\n  {}: {}", i + 1, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl<'a> IntoIterator for &'a AggregateError {
    type Item = &'a Arc<VolleyError>;
    type IntoIter = std::slice::Iter<'a, Arc<VolleyError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

impl IntoIterator for AggregateError {
    type Item = Arc<VolleyError>;
    type IntoIter = std::vec::IntoIter<Arc<VolleyError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
