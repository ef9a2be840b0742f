//! Value types describing a request and where it is in its lifecycle.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::Headers;

/// Lifecycle state of a request.
///
/// ```text
/// Idle ──begin_transfer()──> Transferring ──complete()──> Complete
///                                 │
///                                 └──fail()──> Error
/// ```
///
/// `Complete` and `Error` are terminal for one send cycle; sending the request again
/// moves it back to `Transferring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Idle,
    Transferring,
    Complete,
    Error,
}

impl RequestState {
    /// Check if this state ends a send cycle (Complete or Error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Error)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestState::Idle => "idle",
            RequestState::Transferring => "transferring",
            RequestState::Complete => "complete",
            RequestState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Where the response currently attached to a request came from.
///
/// A response assigned before the transfer (a "queued" response) lets the pool skip
/// the wire entirely. A response produced by a previous transfer must not be mistaken
/// for one, so the two are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOrigin {
    /// No response assigned yet
    Pending,
    /// Assigned by a caller or observer; no transfer needed
    ResolvedWithoutTransfer,
    /// Produced by a transfer
    ResolvedViaTransfer,
}

/// What goes out on the wire for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// HTTP method (e.g., "GET", "POST")
    pub method: String,

    /// Absolute URL of the target
    pub url: String,

    pub headers: Headers,

    /// Request body; empty means no body
    pub body: String,

    /// HTTP protocol version without the `HTTP/` prefix (e.g., "1.1")
    pub protocol_version: String,

    /// Per-transfer timeout. `None` leaves it to the multiplexer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RequestData {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            headers: Headers::new(),
            body: String::new(),
            protocol_version: "1.1".to_string(),
            timeout_ms: None,
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
