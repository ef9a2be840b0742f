//! The transfer primitive the pool is built on.
//!
//! A [`Multiplexer`] advances many transfers without blocking, reports finished ones as
//! [`TransferMessage`]s and offers a readiness wait. The pool never touches sockets
//! itself; everything below the request/response level happens behind this trait.
//!
//! Two implementations ship with the crate:
//! - [`ReqwestMultiplexer`]: real transfers driven by `reqwest` on a background runtime
//! - [`MockMultiplexer`]: scripted responses for tests, no network

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::http::{Headers, HttpResponse};

pub mod handle;
pub mod mock;
pub mod reqwest_multi;

pub use handle::{TransferHandle, WireRequest, parse_outgoing};
pub use mock::{MockCall, MockMultiplexer};
pub use reqwest_multi::{ReqwestConfig, ReqwestMultiplexer};

/// Identifies one transfer inside a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status of one `exec` call on the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiCode {
    Ok,
    /// More work is immediately available; call `exec` again before waiting
    CallMultiPerform,
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiStatus {
    pub code: MultiCode,
    /// Transfers still in flight after this call
    pub active: usize,
}

impl MultiStatus {
    pub fn ok(active: usize) -> Self {
        Self {
            code: MultiCode::Ok,
            active,
        }
    }
}

/// Result code of a single finished transfer.
///
/// Numbering follows the libcurl codes most callers already know from logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferCode {
    Ok,
    UnsupportedProtocol,
    MalformedUrl,
    CouldNotResolveHost,
    CouldNotConnect,
    OperationTimedOut,
    SendError,
    RecvError,
    Other(i32),
}

impl TransferCode {
    pub fn code(&self) -> i32 {
        match self {
            TransferCode::Ok => 0,
            TransferCode::UnsupportedProtocol => 1,
            TransferCode::MalformedUrl => 3,
            TransferCode::CouldNotResolveHost => 6,
            TransferCode::CouldNotConnect => 7,
            TransferCode::OperationTimedOut => 28,
            TransferCode::SendError => 55,
            TransferCode::RecvError => 56,
            TransferCode::Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TransferCode::Ok)
    }

    pub fn description(&self) -> &'static str {
        match self {
            TransferCode::Ok => "No error",
            TransferCode::UnsupportedProtocol => "Unsupported protocol",
            TransferCode::MalformedUrl => "URL using bad/illegal format",
            TransferCode::CouldNotResolveHost => "Could not resolve host name",
            TransferCode::CouldNotConnect => "Couldn't connect to server",
            TransferCode::OperationTimedOut => "Timeout was reached",
            TransferCode::SendError => "Failed sending data to the peer",
            TransferCode::RecvError => "Failure when receiving data from the peer",
            TransferCode::Other(_) => "Transfer failed",
        }
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// A finished transfer reported by `info_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMessage {
    pub handle: HandleId,
    pub result: TransferCode,
}

/// Everything a multiplexer needs to start one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
    pub protocol_version: String,
    /// Per-transfer timeout; `None` leaves it to the multiplexer
    pub timeout_ms: Option<u64>,
}

/// Statistics about one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferInfo {
    pub url: String,
    pub http_code: u16,
    pub total_time_ms: u64,
    pub size_download: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Verbose transfer log, attached by the pool once the transfer finishes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

/// Non-blocking engine that advances many transfers in one control flow.
///
/// Implementations must not call back into the pool: every method returns promptly
/// except `select`, which may block up to `timeout`.
pub trait Multiplexer: Send {
    /// Advance every registered transfer without blocking.
    fn exec(&mut self) -> MultiStatus;

    /// Pop the next finished transfer, if any.
    fn info_read(&mut self) -> Option<TransferMessage>;

    /// Wait until at least one transfer can make progress, or `timeout` elapses.
    /// Returns the number of transfers ready.
    fn select(&mut self, timeout: Duration) -> usize;

    /// Create a transfer for `spec` without starting it.
    fn create(&mut self, spec: TransferSpec) -> Result<HandleId>;

    /// Start tracking a created transfer.
    fn register(&mut self, handle: HandleId) -> Result<()>;

    /// Stop tracking a transfer, aborting it if still in flight.
    fn unregister(&mut self, handle: HandleId);

    /// Release every resource held for the transfer.
    fn close(&mut self, handle: HandleId);

    /// Verbose log captured during the transfer.
    fn log(&self, handle: HandleId) -> Option<String>;

    /// Human-readable error for a failed transfer.
    fn error_message(&self, handle: HandleId) -> Option<String>;

    fn info(&self, handle: HandleId) -> TransferInfo;

    /// Take the response of a finished transfer.
    fn take_response(&mut self, handle: HandleId) -> Option<HttpResponse>;
}

/// Render the outgoing half of a verbose transfer log.
pub(crate) fn outgoing_log(method: &str, target: &str, version: &str, headers: &Headers) -> String {
    let mut log = format!("> {} {} HTTP/{}\n", method, target, version);
    for (name, value) in headers.iter() {
        log.push_str(&format!("> {}: {}\n", name, value));
    }
    log.push_str(">\n");
    log
}
