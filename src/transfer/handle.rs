//! Per-request transfer state owned by the pool while a request is in flight.

use crate::error::{Result, TransferError};
use crate::http::Headers;
use crate::request::{Request, RequestId};

use super::{HandleId, Multiplexer, TransferCode};

/// Wraps one multiplexer transfer for one request.
///
/// Created when the pool prepares a request, released exactly once when the request
/// leaves the pool. Releasing twice is a no-op, so the error path and the removal path
/// can both call [`TransferHandle::release`].
#[derive(Debug)]
pub struct TransferHandle {
    id: HandleId,
    request: RequestId,
    url: String,
    error_no: TransferCode,
    error: Option<String>,
    log: Option<String>,
    closed: bool,
}

impl TransferHandle {
    /// Create and register a transfer for `request`.
    pub(crate) fn open(multi: &mut dyn Multiplexer, request: &Request) -> Result<Self> {
        let spec = request.transfer_spec();
        let url = spec.url.clone();
        let id = multi.create(spec)?;
        if let Err(e) = multi.register(id) {
            multi.close(id);
            return Err(e);
        }

        tracing::trace!(request_id = %request.id(), handle = %id, url = %url, "Registered transfer handle");

        Ok(Self {
            id,
            request: request.id(),
            url,
            error_no: TransferCode::Ok,
            error: None,
            log: None,
            closed: false,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn error_no(&self) -> TransferCode {
        self.error_no
    }

    pub fn set_error_no(&mut self, code: TransferCode) {
        self.error_no = code;
    }

    /// Error reported by the multiplexer, falling back to the code's description.
    pub fn error(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| self.error_no.description().to_string())
    }

    /// Diagnostic log captured from the multiplexer.
    pub fn log(&self) -> Option<&str> {
        self.log.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Copy the diagnostic log and error text out of the multiplexer.
    pub(crate) fn capture(&mut self, multi: &dyn Multiplexer) {
        if self.closed {
            return;
        }
        self.log = multi.log(self.id);
        self.error = multi.error_message(self.id);
    }

    /// Build the error describing this handle's failed transfer.
    pub(crate) fn to_error(&self, multi: &dyn Multiplexer) -> TransferError {
        TransferError {
            request: self.request,
            url: self.url.clone(),
            code: self.error_no,
            message: self.error(),
            info: multi.info(self.id),
            debug: self.log.clone().unwrap_or_default(),
        }
    }

    /// Unregister and close the transfer. Safe to call more than once.
    pub(crate) fn release(&mut self, multi: &mut dyn Multiplexer) {
        if self.closed {
            return;
        }
        multi.unregister(self.id);
        multi.close(self.id);
        self.closed = true;
        tracing::trace!(request_id = %self.request, handle = %self.id, "Closed transfer handle");
    }
}

/// The request as it actually went out on the wire, recovered from a transfer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub method: String,
    pub target: String,
    pub protocol_version: Option<String>,
    pub headers: Headers,
}

/// Parse the outgoing request from a verbose transfer log.
///
/// Outgoing lines are prefixed with `> `; the block ends at the next informational
/// (`*`) or incoming (`<`) line. When the log holds several requests (redirects), the
/// last one wins.
pub fn parse_outgoing(log: &str) -> Option<WireRequest> {
    let mut last = None;
    let mut lines = log.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(request_line) = line.strip_prefix("> ") else {
            continue;
        };

        let mut parts = request_line.trim().splitn(3, ' ');
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();
        let protocol_version = parts
            .next()
            .and_then(|p| p.strip_prefix("HTTP/"))
            .map(str::to_string);

        let mut headers = Headers::new();
        while let Some(next) = lines.peek() {
            if next.starts_with('*') || next.starts_with('<') {
                break;
            }
            let header_line = next.trim_start_matches('>').trim();
            if let Some((name, value)) = header_line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
            lines.next();
        }

        if !method.is_empty() {
            last = Some(WireRequest {
                method,
                target,
                protocol_version,
                headers,
            });
        }
    }

    last
}
