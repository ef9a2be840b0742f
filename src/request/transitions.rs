//! State transitions for requests.
//!
//! ```text
//! Idle ──begin_transfer()──> Transferring ──complete()──> Complete
//!   │                             │
//!   │                             └──fail()──> Error
//!   └──set_response()──> Complete
//! ```
//!
//! Transitions take the request lock only long enough to update state; events are
//! dispatched after the lock is released so observers may freely read or modify the
//! request they are notified about.

use chrono::Utc;

use crate::error::{Result, VolleyError};
use crate::event::{Event, EventContext};
use crate::http::HttpResponse;
use crate::transfer::{TransferSpec, WireRequest};

use super::{COMPLETE, Request, RequestState, ResponseOrigin};

impl Request {
    /// Assign a response and complete the request immediately.
    ///
    /// Used by observers that resolve a request without a transfer (caches, fixtures).
    /// Returns the same errors as [`Request::complete`].
    pub fn set_response(&self, response: HttpResponse) -> Result<()> {
        {
            let mut core = self.core();
            core.response = Some(response);
            core.origin = ResponseOrigin::ResolvedWithoutTransfer;
        }
        self.complete()
    }

    /// Assign a response that the pool will use instead of transferring the request.
    pub fn queue_response(&self, response: HttpResponse) {
        let mut core = self.core();
        core.response = Some(response);
        core.origin = ResponseOrigin::ResolvedWithoutTransfer;
        tracing::trace!(request_id = %self.id(), "Queued response");
    }

    /// Whether a queued response is waiting to complete this request.
    pub fn has_queued_response(&self) -> bool {
        let core = self.core();
        core.origin == ResponseOrigin::ResolvedWithoutTransfer
            && core.response.is_some()
            && !core.state.is_terminal()
    }

    /// Move into `Transferring`, dropping any response left over from an earlier transfer.
    ///
    /// A queued response survives so the pool can still short-circuit the wire.
    pub fn begin_transfer(&self) {
        let mut core = self.core();
        core.state = RequestState::Transferring;
        if core.origin == ResponseOrigin::ResolvedViaTransfer {
            core.response = None;
            core.origin = ResponseOrigin::Pending;
        }
        core.completed_at = None;
    }

    /// Move into `Complete` and notify `request.complete` observers.
    ///
    /// # Errors
    /// - `MissingResponse` if no response has been assigned
    /// - `InvalidState` if the request is already complete
    /// - `BadResponse` if the response status is 4xx or 5xx; the request is still
    ///   complete and observers have been notified
    pub fn complete(&self) -> Result<()> {
        let (response, url) = {
            let mut core = self.core();
            if core.state == RequestState::Complete {
                return Err(VolleyError::InvalidState(
                    self.id(),
                    core.state.to_string(),
                    RequestState::Transferring.to_string(),
                ));
            }
            let Some(response) = core.response.clone() else {
                return Err(VolleyError::MissingResponse(self.id()));
            };
            core.state = RequestState::Complete;
            core.completed_at = Some(Utc::now());
            (response, core.data.url.clone())
        };

        tracing::debug!(
            request_id = %self.id(),
            status = response.status,
            url = %url,
            "Request complete"
        );

        self.events().dispatch(&Event::new(
            COMPLETE,
            EventContext::Response {
                request: self.clone(),
                response: response.clone(),
            },
        ))?;

        if response.is_error() {
            return Err(VolleyError::BadResponse {
                request: self.id(),
                url,
                response: Box::new(response),
            });
        }
        Ok(())
    }

    /// Move into `Error`.
    pub fn fail(&self) {
        self.core().state = RequestState::Error;
        tracing::debug!(request_id = %self.id(), "Request failed");
    }

    /// Attach the response a transfer produced.
    pub(crate) fn attach_transfer_response(&self, response: HttpResponse) {
        let mut core = self.core();
        core.response = Some(response);
        core.origin = ResponseOrigin::ResolvedViaTransfer;
    }

    /// Bring headers and protocol version in line with what was actually sent.
    ///
    /// Transports add headers of their own (Host, Content-Length, ...); after a transfer
    /// the request should describe the message that went out, not the one that was built.
    /// The wire headers replace the request's headers, repeated names included. A log
    /// without headers leaves them untouched.
    pub fn reconcile(&self, wire: &WireRequest) {
        let mut core = self.core();
        if !wire.headers.is_empty() {
            core.data.headers.clear();
            for (name, value) in wire.headers.iter() {
                core.data.headers.append(name, value);
            }
        }
        if let Some(version) = &wire.protocol_version {
            core.data.protocol_version = version.clone();
        }
    }

    /// Everything a multiplexer needs to transfer this request.
    pub fn transfer_spec(&self) -> TransferSpec {
        let core = self.core();
        TransferSpec {
            method: core.data.method.clone(),
            url: core.data.url.clone(),
            headers: core.data.headers.clone(),
            body: core.data.body.clone(),
            protocol_version: core.data.protocol_version.clone(),
            timeout_ms: core.data.timeout_ms,
        }
    }
}
