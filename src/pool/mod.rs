//! Parallel transfer pool.
//!
//! A [`TransferPool`] owns a set of attached requests and drives all of them through a
//! single [`Multiplexer`] until every one reaches a terminal state.
//!
//! # Send cycle
//!
//! ```text
//! send() ──> before_send ──> prepare each request ──┐
//!                                                    v
//!            ┌──> exec ──> read messages ──> process finished transfers
//!            │                                       │
//!            └── select / idle sleep <── polling <───┘   (while requests remain)
//!                                                    │
//!            complete <── detach leftovers <─────────┘
//! ```
//!
//! # Nested sends
//!
//! Observers may call [`TransferPool::send`] again while a send is running (typically
//! from a `request.complete` observer that needs a follow-up request). Each call opens a
//! scope one level deeper. Requests attached while a scope is open are tagged with it,
//! and a nested send only drains requests tagged at or below its own level, so it
//! returns as soon as its own work is done. Only the outermost send emits `complete`
//! and returns the pool to `Idle`.
//!
//! Failures are tagged with the scope of the request they belong to. Each send returns
//! the failures of its own scope as one [`AggregateError`]; siblings keep going when a
//! transfer fails.

pub mod registry;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{AggregateError, Result, VolleyError};
use crate::event::{Event, EventContext, EventDispatcher};
use crate::metrics;
use crate::request::{self, Request, RequestId, RequestState};
use crate::transfer::{
    HandleId, MultiCode, Multiplexer, TransferHandle, TransferMessage, parse_outgoing,
};

pub use types::*;

#[derive(Clone)]
pub struct TransferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: PoolId,
    config: PoolConfig,
    events: EventDispatcher,
    // Lock order: core, then multi. Neither is held while an event is dispatched.
    core: Mutex<PoolCore>,
    multi: Mutex<MultiCore>,
}

struct PoolCore {
    state: PoolState,
    /// Number of sends currently running; 0 when idle
    depth: usize,
    slots: Vec<Slot>,
    errors: Vec<ScopedError>,
}

struct Slot {
    request: Request,
    scope: usize,
    handle: Option<TransferHandle>,
}

struct ScopedError {
    scope: usize,
    error: Arc<VolleyError>,
}

struct MultiCore {
    multi: Box<dyn Multiplexer>,
    handles: HashMap<HandleId, RequestId>,
}

impl TransferPool {
    /// Create a pool driving `multi` with the default [`PoolConfig`].
    pub fn new(multi: impl Multiplexer + 'static) -> Self {
        Self::with_config(multi, PoolConfig::default())
    }

    /// Create a pool driving `multi` with the given timing configuration.
    pub fn with_config(multi: impl Multiplexer + 'static, config: PoolConfig) -> Self {
        let id = PoolId(uuid::Uuid::new_v4());
        tracing::debug!(pool_id = %id, ?config, "Created transfer pool");
        Self {
            inner: Arc::new(PoolInner {
                id,
                config,
                events: EventDispatcher::new(),
                core: Mutex::new(PoolCore {
                    state: PoolState::Idle,
                    depth: 0,
                    slots: Vec::new(),
                    errors: Vec::new(),
                }),
                multi: Mutex::new(MultiCore {
                    multi: Box::new(multi),
                    handles: HashMap::new(),
                }),
            }),
        }
    }

    /// Identifier used in this pool's log lines.
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Timing configuration the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Events dispatched by this pool.
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Current lifecycle state; `Sending` while any send (outer or nested) is running.
    pub fn state(&self) -> PoolState {
        self.inner.core.lock().state
    }

    /// Number of attached requests.
    pub fn count(&self) -> usize {
        self.inner.core.lock().slots.len()
    }

    /// Whether no request is attached.
    pub fn is_empty(&self) -> bool {
        self.inner.core.lock().slots.is_empty()
    }

    /// Attached requests in the order they were added.
    pub fn all(&self) -> Vec<Request> {
        self.inner
            .core
            .lock()
            .slots
            .iter()
            .map(|s| s.request.clone())
            .collect()
    }

    /// Whether `request` (this exact handle, not an equal copy) is attached.
    pub fn contains(&self, request: &Request) -> bool {
        self.inner
            .core
            .lock()
            .slots
            .iter()
            .any(|s| s.request.ptr_eq(request))
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &TransferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a request.
    ///
    /// While a send is running the request is prepared right away and tagged with the
    /// scope of the next nested send, so a send started after this call (typically by
    /// the same observer) waits for it. Adding a request that is already attached does
    /// nothing.
    pub fn add(&self, request: Request) -> Result<Request> {
        self.attach(request, false)
    }

    /// Attach a request to the send that is running right now instead of the next one.
    ///
    /// The request does not hold up a nested send opened afterwards; the send that was
    /// running when it was attached drains it. Same as [`TransferPool::add`] while idle.
    pub fn add_async(&self, request: Request) -> Result<Request> {
        self.attach(request, true)
    }

    fn attach(&self, request: Request, current_scope: bool) -> Result<Request> {
        let (sending, scope) = {
            let mut core = self.inner.core.lock();
            if core.slots.iter().any(|s| s.request.ptr_eq(&request)) {
                return Ok(request);
            }
            let scope = if current_scope {
                core.depth.saturating_sub(1)
            } else {
                core.depth
            };
            core.slots.push(Slot {
                request: request.clone(),
                scope,
                handle: None,
            });
            (core.state == PoolState::Sending, scope)
        };

        tracing::debug!(
            pool_id = %self.inner.id,
            request_id = %request.id(),
            scope,
            sending,
            "Added request"
        );

        self.inner.events.dispatch(&Event::new(
            ADD_REQUEST,
            EventContext::Request(request.clone()),
        ))?;

        if sending {
            self.prepare(&request);
        }
        Ok(request)
    }

    /// Detach a request, closing its transfer if one is open.
    ///
    /// Returns `false` if the request was not attached.
    pub fn remove(&self, request: &Request) -> Result<bool> {
        let removed = {
            let mut core = self.inner.core.lock();
            let Some(pos) = core.slots.iter().position(|s| s.request.ptr_eq(request)) else {
                return Ok(false);
            };
            let mut slot = core.slots.remove(pos);
            if let Some(handle) = slot.handle.as_mut() {
                self.release_handle(handle);
            }
            slot.request
        };

        tracing::debug!(pool_id = %self.inner.id, request_id = %removed.id(), "Removed request");

        self.inner.events.dispatch(&Event::new(
            REMOVE_REQUEST,
            EventContext::Request(removed),
        ))?;
        Ok(true)
    }

    /// Detach every request, drop collected failures and return to `Idle`.
    ///
    /// The pool is empty and idle afterwards even if an observer fails; the first
    /// observer error is returned.
    pub fn reset(&self) -> Result<()> {
        let slots = {
            let mut core = self.inner.core.lock();
            core.errors.clear();
            core.state = PoolState::Idle;
            core.depth = 0;
            std::mem::take(&mut core.slots)
        };

        tracing::debug!(pool_id = %self.inner.id, detached = slots.len(), "Resetting pool");

        let mut first_error = None;
        for mut slot in slots {
            if let Some(handle) = slot.handle.as_mut() {
                self.release_handle(handle);
            }
            if let Err(e) = self.inner.events.dispatch(&Event::new(
                REMOVE_REQUEST,
                EventContext::Request(slot.request),
            )) {
                first_error.get_or_insert(e);
            }
        }

        self.inner.events.dispatch(&Event::bare(RESET))?;
        first_error.map_or(Ok(()), Err)
    }

    /// Transfer every attached request to completion.
    ///
    /// # Errors
    /// `VolleyError::Aggregate` with every failure of this scope, in the order they
    /// occurred. The outermost send resets the pool before returning it.
    #[tracing::instrument(skip(self), fields(pool_id = %self.inner.id))]
    pub fn send(&self) -> Result<()> {
        let (level, requests) = {
            let mut core = self.inner.core.lock();
            if core.state != PoolState::Sending && core.slots.is_empty() {
                return Ok(());
            }
            core.depth += 1;
            let requests: Vec<Request> = core.slots.iter().map(|s| s.request.clone()).collect();
            (core.depth - 1, requests)
        };
        let started = Instant::now();

        if level == 0 {
            tracing::info!(requests = requests.len(), "Starting send cycle");
            let before = self.inner.events.dispatch(&Event::new(
                BEFORE_SEND,
                EventContext::Requests(requests.clone()),
            ));
            self.inner.core.lock().state = PoolState::Sending;
            if let Err(e) = before {
                self.capture(0, e);
            }
            // Includes requests a before_send observer attached
            for request in self.all() {
                if !self.has_open_transfer(&request) {
                    self.prepare(&request);
                }
            }
        } else {
            tracing::debug!(scope = level, "Entering nested send");
        }

        if let Err(e) = self.perform(level) {
            tracing::error!(scope = level, error = %e, "Send cycle aborted");
            self.capture(level, e);
        }

        {
            let mut core = self.inner.core.lock();
            core.depth = core.depth.saturating_sub(1);
        }

        if level == 0 {
            self.finish();
            metrics::record_send_cycle(started.elapsed());
        }

        let errors: Vec<Arc<VolleyError>> = {
            let mut core = self.inner.core.lock();
            let (mine, others): (Vec<ScopedError>, Vec<ScopedError>) =
                std::mem::take(&mut core.errors)
                    .into_iter()
                    .partition(|e| e.scope >= level);
            core.errors = others;
            mine.into_iter().map(|e| e.error).collect()
        };

        if level == 0 {
            tracing::info!(
                requests = requests.len(),
                errors = errors.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Send cycle finished"
            );
        }

        if errors.is_empty() {
            return Ok(());
        }
        if level == 0
            && let Err(e) = self.reset()
        {
            tracing::warn!(error = %e, "Observer failed while resetting pool");
        }
        Err(AggregateError::new("Errors during multi transfer", errors).into())
    }

    /// Drain every request of scope `level` and deeper.
    fn perform(&self, level: usize) -> Result<()> {
        let config = &self.inner.config;
        let mut failed_selects = 0u32;

        loop {
            let active = loop {
                let status = self.inner.multi.lock().multi.exec();
                match status.code {
                    MultiCode::CallMultiPerform => continue,
                    MultiCode::Ok => break status.active,
                    MultiCode::Error(code) => {
                        return Err(VolleyError::Protocol(format!(
                            "multiplexer exec failed with code {}",
                            code
                        )));
                    }
                }
            };

            while let Some(message) = self.next_message() {
                self.handle_message(level, message);
            }

            let remaining = self.in_scope(level);
            if remaining.is_empty() {
                break;
            }
            self.poll(level, &remaining);
            if self.in_scope(level).is_empty() {
                break;
            }

            if active == 0 {
                tracing::trace!(scope = level, "No active transfers, sleeping");
                std::thread::sleep(config.idle_sleep());
                continue;
            }

            let ready = self
                .inner
                .multi
                .lock()
                .multi
                .select(config.select_timeout());
            if ready > 0 {
                failed_selects = 0;
                continue;
            }
            failed_selects += 1;
            if level > 0 && failed_selects > config.max_failed_selects {
                tracing::warn!(
                    scope = level,
                    failed_selects,
                    "Nested send is not making progress, yielding to enclosing send"
                );
                break;
            }
        }
        Ok(())
    }

    fn next_message(&self) -> Option<TransferMessage> {
        self.inner.multi.lock().multi.info_read()
    }

    fn handle_message(&self, level: usize, message: TransferMessage) {
        if let Err(e) = self
            .inner
            .events
            .dispatch(&Event::new(MESSAGE, EventContext::Message(message)))
        {
            self.capture(level, e);
        }

        let Some(request) = self.request_for(message.handle) else {
            tracing::trace!(handle = %message.handle, "Message for a detached transfer");
            return;
        };

        if let Err(e) = self.process_response(&request, message) {
            let scope = self.scope_of(&request);
            if let Err(remove_error) = self.remove(&request) {
                self.capture(scope, remove_error);
            }
            request.fail();

            let error = Arc::new(e);
            let mut all = self.collected_errors();
            all.push(error.clone());
            let dispatched = self.inner.events.dispatch(&Event::new(
                EXCEPTION,
                EventContext::Exception {
                    error: error.clone(),
                    all,
                },
            ));
            self.capture_shared(scope, error);
            if let Err(observer_error) = dispatched {
                self.capture(scope, observer_error);
            }
        }
    }

    /// Turn a finished transfer into a completed request.
    fn process_response(&self, request: &Request, message: TransferMessage) -> Result<()> {
        let (response, log) = {
            let mut core = self.inner.core.lock();
            let Some(handle) = core
                .slots
                .iter_mut()
                .find(|s| s.request.ptr_eq(request))
                .and_then(|s| s.handle.as_mut())
            else {
                return Err(VolleyError::Protocol(format!(
                    "request {} has no open transfer",
                    request.id()
                )));
            };

            let mut guard = self.inner.multi.lock();
            let MultiCore { multi, handles } = &mut *guard;
            handle.capture(&**multi);

            if !message.result.is_ok() {
                handle.set_error_no(message.result);
                let error = handle.to_error(&**multi);
                handles.remove(&handle.id());
                handle.release(&mut **multi);
                metrics::record_transfer("error");
                tracing::debug!(
                    request_id = %request.id(),
                    code = %message.result,
                    "Transfer failed"
                );
                return Err(error.into());
            }

            let log = handle.log().map(str::to_string);
            let mut info = multi.info(handle.id());
            info.debug = log.clone();
            let response = multi.take_response(handle.id()).map(|mut response| {
                response.info = Some(info);
                response
            });
            (response, log)
        };

        let Some(response) = response else {
            return Err(VolleyError::Protocol(format!(
                "transfer for request {} finished without a response",
                request.id()
            )));
        };
        metrics::record_transfer("ok");

        request.attach_transfer_response(response);
        if let Some(wire) = log.as_deref().and_then(parse_outgoing) {
            request.reconcile(&wire);
        }
        request.complete()?;

        if request.state() != RequestState::Transferring {
            self.remove(request)?;
        }
        Ok(())
    }

    /// Notify polling observers and settle requests they resolved.
    fn poll(&self, level: usize, remaining: &[Request]) {
        if let Err(e) = self.inner.events.dispatch(&Event::bare(POLLING)) {
            self.capture(level, e);
        }

        for request in remaining {
            if let Err(e) = request.events().dispatch(&Event::new(
                request::POLLING_REQUEST,
                EventContext::Polling {
                    pool: self.clone(),
                    request: request.clone(),
                },
            )) {
                self.capture(self.scope_of(request), e);
            }
        }

        for request in remaining {
            if !self.contains(request) {
                continue;
            }
            let scope = self.scope_of(request);
            if request.state() != RequestState::Transferring {
                if let Err(e) = self.remove(request) {
                    self.capture(scope, e);
                }
            } else if request.has_queued_response() {
                self.finish_queued(scope, request);
            }
        }
    }

    fn prepare(&self, request: &Request) {
        let scope = self.scope_of(request);
        if let Err(e) = self.try_prepare(scope, request) {
            if !self.has_open_transfer(request) && let Err(remove_error) = self.remove(request) {
                self.capture(scope, remove_error);
            }
            if !request.state().is_terminal() {
                request.fail();
            }
            self.capture(scope, e);
        }
    }

    fn try_prepare(&self, scope: usize, request: &Request) -> Result<()> {
        request.begin_transfer();
        request.events().dispatch(&Event::new(
            request::BEFORE_SEND,
            EventContext::Request(request.clone()),
        ))?;

        if request.state() != RequestState::Transferring {
            // An observer resolved it
            self.remove(request)?;
            return Ok(());
        }
        if request.has_queued_response() {
            self.finish_queued(scope, request);
            return Ok(());
        }

        let mut core = self.inner.core.lock();
        let Some(slot) = core.slots.iter_mut().find(|s| s.request.ptr_eq(request)) else {
            return Ok(());
        };
        if slot.handle.is_some() {
            return Ok(());
        }
        let mut guard = self.inner.multi.lock();
        let handle = TransferHandle::open(&mut *guard.multi, request)?;
        guard.handles.insert(handle.id(), request.id());
        slot.handle = Some(handle);
        Ok(())
    }

    /// Detach a request that carries a queued response and complete it without a transfer.
    fn finish_queued(&self, scope: usize, request: &Request) {
        if let Err(e) = self.remove(request) {
            self.capture(scope, e);
        }
        metrics::record_transfer("queued");
        tracing::debug!(request_id = %request.id(), "Completing request from queued response");
        if let Err(e) = request.complete() {
            self.capture(scope, e);
        }
    }

    /// End of the outermost send.
    ///
    /// Requests still attached here never finished (the drain was cut short); they are
    /// failed before `complete` so every request is terminal when observers see it.
    fn finish(&self) {
        self.inner.core.lock().state = PoolState::Complete;
        let leftovers = self.all();
        for request in leftovers.iter().filter(|r| !r.state().is_terminal()) {
            tracing::debug!(request_id = %request.id(), "Failing request left unfinished");
            request.fail();
        }
        if let Err(e) = self.inner.events.dispatch(&Event::bare(COMPLETE)) {
            self.capture(0, e);
        }
        for request in leftovers {
            if let Err(e) = self.remove(&request) {
                self.capture(0, e);
            }
        }
        self.inner.core.lock().state = PoolState::Idle;
    }

    fn release_handle(&self, handle: &mut TransferHandle) {
        let mut guard = self.inner.multi.lock();
        let MultiCore { multi, handles } = &mut *guard;
        handles.remove(&handle.id());
        handle.release(&mut **multi);
    }

    fn has_open_transfer(&self, request: &Request) -> bool {
        self.inner
            .core
            .lock()
            .slots
            .iter()
            .any(|s| s.request.ptr_eq(request) && s.handle.is_some())
    }

    fn request_for(&self, handle: HandleId) -> Option<Request> {
        let core = self.inner.core.lock();
        let id = *self.inner.multi.lock().handles.get(&handle)?;
        core.slots
            .iter()
            .find(|s| s.request.id() == id)
            .map(|s| s.request.clone())
    }

    fn in_scope(&self, level: usize) -> Vec<Request> {
        self.inner
            .core
            .lock()
            .slots
            .iter()
            .filter(|s| s.scope >= level)
            .map(|s| s.request.clone())
            .collect()
    }

    /// Scope of an attached request, or the innermost open scope if it is detached.
    fn scope_of(&self, request: &Request) -> usize {
        let core = self.inner.core.lock();
        core.slots
            .iter()
            .find(|s| s.request.ptr_eq(request))
            .map(|s| s.scope)
            .unwrap_or_else(|| core.depth.saturating_sub(1))
    }

    fn collected_errors(&self) -> Vec<Arc<VolleyError>> {
        self.inner
            .core
            .lock()
            .errors
            .iter()
            .map(|e| e.error.clone())
            .collect()
    }

    fn capture(&self, scope: usize, error: VolleyError) {
        self.capture_shared(scope, Arc::new(error));
    }

    fn capture_shared(&self, scope: usize, error: Arc<VolleyError>) {
        tracing::debug!(pool_id = %self.inner.id, scope, error = %error, "Captured failure");
        self.inner
            .core
            .lock()
            .errors
            .push(ScopedError { scope, error });
    }
}

impl fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.core.try_lock() {
            Some(core) => f
                .debug_struct("TransferPool")
                .field("id", &self.inner.id)
                .field("state", &core.state)
                .field("depth", &core.depth)
                .field("requests", &core.slots.len())
                .finish(),
            None => f
                .debug_struct("TransferPool")
                .field("id", &self.inner.id)
                .finish_non_exhaustive(),
        }
    }
}
