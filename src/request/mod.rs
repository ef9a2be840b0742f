//! Shared, mutable HTTP requests.
//!
//! A [`Request`] is a cheap-to-clone handle: the pool, the command that built it and
//! any number of event observers all hold the same request and see each other's
//! changes. State transitions live in [`transitions`].

pub mod transitions;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::event::EventDispatcher;
use crate::http::{Headers, HttpResponse};

pub use types::{RequestData, RequestId, RequestState, ResponseOrigin};

/// Dispatched on the request right before it is handed to the multiplexer.
pub const BEFORE_SEND: &str = "request.before_send";
/// Dispatched on the request when it reaches the `Complete` state.
pub const COMPLETE: &str = "request.complete";
/// Dispatched on the pool for each request still in flight after a pass.
pub const POLLING_REQUEST: &str = "polling_request";

#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: RequestId,
    events: EventDispatcher,
    core: Mutex<RequestCore>,
}

pub(crate) struct RequestCore {
    pub(crate) data: RequestData,
    pub(crate) state: RequestState,
    pub(crate) response: Option<HttpResponse>,
    pub(crate) origin: ResponseOrigin,
    pub(crate) params: HashMap<String, Value>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Create an idle request with no headers and no body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::from_data(RequestData::new(method, url))
    }

    /// Create an idle request from a full description.
    pub fn from_data(data: RequestData) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: RequestId::new(),
                events: EventDispatcher::new(),
                core: Mutex::new(RequestCore {
                    data,
                    state: RequestState::Idle,
                    response: None,
                    origin: ResponseOrigin::Pending,
                    params: HashMap::new(),
                    created_at: Utc::now(),
                    completed_at: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Events dispatched on this request (`request.before_send`, `request.complete`).
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub(crate) fn core(&self) -> parking_lot::MutexGuard<'_, RequestCore> {
        self.inner.core.lock()
    }

    /// Snapshot of what will go out on the wire.
    pub fn data(&self) -> RequestData {
        self.core().data.clone()
    }

    pub fn method(&self) -> String {
        self.core().data.method.clone()
    }

    pub fn url(&self) -> String {
        self.core().data.url.clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.core().data.url = url.into();
    }

    pub fn headers(&self) -> Headers {
        self.core().data.headers.clone()
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.core().data.headers.get(name).map(str::to_string)
    }

    /// Replace every value of header `name` with `value`.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.core().data.headers.set(name, value);
    }

    pub fn remove_header(&self, name: &str) -> bool {
        self.core().data.headers.remove(name)
    }

    pub fn body(&self) -> String {
        self.core().data.body.clone()
    }

    pub fn set_body(&self, body: impl Into<String>) {
        self.core().data.body = body.into();
    }

    pub fn protocol_version(&self) -> String {
        self.core().data.protocol_version.clone()
    }

    pub fn set_protocol_version(&self, version: impl Into<String>) {
        self.core().data.protocol_version = version.into();
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.core().data.timeout_ms
    }

    pub fn set_timeout_ms(&self, timeout_ms: Option<u64>) {
        self.core().data.timeout_ms = timeout_ms;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.core().state
    }

    /// The response, whether queued, assigned by an observer or received.
    pub fn response(&self) -> Option<HttpResponse> {
        self.core().response.clone()
    }

    /// Where the current response came from.
    pub fn response_origin(&self) -> ResponseOrigin {
        self.core().origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.core().created_at
    }

    /// When the request last reached `Complete`.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.core().completed_at
    }

    // Parameter store

    /// Value stored under `key`, if any.
    pub fn param(&self, key: &str) -> Option<Value> {
        self.core().params.get(key).cloned()
    }

    pub fn set_param(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.core().params.insert(key.into(), value.into());
    }

    pub fn remove_param(&self, key: &str) -> Option<Value> {
        self.core().params.remove(key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.core().params.contains_key(key)
    }

    /// Whether two handles refer to the same request.
    pub fn ptr_eq(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock: Debug may run while a transition holds the lock
        match self.inner.core.try_lock() {
            Some(core) => f
                .debug_struct("Request")
                .field("id", &self.inner.id)
                .field("method", &core.data.method)
                .field("url", &core.data.url)
                .field("state", &core.state)
                .finish(),
            None => f
                .debug_struct("Request")
                .field("id", &self.inner.id)
                .finish_non_exhaustive(),
        }
    }
}
