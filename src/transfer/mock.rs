//! Scripted multiplexer for tests.
//!
//! Responses are queued per `"{METHOD} {path}"` key and handed out in FIFO order, the
//! same way the pool would see them from a real server. Transfers finish after a
//! configurable number of `exec` passes so tests can act while requests are in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, VolleyError};
use crate::http::{Headers, HttpResponse};

use super::{
    HandleId, MultiCode, MultiStatus, Multiplexer, TransferCode, TransferInfo, TransferMessage,
    TransferSpec, outgoing_log,
};

/// Mock multiplexer for testing.
///
/// Clones share state, so a test can keep one clone for assertions while the pool owns
/// another.
///
/// # Example
/// ```ignore
/// let mock = MockMultiplexer::new();
/// mock.add_response("GET /status", HttpResponse::new(200).with_body("ok"));
/// let pool = TransferPool::new(mock.clone());
/// ```
#[derive(Clone, Default)]
pub struct MockMultiplexer {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    outcomes: HashMap<String, VecDeque<MockOutcome>>,
    latency: u32,
    exec_failure: Option<i32>,
    next_id: u64,
    transfers: BTreeMap<HandleId, MockTransfer>,
    messages: VecDeque<TransferMessage>,
    calls: Vec<MockCall>,
    created: usize,
    closes: HashMap<HandleId, usize>,
}

#[derive(Clone)]
enum MockOutcome {
    Response(HttpResponse),
    Failure(TransferCode, String),
}

struct MockTransfer {
    spec: TransferSpec,
    registered: bool,
    remaining: u32,
    outcome: Option<MockOutcome>,
    response: Option<HttpResponse>,
    error: Option<String>,
    log: String,
    done: bool,
}

/// Record of a transfer that reached the (mock) wire.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub handle: HandleId,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
}

impl MockMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `"{METHOD} {path}"`.
    pub fn add_response(&self, key: &str, response: HttpResponse) {
        self.state
            .lock()
            .outcomes
            .entry(key.to_string())
            .or_default()
            .push_back(MockOutcome::Response(response));
    }

    /// Queue a transfer-level failure for `"{METHOD} {path}"`.
    pub fn add_failure(&self, key: &str, code: TransferCode, message: &str) {
        self.state
            .lock()
            .outcomes
            .entry(key.to_string())
            .or_default()
            .push_back(MockOutcome::Failure(code, message.to_string()));
    }

    /// Number of `exec` passes a registered transfer needs before it finishes (minimum 1).
    pub fn set_latency(&self, passes: u32) {
        self.state.lock().latency = passes;
    }

    /// Make every following `exec` call report a multiplexer-level failure.
    pub fn fail_exec(&self, code: i32) {
        self.state.lock().exec_failure = Some(code);
    }

    /// All transfers that were started, in registration order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Number of transfer handles created (registered or not).
    pub fn handles_created(&self) -> usize {
        self.state.lock().created
    }

    /// How many times `close` was called for `handle`.
    pub fn close_count(&self, handle: HandleId) -> usize {
        self.state.lock().closes.get(&handle).copied().unwrap_or(0)
    }

    pub fn total_closes(&self) -> usize {
        self.state.lock().closes.values().sum()
    }

    /// Transfers registered and not yet finished.
    pub fn in_flight_count(&self) -> usize {
        self.state
            .lock()
            .transfers
            .values()
            .filter(|t| t.registered && !t.done)
            .count()
    }
}

fn response_key(spec: &TransferSpec) -> String {
    let path = reqwest::Url::parse(&spec.url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| spec.url.clone());
    format!("{} {}", spec.method, path)
}

/// The request target and Host header a real transport would put on the wire.
fn wire_target(spec: &TransferSpec) -> (String, Option<String>) {
    match reqwest::Url::parse(&spec.url) {
        Ok(url) => {
            let mut target = url.path().to_string();
            if let Some(query) = url.query() {
                target.push('?');
                target.push_str(query);
            }
            let host = url.host_str().map(|host| match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            });
            (target, host)
        }
        Err(_) => (spec.url.clone(), None),
    }
}

impl Multiplexer for MockMultiplexer {
    fn exec(&mut self) -> MultiStatus {
        let mut state = self.state.lock();
        if let Some(code) = state.exec_failure {
            return MultiStatus {
                code: MultiCode::Error(code),
                active: 0,
            };
        }

        let mut finished = Vec::new();
        for (id, transfer) in state.transfers.iter_mut() {
            if !transfer.registered || transfer.done {
                continue;
            }
            transfer.remaining = transfer.remaining.saturating_sub(1);
            if transfer.remaining > 0 {
                continue;
            }
            transfer.done = true;
            let result = match transfer.outcome.take() {
                Some(MockOutcome::Response(response)) => {
                    transfer.log.push_str(&format!(
                        "< HTTP/{} {} {}\n",
                        response.protocol_version, response.status, response.reason
                    ));
                    transfer.response = Some(response);
                    TransferCode::Ok
                }
                Some(MockOutcome::Failure(code, message)) => {
                    transfer.log.push_str(&format!("* {}\n", message));
                    transfer.error = Some(message);
                    code
                }
                None => {
                    let message = format!(
                        "No mock response configured for {}",
                        response_key(&transfer.spec)
                    );
                    transfer.log.push_str(&format!("* {}\n", message));
                    transfer.error = Some(message);
                    TransferCode::CouldNotConnect
                }
            };
            finished.push(TransferMessage { handle: *id, result });
        }
        state.messages.extend(finished);

        let active = state
            .transfers
            .values()
            .filter(|t| t.registered && !t.done)
            .count();
        MultiStatus::ok(active)
    }

    fn info_read(&mut self) -> Option<TransferMessage> {
        self.state.lock().messages.pop_front()
    }

    fn select(&mut self, _timeout: Duration) -> usize {
        let state = self.state.lock();
        if !state.messages.is_empty() {
            return state.messages.len();
        }
        state
            .transfers
            .values()
            .filter(|t| t.registered && !t.done && t.remaining <= 1)
            .count()
    }

    fn create(&mut self, spec: TransferSpec) -> Result<HandleId> {
        if spec.method.is_empty() {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "Invalid HTTP method for {}",
                spec.url
            )));
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        state.created += 1;
        let id = HandleId(state.next_id);
        let remaining = state.latency.max(1);
        state.transfers.insert(
            id,
            MockTransfer {
                spec,
                registered: false,
                remaining,
                outcome: None,
                response: None,
                error: None,
                log: String::new(),
                done: false,
            },
        );
        Ok(id)
    }

    fn register(&mut self, handle: HandleId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(spec) = state.transfers.get(&handle).map(|t| t.spec.clone()) else {
            return Err(VolleyError::Protocol(format!(
                "unknown transfer handle {}",
                handle
            )));
        };

        let key = response_key(&spec);
        let outcome = state
            .outcomes
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        // Normalize the request the way a transport would before sending it
        let (target, host) = wire_target(&spec);
        let mut wire_headers = spec.headers.clone();
        if let Some(host) = host
            && !wire_headers.contains("Host")
        {
            wire_headers.set("Host", host);
        }
        if !spec.body.is_empty() {
            wire_headers.set("Content-Length", spec.body.len().to_string());
        }

        state.calls.push(MockCall {
            handle,
            method: spec.method.clone(),
            url: spec.url.clone(),
            headers: wire_headers.clone(),
            body: spec.body.clone(),
        });

        if let Some(transfer) = state.transfers.get_mut(&handle) {
            transfer.registered = true;
            transfer.outcome = outcome;
            transfer.log = format!("* Mock transport for {}\n", spec.url);
            transfer.log.push_str(&outgoing_log(
                &spec.method,
                &target,
                &spec.protocol_version,
                &wire_headers,
            ));
        }
        Ok(())
    }

    fn unregister(&mut self, handle: HandleId) {
        if let Some(transfer) = self.state.lock().transfers.get_mut(&handle) {
            transfer.registered = false;
        }
    }

    fn close(&mut self, handle: HandleId) {
        let mut state = self.state.lock();
        state.transfers.remove(&handle);
        *state.closes.entry(handle).or_default() += 1;
    }

    fn log(&self, handle: HandleId) -> Option<String> {
        self.state
            .lock()
            .transfers
            .get(&handle)
            .map(|t| t.log.clone())
    }

    fn error_message(&self, handle: HandleId) -> Option<String> {
        self.state
            .lock()
            .transfers
            .get(&handle)
            .and_then(|t| t.error.clone())
    }

    fn info(&self, handle: HandleId) -> TransferInfo {
        let state = self.state.lock();
        let Some(transfer) = state.transfers.get(&handle) else {
            return TransferInfo::default();
        };
        TransferInfo {
            url: transfer.spec.url.clone(),
            http_code: transfer.response.as_ref().map(|r| r.status).unwrap_or(0),
            total_time_ms: 0,
            size_download: transfer
                .response
                .as_ref()
                .map(|r| r.body.len() as u64)
                .unwrap_or(0),
            started_at: None,
            debug: None,
        }
    }

    fn take_response(&mut self, handle: HandleId) -> Option<HttpResponse> {
        self.state
            .lock()
            .transfers
            .get_mut(&handle)
            .and_then(|t| t.response.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(method: &str, url: &str) -> TransferSpec {
        TransferSpec {
            method: method.to_string(),
            url: url.to_string(),
            headers: Headers::new(),
            body: String::new(),
            protocol_version: "1.1".to_string(),
            timeout_ms: None,
        }
    }

    #[test]
    fn test_responses_are_served_in_fifo_order() {
        let mut mock = MockMultiplexer::new();
        mock.add_response("GET /status", HttpResponse::new(200).with_body("first"));
        mock.add_response("GET /status", HttpResponse::new(200).with_body("second"));

        let a = mock.create(spec("GET", "http://api.example.com/status")).unwrap();
        let b = mock.create(spec("GET", "http://api.example.com/status")).unwrap();
        mock.register(a).unwrap();
        mock.register(b).unwrap();

        assert_eq!(mock.exec(), MultiStatus::ok(0));
        assert_eq!(mock.info_read().unwrap().handle, a);
        assert_eq!(mock.info_read().unwrap().handle, b);
        assert!(mock.info_read().is_none());

        assert_eq!(mock.take_response(a).unwrap().body, "first");
        assert_eq!(mock.take_response(b).unwrap().body, "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn test_latency_keeps_transfers_in_flight() {
        let mut mock = MockMultiplexer::new();
        mock.set_latency(3);
        mock.add_response("GET /slow", HttpResponse::new(200));

        let handle = mock.create(spec("GET", "http://example.com/slow")).unwrap();
        mock.register(handle).unwrap();

        assert_eq!(mock.exec().active, 1);
        assert_eq!(mock.select(Duration::from_millis(1)), 0);
        assert_eq!(mock.exec().active, 1);
        assert_eq!(mock.select(Duration::from_millis(1)), 1);
        assert_eq!(mock.exec().active, 0);
        assert_eq!(
            mock.info_read(),
            Some(TransferMessage {
                handle,
                result: TransferCode::Ok
            })
        );
    }

    #[test]
    fn test_missing_response_fails_the_transfer() {
        let mut mock = MockMultiplexer::new();
        let handle = mock.create(spec("POST", "http://example.com/unknown")).unwrap();
        mock.register(handle).unwrap();
        mock.exec();

        let message = mock.info_read().unwrap();
        assert_eq!(message.result, TransferCode::CouldNotConnect);
        assert!(
            mock.error_message(handle)
                .unwrap()
                .contains("No mock response configured for POST /unknown")
        );
        assert!(mock.take_response(handle).is_none());
    }

    #[test]
    fn test_register_normalizes_host_header_in_log() {
        let mut mock = MockMultiplexer::new();
        mock.add_response("GET /items", HttpResponse::new(200));
        let handle = mock
            .create(spec("GET", "http://example.com:8080/items?page=2"))
            .unwrap();
        mock.register(handle).unwrap();

        let log = mock.log(handle).unwrap();
        assert!(log.contains("> GET /items?page=2 HTTP/1.1"));
        assert!(log.contains("> Host: example.com:8080"));
        assert_eq!(mock.calls()[0].headers.get("host"), Some("example.com:8080"));
    }

    #[test]
    fn test_unregistered_transfers_never_finish() {
        let mut mock = MockMultiplexer::new();
        mock.add_response("GET /", HttpResponse::new(200));
        let handle = mock.create(spec("GET", "http://example.com/")).unwrap();
        mock.register(handle).unwrap();
        mock.unregister(handle);

        assert_eq!(mock.exec().active, 0);
        assert!(mock.info_read().is_none());

        mock.close(handle);
        assert_eq!(mock.close_count(handle), 1);
        assert_eq!(mock.in_flight_count(), 0);
    }
}
