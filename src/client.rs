//! HTTP client bound to a transfer pool.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResult};
use crate::error::{AggregateError, Result, VolleyError};
use crate::event::{Event, EventContext, EventDispatcher};
use crate::http::{Headers, HttpResponse};
use crate::pool::{TransferPool, registry};
use crate::request::Request;
use crate::transfer::Multiplexer;

/// Dispatched on the client before a command's request is sent.
pub const COMMAND_BEFORE_SEND: &str = "command.before_send";
/// Dispatched on the client after a command's result has been extracted.
pub const COMMAND_AFTER_SEND: &str = "command.after_send";
/// Dispatched on the client for every request it creates.
pub const REQUEST_CREATE: &str = "request.create";

/// Configuration for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL relative request targets are resolved against
    pub base_url: Option<String>,

    /// Headers added to every request the client creates
    pub default_headers: Headers,

    /// Per-transfer timeout applied to created requests
    pub timeout_ms: Option<u64>,

    /// Sent as `User-Agent` unless the default headers already carry one
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: Headers::new(),
            timeout_ms: None,
            user_agent: concat!("volley/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }
}

/// Creates requests and sends them through its pool.
///
/// Cloning is cheap; clones share the configuration, pool and observers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    pool: TransferPool,
    events: EventDispatcher,
}

impl Client {
    pub fn new(config: ClientConfig, pool: TransferPool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                events: EventDispatcher::new(),
            }),
        }
    }

    /// Client with a pool of its own.
    pub fn with_multiplexer(config: ClientConfig, multi: impl Multiplexer + 'static) -> Self {
        Self::new(config, TransferPool::new(multi))
    }

    /// Client on the process-wide default pool.
    pub fn shared(config: ClientConfig) -> Result<Self> {
        Ok(Self::new(config, registry::shared()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &TransferPool {
        &self.inner.pool
    }

    /// Events dispatched by this client.
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Whether two handles refer to the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a request for `uri`, resolved against the base URL.
    pub fn create_request(&self, method: &str, uri: &str) -> Result<Request> {
        let config = &self.inner.config;
        let url = match &config.base_url {
            Some(base) => reqwest::Url::parse(base)
                .and_then(|base| base.join(uri))
                .map_err(|e| anyhow::anyhow!("Invalid URL '{}' relative to '{}': {}", uri, base, e))?,
            None => reqwest::Url::parse(uri)
                .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", uri, e))?,
        };

        let request = Request::new(method, url.as_str());
        for (name, value) in config.default_headers.iter() {
            request.set_header(name, value);
        }
        if request.header("User-Agent").is_none() {
            request.set_header("User-Agent", config.user_agent.as_str());
        }
        request.set_timeout_ms(config.timeout_ms);

        tracing::debug!(request_id = %request.id(), method, url = %url, "Created request");

        self.inner.events.dispatch(&Event::new(
            REQUEST_CREATE,
            EventContext::Request(request.clone()),
        ))?;
        Ok(request)
    }

    pub fn get(&self, uri: &str) -> Result<Request> {
        self.create_request("GET", uri)
    }

    pub fn head(&self, uri: &str) -> Result<Request> {
        self.create_request("HEAD", uri)
    }

    pub fn delete(&self, uri: &str) -> Result<Request> {
        self.create_request("DELETE", uri)
    }

    pub fn post(&self, uri: &str, body: impl Into<String>) -> Result<Request> {
        let request = self.create_request("POST", uri)?;
        request.set_body(body);
        Ok(request)
    }

    pub fn put(&self, uri: &str, body: impl Into<String>) -> Result<Request> {
        let request = self.create_request("PUT", uri)?;
        request.set_body(body);
        Ok(request)
    }

    /// Send one request through the pool and return its response.
    ///
    /// A single failure is returned as-is rather than wrapped in an aggregate.
    pub fn send(&self, request: &Request) -> Result<HttpResponse> {
        self.inner.pool.add(request.clone())?;
        self.inner.pool.send().map_err(unwrap_single)?;
        request
            .response()
            .ok_or(VolleyError::MissingResponse(request.id()))
    }

    /// Send several requests in parallel; responses come back in request order.
    pub fn send_all(&self, requests: &[Request]) -> Result<Vec<HttpResponse>> {
        for request in requests {
            self.inner.pool.add(request.clone())?;
        }
        self.inner.pool.send()?;
        requests
            .iter()
            .map(|r| r.response().ok_or(VolleyError::MissingResponse(r.id())))
            .collect()
    }

    /// Execute a command on this client and return its result.
    ///
    /// Commands without a client are bound to this one first.
    pub fn execute(&self, command: &Command) -> Result<CommandResult> {
        if command.client().is_none() {
            command.set_client(self.clone());
        }
        command.execute()?;
        command.result()
    }
}

fn unwrap_single(error: VolleyError) -> VolleyError {
    match error {
        VolleyError::Aggregate(aggregate) if aggregate.len() == 1 => {
            let message = aggregate.message().to_string();
            let mut errors = aggregate.into_errors();
            let only = errors.remove(0);
            match Arc::try_unwrap(only) {
                Ok(error) => error,
                Err(shared) => AggregateError::new(message, vec![shared]).into(),
            }
        }
        other => other,
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url)
            .field("pool", &self.inner.pool.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{MockMultiplexer, TransferCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(mock: &MockMultiplexer) -> Client {
        let mut config = ClientConfig::with_base_url("http://api.example.com/v1/");
        config.default_headers.set("Accept", "application/json");
        config.timeout_ms = Some(2_000);
        Client::with_multiplexer(config, mock.clone())
    }

    #[test]
    fn test_create_request_resolves_and_decorates() {
        let mock = MockMultiplexer::new();
        let client = client(&mock);
        let created = Arc::new(AtomicUsize::new(0));
        let created_clone = created.clone();
        client.events().subscribe(REQUEST_CREATE, move |event| {
            assert!(event.request().is_some());
            created_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let request = client.get("items?page=2").unwrap();

        assert_eq!(request.url(), "http://api.example.com/v1/items?page=2");
        assert_eq!(request.header("accept").as_deref(), Some("application/json"));
        assert!(request.header("user-agent").unwrap().starts_with("volley/"));
        assert_eq!(request.timeout_ms(), Some(2_000));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let absolute = client.get("http://other.example.com/x").unwrap();
        assert_eq!(absolute.url(), "http://other.example.com/x");
    }

    #[test]
    fn test_create_request_rejects_relative_url_without_base() {
        let client = Client::with_multiplexer(ClientConfig::default(), MockMultiplexer::new());
        assert!(matches!(client.get("items"), Err(VolleyError::Other(_))));
    }

    #[test]
    fn test_send_returns_response() {
        let mock = MockMultiplexer::new();
        mock.add_response("POST /v1/items", HttpResponse::new(201).with_body("{\"id\":7}"));
        let client = client(&mock);

        let request = client.post("items", "{\"name\":\"x\"}").unwrap();
        let response = client.send(&request).unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(mock.calls()[0].body, "{\"name\":\"x\"}");
        assert!(client.pool().is_empty());
    }

    #[test]
    fn test_send_unwraps_single_failure() {
        let mock = MockMultiplexer::new();
        mock.add_failure("GET /v1/down", TransferCode::CouldNotConnect, "Connection refused");
        let client = client(&mock);

        let err = client.send(&client.get("down").unwrap()).unwrap_err();
        let VolleyError::Transfer(transfer) = err else {
            panic!("expected a transfer error");
        };
        assert_eq!(transfer.code, TransferCode::CouldNotConnect);
        assert_eq!(transfer.message, "Connection refused");
    }

    #[test]
    fn test_send_all_keeps_request_order() {
        let mock = MockMultiplexer::new();
        mock.add_response("GET /v1/a", HttpResponse::new(200).with_body("a"));
        mock.add_response("GET /v1/b", HttpResponse::new(200).with_body("b"));
        let client = client(&mock);

        let requests = vec![client.get("b").unwrap(), client.get("a").unwrap()];
        let bodies: Vec<String> = client
            .send_all(&requests)
            .unwrap()
            .into_iter()
            .map(|r| r.body)
            .collect();
        assert_eq!(bodies, vec!["b", "a"]);
    }
}
