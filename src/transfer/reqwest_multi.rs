//! Production multiplexer using reqwest.
//!
//! Each registered transfer runs as a task on a small background runtime owned by the
//! multiplexer. Finished transfers come back over a channel and are surfaced through
//! `exec`/`info_read`, so the pool's control flow stays synchronous.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{Result, VolleyError};
use crate::http::{Headers, HttpResponse};

use super::{
    HandleId, MultiStatus, Multiplexer, TransferCode, TransferInfo, TransferMessage, TransferSpec,
    outgoing_log,
};

/// Configuration for [`ReqwestMultiplexer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqwestConfig {
    /// Worker threads of the background runtime driving transfers
    pub worker_threads: usize,
    /// Timeout for establishing a connection, applied to every transfer
    pub connect_timeout_ms: u64,
}

impl Default for ReqwestConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            connect_timeout_ms: 10_000,
        }
    }
}

struct Completion {
    handle: HandleId,
    outcome: std::result::Result<HttpResponse, (TransferCode, String)>,
}

struct LiveTransfer {
    url: String,
    request: Option<reqwest::Request>,
    abort: Option<AbortHandle>,
    started: Option<Instant>,
    done: bool,
    log: String,
    error: Option<String>,
    response: Option<HttpResponse>,
    info: TransferInfo,
}

/// Drives real HTTP transfers.
///
/// The multiplexer blocks in `select`, so it must not be used from inside an async
/// runtime.
pub struct ReqwestMultiplexer {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    next_id: u64,
    transfers: HashMap<HandleId, LiveTransfer>,
    completed_tx: mpsc::UnboundedSender<Completion>,
    completed_rx: mpsc::UnboundedReceiver<Completion>,
    ready: VecDeque<Completion>,
    messages: VecDeque<TransferMessage>,
}

impl ReqwestMultiplexer {
    pub fn new() -> Result<Self> {
        Self::with_config(ReqwestConfig::default())
    }

    pub fn with_config(config: ReqwestConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("volley-transfer")
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to start transfer runtime: {}", e))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;

        let (completed_tx, completed_rx) = mpsc::unbounded_channel();

        tracing::debug!(
            worker_threads = config.worker_threads,
            connect_timeout_ms = config.connect_timeout_ms,
            "Created reqwest multiplexer"
        );

        Ok(Self {
            runtime,
            client,
            next_id: 0,
            transfers: HashMap::new(),
            completed_tx,
            completed_rx,
            ready: VecDeque::new(),
            messages: VecDeque::new(),
        })
    }

    fn active(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| t.abort.is_some() && !t.done)
            .count()
    }

    fn finish(&mut self, completion: Completion) {
        let Some(transfer) = self.transfers.get_mut(&completion.handle) else {
            return;
        };
        // Aborted or already reported
        if transfer.done || transfer.abort.is_none() {
            return;
        }
        transfer.done = true;
        transfer.info.total_time_ms = transfer
            .started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let result = match completion.outcome {
            Ok(mut response) => {
                transfer.log.push_str(&format!(
                    "< HTTP/{} {} {}\n",
                    response.protocol_version, response.status, response.reason
                ));
                for (name, value) in response.headers.iter() {
                    transfer.log.push_str(&format!("< {}: {}\n", name, value));
                }
                transfer.info.http_code = response.status;
                transfer.info.size_download = response.body.len() as u64;
                response.info = Some(transfer.info.clone());
                transfer.response = Some(response);
                TransferCode::Ok
            }
            Err((code, message)) => {
                transfer.log.push_str(&format!("* {}\n", message));
                transfer.error = Some(message);
                code
            }
        };

        tracing::trace!(handle = %completion.handle, result = %result, "Transfer finished");
        self.messages.push_back(TransferMessage {
            handle: completion.handle,
            result,
        });
    }
}

fn version_str(version: reqwest::Version) -> &'static str {
    if version == reqwest::Version::HTTP_10 {
        "1.0"
    } else if version == reqwest::Version::HTTP_2 {
        "2"
    } else if version == reqwest::Version::HTTP_3 {
        "3"
    } else if version == reqwest::Version::HTTP_09 {
        "0.9"
    } else {
        "1.1"
    }
}

fn classify(error: &reqwest::Error) -> TransferCode {
    if error.is_timeout() {
        TransferCode::OperationTimedOut
    } else if error.is_connect() {
        TransferCode::CouldNotConnect
    } else if error.is_builder() {
        TransferCode::MalformedUrl
    } else if error.is_request() {
        TransferCode::SendError
    } else if error.is_body() || error.is_decode() {
        TransferCode::RecvError
    } else {
        TransferCode::Other(-1)
    }
}

fn failure(error: reqwest::Error) -> (TransferCode, String) {
    let code = classify(&error);
    let mut message = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        message.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    (code, message)
}

async fn perform(
    client: reqwest::Client,
    request: reqwest::Request,
) -> std::result::Result<HttpResponse, (TransferCode, String)> {
    let response = client.execute(request).await.map_err(failure)?;

    let status = response.status();
    let protocol_version = version_str(response.version()).to_string();
    let headers: Headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.text().await.map_err(failure)?;

    Ok(HttpResponse {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
        protocol_version,
        headers,
        body,
        info: None,
    })
}

impl Multiplexer for ReqwestMultiplexer {
    fn exec(&mut self) -> MultiStatus {
        while let Some(completion) = self.ready.pop_front() {
            self.finish(completion);
        }
        while let Ok(completion) = self.completed_rx.try_recv() {
            self.finish(completion);
        }
        MultiStatus::ok(self.active())
    }

    fn info_read(&mut self) -> Option<TransferMessage> {
        self.messages.pop_front()
    }

    fn select(&mut self, timeout: Duration) -> usize {
        if !self.messages.is_empty() || !self.ready.is_empty() {
            return self.messages.len() + self.ready.len();
        }
        if self.active() == 0 {
            return 0;
        }

        let rx = &mut self.completed_rx;
        let runtime = &self.runtime;
        let received = runtime.block_on(async { tokio::time::timeout(timeout, rx.recv()).await });

        match received {
            Ok(Some(completion)) => {
                self.ready.push_back(completion);
                while let Ok(more) = self.completed_rx.try_recv() {
                    self.ready.push_back(more);
                }
                self.ready.len()
            }
            _ => 0,
        }
    }

    fn create(&mut self, spec: TransferSpec) -> Result<HandleId> {
        let method = reqwest::Method::from_bytes(spec.method.as_bytes()).map_err(|e| {
            tracing::error!(method = %spec.method, error = %e, "Invalid HTTP method");
            anyhow::anyhow!("Invalid HTTP method '{}': {}", spec.method, e)
        })?;
        let url = reqwest::Url::parse(&spec.url)
            .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", spec.url, e))?;

        let mut request = reqwest::Request::new(method, url.clone());
        for (name, value) in spec.headers.iter() {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("Invalid header name '{}': {}", name, e))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("Invalid value for header '{}': {}", name, e))?;
            request.headers_mut().append(name, value);
        }
        if !spec.body.is_empty() {
            *request.body_mut() = Some(spec.body.clone().into());
        }
        if let Some(timeout_ms) = spec.timeout_ms {
            *request.timeout_mut() = Some(Duration::from_millis(timeout_ms));
        }
        let version = if spec.protocol_version == "1.0" {
            *request.version_mut() = reqwest::Version::HTTP_10;
            "1.0"
        } else {
            "1.1"
        };

        // Headers the transport adds on its own, so the log shows what went out
        let mut wire_headers = spec.headers.clone();
        if let Some(host) = url.host_str()
            && !wire_headers.contains("Host")
        {
            let host = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            wire_headers.set("Host", host);
        }
        if !wire_headers.contains("Accept") {
            wire_headers.append("Accept", "*/*");
        }
        if !spec.body.is_empty() && !wire_headers.contains("Content-Length") {
            wire_headers.append("Content-Length", spec.body.len().to_string());
        }
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut log = format!("* Preparing transfer to {}\n", spec.url);
        log.push_str(&outgoing_log(&spec.method, &target, version, &wire_headers));

        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.transfers.insert(
            id,
            LiveTransfer {
                url: spec.url.clone(),
                request: Some(request),
                abort: None,
                started: None,
                done: false,
                log,
                error: None,
                response: None,
                info: TransferInfo {
                    url: spec.url,
                    ..Default::default()
                },
            },
        );
        Ok(id)
    }

    fn register(&mut self, handle: HandleId) -> Result<()> {
        let Some(transfer) = self.transfers.get_mut(&handle) else {
            return Err(VolleyError::Protocol(format!(
                "unknown transfer handle {}",
                handle
            )));
        };
        let Some(request) = transfer.request.take() else {
            return Err(VolleyError::Protocol(format!(
                "transfer handle {} is already registered",
                handle
            )));
        };

        let client = self.client.clone();
        let tx = self.completed_tx.clone();
        let task = self.runtime.spawn(async move {
            let outcome = perform(client, request).await;
            // Receiver only goes away with the multiplexer
            let _ = tx.send(Completion { handle, outcome });
        });

        transfer.abort = Some(task.abort_handle());
        transfer.started = Some(Instant::now());
        transfer.info.started_at = Some(Utc::now());
        tracing::debug!(handle = %handle, url = %transfer.url, "Started transfer");
        Ok(())
    }

    fn unregister(&mut self, handle: HandleId) {
        if let Some(transfer) = self.transfers.get_mut(&handle)
            && let Some(abort) = transfer.abort.take()
            && !transfer.done
        {
            abort.abort();
            tracing::debug!(handle = %handle, url = %transfer.url, "Aborted transfer");
        }
    }

    fn close(&mut self, handle: HandleId) {
        self.transfers.remove(&handle);
    }

    fn log(&self, handle: HandleId) -> Option<String> {
        self.transfers.get(&handle).map(|t| t.log.clone())
    }

    fn error_message(&self, handle: HandleId) -> Option<String> {
        self.transfers.get(&handle).and_then(|t| t.error.clone())
    }

    fn info(&self, handle: HandleId) -> TransferInfo {
        self.transfers
            .get(&handle)
            .map(|t| t.info.clone())
            .unwrap_or_default()
    }

    fn take_response(&mut self, handle: HandleId) -> Option<HttpResponse> {
        self.transfers
            .get_mut(&handle)
            .and_then(|t| t.response.take())
    }
}

impl Drop for ReqwestMultiplexer {
    fn drop(&mut self) {
        for transfer in self.transfers.values() {
            if let Some(abort) = &transfer.abort {
                abort.abort();
            }
        }
    }
}
