//! HTTP message types shared by requests, responses and multiplexers.
//!
//! The wire mechanics live behind the `Multiplexer` trait; this module only holds the
//! values that flow through it.

use serde::{Deserialize, Serialize};

use crate::transfer::TransferInfo;

/// An ordered, case-insensitive header list.
///
/// Insertion order is kept so that headers reconciled from a transfer log read back in
/// the order they were sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the first value for a header name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a header, replacing every existing value with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(pos) = self
            .0
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            self.0[pos] = (name.clone(), value);
            let mut index = 0;
            self.0.retain(|(key, _)| {
                let keep = index <= pos || !key.eq_ignore_ascii_case(&name);
                index += 1;
                keep
            });
        } else {
            self.0.push((name, value));
        }
    }

    /// Append a value without touching existing headers of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.0.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Response to an HTTP request.
///
/// Produced either by a multiplexer after a real transfer or by a caller that assigns a
/// response up front (see `Request::queue_response`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase (e.g. "Not Found")
    pub reason: String,
    /// Protocol version as sent by the server (e.g. "1.1")
    pub protocol_version: String,
    pub headers: Headers,
    /// Response body as a string
    pub body: String,
    /// Transfer statistics, present when the response came off the wire
    pub info: Option<TransferInfo>,
}

impl HttpResponse {
    /// Create an empty-bodied response with the canonical reason phrase for `status`.
    pub fn new(status: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            status,
            reason,
            protocol_version: "1.1".to_string(),
            headers: Headers::new(),
            body: String::new(),
            info: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True for client (4xx) and server (5xx) errors.
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }
}
