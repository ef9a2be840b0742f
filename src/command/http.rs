use crate::client::Client;
use crate::error::Result;
use crate::http::Headers;
use crate::request::Request;

use super::CommandBehavior;

/// A command described entirely by its request: method, URI, headers and body.
///
/// # Example
/// ```ignore
/// let command = Command::new(
///     HttpCommand::post("widgets.create", "widgets", r#"{"name":"bolt"}"#)
///         .with_header("Content-Type", "application/json"),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct HttpCommand {
    name: String,
    method: String,
    uri: String,
    headers: Headers,
    body: Option<String>,
    batchable: bool,
}

impl HttpCommand {
    pub fn new(name: impl Into<String>, method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            uri: uri.into(),
            headers: Headers::new(),
            body: None,
            batchable: true,
        }
    }

    pub fn get(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::new(name, "GET", uri)
    }

    pub fn delete(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::new(name, "DELETE", uri)
    }

    pub fn post(name: impl Into<String>, uri: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name, "POST", uri).with_body(body)
    }

    pub fn put(name: impl Into<String>, uri: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name, "PUT", uri).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Run this command on its own, in order, instead of in parallel with others.
    pub fn serial(mut self) -> Self {
        self.batchable = false;
        self
    }
}

impl CommandBehavior for HttpCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, client: &Client) -> Result<Request> {
        let request = client.create_request(&self.method, &self.uri)?;
        for (name, value) in self.headers.iter() {
            request.set_header(name, value);
        }
        if let Some(body) = &self.body {
            request.set_body(body.as_str());
        }
        Ok(request)
    }

    fn can_batch(&self) -> bool {
        self.batchable
    }
}
