//! Commands: one request plus the logic that turns its response into a result.
//!
//! A [`Command`] delegates the domain-specific parts (how to build the request, how to
//! read the response) to a [`CommandBehavior`] and handles the lifecycle itself:
//!
//! ```text
//! created ──prepare()──> prepared ──(request complete)──> executed ──result()──> result cached
//! ```
//!
//! Commands run one at a time through [`Command::execute`] or in parallel through a
//! [`CommandBatch`].

pub mod batch;
pub mod http;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::client::{COMMAND_AFTER_SEND, COMMAND_BEFORE_SEND, Client};
use crate::error::{Result, VolleyError};
use crate::event::{Event, EventContext};
use crate::http::HttpResponse;
use crate::request::{Request, RequestState};

pub use batch::{CommandBatch, CommandSelector};
pub use http::HttpCommand;

/// Request parameter under which a batch records the command that owns a request.
pub const COMMAND_PARAM: &str = "command";

/// Domain logic of a command.
pub trait CommandBehavior: Send + Sync {
    /// Category of the command; batches can remove commands by name.
    fn name(&self) -> &str;

    /// Build the request this command sends.
    fn build(&self, client: &Client) -> Result<Request>;

    /// Turn the completed request's response into the command's result.
    fn process(&self, request: &Request, response: &HttpResponse) -> Result<CommandResult> {
        let _ = request;
        Ok(CommandResult::from_response(response))
    }

    /// Whether the command may share a send cycle with other commands.
    fn can_batch(&self) -> bool {
        true
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The response body, parsed because it declared a JSON content type
    Json(Value),
    /// The raw response
    Response(HttpResponse),
}

impl CommandResult {
    /// JSON if the response says it is JSON and parses as such, the raw response otherwise.
    pub fn from_response(response: &HttpResponse) -> Self {
        let is_json = response
            .content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        if is_json && let Ok(value) = serde_json::from_str(&response.body) {
            return CommandResult::Json(value);
        }
        CommandResult::Response(response.clone())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CommandResult::Json(value) => Some(value),
            CommandResult::Response(_) => None,
        }
    }

    /// Deserialize the result into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            CommandResult::Json(value) => Ok(serde_json::from_value(value.clone())?),
            CommandResult::Response(response) => Ok(serde_json::from_str(&response.body)?),
        }
    }
}

/// Unique identifier for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Uuid);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    id: CommandId,
    behavior: Box<dyn CommandBehavior>,
    core: Mutex<CommandCore>,
}

#[derive(Default)]
struct CommandCore {
    client: Option<Client>,
    request: Option<Request>,
    result: Option<CommandResult>,
}

impl Command {
    /// Wrap `behavior` in a new command with no client yet.
    pub fn new(behavior: impl CommandBehavior + 'static) -> Self {
        Self {
            inner: Arc::new(CommandInner {
                id: CommandId(Uuid::new_v4()),
                behavior: Box::new(behavior),
                core: Mutex::new(CommandCore::default()),
            }),
        }
    }

    /// Bind the command to `client` (builder form of [`Command::set_client`]).
    pub fn with_client(self, client: Client) -> Self {
        self.set_client(client);
        self
    }

    /// Unique id; a batch stores it on the request under [`COMMAND_PARAM`].
    pub fn id(&self) -> CommandId {
        self.inner.id
    }

    /// Category of the command, as reported by its behavior.
    pub fn name(&self) -> &str {
        self.inner.behavior.name()
    }

    /// Whether a batch may send this command alongside others.
    pub fn can_batch(&self) -> bool {
        self.inner.behavior.can_batch()
    }

    /// The client the command sends through, if bound.
    pub fn client(&self) -> Option<Client> {
        self.inner.core.lock().client.clone()
    }

    /// Bind the command to `client`. A request already prepared keeps the client it
    /// was built with.
    pub fn set_client(&self, client: Client) {
        self.inner.core.lock().client = Some(client);
    }

    /// The prepared request, if [`Command::prepare`] ran.
    pub fn request(&self) -> Option<Request> {
        self.inner.core.lock().request.clone()
    }

    /// Whether the request has been built.
    pub fn is_prepared(&self) -> bool {
        self.inner.core.lock().request.is_some()
    }

    /// True once the command's request is complete.
    pub fn is_executed(&self) -> bool {
        self.request()
            .is_some_and(|r| r.state() == RequestState::Complete)
    }

    /// Build the request once; later calls return the same request.
    pub fn prepare(&self) -> Result<Request> {
        let client = {
            let core = self.inner.core.lock();
            if let Some(request) = &core.request {
                return Ok(request.clone());
            }
            core.client
                .clone()
                .ok_or_else(|| VolleyError::MissingClient(self.name().to_string()))?
        };

        let request = self.inner.behavior.build(&client)?;
        tracing::debug!(
            command_id = %self.id(),
            command = self.name(),
            request_id = %request.id(),
            "Prepared command"
        );

        let mut core = self.inner.core.lock();
        Ok(core.request.get_or_insert(request).clone())
    }

    /// Send the command's request on its own and extract the result.
    pub fn execute(&self) -> Result<()> {
        let request = self.prepare()?;
        self.clear_result();
        let client = self
            .client()
            .ok_or_else(|| VolleyError::MissingClient(self.name().to_string()))?;

        client.events().dispatch(&Event::new(
            COMMAND_BEFORE_SEND,
            EventContext::Command(self.clone()),
        ))?;
        client.send(&request)?;
        self.process_result()?;
        client.events().dispatch(&Event::new(
            COMMAND_AFTER_SEND,
            EventContext::Command(self.clone()),
        ))?;
        Ok(())
    }

    /// The command's result, executing the command first if needed.
    pub fn result(&self) -> Result<CommandResult> {
        if let Some(result) = self.inner.core.lock().result.clone() {
            return Ok(result);
        }
        if !self.is_executed() {
            self.execute()?;
            if let Some(result) = self.inner.core.lock().result.clone() {
                return Ok(result);
            }
        }
        self.process_result()
    }

    /// Forget the result of a previous run before the request is sent again.
    pub(crate) fn clear_result(&self) {
        self.inner.core.lock().result = None;
    }

    fn process_result(&self) -> Result<CommandResult> {
        let request = self.prepare()?;
        let response = request
            .response()
            .ok_or(VolleyError::MissingResponse(request.id()))?;
        let result = self.inner.behavior.process(&request, &response)?;
        self.inner.core.lock().result = Some(result.clone());
        Ok(result)
    }

    /// Whether two handles refer to the same command.
    pub fn ptr_eq(&self, other: &Command) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A handle that does not keep the command alive.
    pub fn downgrade(&self) -> WeakCommand {
        WeakCommand {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("can_batch", &self.can_batch())
            .finish()
    }
}

/// A command reference that does not keep the command alive.
#[derive(Clone)]
pub struct WeakCommand {
    inner: Weak<CommandInner>,
}

impl WeakCommand {
    pub fn upgrade(&self) -> Option<Command> {
        self.inner.upgrade().map(|inner| Command { inner })
    }
}
