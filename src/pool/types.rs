//! Pool configuration, state and event names.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatched after a request is attached to the pool.
pub const ADD_REQUEST: &str = "add_request";
/// Dispatched after a request is detached from the pool.
pub const REMOVE_REQUEST: &str = "remove_request";
/// Dispatched after the pool was reset.
pub const RESET: &str = "reset";
/// Dispatched once per outermost send, before any transfer starts.
pub const BEFORE_SEND: &str = "before_send";
/// Dispatched once per outermost send, after every request reached a terminal state.
pub const COMPLETE: &str = "complete";
/// Dispatched after every pass that left requests in flight.
pub const POLLING: &str = "polling";
/// Dispatched when processing a finished transfer failed.
pub const EXCEPTION: &str = "exception";
/// Dispatched for every message read from the multiplexer.
pub const MESSAGE: &str = "message";

/// Configuration for a transfer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Longest a pass waits in the multiplexer for transfers to make progress
    pub select_timeout_ms: u64,

    /// How long to sleep between passes when requests are pending but none is on the wire
    pub idle_sleep_ms: u64,

    /// Consecutive empty waits a nested send tolerates before handing control back to
    /// the send that contains it
    pub max_failed_selects: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: 300,
            idle_sleep_ms: 30,
            max_failed_selects: 25,
        }
    }
}

impl PoolConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// State of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Idle,
    Sending,
    /// Every request of the outermost send finished; the pool returns to `Idle` right after
    Complete,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolState::Idle => "idle",
            PoolState::Sending => "sending",
            PoolState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Unique identifier for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub Uuid);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for PoolId {
    fn from(uuid: Uuid) -> Self {
        PoolId(uuid)
    }
}
