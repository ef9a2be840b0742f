//! Parallel HTTP transfers with event-driven request pools and batched commands.
//!
//! A [`TransferPool`] drives many requests at once through a non-blocking
//! [`Multiplexer`], emitting events as requests start, finish and fail. Observers may
//! attach new requests, resolve requests without a transfer, or start nested sends
//! while a send is in progress. On top of the pool, [`Command`]s pair a request with
//! the logic that interprets its response, and a [`CommandBatch`] runs many commands
//! across one or more pools.
//!
//! Failures of individual transfers never stop their siblings: each send collects them
//! and reports them together as one [`AggregateError`].

pub mod client;
pub mod command;
pub mod error;
pub mod event;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod transfer;

// Re-export commonly used types
pub use client::{Client, ClientConfig};
pub use command::{Command, CommandBatch, CommandBehavior, CommandResult, HttpCommand};
pub use error::{AggregateError, Result, TransferError, VolleyError};
pub use event::{Event, EventContext, EventDispatcher, SubscriptionId};
pub use http::{Headers, HttpResponse};
pub use pool::{PoolConfig, PoolState, TransferPool};
pub use request::{Request, RequestData, RequestId, RequestState, ResponseOrigin};
pub use transfer::{
    MockMultiplexer, Multiplexer, ReqwestConfig, ReqwestMultiplexer, TransferCode, TransferInfo,
};
