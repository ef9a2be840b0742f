//! Process-wide named pools.
//!
//! Clients that do not bring their own pool share one from here. Pools are built on
//! first use and live until [`teardown`] is called; independent pools can always be
//! constructed with [`TransferPool::new`] instead.

use std::sync::OnceLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::Result;
use crate::transfer::ReqwestMultiplexer;

use super::TransferPool;

/// Name of the pool returned by [`shared`].
pub const DEFAULT_POOL: &str = "default";

static POOLS: OnceLock<DashMap<String, TransferPool>> = OnceLock::new();

fn pools() -> &'static DashMap<String, TransferPool> {
    POOLS.get_or_init(DashMap::new)
}

/// The default shared pool, backed by a [`ReqwestMultiplexer`].
pub fn shared() -> Result<TransferPool> {
    shared_named(DEFAULT_POOL)
}

/// A named shared pool, backed by a [`ReqwestMultiplexer`] when first created.
pub fn shared_named(name: &str) -> Result<TransferPool> {
    shared_with(name, || Ok(TransferPool::new(ReqwestMultiplexer::new()?)))
}

/// A named shared pool, built by `factory` if it does not exist yet.
pub fn shared_with<F>(name: &str, factory: F) -> Result<TransferPool>
where
    F: FnOnce() -> Result<TransferPool>,
{
    if let Some(pool) = pools().get(name) {
        return Ok(pool.clone());
    }
    match pools().entry(name.to_string()) {
        Entry::Occupied(entry) => Ok(entry.get().clone()),
        Entry::Vacant(entry) => {
            let pool = factory()?;
            tracing::debug!(name, pool_id = %pool.id(), "Registered shared pool");
            entry.insert(pool.clone());
            Ok(pool)
        }
    }
}

/// Reset and forget a shared pool. Returns `false` if no pool had that name.
///
/// Clients still holding the pool keep a working, now unregistered, pool.
pub fn teardown(name: &str) -> Result<bool> {
    let Some((_, pool)) = pools().remove(name) else {
        return Ok(false);
    };
    tracing::debug!(name, pool_id = %pool.id(), "Tearing down shared pool");
    pool.reset()?;
    Ok(true)
}
