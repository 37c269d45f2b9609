//! Per-symbol writer locks.
//!
//! Every write path touching a symbol's rows takes this lock first and holds
//! it for the duration of the write. Keys are a deterministic hash of the
//! storage symbol. With the embedded database there is exactly one writer
//! process, so the registry lives in-process; readers never lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct SymbolLocks {
    inner: DashMap<u64, Arc<Mutex<()>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(symbol: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        hasher.finish()
    }

    /// Acquire the exclusive writer lock for `symbol`, waiting if another
    /// task holds it.
    pub async fn acquire(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .entry(Self::key(symbol))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
