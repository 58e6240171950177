//! In-process TTL cache with singleflight semantics
//!
//! Shared by the embedding cache, the query result cache, and the
//! idempotency cache. At most one computation runs per key process-wide;
//! concurrent readers of a cold key await the same in-flight computation
//! rather than starting their own.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::Result;

struct Slot<V> {
    cell: Arc<OnceCell<V>>,
    created_at: Instant,
}

/// TTL cache keyed by `K`. A `ttl` of `None` means entries never expire.
pub struct TtlCache<K, V> {
    ttl: Option<Duration>,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(key) {
            let expired = self
                .ttl
                .is_some_and(|ttl| existing.created_at.elapsed() > ttl)
                && existing.cell.initialized();
            if !expired {
                return existing.cell.clone();
            }
        }
        let fresh = Slot {
            cell: Arc::new(OnceCell::new()),
            created_at: Instant::now(),
        };
        let cell = fresh.cell.clone();
        slots.insert(key.clone(), fresh);
        cell
    }

    /// Return the cached value for `key`, computing it via `init` on a miss.
    ///
    /// Concurrent callers with the same key share one computation. A failed
    /// computation leaves the slot empty, so later callers retry.
    pub async fn get_or_try_compute<F, Fut>(&self, key: K, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = self.slot(&key);
        let value = cell.get_or_try_init(init).await?;
        Ok(value.clone())
    }

    /// Fetch a ready, unexpired value without computing
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock();
        let slot = slots.get(key)?;
        if self.ttl.is_some_and(|ttl| slot.created_at.elapsed() > ttl) {
            return None;
        }
        slot.cell.get().cloned()
    }

    /// Store a value directly, replacing any existing entry
    pub fn insert(&self, key: K, value: V) {
        let mut slots = self.slots.lock();
        slots.insert(
            key,
            Slot {
                cell: Arc::new(OnceCell::new_with(Some(value))),
                created_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries
    pub fn purge_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| slot.created_at.elapsed() <= ttl || !slot.cell.initialized());
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
