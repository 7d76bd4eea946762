//! Keyed TTL store with single-flight fetches.
//!
//! Each key holds at most one cached value and at most one in-flight fetch. Concurrent misses on
//! the same key await the same shared future, so the upstream sees one request. Every awaiter
//! runs the same completion step, which is a no-op after the first, so the result is stored even
//! if the caller that started the fetch was dropped.
//!
//! `invalidate` bumps the key's generation: a fetch that was started before the bump may still
//! answer its awaiters, but its result is never stored.

use futures::{
    future::{BoxFuture, Shared},
    FutureExt as _,
};
use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;

use crate::errors::CoreError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CoreError>>>;

struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

struct InFlight<V> {
    ticket: u64,
    fut: SharedFetch<V>,
}

struct Slot<V> {
    value: Option<Cached<V>>,
    in_flight: Option<InFlight<V>>,
    generation: u64,
}

impl<V> Slot<V> {
    const fn empty() -> Self {
        Self {
            value: None,
            in_flight: None,
            generation: 0,
        }
    }
}

pub struct KeyedStore<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
    next_ticket: AtomicU64,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, c: &Cached<V>) -> bool {
        c.fetched_at.elapsed() < self.ttl
    }

    /// Fresh cached value, if any. Never triggers a fetch.
    pub fn peek(&self, key: &K) -> Option<V> {
        let slots = self.slots();
        let cached = slots.get(key)?.value.as_ref()?;
        self.is_fresh(cached).then(|| cached.value.clone())
    }

    /// Return the fresh value for `key`, join the in-flight fetch, or start one with `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CoreError>> + Send + 'static,
    {
        let (ticket, generation, fut) = {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::empty);
            if let Some(c) = slot.value.as_ref().filter(|c| self.is_fresh(c)) {
                tracing::trace!(?key, "cache hit");
                return Ok(c.value.clone());
            }
            if let Some(f) = &slot.in_flight {
                tracing::trace!(?key, "joining in-flight fetch");
                (f.ticket, slot.generation, f.fut.clone())
            } else {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let fut = fetch().boxed().shared();
                slot.in_flight = Some(InFlight {
                    ticket,
                    fut: fut.clone(),
                });
                tracing::trace!(?key, ticket, "cache miss; fetching");
                (ticket, slot.generation, fut)
            }
        };

        let res = fut.await;
        self.complete(&key, ticket, generation, &res);
        res
    }

    fn complete(&self, key: &K, ticket: u64, generation: u64, res: &Result<V, CoreError>) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if !slot.in_flight.as_ref().is_some_and(|f| f.ticket == ticket) {
            return;
        }
        slot.in_flight = None;
        if slot.generation != generation {
            return;
        }
        if let Ok(v) = res {
            slot.value = Some(Cached {
                value: v.clone(),
                fetched_at: Instant::now(),
            });
        }
    }

    /// Drop the cached value and detach any in-flight fetch so the next read refetches.
    pub fn invalidate(&self, key: &K) {
        if let Some(slot) = self.slots().get_mut(key) {
            slot.value = None;
            slot.in_flight = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Remove every trace of `key`.
    pub fn forget(&self, key: &K) {
        self.slots().remove(key);
    }

    pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) {
        for (k, slot) in self.slots().iter_mut() {
            if pred(k) {
                slot.value = None;
                slot.in_flight = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    pub fn clear(&self) {
        self.slots().clear();
    }
}
