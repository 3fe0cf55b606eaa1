//! [`RequestCache`] – TTL cache that also collapses concurrent fetches.
//!
//! For a given key, [`RequestCache::get`]:
//!
//! 1. returns an already-resolved future when a cached value is younger
//!    than `ttl`;
//! 2. otherwise returns a clone of the in-flight shared future if a fetch
//!    is running;
//! 3. otherwise starts exactly one fetch on a spawned task.
//!
//! The spawned task owns the fetch, so it completes even if every caller
//! drops its future.  On completion it caches a successful value and always
//! clears the in-flight marker, unless [`RequestCache::clear`] ran in the
//! meantime: the generation check keeps a late result out of a cache that
//! was torn down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetsync_types::FleetError;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::debug;

/// Future handed to every caller of [`RequestCache::get`].
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FleetError>>>;

struct Flight<T> {
    id: u64,
    future: SharedFetch<T>,
}

struct CacheEntry<T> {
    value: Option<(T, Instant)>,
    in_flight: Option<Flight<T>>,
}

impl<T> Default for CacheEntry<T> {
    fn default() -> Self {
        Self {
            value: None,
            in_flight: None,
        }
    }
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    generation: u64,
    next_flight: u64,
    fetches: u64,
}

pub struct RequestCache<T> {
    inner: Arc<Mutex<CacheInner<T>>>,
}

impl<T> Default for RequestCache<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                generation: 0,
                next_flight: 0,
                fetches: 0,
            })),
        }
    }
}

fn lock<T>(inner: &Mutex<CacheInner<T>>) -> MutexGuard<'_, CacheInner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key`, invoking `fetcher` only when there is neither a fresh
    /// cached value nor a fetch already in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FleetError>> + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let entry = inner.entries.entry(key.to_string()).or_default();

        if let Some((value, stored_at)) = &entry.value
            && now.saturating_duration_since(*stored_at) < ttl
        {
            let value = value.clone();
            return async move { Ok(value) }.boxed().shared();
        }
        if let Some(flight) = &entry.in_flight {
            debug!(key, "joining in-flight fetch");
            return flight.future.clone();
        }

        let generation = inner.generation;
        inner.next_flight += 1;
        inner.fetches += 1;
        let flight_id = inner.next_flight;

        let fetch = fetcher();
        let cache = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        // Completion locks `inner`, which we still hold, so the in-flight
        // marker below is always in place before it can be cleared.
        let task = tokio::spawn(async move {
            let result = fetch.await;
            let mut inner = lock(&cache);
            if inner.generation == generation
                && let Some(entry) = inner.entries.get_mut(&owned_key)
            {
                if entry.in_flight.as_ref().is_some_and(|f| f.id == flight_id) {
                    entry.in_flight = None;
                }
                if let Ok(value) = &result {
                    entry.value = Some((value.clone(), Instant::now()));
                }
            } else {
                debug!(key = %owned_key, "discarding fetch result after cache clear");
            }
            result
        });

        let future = async move {
            task.await
                .unwrap_or_else(|e| Err(FleetError::Unavailable(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared();

        let entry = inner.entries.entry(key.to_string()).or_default();
        entry.in_flight = Some(Flight {
            id: flight_id,
            future: future.clone(),
        });
        future
    }

    /// Forget `key`'s cached value.  An in-flight fetch is left alone.
    pub fn invalidate(&self, key: &str) {
        if let Some(entry) = lock(&self.inner).entries.get_mut(key) {
            entry.value = None;
        }
    }

    /// Drop every entry and advance the generation.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.entries.clear();
        inner.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner).generation
    }

    /// Number of real fetcher invocations so far.
    pub fn fetch_count(&self) -> u64 {
        lock(&self.inner).fetches
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.inner)
            .entries
            .get(key)
            .is_some_and(|e| e.in_flight.is_some())
    }
}
