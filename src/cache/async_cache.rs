use super::{LazyFuture, VolatileMap};
use crate::clock::SharedClock;
use crate::error::Result;
use std::{future::Future, hash::Hash, time::Duration};

/// Expirable cache of deduplicated producers.
///
/// This is the get-or-install idiom behind every expensive derived value in
/// the service: read the entry, or install a fresh [`LazyFuture`] and let
/// whoever lost the race adopt the winner's future. The producer runs at
/// most once per TTL epoch. A producer failure invalidates the entry so the
/// next caller retries, whichever future was awaited.
pub struct AsyncCache<K, V: Clone> {
    map: VolatileMap<K, LazyFuture<V>>,
}

impl<K, V> AsyncCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(clock: SharedClock) -> Self {
        Self {
            map: VolatileMap::new(clock),
        }
    }

    /// The cached value for `key`, or the awaited outcome of `producer`
    /// installed under `ttl`. Concurrent callers of the same key share a
    /// single producer run.
    pub async fn get_or_insert<F>(&self, key: K, ttl: Duration, producer: F) -> Result<V>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(existing) = self.map.try_get(&key) {
            return self.await_entry(&key, existing).await;
        }
        let fresh = LazyFuture::new(producer);
        loop {
            if self.map.try_add(key.clone(), fresh.clone(), ttl) {
                return self.await_entry(&key, fresh).await;
            }
            // Lost the install race; adopt the winner. The winner can expire
            // or be invalidated between the two calls, in which case the
            // next iteration installs our (still unpolled) future after all.
            if let Some(winner) = self.map.try_get(&key) {
                return self.await_entry(&key, winner).await;
            }
        }
    }

    /// The value for `key`, only if its producer already completed
    /// successfully.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.map.try_get(key)?.peek()?.ok()
    }

    pub fn invalidate(&self, key: &K) {
        self.map.invalidate(key);
    }

    async fn await_entry(&self, key: &K, entry: LazyFuture<V>) -> Result<V> {
        match entry.value().await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.map.invalidate(key);
                Err(err)
            }
        }
    }
}
