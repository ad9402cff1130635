use crate::clock::SharedClock;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::{
    borrow::Borrow,
    hash::Hash,
    time::{Duration, SystemTime},
};

struct Expirable<V> {
    value: V,
    expires_at: SystemTime,
}

/// Concurrent key→value cache where every entry carries an absolute expiry.
///
/// Expired entries behave as absent: they lose `try_add` races, miss on
/// `try_get`, and are removed opportunistically when a lookup walks over
/// them. There is no background sweeper.
pub struct VolatileMap<K, V> {
    clock: SharedClock,
    entries: DashMap<K, Expirable<V>>,
}

impl<K: Eq + Hash, V: Clone> VolatileMap<K, V> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    /// Inserts `value` if the key is absent or its current entry has
    /// expired. Returns true iff this call installed the value.
    pub fn try_add(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = self.clock.utc_now();
        let entry = Expirable {
            value,
            expires_at: now + ttl,
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    /// The live value for `key`, if any.
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = self.clock.utc_now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        // The read guard is released above; reap the stale entry unless a
        // writer already replaced it.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Forces immediate expiry of the entry if present.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.remove(key);
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.utc_now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
