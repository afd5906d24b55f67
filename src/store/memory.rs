//! In-process counter store backed by a concurrent map.

use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::store::{CounterStore, SafeSet, StoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    /// Unix second at which the entry stops being visible.
    expires_at: Option<u64>,
}

impl Entry {
    fn new(value: i64, ttl: Option<Duration>, now: u64) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now.saturating_add(ttl.as_secs())),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Counter store for single-host deployments.
///
/// Every operation locks exactly one shard of the map, which gives the same
/// per-key atomicity a shared dictionary offers across worker processes.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CounterStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value);
        Ok(value)
    }

    fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.entries.insert(key.to_string(), Entry::new(value, ttl, now));
        Ok(())
    }

    fn incr(
        &self,
        key: &str,
        delta: i64,
        default: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(default, ttl, now));

        if entry.is_expired(now) {
            *entry = Entry::new(default, ttl, now);
        }

        entry.value = entry
            .value
            .checked_add(delta)
            .ok_or_else(|| StoreError::Transient(format!("counter `{key}` overflowed")))?;
        Ok(entry.value)
    }

    fn safe_set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<SafeSet, StoreError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry::new(value, ttl, now));
                    Ok(SafeSet::Stored)
                } else {
                    Ok(SafeSet::Exists)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl, now));
                Ok(SafeSet::Stored)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
