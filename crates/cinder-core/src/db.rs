//! The keyspace: numbered databases of key → entry.
//!
//! Each [`Db`] owns two maps — `entries` and `expires` — with the
//! invariant that every key in `expires` is also in `entries`. An
//! expiry in the past means the key is logically gone: every lookup
//! materializes that absence before answering, so callers never see
//! a stale value.
//!
//! Entries also carry the paging storage state. A value is normally
//! `Memory`; the paging subsystem moves large strings through
//! `Swapping` → `Swapped` and back through `Loading`. Resident byte
//! accounting rides on a per-entry cached size that the executor
//! refreshes after touching a key.

use ahash::AHashMap;
use bytes::Bytes;
use rand::seq::IteratorRandom;

use crate::object::Value;
use crate::time;

/// Location of a swapped-out value in the swap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapPtr {
    pub page: u32,
    pub pages: u32,
}

/// Where an entry's payload currently lives.
#[derive(Debug, Clone)]
pub enum Storage {
    /// Payload resident in memory.
    Memory(Value),
    /// Payload resident; a swap-out job is in flight.
    Swapping(Value),
    /// Payload lives in the swap file only.
    Swapped(SwapPtr),
    /// A load job is bringing the payload back.
    Loading(SwapPtr),
}

impl Storage {
    /// The in-memory payload, present for `Memory` and `Swapping`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Storage::Memory(v) | Storage::Swapping(v) => Some(v),
            Storage::Swapped(_) | Storage::Loading(_) => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        match self {
            Storage::Memory(v) | Storage::Swapping(v) => Some(v),
            Storage::Swapped(_) | Storage::Loading(_) => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Storage::Memory(_) | Storage::Swapping(_))
    }

    /// Marks a resident value as having a swap-out in flight.
    pub fn begin_swap(&mut self) {
        let placeholder = Storage::Swapped(SwapPtr { page: 0, pages: 0 });
        match std::mem::replace(self, placeholder) {
            Storage::Memory(value) => *self = Storage::Swapping(value),
            other => *self = other,
        }
    }

    /// Reverts an in-flight transfer after its job was canceled:
    /// Swapping → Memory, Loading → Swapped.
    pub fn cancel_transfer(&mut self) {
        let placeholder = Storage::Swapped(SwapPtr { page: 0, pages: 0 });
        match std::mem::replace(self, placeholder) {
            Storage::Swapping(value) => *self = Storage::Memory(value),
            Storage::Loading(ptr) => *self = Storage::Swapped(ptr),
            other => *self = other,
        }
    }
}

/// One keyspace slot.
#[derive(Debug, Clone)]
pub struct Entry {
    pub storage: Storage,
    /// Unix ms of the last read or write, for swap-out scoring.
    pub last_access_ms: u64,
    /// Last size the executor accounted for this entry.
    pub cached_size: usize,
}

impl Entry {
    pub fn memory(value: Value) -> Self {
        Self {
            storage: Storage::Memory(value),
            last_access_ms: time::now_ms(),
            cached_size: 0,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.storage.value()
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        self.storage.value_mut()
    }
}

/// A single numbered database.
#[derive(Debug, Default)]
pub struct Db {
    pub entries: AHashMap<Bytes, Entry>,
    /// key → absolute expiry, unix milliseconds.
    pub expires: AHashMap<Bytes, u64>,
    /// Sum of `cached_size` over resident entries.
    pub value_bytes: usize,
    /// Cumulative keys removed because their expiry passed.
    pub expired_total: u64,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts `key` if its expiry has passed. Returns `true` when the
    /// key was removed (the caller must treat it as absent).
    pub fn expire_if_needed(&mut self, key: &[u8]) -> bool {
        let expired = self
            .expires
            .get(key)
            .is_some_and(|&at| time::is_expired(at));
        if expired {
            self.remove(key);
            self.expired_total += 1;
        }
        expired
    }

    /// Read-path lookup: evicts a stale entry, then returns the
    /// resident value and touches the access time.
    pub fn lookup_read(&mut self, key: &[u8]) -> Option<&Value> {
        if self.expire_if_needed(key) {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access_ms = time::now_ms();
        debug_assert!(
            entry.storage.is_resident(),
            "lookup on a non-resident key must go through the paging gate"
        );
        entry.value()
    }

    /// Write-path lookup: identical eviction semantics, mutable value.
    pub fn lookup_write(&mut self, key: &[u8]) -> Option<&mut Value> {
        if self.expire_if_needed(key) {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access_ms = time::now_ms();
        debug_assert!(entry.storage.is_resident());
        entry.value_mut()
    }

    /// Whether the key exists (and is not stale-expired).
    pub fn contains(&mut self, key: &[u8]) -> bool {
        if self.expire_if_needed(key) {
            return false;
        }
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry, dropping any expiry the key had.
    /// This is the SET-style full replacement.
    pub fn set_value(&mut self, key: Bytes, value: Value) {
        self.remove_expire(&key);
        if let Some(old) = self.entries.insert(key, Entry::memory(value)) {
            self.value_bytes = self.value_bytes.saturating_sub(old.cached_size);
        }
    }

    /// Inserts a fresh entry without touching expiry state. Used when
    /// the key is known absent (collection creation, snapshot load).
    pub fn insert_new(&mut self, key: Bytes, value: Value) {
        if let Some(old) = self.entries.insert(key, Entry::memory(value)) {
            self.value_bytes = self.value_bytes.saturating_sub(old.cached_size);
        }
    }

    /// Inserts or replaces the in-memory value for a key, leaving any
    /// expiry in place. The write path for read-modify-write commands
    /// (APPEND, INCR) that must not disturb a TTL.
    pub fn upsert_keep_ttl(&mut self, key: Bytes, value: Value) {
        use std::collections::hash_map::Entry as Slot;
        match self.entries.entry(key) {
            Slot::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.storage = Storage::Memory(value);
                entry.last_access_ms = time::now_ms();
            }
            Slot::Vacant(slot) => {
                slot.insert(Entry::memory(value));
            }
        }
    }

    /// Classifies a key ahead of a typed write: `Ok(true)` means the
    /// key is absent (create it), `Ok(false)` means it already holds
    /// a value passing `check`, `Err(())` means it holds something
    /// else (a wrong-type error for the caller).
    pub fn classify(&mut self, key: &[u8], check: fn(&Value) -> bool) -> Result<bool, ()> {
        if self.expire_if_needed(key) {
            return Ok(true);
        }
        match self.entries.get(key).and_then(Entry::value) {
            None => Ok(true),
            Some(value) if check(value) => Ok(false),
            Some(_) => Err(()),
        }
    }

    /// Removes a key from both maps.
    pub fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        self.expires.remove(key);
        let entry = self.entries.remove(key)?;
        self.value_bytes = self.value_bytes.saturating_sub(entry.cached_size);
        Some(entry)
    }

    /// Sets an absolute expiry. Returns `false` if the key is absent.
    pub fn set_expire(&mut self, key: &[u8], at_ms: u64) -> bool {
        if !self.entries.contains_key(key) {
            return false;
        }
        self.expires.insert(Bytes::copy_from_slice(key), at_ms);
        true
    }

    /// Drops the expiry for a key. Returns whether one existed.
    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    pub fn expire_at(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).copied()
    }

    /// Remaining TTL in whole seconds, for a key that has an expiry.
    pub fn ttl_secs(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).map(|&at| time::remaining_secs(at))
    }

    /// Re-measures a touched entry and maintains the resident total.
    pub fn refresh_size(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            let new = entry.value().map(Value::approx_size).unwrap_or(0);
            self.value_bytes = self.value_bytes.saturating_sub(entry.cached_size) + new;
            entry.cached_size = new;
        }
    }

    /// A uniformly random live key, if any.
    pub fn random_key(&mut self) -> Option<Bytes> {
        let mut rng = rand::rng();
        loop {
            let key = self.entries.keys().choose(&mut rng)?.clone();
            if !self.expire_if_needed(&key) {
                return Some(key);
            }
            if self.entries.is_empty() {
                return None;
            }
        }
    }

    /// Samples up to `count` keys from the expiry map.
    pub fn sample_expires(&self, count: usize) -> Vec<Bytes> {
        let mut rng = rand::rng();
        self.expires
            .keys()
            .choose_multiple(&mut rng, count)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Drops everything. Returns how many keys were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.expires.clear();
        self.value_bytes = 0;
        removed
    }
}

/// The array of databases a server instance serves.
#[derive(Debug)]
pub struct Keyspace {
    dbs: Vec<Db>,
}

impl Keyspace {
    pub fn new(count: usize) -> Self {
        Self {
            dbs: (0..count).map(|_| Db::new()).collect(),
        }
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, index: usize) -> &Db {
        &self.dbs[index]
    }

    pub fn db_mut(&mut self, index: usize) -> &mut Db {
        &mut self.dbs[index]
    }

    pub fn dbs(&self) -> &[Db] {
        &self.dbs
    }

    pub fn dbs_mut(&mut self) -> &mut [Db] {
        &mut self.dbs
    }

    /// Live keys across all databases.
    pub fn total_keys(&self) -> usize {
        self.dbs.iter().map(Db::len).sum()
    }

    /// Resident value bytes across all databases.
    pub fn value_bytes(&self) -> usize {
        self.dbs.iter().map(|db| db.value_bytes).sum()
    }

    /// Empties every database. Returns how many keys were removed.
    pub fn clear_all(&mut self) -> usize {
        self.dbs.iter_mut().map(Db::clear).sum()
    }
}
