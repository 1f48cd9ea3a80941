use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use crate::clock::Clock;
use crate::metrics::CACHE_SIZE;
use crate::models::{BackendCall, Generation};

// fixed bookkeeping cost charged per entry on top of its payload
const ENTRY_OVERHEAD: usize = 256;

// Cache key: sha256 of tool name + normalized backend parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(tool: &str, call: &BackendCall) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        match serde_json::to_vec(call) {
            Ok(body) => hasher.update(&body),
            Err(_) => hasher.update(format!("{call:?}").as_bytes()),
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is plenty for logs
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

// Cache entry with timestamp. Never mutated, a newer put replaces it
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub generation: Arc<Generation>,
    pub created_at: Instant,
    pub ttl: Duration,
    size: usize,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

struct Slot {
    entry: CacheEntry,
    touched: u64,
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<Fingerprint, Slot>,
    // touch tick -> key, oldest first
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    bytes: usize,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.slots.remove(fingerprint) {
            Some(slot) => {
                self.recency.remove(&slot.touched);
                self.bytes -= slot.entry.size;
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, fingerprint: &Fingerprint) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(fingerprint) {
            self.recency.remove(&slot.touched);
            slot.touched = tick;
            self.recency.insert(tick, fingerprint.clone());
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// TTL cache of successful generations, bounded by a memory budget.
///
/// Expired entries are dropped lazily on read and by `purge_expired`. When
/// the budget is exceeded, expired entries go first, then the least recently
/// used ones.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    memory_budget: usize,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, memory_budget: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            memory_budget,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Generation>> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let generation = match inner.slots.get(fingerprint) {
            Some(slot) if slot.entry.is_expired(now) => None,
            Some(slot) => Some(Arc::clone(&slot.entry.generation)),
            None => return None,
        };

        match generation {
            Some(generation) => {
                inner.touch(fingerprint);
                Some(generation)
            }
            None => {
                // expired: treat as absent and drop it now
                inner.remove(fingerprint);
                CACHE_SIZE.set(inner.slots.len() as f64);
                None
            }
        }
    }

    // Last writer wins. Returns false when the entry alone exceeds the budget
    pub fn put(&self, fingerprint: Fingerprint, generation: Arc<Generation>) -> bool {
        let size = ENTRY_OVERHEAD
            + fingerprint.as_str().len()
            + generation.text.len()
            + generation.finish_reason.len();
        if size > self.memory_budget {
            return false;
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            generation,
            created_at: now,
            ttl: self.ttl,
            size,
        };

        let mut inner = self.lock();
        inner.remove(&fingerprint);
        inner.tick += 1;
        let tick = inner.tick;
        inner.recency.insert(tick, fingerprint.clone());
        inner.slots.insert(fingerprint, Slot { entry, touched: tick });
        inner.bytes += size;

        if inner.bytes > self.memory_budget {
            inner.purge_expired(now);
        }
        while inner.bytes > self.memory_budget {
            let oldest = match inner.recency.first_key_value() {
                Some((_, key)) => key.clone(),
                None => break,
            };
            inner.remove(&oldest);
        }

        CACHE_SIZE.set(inner.slots.len() as f64);
        true
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.lock();
        let removed = inner.remove(fingerprint);
        CACHE_SIZE.set(inner.slots.len() as f64);
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = CacheInner::default();
        CACHE_SIZE.set(0.0);
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let purged = inner.purge_expired(now);
        CACHE_SIZE.set(inner.slots.len() as f64);
        purged
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
