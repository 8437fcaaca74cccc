//! Server-assisted client-side cache.
//!
//! Replies are memoized under (key, command fingerprint) and dropped when
//! the server pushes an `invalidate` frame for the key, when their TTL
//! lapses, or when the tracking connection breaks. A flight record keeps
//! concurrent lookups for the same fingerprint from dispatching duplicate
//! requests: one caller fetches, the rest await its result.
//!
//! The store is sharded by key hash; each shard has its own mutex and every
//! critical section is a map operation, so contention stays bounded.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;

use crate::proto::Reply;

const SHARD_COUNT: usize = 16;

/// Progress of an in-flight fetch, broadcast to coalesced waiters.
#[derive(Debug, Clone)]
pub(crate) enum FlightState {
    Pending,
    Failed,
    Done(Reply),
}

enum Entry {
    Ready { reply: Reply, expires_at: Instant },
    Flight(watch::Receiver<FlightState>),
}

// key -> fingerprint -> entry; the outer level is what invalidation removes.
type Shard = HashMap<Bytes, HashMap<Bytes, Entry>>;

/// Outcome of a cache lookup.
pub(crate) enum Begin {
    /// Fresh entry; return it marked as a hit.
    Hit(Reply),
    /// Another caller is fetching this fingerprint; await its broadcast.
    Wait(watch::Receiver<FlightState>),
    /// Nothing cached; the guard owns the one permitted fetch.
    Fetch(FlightGuard),
    /// Tracking is not active; do not serve or store.
    Bypass,
}

pub(crate) struct Cache {
    shards: Vec<Mutex<Shard>>,
    serving: AtomicBool,
    me: Weak<Cache>,
}

impl Cache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            serving: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Hits are only served while an invalidation subscription is open on
    /// the connection that fills this cache.
    pub(crate) fn set_serving(&self, on: bool) {
        self.serving.store(on, Ordering::Release);
    }

    pub(crate) fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Looks up `fingerprint` under `key`, installing a flight on a miss.
    pub(crate) fn begin(&self, key: &Bytes, fingerprint: &Bytes) -> Begin {
        if !self.is_serving() {
            return Begin::Bypass;
        }
        let mut shard = self.shard(key);
        match shard.get(key).and_then(|entries| entries.get(fingerprint)) {
            Some(Entry::Ready { reply, expires_at }) if *expires_at > Instant::now() => {
                Begin::Hit(reply.clone())
            }
            Some(Entry::Flight(rx)) => Begin::Wait(rx.clone()),
            _ => {
                let (tx, rx) = watch::channel(FlightState::Pending);
                shard
                    .entry(key.clone())
                    .or_default()
                    .insert(fingerprint.clone(), Entry::Flight(rx));
                Begin::Fetch(FlightGuard {
                    cache: self.me.upgrade().expect("cache owner alive"),
                    key: key.clone(),
                    fingerprint: fingerprint.clone(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Drops every entry under each of `keys`.
    pub(crate) fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a Bytes>) {
        for key in keys {
            self.shard(key).remove(key);
        }
    }

    /// Drops everything.
    pub(crate) fn flush(&self) {
        for shard in &self.shards {
            shard.lock().expect("cache shard poisoned").clear();
        }
    }

    fn store(&self, key: &Bytes, fingerprint: &Bytes, reply: Reply, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.shard(key)
            .entry(key.clone())
            .or_default()
            .insert(fingerprint.clone(), Entry::Ready { reply, expires_at });
    }

    fn evict_flight(&self, key: &Bytes, fingerprint: &Bytes) {
        let mut shard = self.shard(key);
        if let Some(entries) = shard.get_mut(key) {
            if matches!(entries.get(fingerprint), Some(Entry::Flight(_))) {
                entries.remove(fingerprint);
                if entries.is_empty() {
                    shard.remove(key);
                }
            }
        }
    }

    fn shard(&self, key: &Bytes) -> std::sync::MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = hasher.finish() as usize % SHARD_COUNT;
        self.shards[idx].lock().expect("cache shard poisoned")
    }
}

/// Ownership of the single permitted fetch for a fingerprint.
///
/// Dropping the guard without [`complete`](FlightGuard::complete) releases
/// the flight and wakes waiters so one of them can retry.
pub(crate) struct FlightGuard {
    cache: Arc<Cache>,
    key: Bytes,
    fingerprint: Bytes,
    tx: Option<watch::Sender<FlightState>>,
}

impl FlightGuard {
    /// Stores the fetched reply and wakes every coalesced waiter with it.
    pub(crate) fn complete(mut self, reply: Reply, ttl: Duration) {
        if let Some(tx) = self.tx.take() {
            self.cache.store(&self.key, &self.fingerprint, reply.clone(), ttl);
            let _ = tx.send(FlightState::Done(reply));
        }
    }

    /// Releases the flight without storing anything.
    pub(crate) fn abort(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.cache.evict_flight(&self.key, &self.fingerprint);
            let _ = tx.send(FlightState::Failed);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}
