//! Per-node connection pool.
//!
//! Each node gets one shared pipelining wire that multiplexes every
//! concurrent caller, plus a bounded set of exclusively leased wires for
//! blocking commands, transactions and subscriber surfaces. Reconnection is
//! lazy: the next acquire after a break dials again, backing off
//! exponentially only after repeated failures.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cache::Cache;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::wire::{Wire, WireState};

pub(crate) struct NodePool {
    addr: String,
    opts: Arc<ClientOptions>,
    /// The node's client-side cache; absent when caching is disabled.
    pub(crate) cache: Option<Arc<Cache>>,
    // Guards the shared wire slot across reconnects so concurrent acquires
    // dial at most once.
    shared: Mutex<Option<Arc<Wire>>>,
    idle_dedicated: StdMutex<Vec<Arc<Wire>>>,
    dedicated_sem: Arc<Semaphore>,
    failures: AtomicU32,
    retired: AtomicBool,
    me: Weak<NodePool>,
}

impl NodePool {
    pub(crate) fn new(addr: String, opts: Arc<ClientOptions>) -> Arc<Self> {
        let cache = if opts.disable_cache {
            None
        } else {
            Some(Cache::new())
        };
        Arc::new_cyclic(|me| Self {
            addr,
            cache,
            shared: Mutex::new(None),
            idle_dedicated: StdMutex::new(Vec::new()),
            dedicated_sem: Arc::new(Semaphore::new(opts.blocking_pool_size.max(1))),
            failures: AtomicU32::new(0),
            retired: AtomicBool::new(false),
            me: me.clone(),
            opts,
        })
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Returns the shared pipelining wire, dialing if necessary.
    pub(crate) async fn acquire(&self) -> Result<Arc<Wire>> {
        if self.is_retired() {
            return Err(Error::ConnectionClosed);
        }
        let mut slot = self.shared.lock().await;
        if let Some(wire) = slot.as_ref() {
            if wire.is_ready() {
                return Ok(wire.clone());
            }
        }
        let failures = self.failures.load(Ordering::Relaxed);
        if failures > 0 {
            tokio::time::sleep(backoff_delay(failures)).await;
            if self.is_retired() {
                return Err(Error::ConnectionClosed);
            }
        }
        match Wire::connect(&self.addr, &self.opts, self.cache.clone()).await {
            Ok(wire) => {
                self.failures.store(0, Ordering::Relaxed);
                *slot = Some(wire.clone());
                Ok(wire)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(addr = %self.addr, error = %e, "reconnect failed");
                Err(e)
            }
        }
    }

    /// Leases an exclusive wire, bounded by the blocking pool size.
    ///
    /// Leased wires never negotiate tracking; their replies are not cached.
    pub(crate) async fn lease(&self) -> Result<DedicatedLease> {
        if self.is_retired() {
            return Err(Error::ConnectionClosed);
        }
        let permit = self
            .dedicated_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let reused = loop {
            let candidate = self
                .idle_dedicated
                .lock()
                .expect("dedicated list poisoned")
                .pop();
            match candidate {
                Some(wire) if wire.is_alive() => break Some(wire),
                Some(_) => continue,
                None => break None,
            }
        };
        let wire = match reused {
            Some(wire) => wire,
            None => Wire::connect(&self.addr, &self.opts, None).await?,
        };
        wire.set_dedicated();
        Ok(DedicatedLease {
            pool: self.me.upgrade().ok_or(Error::ConnectionClosed)?,
            wire: Some(wire),
            _permit: permit,
        })
    }

    /// Removes the pool from service: no new routes; wires drain and close.
    pub(crate) fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(addr = %self.addr, "retiring node pool");
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Some(wire) = this.shared.lock().await.take() {
                wire.close();
            }
            let idle: Vec<_> = this
                .idle_dedicated
                .lock()
                .expect("dedicated list poisoned")
                .drain(..)
                .collect();
            for wire in idle {
                wire.close();
            }
        });
    }

    fn park_dedicated(&self, wire: Arc<Wire>) {
        let reusable = matches!(wire.state(), WireState::Dedicated | WireState::Ready);
        if reusable && !self.is_retired() {
            wire.set_ready();
            self.idle_dedicated
                .lock()
                .expect("dedicated list poisoned")
                .push(wire);
        } else {
            wire.close();
        }
    }
}

fn backoff_delay(failures: u32) -> Duration {
    // First retry is immediate; afterwards 50ms doubling up to 1.6s.
    let exp = failures.saturating_sub(1).min(5);
    Duration::from_millis(50u64 << exp)
}

/// Temporary exclusive ownership of a wire.
///
/// Dropping the lease returns a healthy wire to the pool; releasing twice is
/// impossible by construction and dropping after an explicit release is a
/// no-op.
pub struct DedicatedLease {
    pool: Arc<NodePool>,
    wire: Option<Arc<Wire>>,
    _permit: OwnedSemaphorePermit,
}

impl DedicatedLease {
    pub(crate) fn wire(&self) -> &Arc<Wire> {
        self.wire.as_ref().expect("lease already released")
    }

    /// Returns the wire to the pool.
    pub fn release(self) {}
}

impl Drop for DedicatedLease {
    fn drop(&mut self) {
        if let Some(wire) = self.wire.take() {
            self.pool.park_dedicated(wire);
        }
    }
}
