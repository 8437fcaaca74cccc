//! Topology driver.
//!
//! Owns the node pools and the current [`SlotMap`] snapshot. Refreshes run
//! against any reachable node via `CLUSTER SLOTS`; nodes that leave the map
//! have their pools drained and closed. A node that is not clustered yields
//! a single-node map owning the whole keyspace, which is how standalone and
//! sentinel-managed servers share the cluster code path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, warn};

use crate::cmd;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::pool::NodePool;
use crate::proto::Reply;
use crate::sentinel;

use super::topology::SlotMap;

pub(crate) struct Topology {
    opts: Arc<ClientOptions>,
    seeds: Vec<String>,
    slots: RwLock<Arc<SlotMap>>,
    pools: Mutex<HashMap<String, Arc<NodePool>>>,
    refreshing: AtomicBool,
    rr: AtomicUsize,
    closed: AtomicBool,
    me: Weak<Topology>,
}

impl Topology {
    pub(crate) fn new(opts: Arc<ClientOptions>, seeds: Vec<String>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            opts,
            seeds,
            slots: RwLock::new(Arc::new(SlotMap::empty())),
            pools: Mutex::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
            rr: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The current mapping. Snapshots stay valid for in-flight readers even
    /// after a refresh swaps in a replacement.
    pub(crate) fn snapshot(&self) -> Arc<SlotMap> {
        self.slots.read().expect("slot map lock poisoned").clone()
    }

    /// The pool for `addr`, created on first use.
    pub(crate) fn pool(&self, addr: &str) -> Arc<NodePool> {
        let mut pools = self.pools.lock().expect("pool map poisoned");
        pools
            .entry(addr.to_string())
            .or_insert_with(|| NodePool::new(addr.to_string(), self.opts.clone()))
            .clone()
    }

    pub(crate) fn primary_pool_for_slot(&self, slot: u16) -> Result<Arc<NodePool>> {
        let snapshot = self.snapshot();
        let addr = snapshot.primary_for(slot).ok_or(Error::NoSlot)?;
        Ok(self.pool(addr))
    }

    /// Round-robins keyless commands over the known primaries.
    pub(crate) fn any_primary_pool(&self) -> Result<Arc<NodePool>> {
        let primaries = self.snapshot().primaries();
        if primaries.is_empty() {
            return Err(Error::NoSlot);
        }
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % primaries.len();
        Ok(self.pool(&primaries[idx]))
    }

    /// Applies one redirect optimistically without a full refresh.
    pub(crate) fn patch_moved(&self, slot: u16, addr: &str) {
        debug!(slot, addr, "slot moved");
        let mut slots = self.slots.write().expect("slot map lock poisoned");
        *slots = Arc::new(slots.with_moved(slot, addr));
    }

    /// Rebuilds the slot map and swaps it in atomically.
    pub(crate) async fn refresh(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let new_map = if self.opts.sentinel_master.is_some() {
            let master = sentinel::resolve_master(&self.opts, &self.seeds).await?;
            debug!(%master, "sentinel master resolved");
            SlotMap::single_node(master)
        } else {
            self.fetch_slot_map().await?
        };
        self.install(new_map);
        Ok(())
    }

    /// Kicks off a background refresh; at most one runs at a time.
    pub(crate) fn schedule_refresh(&self) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.refreshing.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.refresh().await {
                warn!(error = %e, "slot map refresh failed");
            }
            this.refreshing.store(false, Ordering::Release);
        });
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<_> = self
            .pools
            .lock()
            .expect("pool map poisoned")
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.retire();
        }
    }

    async fn fetch_slot_map(&self) -> Result<SlotMap> {
        // Known primaries first, then the configured seeds.
        let mut candidates = self.snapshot().primaries();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        let mut last_err = Error::NoSlot;
        for addr in candidates {
            let pool = self.pool(&addr);
            let wire = match pool.acquire().await {
                Ok(wire) => wire,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let reply = match wire.do_cmd(cmd::cluster_slots()).await {
                Ok(reply) => reply,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            match &reply {
                Reply::Error(message) => {
                    if message.contains("cluster support disabled")
                        || message.contains("unknown command")
                    {
                        return Ok(SlotMap::single_node(addr));
                    }
                    last_err = Error::Redis {
                        message: message.clone(),
                    };
                }
                _ => match SlotMap::from_cluster_slots(&reply, &addr) {
                    Ok(map) => return Ok(map),
                    Err(e) => last_err = e,
                },
            }
        }
        Err(last_err)
    }

    /// Swaps in the new map and drains pools for nodes that left.
    fn install(&self, new_map: SlotMap) {
        let keep = new_map.addrs();
        let stale: Vec<Arc<NodePool>> = {
            let mut pools = self.pools.lock().expect("pool map poisoned");
            let stale_addrs: Vec<String> = pools
                .keys()
                .filter(|addr| !keep.contains(*addr))
                .cloned()
                .collect();
            stale_addrs
                .iter()
                .filter_map(|addr| pools.remove(addr))
                .collect()
        };
        *self.slots.write().expect("slot map lock poisoned") = Arc::new(new_map);
        for pool in stale {
            pool.retire();
        }
    }
}
