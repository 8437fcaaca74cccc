//! Slot-to-node mapping.
//!
//! The [`SlotMap`] is an immutable snapshot: 16384 entries, each naming the
//! shard (primary first, then replicas) that serves the slot. Snapshots are
//! replaced wholesale on refresh and patched copy-on-write on redirects, so
//! concurrent readers always observe a consistent mapping.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::proto::Reply;

use super::slot::SLOT_COUNT;

/// The nodes serving one shard: primary first, then replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShardAddrs {
    pub(crate) primary: String,
    pub(crate) replicas: Vec<String>,
}

/// An immutable snapshot of slot ownership.
#[derive(Debug, Clone)]
pub(crate) struct SlotMap {
    slots: Vec<Option<Arc<ShardAddrs>>>,
}

impl SlotMap {
    /// A map with no slot served by any node.
    pub(crate) fn empty() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize],
        }
    }

    /// A map with every slot owned by a single node.
    pub(crate) fn single_node(addr: impl Into<String>) -> Self {
        let shard = Arc::new(ShardAddrs {
            primary: addr.into(),
            replicas: Vec::new(),
        });
        Self {
            slots: vec![Some(shard); SLOT_COUNT as usize],
        }
    }

    /// Builds a map from a `CLUSTER SLOTS` reply.
    ///
    /// An empty range list means the responding node is not clustered; the
    /// whole keyspace is assigned to `fallback_addr` so standalone servers
    /// route through the same path as clusters.
    pub(crate) fn from_cluster_slots(reply: &Reply, fallback_addr: &str) -> Result<Self> {
        let ranges = reply
            .as_array()
            .ok_or_else(|| Error::protocol("CLUSTER SLOTS reply is not an array"))?;
        if ranges.is_empty() {
            return Ok(Self::single_node(fallback_addr));
        }

        let mut map = Self::empty();
        for range in ranges {
            let parts = range
                .as_array()
                .ok_or_else(|| Error::protocol("slot range is not an array"))?;
            if parts.len() < 3 {
                return Err(Error::protocol("slot range is missing its primary"));
            }
            let start = parts[0]
                .as_int()
                .filter(|n| (0..SLOT_COUNT as i64).contains(n))
                .ok_or_else(|| Error::protocol("slot range start out of bounds"))?;
            let end = parts[1]
                .as_int()
                .filter(|n| (start..SLOT_COUNT as i64).contains(n))
                .ok_or_else(|| Error::protocol("slot range end out of bounds"))?;

            let primary = parse_node_addr(&parts[2], fallback_addr)?;
            let replicas = parts[3..]
                .iter()
                .filter_map(|node| parse_node_addr(node, fallback_addr).ok())
                .collect();
            let shard = Arc::new(ShardAddrs { primary, replicas });

            for slot in start..=end {
                map.slots[slot as usize] = Some(shard.clone());
            }
        }
        Ok(map)
    }

    /// The primary address serving `slot`, if any.
    pub(crate) fn primary_for(&self, slot: u16) -> Option<&str> {
        self.slots
            .get(slot as usize)?
            .as_deref()
            .map(|shard| shard.primary.as_str())
    }

    /// A copy of this map with one slot reassigned. Slots a peer announces
    /// out of range are ignored rather than trusted.
    pub(crate) fn with_moved(&self, slot: u16, addr: impl Into<String>) -> Self {
        let mut map = self.clone();
        if let Some(entry) = map.slots.get_mut(slot as usize) {
            *entry = Some(Arc::new(ShardAddrs {
                primary: addr.into(),
                replicas: Vec::new(),
            }));
        }
        map
    }

    /// Distinct primary addresses, in slot order.
    pub(crate) fn primaries(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for shard in self.slots.iter().flatten() {
            if seen.insert(shard.primary.as_str()) {
                out.push(shard.primary.clone());
            }
        }
        out
    }

    /// Every address the map references, primaries and replicas alike.
    pub(crate) fn addrs(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for shard in self.slots.iter().flatten() {
            out.insert(shard.primary.clone());
            for replica in &shard.replicas {
                out.insert(replica.clone());
            }
        }
        out
    }
}

/// Parses one node entry of a `CLUSTER SLOTS` range: `[host, port, id?, ...]`.
///
/// Nodes may announce an empty host when they only know themselves by the
/// address the client dialed; the fallback host fills the gap.
fn parse_node_addr(node: &Reply, fallback_addr: &str) -> Result<String> {
    let parts = node
        .as_array()
        .ok_or_else(|| Error::protocol("cluster node entry is not an array"))?;
    if parts.len() < 2 {
        return Err(Error::protocol("cluster node entry is missing host or port"));
    }
    let host = parts[0]
        .as_str()
        .ok_or_else(|| Error::protocol("cluster node host is not a string"))?;
    let port = parts[1]
        .as_int()
        .ok_or_else(|| Error::protocol("cluster node port is not an integer"))?;
    let host = if host.is_empty() {
        fallback_addr.split(':').next().unwrap_or("127.0.0.1")
    } else {
        host
    };
    Ok(format!("{host}:{port}"))
}
