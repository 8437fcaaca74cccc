//! Sentinel-managed deployments.
//!
//! The seeds are sentinels monitoring a named master set. Resolution asks
//! each sentinel for the current master; a side task keeps a subscription to
//! `+switch-master` open and triggers a topology refresh whenever the
//! monitored master moves.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::driver::Topology;
use crate::cmd;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::wire::Wire;

// Sentinels speak the plain protocol: no database select, no tracking.
fn sentinel_options(opts: &ClientOptions) -> ClientOptions {
    let mut opts = opts.clone();
    opts.select_db = None;
    opts.disable_cache = true;
    opts
}

/// Asks the sentinels for the current master of the configured set.
pub(crate) async fn resolve_master(opts: &ClientOptions, seeds: &[String]) -> Result<String> {
    let master_set = opts.sentinel_master.as_deref().ok_or(Error::NoAddr)?;
    let sentinel_opts = sentinel_options(opts);
    let mut last_err = Error::NoAddr;
    for seed in seeds {
        let wire = match Wire::connect(seed, &sentinel_opts, None).await {
            Ok(wire) => wire,
            Err(e) => {
                last_err = e;
                continue;
            }
        };
        let reply = wire.do_cmd(cmd::sentinel_get_master_addr(master_set)).await;
        wire.close();
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                last_err = e;
                continue;
            }
        };
        if let Some(parts) = reply.as_array() {
            if let (Some(host), Some(port)) = (
                parts.first().and_then(|h| h.as_str()),
                parts.get(1).and_then(|p| p.as_str()),
            ) {
                return Ok(format!("{host}:{port}"));
            }
        }
        last_err = Error::protocol("unexpected master address reply from sentinel");
    }
    Err(last_err)
}

/// Holds a `+switch-master` subscription against the sentinels and refreshes
/// the topology on every event. Exits when the client goes away.
pub(crate) fn spawn_watcher(topo: Weak<Topology>, opts: Arc<ClientOptions>, seeds: Vec<String>) {
    tokio::spawn(async move {
        let sentinel_opts = sentinel_options(&opts);
        loop {
            match topo.upgrade() {
                Some(alive) if !alive.is_closed() => {}
                _ => return,
            }
            for seed in &seeds {
                let wire = match Wire::connect(seed, &sentinel_opts, None).await {
                    Ok(wire) => wire,
                    Err(_) => continue,
                };
                let events = topo.clone();
                let watch = wire
                    .receive(cmd::subscribe_switch_master(), move |msg| {
                        debug!(channel = %msg.channel, "sentinel event");
                        if let Some(topo) = events.upgrade() {
                            topo.schedule_refresh();
                        }
                    })
                    .await;
                if let Err(e) = watch {
                    warn!(error = %e, sentinel = %seed, "sentinel watch ended");
                }
                match topo.upgrade() {
                    Some(alive) if !alive.is_closed() => {}
                    _ => return,
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}
