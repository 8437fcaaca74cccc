//! Command routing.
//!
//! Single commands go to the primary of their slot; keyless commands
//! round-robin over primaries. Pipelines that span slots are partitioned per
//! primary, issued concurrently, and reassembled in the caller's order.
//! Redirects re-drive the affected commands: MOVED patches the slot map and
//! debounces a full refresh, ASK sends an `ASKING` pair without touching the
//! map, TRYAGAIN backs off in place. Five hops force a synchronous refresh;
//! a failed refresh, or five further hops after one, aborts the drive with
//! the last redirect as its error, so a cluster stuck mid-reshard surfaces
//! instead of hanging the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::cmd::{self, Command};
use crate::error::{Error, Result};
use crate::proto::Reply;
use crate::wire::Wire;

use super::driver::Topology;
use super::redirect::{classify, Redirect};

pub(crate) const REFRESH_HOP_WINDOW: usize = 5;
// One completed refresh buys a second window; past that the chain is
// treated as exhausted.
const MAX_REDIRECT_HOPS: usize = REFRESH_HOP_WINDOW * 2;
const TRYAGAIN_BACKOFF_CAP: Duration = Duration::from_millis(128);

/// Drives one command to completion, following redirects.
pub(crate) async fn drive(topo: &Arc<Topology>, cmd: Command) -> Result<Reply> {
    drive_from(topo, cmd, None).await
}

/// Same as [`drive`], seeded with a redirect already received elsewhere.
pub(crate) async fn drive_from(
    topo: &Arc<Topology>,
    cmd: Command,
    mut pending: Option<Redirect>,
) -> Result<Reply> {
    let mut hops = 0usize;
    let mut net_retried = false;
    let mut backoff = Duration::from_millis(2);
    let mut ask_target: Option<String> = None;

    loop {
        if topo.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        match pending.take() {
            Some(Redirect::Moved { slot, address }) => {
                topo.patch_moved(slot, &address);
                topo.schedule_refresh();
            }
            Some(Redirect::Ask { address, .. }) => ask_target = Some(address),
            Some(Redirect::TryAgain) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(TRYAGAIN_BACKOFF_CAP);
            }
            None => {}
        }

        let pool = match &ask_target {
            Some(addr) => topo.pool(addr),
            None => match cmd.slot() {
                Some(slot) => topo.primary_pool_for_slot(slot)?,
                None => topo.any_primary_pool()?,
            },
        };
        let asking = ask_target.take().is_some();

        let attempt: Result<Reply> = async {
            if cmd.is_blocking() {
                // A stuck blocking read must not head-of-line-block the
                // shared pipeline, so it runs on a leased wire.
                let lease = pool.lease().await?;
                let reply = if asking {
                    ask_pair(lease.wire(), &cmd).await
                } else {
                    lease.wire().do_cmd(cmd.clone()).await
                };
                reply
            } else {
                let wire = pool.acquire().await?;
                if asking {
                    ask_pair(&wire, &cmd).await
                } else {
                    wire.do_cmd(cmd.clone()).await
                }
            }
        }
        .await;

        let reply = match attempt {
            Ok(reply) => reply,
            Err(e) if !net_retried && transport(&e) => {
                net_retried = true;
                continue;
            }
            Err(e) => return Err(e),
        };

        match classify(&reply) {
            None => return Ok(reply),
            Some(redirect) => {
                hops += 1;
                // A chain this long means the optimistic patches are chasing
                // a stale map; refresh once, and give up when even a fresh
                // map keeps bouncing.
                if hops >= MAX_REDIRECT_HOPS
                    || (hops % REFRESH_HOP_WINDOW == 0 && topo.refresh().await.is_err())
                {
                    return Err(redirect_error(redirect));
                }
                pending = Some(redirect);
            }
        }
    }
}

/// The error surfaced when a redirect chain exhausts its budget.
fn redirect_error(redirect: Redirect) -> Error {
    match redirect {
        Redirect::Moved { slot, address } => Error::Moved { slot, address },
        Redirect::Ask { slot, address } => Error::Ask { slot, address },
        Redirect::TryAgain => Error::TryAgain,
    }
}

/// Drives a pipeline, splitting it by primary when slots diverge.
pub(crate) async fn drive_pipeline(topo: &Arc<Topology>, cmds: Vec<Command>) -> Result<Vec<Reply>> {
    if cmds.is_empty() {
        return Ok(Vec::new());
    }
    let slots: Vec<Option<u16>> = cmds.iter().map(Command::slot).collect();
    let keyed = slots.iter().any(Option::is_some);
    let keyless = slots.iter().any(Option::is_none);
    if keyed && keyless {
        // Broadcasting a keyless command alongside keyed ones would run it
        // on an arbitrary subset of nodes; reject before any I/O.
        return Err(Error::MixedSlot);
    }
    if !keyed {
        let pool = topo.any_primary_pool()?;
        let wire = pool.acquire().await?;
        return wire.do_multi(cmds).await;
    }

    let snapshot = topo.snapshot();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, slot) in slots.iter().enumerate() {
        let slot = slot.expect("keyed pipeline");
        let addr = snapshot.primary_for(slot).ok_or(Error::NoSlot)?;
        groups.entry(addr.to_string()).or_default().push(i);
    }

    if groups.len() == 1 {
        let (addr, indices) = groups.into_iter().next().expect("one group");
        let sub: Vec<Command> = indices.iter().map(|&i| cmds[i].clone()).collect();
        return drive_group(topo, &addr, sub).await;
    }

    let mut tasks = JoinSet::new();
    for (addr, indices) in groups {
        let topo = topo.clone();
        let sub: Vec<Command> = indices.iter().map(|&i| cmds[i].clone()).collect();
        tasks.spawn(async move {
            let replies = drive_group(&topo, &addr, sub).await;
            (indices, replies)
        });
    }

    let mut out: Vec<Option<Reply>> = vec![None; cmds.len()];
    while let Some(joined) = tasks.join_next().await {
        let (indices, replies) =
            joined.map_err(|_| Error::protocol("pipeline subtask aborted"))?;
        for (idx, reply) in indices.into_iter().zip(replies?) {
            out[idx] = Some(reply);
        }
    }
    out.into_iter()
        .map(|slot| slot.ok_or_else(|| Error::protocol("pipeline reply missing")))
        .collect()
}

/// One same-primary sub-pipeline. Commands answered with a redirect are
/// re-driven individually so the rest of the batch keeps its replies.
async fn drive_group(topo: &Arc<Topology>, addr: &str, cmds: Vec<Command>) -> Result<Vec<Reply>> {
    let pool = topo.pool(addr);
    let wire = pool.acquire().await?;
    let mut replies = wire.do_multi(cmds.clone()).await?;
    for (i, reply) in replies.iter_mut().enumerate() {
        if let Some(redirect) = classify(reply) {
            *reply = drive_from(topo, cmds[i].clone(), Some(redirect)).await?;
        }
    }
    Ok(replies)
}

/// Issues `ASKING` plus the command as one pipeline and consumes the
/// acknowledgement.
async fn ask_pair(wire: &Arc<Wire>, cmd: &Command) -> Result<Reply> {
    let replies = wire.do_multi(vec![cmd::asking(), cmd.clone()]).await?;
    replies
        .into_iter()
        .nth(1)
        .ok_or_else(|| Error::protocol("short ASKING pipeline reply"))
}

fn transport(e: &Error) -> bool {
    matches!(
        e,
        Error::Io { .. } | Error::ConnectionClosed | Error::Timeout
    )
}
