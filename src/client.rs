//! The client surface.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tracing::warn;

use crate::cache::{Begin, FlightState};
use crate::cluster::driver::Topology;
use crate::cluster::redirect::{classify, Redirect};
use crate::cluster::router;
use crate::cmd::{self, Command, PubSubKind};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::pool::DedicatedLease;
use crate::proto::Reply;
use crate::sentinel;
use crate::wire::pubsub::PubSubMessage;

/// The result of a cached call.
#[derive(Debug, Clone)]
pub struct CachedReply {
    /// The reply, served locally or fetched.
    pub reply: Reply,
    /// True when the reply came from the local cache.
    pub hit: bool,
}

/// A connection-multiplexing client for standalone, sentinel-managed and
/// clustered deployments.
///
/// Cloning is cheap; clones share every connection and cache.
///
/// # Example
///
/// ```no_run
/// use replex::{Client, ClientOptions, Command};
///
/// #[tokio::main]
/// async fn main() -> replex::Result<()> {
///     let client = Client::connect(ClientOptions::new(["localhost:6379"])).await?;
///     client.do_command(Command::new("SET").key("k").arg("v")).await?;
///     let reply = client.do_command(Command::new("GET").key("k")).await?;
///     assert_eq!(reply.as_str(), Some("v"));
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    topo: Arc<Topology>,
}

impl Client {
    /// Connects using the given options and bootstraps the topology.
    pub async fn connect(opts: ClientOptions) -> Result<Self> {
        let mut seeds = opts.normalized_seeds()?;
        if opts.shuffle_init {
            seeds.shuffle(&mut rand::thread_rng());
        }
        let opts = Arc::new(opts);
        let topo = Topology::new(opts.clone(), seeds.clone());
        topo.refresh().await?;
        if opts.sentinel_master.is_some() {
            sentinel::spawn_watcher(Arc::downgrade(&topo), opts, seeds);
        }
        Ok(Self { topo })
    }

    /// Sends one command and returns its reply.
    ///
    /// Server errors are returned as [`Reply::Error`] data; redirects are
    /// followed internally. Cancel by dropping the future or wrapping it in
    /// [`tokio::time::timeout`]; a command already on the socket still runs
    /// server-side, but later requests keep their replies.
    pub async fn do_command(&self, cmd: Command) -> Result<Reply> {
        router::drive(&self.topo, cmd).await
    }

    /// Sends a block of commands as one pipeline.
    ///
    /// Commands sharing a primary go out contiguously with no interleaving
    /// from other callers; a batch spanning primaries is split and the
    /// replies are reassembled in the original order. Mixing keyless and
    /// keyed commands is rejected with [`Error::MixedSlot`] before any I/O.
    pub async fn do_multi(&self, cmds: Vec<Command>) -> Result<Vec<Reply>> {
        router::drive_pipeline(&self.topo, cmds).await
    }

    /// Serves a cacheable command from the client-side cache when possible.
    ///
    /// On a miss the fetch piggybacks the server's remaining key TTL, and
    /// the entry is stored under the smaller of that and `ttl`. Concurrent
    /// misses for the same fingerprint coalesce into one fetch. When
    /// tracking is unavailable the call falls back to [`Client::do_command`]
    /// and reports a miss.
    pub async fn do_cache(&self, cmd: Command, ttl: Duration) -> Result<CachedReply> {
        let key = match (cmd.is_cacheable(), cmd.cache_key()) {
            (true, Some(key)) => key.clone(),
            _ => {
                let reply = self.do_command(cmd).await?;
                return Ok(CachedReply { reply, hit: false });
            }
        };
        let slot = crate::cluster::key_slot(&key);
        let fingerprint = cmd.fingerprint();
        let mut backoff = Duration::from_millis(2);
        let mut redirects = 0usize;

        loop {
            if self.topo.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            let pool = self.topo.primary_pool_for_slot(slot)?;
            let wire = pool.acquire().await?;
            let cache = match pool.cache.clone().filter(|c| c.is_serving()) {
                Some(cache) => cache,
                None => {
                    let reply = self.do_command(cmd).await?;
                    return Ok(CachedReply { reply, hit: false });
                }
            };

            match cache.begin(&key, &fingerprint) {
                Begin::Hit(reply) => return Ok(CachedReply { reply, hit: true }),
                Begin::Bypass => continue,
                Begin::Wait(mut flight) => {
                    loop {
                        let state = flight.borrow_and_update().clone();
                        match state {
                            FlightState::Done(reply) => {
                                return Ok(CachedReply { reply, hit: true })
                            }
                            FlightState::Failed => break,
                            FlightState::Pending => {
                                if flight.changed().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    // The owning fetch failed; take a turn ourselves.
                    continue;
                }
                Begin::Fetch(guard) => {
                    let batch = vec![cmd::client_caching_yes(), cmd::pttl(&key), cmd.clone()];
                    let replies = match wire.do_multi(batch).await {
                        Ok(replies) => replies,
                        Err(e) => return Err(e),
                    };
                    if replies.len() != 3 {
                        return Err(Error::protocol("short caching pipeline reply"));
                    }
                    let reply = replies[2].clone();
                    if let Some(redirect) = classify(&reply) {
                        guard.abort();
                        redirects += 1;
                        match redirect {
                            Redirect::Moved { slot, address }
                                if redirects < router::REFRESH_HOP_WINDOW =>
                            {
                                self.topo.patch_moved(slot, &address);
                                self.topo.schedule_refresh();
                                continue;
                            }
                            Redirect::TryAgain if redirects < router::REFRESH_HOP_WINDOW => {
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(Duration::from_millis(128));
                                continue;
                            }
                            // ASK targets do not own the key yet, and a
                            // longer chain means the map is churning; either
                            // way the fetch finishes uncached through the
                            // router, which owns the redirect budget.
                            redirect => {
                                let reply =
                                    router::drive_from(&self.topo, cmd, Some(redirect)).await?;
                                return Ok(CachedReply { reply, hit: false });
                            }
                        }
                    }
                    if let Some(message) = replies[0].error_message() {
                        warn!(%message, "caching preamble rejected");
                        guard.abort();
                        return Ok(CachedReply { reply, hit: false });
                    }
                    if reply.error_message().is_some() {
                        // Server errors are data and are never cached.
                        guard.abort();
                        return Ok(CachedReply { reply, hit: false });
                    }
                    let ttl = match replies[1].as_int() {
                        Some(ms) if ms >= 0 => ttl.min(Duration::from_millis(ms as u64)),
                        _ => ttl,
                    };
                    guard.complete(reply.clone(), ttl);
                    return Ok(CachedReply { reply, hit: false });
                }
            }
        }
    }

    /// Subscribes and delivers matching messages to `handler` until the
    /// subscription is closed or its connection breaks.
    ///
    /// Sharded subscriptions are slot-routed; channel and pattern
    /// subscriptions go to any primary. The subscription holds a dedicated
    /// wire for its whole lifetime.
    pub async fn receive(
        &self,
        cmd: Command,
        handler: impl FnMut(PubSubMessage) + Send + 'static,
    ) -> Result<()> {
        let kind = cmd
            .pubsub_kind()
            .ok_or_else(|| Error::protocol("receive requires a subscribe command"))?;
        let pool = match kind {
            PubSubKind::SSubscribe | PubSubKind::SUnsubscribe => {
                let slot = cmd.slot().ok_or(Error::NoSlot)?;
                self.topo.primary_pool_for_slot(slot)?
            }
            _ => self.topo.any_primary_pool()?,
        };
        let lease = pool.lease().await?;
        let result = lease.wire().receive(cmd, handler).await;
        lease.release();
        result
    }

    /// Leases an exclusive connection, for transactions and manual driving.
    pub async fn dedicate(&self) -> Result<DedicatedClient> {
        let pool = self.topo.any_primary_pool()?;
        let lease = pool.lease().await?;
        Ok(DedicatedClient { lease })
    }

    /// Leases an exclusive connection to the node serving `key`.
    pub async fn dedicate_for(&self, key: &[u8]) -> Result<DedicatedClient> {
        let pool = self
            .topo
            .primary_pool_for_slot(crate::cluster::key_slot(key))?;
        let lease = pool.lease().await?;
        Ok(DedicatedClient { lease })
    }

    /// Shuts the client down: no new requests; in-flight calls finish and
    /// every connection drains and closes.
    pub fn close(&self) {
        self.topo.close();
    }
}

/// An exclusively leased connection.
///
/// Commands sent here never interleave with other callers, which is what
/// `MULTI`/`EXEC` sequences and blocking reads require. Dropping the value
/// returns the connection to its pool; [`release`](DedicatedClient::release)
/// does the same explicitly, and doing both is harmless.
pub struct DedicatedClient {
    lease: DedicatedLease,
}

impl DedicatedClient {
    /// Sends one command on the leased connection.
    pub async fn do_command(&self, cmd: Command) -> Result<Reply> {
        self.lease.wire().do_cmd(cmd).await
    }

    /// Sends a contiguous pipeline on the leased connection.
    pub async fn do_multi(&self, cmds: Vec<Command>) -> Result<Vec<Reply>> {
        self.lease.wire().do_multi(cmds).await
    }

    /// Subscribes on the leased connection and delivers messages to
    /// `handler` until the subscription closes.
    pub async fn receive(
        &self,
        cmd: Command,
        handler: impl FnMut(PubSubMessage) + Send + 'static,
    ) -> Result<()> {
        self.lease.wire().receive(cmd, handler).await
    }

    /// Installs a standing push handler on the leased connection.
    ///
    /// The returned channel yields the connection's terminal error when it
    /// breaks, and closes silently if the hooks are replaced.
    pub fn set_pubsub_hooks(
        &self,
        handler: impl FnMut(PubSubMessage) + Send + 'static,
    ) -> oneshot::Receiver<Error> {
        self.lease.wire().set_pubsub_hooks(handler)
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        self.lease.release();
    }
}
