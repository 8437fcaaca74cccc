//! The pipeline engine.
//!
//! A [`Wire`] is one TCP connection plus two private tasks: a writer that
//! drains a bounded job queue onto the socket, and a reader that decodes
//! replies and completes waiting callers in strict enqueue order. Push
//! frames are demultiplexed before the reply queue is consulted, so
//! out-of-band traffic (invalidations, pub/sub) can never steal a pending
//! caller's reply.
//!
//! Cancellation is dropping the returned future: the caller's completion
//! channel dies, its queue slot stays, and the reader later discards the
//! reply into the dead channel. Removing the slot instead would shift every
//! later caller onto the wrong reply.

pub(crate) mod pubsub;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::cmd::{self, Command};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::proto::{Decoder, Encoder, Reply};

use self::pubsub::{route_push, PubSubMessage, PushDisposition, PushRouter};

const WRITE_QUEUE_DEPTH: usize = 1024;
const MAX_COALESCE: usize = 256;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireState {
    /// Handshake in progress.
    Connecting,
    /// Accepting pipelined traffic.
    Ready,
    /// Subscriber mode; only subscription commands and PING may be sent.
    Subscribing,
    /// Exclusively leased.
    Dedicated,
    /// Terminally failed.
    Broken,
}

impl WireState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WireState::Connecting,
            1 => WireState::Ready,
            2 => WireState::Subscribing,
            3 => WireState::Dedicated,
            _ => WireState::Broken,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Broken,
}

enum Job {
    One {
        cmd: Command,
        done: oneshot::Sender<Result<Reply>>,
    },
    Batch {
        cmds: Vec<Command>,
        done: oneshot::Sender<Result<Vec<Reply>>>,
    },
}

impl Job {
    fn fail(self, err: &Error) {
        match self {
            Job::One { done, .. } => {
                let _ = done.send(Err(err.duplicate()));
            }
            Job::Batch { done, .. } => {
                let _ = done.send(Err(err.duplicate()));
            }
        }
    }
}

/// One position in the reply queue.
enum Waiter {
    One(oneshot::Sender<Result<Reply>>),
    Batch {
        remaining: usize,
        collected: Vec<Reply>,
        done: oneshot::Sender<Result<Vec<Reply>>>,
    },
}

impl Waiter {
    fn fail(self, err: &Error) {
        match self {
            Waiter::One(done) => {
                let _ = done.send(Err(err.duplicate()));
            }
            Waiter::Batch { done, .. } => {
                let _ = done.send(Err(err.duplicate()));
            }
        }
    }
}

/// Completions owed as soon as the flush succeeds, for commands that occupy
/// no reply-queue slot.
enum FlushAck {
    One(oneshot::Sender<Result<Reply>>),
    Batch(oneshot::Sender<Result<Vec<Reply>>>),
}

impl FlushAck {
    fn complete(self) {
        match self {
            FlushAck::One(done) => {
                let _ = done.send(Ok(Reply::Null));
            }
            FlushAck::Batch(done) => {
                let _ = done.send(Ok(Vec::new()));
            }
        }
    }

    fn fail(self, err: &Error) {
        match self {
            FlushAck::One(done) => {
                let _ = done.send(Err(err.duplicate()));
            }
            FlushAck::Batch(done) => {
                let _ = done.send(Err(err.duplicate()));
            }
        }
    }
}

pub(crate) struct WireShared {
    state: AtomicU8,
    error: Mutex<Option<Error>>,
    lifecycle: watch::Sender<Lifecycle>,
    last_read: Mutex<Instant>,
    router: PushRouter,
}

impl WireShared {
    fn new() -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        Arc::new(Self {
            state: AtomicU8::new(WireState::Connecting as u8),
            error: Mutex::new(None),
            lifecycle,
            last_read: Mutex::new(Instant::now()),
            router: PushRouter::default(),
        })
    }

    fn state(&self) -> WireState {
        WireState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WireState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Terminal failure: records the first error, marks the wire broken and
    /// wakes both loops. Idempotent.
    fn fail(&self, err: Error) {
        {
            let mut slot = self.error.lock().expect("wire error lock poisoned");
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.set_state(WireState::Broken);
        let _ = self.lifecycle.send(Lifecycle::Broken);
    }

    fn begin_close(&self) {
        if self.state() != WireState::Broken {
            let _ = self.lifecycle.send(Lifecycle::Closing);
        }
    }

    fn terminal_error(&self) -> Error {
        self.error
            .lock()
            .expect("wire error lock poisoned")
            .as_ref()
            .map(Error::duplicate)
            .unwrap_or(Error::ConnectionClosed)
    }

    fn touch(&self) {
        *self.last_read.lock().expect("wire clock lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_read
            .lock()
            .expect("wire clock lock poisoned")
            .elapsed()
    }
}

struct Negotiated {
    resp3: bool,
    tracking: bool,
}

/// A connection with its writer and reader tasks.
pub(crate) struct Wire {
    jobs: mpsc::Sender<Job>,
    shared: Arc<WireShared>,
    resp3: bool,
    tracking: bool,
}

impl Wire {
    /// Dials `addr` and runs the connect-time sequence.
    ///
    /// Tracking is negotiated when `cache` is supplied; on failure the cache
    /// stays disabled for this connection but the wire remains usable.
    pub(crate) async fn connect(
        addr: &str,
        opts: &ClientOptions,
        cache: Option<Arc<Cache>>,
    ) -> Result<Arc<Wire>> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let mut conn = RawConn::new(stream);
        let negotiated = handshake(&mut conn, opts, cache.is_some()).await?;
        if let Some(cache) = &cache {
            cache.set_serving(negotiated.tracking);
        }

        let shared = WireShared::new();
        shared.set_state(WireState::Ready);

        let (jobs_tx, jobs_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (fifo_tx, fifo_rx) = mpsc::unbounded_channel();
        let RawConn { stream, decoder, .. } = conn;
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(write_loop(
            jobs_rx,
            write_half,
            fifo_tx,
            shared.clone(),
            opts.conn_write_timeout,
            opts.max_flush_delay,
        ));
        tokio::spawn(read_loop(
            read_half,
            decoder,
            fifo_rx,
            shared.clone(),
            cache,
        ));
        spawn_heartbeat(jobs_tx.clone(), shared.clone(), opts.ping_interval);

        debug!(addr, resp3 = negotiated.resp3, tracking = negotiated.tracking, "connected");
        Ok(Arc::new(Wire {
            jobs: jobs_tx,
            shared,
            resp3: negotiated.resp3,
            tracking: negotiated.tracking,
        }))
    }

    pub(crate) fn state(&self) -> WireState {
        self.shared.state()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.shared.state() == WireState::Ready
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.state() != WireState::Broken
    }

    pub(crate) fn is_resp3(&self) -> bool {
        self.resp3
    }

    pub(crate) fn supports_tracking(&self) -> bool {
        self.tracking
    }

    pub(crate) fn set_dedicated(&self) {
        self.shared.set_state(WireState::Dedicated);
    }

    pub(crate) fn set_ready(&self) {
        if self.shared.state() != WireState::Broken {
            self.shared.set_state(WireState::Ready);
        }
    }

    /// Starts a graceful drain: queued requests finish, then the tasks stop.
    pub(crate) fn close(&self) {
        self.shared.begin_close();
    }

    pub(crate) fn terminal_error(&self) -> Error {
        self.shared.terminal_error()
    }

    fn check_sendable(&self, cmd: &Command) -> Result<()> {
        match self.shared.state() {
            WireState::Broken => Err(self.terminal_error()),
            WireState::Subscribing
                if cmd.pubsub_kind().is_none() && !cmd.args()[0].eq_ignore_ascii_case(b"PING") =>
            {
                Err(Error::protocol("connection is in subscriber mode"))
            }
            _ => Ok(()),
        }
    }

    /// Sends one command and waits for its reply.
    ///
    /// Server errors come back as [`Reply::Error`] data; only transport and
    /// protocol failures are `Err`.
    pub(crate) async fn do_cmd(&self, cmd: Command) -> Result<Reply> {
        self.check_sendable(&cmd)?;
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Job::One { cmd, done: tx })
            .await
            .map_err(|_| self.terminal_error())?;
        rx.await.map_err(|_| self.terminal_error())?
    }

    /// Sends a contiguous block of commands as one pipeline.
    ///
    /// The block is enqueued atomically: no other caller's commands
    /// interleave with it, and replies come back in block order.
    pub(crate) async fn do_multi(&self, cmds: Vec<Command>) -> Result<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        for cmd in &cmds {
            self.check_sendable(cmd)?;
        }
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Job::Batch { cmds, done: tx })
            .await
            .map_err(|_| self.terminal_error())?;
        rx.await.map_err(|_| self.terminal_error())?
    }

    /// Enters subscriber mode and delivers matching pushes to `handler`
    /// until every subscription is confirmed closed or the wire breaks.
    pub(crate) async fn receive(
        &self,
        cmd: Command,
        handler: impl FnMut(PubSubMessage) + Send + 'static,
    ) -> Result<()> {
        if !self.resp3 {
            return Err(Error::protocol(
                "subscriptions require the RESP3 handshake",
            ));
        }
        if cmd.pubsub_kind().is_none() {
            return Err(Error::protocol("receive requires a subscribe command"));
        }
        let done = self.shared.router.begin_receive(Box::new(handler));
        self.shared.set_state(WireState::Subscribing);
        self.do_cmd(cmd).await?;
        match done.await {
            Ok(result) => result,
            Err(_) => Err(self.terminal_error()),
        }
    }

    /// Installs a standing push handler for this wire.
    ///
    /// The returned channel yields the wire's terminal error when it breaks
    /// and closes silently when the hooks are replaced.
    pub(crate) fn set_pubsub_hooks(
        &self,
        handler: impl FnMut(PubSubMessage) + Send + 'static,
    ) -> oneshot::Receiver<Error> {
        self.shared.router.set_handler(Box::new(handler))
    }
}

struct RawConn {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
}

impl RawConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    async fn roundtrip(&mut self, cmd: &Command) -> Result<Reply> {
        self.encoder.encode(cmd);
        let buf = self.encoder.take();
        self.stream.write_all(&buf).await?;
        loop {
            if let Some(reply) = self.decoder.next()? {
                return Ok(reply);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.decoder.append(&chunk[..n]);
        }
    }
}

/// Runs the ordered connect-time sequence; each step is a precondition for
/// the next.
async fn handshake(conn: &mut RawConn, opts: &ClientOptions, want_tracking: bool) -> Result<Negotiated> {
    let hello = cmd::hello(
        opts.username.as_deref(),
        opts.password.as_deref(),
        opts.client_name.as_deref(),
    );
    let resp3 = match conn.roundtrip(&hello).await? {
        Reply::Error(message)
            if message.contains("unknown command") || message.starts_with("NOPROTO") =>
        {
            // Pre-RESP3 server: authenticate and name the connection the
            // long way, one command at a time.
            if let Some(password) = &opts.password {
                conn.roundtrip(&cmd::auth(opts.username.as_deref(), password))
                    .await?
                    .into_result()?;
            }
            if let Some(name) = &opts.client_name {
                let _ = conn.roundtrip(&cmd::client_setname(name)).await?;
            }
            false
        }
        Reply::Error(message) => return Err(Error::Redis { message }),
        _ => true,
    };
    if let Some(db) = opts.select_db {
        conn.roundtrip(&cmd::select(db)).await?.into_result()?;
    }
    let mut tracking = false;
    if want_tracking {
        if !resp3 {
            warn!("server lacks RESP3; client-side caching disabled on this connection");
        } else {
            match conn.roundtrip(&cmd::client_tracking_on()).await? {
                Reply::Error(message) => {
                    warn!(%message, "invalidation tracking rejected; client-side caching disabled on this connection");
                }
                _ => tracking = true,
            }
        }
    }
    Ok(Negotiated { resp3, tracking })
}

async fn write_loop(
    mut jobs: mpsc::Receiver<Job>,
    mut sink: OwnedWriteHalf,
    fifo: mpsc::UnboundedSender<Waiter>,
    shared: Arc<WireShared>,
    write_timeout: Duration,
    flush_delay: Duration,
) {
    let mut encoder = Encoder::new();
    let mut lifecycle = shared.lifecycle.subscribe();
    'main: loop {
        let first = tokio::select! {
            _ = lifecycle.changed() => break 'main,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break 'main,
            },
        };
        let mut batch = vec![first];
        // Coalesce whatever is already queued, waiting at most flush_delay
        // for stragglers, so concurrent callers share one syscall.
        while batch.len() < MAX_COALESCE {
            match jobs.try_recv() {
                Ok(job) => batch.push(job),
                Err(TryRecvError::Empty) => {
                    if flush_delay.is_zero() {
                        break;
                    }
                    match tokio::time::timeout(flush_delay, jobs.recv()).await {
                        Ok(Some(job)) => batch.push(job),
                        Ok(None) | Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        // Waiters are registered before the flush; the reader sees them in
        // enqueue order even if a reply races the write completion.
        let mut flush_acks = Vec::new();
        for job in batch {
            match job {
                Job::One { cmd, done } => {
                    encoder.encode(&cmd);
                    if cmd.is_noreply() {
                        flush_acks.push(FlushAck::One(done));
                    } else if let Err(rejected) = fifo.send(Waiter::One(done)) {
                        rejected.0.fail(&shared.terminal_error());
                        break 'main;
                    }
                }
                Job::Batch { cmds, done } => {
                    let expected = cmds.iter().filter(|c| !c.is_noreply()).count();
                    for cmd in &cmds {
                        encoder.encode(cmd);
                    }
                    if expected == 0 {
                        flush_acks.push(FlushAck::Batch(done));
                    } else if let Err(rejected) = fifo.send(Waiter::Batch {
                        remaining: expected,
                        collected: Vec::with_capacity(expected),
                        done,
                    }) {
                        rejected.0.fail(&shared.terminal_error());
                        break 'main;
                    }
                }
            }
        }

        let buf = encoder.take();
        match tokio::time::timeout(write_timeout, sink.write_all(&buf)).await {
            Ok(Ok(())) => {
                for ack in flush_acks {
                    ack.complete();
                }
            }
            Ok(Err(e)) => {
                shared.fail(Error::Io { source: e });
                for ack in flush_acks {
                    ack.fail(&shared.terminal_error());
                }
                break;
            }
            Err(_) => {
                shared.fail(Error::Timeout);
                for ack in flush_acks {
                    ack.fail(&shared.terminal_error());
                }
                break;
            }
        }
    }

    // Whatever is still queued never reached the socket.
    let err = shared.terminal_error();
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        job.fail(&err);
    }
}

async fn read_loop(
    mut src: OwnedReadHalf,
    mut decoder: Decoder,
    mut fifo: mpsc::UnboundedReceiver<Waiter>,
    shared: Arc<WireShared>,
    cache: Option<Arc<Cache>>,
) {
    let mut lifecycle = shared.lifecycle.subscribe();
    let mut queue: VecDeque<Waiter> = VecDeque::new();
    let mut current: Option<Waiter> = None;
    let mut buf = vec![0u8; 16 * 1024];
    let mut fifo_closed = false;
    let mut closing = false;

    'main: loop {
        loop {
            match fifo.try_recv() {
                Ok(waiter) => queue.push_back(waiter),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    fifo_closed = true;
                    break;
                }
            }
        }

        loop {
            match decoder.next() {
                Ok(Some(reply)) => {
                    shared.touch();
                    if let Err(e) = deliver(reply, &mut current, &mut queue, &shared, cache.as_ref())
                    {
                        shared.fail(e);
                        break 'main;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.fail(e);
                    break 'main;
                }
            }
        }

        if closing && fifo_closed && current.is_none() && queue.is_empty() {
            break;
        }

        tokio::select! {
            res = src.read(&mut buf) => match res {
                Ok(0) => {
                    shared.fail(Error::ConnectionClosed);
                    break;
                }
                Ok(n) => decoder.append(&buf[..n]),
                Err(e) => {
                    shared.fail(Error::Io { source: e });
                    break;
                }
            },
            _ = lifecycle.changed() => {
                match *lifecycle.borrow() {
                    Lifecycle::Broken => break,
                    Lifecycle::Closing => closing = true,
                    Lifecycle::Open => {}
                }
            }
            // While draining, re-check for writer shutdown between reads.
            _ = tokio::time::sleep(Duration::from_millis(5)), if closing => {}
        }
    }

    shared.fail(Error::ConnectionClosed);
    let err = shared.terminal_error();
    if let Some(waiter) = current.take() {
        waiter.fail(&err);
    }
    for waiter in queue.drain(..) {
        waiter.fail(&err);
    }
    fifo.close();
    while let Ok(waiter) = fifo.try_recv() {
        waiter.fail(&err);
    }
    shared.router.fail(&err);
    if let Some(cache) = &cache {
        cache.set_serving(false);
        cache.flush();
    }
}

/// Completes the next reply: pushes route out-of-band, everything else pops
/// the queue head.
fn deliver(
    reply: Reply,
    current: &mut Option<Waiter>,
    queue: &mut VecDeque<Waiter>,
    shared: &Arc<WireShared>,
    cache: Option<&Arc<Cache>>,
) -> Result<()> {
    if let Some(items) = reply.push_items() {
        if route_push(items, &shared.router, cache) == PushDisposition::SubscriptionsDrained
            && shared.state() == WireState::Subscribing
        {
            shared.set_state(WireState::Ready);
        }
        return Ok(());
    }
    let waiter = match current.take() {
        Some(waiter) => waiter,
        None => queue
            .pop_front()
            .ok_or_else(|| Error::protocol("reply received with no pending request"))?,
    };
    match waiter {
        Waiter::One(done) => {
            // A dead channel means the caller gave up; the reply is dropped
            // and ordering stays intact.
            let _ = done.send(Ok(reply));
        }
        Waiter::Batch {
            mut remaining,
            mut collected,
            done,
        } => {
            collected.push(reply);
            remaining -= 1;
            if remaining == 0 {
                let _ = done.send(Ok(collected));
            } else {
                *current = Some(Waiter::Batch {
                    remaining,
                    collected,
                    done,
                });
            }
        }
    }
    Ok(())
}

fn spawn_heartbeat(jobs: mpsc::Sender<Job>, shared: Arc<WireShared>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut lifecycle = shared.lifecycle.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = lifecycle.changed() => return,
            }
            if shared.idle_for() < interval {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            if jobs.send(Job::One { cmd: cmd::ping(), done: tx }).await.is_err() {
                return;
            }
            match tokio::time::timeout(interval, rx).await {
                Ok(Ok(Ok(_))) => {}
                Ok(_) => return,
                Err(_) => {
                    shared.fail(Error::Timeout);
                    return;
                }
            }
        }
    });
}
