//! Push-frame routing.
//!
//! Push frames are out-of-band: they are never answers to pending requests,
//! so the reader classifies them here before it ever consults the reply
//! queue. Invalidation pushes feed the client-side cache; everything else in
//! the pub/sub family goes through the wire's [`PushRouter`].

use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::proto::Reply;

/// A message delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Channel the message was published to.
    pub channel: String,
    /// Matching pattern, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Message payload.
    pub payload: Bytes,
}

pub(crate) type PushHandler = Box<dyn FnMut(PubSubMessage) + Send>;

/// Per-wire push routing state.
///
/// Owned by the wire's shared half; mutated only under its own lock, from
/// the reader task and from callers installing handlers.
#[derive(Default)]
pub(crate) struct PushRouter {
    inner: Mutex<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    handler: Option<PushHandler>,
    receive_done: Option<oneshot::Sender<Result<()>>>,
    hook_break: Option<oneshot::Sender<Error>>,
}

/// What the reader should do after a push frame was routed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushDisposition {
    /// Nothing further; the frame was consumed.
    Routed,
    /// The last subscription on this wire ended.
    SubscriptionsDrained,
}

impl PushRouter {
    /// Installs a handler and a completion slot for a `receive` call.
    ///
    /// The returned channel resolves when every subscription this wire holds
    /// has been confirmed unsubscribed, or with the wire's terminal error.
    pub(crate) fn begin_receive(&self, handler: PushHandler) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("push router poisoned");
        inner.handler = Some(handler);
        inner.receive_done = Some(tx);
        rx
    }

    /// Installs a standing handler for every pub/sub push on this wire.
    ///
    /// The returned channel yields the wire's terminal error when it breaks;
    /// it closes without a value when the hooks are replaced.
    pub(crate) fn set_handler(&self, handler: PushHandler) -> oneshot::Receiver<Error> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("push router poisoned");
        inner.handler = Some(handler);
        inner.hook_break = Some(tx);
        rx
    }

    fn dispatch(&self, message: PubSubMessage) {
        let mut inner = self.inner.lock().expect("push router poisoned");
        if let Some(handler) = inner.handler.as_mut() {
            handler(message);
        }
    }

    /// Confirmation arrived; `active` is the server's count of remaining
    /// subscriptions on the connection.
    fn on_confirmation(&self, active: i64) -> PushDisposition {
        if active > 0 {
            return PushDisposition::Routed;
        }
        let mut inner = self.inner.lock().expect("push router poisoned");
        inner.handler = None;
        if let Some(done) = inner.receive_done.take() {
            let _ = done.send(Ok(()));
        }
        PushDisposition::SubscriptionsDrained
    }

    /// The wire broke; notify every party holding a channel into the router.
    pub(crate) fn fail(&self, err: &Error) {
        let mut inner = self.inner.lock().expect("push router poisoned");
        inner.handler = None;
        if let Some(done) = inner.receive_done.take() {
            let _ = done.send(Err(err.duplicate()));
        }
        if let Some(hook) = inner.hook_break.take() {
            let _ = hook.send(err.duplicate());
        }
    }
}

/// Routes one push frame. Must run before the reply queue is consulted.
pub(crate) fn route_push(
    items: &[Reply],
    router: &PushRouter,
    cache: Option<&Arc<Cache>>,
) -> PushDisposition {
    let Some(kind) = items.first().and_then(|k| k.as_str()) else {
        return PushDisposition::Routed;
    };
    match kind {
        "invalidate" => {
            if let Some(cache) = cache {
                match items.get(1).map(Reply::payload) {
                    // A nil payload means the server flushed its keyspace.
                    Some(Reply::Null) | None => cache.flush(),
                    Some(keys) => {
                        if let Some(keys) = keys.as_array() {
                            cache.invalidate(keys.iter().filter_map(|k| k.as_bytes()));
                        }
                    }
                }
            }
            PushDisposition::Routed
        }
        "message" | "smessage" => {
            if let (Some(channel), Some(payload)) = (
                items.get(1).and_then(|c| c.as_str()),
                items.get(2).and_then(|p| p.as_bytes()),
            ) {
                router.dispatch(PubSubMessage {
                    channel: channel.to_string(),
                    pattern: None,
                    payload: payload.clone(),
                });
            }
            PushDisposition::Routed
        }
        "pmessage" => {
            if let (Some(pattern), Some(channel), Some(payload)) = (
                items.get(1).and_then(|p| p.as_str()),
                items.get(2).and_then(|c| c.as_str()),
                items.get(3).and_then(|p| p.as_bytes()),
            ) {
                router.dispatch(PubSubMessage {
                    channel: channel.to_string(),
                    pattern: Some(pattern.to_string()),
                    payload: payload.clone(),
                });
            }
            PushDisposition::Routed
        }
        "subscribe" | "psubscribe" | "ssubscribe" | "unsubscribe" | "punsubscribe"
        | "sunsubscribe" => {
            let active = items.get(2).and_then(|n| n.as_int()).unwrap_or(0);
            router.on_confirmation(active)
        }
        _ => PushDisposition::Routed,
    }
}
