//! Command construction.
//!
//! A [`Command`] is an immutable argument list plus the routing metadata the
//! engine needs: the key it hashes on, whether its reply may be cached,
//! whether it blocks the connection, whether its confirmations arrive as push
//! frames, and which subscription family it belongs to. Richer command
//! builders live outside this crate; they produce `Command` values through
//! this same surface.

use bytes::Bytes;

use crate::cluster::key_slot;

/// Subscription family of a pub/sub command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubKind {
    /// `SUBSCRIBE`
    Subscribe,
    /// `UNSUBSCRIBE`
    Unsubscribe,
    /// `PSUBSCRIBE`
    PSubscribe,
    /// `PUNSUBSCRIBE`
    PUnsubscribe,
    /// `SSUBSCRIBE` (sharded; slot-routed)
    SSubscribe,
    /// `SUNSUBSCRIBE`
    SUnsubscribe,
}

/// A command ready to be sent to the server.
///
/// # Example
///
/// ```
/// use replex::Command;
///
/// let cmd = Command::new("SET").key("user:1").arg("alice");
/// assert!(cmd.slot().is_some());
///
/// let blocking = Command::new("BLPOP").key("queue").arg("0").blocking();
/// assert!(blocking.is_blocking());
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    args: Vec<Bytes>,
    key: Option<Bytes>,
    cacheable: bool,
    blocking: bool,
    noreply: bool,
    pubsub: Option<PubSubKind>,
}

impl Command {
    /// Creates a command with the given name.
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            key: None,
            cacheable: false,
            blocking: false,
            noreply: false,
            pubsub: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends the routing key as the next argument.
    ///
    /// The first key recorded this way determines the command's hash slot and
    /// serves as the invalidation index for cached replies.
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        let key = key.into();
        if self.key.is_none() {
            self.key = Some(key.clone());
        }
        self.args.push(key);
        self
    }

    /// Marks the reply as eligible for the client-side cache.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Marks the command as blocking the connection it runs on.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Marks the command as a member of a subscription family.
    ///
    /// Subscription commands are confirmed through push frames, so they also
    /// take no slot in the reply queue.
    pub fn pubsub(mut self, kind: PubSubKind) -> Self {
        self.pubsub = Some(kind);
        self.noreply = true;
        self
    }

    /// The argument list.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The routing key, if the command has one.
    pub fn cache_key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// The hash slot for the routing key. `None` means the command may run on
    /// any node.
    pub fn slot(&self) -> Option<u16> {
        self.key.as_ref().map(|k| key_slot(k))
    }

    /// Whether the reply may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Whether the command blocks its connection.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Whether the command occupies no slot in the reply queue.
    pub fn is_noreply(&self) -> bool {
        self.noreply
    }

    /// The subscription family, for pub/sub commands.
    pub fn pubsub_kind(&self) -> Option<PubSubKind> {
        self.pubsub
    }

    /// The serialized form of the command, used as its cache fingerprint.
    pub fn fingerprint(&self) -> Bytes {
        crate::proto::encode_command(self)
    }
}

pub(crate) fn ping() -> Command {
    Command::new("PING")
}

pub(crate) fn hello(
    username: Option<&str>,
    password: Option<&str>,
    client_name: Option<&str>,
) -> Command {
    let mut cmd = Command::new("HELLO").arg("3");
    if let Some(password) = password {
        cmd = cmd
            .arg("AUTH")
            .arg(username.unwrap_or("default").to_string())
            .arg(password.to_string());
    }
    if let Some(name) = client_name {
        cmd = cmd.arg("SETNAME").arg(name.to_string());
    }
    cmd
}

pub(crate) fn auth(username: Option<&str>, password: &str) -> Command {
    let mut cmd = Command::new("AUTH");
    if let Some(username) = username {
        cmd = cmd.arg(username.to_string());
    }
    cmd.arg(password.to_string())
}

pub(crate) fn select(db: u32) -> Command {
    Command::new("SELECT").arg(db.to_string())
}

pub(crate) fn client_setname(name: &str) -> Command {
    Command::new("CLIENT").arg("SETNAME").arg(name.to_string())
}

// OPTIN keeps the server's tracking table to keys fetched through the
// cached path; each such fetch is preceded by CLIENT CACHING YES.
pub(crate) fn client_tracking_on() -> Command {
    Command::new("CLIENT").arg("TRACKING").arg("ON").arg("OPTIN")
}

pub(crate) fn client_caching_yes() -> Command {
    Command::new("CLIENT").arg("CACHING").arg("YES")
}

pub(crate) fn pttl(key: &Bytes) -> Command {
    Command::new("PTTL").arg(key.clone())
}

pub(crate) fn cluster_slots() -> Command {
    Command::new("CLUSTER").arg("SLOTS")
}

pub(crate) fn asking() -> Command {
    Command::new("ASKING")
}

pub(crate) fn sentinel_get_master_addr(master_set: &str) -> Command {
    Command::new("SENTINEL")
        .arg("GET-MASTER-ADDR-BY-NAME")
        .arg(master_set.to_string())
}

pub(crate) fn subscribe_switch_master() -> Command {
    Command::new("SUBSCRIBE")
        .arg("+switch-master")
        .pubsub(PubSubKind::Subscribe)
}
