//! Redirect classification.
//!
//! A cluster node answers a misrouted command with a redirect error:
//! `MOVED <slot> <host>:<port>` when slot ownership has changed permanently,
//! `ASK <slot> <host>:<port>` while the slot migrates, and `TRYAGAIN` when
//! the keys of a multi-key operation are split mid-migration.

use crate::proto::Reply;

/// A parsed redirect directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    /// Permanent owner change; the slot mapping should be updated.
    Moved {
        /// Redirected slot.
        slot: u16,
        /// New owner address.
        address: String,
    },
    /// Temporary redirect; the mapping must not change.
    Ask {
        /// Migrating slot.
        slot: u16,
        /// Importing node address.
        address: String,
    },
    /// Retry the same node after a short pause.
    TryAgain,
}

/// Classifies a reply as a redirect, if it is one.
///
/// Any other reply, error or not, returns `None` and is handed to the caller
/// as data.
pub(crate) fn classify(reply: &Reply) -> Option<Redirect> {
    let message = reply.error_message()?;
    if let Some(rest) = message.strip_prefix("MOVED ") {
        let (slot, address) = parse_target(rest)?;
        return Some(Redirect::Moved { slot, address });
    }
    if let Some(rest) = message.strip_prefix("ASK ") {
        let (slot, address) = parse_target(rest)?;
        return Some(Redirect::Ask { slot, address });
    }
    if message.starts_with("TRYAGAIN") {
        return Some(Redirect::TryAgain);
    }
    None
}

/// Parses redirect arguments of the form `<slot> <host>:<port>`.
fn parse_target(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some((slot, address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(message: &str) -> Reply {
        Reply::Error(message.to_string())
    }

    #[test]
    fn test_classify_moved() {
        assert_eq!(
            classify(&err("MOVED 3999 127.0.0.1:7000")),
            Some(Redirect::Moved {
                slot: 3999,
                address: "127.0.0.1:7000".to_string()
            })
        );
    }

    #[test]
    fn test_classify_ask() {
        assert_eq!(
            classify(&err("ASK 12345 192.168.1.100:6379")),
            Some(Redirect::Ask {
                slot: 12345,
                address: "192.168.1.100:6379".to_string()
            })
        );
    }

    #[test]
    fn test_classify_tryagain() {
        assert_eq!(
            classify(&err("TRYAGAIN Multiple keys request during rehashing of slot")),
            Some(Redirect::TryAgain)
        );
    }

    #[test]
    fn test_classify_plain_error_is_data() {
        assert_eq!(classify(&err("ERR unknown command")), None);
        assert_eq!(classify(&err("CLUSTERDOWN Hash slot not served")), None);
    }

    #[test]
    fn test_classify_non_error() {
        assert_eq!(classify(&Reply::Integer(1)), None);
    }

    #[test]
    fn test_classify_malformed_redirect_is_data() {
        assert_eq!(classify(&err("MOVED 3999")), None);
        assert_eq!(classify(&err("MOVED nonsense 127.0.0.1:7000")), None);
    }

    #[test]
    fn test_parse_target_hostnames_and_ipv6() {
        assert_eq!(
            parse_target("999 redis-a.local:6379"),
            Some((999, "redis-a.local:6379".to_string()))
        );
        assert_eq!(
            parse_target("1234 [::1]:7000"),
            Some((1234, "[::1]:7000".to_string()))
        );
    }
}
