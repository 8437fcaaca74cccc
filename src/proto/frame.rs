use bytes::Bytes;

use crate::error::{Error, Result};

/// A decoded server reply.
///
/// Covers both protocol generations: the classic kinds (simple string, error,
/// integer, bulk string, array) and the extended kinds negotiated via
/// `HELLO 3` (null, double, boolean, big number, verbatim string, map, set,
/// push, blob error). Attribute frames (`|`) attach out-of-band metadata to
/// the reply that follows them and decode to [`Reply::Attribute`].
///
/// A nil value is always [`Reply::Null`], regardless of whether the server
/// sent `_`, `$-1` or `*-1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Status line such as `+OK`.
    SimpleString(Bytes),
    /// Server error reply, message verbatim (without the leading `-`).
    Error(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Binary-safe string.
    BulkString(Bytes),
    /// Ordered aggregate.
    Array(Vec<Reply>),
    /// Nil.
    Null,
    /// Double-precision float (`,`), including `inf`, `-inf` and `nan`.
    Double(f64),
    /// Boolean (`#t` / `#f`).
    Boolean(bool),
    /// Arbitrary-precision integer (`(`), kept as its decimal digits.
    BigNumber(Bytes),
    /// Verbatim string (`=`) with its three-letter format prefix.
    Verbatim {
        /// Format tag, e.g. `txt` or `mkd`.
        format: [u8; 3],
        /// The text payload.
        text: Bytes,
    },
    /// Key-value aggregate (`%`).
    Map(Vec<(Reply, Reply)>),
    /// Unordered aggregate (`~`).
    Set(Vec<Reply>),
    /// Out-of-band push frame (`>`). Never a response to a pending request.
    Push(Vec<Reply>),
    /// Attribute metadata attached to the reply that followed it.
    Attribute {
        /// The attribute map.
        attrs: Vec<(Reply, Reply)>,
        /// The reply the attributes decorate.
        inner: Box<Reply>,
    },
}

impl Reply {
    /// Strips any attribute wrapper and returns the payload reply.
    pub fn payload(&self) -> &Reply {
        match self {
            Reply::Attribute { inner, .. } => inner.payload(),
            other => other,
        }
    }

    /// Returns true if this reply is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self.payload(), Reply::Null)
    }

    /// Returns true if this reply is an out-of-band push frame.
    pub fn is_push(&self) -> bool {
        matches!(self.payload(), Reply::Push(_))
    }

    /// Returns the elements of a push frame, if this is one.
    pub fn push_items(&self) -> Option<&[Reply]> {
        match self.payload() {
            Reply::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the error message if this reply is a server error.
    pub fn error_message(&self) -> Option<&str> {
        match self.payload() {
            Reply::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Returns the raw bytes of a bulk, simple or verbatim string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self.payload() {
            Reply::BulkString(b) | Reply::SimpleString(b) => Some(b),
            Reply::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Returns the reply as UTF-8 text, if it is a string kind.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the integer value, if this is an integer reply.
    pub fn as_int(&self) -> Option<i64> {
        match self.payload() {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the elements of an array or set reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self.payload() {
            Reply::Array(items) | Reply::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Converts the reply into a `Result`, turning server errors into
    /// [`Error::Redis`] and nil into [`Error::Nil`].
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(message) => Err(Error::Redis { message }),
            Reply::Null => Err(Error::Nil),
            Reply::Attribute { attrs, inner } => Ok(Reply::Attribute {
                attrs,
                inner: Box::new(inner.into_result()?),
            }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_unwraps_attributes() {
        let reply = Reply::Attribute {
            attrs: vec![(
                Reply::SimpleString(Bytes::from("ttl")),
                Reply::Integer(3600),
            )],
            inner: Box::new(Reply::BulkString(Bytes::from("value"))),
        };
        assert_eq!(reply.as_str(), Some("value"));
        assert!(!reply.is_nil());
    }

    #[test]
    fn test_is_nil() {
        assert!(Reply::Null.is_nil());
        assert!(!Reply::Integer(0).is_nil());
    }

    #[test]
    fn test_push_items() {
        let push = Reply::Push(vec![
            Reply::BulkString(Bytes::from("message")),
            Reply::BulkString(Bytes::from("chan")),
            Reply::BulkString(Bytes::from("hello")),
        ]);
        assert!(push.is_push());
        assert_eq!(push.push_items().unwrap().len(), 3);
        assert!(Reply::Null.push_items().is_none());
    }

    #[test]
    fn test_into_result_error() {
        let reply = Reply::Error("ERR wrong type".to_string());
        match reply.into_result() {
            Err(Error::Redis { message }) => assert_eq!(message, "ERR wrong type"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_into_result_nil() {
        assert!(Reply::Null.into_result().unwrap_err().is_nil());
    }

    #[test]
    fn test_as_int() {
        assert_eq!(Reply::Integer(7).as_int(), Some(7));
        assert_eq!(Reply::Null.as_int(), None);
    }
}
