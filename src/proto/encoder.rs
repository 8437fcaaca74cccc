use bytes::{BufMut, Bytes, BytesMut};

use crate::cmd::Command;

/// Serializes outgoing commands.
///
/// A request is always the flat array-of-bulk-strings form
/// `*<N>\r\n$<len>\r\n<arg>\r\n...`, which both protocol generations accept.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates an encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the serialized form of `cmd` to the internal buffer.
    pub fn encode(&mut self, cmd: &Command) {
        let args = cmd.args();
        self.buf.put_u8(b'*');
        self.buf.extend_from_slice(args.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        for arg in args {
            self.buf.put_u8(b'$');
            self.buf.extend_from_slice(arg.len().to_string().as_bytes());
            self.buf.extend_from_slice(b"\r\n");
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(b"\r\n");
        }
    }

    /// Takes the accumulated bytes, leaving the buffer empty.
    pub fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

/// One-shot serialization of a single command.
pub fn encode_command(cmd: &Command) -> Bytes {
    let mut encoder = Encoder::new();
    encoder.encode(cmd);
    encoder.take().freeze()
}
