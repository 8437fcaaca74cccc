use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::frame::Reply;

/// An incremental reply decoder.
///
/// Feed raw bytes with [`append`](Decoder::append), then pull complete
/// replies with [`next`](Decoder::next). `Ok(None)` means more data is
/// needed; the buffer is only consumed once a whole reply (including any
/// nested aggregates) has been parsed, so short reads never lose bytes.
///
/// Malformed input is a protocol error and fatal for the connection that
/// owns this decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    /// Creates a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes received from the peer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode the next reply.
    pub fn next(&mut self) -> Result<Option<Reply>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut pos = 0;
        match parse_reply(&self.buf, &mut pos)? {
            Some(reply) => {
                self.buf.advance(pos);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

fn parse_reply(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>> {
    let Some(&prefix) = buf.get(*pos) else {
        return Ok(None);
    };
    *pos += 1;
    match prefix {
        b'+' => Ok(read_line(buf, pos).map(|line| Reply::SimpleString(Bytes::copy_from_slice(line)))),
        b'-' => Ok(read_line(buf, pos)
            .map(|line| Reply::Error(String::from_utf8_lossy(line).into_owned()))),
        b':' => match read_line(buf, pos) {
            Some(line) => Ok(Some(Reply::Integer(parse_int(line)?))),
            None => Ok(None),
        },
        b'$' => parse_blob(buf, pos, false),
        b'!' => parse_blob(buf, pos, true),
        b'=' => parse_verbatim(buf, pos),
        b'*' => parse_aggregate(buf, pos, Kind::Array),
        b'~' => parse_aggregate(buf, pos, Kind::Set),
        b'>' => parse_aggregate(buf, pos, Kind::Push),
        b'%' => parse_map(buf, pos).map(|m| m.map(Reply::Map)),
        b'|' => parse_attribute(buf, pos),
        b'_' => match read_line(buf, pos) {
            Some(line) if line.is_empty() => Ok(Some(Reply::Null)),
            Some(_) => Err(Error::protocol("malformed null frame")),
            None => Ok(None),
        },
        b'#' => match read_line(buf, pos) {
            Some(b"t") => Ok(Some(Reply::Boolean(true))),
            Some(b"f") => Ok(Some(Reply::Boolean(false))),
            Some(_) => Err(Error::protocol("malformed boolean frame")),
            None => Ok(None),
        },
        b',' => match read_line(buf, pos) {
            Some(line) => {
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::protocol("non-utf8 double frame"))?;
                let value: f64 = text
                    .parse()
                    .map_err(|_| Error::protocol(format!("malformed double: {text}")))?;
                Ok(Some(Reply::Double(value)))
            }
            None => Ok(None),
        },
        b'(' => Ok(read_line(buf, pos).map(|line| Reply::BigNumber(Bytes::copy_from_slice(line)))),
        other => Err(Error::protocol(format!(
            "unknown frame prefix: 0x{other:02x}"
        ))),
    }
}

enum Kind {
    Array,
    Set,
    Push,
}

fn parse_aggregate(buf: &[u8], pos: &mut usize, kind: Kind) -> Result<Option<Reply>> {
    let Some(len) = read_len(buf, pos)? else {
        return Ok(None);
    };
    let Some(len) = len else {
        // *-1, the protocol's legacy nil array
        return Ok(Some(Reply::Null));
    };
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        match parse_reply(buf, pos)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(match kind {
        Kind::Array => Reply::Array(items),
        Kind::Set => Reply::Set(items),
        Kind::Push => Reply::Push(items),
    }))
}

fn parse_map(buf: &[u8], pos: &mut usize) -> Result<Option<Vec<(Reply, Reply)>>> {
    let len = match read_len(buf, pos)? {
        None => return Ok(None),
        Some(None) => return Err(Error::protocol("nil map frame")),
        Some(Some(len)) => len,
    };
    let mut pairs = Vec::with_capacity(len);
    for _ in 0..len {
        let Some(key) = parse_reply(buf, pos)? else {
            return Ok(None);
        };
        let Some(value) = parse_reply(buf, pos)? else {
            return Ok(None);
        };
        pairs.push((key, value));
    }
    Ok(Some(pairs))
}

fn parse_attribute(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>> {
    let Some(attrs) = parse_map(buf, pos)? else {
        return Ok(None);
    };
    match parse_reply(buf, pos)? {
        Some(inner) => Ok(Some(Reply::Attribute {
            attrs,
            inner: Box::new(inner),
        })),
        None => Ok(None),
    }
}

fn parse_blob(buf: &[u8], pos: &mut usize, is_error: bool) -> Result<Option<Reply>> {
    let Some(len) = read_len(buf, pos)? else {
        return Ok(None);
    };
    let Some(len) = len else {
        // $-1, the protocol's legacy nil bulk string
        return Ok(Some(Reply::Null));
    };
    let Some(data) = read_exact(buf, pos, len) else {
        return Ok(None);
    };
    if is_error {
        Ok(Some(Reply::Error(
            String::from_utf8_lossy(data).into_owned(),
        )))
    } else {
        Ok(Some(Reply::BulkString(Bytes::copy_from_slice(data))))
    }
}

fn parse_verbatim(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>> {
    let len = match read_len(buf, pos)? {
        None => return Ok(None),
        Some(None) => return Err(Error::protocol("nil verbatim frame")),
        Some(Some(len)) => len,
    };
    if len < 4 {
        return Err(Error::protocol("verbatim frame shorter than its format tag"));
    }
    let Some(data) = read_exact(buf, pos, len) else {
        return Ok(None);
    };
    if data[3] != b':' {
        return Err(Error::protocol("verbatim frame missing format separator"));
    }
    Ok(Some(Reply::Verbatim {
        format: [data[0], data[1], data[2]],
        text: Bytes::copy_from_slice(&data[4..]),
    }))
}

/// Reads one CRLF-terminated line, advancing past the terminator.
fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let rest = buf.get(start..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    *pos = start + idx + 2;
    Some(&rest[..idx])
}

/// Reads a length header line. `Ok(Some(None))` is the legacy `-1` nil marker.
fn read_len(buf: &[u8], pos: &mut usize) -> Result<Option<Option<usize>>> {
    let Some(line) = read_line(buf, pos) else {
        return Ok(None);
    };
    let n = parse_int(line)?;
    if n == -1 {
        return Ok(Some(None));
    }
    if n < 0 {
        return Err(Error::protocol(format!("negative length header: {n}")));
    }
    Ok(Some(Some(n as usize)))
}

fn read_exact<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let start = *pos;
    let data = buf.get(start..start + len)?;
    buf.get(start + len..start + len + 2)?;
    *pos = start + len + 2;
    Some(data)
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::protocol(format!(
                "malformed integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
