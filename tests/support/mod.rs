//! In-process mock servers speaking just enough RESP for the tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use replex::proto::{Decoder, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What the mock sends back for one received command.
pub enum Response {
    Bytes(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Ignore,
}

pub type Handler = Arc<dyn Fn(&[String]) -> Response + Send + Sync>;

pub struct MockNode {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl MockNode {
    /// Binds an ephemeral port without accepting yet, so tests can learn
    /// every node's address before wiring handlers together.
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub fn addr_string(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Starts serving; every connection runs `handler` per decoded command.
    pub fn start(self, handler: Handler) {
        tokio::spawn(async move {
            loop {
                let (socket, _) = match self.listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let handler = handler.clone();
                tokio::spawn(serve(socket, handler));
            }
        });
    }
}

async fn serve(mut socket: TcpStream, handler: Handler) {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.append(&buf[..n]);
        loop {
            match decoder.next() {
                Ok(Some(frame)) => {
                    let args = frame_args(&frame);
                    match handler(&args) {
                        Response::Bytes(bytes) => {
                            if socket.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Response::Delayed(delay, bytes) => {
                            tokio::time::sleep(delay).await;
                            if socket.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Response::Ignore => {}
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

pub fn frame_args(frame: &Reply) -> Vec<String> {
    frame
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Answers the connect-time commands every session sends. `HELLO` gets an
/// empty map, which reads as a successful RESP3 negotiation.
pub fn handshake(args: &[String]) -> Option<Response> {
    match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("HELLO") => Some(Response::Bytes(b"%0\r\n".to_vec())),
        Some("CLIENT") => Some(Response::Bytes(simple("OK"))),
        Some("PING") => Some(Response::Bytes(simple("PONG"))),
        Some("CLUSTER") => Some(Response::Bytes(error(
            "ERR This instance has cluster support disabled",
        ))),
        _ => None,
    }
}

pub fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{s}\r\n", s.len()).into_bytes()
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn push_invalidate(key: &str) -> Vec<u8> {
    let mut out = b">2\r\n$10\r\ninvalidate\r\n*1\r\n".to_vec();
    out.extend_from_slice(&bulk(key));
    out
}

pub fn push_invalidate_all() -> Vec<u8> {
    b">2\r\n$10\r\ninvalidate\r\n_\r\n".to_vec()
}

/// A subscribe/unsubscribe confirmation push; `count` is the number of
/// subscriptions remaining on the connection.
pub fn push_confirmation(kind: &str, channel: &str, count: i64) -> Vec<u8> {
    let mut out = format!(">3\r\n${}\r\n{kind}\r\n", kind.len()).into_bytes();
    out.extend_from_slice(&bulk(channel));
    out.extend_from_slice(&int(count));
    out
}

pub fn push_message(channel: &str, payload: &str) -> Vec<u8> {
    let mut out = b">3\r\n$7\r\nmessage\r\n".to_vec();
    out.extend_from_slice(&bulk(channel));
    out.extend_from_slice(&bulk(payload));
    out
}

/// Builds a `CLUSTER SLOTS` reply mapping each `(start, end)` range to a
/// primary address.
pub fn cluster_slots_reply(ranges: &[(u16, u16, SocketAddr)]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", ranges.len()).into_bytes();
    for (start, end, addr) in ranges {
        out.extend_from_slice(format!("*3\r\n:{start}\r\n:{end}\r\n").as_bytes());
        let host = "127.0.0.1";
        out.extend_from_slice(
            format!("*2\r\n${}\r\n{host}\r\n:{}\r\n", host.len(), addr.port()).as_bytes(),
        );
    }
    out
}
