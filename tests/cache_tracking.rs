mod support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replex::{Client, ClientOptions, Command};
use support::{
    bulk, error, handshake, int, nil, push_invalidate, push_invalidate_all, simple, MockNode,
    Response,
};

/// A key-value server that tracks invalidations the way a real one does:
/// writes are acknowledged together with an `invalidate` push for the key.
fn tracking_kv_handler(get_count: Arc<AtomicUsize>) -> support::Handler {
    let store: Arc<Mutex<HashMap<String, String>>> = Arc::default();
    Arc::new(move |args| {
        if let Some(reply) = handshake(args) {
            return reply;
        }
        let mut store = store.lock().unwrap();
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("SET") => {
                store.insert(args[1].clone(), args[2].clone());
                let mut out = push_invalidate(&args[1]);
                out.extend_from_slice(&simple("OK"));
                Response::Bytes(out)
            }
            Some("GET") => {
                get_count.fetch_add(1, Ordering::SeqCst);
                match store.get(&args[1]) {
                    Some(value) => Response::Bytes(bulk(value)),
                    None => Response::Bytes(nil()),
                }
            }
            Some("DEL") => {
                let removed = store.remove(&args[1]).is_some();
                let mut out = push_invalidate(&args[1]);
                out.extend_from_slice(&int(removed as i64));
                Response::Bytes(out)
            }
            Some("FLUSHALL") => {
                store.clear();
                let mut out = push_invalidate_all();
                out.extend_from_slice(&simple("OK"));
                Response::Bytes(out)
            }
            Some("PTTL") => Response::Bytes(int(-1)),
            _ => Response::Bytes(error("ERR unknown command")),
        }
    })
}

fn cached_get(key: &str) -> Command {
    Command::new("GET").key(key.to_string()).cacheable()
}

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_cache_hit_accounting() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let get_count = Arc::new(AtomicUsize::new(0));
    node.start(tracking_kv_handler(get_count.clone()));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    for i in 0..100 {
        client
            .do_command(Command::new("SET").key(format!("key{i}")).arg("v"))
            .await
            .unwrap();
    }
    let before = get_count.load(Ordering::SeqCst);

    let mut hits = 0;
    let mut misses = 0;
    for round in 0..10 {
        for i in 0..100 {
            let result = client
                .do_cache(cached_get(&format!("key{i}")), TTL)
                .await
                .unwrap();
            assert_eq!(result.reply.as_str(), Some("v"), "round {round} key {i}");
            if result.hit {
                hits += 1;
            } else {
                misses += 1;
            }
        }
    }
    assert_eq!(misses, 100);
    assert_eq!(hits, 900);
    assert_eq!(get_count.load(Ordering::SeqCst) - before, 100);
}

#[tokio::test]
async fn test_invalidation_push_evicts_entry() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    node.start(tracking_kv_handler(Arc::default()));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    client
        .do_command(Command::new("SET").key("k").arg("v1"))
        .await
        .unwrap();

    let first = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!first.hit);
    assert_eq!(first.reply.as_str(), Some("v1"));

    let second = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(second.hit);
    assert_eq!(second.reply.as_str(), Some("v1"));

    // The write's invalidation push precedes its acknowledgement, so by the
    // time this call returns the entry is gone.
    client
        .do_command(Command::new("SET").key("k").arg("v2"))
        .await
        .unwrap();

    let third = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!third.hit);
    assert_eq!(third.reply.as_str(), Some("v2"));
}

#[tokio::test]
async fn test_del_then_cached_get_is_nil_miss() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    node.start(tracking_kv_handler(Arc::default()));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    client
        .do_command(Command::new("SET").key("k").arg("v"))
        .await
        .unwrap();
    let warm = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!warm.hit);

    client
        .do_command(Command::new("DEL").key("k"))
        .await
        .unwrap();

    let after = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!after.hit);
    assert!(after.reply.is_nil());
}

#[tokio::test]
async fn test_flushall_clears_the_cache() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let get_count = Arc::new(AtomicUsize::new(0));
    node.start(tracking_kv_handler(get_count.clone()));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    client
        .do_command(Command::new("SET").key("k").arg("v"))
        .await
        .unwrap();
    client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(client.do_cache(cached_get("k"), TTL).await.unwrap().hit);

    client.do_command(Command::new("FLUSHALL")).await.unwrap();

    let after = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!after.hit);
    assert!(after.reply.is_nil());
}

#[tokio::test]
async fn test_server_ttl_bounds_entry_lifetime() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let get_count = Arc::new(AtomicUsize::new(0));
    let seen = get_count.clone();
    node.start(Arc::new(move |args| {
        if let Some(reply) = handshake(args) {
            return reply;
        }
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            // The key is about to expire server-side.
            Some("PTTL") => Response::Bytes(int(40)),
            Some("GET") => {
                seen.fetch_add(1, Ordering::SeqCst);
                Response::Bytes(bulk("v"))
            }
            _ => Response::Bytes(simple("OK")),
        }
    }));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    assert!(!client.do_cache(cached_get("k"), TTL).await.unwrap().hit);
    assert!(client.do_cache(cached_get("k"), TTL).await.unwrap().hit);
    // Past the server-reported lifetime the entry must not serve, even
    // though the caller allowed sixty seconds.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!client.do_cache(cached_get("k"), TTL).await.unwrap().hit);
    assert_eq!(get_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resp2_server_disables_caching_but_commands_work() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let get_count = Arc::new(AtomicUsize::new(0));
    let seen = get_count.clone();
    node.start(Arc::new(move |args| {
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("HELLO") => Response::Bytes(error("ERR unknown command 'HELLO'")),
            Some("CLUSTER") => Response::Bytes(error(
                "ERR This instance has cluster support disabled",
            )),
            Some("GET") => {
                seen.fetch_add(1, Ordering::SeqCst);
                Response::Bytes(bulk("v"))
            }
            _ => Response::Bytes(simple("OK")),
        }
    }));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    let first = client.do_cache(cached_get("k"), TTL).await.unwrap();
    let second = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!first.hit);
    assert!(!second.hit);
    assert_eq!(first.reply.as_str(), Some("v"));
    // Every call reached the server: nothing was cached without tracking.
    assert_eq!(get_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disable_cache_never_negotiates_tracking() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = log.clone();
    node.start(Arc::new(move |args| {
        seen.lock().unwrap().push(args.join(" ").to_ascii_uppercase());
        if let Some(reply) = handshake(args) {
            return reply;
        }
        Response::Bytes(bulk("v"))
    }));
    let client = Client::connect(ClientOptions::new([addr]).disable_cache(true))
        .await
        .unwrap();

    let result = client.do_cache(cached_get("k"), TTL).await.unwrap();
    assert!(!result.hit);

    let log = log.lock().unwrap();
    assert!(!log.iter().any(|line| line.contains("CLIENT TRACKING")));
    assert!(!log.iter().any(|line| line.contains("CLIENT CACHING")));
}

#[tokio::test]
async fn test_concurrent_cached_reads_share_one_fetch() {
    let node = MockNode::bind().await;
    let addr = node.addr_string();
    let get_count = Arc::new(AtomicUsize::new(0));
    let seen = get_count.clone();
    node.start(Arc::new(move |args| {
        if let Some(reply) = handshake(args) {
            return reply;
        }
        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("PTTL") => Response::Bytes(int(-1)),
            Some("GET") => {
                seen.fetch_add(1, Ordering::SeqCst);
                // Slow enough that every concurrent caller joins the flight.
                Response::Delayed(Duration::from_millis(40), bulk("v"))
            }
            _ => Response::Bytes(simple("OK")),
        }
    }));
    let client = Client::connect(ClientOptions::new([addr])).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.do_cache(cached_get("k"), TTL).await.unwrap()
        }));
    }
    let mut hits = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.reply.as_str(), Some("v"));
        if result.hit {
            hits += 1;
        }
    }
    assert_eq!(get_count.load(Ordering::SeqCst), 1);
    assert_eq!(hits, 31);
}
