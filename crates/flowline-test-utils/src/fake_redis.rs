//! A minimal in-process RESP2 server standing in for Redis in tests that
//! exercise `flowline-queue`/`flowline-core` without a container. Implements
//! exactly the command surface `flowline_queue::WorkQueue` issues: enough to
//! run real end-to-end scenarios (enqueue, dequeue, retry, reap) against a
//! real TCP connection using the real `redis` crate on the client side,
//! without requiring a Docker daemon.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Store {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
}

impl Store {
    fn get_string(&mut self, key: &str) -> Option<String> {
        match self.strings.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                self.strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

enum Reply {
    Simple(&'static str),
    Integer(i64),
    Bulk(Option<String>),
    Array(Vec<Reply>),
}

impl Reply {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
            Reply::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(s)) => {
                out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// A running fake Redis instance. Dropping it stops the listener task.
pub struct FakeRedis {
    url: String,
    handle: JoinHandle<()>,
}

impl FakeRedis {
    /// Connection URL, suitable for `flowline_queue::QueueConfig::new`.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a fake Redis server bound to an ephemeral localhost port.
pub async fn start_fake_redis() -> FakeRedis {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind fake redis listener");
    let port = listener
        .local_addr()
        .expect("failed to read fake redis bound address")
        .port();
    let url = format!("redis://127.0.0.1:{port}");

    let store = Arc::new(Mutex::new(Store::default()));
    let handle = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(socket, store).await {
                    tracing::debug!(error = %err, "fake redis connection closed");
                }
            });
        }
    });

    FakeRedis { url, handle }
}

async fn serve_connection(socket: TcpStream, store: Arc<Mutex<Store>>) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let args = match read_command(&mut reader).await? {
            Some(args) => args,
            None => return Ok(()),
        };
        if args.is_empty() {
            continue;
        }

        let reply = dispatch(&store, &args).await;
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        write_half.write_all(&buf).await?;
    }
}

async fn read_command(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<Vec<String>>> {
    let Some(header) = read_line(reader).await? else {
        return Ok(None);
    };
    let Some(count_str) = header.strip_prefix('*') else {
        return Ok(Some(vec![]));
    };
    let count: usize = count_str.trim().parse().unwrap_or(0);

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len_line = read_line(reader).await?.unwrap_or_default();
        let len: usize = len_line
            .strip_prefix('$')
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }

    Ok(Some(args))
}

async fn read_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(byte[0]);
    }
}

async fn dispatch(store: &Arc<Mutex<Store>>, args: &[String]) -> Reply {
    let cmd = args[0].to_ascii_uppercase();
    let rest = &args[1..];

    if cmd == "BRPOPLPUSH" {
        return brpoplpush(store, rest).await;
    }

    let mut store = store.lock().await;
    match cmd.as_str() {
        "PING" => Reply::Simple("PONG"),
        "CLIENT" | "SELECT" | "HELLO" => Reply::Simple("OK"),
        "LPUSH" => {
            let key = &rest[0];
            let list = store.lists.entry(key.clone()).or_default();
            for value in &rest[1..] {
                list.push_front(value.clone());
            }
            Reply::Integer(list.len() as i64)
        }
        "LREM" => {
            let key = &rest[0];
            let count: i64 = rest[1].parse().unwrap_or(0);
            let value = &rest[2];
            let removed = remove_from_list(&mut store, key, count, value);
            Reply::Integer(removed)
        }
        "LLEN" => {
            let key = &rest[0];
            Reply::Integer(store.lists.get(key).map(|l| l.len()).unwrap_or(0) as i64)
        }
        "LRANGE" => {
            let key = &rest[0];
            let items = store
                .lists
                .get(key)
                .map(|l| l.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            Reply::Array(items.into_iter().map(|v| Reply::Bulk(Some(v))).collect())
        }
        "HSET" => {
            let key = &rest[0];
            let field = &rest[1];
            let value = &rest[2];
            let is_new = store
                .hashes
                .entry(key.clone())
                .or_default()
                .insert(field.clone(), value.clone())
                .is_none();
            Reply::Integer(is_new as i64)
        }
        "HGET" => {
            let key = &rest[0];
            let field = &rest[1];
            Reply::Bulk(store.hashes.get(key).and_then(|h| h.get(field)).cloned())
        }
        "HDEL" => {
            let key = &rest[0];
            let mut removed = 0i64;
            if let Some(hash) = store.hashes.get_mut(key) {
                for field in &rest[1..] {
                    if hash.remove(field).is_some() {
                        removed += 1;
                    }
                }
            }
            Reply::Integer(removed)
        }
        "ZADD" => {
            let key = &rest[0];
            let score: f64 = rest[1].parse().unwrap_or(0.0);
            let member = &rest[2];
            let zset = store.zsets.entry(key.clone()).or_default();
            match zset.iter_mut().find(|(m, _)| m == member) {
                Some(entry) => {
                    entry.1 = score;
                    Reply::Integer(0)
                }
                None => {
                    zset.push((member.clone(), score));
                    Reply::Integer(1)
                }
            }
        }
        "ZRANGEBYSCORE" => {
            let key = &rest[0];
            let min = parse_score_bound(&rest[1], f64::NEG_INFINITY);
            let max = parse_score_bound(&rest[2], f64::INFINITY);
            let mut entries: Vec<(String, f64)> = store
                .zsets
                .get(key)
                .map(|z| z.iter().filter(|(_, s)| *s >= min && *s <= max).cloned().collect())
                .unwrap_or_default();
            entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            Reply::Array(
                entries
                    .into_iter()
                    .map(|(member, _)| Reply::Bulk(Some(member)))
                    .collect(),
            )
        }
        "ZREM" => {
            let key = &rest[0];
            let member = &rest[1];
            let removed = match store.zsets.get_mut(key) {
                Some(zset) => {
                    let before = zset.len();
                    zset.retain(|(m, _)| m != member);
                    (before - zset.len()) as i64
                }
                None => 0,
            };
            Reply::Integer(removed)
        }
        "ZCARD" => {
            let key = &rest[0];
            Reply::Integer(store.zsets.get(key).map(|z| z.len()).unwrap_or(0) as i64)
        }
        "SET" => {
            let key = &rest[0];
            let value = &rest[1];
            let expiry = rest
                .iter()
                .position(|a| a.eq_ignore_ascii_case("EX"))
                .and_then(|i| rest.get(i + 1))
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| Instant::now() + Duration::from_secs(secs));
            store.strings.insert(key.clone(), (value.clone(), expiry));
            Reply::Simple("OK")
        }
        "SETEX" => {
            let key = &rest[0];
            let secs: u64 = rest[1].parse().unwrap_or(0);
            let value = &rest[2];
            let expiry = Some(Instant::now() + Duration::from_secs(secs));
            store.strings.insert(key.clone(), (value.clone(), expiry));
            Reply::Simple("OK")
        }
        "GET" => {
            let key = &rest[0];
            Reply::Bulk(store.get_string(key))
        }
        "SADD" => {
            let key = &rest[0];
            let set = store.sets.entry(key.clone()).or_default();
            let mut added = 0i64;
            for member in &rest[1..] {
                if set.insert(member.clone()) {
                    added += 1;
                }
            }
            Reply::Integer(added)
        }
        "SMEMBERS" => {
            let key = &rest[0];
            let members = store.sets.get(key).cloned().unwrap_or_default();
            Reply::Array(members.into_iter().map(|m| Reply::Bulk(Some(m))).collect())
        }
        "SREM" => {
            let key = &rest[0];
            let mut removed = 0i64;
            if let Some(set) = store.sets.get_mut(key) {
                for member in &rest[1..] {
                    if set.remove(member) {
                        removed += 1;
                    }
                }
            }
            Reply::Integer(removed)
        }
        _ => Reply::Simple("OK"),
    }
}

fn parse_score_bound(raw: &str, default: f64) -> f64 {
    match raw {
        "-inf" => f64::NEG_INFINITY,
        "+inf" | "inf" => f64::INFINITY,
        other => other.parse().unwrap_or(default),
    }
}

fn remove_from_list(store: &mut Store, key: &str, count: i64, value: &str) -> i64 {
    let Some(list) = store.lists.get_mut(key) else {
        return 0;
    };

    let mut removed = 0i64;
    if count >= 0 {
        let limit = if count == 0 { usize::MAX } else { count as usize };
        let mut kept = VecDeque::with_capacity(list.len());
        for item in list.drain(..) {
            if (removed as usize) < limit && item == value {
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        *list = kept;
    } else {
        let limit = (-count) as usize;
        let mut kept: VecDeque<String> = VecDeque::with_capacity(list.len());
        for item in list.drain(..).rev() {
            if (removed as usize) < limit && item == value {
                removed += 1;
            } else {
                kept.push_front(item);
            }
        }
        *list = kept;
    }
    removed
}

/// `BRPOPLPUSH src dst timeout`: polls rather than using a wake-on-push
/// signal, which is simpler and fast enough for test-scale timeouts.
async fn brpoplpush(store: &Arc<Mutex<Store>>, args: &[String]) -> Reply {
    let src = &args[0];
    let dst = &args[1];
    let timeout_secs: f64 = args[2].parse().unwrap_or(0.0);
    let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs.max(0.05));

    loop {
        {
            let mut store = store.lock().await;
            let popped = store.lists.get_mut(src).and_then(|l| l.pop_back());
            if let Some(value) = popped {
                store.lists.entry(dst.clone()).or_default().push_front(value.clone());
                return Reply::Bulk(Some(value));
            }
        }

        if Instant::now() >= deadline {
            return Reply::Bulk(None);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
