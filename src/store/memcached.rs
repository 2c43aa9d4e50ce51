//! Memcached store backend.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use memcache::{Client, CommandError, MemcacheError};
use tracing::{debug, warn};

use super::{CacheStore, Expiry, NodeStats, StoreError, StoreResult};

/// Longest relative expiration memcached accepts; larger values are
/// read as absolute Unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Store backed by one or more memcached servers.
///
/// Every configured server is probed on its own at connect time. Keys are
/// distributed over the servers that answered; the rest are reported as
/// down by [`CacheStore::stats`].
pub struct MemcacheStore {
    client: Client,
    nodes: Vec<Node>,
}

/// One configured server and, when it answered at connect time, a client
/// bound to it alone.
struct Node {
    url: String,
    client: Option<Client>,
}

impl MemcacheStore {
    /// Connect to the given servers.
    ///
    /// Each server is `host:port` or a full `memcache://` URL. `options`
    /// are passed to the client untouched as URL query parameters
    /// (`timeout`, `tcp_nodelay`, `connect_timeout`, ...). Fails only when
    /// no server answers a stats request.
    pub fn connect<S: AsRef<str>>(
        servers: &[S],
        options: &BTreeMap<String, String>,
    ) -> StoreResult<Self> {
        if servers.is_empty() {
            return Err(StoreError::Backend("no memcache servers configured".into()));
        }

        // The text protocol reports a losing add as success, which would
        // hide identifier collisions.
        if options.get("protocol").map(String::as_str) == Some("ascii") {
            return Err(StoreError::Backend(
                "the ascii protocol cannot report add conflicts; use binary".into(),
            ));
        }

        let mut last_error = None;
        let nodes: Vec<Node> = servers
            .iter()
            .map(|s| {
                let url = server_url(s.as_ref(), options);
                let client = match connect_node(&url) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!(server = %url, error = %e, "Memcache server did not answer");
                        last_error = Some(e);
                        None
                    }
                };
                Node { url, client }
            })
            .collect();

        let live: Vec<String> = nodes
            .iter()
            .filter(|node| node.client.is_some())
            .map(|node| node.url.clone())
            .collect();

        if live.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| StoreError::Network("no memcache server answered".into())));
        }

        debug!(servers = ?live, "Connecting to memcache");
        let client = Client::connect(live).map_err(map_error)?;

        Ok(Self { client, nodes })
    }

    /// Server URLs this store was configured with.
    pub fn servers(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.url.as_str()).collect()
    }

    /// Server URLs keys are distributed over.
    pub fn live_servers(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.client.is_some())
            .map(|node| node.url.as_str())
            .collect()
    }
}

impl std::fmt::Debug for MemcacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheStore")
            .field("servers", &self.servers())
            .field("live", &self.live_servers())
            .finish_non_exhaustive()
    }
}

impl CacheStore for MemcacheStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.client.get::<Vec<u8>>(key).map_err(map_error)
    }

    fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<bool> {
        add_outcome(self.client.add(key, value, expiration(expiry, unix_now())))
    }

    fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<()> {
        self.client
            .set(key, value, expiration(expiry, unix_now()))
            .map_err(map_error)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.client.delete(key).map_err(map_error)
    }

    fn stats(&self) -> StoreResult<NodeStats> {
        Ok(self
            .nodes
            .iter()
            .map(|node| {
                let values = node.client.as_ref().and_then(node_stats);
                (node.url.clone(), values)
            })
            .collect())
    }
}

/// Open a client to a single server and check that it answers.
fn connect_node(url: &str) -> StoreResult<Client> {
    let client = Client::connect(url).map_err(map_error)?;
    client.stats().map_err(map_error)?;
    Ok(client)
}

/// Stats of a single-server client, `None` if it does not answer.
fn node_stats(client: &Client) -> Option<HashMap<String, String>> {
    match client.stats() {
        Ok(stats) => stats
            .into_iter()
            .next()
            .map(|(_, values)| values)
            .filter(|values| !values.is_empty()),
        Err(e) => {
            debug!(error = %e, "Stats request failed");
            None
        }
    }
}

/// A losing add is an answer, not a failure.
fn add_outcome(result: Result<(), MemcacheError>) -> StoreResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(false),
        Err(e) => Err(map_error(e)),
    }
}

/// Build a client URL for `server`, appending `options` as query parameters.
fn server_url(server: &str, options: &BTreeMap<String, String>) -> String {
    let mut url = if server.contains("://") {
        server.to_string()
    } else {
        format!("memcache://{}", server)
    };

    for (key, value) in options {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(key);
        url.push('=');
        url.push_str(value);
    }

    url
}

/// Convert an expiry into memcached's expiration field.
fn expiration(expiry: Expiry, now_unix: u64) -> u32 {
    let secs = expiry.as_secs();
    let value = if secs > MAX_RELATIVE_EXPIRATION {
        now_unix.saturating_add(secs)
    } else {
        secs
    };
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn map_error(err: MemcacheError) -> StoreError {
    match err {
        MemcacheError::IOError(e) => StoreError::Network(e.to_string()),
        MemcacheError::PoolError(e) => StoreError::Network(e.to_string()),
        MemcacheError::ServerError(e) => StoreError::Protocol(e.to_string()),
        MemcacheError::CommandError(e) => StoreError::Protocol(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memcache::{ClientError, ServerError};
    use std::io::{self, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    const STAT: u8 = 0x10;
    const VERSION: u8 = 0x0b;
    const ADD: u8 = 0x02;
    const KEY_EXISTS: u16 = 0x02;

    /// Binary-protocol response packet with no extras.
    fn packet(opcode: u8, status: u16, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = vec![0x81, opcode];
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(&((key.len() + value.len()) as u32).to_be_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    fn serve(mut conn: TcpStream) -> io::Result<()> {
        let mut header = [0u8; 24];
        loop {
            conn.read_exact(&mut header)?;
            let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
            io::copy(&mut (&mut conn).take(u64::from(body_len)), &mut io::sink())?;

            let reply = match header[1] {
                STAT => {
                    let mut reply = packet(STAT, 0, b"pid", b"4242");
                    reply.extend(packet(STAT, 0, b"version", b"1.6.21"));
                    reply.extend(packet(STAT, 0, b"", b""));
                    reply
                }
                VERSION => packet(VERSION, 0, b"", b"1.6.21"),
                // Every key is taken.
                ADD => packet(ADD, KEY_EXISTS, b"", b""),
                opcode => packet(opcode, 0, b"", b""),
            };
            conn.write_all(&reply)?;
        }
    }

    /// Minimal memcached speaking just enough binary protocol for stats,
    /// version checks and a losing add.
    fn fake_memcached() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            for conn in listener.incoming().flatten() {
                thread::spawn(move || serve(conn));
            }
        });
        addr
    }

    /// Address nothing listens on.
    fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn quick_timeout() -> BTreeMap<String, String> {
        opts(&[("connect_timeout", "0.3")])
    }

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_server_url_plain_address() {
        let url = server_url("127.0.0.1:11211", &BTreeMap::new());
        assert_eq!(url, "memcache://127.0.0.1:11211");
    }

    #[test]
    fn test_server_url_keeps_scheme() {
        let url = server_url("memcache+udp://cache:11211", &BTreeMap::new());
        assert_eq!(url, "memcache+udp://cache:11211");
    }

    #[test]
    fn test_server_url_forwards_options() {
        let url = server_url(
            "cache:11211",
            &opts(&[("timeout", "2.5"), ("tcp_nodelay", "true")]),
        );
        assert_eq!(url, "memcache://cache:11211?tcp_nodelay=true&timeout=2.5");
    }

    #[test]
    fn test_server_url_extends_existing_query() {
        let url = server_url("memcache://cache:11211?timeout=1", &opts(&[("verbose", "1")]));
        assert_eq!(url, "memcache://cache:11211?timeout=1&verbose=1");
    }

    #[test]
    fn test_expiration_relative() {
        assert_eq!(expiration(Expiry::Never, 1_700_000_000), 0);
        assert_eq!(
            expiration(Expiry::After(Duration::from_secs(61)), 1_700_000_000),
            61
        );
        assert_eq!(
            expiration(
                Expiry::After(Duration::from_secs(MAX_RELATIVE_EXPIRATION)),
                1_700_000_000
            ),
            MAX_RELATIVE_EXPIRATION as u32
        );
    }

    #[test]
    fn test_expiration_absolute_past_thirty_days() {
        let secs = MAX_RELATIVE_EXPIRATION + 1;
        assert_eq!(
            expiration(Expiry::After(Duration::from_secs(secs)), 1_700_000_000),
            (1_700_000_000 + secs) as u32
        );
    }

    #[test]
    fn test_expiration_saturates() {
        assert_eq!(
            expiration(Expiry::After(Duration::from_secs(u64::MAX)), 1_700_000_000),
            u32::MAX
        );
    }

    #[test]
    fn test_connect_rejects_empty_server_list() {
        let servers: [&str; 0] = [];
        let err = MemcacheStore::connect(&servers, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn test_connect_rejects_ascii_protocol() {
        let err = MemcacheStore::connect(&["127.0.0.1:11211"], &opts(&[("protocol", "ascii")]))
            .unwrap_err();
        assert!(err.to_string().contains("ascii"));
    }

    #[test]
    fn test_add_outcome_maps_conflict_to_false() {
        assert_eq!(add_outcome(Ok(())), Ok(true));
        assert_eq!(
            add_outcome(Err(MemcacheError::CommandError(CommandError::KeyExists))),
            Ok(false)
        );
    }

    #[test]
    fn test_add_outcome_propagates_failures() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(
            add_outcome(Err(MemcacheError::IOError(io_err))),
            Err(StoreError::Network(_))
        ));
        assert!(matches!(
            add_outcome(Err(MemcacheError::CommandError(CommandError::ValueTooLarge))),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_map_error_kinds() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(
            map_error(MemcacheError::IOError(io_err)),
            StoreError::Network(msg) if msg.contains("timed out")
        ));
        assert!(matches!(
            map_error(MemcacheError::ServerError(ServerError::BadMagic(0x42))),
            StoreError::Protocol(_)
        ));
        assert!(matches!(
            map_error(MemcacheError::CommandError(CommandError::KeyNotFound)),
            StoreError::Protocol(_)
        ));
        assert!(matches!(
            map_error(MemcacheError::ClientError(ClientError::KeyTooLong)),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn test_connect_fails_when_no_server_answers() {
        let err = MemcacheStore::connect(&[closed_port()], &quick_timeout()).unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }

    #[test]
    fn test_connect_skips_dead_server() {
        let live = fake_memcached();
        let dead = closed_port();

        let store =
            MemcacheStore::connect(&[live.clone(), dead.clone()], &quick_timeout()).unwrap();
        assert_eq!(store.servers().len(), 2);
        assert_eq!(store.live_servers().len(), 1);
        assert!(store.live_servers()[0].contains(&live));

        let stats = store.stats().unwrap();
        assert_eq!(stats.len(), 2);
        let up = stats[0].1.as_ref().unwrap();
        assert_eq!(up.get("pid").map(String::as_str), Some("4242"));
        assert!(stats[1].0.contains(&dead));
        assert!(stats[1].1.is_none());
    }

    #[test]
    fn test_losing_add_reported_as_false() {
        let store = MemcacheStore::connect(&[fake_memcached()], &quick_timeout()).unwrap();
        assert_eq!(store.add("rack:session:taken", b"{}", Expiry::Never), Ok(false));
    }
}
