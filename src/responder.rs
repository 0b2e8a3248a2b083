//! The socketmap responder (spec.md §4.4): accepts connections, answers
//! Postfix socketmap lookups, serves from cache or falls through to the
//! resolver.
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/responder.py`'s
//! `STSSocketmapResponder` — the `start`/`stop`/`sender`/`handler` split
//! carries over almost unchanged, just expressed with tokio tasks and a
//! bounded `mpsc` channel in place of `asyncio.Queue`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::{Cache, CacheEntry};
use crate::config::Config;
use crate::daemon::{self, Listener};
use crate::error::ExitError;
use crate::netstring::{self, Decoder};
use crate::resolver::{FetchStatus, PolicyBody, PolicyMode};
use crate::util::now_unix;
use crate::zone::{ZoneEntry, Zones};

/// Read buffer size per `reader.read()` call.
const READ_CHUNK: usize = 4096;

/// Upper bound on a single request's netstring payload. Socketmap keys are
/// `"<zone> <domain>"`; no legitimate request approaches this.
const MAX_REQUEST_LEN: usize = 4096;

/// Per-connection response queue depth (spec.md §5: "bounded, small,
/// O(100)"). The reader blocks once it's full, providing backpressure.
const QUEUE_LIMIT: usize = 100;

/// Accepts connections and answers socketmap requests until [`stop`] is
/// called.
///
/// [`stop`]: Responder::stop
pub struct Responder {
    zones: Arc<Zones>,
    cache: Arc<dyn Cache>,
    cache_grace: i64,
    shutdown_timeout: Duration,
    running: Mutex<Option<Running>>,
}

struct Running {
    accept_task: JoinHandle<()>,
    children: Arc<Mutex<JoinSet<()>>>,
}

impl Responder {
    pub fn new(zones: Zones, cache: Arc<dyn Cache>, cache_grace: u64, shutdown_timeout: u64) -> Self {
        Self {
            zones: Arc::new(zones),
            cache,
            cache_grace: cache_grace as i64,
            shutdown_timeout: Duration::from_secs(shutdown_timeout),
            running: Mutex::new(None),
        }
    }

    /// Bind the listening surface named by `config` and start accepting.
    pub async fn start(&self, config: &Config) -> Result<(), ExitError> {
        let listener = daemon::bind(config)?;
        let children: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));

        let zones = Arc::clone(&self.zones);
        let cache = Arc::clone(&self.cache);
        let cache_grace = self.cache_grace;
        let accept_children = Arc::clone(&children);

        let accept_task = tokio::spawn(async move {
            accept_loop(listener, zones, cache, cache_grace, accept_children).await;
        });

        *self.running.lock().await = Some(Running {
            accept_task,
            children,
        });
        Ok(())
    }

    /// Close the listener, then drain outstanding connection handlers
    /// within `shutdown_timeout`; anything left over is cancelled (spec.md
    /// §4.4 "Graceful stop").
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        // Dropping the accept task drops the `Listener` it owns, closing
        // the socket and refusing any further connections.
        running.accept_task.abort();
        let _ = running.accept_task.await;

        let mut children = running.children.lock().await;
        if children.is_empty() {
            return;
        }

        tracing::warn!(count = children.len(), "awaiting client handlers to finish");
        let drain = async {
            while children.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            tracing::warn!("shutdown timeout expired, terminating remaining handlers");
            children.abort_all();
            while children.join_next().await.is_some() {}
        }
    }
}

async fn accept_loop(
    listener: Listener,
    zones: Arc<Zones>,
    cache: Arc<dyn Cache>,
    cache_grace: i64,
    children: Arc<Mutex<JoinSet<()>>>,
) {
    loop {
        match &listener {
            Listener::Tcp(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    spawn_handler(stream, &zones, &cache, cache_grace, &children).await
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
            Listener::Unix(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    spawn_handler(stream, &zones, &cache, cache_grace, &children).await
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
        }
    }
}

async fn spawn_handler<T>(
    stream: T,
    zones: &Arc<Zones>,
    cache: &Arc<dyn Cache>,
    cache_grace: i64,
    children: &Arc<Mutex<JoinSet<()>>>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let zones = Arc::clone(zones);
    let cache = Arc::clone(cache);
    children.lock().await.spawn(async move {
        handle_connection(stream, zones, cache, cache_grace).await;
    });
}

/// One connection's reader/sender split (spec.md §4.4): the reader feeds
/// the netstring decoder and fires off a `process_request` task per
/// completed payload; the sender dequeues those tasks' handles in FIFO
/// order and writes each result as it resolves. Awaiting handles in
/// submission order — rather than completion order — is what keeps
/// response ordering equal to request ordering even though the
/// `process_request` tasks themselves run concurrently.
async fn handle_connection<T>(stream: T, zones: Arc<Zones>, cache: Arc<dyn Cache>, cache_grace: i64)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel::<JoinHandle<Vec<u8>>>(QUEUE_LIMIT);

    let sender = tokio::spawn(sender_loop(rx, writer));

    let mut decoder = Decoder::new(Some(MAX_REQUEST_LEN));
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let payloads = match decoder.feed(&buf[..n]) {
            Ok(payloads) => payloads,
            Err(err) => {
                tracing::warn!(error = %err, "bad netstring message received");
                break;
            }
        };

        for payload in payloads {
            let zones = Arc::clone(&zones);
            let cache = Arc::clone(&cache);
            let handle =
                tokio::spawn(async move { process_request(&zones, &cache, cache_grace, &payload).await });
            if tx.send(handle).await.is_err() {
                break;
            }
        }
    }

    drop(tx);
    let _ = sender.await;
}

async fn sender_loop<W>(mut rx: mpsc::Receiver<JoinHandle<Vec<u8>>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(handle) = rx.recv().await {
        let data = match handle.await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(error = %err, "request task did not complete cleanly");
                break;
            }
        };
        if writer.write_all(&data).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// `"<zone> <domain>"` in, a single netstring-encoded response out
/// (spec.md §4.4 "Request processing").
async fn process_request(zones: &Zones, cache: &Arc<dyn Cache>, cache_grace: i64, raw: &[u8]) -> Vec<u8> {
    let raw_str = String::from_utf8_lossy(raw);
    let (zone_name, domain_part) = raw_str.split_once(' ').unwrap_or(("", &raw_str));

    let domain = normalize_domain(domain_part);
    if domain.is_empty() || domain.starts_with('.') || domain.parse::<std::net::IpAddr>().is_ok() {
        return netstring::encode(b"NOTFOUND ");
    }

    let zone = zones.select(zone_name);
    let now = now_unix();

    let cached = match cache.get(&domain).await {
        Ok(entry) => entry,
        Err(err) => {
            tracing::warn!(domain = %domain, error = %err, "cache read failed");
            None
        }
    };

    let served = if !is_stale(cached.as_ref(), now, cache_grace) {
        cached
    } else {
        let last_known_id = cached.as_ref().map(|entry| entry.pol_id.as_str());
        let (status, policy) = zone.resolver.resolve(&domain, last_known_id).await;
        match status {
            FetchStatus::Valid => {
                let (id, body) = policy.expect("VALID always carries a policy");
                let entry = CacheEntry {
                    ts: now,
                    pol_id: id,
                    pol_body: body,
                };
                cache.safe_set(&domain, entry.clone()).await;
                Some(entry)
            }
            FetchStatus::NotChanged => {
                let prev = cached.expect("NOT_CHANGED is only returned when a cached entry exists");
                let entry = CacheEntry { ts: now, ..prev };
                cache.safe_set(&domain, entry.clone()).await;
                Some(entry)
            }
            FetchStatus::FetchError | FetchStatus::None => match &cached {
                Some(entry) if entry.pol_body.max_age + entry.ts >= now => Some(entry.clone()),
                _ => None,
            },
        }
    };

    match served {
        None => netstring::encode(b"NOTFOUND "),
        Some(entry) => format_response(&entry.pol_body, zone),
    }
}

/// `cached is None` OR past `cache_grace` OR past the policy's own
/// `max_age` (spec.md §4.4).
fn is_stale(cached: Option<&CacheEntry>, now: i64, cache_grace: i64) -> bool {
    match cached {
        None => true,
        Some(entry) => now - entry.ts > cache_grace || entry.pol_body.max_age + entry.ts < now,
    }
}

/// Strip brackets/port from a socketmap request's domain field, mirroring
/// `postfix_mta_sts_resolver.utils.filter_domain`: `"[2001:db8::1]:25"` and
/// `"example.com:25"` both drop the trailing port, `"[192.0.2.1]"` drops
/// the brackets, a bare domain passes through untouched.
fn normalize_domain(raw: &str) -> String {
    let res = if let Some(bracket_idx) = raw.find(']') {
        raw[..bracket_idx].trim_start_matches('[')
    } else if let Some(colon_idx) = raw.rfind(':') {
        &raw[..colon_idx]
    } else {
        raw
    };
    res.to_lowercase().trim().trim_end_matches('.').to_string()
}

/// `NOTFOUND ` for `none`/non-strict `testing`; otherwise the deduplicated,
/// `*`-stripped MX set, with ` servername=hostname` appended when the zone
/// requires SNI (spec.md §4.4 "Response formatting").
fn format_response(body: &PolicyBody, zone: &ZoneEntry) -> Vec<u8> {
    let serve_notfound = body.mode == PolicyMode::None || (body.mode == PolicyMode::Testing && !zone.strict_testing);
    if serve_notfound {
        return netstring::encode(b"NOTFOUND ");
    }

    let mxset: std::collections::BTreeSet<&str> =
        body.mx.iter().map(|mx| mx.trim_start_matches('*')).collect();
    let mxlist: Vec<&str> = mxset.into_iter().collect();

    let mut resp = format!("OK secure match={}", mxlist.join(":"));
    if zone.require_sni {
        resp.push_str(" servername=hostname");
    }
    netstring::encode(resp.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InternalCache;
    use crate::resolver::STSResolver;

    fn zone(strict_testing: bool, require_sni: bool) -> ZoneEntry {
        ZoneEntry {
            strict_testing,
            require_sni,
            resolver: STSResolver::new(4.0).unwrap(),
        }
    }

    fn policy(mode: PolicyMode, mx: &[&str]) -> PolicyBody {
        PolicyBody {
            mode,
            max_age: 86_400,
            mx: mx.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn normalize_strips_brackets_and_port() {
        assert_eq!(normalize_domain("[192.0.2.1]:25"), "192.0.2.1");
        assert_eq!(normalize_domain("[192.0.2.1]"), "192.0.2.1");
        assert_eq!(normalize_domain("Example.Com:25"), "example.com");
        assert_eq!(normalize_domain("Good.Loc."), "good.loc");
        assert_eq!(normalize_domain("good.loc"), "good.loc");
    }

    // S1 (also exercised with require_sni).
    #[test]
    fn format_response_enforce_ok() {
        let z = zone(false, false);
        let body = policy(PolicyMode::Enforce, &["mail.loc"]);
        assert_eq!(format_response(&body, &z), netstring::encode(b"OK secure match=mail.loc"));

        let z_sni = zone(false, true);
        assert_eq!(
            format_response(&body, &z_sni),
            netstring::encode(b"OK secure match=mail.loc servername=hostname")
        );
    }

    // S2 / S3.
    #[test]
    fn format_response_testing_mode_depends_on_zone_strictness() {
        let body = policy(PolicyMode::Testing, &["mail.loc"]);
        assert_eq!(format_response(&body, &zone(false, false)), netstring::encode(b"NOTFOUND "));
        assert_eq!(
            format_response(&body, &zone(true, false)),
            netstring::encode(b"OK secure match=mail.loc")
        );
    }

    #[test]
    fn format_response_none_mode_is_always_notfound() {
        let body = policy(PolicyMode::None, &[]);
        assert_eq!(format_response(&body, &zone(true, true)), netstring::encode(b"NOTFOUND "));
    }

    // S5.
    #[test]
    fn format_response_dedups_and_strips_wildcard_mx() {
        let body = policy(PolicyMode::Enforce, &["*.mail.loc", "*.mail.loc"]);
        assert_eq!(
            format_response(&body, &zone(false, false)),
            netstring::encode(b"OK secure match=.mail.loc")
        );
    }

    #[test]
    fn stale_when_absent_or_past_grace_or_past_max_age() {
        assert!(is_stale(None, 1000, 60));

        let fresh = CacheEntry {
            ts: 990,
            pol_id: "x".into(),
            pol_body: policy(PolicyMode::Enforce, &["mail.loc"]),
        };
        assert!(!is_stale(Some(&fresh), 1000, 60));

        let past_grace = CacheEntry { ts: 900, ..fresh.clone() };
        assert!(is_stale(Some(&past_grace), 1000, 60));

        let expired_max_age = CacheEntry {
            ts: 995,
            pol_id: "x".into(),
            pol_body: PolicyBody {
                max_age: 1,
                ..policy(PolicyMode::Enforce, &["mail.loc"])
            },
        };
        assert!(is_stale(Some(&expired_max_age), 1000, 60));
    }

    // S6 — short-circuits before any cache or resolver use, so this runs
    // with no network access.
    #[tokio::test]
    async fn ip_literal_short_circuits_to_notfound() {
        let zones = Zones::from_config(&Config::default()).unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InternalCache::new(16));
        let resp = process_request(&zones, &cache, 60, b"test [192.0.2.1]").await;
        assert_eq!(resp, netstring::encode(b"NOTFOUND "));
    }

    #[tokio::test]
    async fn empty_domain_short_circuits_to_notfound() {
        let zones = Zones::from_config(&Config::default()).unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InternalCache::new(16));
        let resp = process_request(&zones, &cache, 60, b"test ").await;
        assert_eq!(resp, netstring::encode(b"NOTFOUND "));
    }

    // Property 6: the sender awaits request-task handles in submission
    // order, so a later request that finishes sooner never overtakes an
    // earlier one still in flight.
    #[tokio::test]
    async fn response_ordering_follows_request_order_not_completion_order() {
        let (tx, rx) = mpsc::channel::<JoinHandle<Vec<u8>>>(QUEUE_LIMIT);

        let slow = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            netstring::encode(b"first")
        });
        let fast = tokio::spawn(async { netstring::encode(b"second") });

        tx.send(slow).await.unwrap();
        tx.send(fast).await.unwrap();
        drop(tx);

        let (client, server) = tokio::io::duplex(4096);
        let sender = tokio::spawn(sender_loop(rx, server));
        sender.await.unwrap();

        let mut out = Vec::new();
        let mut client = client;
        client.read_to_end(&mut out).await.unwrap();

        let mut expected = netstring::encode(b"first");
        expected.extend(netstring::encode(b"second"));
        assert_eq!(out, expected);
    }

    // Property 7: a fresh (non-stale) cache entry short-circuits straight
    // to the cached response without ever touching `zone.resolver` — the
    // `if !is_stale(...)` branch in `process_request` returns `cached`
    // directly. Only the resolver-driven branches (`Valid`/`NotChanged`)
    // ever call `cache.safe_set` to rewrite the entry, so if two in-grace
    // requests left the entry's `ts` untouched, the resolver was called
    // at most zero times across both — proving repeat requests within
    // `cache_grace` cannot trigger a second resolver call.
    #[tokio::test]
    async fn cache_grace_avoids_second_resolver_call() {
        let zones = Zones::from_config(&Config::default()).unwrap();
        let cache: Arc<dyn Cache> = Arc::new(InternalCache::new(16));

        let seeded = CacheEntry {
            ts: now_unix() - 5,
            pol_id: "fixed".into(),
            pol_body: policy(PolicyMode::Enforce, &["mail.loc"]),
        };
        cache.safe_set("good.loc", seeded.clone()).await;

        for _ in 0..2 {
            let resp = process_request(&zones, &cache, 60, b"test good.loc").await;
            assert_eq!(resp, netstring::encode(b"OK secure match=mail.loc"));
        }

        let after = cache.get("good.loc").await.unwrap().unwrap();
        assert_eq!(
            after.ts, seeded.ts,
            "a resolver call would have rewritten the timestamp on cache write"
        );
    }

    // S8: a netstring with a correct length but a wrong terminator byte
    // closes the connection without writing anything.
    #[tokio::test]
    async fn bad_netstring_closes_connection_without_reply() {
        let zones = Arc::new(Zones::from_config(&Config::default()).unwrap());
        let cache: Arc<dyn Cache> = Arc::new(InternalCache::new(16));

        let (mut client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(handle_connection(server, zones, cache, 60));

        client.write_all(b"13:test good.loc!").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());

        handler.await.unwrap();
    }
}
