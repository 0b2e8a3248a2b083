//! Periodic cache pre-warming (spec.md §4.5).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/proactive_fetcher.py`'s
//! `STSProactiveFetcher`: a scan-driven producer feeding a fixed pool of
//! worker tasks through a bounded channel, sleeping between sweeps until
//! `last_sweep_ts + interval`. The per-domain `grace_ratio` skip and the
//! `last_known_id` passed into `resolve` are spec supplements over the
//! original, which re-fetches every scanned domain unconditionally.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::cache::{Cache, CacheEntry};
use crate::config::ProactiveFetchConfig;
use crate::resolver::{FetchStatus, STSResolver};
use crate::util::now_unix;

/// Floor on the inter-sweep sleep, so a `proactive_fetch_ts` in the future
/// (clock skew, a restored backup) can't spin the loop.
const MIN_PROACTIVE_FETCH_INTERVAL: i64 = 1;

pub struct ProactiveFetcher {
    cache: Arc<dyn Cache>,
    resolver: Arc<STSResolver>,
    interval: i64,
    concurrency_limit: usize,
    grace_ratio: f64,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProactiveFetcher {
    pub fn new(cache: Arc<dyn Cache>, resolver: STSResolver, config: &ProactiveFetchConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            resolver: Arc::new(resolver),
            interval: config.interval as i64,
            concurrency_limit: config.concurrency_limit.max(1),
            grace_ratio: config.grace_ratio,
            task: Mutex::new(None),
        })
    }

    /// Spawn the periodic sweep loop. A no-op if already started.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run_periodically().await }));
    }

    /// Cancel the periodic task. Because the sweep's worker pool lives in
    /// a [`JoinSet`] owned by the same task, aborting it tears down any
    /// sweep in progress at its next suspension point (spec.md §4.5 "Stop
    /// is cooperative").
    pub async fn stop(&self) {
        let Some(handle) = self.task.lock().await.take() else {
            return;
        };
        handle.abort();
        let _ = handle.await;
    }

    async fn run_periodically(&self) {
        loop {
            let last_sweep_ts = self.cache.get_proactive_fetch_ts().await.unwrap_or(0);
            let next_fetch_ts = last_sweep_ts + self.interval;
            let sleep_secs = (next_fetch_ts - now_unix() + 1).max(MIN_PROACTIVE_FETCH_INTERVAL);
            tokio::time::sleep(Duration::from_secs(sleep_secs as u64)).await;
            self.sweep().await;
        }
    }

    /// One full cache pass: scan-driven producer, fixed worker pool,
    /// timestamp write at the end (spec.md §4.5, steps 1-4).
    async fn sweep(&self) {
        tracing::info!("proactive policy fetching started");

        let (tx, rx) = mpsc::channel::<(String, CacheEntry)>(self.concurrency_limit);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency_limit {
            let rx = Arc::clone(&rx);
            let cache = Arc::clone(&self.cache);
            let resolver = Arc::clone(&self.resolver);
            let interval = self.interval;
            let grace_ratio = self.grace_ratio;
            workers.spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    let Some((domain, cached)) = item else {
                        break;
                    };
                    refresh_domain(&resolver, &cache, &domain, cached, interval, grace_ratio).await;
                }
            });
        }

        let mut token = None;
        loop {
            let (next_token, batch) = match self.cache.scan(token, self.concurrency_limit).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(error = %err, "cache scan failed, aborting sweep");
                    break;
                }
            };
            tracing::debug!(count = batch.len(), "enqueued domains for proactive refresh");
            for item in batch {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            match next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        drop(tx);
        while workers.join_next().await.is_some() {}

        if let Err(err) = self.cache.set_proactive_fetch_ts(now_unix()).await {
            tracing::warn!(error = %err, "failed to persist proactive fetch timestamp");
        }

        tracing::info!("proactive policy fetching finished");
    }
}

/// `now - cached.ts < interval / grace_ratio` (spec.md §4.5 step 3).
fn needs_refresh(now: i64, cached_ts: i64, interval: i64, grace_ratio: f64) -> bool {
    ((now - cached_ts) as f64) >= (interval as f64 / grace_ratio)
}

async fn refresh_domain(
    resolver: &STSResolver,
    cache: &Arc<dyn Cache>,
    domain: &str,
    cached: CacheEntry,
    interval: i64,
    grace_ratio: f64,
) {
    let now = now_unix();
    if !needs_refresh(now, cached.ts, interval, grace_ratio) {
        return;
    }

    let (status, policy) = resolver.resolve(domain, Some(cached.pol_id.as_str())).await;
    match status {
        FetchStatus::Valid => {
            let (id, body) = policy.expect("VALID always carries a policy");
            let entry = CacheEntry {
                ts: now,
                pol_id: id,
                pol_body: body,
            };
            cache.safe_set(domain, entry).await;
        }
        FetchStatus::NotChanged => {
            let entry = CacheEntry { ts: now, ..cached };
            cache.safe_set(domain, entry).await;
        }
        FetchStatus::FetchError | FetchStatus::None => {
            tracing::debug!(domain, "proactive refresh found no usable policy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InternalCache;
    use crate::resolver::{PolicyBody, PolicyMode};

    fn entry(ts: i64) -> CacheEntry {
        CacheEntry {
            ts,
            pol_id: "20180907T090909".to_string(),
            pol_body: PolicyBody {
                mode: PolicyMode::Enforce,
                max_age: 86_400,
                mx: vec!["mail.loc".to_string()],
            },
        }
    }

    #[test]
    fn needs_refresh_respects_grace_ratio() {
        // interval=86400, grace_ratio=2.0 => refresh once older than 43200s.
        assert!(!needs_refresh(1_000_000, 1_000_000 - 40_000, 86_400, 2.0));
        assert!(needs_refresh(1_000_000, 1_000_000 - 50_000, 86_400, 2.0));
    }

    // Every scanned domain is within its grace window, so the sweep never
    // touches the resolver (no network I/O), yet still drains the scan and
    // records a fresh proactive-fetch timestamp.
    #[tokio::test]
    async fn sweep_skips_domains_still_within_grace_and_records_timestamp() {
        let cache: Arc<dyn Cache> = Arc::new(InternalCache::new(16));
        let now = now_unix();
        for name in ["a.loc", "b.loc", "c.loc"] {
            cache.set(name, entry(now)).await.unwrap();
        }

        let resolver = STSResolver::new(4.0).unwrap();
        let config = ProactiveFetchConfig {
            enabled: true,
            interval: 86_400,
            concurrency_limit: 2,
            grace_ratio: 2.0,
        };
        let fetcher = ProactiveFetcher::new(Arc::clone(&cache), resolver, &config);
        fetcher.sweep().await;

        for name in ["a.loc", "b.loc", "c.loc"] {
            let got = cache.get(name).await.unwrap().unwrap();
            assert_eq!(got.ts, now, "untouched entry should be unchanged");
        }
        assert!(cache.get_proactive_fetch_ts().await.unwrap() >= now);
    }
}
