//! Embedded SQL cache backend (`rusqlite`, bundled).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/sqlite_cache.py`:
//! same schema (`sts_policy_cache` keyed by `domain`, unique index, a
//! metadata row for the proactive-fetch timestamp), same WAL/NORMAL
//! pragmas, same "insert, fall back to conditional update on conflict"
//! newest-wins write. `aiosqlite`'s hand-rolled `SqliteConnPool` (a queue
//! of connections lent one at a time, replaced on error) is reproduced
//! with a `tokio::sync::Mutex<Vec<Connection>>` plus a semaphore, since
//! `rusqlite::Connection` is blocking and not `Sync`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};

use super::{Cache, CacheEntry, CacheError, ScanToken};
use crate::error::ExitError;
use crate::resolver::PolicyBody;

fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_timeout() -> f64 {
    5.0
}

#[derive(Deserialize)]
struct SqliteOptions {
    filename: PathBuf,
    #[serde(default = "default_threads")]
    threads: usize,
    #[serde(default = "default_timeout")]
    timeout: f64,
}

/// A small pool of long-lived connections, lent one at a time. A
/// connection that raised mid-use is dropped rather than returned, so a
/// poisoned transaction can never leak back into the pool.
struct ConnPool {
    free: Mutex<Vec<Connection>>,
    permits: Semaphore,
    filename: PathBuf,
    busy_timeout: std::time::Duration,
}

impl ConnPool {
    fn open_one(filename: &PathBuf, busy_timeout: std::time::Duration) -> rusqlite::Result<Connection> {
        let conn = Connection::open(filename)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    fn new(filename: PathBuf, threads: usize, timeout: f64) -> Result<Self, CacheError> {
        let busy_timeout = std::time::Duration::from_secs_f64(timeout);
        let mut conns = Vec::with_capacity(threads);
        for _ in 0..threads.max(1) {
            conns.push(Self::open_one(&filename, busy_timeout).map_err(|e| CacheError::Backend(e.to_string()))?);
        }
        Ok(Self {
            permits: Semaphore::new(conns.len()),
            free: Mutex::new(conns),
            filename,
            busy_timeout,
        })
    }

    /// Run `f` with a borrowed connection on a blocking-pool thread
    /// (`rusqlite` is synchronous), reopening the connection if `f` fails.
    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    ) -> Result<T, CacheError>
    where
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore never closed");
        let conn = self
            .free
            .lock()
            .await
            .pop()
            .expect("permit implies a free connection");

        let (result, conn) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (result, conn)
        })
        .await
        .expect("sqlite worker thread panicked");

        match &result {
            Ok(_) => self.free.lock().await.push(conn),
            Err(_) => {
                let replacement = Self::open_one(&self.filename, self.busy_timeout).unwrap_or(conn);
                self.free.lock().await.push(replacement);
            }
        }
        result.map_err(|e| CacheError::Backend(e.to_string()))
    }
}

pub struct SqliteCache {
    pool: Arc<ConnPool>,
}

impl SqliteCache {
    pub fn from_options(options: &serde_yaml::Mapping) -> Result<Self, ExitError> {
        let opts: SqliteOptions =
            serde_yaml::from_value(serde_yaml::Value::Mapping(options.clone()))
                .map_err(|err| ExitError::CacheSetup(format!("sqlite cache options: {err}")))?;
        let pool = ConnPool::new(opts.filename, opts.threads, opts.timeout)
            .map_err(|err| ExitError::CacheSetup(err.to_string()))?;
        Ok(Self { pool: Arc::new(pool) })
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn setup(&self) -> Result<(), CacheError> {
        self.pool
            .with_conn(|conn| {
                conn.execute_batch(
                    "create table if not exists sts_policy_cache \
                     (domain text, ts integer, pol_id text, pol_body text); \
                     create unique index if not exists sts_policy_domain \
                     on sts_policy_cache (domain); \
                     create index if not exists sts_policy_domain_ts \
                     on sts_policy_cache (domain, ts); \
                     create table if not exists sts_proactive_fetch \
                     (id integer primary key check (id = 0), ts integer);",
                )
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = key.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.query_row(
                    "select ts, pol_id, pol_body from sts_policy_cache where domain = ?1",
                    [&key],
                    |row| {
                        let ts: i64 = row.get(0)?;
                        let pol_id: String = row.get(1)?;
                        let pol_body: String = row.get(2)?;
                        Ok((ts, pol_id, pol_body))
                    },
                )
                .optional()
            })
            .await?
            .map(|(ts, pol_id, pol_body)| {
                let pol_body: PolicyBody = serde_json::from_str(&pol_body)
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
                Ok(CacheEntry { ts, pol_id, pol_body })
            })
            .transpose()
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let key = key.to_string();
        let body_json =
            serde_json::to_string(&entry.pol_body).map_err(|e| CacheError::Backend(e.to_string()))?;
        self.pool
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "insert into sts_policy_cache (domain, ts, pol_id, pol_body) \
                     values (?1, ?2, ?3, ?4) \
                     on conflict (domain) do update set \
                     ts = excluded.ts, pol_id = excluded.pol_id, pol_body = excluded.pol_body \
                     where sts_policy_cache.ts < excluded.ts",
                    rusqlite::params![key, entry.ts, entry.pol_id, body_json],
                )?;
                let _ = changed;
                Ok(())
            })
            .await
    }

    async fn scan(
        &self,
        token: Option<ScanToken>,
        amount_hint: usize,
    ) -> Result<(Option<ScanToken>, Vec<(String, CacheEntry)>), CacheError> {
        let start = token.unwrap_or(0);
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "select rowid, domain, ts, pol_id, pol_body from sts_policy_cache \
                     where rowid >= ?1 order by rowid limit ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![start, amount_hint as i64], |row| {
                        let rowid: i64 = row.get(0)?;
                        let domain: String = row.get(1)?;
                        let ts: i64 = row.get(2)?;
                        let pol_id: String = row.get(3)?;
                        let pol_body: String = row.get(4)?;
                        Ok((rowid, domain, ts, pol_id, pol_body))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        if rows.is_empty() {
            return Ok((None, Vec::new()));
        }

        let mut last_rowid = start;
        let mut out = Vec::with_capacity(rows.len());
        for (rowid, domain, ts, pol_id, pol_body) in rows {
            last_rowid = last_rowid.max(rowid);
            let pol_body: PolicyBody =
                serde_json::from_str(&pol_body).map_err(|e| CacheError::Backend(e.to_string()))?;
            out.push((domain, CacheEntry { ts, pol_id, pol_body }));
        }
        Ok((Some(last_rowid + 1), out))
    }

    async fn get_proactive_fetch_ts(&self) -> Result<i64, CacheError> {
        self.pool
            .with_conn(|conn| {
                conn.query_row("select ts from sts_proactive_fetch where id = 0", [], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()
            })
            .await
            .map(|ts| ts.unwrap_or(0))
    }

    async fn set_proactive_fetch_ts(&self, ts: i64) -> Result<(), CacheError> {
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "insert into sts_proactive_fetch (id, ts) values (0, ?1) \
                     on conflict (id) do update set ts = excluded.ts",
                    [ts],
                )?;
                Ok(())
            })
            .await
    }
}
