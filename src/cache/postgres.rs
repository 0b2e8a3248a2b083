//! External relational cache backend (`tokio-postgres` via
//! `deadpool-postgres`).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/postgres_cache.py`:
//! the same two tables (`sts_policy_cache` keyed by `domain`, and a
//! single-row `proactive_fetch_ts` table), the same `INSERT ... ON
//! CONFLICT ... WHERE existing.ts < excluded.ts` newest-wins write, and
//! an id-ordered `scan` cursor. Connection pooling is the driver's
//! (`deadpool`) rather than hand-rolled, per spec.md §4.2 ("connection
//! pooling provided by the driver").

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use serde::Deserialize;
use tokio_postgres::NoTls;

use super::{Cache, CacheEntry, CacheError, ScanToken};
use crate::error::ExitError;
use crate::resolver::PolicyBody;

#[derive(Deserialize)]
struct PostgresOptions {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
    dbname: String,
}

pub struct PostgresCache {
    pool: Pool,
}

impl PostgresCache {
    pub fn from_options(options: &serde_yaml::Mapping) -> Result<Self, ExitError> {
        let opts: PostgresOptions =
            serde_yaml::from_value(serde_yaml::Value::Mapping(options.clone()))
                .map_err(|err| ExitError::CacheSetup(format!("postgres cache options: {err}")))?;

        let mut cfg = PoolConfig::new();
        cfg.host = Some(opts.host);
        cfg.port = opts.port;
        cfg.user = opts.user;
        cfg.password = opts.password;
        cfg.dbname = Some(opts.dbname);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|err| ExitError::CacheSetup(err.to_string()))?;
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, CacheError> {
        self.pool.get().await.map_err(|e| CacheError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Cache for PostgresCache {
    async fn setup(&self) -> Result<(), CacheError> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS proactive_fetch_ts \
                 (id integer primary key check (id = 1), last_fetch_ts bigint); \
                 CREATE TABLE IF NOT EXISTS sts_policy_cache \
                 (id bigserial primary key, domain text, ts bigint, pol_id text, pol_body jsonb); \
                 CREATE UNIQUE INDEX IF NOT EXISTS sts_policy_domain ON sts_policy_cache (domain); \
                 CREATE INDEX IF NOT EXISTS sts_policy_domain_ts ON sts_policy_cache (domain, ts);",
            )
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT ts, pol_id, pol_body FROM sts_policy_cache WHERE domain = $1",
                &[&key],
            )
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        match row {
            Some(row) => {
                let ts: i64 = row.get(0);
                let pol_id: String = row.get(1);
                let pol_body: serde_json::Value = row.get(2);
                let pol_body: PolicyBody =
                    serde_json::from_value(pol_body).map_err(|e| CacheError::Backend(e.to_string()))?;
                Ok(Some(CacheEntry { ts, pol_id, pol_body }))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let client = self.client().await?;
        let pol_body =
            serde_json::to_value(&entry.pol_body).map_err(|e| CacheError::Backend(e.to_string()))?;
        client
            .execute(
                "INSERT INTO sts_policy_cache (domain, ts, pol_id, pol_body) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (domain) DO UPDATE \
                 SET ts = EXCLUDED.ts, pol_id = EXCLUDED.pol_id, pol_body = EXCLUDED.pol_body \
                 WHERE sts_policy_cache.ts < EXCLUDED.ts",
                &[&key, &entry.ts, &entry.pol_id, &pol_body],
            )
            .await
            .map(|_| ())
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn scan(
        &self,
        token: Option<ScanToken>,
        amount_hint: usize,
    ) -> Result<(Option<ScanToken>, Vec<(String, CacheEntry)>), CacheError> {
        let client = self.client().await?;
        let start = token.unwrap_or(1);
        let rows = client
            .query(
                "SELECT id, ts, pol_id, pol_body, domain FROM sts_policy_cache \
                 WHERE id >= $1 ORDER BY id LIMIT $2",
                &[&start, &(amount_hint as i64)],
            )
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        if rows.is_empty() {
            return Ok((None, Vec::new()));
        }

        let mut new_token = start;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            let ts: i64 = row.get(1);
            let pol_id: String = row.get(2);
            let pol_body: serde_json::Value = row.get(3);
            let domain: String = row.get(4);
            new_token = new_token.max(id);
            let pol_body: PolicyBody =
                serde_json::from_value(pol_body).map_err(|e| CacheError::Backend(e.to_string()))?;
            out.push((domain, CacheEntry { ts, pol_id, pol_body }));
        }
        Ok((Some(new_token + 1), out))
    }

    async fn get_proactive_fetch_ts(&self) -> Result<i64, CacheError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT last_fetch_ts FROM proactive_fetch_ts WHERE id = 1", &[])
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(row.map(|r| r.get::<_, i64>(0)).unwrap_or(0))
    }

    async fn set_proactive_fetch_ts(&self, ts: i64) -> Result<(), CacheError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO proactive_fetch_ts (id, last_fetch_ts) VALUES (1, $1) \
                 ON CONFLICT (id) DO UPDATE SET last_fetch_ts = EXCLUDED.last_fetch_ts",
                &[&ts],
            )
            .await
            .map(|_| ())
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}
