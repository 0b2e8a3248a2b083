//! External key-value cache backend (Redis).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/redis_cache.py`:
//! each domain is a sorted set holding exactly one member, scored by
//! `ts`, written via a pipelined `ZADD` + `ZREMRANGEBYRANK 0 -2` so a
//! racing writer can never leave two members behind. The 16-byte random
//! prefix on the packed payload exists only so two writes of the same
//! policy don't collide as identical set members. `scan`/proactive-fetch
//! metadata are spec additions the original backend didn't implement; we
//! add a reserved `_metadata` hash key and a cursor-based `SCAN` walk.

use async_trait::async_trait;
use rand::RngCore;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{Cache, CacheEntry, CacheError, ScanToken};
use crate::error::ExitError;
use crate::resolver::PolicyBody;

const METADATA_KEY: &str = "_metadata";
const METADATA_FIELD: &str = "proactive_fetch_ts";
const PREFIX_LEN: usize = 16;

#[derive(Deserialize)]
struct RedisOptions {
    url: String,
}

pub struct RedisCache {
    url: String,
    conn: OnceCell<MultiplexedConnection>,
}

impl RedisCache {
    pub fn from_options(options: &serde_yaml::Mapping) -> Result<Self, ExitError> {
        let opts: RedisOptions =
            serde_yaml::from_value(serde_yaml::Value::Mapping(options.clone()))
                .map_err(|err| ExitError::CacheSetup(format!("redis cache options: {err}")))?;
        Ok(Self {
            url: opts.url,
            conn: OnceCell::new(),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn
            .get()
            .expect("RedisCache::setup() must run before use")
            .clone()
    }
}

fn pack_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let mut buf = vec![0u8; PREFIX_LEN];
    rand::rng().fill_bytes(&mut buf);
    let payload = serde_json::to_vec(&(&entry.pol_id, &entry.pol_body))
        .map_err(|e| CacheError::Backend(e.to_string()))?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn unpack_entry(packed: &[u8], ts: i64) -> Result<CacheEntry, CacheError> {
    if packed.len() < PREFIX_LEN {
        return Err(CacheError::Backend("truncated cache payload".to_string()));
    }
    let (pol_id, pol_body): (String, PolicyBody) =
        serde_json::from_slice(&packed[PREFIX_LEN..]).map_err(|e| CacheError::Backend(e.to_string()))?;
    Ok(CacheEntry { ts, pol_id, pol_body })
}

#[async_trait]
impl Cache for RedisCache {
    async fn setup(&self) -> Result<(), CacheError> {
        let client = redis::Client::open(self.url.clone()).map_err(|e| CacheError::Backend(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        self.conn.set(conn).ok();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn();
        let res: Vec<(Vec<u8>, f64)> = conn
            .zrevrange_withscores(key, 0, 0)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        match res.into_iter().next() {
            Some((packed, ts)) => Ok(Some(unpack_entry(&packed, ts as i64)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let packed = pack_entry(&entry)?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .zadd(key, packed, entry.ts as f64)
            .zremrangebyrank(key, 0, -2)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn scan(
        &self,
        token: Option<ScanToken>,
        amount_hint: usize,
    ) -> Result<(Option<ScanToken>, Vec<(String, CacheEntry)>), CacheError> {
        let mut conn = self.conn();
        let cursor = token.unwrap_or(0) as u64;
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(amount_hint)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if key == METADATA_KEY {
                continue;
            }
            if let Some(entry) = self.get(&key).await? {
                out.push((key, entry));
            }
        }

        let next = if next_cursor == 0 { None } else { Some(next_cursor as ScanToken) };
        Ok((next, out))
    }

    async fn get_proactive_fetch_ts(&self) -> Result<i64, CacheError> {
        let mut conn = self.conn();
        let ts: Option<i64> = conn
            .hget(METADATA_KEY, METADATA_FIELD)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(ts.unwrap_or(0))
    }

    async fn set_proactive_fetch_ts(&self, ts: i64) -> Result<(), CacheError> {
        let mut conn = self.conn();
        conn.hset(METADATA_KEY, METADATA_FIELD, ts)
            .await
            .map_err(|e: redis::RedisError| CacheError::Backend(e.to_string()))
    }
}
