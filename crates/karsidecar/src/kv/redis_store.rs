// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redis-backed `KvStore`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{KvError, KvStore};

/// Atomically: if `key` currently equals `expected` (or is absent and
/// `expected` is empty), set it to `new` and return 1; else return 0.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then current = '' end
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

pub struct RedisKv {
    conn: ConnectionManager,
    cas_script: Script,
}

impl RedisKv {
    pub async fn connect(
        host: &str,
        port: u16,
        password: Option<&str>,
        enable_tls: bool,
    ) -> anyhow::Result<Self> {
        let scheme = if enable_tls { "rediss" } else { "redis" };
        let url = match password {
            Some(pw) if !pw.is_empty() => format!("{scheme}://:{pw}@{host}:{port}"),
            _ => format!("{scheme}://{host}:{port}"),
        };
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, cas_script: Script::new(COMPARE_AND_SET_SCRIPT) })
    }

    fn map_err(e: redis::RedisError) -> KvError {
        KvError::Other(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(Self::map_err)?;
        value.ok_or(KvError::Nil)
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let result: i32 = self
            .cas_script
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(result == 1)
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn sorted_set_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.zrange(key, start as isize, stop as isize).await.map_err(Self::map_err)
    }

    async fn sorted_set_rem_by_score(&self, key: &str, min: i64, max: i64) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrembyscore(key, min, max).await.map_err(Self::map_err)?;
        Ok(())
    }
}
