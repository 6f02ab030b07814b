use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::{SharedStore, StoreResult, MAX_REPETITION_COUNT};

const RECORD_REPETITION: &str = r#"
local key, member, digest = KEYS[1], ARGV[1], ARGV[2]
local ttl, cap = tonumber(ARGV[3]), tonumber(ARGV[4])
local count = 1
local current = redis.call("HGET", key, member)
if current then
    local sep = string.find(current, ":", 1, true)
    if sep then
        local previous = tonumber(string.sub(current, 1, sep - 1))
        if previous and string.sub(current, sep + 1) == digest then
            count = math.min(previous + 1, cap)
        end
    end
end
redis.call("HSET", key, member, count .. ":" .. digest)
redis.call("EXPIRE", key, ttl)
return count
"#;

const EXTEND_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const UNLOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const MARK_ALL: &str = r#"
local key = KEYS[1]
local now, expires_at = tonumber(ARGV[1]), tonumber(ARGV[2])
redis.call("ZREMRANGEBYSCORE", key, "-inf", now)
local added = {}
for i = 3, #ARGV do
    if redis.call("ZADD", key, "NX", expires_at, ARGV[i]) == 1 then
        added[#added + 1] = ARGV[i]
    end
end
redis.call("PEXPIREAT", key, expires_at)
return added
"#;

/// Redis-backed store shared by every mailroom replica.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    record_repetition: Script,
    extend_lock: Script,
    unlock: Script,
    mark_all: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            record_repetition: Script::new(RECORD_REPETITION),
            extend_lock: Script::new(EXTEND_LOCK),
            unlock: Script::new(UNLOCK),
            mark_all: Script::new(MARK_ALL),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn record_repetition(
        &self,
        key: &str,
        member: &str,
        digest: &str,
        ttl: Duration,
    ) -> StoreResult<u32> {
        let mut conn = self.conn.clone();
        let count: u32 = self
            .record_repetition
            .key(key)
            .arg(member)
            .arg(digest)
            .arg(ttl.as_secs().max(1))
            .arg(MAX_REPETITION_COUNT)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_lock
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    /// Markers live in a sorted set scored by their own expiry, so one busy key never
    /// keeps an old marker alive.
    async fn mark_all(&self, key: &str, members: &[String], ttl: Duration) -> StoreResult<Vec<String>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now().timestamp_millis();
        let expires_at = now + millis(ttl) as i64;
        let mut conn = self.conn.clone();
        let mut invocation = self.mark_all.key(key);
        invocation.arg(now).arg(expires_at);
        for member in members {
            invocation.arg(member);
        }
        let added: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(added)
    }

    async fn unmark(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
