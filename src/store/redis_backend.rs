//! Redis store backend.
//!
//! Reads are plain Redis commands. Writes go through one Lua script that
//! checks the guarded versions and applies the op batch, so a commit is a
//! single atomic step on the server. Versions of keys holding data live in
//! one hash (`versions_key`). The version clock and the tombstone buckets
//! live in `{versions_key}:tombstones`; a key's field is dropped from the
//! versions hash as soon as the key is emptied.
//!
//! Data keys travel as script arguments rather than `KEYS`, so commits
//! assume a single Redis node, not a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::{RedisConfig, StoreConfig};
use crate::error::StoreError;
use crate::redis::{
    CircuitBreaker, CircuitBreakerConfig, PoolError, RedisHealth, RedisHealthSnapshot, RedisPool,
};

use super::backend::{Guard, OpReply, StoreOp, WorkQueueStore};

/// Version lookup shared by both scripts. The bucket hash mirrors
/// `tombstone_bucket`.
macro_rules! version_prelude {
    () => {
        r#"
local versions = KEYS[1]
local tombstones = KEYS[2]

local function bucket(key)
    local h = 0
    for i = 1, #key do
        h = (h * 31 + string.byte(key, i)) % 1024
    end
    return tostring(h)
end

local function version(key)
    return redis.call('HGET', versions, key)
        or redis.call('HGET', tombstones, bucket(key))
        or '0'
end
"#
    };
}

const GUARDS_SCRIPT: &str = concat!(
    version_prelude!(),
    r#"
local result = {}
for i = 1, #ARGV do
    result[i] = version(ARGV[i])
end
return result
"#
);

const COMMIT_SCRIPT: &str = concat!(
    version_prelude!(),
    r#"
local function bump(key)
    local stamp = redis.call('HINCRBY', tombstones, 'clock', 1)
    if redis.call('EXISTS', key) == 1 then
        redis.call('HSET', versions, key, stamp)
    else
        redis.call('HDEL', versions, key)
        redis.call('HSET', tombstones, bucket(key), stamp)
    end
end

local pos = 1
local guard_count = tonumber(ARGV[pos])
pos = pos + 1
for _ = 1, guard_count do
    if version(ARGV[pos]) ~= ARGV[pos + 1] then
        return false
    end
    pos = pos + 2
end

local op_count = tonumber(ARGV[pos])
pos = pos + 1
local replies = {}
for _ = 1, op_count do
    local op = ARGV[pos]
    local key = ARGV[pos + 1]
    pos = pos + 2
    local reply = {}

    if op == 'lpush' then
        local at_head = ARGV[pos] == 'head'
        local n = tonumber(ARGV[pos + 1])
        pos = pos + 2
        if at_head then
            for j = n, 1, -1 do
                redis.call('LPUSH', key, ARGV[pos + j - 1])
            end
        else
            for j = 1, n do
                redis.call('RPUSH', key, ARGV[pos + j - 1])
            end
        end
        pos = pos + n
        if n > 0 then bump(key) end
    elseif op == 'lpop' then
        local from_head = ARGV[pos] == 'head'
        local count = tonumber(ARGV[pos + 1])
        pos = pos + 2
        for _ = 1, count do
            local value
            if from_head then
                value = redis.call('LPOP', key)
            else
                value = redis.call('RPOP', key)
            end
            if not value then break end
            if from_head then
                reply[#reply + 1] = value
            else
                table.insert(reply, 1, value)
            end
        end
        if #reply > 0 then bump(key) end
    elseif op == 'lrem' then
        if redis.call('LREM', key, 0, ARGV[pos]) > 0 then bump(key) end
        pos = pos + 1
    elseif op == 'zadd' then
        redis.call('ZADD', key, ARGV[pos], ARGV[pos + 1])
        pos = pos + 2
        bump(key)
    elseif op == 'zpoprange' then
        if tonumber(ARGV[pos + 2]) > 0 then
            local members = redis.call('ZRANGEBYSCORE', key, ARGV[pos], ARGV[pos + 1], 'LIMIT', 0, ARGV[pos + 2])
            for j = 1, #members do
                redis.call('ZREM', key, members[j])
                reply[j] = members[j]
            end
            if #members > 0 then bump(key) end
        end
        pos = pos + 3
    elseif op == 'zrem' then
        if redis.call('ZREM', key, ARGV[pos]) > 0 then bump(key) end
        pos = pos + 1
    elseif op == 'sadd' then
        if redis.call('SADD', key, ARGV[pos]) > 0 then bump(key) end
        pos = pos + 1
    elseif op == 'srem' then
        if redis.call('SREM', key, ARGV[pos]) > 0 then bump(key) end
        pos = pos + 1
    elseif op == 'del' then
        if redis.call('DEL', key) > 0 then bump(key) end
    elseif op == 'incr' then
        reply[1] = tostring(redis.call('INCR', key))
        bump(key)
    else
        return redis.error_reply('unknown store op ' .. op)
    end

    replies[#replies + 1] = reply
end
return replies
"#
);

/// Format a score the way Redis parses it (`inf`, `-inf`, decimals).
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Flatten guards and ops into the commit script's argument list.
fn encode_commit_args(guards: &[Guard], ops: &[StoreOp]) -> Vec<Vec<u8>> {
    fn text(value: impl ToString) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    let mut args = Vec::new();
    args.push(text(guards.len()));
    for guard in guards {
        args.push(text(&guard.key));
        args.push(text(guard.version));
    }

    args.push(text(ops.len()));
    for op in ops {
        match op {
            StoreOp::ListPush { key, end, values } => {
                args.extend([text("lpush"), text(key), text(end.as_str()), text(values.len())]);
                args.extend(values.iter().cloned());
            }
            StoreOp::ListPop { key, end, count } => {
                args.extend([text("lpop"), text(key), text(end.as_str()), text(count)]);
            }
            StoreOp::ListRemove { key, value } => {
                args.extend([text("lrem"), text(key), value.clone()]);
            }
            StoreOp::SortedInsert { key, score, member } => {
                args.extend([text("zadd"), text(key), text(score_arg(*score)), member.clone()]);
            }
            StoreOp::SortedPopRange {
                key,
                min,
                max,
                count,
            } => {
                args.extend([
                    text("zpoprange"),
                    text(key),
                    text(score_arg(*min)),
                    text(score_arg(*max)),
                    // LIMIT takes a signed 64-bit count
                    text((*count).min(i64::MAX as usize)),
                ]);
            }
            StoreOp::SortedRemove { key, member } => {
                args.extend([text("zrem"), text(key), member.clone()]);
            }
            StoreOp::SetAdd { key, member } => {
                args.extend([text("sadd"), text(key), text(member)]);
            }
            StoreOp::SetRemove { key, member } => {
                args.extend([text("srem"), text(key), text(member)]);
            }
            StoreOp::Delete { key } => {
                args.extend([text("del"), text(key)]);
            }
            StoreOp::Incr { key } => {
                args.extend([text("incr"), text(key)]);
            }
        }
    }
    args
}

/// Turn the script's per-op string arrays into typed replies.
fn decode_replies(ops: &[StoreOp], raw: Vec<Vec<Vec<u8>>>) -> Result<Vec<OpReply>, StoreError> {
    if raw.len() != ops.len() {
        return Err(StoreError::Protocol(format!(
            "expected {} replies, got {}",
            ops.len(),
            raw.len()
        )));
    }

    ops.iter()
        .zip(raw)
        .map(|(op, values)| match op {
            StoreOp::ListPop { .. } | StoreOp::SortedPopRange { .. } => Ok(OpReply::Values(values)),
            StoreOp::Incr { .. } => values
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|v| v.parse().ok())
                .map(OpReply::Count)
                .ok_or_else(|| StoreError::Protocol("malformed counter reply".to_string())),
            _ => Ok(OpReply::Done),
        })
        .collect()
}

/// Redis-backed [`WorkQueueStore`].
///
/// Owns its [`RedisPool`]; the connection is released when the store is
/// dropped or [`closed`](RedisStore::close).
pub struct RedisStore {
    pool: Arc<RedisPool>,
    commit_script: redis::Script,
    guards_script: redis::Script,
    versions_key: String,
    tombstones_key: String,
}

impl RedisStore {
    pub fn new(pool: Arc<RedisPool>, versions_key: impl Into<String>) -> Self {
        let versions_key = versions_key.into();
        Self {
            pool,
            commit_script: redis::Script::new(COMMIT_SCRIPT),
            guards_script: redis::Script::new(GUARDS_SCRIPT),
            tombstones_key: format!("{}:tombstones", versions_key),
            versions_key,
        }
    }

    /// Build the pool from configuration without connecting yet.
    pub fn from_config(redis: &RedisConfig, store: &StoreConfig) -> Result<Self, StoreError> {
        let circuit_breaker = Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig::from(redis)));
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(redis.clone(), circuit_breaker, health)?;
        Ok(Self::new(Arc::new(pool), store.versions_key.clone()))
    }

    /// Build the store and wait until Redis answers.
    pub async fn connect(
        redis: &RedisConfig,
        store: &StoreConfig,
        max_attempts: u32,
    ) -> Result<Self, StoreError> {
        let store = Self::from_config(redis, store)?;
        store
            .pool
            .connect_with_retry(max_attempts)
            .await
            .map_err(Self::map_error)?;
        Ok(store)
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Release the connection now. Later calls fail with `StoreError::Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn map_error(err: PoolError) -> StoreError {
        match err {
            PoolError::Closed => StoreError::Closed,
            PoolError::Redis(e) => StoreError::Redis(e),
            other => StoreError::Pool(other),
        }
    }
}

#[async_trait]
impl WorkQueueStore for RedisStore {
    fn backend_type(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.pool.is_healthy()
    }

    fn connection_health(&self) -> Option<RedisHealthSnapshot> {
        Some(self.pool.health().snapshot())
    }

    async fn guards(&self, keys: &[String]) -> Result<Vec<Guard>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.guards_script.key(&self.versions_key);
        invocation.key(&self.tombstones_key);
        for key in keys {
            invocation.arg(key);
        }
        let versions: Vec<u64> = self
            .pool
            .execute("guards", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await
            .map_err(Self::map_error)?;

        if versions.len() != keys.len() {
            return Err(StoreError::Protocol("guard lookup returned wrong field count".to_string()));
        }

        Ok(keys
            .iter()
            .zip(versions)
            .map(|(key, version)| Guard {
                key: key.clone(),
                version,
            })
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let key = key.to_string();
        self.pool
            .execute("list_len", |mut conn| async move { conn.llen(key).await })
            .await
            .map_err(Self::map_error)
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = key.to_string();
        let stop = start.saturating_add(count - 1).min(isize::MAX as usize) as isize;
        self.pool
            .execute("list_range", |mut conn| async move {
                conn.lrange(key, start as isize, stop).await
            })
            .await
            .map_err(Self::map_error)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.pool
            .execute("set_contains", |mut conn| async move {
                conn.sismember(key, member).await
            })
            .await
            .map_err(Self::map_error)
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let key = key.to_string();
        self.pool
            .execute("set_len", |mut conn| async move { conn.scard(key).await })
            .await
            .map_err(Self::map_error)
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let key = key.to_string();
        self.pool
            .execute("sorted_len", |mut conn| async move { conn.zcard(key).await })
            .await
            .map_err(Self::map_error)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let key = key.to_string();
        let (min, max) = (score_arg(min), score_arg(max));
        self.pool
            .execute("sorted_range", |mut conn| async move {
                conn.zrangebyscore(key, min, max).await
            })
            .await
            .map_err(Self::map_error)
    }

    async fn commit(
        &self,
        guards: &[Guard],
        ops: Vec<StoreOp>,
    ) -> Result<Option<Vec<OpReply>>, StoreError> {
        let args = encode_commit_args(guards, &ops);
        let mut invocation = self.commit_script.key(&self.versions_key);
        invocation.key(&self.tombstones_key);
        for arg in args {
            invocation.arg(arg);
        }

        let raw: Option<Vec<Vec<Vec<u8>>>> = self
            .pool
            .execute("commit", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await
            .map_err(Self::map_error)?;

        match raw {
            Some(raw) => decode_replies(&ops, raw).map(Some),
            None => {
                tracing::trace!(guards = guards.len(), "Guarded commit rejected");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ListEnd;

    fn as_text(args: &[Vec<u8>]) -> Vec<String> {
        args.iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    #[test]
    fn test_encode_commit_args_layout() {
        let guards = vec![Guard {
            key: "q:rotation".to_string(),
            version: 4,
        }];
        let ops = vec![
            StoreOp::ListPush {
                key: "q:partition:a".to_string(),
                end: ListEnd::Head,
                values: vec![b"1".to_vec(), b"2".to_vec()],
            },
            StoreOp::SortedPopRange {
                key: "q:timeline".to_string(),
                min: f64::NEG_INFINITY,
                max: 2.5,
                count: 3,
            },
            StoreOp::Delete {
                key: "q:reservation:a".to_string(),
            },
        ];

        assert_eq!(
            as_text(&encode_commit_args(&guards, &ops)),
            vec![
                "1", "q:rotation", "4", "3", "lpush", "q:partition:a", "head", "2", "1", "2",
                "zpoprange", "q:timeline", "-inf", "2.5", "3", "del", "q:reservation:a",
            ]
        );
    }

    #[test]
    fn test_pop_range_count_fits_redis_limit() {
        let ops = vec![StoreOp::SortedPopRange {
            key: "q:timeline".to_string(),
            min: 0.0,
            max: 1.0,
            count: usize::MAX,
        }];
        let args = as_text(&encode_commit_args(&[], &ops));
        let count: i64 = args.last().unwrap().parse().unwrap();
        assert_eq!(count as u64, (usize::MAX as u64).min(i64::MAX as u64));
    }

    #[test]
    fn test_scripts_share_the_version_lookup() {
        for script in [GUARDS_SCRIPT, COMMIT_SCRIPT] {
            assert!(script.contains("local function version(key)"));
            assert!(script.contains(&format!(
                "% {}",
                crate::store::backend::TOMBSTONE_BUCKETS
            )));
        }
    }

    #[test]
    fn test_fresh_store_reports_disconnected() {
        let store = RedisStore::from_config(&RedisConfig::default(), &StoreConfig::default()).unwrap();
        let health = store.connection_health().unwrap();
        assert_eq!(health.status, crate::redis::RedisHealthStatus::Disconnected);
        assert_eq!(health.connects, 0);
        assert!(!store.is_healthy());
    }

    #[test]
    fn test_decode_replies_by_op_kind() {
        let ops = vec![
            StoreOp::ListPop {
                key: "l".to_string(),
                end: ListEnd::Head,
                count: 2,
            },
            StoreOp::Incr {
                key: "c".to_string(),
            },
            StoreOp::SetAdd {
                key: "s".to_string(),
                member: "m".to_string(),
            },
        ];
        let raw = vec![vec![b"a".to_vec(), b"b".to_vec()], vec![b"7".to_vec()], vec![]];

        let replies = decode_replies(&ops, raw).unwrap();
        assert_eq!(
            replies,
            vec![
                OpReply::Values(vec![b"a".to_vec(), b"b".to_vec()]),
                OpReply::Count(7),
                OpReply::Done,
            ]
        );
    }

    #[test]
    fn test_decode_replies_rejects_count_mismatch() {
        let ops = vec![StoreOp::Delete {
            key: "k".to_string(),
        }];
        assert!(matches!(
            decode_replies(&ops, vec![]),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_score_arg_infinities() {
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(3.0), "3");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at redis://localhost:6379"]
    async fn test_commit_against_live_redis() {
        let store = RedisStore::connect(
            &RedisConfig::default(),
            &StoreConfig {
                backend: "redis".to_string(),
                versions_key: "workqueue-test:versions".to_string(),
            },
            3,
        )
        .await
        .unwrap();

        let key = "workqueue-test:list".to_string();
        store.apply(StoreOp::Delete { key: key.clone() }).await.unwrap();
        let guards = store.guards(&[key.clone()]).await.unwrap();

        let replies = store
            .commit(
                &guards,
                vec![
                    StoreOp::ListPush {
                        key: key.clone(),
                        end: ListEnd::Tail,
                        values: vec![b"a".to_vec(), b"b".to_vec()],
                    },
                    StoreOp::ListPop {
                        key: key.clone(),
                        end: ListEnd::Head,
                        count: 1,
                    },
                ],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replies[1], OpReply::Values(vec![b"a".to_vec()]));

        // The same guard is now stale
        let stale = store
            .commit(&guards, vec![StoreOp::Delete { key: key.clone() }])
            .await
            .unwrap();
        assert!(stale.is_none());

        store.apply(StoreOp::Delete { key: key.clone() }).await.unwrap();

        // Create-then-drain between guard and commit is still detected
        let drained = store.guards(&[key.clone()]).await.unwrap();
        store
            .apply(StoreOp::push(key.clone(), ListEnd::Tail, b"c".to_vec()))
            .await
            .unwrap();
        store.apply(StoreOp::Delete { key: key.clone() }).await.unwrap();
        let stale = store
            .commit(&drained, vec![StoreOp::push(key.clone(), ListEnd::Tail, b"d".to_vec())])
            .await
            .unwrap();
        assert!(stale.is_none());

        let field: Option<u64> = store
            .pool()
            .execute("test", |mut conn| async move {
                conn.hget("workqueue-test:versions", "workqueue-test:list").await
            })
            .await
            .unwrap();
        assert!(field.is_none());
        store.close().await;
    }
}
