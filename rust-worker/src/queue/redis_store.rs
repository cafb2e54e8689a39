//! Durable queue store on Redis.
//!
//! Layout per queue, under `{prefix}:{queue}:`
//!
//! ```text
//! job:{id}     hash    one record per job (payload kept as a JSON string)
//! waiting      zset    score = priority, member = "{seq:020}:{id}"
//! delayed      zset    score = not-before time (ms)
//! active       zset    score = lock expiry (ms)
//! completed    zset    score = finish time (ms)
//! failed       zset    score = finish time (ms)
//! paused       string  present while the queue is paused
//! seq          string  insertion counter
//! ```
//!
//! Every multi-step transition is a single Lua script, so it is atomic with
//! respect to other workers. Scripts build key names from the prefix, which
//! ties a queue to one Redis node (no cluster slot routing).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde_json::{json, Value};
use tracing::info;

use super::job::{
    new_lock_token, Backoff, FailOutcome, Job, JobOptions, JobStatus, Lock, NewJob, QueueStats,
    Retention, StalledJob, StalledOutcome,
};
use super::store::{ensure_cleanable, QueueStore};
use crate::error::QueueError;
use crate::util::time::{duration_ms, now_ms};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "mailqueue";

/// Width of the zero-padded sequence number (plus separator) in waiting members.
const WAIT_MEMBER_PREFIX_LEN: usize = 21;

/// Shared helpers. ARGV[1] is the queue key base, ARGV[2] the current time.
const PRELUDE: &str = r#"
local base = ARGV[1]
local now = tonumber(ARGV[2])
local function int(n) return string.format('%d', n) end
local function jkey(id) return base .. 'job:' .. id end
local function push_waiting(id)
  local k = jkey(id)
  if redis.call('EXISTS', k) == 0 then return end
  redis.call('HSET', k, 'status', 'waiting')
  redis.call('ZADD', base .. 'waiting', redis.call('HGET', k, 'priority'), redis.call('HGET', k, 'wait_member'))
end
local function unlink(id, status)
  if status == 'waiting' then
    redis.call('ZREM', base .. 'waiting', redis.call('HGET', jkey(id), 'wait_member'))
  else
    redis.call('ZREM', base .. status, id)
  end
end
local function owns(k, token)
  return redis.call('HGET', k, 'status') == 'active' and redis.call('HGET', k, 'lock_token') == token
end
local function reset_for_retry(id)
  local k = jkey(id)
  redis.call('HSET', k, 'attempts_made', 0, 'stalled_count', 0, 'progress', 0, 'available_at', ARGV[2])
  redis.call('HDEL', k, 'last_error', 'finished_on', 'lock_token', 'lock_expires_at')
  push_waiting(id)
end
"#;

/// ARGV[3]: JSON array of job specs.
const ENQUEUE: &str = r#"
local jobs = cjson.decode(ARGV[3])
local added = 0
for _, job in ipairs(jobs) do
  local k = jkey(job.id)
  if redis.call('EXISTS', k) == 0 then
    local seq = redis.call('INCR', base .. 'seq')
    local member = string.format('%020d', seq) .. ':' .. job.id
    redis.call('HSET', k,
      'id', job.id, 'data', job.data,
      'priority', int(job.priority), 'attempts', int(job.attempts),
      'backoff_type', job.backoff_type, 'backoff_delay', int(job.backoff_delay),
      'timeout_ms', int(job.timeout_ms),
      'status', 'waiting', 'attempts_made', 0, 'stalled_count', 0, 'progress', 0,
      'seq', int(seq), 'wait_member', member,
      'created_at', ARGV[2], 'available_at', ARGV[2])
    redis.call('ZADD', base .. 'waiting', int(job.priority), member)
    added = added + 1
  end
end
return added
"#;

/// ARGV[3]: lock duration (ms), ARGV[4]: lock token.
const LEASE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', base .. 'delayed', '-inf', ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', base .. 'delayed', id)
  push_waiting(id)
end
if redis.call('EXISTS', base .. 'paused') == 1 then return false end
while true do
  local popped = redis.call('ZPOPMIN', base .. 'waiting')
  if #popped == 0 then return false end
  local id = string.sub(popped[1], 22)
  local k = jkey(id)
  if redis.call('EXISTS', k) == 1 then
    local expires = int(now + tonumber(ARGV[3]))
    redis.call('HSET', k, 'status', 'active', 'lock_token', ARGV[4],
      'lock_expires_at', expires, 'processed_on', ARGV[2])
    redis.call('ZADD', base .. 'active', expires, id)
    return id
  end
end
"#;

/// ARGV[3]: id, ARGV[4]: token, ARGV[5]: lock duration (ms).
const EXTEND_LOCK: &str = r#"
local id = ARGV[3]
local k = jkey(id)
if not owns(k, ARGV[4]) then return 0 end
local expires = int(now + tonumber(ARGV[5]))
redis.call('HSET', k, 'lock_expires_at', expires)
redis.call('ZADD', base .. 'active', expires, id)
return 1
"#;

/// ARGV[3]: id, ARGV[4]: token, ARGV[5]: progress.
const PROGRESS: &str = r#"
local k = jkey(ARGV[3])
if not owns(k, ARGV[4]) then return 0 end
redis.call('HSET', k, 'progress', ARGV[5])
return 1
"#;

/// ARGV[3]: id, ARGV[4]: token, ARGV[5]: keep | remove | last, ARGV[6]: count.
const COMPLETE: &str = r#"
local id = ARGV[3]
local k = jkey(id)
if not owns(k, ARGV[4]) then return 0 end
redis.call('ZREM', base .. 'active', id)
if ARGV[5] == 'remove' then
  redis.call('DEL', k)
  return 1
end
redis.call('HSET', k, 'status', 'completed', 'finished_on', ARGV[2], 'progress', 100)
redis.call('HDEL', k, 'lock_token', 'lock_expires_at')
redis.call('ZADD', base .. 'completed', ARGV[2], id)
if ARGV[5] == 'last' then
  local excess = redis.call('ZCARD', base .. 'completed') - tonumber(ARGV[6])
  if excess > 0 then
    local evicted = redis.call('ZRANGE', base .. 'completed', 0, excess - 1)
    for _, old in ipairs(evicted) do
      redis.call('DEL', jkey(old))
    end
    redis.call('ZREMRANGEBYRANK', base .. 'completed', 0, excess - 1)
  end
end
return 1
"#;

/// ARGV[3]: id, ARGV[4]: token, ARGV[5]: error, ARGV[6]: retryable, ARGV[7]: remove on fail.
const FAIL: &str = r#"
local id = ARGV[3]
local k = jkey(id)
if not owns(k, ARGV[4]) then return false end
redis.call('ZREM', base .. 'active', id)
redis.call('HDEL', k, 'lock_token', 'lock_expires_at')
local made = redis.call('HINCRBY', k, 'attempts_made', 1)
redis.call('HSET', k, 'last_error', ARGV[5])
local attempts = tonumber(redis.call('HGET', k, 'attempts'))
if ARGV[6] == '1' and made < attempts then
  local delay = tonumber(redis.call('HGET', k, 'backoff_delay'))
  if redis.call('HGET', k, 'backoff_type') == 'exponential' then
    delay = delay * (2 ^ (made - 1))
  end
  delay = math.min(delay, 9007199254740991)
  if delay > 0 then
    local at = int(now + delay)
    redis.call('HSET', k, 'status', 'delayed', 'available_at', at)
    redis.call('ZADD', base .. 'delayed', at, id)
  else
    redis.call('HSET', k, 'available_at', ARGV[2])
    push_waiting(id)
  end
  return {'retrying', made, delay}
end
if ARGV[7] == '1' then
  redis.call('DEL', k)
else
  redis.call('HSET', k, 'status', 'failed', 'finished_on', ARGV[2])
  redis.call('ZADD', base .. 'failed', ARGV[2], id)
end
return {'failed', made, 0}
"#;

/// ARGV[3]: max stalled count, ARGV[4]: remove on fail.
/// Rows are `{id, stalled_count, outcome, attempts_made}`.
const DETECT_STALLED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', base .. 'active', '-inf', ARGV[2])
local recovered = {}
for _, id in ipairs(expired) do
  redis.call('ZREM', base .. 'active', id)
  local k = jkey(id)
  if redis.call('EXISTS', k) == 1 then
    local count = redis.call('HINCRBY', k, 'stalled_count', 1)
    local made = tonumber(redis.call('HGET', k, 'attempts_made') or '0')
    redis.call('HDEL', k, 'lock_token', 'lock_expires_at')
    if count > tonumber(ARGV[3]) then
      if ARGV[4] == '1' then
        redis.call('DEL', k)
      else
        redis.call('HSET', k, 'status', 'failed', 'finished_on', ARGV[2],
          'last_error', 'job stalled more than allowable limit')
        redis.call('ZADD', base .. 'failed', ARGV[2], id)
      end
      table.insert(recovered, {id, count, 'failed', made})
    else
      push_waiting(id)
      table.insert(recovered, {id, count, 'requeued', made})
    end
  end
end
return recovered
"#;

/// ARGV[3]: id. Returns -1 if active, 0 if missing, 1 if removed.
const REMOVE: &str = r#"
local id = ARGV[3]
local status = redis.call('HGET', jkey(id), 'status')
if not status then return 0 end
if status == 'active' then return -1 end
unlink(id, status)
redis.call('DEL', jkey(id))
return 1
"#;

/// ARGV[3]: id. Returns -1 if active, 0 if missing, 2 if already waiting, 1 if retried.
const RETRY: &str = r#"
local id = ARGV[3]
local status = redis.call('HGET', jkey(id), 'status')
if not status then return 0 end
if status == 'active' then return -1 end
if status == 'waiting' then return 2 end
unlink(id, status)
reset_for_retry(id)
return 1
"#;

const RETRY_ALL_FAILED: &str = r#"
local ids = redis.call('ZRANGE', base .. 'failed', 0, -1)
redis.call('DEL', base .. 'failed')
local retried = 0
for _, id in ipairs(ids) do
  if redis.call('EXISTS', jkey(id)) == 1 then
    reset_for_retry(id)
    retried = retried + 1
  end
end
return retried
"#;

/// ARGV[3]: status set name, ARGV[4]: cutoff (ms).
const CLEAN: &str = r#"
local set = base .. ARGV[3]
local ids = redis.call('ZRANGEBYSCORE', set, '-inf', ARGV[4])
for _, id in ipairs(ids) do
  redis.call('DEL', jkey(id))
end
redis.call('ZREMRANGEBYSCORE', set, '-inf', ARGV[4])
return #ids
"#;

struct Scripts {
    enqueue: Script,
    lease: Script,
    extend_lock: Script,
    progress: Script,
    complete: Script,
    fail: Script,
    detect_stalled: Script,
    remove: Script,
    retry: Script,
    retry_all_failed: Script,
    clean: Script,
}

impl Scripts {
    fn load() -> Self {
        let script = |body: &str| Script::new(&format!("{}{}", PRELUDE, body));
        Self {
            enqueue: script(ENQUEUE),
            lease: script(LEASE),
            extend_lock: script(EXTEND_LOCK),
            progress: script(PROGRESS),
            complete: script(COMPLETE),
            fail: script(FAIL),
            detect_stalled: script(DETECT_STALLED),
            remove: script(REMOVE),
            retry: script(RETRY),
            retry_all_failed: script(RETRY_ALL_FAILED),
            clean: script(CLEAN),
        }
    }
}

/// Redis-backed [`QueueStore`]. The connection manager reconnects on its
/// own; commands issued while Redis is down fail with
/// [`QueueError::Unavailable`].
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

impl RedisStore {
    /// Connect to Redis and build a store using `prefix` for all keys.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(prefix = %prefix, "redis_store_connected");
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            scripts: Scripts::load(),
        }
    }

    fn base(&self, queue: &str) -> String {
        format!("{}:{}:", self.prefix, queue)
    }

    fn job_key(&self, queue: &str, id: &str) -> String {
        format!("{}job:{}", self.base(queue), id)
    }

    fn status_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}{}", self.base(queue), suffix)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(&self, queue: &str, job: NewJob) -> Result<bool, QueueError> {
        Ok(self.enqueue_bulk(queue, vec![job]).await? == 1)
    }

    async fn enqueue_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let specs = jobs
            .iter()
            .map(job_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let specs = serde_json::to_string(&specs)?;

        let mut conn = self.conn.clone();
        let added: usize = self
            .scripts
            .enqueue
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(specs)
            .invoke_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn lease(&self, queue: &str, lock_duration: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let token = new_lock_token();
        let id: Option<String> = self
            .scripts
            .lease
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(duration_ms(lock_duration))
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        match id {
            Some(id) => self.get_job(queue, &id).await,
            None => Ok(None),
        }
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend_lock
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .arg(token)
            .arg(duration_ms(lock_duration))
            .invoke_async(&mut conn)
            .await?;
        held(extended == 1, id)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .progress
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .arg(token)
            .arg(u32::from(progress.min(100)))
            .invoke_async(&mut conn)
            .await?;
        held(updated == 1, id)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        retention: Retention,
    ) -> Result<(), QueueError> {
        let (mode, keep) = match retention {
            Retention::KeepAll => ("keep", 0),
            Retention::RemoveImmediately => ("remove", 0),
            Retention::KeepLast(keep) => ("last", keep),
        };
        let mut conn = self.conn.clone();
        let completed: i64 = self
            .scripts
            .complete
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .arg(token)
            .arg(mode)
            .arg(keep)
            .invoke_async(&mut conn)
            .await?;
        held(completed == 1, id)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        error: &str,
        retryable: bool,
        remove_on_fail: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let outcome: Option<(String, u32, u64)> = self
            .scripts
            .fail
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .arg(token)
            .arg(error)
            .arg(if retryable { "1" } else { "0" })
            .arg(if remove_on_fail { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            Some((kind, attempts_made, delay)) if kind == "retrying" => Ok(FailOutcome::Retrying {
                attempts_made,
                delay: Duration::from_millis(delay),
            }),
            Some((_, attempts_made, _)) => Ok(FailOutcome::Failed { attempts_made }),
            None => Err(QueueError::LockMismatch(id.to_string())),
        }
    }

    async fn detect_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        remove_on_fail: bool,
    ) -> Result<Vec<StalledJob>, QueueError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, u32, String, u32)> = self
            .scripts
            .detect_stalled
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(max_stalled_count)
            .arg(if remove_on_fail { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, stalled_count, outcome, attempts_made)| StalledJob {
                id,
                stalled_count,
                attempts_made,
                outcome: if outcome == "failed" {
                    StalledOutcome::Failed
                } else {
                    StalledOutcome::Requeued
                },
            })
            .collect())
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.status_key(queue, "paused"), 1)
            .await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.status_key(queue, "paused")).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.status_key(queue, "paused")).await?)
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(queue, id)).await?;
        job_from_hash(fields)
    }

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        match removed {
            -1 => Err(QueueError::JobActive(id.to_string())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn retry_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let retried: i64 = self
            .scripts
            .retry
            .arg(self.base(queue))
            .arg(now_ms())
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        match retried {
            -1 => Err(QueueError::JobActive(id.to_string())),
            0 => Err(QueueError::NotFound(format!("job {}", id))),
            2 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn retry_all_failed(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let retried: usize = self
            .scripts
            .retry_all_failed
            .arg(self.base(queue))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(retried)
    }

    async fn jobs_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        if start > end {
            return Ok(Vec::new());
        }
        let key = self.status_key(queue, status.as_str());
        let start = isize::try_from(start).unwrap_or(isize::MAX);
        let stop = isize::try_from(end).unwrap_or(isize::MAX);

        let mut conn = self.conn.clone();
        let members: Vec<String> = if status.is_terminal() {
            conn.zrevrange(&key, start, stop).await?
        } else {
            conn.zrange(&key, start, stop).await?
        };
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for member in &members {
            let id = if status == JobStatus::Waiting {
                waiting_member_id(member)
            } else {
                member.as_str()
            };
            pipe.hgetall(self.job_key(queue, id));
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(records.len());
        for fields in records {
            if let Some(job) = job_from_hash(fields)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        status: JobStatus,
    ) -> Result<usize, QueueError> {
        ensure_cleanable(status)?;
        let now = now_ms();
        let cutoff = now.saturating_sub(duration_ms(grace));

        let mut conn = self.conn.clone();
        let removed: usize = self
            .scripts
            .clean
            .arg(self.base(queue))
            .arg(now)
            .arg(status.as_str())
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed, paused): (
            usize,
            usize,
            usize,
            usize,
            usize,
            bool,
        ) = redis::pipe()
            .zcard(self.status_key(queue, "waiting"))
            .zcard(self.status_key(queue, "active"))
            .zcard(self.status_key(queue, "delayed"))
            .zcard(self.status_key(queue, "completed"))
            .zcard(self.status_key(queue, "failed"))
            .exists(self.status_key(queue, "paused"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats::new(
            waiting, active, delayed, completed, failed, paused,
        ))
    }
}

fn held(ok: bool, id: &str) -> Result<(), QueueError> {
    if ok {
        Ok(())
    } else {
        Err(QueueError::LockMismatch(id.to_string()))
    }
}

/// Job fields as passed to the enqueue script.
fn job_spec(job: &NewJob) -> Result<Value, QueueError> {
    Ok(json!({
        "id": job.id,
        "data": serde_json::to_string(&job.data)?,
        "priority": job.opts.priority,
        "attempts": job.opts.attempts.max(1),
        "backoff_type": job.opts.backoff.kind(),
        "backoff_delay": job.opts.backoff.base_delay_ms(),
        "timeout_ms": job.opts.timeout_ms,
    }))
}

/// Strip the `"{seq:020}:"` ordering prefix from a waiting-set member.
fn waiting_member_id(member: &str) -> &str {
    member.get(WAIT_MEMBER_PREFIX_LEN..).unwrap_or(member)
}

/// Rebuild a job from its hash fields. An empty hash means no such job.
fn job_from_hash(fields: HashMap<String, String>) -> Result<Option<Job>, QueueError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let text = |name: &str| fields.get(name).map(String::as_str);
    let opt_num = |name: &str| text(name).and_then(|v| v.parse::<u64>().ok());
    let num = |name: &str| opt_num(name).unwrap_or(0);
    let small = |name: &str| u32::try_from(num(name)).unwrap_or(u32::MAX);

    let data = match text("data") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    let lock = match (text("lock_token"), opt_num("lock_expires_at")) {
        (Some(token), Some(expires_at)) => Some(Lock {
            token: token.to_string(),
            expires_at,
        }),
        _ => None,
    };

    Ok(Some(Job {
        id: text("id").unwrap_or_default().to_string(),
        data,
        opts: JobOptions {
            priority: small("priority"),
            attempts: small("attempts").max(1),
            backoff: Backoff::from_parts(
                text("backoff_type").unwrap_or("exponential"),
                num("backoff_delay"),
            ),
            timeout_ms: num("timeout_ms"),
        },
        status: text("status").unwrap_or("waiting").parse()?,
        attempts_made: small("attempts_made"),
        stalled_count: small("stalled_count"),
        progress: num("progress").min(100) as u8,
        seq: num("seq"),
        created_at: num("created_at"),
        processed_on: opt_num("processed_on"),
        finished_on: opt_num("finished_on"),
        available_at: num("available_at"),
        lock,
        last_error: text("last_error").map(str::to_string),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_job_from_empty_hash_is_none() {
        assert!(job_from_hash(HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_job_from_hash() {
        let job = job_from_hash(fields(&[
            ("id", "email-1"),
            ("data", r#"{"to":"a@example.com"}"#),
            ("priority", "5"),
            ("attempts", "3"),
            ("backoff_type", "exponential"),
            ("backoff_delay", "2000"),
            ("timeout_ms", "30000"),
            ("status", "active"),
            ("attempts_made", "1"),
            ("seq", "42"),
            ("created_at", "1700000000000"),
            ("processed_on", "1700000000500"),
            ("lock_token", "abc"),
            ("lock_expires_at", "1700000030500"),
            ("last_error", "smtp 421"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(job.id, "email-1");
        assert_eq!(job.data["to"], "a@example.com");
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.opts.priority, 5);
        assert_eq!(job.opts.backoff, Backoff::Exponential { delay: 2000 });
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.seq, 42);
        assert_eq!(job.processed_on, Some(1_700_000_000_500));
        assert_eq!(job.finished_on, None);
        assert_eq!(job.lock_token(), Some("abc"));
        assert_eq!(job.last_error.as_deref(), Some("smtp 421"));
    }

    #[test]
    fn test_job_from_hash_rejects_unknown_status() {
        let result = job_from_hash(fields(&[("id", "x"), ("status", "zombie")]));
        assert!(matches!(result, Err(QueueError::Unsupported(_))));
    }

    #[test]
    fn test_waiting_member_id() {
        let member = format!("{:020}:{}", 7, "campaign:c1:s1");
        assert_eq!(waiting_member_id(&member), "campaign:c1:s1");
    }

    #[test]
    fn test_job_spec_serializes_payload_as_string() {
        let spec = job_spec(&NewJob {
            id: "a".to_string(),
            data: json!({ "list": [] }),
            opts: JobOptions::default().with_priority(3),
        })
        .unwrap();

        assert_eq!(spec["data"], r#"{"list":[]}"#);
        assert_eq!(spec["priority"], 3);
        assert_eq!(spec["backoff_type"], "exponential");
    }
}
