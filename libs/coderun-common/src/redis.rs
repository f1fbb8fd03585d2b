use crate::queue::{Broker, Delivery, QueueError, TaskMessage};
use crate::store::{ExecutionStore, ExecutionUpdate, StoreError, Transition};
use crate::types::{CodeSession, Execution, ExecutionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Redis key layout - shared by API and worker so neither side drifts
///
/// pending   LIST  messages ready for delivery (RPUSH in, LMOVE out)
/// active    LIST  per worker, messages currently being processed
/// scheduled ZSET  retries, scored by ready-at unix millis
/// archived  LIST  messages that exhausted retries or must not be retried

pub const KEY_PREFIX: &str = "coderun";
pub const PENDING_KEY: &str = "coderun:queue:pending";
pub const SCHEDULED_KEY: &str = "coderun:queue:scheduled";
pub const ARCHIVED_KEY: &str = "coderun:queue:archived";

const FORWARD_BATCH: usize = 100;

/// Active list owned by one worker process
pub fn active_key(worker: &str) -> String {
    format!("{}:queue:active:{}", KEY_PREFIX, worker)
}

pub fn execution_key(id: &Uuid) -> String {
    format!("{}:execution:{}", KEY_PREFIX, id)
}

pub fn session_key(id: &Uuid) -> String {
    format!("{}:session:{}", KEY_PREFIX, id)
}

// Compare-and-set over the execution hash.
// ARGV: new status, updated_at, n allowed predecessors, predecessors..., field/value pairs...
const TRANSITION_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
  return {-1, ''}
end
local allowed = tonumber(ARGV[3])
local ok = false
for i = 4, 3 + allowed do
  if ARGV[i] == current then ok = true end
end
if not ok then
  return {0, current}
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[2])
for i = 4 + allowed, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return {1, current}
"#;

const FORWARD_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, msg in ipairs(due) do
  redis.call('ZREM', KEYS[1], msg)
  redis.call('RPUSH', KEYS[2], msg)
end
return #due
"#;

const RECOVER_LUA: &str = r#"
local n = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
  n = n + 1
end
return n
"#;

fn execution_fields(execution: &Execution) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", execution.id.to_string()),
        ("status", execution.status.as_str().to_string()),
        ("created_at", execution.created_at.to_rfc3339()),
        ("updated_at", execution.updated_at.to_rfc3339()),
    ];
    if let Some(session_id) = execution.session_id {
        fields.push(("session_id", session_id.to_string()));
    }
    if let Some(stdout) = &execution.stdout {
        fields.push(("stdout", stdout.clone()));
    }
    if let Some(stderr) = &execution.stderr {
        fields.push(("stderr", stderr.clone()));
    }
    if let Some(ms) = execution.execution_time_ms {
        fields.push(("execution_time_ms", ms.to_string()));
    }
    fields
}

fn parse_execution(id: Uuid, mut fields: HashMap<String, String>) -> Result<Execution, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let status: ExecutionStatus = fields
        .get("status")
        .ok_or_else(|| corrupt("missing status".to_string()))?
        .parse()
        .map_err(corrupt)?;

    let timestamp = |fields: &HashMap<String, String>, name: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw = fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing {}", name)))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("{}: {}", name, e)))
    };
    let created_at = timestamp(&fields, "created_at")?;
    let updated_at = timestamp(&fields, "updated_at")?;

    let session_id = fields
        .get("session_id")
        .map(|raw| Uuid::parse_str(raw).map_err(|e| corrupt(format!("session_id: {}", e))))
        .transpose()?;
    let execution_time_ms = fields
        .get("execution_time_ms")
        .map(|raw| {
            raw.parse::<i16>()
                .map_err(|e| corrupt(format!("execution_time_ms: {}", e)))
        })
        .transpose()?;

    Ok(Execution {
        id,
        session_id,
        status,
        stdout: fields.remove("stdout"),
        stderr: fields.remove("stderr"),
        execution_time_ms,
        created_at,
        updated_at,
    })
}

/// Create the `Queued` execution record and enqueue its task in one
/// MULTI/EXEC, so a task never exists without its record.
pub async fn submit_execution(
    conn: &mut ConnectionManager,
    execution: &Execution,
    message: &TaskMessage,
) -> Result<(), QueueError> {
    let payload = serde_json::to_string(message)?;
    let fields = execution_fields(execution);

    let _: () = redis::pipe()
        .atomic()
        .hset_multiple(execution_key(&execution.id), fields.as_slice())
        .ignore()
        .rpush(PENDING_KEY, payload)
        .ignore()
        .query_async(conn)
        .await?;

    Ok(())
}

pub async fn save_session(conn: &mut ConnectionManager, session: &CodeSession) -> RedisResult<()> {
    let payload = serde_json::to_string(session).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })?;
    conn.set(session_key(&session.id), payload).await
}

pub async fn get_session(conn: &mut ConnectionManager, id: &Uuid) -> RedisResult<Option<CodeSession>> {
    let payload: Option<String> = conn.get(session_key(id)).await?;

    match payload {
        Some(data) => {
            let session: CodeSession = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
            })?;
            Ok(Some(session))
        }
        None => Ok(None),
    }
}

/// Execution records kept as Redis hashes.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    transition_script: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            transition_script: Script::new(TRANSITION_LUA),
        }
    }
}

#[async_trait]
impl ExecutionStore for RedisStore {
    async fn get(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(execution_key(&id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_execution(id, fields).map(Some)
    }

    async fn transition(&self, id: Uuid, update: ExecutionUpdate) -> Result<Transition, StoreError> {
        let mut conn = self.conn.clone();
        let predecessors = update.status.predecessors();

        let mut invocation = self.transition_script.key(execution_key(&id));
        invocation
            .arg(update.status.as_str())
            .arg(Utc::now().to_rfc3339())
            .arg(predecessors.len());
        for status in predecessors {
            invocation.arg(status.as_str());
        }
        if let Some(output) = &update.output {
            invocation
                .arg("stdout")
                .arg(&output.stdout)
                .arg("stderr")
                .arg(&output.stderr)
                .arg("execution_time_ms")
                .arg(output.execution_time_ms as i64);
        }

        let (code, current): (i64, String) = invocation.invoke_async(&mut conn).await?;
        match code {
            -1 => Ok(Transition::Missing),
            code => {
                let current: ExecutionStatus = current
                    .parse()
                    .map_err(|reason| StoreError::Corrupt { id, reason })?;
                if code == 1 {
                    Ok(Transition::Applied { from: current })
                } else {
                    Ok(Transition::Rejected { current })
                }
            }
        }
    }
}

/// Reliable list-based broker. Each worker process owns one active list.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    active: String,
    forward_script: Script,
    recover_script: Script,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, worker: &str) -> Self {
        Self {
            conn,
            active: active_key(worker),
            forward_script: Script::new(FORWARD_LUA),
            recover_script: Script::new(RECOVER_LUA),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        loop {
            // LMOVE rather than BLMOVE: the connection is multiplexed across
            // every worker task and a blocking pop would stall them all.
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(PENDING_KEY)
                .arg(&self.active)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;

            let Some(raw) = raw else {
                return Ok(None);
            };

            match serde_json::from_str::<TaskMessage>(&raw) {
                Ok(message) => return Ok(Some(Delivery { message, raw })),
                Err(e) => {
                    warn!(error = %e, "Unreadable queue message, archiving");
                    let _: () = redis::pipe()
                        .atomic()
                        .lrem(&self.active, 1, &raw)
                        .ignore()
                        .rpush(ARCHIVED_KEY, &raw)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(&self.active, 1, &delivery.raw).await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let next = serde_json::to_string(&delivery.message.next_attempt(error))?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.active, 1, &delivery.raw)
            .ignore()
            .zadd(SCHEDULED_KEY, next, ready_at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn archive(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut message = delivery.message.clone();
        message.last_error = Some(error.to_string());
        let archived = serde_json::to_string(&message)?;

        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.active, 1, &delivery.raw)
            .ignore()
            .rpush(ARCHIVED_KEY, archived)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn forward_scheduled(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .forward_script
            .key(SCHEDULED_KEY)
            .key(PENDING_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(FORWARD_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .recover_script
            .key(&self.active)
            .key(PENDING_KEY)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}
