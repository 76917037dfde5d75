//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `jobmesh:tasks` (one entry per published task message)
//! - **Consumer Group**: `jobmesh.workers`, shared by every worker so each
//!   entry goes to one consumer at a time
//! - **Consumers**: one per worker (the worker id)
//!
//! The visibility window maps onto the pending entries list: an entry read
//! but not acknowledged for longer than the window is claimed by the next
//! consumer that polls (`XPENDING` + `XCLAIM`). Deleting acknowledges and
//! removes the entry (`XACK` + `XDEL`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jobmesh_core::TaskMessage;
use tracing::{debug, instrument, warn};

use crate::config::{MAX_VISIBILITY_TIMEOUT, MAX_WAIT_TIME, QueueConfig};

use super::{Delivery, QueueError, ReceiptHandle, WorkQueue};

#[derive(Debug, Clone)]
pub struct RedisStreamsWorkQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group_name: String,
    consumer_name: String,
    visibility_timeout: Duration,
}

impl RedisStreamsWorkQueue {
    /// Create a queue handle and make sure the consumer group exists.
    ///
    /// `consumer_name` must be unique per worker process.
    pub fn new(config: &QueueConfig, consumer_name: impl Into<String>) -> Result<Self, QueueError> {
        let redis_url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| QueueError::Unavailable("REDIS_URL is not set".to_string()))?;
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {e}")))?;

        let queue = Self {
            client: Arc::new(client),
            stream_key: config.stream_key.clone(),
            group_name: config.consumer_group.clone(),
            consumer_name: consumer_name.into(),
            visibility_timeout: config.visibility_timeout.min(MAX_VISIBILITY_TIMEOUT),
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(format!("redis connection error: {e}")))
    }

    /// Ensure the consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;

        // MKSTREAM creates the stream; BUSYGROUP means the group already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Unavailable(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Claim entries another consumer read but never acknowledged within the window.
    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("-")
            .arg("+")
            .arg(count.saturating_mul(4).max(count))
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;

        let min_idle_ms = self.visibility_timeout.as_millis() as u64;
        let mut delivered: HashMap<String, u64> = HashMap::new();
        let stale: Vec<String> = pending
            .into_iter()
            .filter(|(_, _, idle_ms, _)| *idle_ms >= min_idle_ms)
            .take(count)
            .map(|(id, _, _, times)| {
                delivered.insert(id.clone(), times);
                id
            })
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks idle time, so a racing consumer cannot double-claim.
        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(&self.consumer_name)
            .arg(min_idle_ms)
            .arg(&stale[..])
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XCLAIM failed: {e}")))?;

        let deliveries = parse_entries(claimed)
            .into_iter()
            .map(|(message_id, fields)| {
                let previous = delivered.get(&message_id).copied().unwrap_or(1);
                self.to_delivery(message_id, fields, previous.saturating_add(1))
            })
            .collect::<Vec<_>>();

        if !deliveries.is_empty() {
            warn!(
                count = deliveries.len(),
                consumer = %self.consumer_name,
                "reclaimed messages past their visibility timeout"
            );
        }
        Ok(deliveries)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group_name)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would block forever; a zero wait means "don't block".
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.min(MAX_WAIT_TIME).as_millis() as u64);
        }
        let reply: redis::Value = cmd
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;

        // Reply: [[stream_key, [entry, ...]], ...] or nil on timeout.
        let streams = match reply {
            redis::Value::Bulk(streams) => streams,
            _ => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() == 2 {
                    let entries = parts.remove(1);
                    out.extend(
                        parse_entries(entries)
                            .into_iter()
                            .map(|(id, fields)| self.to_delivery(id, fields, 1)),
                    );
                }
            }
        }
        Ok(out)
    }

    fn to_delivery(
        &self,
        message_id: String,
        mut fields: HashMap<String, String>,
        receive_count: u64,
    ) -> Delivery {
        Delivery {
            receipt: ReceiptHandle::new(message_id.clone()),
            message_id,
            // A missing body surfaces to the worker as a malformed message.
            body: fields.remove("body").unwrap_or_default(),
            receive_count: u32::try_from(receive_count).unwrap_or(u32::MAX),
        }
    }
}

/// Parse `[[id, [field, value, ...]], ...]`, skipping entries deleted since they were read.
fn parse_entries(value: redis::Value) -> Vec<(String, HashMap<String, String>)> {
    let entries = match value {
        redis::Value::Bulk(entries) => entries,
        _ => return Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let parts = match entry {
                redis::Value::Bulk(parts) if parts.len() == 2 => parts,
                _ => return None,
            };
            let id = match &parts[0] {
                redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
                _ => return None,
            };
            let raw_fields = match &parts[1] {
                redis::Value::Bulk(v) => v,
                _ => return None,
            };
            let fields = raw_fields
                .chunks(2)
                .filter_map(|chunk| match chunk {
                    [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                        String::from_utf8_lossy(k).to_string(),
                        String::from_utf8_lossy(v).to_string(),
                    )),
                    _ => None,
                })
                .collect();
            Some((id, fields))
        })
        .collect()
}

impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(
        skip(self, message),
        fields(stream_key = %self.stream_key, task_id = %message.task_id),
        err
    )]
    fn publish(&self, message: &TaskMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(message)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("task_id")
            .arg(&message.task_id)
            .arg("job_id")
            .arg(&message.job_id)
            .arg("body")
            .arg(&body)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))?;
        Ok(id)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let reclaimed = self.claim_stale(&mut conn, max_messages)?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let fresh = self.read_new(&mut conn, max_messages, wait)?;
        debug!(count = fresh.len(), consumer = %self.consumer_name, "read from stream");
        Ok(fresh)
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection()?;

        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(receipt.as_str())
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XACK failed: {e}")))?;

        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt.as_str())
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XDEL failed: {e}")))?;

        if acked == 0 {
            return Err(QueueError::ReceiptExpired(receipt.to_string()));
        }
        Ok(())
    }
}
