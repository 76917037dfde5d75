//! Process-local work queue with visibility timeouts.
//!
//! Each receive hides the message until `visible_at` and hands out a fresh
//! receipt; only the latest receipt can delete it. Receivers block on a
//! condvar until a message is visible or the long-poll wait runs out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use jobmesh_core::TaskMessage;
use tracing::debug;

use crate::config::{MAX_VISIBILITY_TIMEOUT, MAX_WAIT_TIME, QueueConfig};

use super::{Delivery, QueueError, ReceiptHandle, WorkQueue};

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    next_receipt: u64,
    /// Keyed by publish sequence so receives favour older messages.
    entries: BTreeMap<u64, Entry>,
}

/// In-memory work queue for tests/dev and embedded workers.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    visibility_timeout: Duration,
    state: Mutex<State>,
    ready: Condvar,
    available: AtomicBool,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default().visibility_timeout)
    }
}

impl InMemoryWorkQueue {
    /// `visibility_timeout` is capped at [`MAX_VISIBILITY_TIMEOUT`].
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout: visibility_timeout.min(MAX_VISIBILITY_TIMEOUT),
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.visibility_timeout)
    }

    /// Simulate a broker outage: while unavailable every call fails with
    /// `QueueError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages not yet deleted (visible or in flight).
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by an outstanding delivery.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|s| s.entries.values().filter(|e| e.visible_at > now).count())
            .unwrap_or(0)
    }

    /// Bodies of all undeleted messages, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.entries.values().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("in-memory queue marked unavailable".to_string()))
        }
    }

    fn take_visible(&self, state: &mut State, max: usize, now: Instant) -> Vec<Delivery> {
        let State {
            next_receipt,
            entries,
            ..
        } = state;

        let mut out = Vec::new();
        for (seq, entry) in entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            *next_receipt += 1;
            let receipt = format!("{seq}:{next_receipt}");
            entry.visible_at = now + self.visibility_timeout;
            entry.receipt = Some(receipt.clone());
            entry.receive_count += 1;
            out.push(Delivery {
                receipt: ReceiptHandle::new(receipt),
                message_id: entry.message_id.clone(),
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        out
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn publish(&self, message: &TaskMessage) -> Result<String, QueueError> {
        self.check_available()?;
        let body = serde_json::to_string(message)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut state = self.lock()?;
        state.next_seq += 1;
        let seq = state.next_seq;
        let message_id = format!("mem-{seq}");
        state.entries.insert(
            seq,
            Entry {
                message_id: message_id.clone(),
                body,
                visible_at: Instant::now(),
                receipt: None,
                receive_count: 0,
            },
        );
        drop(state);

        self.ready.notify_all();
        debug!(message_id = %message_id, task_id = %message.task_id, "message published");
        Ok(message_id)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        self.check_available()?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait.min(MAX_WAIT_TIME);
        let mut state = self.lock()?;
        loop {
            let now = Instant::now();
            let batch = self.take_visible(&mut state, max_messages, now);
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            // Wake up for the earliest of: deadline, next visibility expiry, publish.
            let next_visible = state
                .entries
                .values()
                .map(|e| e.visible_at)
                .filter(|t| *t > now)
                .min();
            let until = next_visible.map_or(deadline, |t| t.min(deadline));
            let (guard, _) = self
                .ready
                .wait_timeout(state, until.saturating_duration_since(now))
                .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.check_available()?;
        let expired = || QueueError::ReceiptExpired(receipt.to_string());

        let seq: u64 = receipt
            .as_str()
            .split_once(':')
            .and_then(|(seq, _)| seq.parse().ok())
            .ok_or_else(expired)?;

        let mut state = self.lock()?;
        let owns = state
            .entries
            .get(&seq)
            .is_some_and(|e| e.receipt.as_deref() == Some(receipt.as_str()));
        if !owns {
            return Err(expired());
        }
        state.entries.remove(&seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn message(i: u32) -> TaskMessage {
        TaskMessage {
            task_id: format!("job-task-{i}"),
            job_id: "job".to_string(),
            task_index: i,
            parameters: json!({}),
        }
    }

    #[test]
    fn received_message_is_hidden_until_deleted() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(30));
        q.publish(&message(0)).unwrap();

        let batch = q.receive(10, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(TaskMessage::parse(&batch[0].body).unwrap(), message(0));

        assert!(q.receive(10, Duration::ZERO).unwrap().is_empty());
        assert_eq!(q.in_flight(), 1);

        q.delete(&batch[0].receipt).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn receive_respects_batch_size_and_publish_order() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(30));
        for i in 0..5 {
            q.publish(&message(i)).unwrap();
        }
        let batch = q.receive(3, Duration::ZERO).unwrap();
        let ids: Vec<u32> = batch
            .iter()
            .map(|d| TaskMessage::parse(&d.body).unwrap().task_index)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(q.receive(10, Duration::ZERO).unwrap().len(), 2);
    }

    #[test]
    fn undeleted_message_is_redelivered_after_visibility_timeout() {
        let q = InMemoryWorkQueue::new(Duration::from_millis(50));
        q.publish(&message(0)).unwrap();

        let first = q.receive(1, Duration::ZERO).unwrap();
        assert_eq!(first.len(), 1);

        let second = q.receive(1, Duration::from_secs(2)).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);

        assert!(matches!(q.delete(&first[0].receipt), Err(QueueError::ReceiptExpired(_))));
        q.delete(&second[0].receipt).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn double_delete_reports_expired_receipt() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(30));
        q.publish(&message(0)).unwrap();
        let d = q.receive(1, Duration::ZERO).unwrap().remove(0);
        q.delete(&d.receipt).unwrap();
        assert!(matches!(q.delete(&d.receipt), Err(QueueError::ReceiptExpired(_))));
        assert!(matches!(
            q.delete(&ReceiptHandle::new("garbage")),
            Err(QueueError::ReceiptExpired(_))
        ));
    }

    #[test]
    fn long_poll_wakes_on_publish() {
        let q = Arc::new(InMemoryWorkQueue::new(Duration::from_secs(30)));
        let receiver = {
            let q = q.clone();
            thread::spawn(move || q.receive(1, Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        q.publish(&message(7)).unwrap();

        let batch = receiver.join().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn empty_long_poll_returns_after_wait() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(30));
        let started = Instant::now();
        assert!(q.receive(10, Duration::from_millis(30)).unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn oversized_durations_are_capped_instead_of_overflowing() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(u64::MAX));
        q.publish(&message(0)).unwrap();

        let batch = q.receive(1, Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(q.in_flight(), 1);
        assert!(q.receive(1, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn unavailable_queue_rejects_calls() {
        let q = InMemoryWorkQueue::new(Duration::from_secs(30));
        q.set_available(false);
        assert!(matches!(q.publish(&message(0)), Err(QueueError::Unavailable(_))));
        assert!(matches!(q.receive(1, Duration::ZERO), Err(QueueError::Unavailable(_))));
        q.set_available(true);
        assert!(q.publish(&message(0)).is_ok());
    }
}
