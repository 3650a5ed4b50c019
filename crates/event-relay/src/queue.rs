// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed queue client.
//!
//! Queues carry messages between relay instances without a persistent broker. A read claims up
//! to N entries and hides them from other readers for the visibility timeout; the reader then
//! acknowledges exactly that batch with the returned [`DeleteKey`]. A batch that is never
//! acknowledged becomes readable again once the timeout expires, which gives at-least-once
//! delivery with possible duplicates.
//!
//! [`QueueBackend`] is the seam to the external queue service. [`MemoryQueueStore`] implements it
//! in memory; clones share state, so several relays in one process see the same queues.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::errors::QueueError;

/// Entry of a remote queue: the id of the instance that produced the envelope, and the envelope.
/// Serialized as a two element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEnvelope(pub String, pub Envelope);

/// Acknowledges one claimed batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeleteKey(String);

impl DeleteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeleteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entries claimed by one read. `delete_key` is `None` when nothing was claimed.
#[derive(Debug)]
pub struct ReadBatch<T> {
    pub items: Vec<T>,
    pub delete_key: Option<DeleteKey>,
}

impl<T> ReadBatch<T> {
    pub fn empty() -> Self {
        ReadBatch {
            items: Vec::new(),
            delete_key: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueues a value. It is silently discarded if nobody reads it before `expiration`.
    async fn add(
        &self,
        queue: &str,
        value: Value,
        expiration: Duration,
        priority: i64,
    ) -> Result<(), QueueError>;

    /// Claims up to `count` entries, waiting at most `wait_timeout` for some to become
    /// available (`None` returns immediately). Returns an empty batch rather than an error when
    /// nothing is available.
    async fn read(
        &self,
        queue: &str,
        count: usize,
        all_or_nothing: bool,
        wait_timeout: Option<Duration>,
        visibility_timeout: Duration,
    ) -> Result<ReadBatch<Value>, QueueError>;

    /// Permanently deletes the batch claimed under `key`.
    async fn remove(&self, queue: &str, key: &DeleteKey) -> Result<(), QueueError>;
}

#[derive(Debug)]
struct Claim {
    key: DeleteKey,
    visible_at: Instant,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    value: Value,
    priority: i64,
    expires_at: Instant,
    claim: Option<Claim>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
}

enum Claimed {
    Batch(ReadBatch<Value>),
    /// Nothing claimable. Carries the instant at which a claimed entry becomes visible again.
    Nothing(Option<Instant>),
}

impl QueueState {
    fn claim(
        &mut self,
        count: usize,
        all_or_nothing: bool,
        visibility_timeout: Duration,
        now: Instant,
    ) -> Claimed {
        self.entries.retain(|entry| entry.expires_at > now);
        for entry in &mut self.entries {
            if entry.claim.as_ref().is_some_and(|c| c.visible_at <= now) {
                entry.claim = None;
            }
        }

        let mut visible: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.claim.is_none())
            .map(|(index, _)| index)
            .collect();

        if visible.is_empty() || (all_or_nothing && visible.len() < count) {
            let next_visible = self
                .entries
                .iter()
                .filter_map(|entry| entry.claim.as_ref().map(|c| c.visible_at))
                .min();
            return Claimed::Nothing(next_visible);
        }

        visible.sort_by(|&a, &b| {
            let (a, b) = (&self.entries[a], &self.entries[b]);
            b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
        });
        visible.truncate(count);

        let key = DeleteKey(uuid::Uuid::new_v4().to_string());
        let items = visible
            .into_iter()
            .map(|index| {
                let entry = &mut self.entries[index];
                entry.claim = Some(Claim {
                    key: key.clone(),
                    visible_at: now + visibility_timeout,
                });
                entry.value.clone()
            })
            .collect();

        Claimed::Batch(ReadBatch {
            items,
            delete_key: Some(key),
        })
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    queues: Mutex<HashMap<String, QueueState>>,
    added: Notify,
}

/// In-memory queue service. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    inner: Arc<StoreInner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries on `queue`, claimed or not, excluding expired ones.
    pub fn len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(queue)
            .map(|state| state.entries.iter().filter(|e| e.expires_at > now).count())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        // A panic while holding the lock leaves the map structurally valid.
        self.inner
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn try_claim(
        &self,
        queue: &str,
        count: usize,
        all_or_nothing: bool,
        visibility_timeout: Duration,
    ) -> Claimed {
        let mut queues = self.lock();
        match queues.get_mut(queue) {
            Some(state) => state.claim(count, all_or_nothing, visibility_timeout, Instant::now()),
            None => Claimed::Nothing(None),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueStore {
    async fn add(
        &self,
        queue: &str,
        value: Value,
        expiration: Duration,
        priority: i64,
    ) -> Result<(), QueueError> {
        {
            let mut queues = self.lock();
            let state = queues.entry(queue.to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry {
                seq,
                value,
                priority,
                expires_at: Instant::now() + expiration,
                claim: None,
            });
        }
        self.inner.added.notify_waiters();
        Ok(())
    }

    async fn read(
        &self,
        queue: &str,
        count: usize,
        all_or_nothing: bool,
        wait_timeout: Option<Duration>,
        visibility_timeout: Duration,
    ) -> Result<ReadBatch<Value>, QueueError> {
        if count == 0 {
            return Ok(ReadBatch::empty());
        }
        let deadline = wait_timeout.map(|wait| Instant::now() + wait);

        loop {
            // Register for wakeups before looking, so an add between the check and the wait is
            // not missed.
            let added = self.inner.added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            let next_visible =
                match self.try_claim(queue, count, all_or_nothing, visibility_timeout) {
                    Claimed::Batch(batch) => return Ok(batch),
                    Claimed::Nothing(next_visible) => next_visible,
                };

            let Some(deadline) = deadline else {
                return Ok(ReadBatch::empty());
            };
            if Instant::now() >= deadline {
                return Ok(ReadBatch::empty());
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, added).await;
        }
    }

    async fn remove(&self, queue: &str, key: &DeleteKey) -> Result<(), QueueError> {
        let mut queues = self.lock();
        if let Some(state) = queues.get_mut(queue) {
            let before = state.entries.len();
            state
                .entries
                .retain(|entry| entry.claim.as_ref().map_or(true, |c| &c.key != key));
            debug!(
                "RELAY | Removed {} entries from queue {queue}",
                before - state.entries.len()
            );
        }
        Ok(())
    }
}

/// Typed client bound to one queue.
pub struct QueueClient<T> {
    name: String,
    backend: Arc<dyn QueueBackend>,
    visibility_timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for QueueClient<T> {
    fn clone(&self) -> Self {
        QueueClient {
            name: self.name.clone(),
            backend: Arc::clone(&self.backend),
            visibility_timeout: self.visibility_timeout,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for QueueClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueClient")
            .field("name", &self.name)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

impl<T> QueueClient<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        visibility_timeout: Duration,
    ) -> Self {
        QueueClient {
            name: name.into(),
            backend,
            visibility_timeout,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add(
        &self,
        value: &T,
        expiration: Duration,
        priority: i64,
    ) -> Result<(), QueueError> {
        let value = serde_json::to_value(value)?;
        self.backend
            .add(&self.name, value, expiration, priority)
            .await
    }

    /// Claims up to `count` entries. Values that fail to decode are logged and skipped; they stay
    /// part of the claimed batch, so acknowledging it discards them.
    pub async fn read(
        &self,
        count: usize,
        all_or_nothing: bool,
        wait_timeout: Option<Duration>,
    ) -> Result<ReadBatch<T>, QueueError> {
        let batch = self
            .backend
            .read(
                &self.name,
                count,
                all_or_nothing,
                wait_timeout,
                self.visibility_timeout,
            )
            .await?;

        let items = batch
            .items
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("RELAY | Discarding undecodable entry on {}: {e}", self.name);
                    None
                }
            })
            .collect();

        Ok(ReadBatch {
            items,
            delete_key: batch.delete_key,
        })
    }

    pub async fn remove(&self, key: &DeleteKey) -> Result<(), QueueError> {
        self.backend.remove(&self.name, key).await
    }
}
