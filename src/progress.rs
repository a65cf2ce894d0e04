//! Progress record lifecycle and the diff-based push protocol.
//!
//! ## Why poll-and-diff instead of real push?
//!
//! The backing record store is an external port with plain get/create/
//! update operations and no native change notification. Each subscriber
//! therefore runs a small poll loop that re-reads its record on a fixed
//! interval and forwards a snapshot **only when it structurally differs**
//! from the last one pushed — subscribers never see redundant events. The
//! trade-off is up to one poll interval of added latency and one store
//! read per idle subscriber per interval, which is acceptable at low
//! subscriber counts and is explicitly not a scalability guarantee.
//!
//! The poll loop lives inside the returned [`Stream`]: dropping the stream
//! (client disconnect) cancels the loop with it, so no orphaned polling
//! task can survive its subscriber.
//!
//! Increments are additive and commutative. Concurrent item workers need
//! no ordering between them; a reader may observe a stale but
//! monotonically non-decreasing `current` between polls.

use crate::error::LedgerLensError;
use chrono::{DateTime, Utc};
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::Stream;
use tracing::debug;

/// One tracked unit of work: a batch of documents under a single id.
///
/// Lifecycle: `current == 0, total == 0` on creation; `total` is fixed
/// when the batch is accepted; `current` rises to `total` as items are
/// accounted for. Completion is exactly `current == total && total > 0`.
/// There is no failure state — per-item failures live in `data` and are
/// surfaced through normal snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub id: String,
    pub owner_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub current: u32,
    pub total: u32,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(owner_id: &str, id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            kind: kind.to_string(),
            current: 0,
            total: 0,
            data: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current == self.total
    }
}

/// Outcome of one batch item, appended to the record's `data.items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub item_index: usize,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Succeeded,
    Failed,
}

/// Absolute field overwrites for [`ProgressTracker::update`].
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub current: Option<u32>,
    pub total: Option<u32>,
    pub data: Option<Value>,
}

/// Port to the external record store.
///
/// Implementations must make each operation atomic with respect to the
/// others; beyond that no ordering is required, because the only
/// concurrent mutation path (`increment`, `append_report`) is commutative.
#[async_trait::async_trait]
pub trait ProgressStore: Send + Sync {
    /// Point-in-time read, scoped to the owner: a caller querying another
    /// owner's id observes "not found".
    async fn get(&self, owner_id: &str, id: &str) -> Option<ProgressRecord>;

    /// First writer wins: if a record with this owner/id already exists it
    /// is returned unchanged and the argument is discarded.
    async fn create(&self, record: ProgressRecord) -> ProgressRecord;

    /// Overwrite the given fields. Returns the updated record, or `None`
    /// if it does not exist.
    async fn set_fields(
        &self,
        owner_id: &str,
        id: &str,
        patch: ProgressPatch,
    ) -> Option<ProgressRecord>;

    /// Add `amount` to `current`, clamped to `total` once a total is set.
    async fn increment(&self, owner_id: &str, id: &str, amount: u32) -> Option<ProgressRecord>;

    /// Append one item report to the `data.items` array.
    async fn append_report(
        &self,
        owner_id: &str,
        id: &str,
        report: ItemReport,
    ) -> Option<ProgressRecord>;
}

/// In-memory [`ProgressStore`], the default for a single process and the
/// backing store used throughout the test suite.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<(String, String), ProgressRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a record. Owner-triggered cleanup is external to the
    /// tracker; this exists for embedders and tests.
    pub fn remove(&self, owner_id: &str, id: &str) {
        let mut records = self.records.lock().expect("store lock poisoned");
        records.remove(&(owner_id.to_string(), id.to_string()));
    }
}

#[async_trait::async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, owner_id: &str, id: &str) -> Option<ProgressRecord> {
        let records = self.records.lock().expect("store lock poisoned");
        records.get(&(owner_id.to_string(), id.to_string())).cloned()
    }

    async fn create(&self, record: ProgressRecord) -> ProgressRecord {
        let mut records = self.records.lock().expect("store lock poisoned");
        records
            .entry((record.owner_id.clone(), record.id.clone()))
            .or_insert(record)
            .clone()
    }

    async fn set_fields(
        &self,
        owner_id: &str,
        id: &str,
        patch: ProgressPatch,
    ) -> Option<ProgressRecord> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let record = records.get_mut(&(owner_id.to_string(), id.to_string()))?;
        if let Some(current) = patch.current {
            record.current = current;
        }
        if let Some(total) = patch.total {
            record.total = total;
        }
        if let Some(data) = patch.data {
            record.data = data;
        }
        Some(record.clone())
    }

    async fn increment(&self, owner_id: &str, id: &str, amount: u32) -> Option<ProgressRecord> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let record = records.get_mut(&(owner_id.to_string(), id.to_string()))?;
        record.current = if record.total > 0 {
            (record.current + amount).min(record.total)
        } else {
            record.current + amount
        };
        Some(record.clone())
    }

    async fn append_report(
        &self,
        owner_id: &str,
        id: &str,
        report: ItemReport,
    ) -> Option<ProgressRecord> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let record = records.get_mut(&(owner_id.to_string(), id.to_string()))?;
        if !record.data.is_object() {
            record.data = json!({ "items": [] });
        }
        let items = record
            .data
            .as_object_mut()
            .expect("data is an object")
            .entry("items")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(array) = items.as_array_mut() {
            array.push(serde_json::to_value(&report).expect("report serialises"));
        }
        Some(record.clone())
    }
}

/// The snapshot shape pushed to subscribers.
///
/// Identical to [`ProgressRecord`] minus `ownerId`, which is an access
/// scope, not subscriber-facing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub id: String,
    pub current: u32,
    pub total: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current == self.total
    }
}

impl From<ProgressRecord> for ProgressSnapshot {
    fn from(record: ProgressRecord) -> Self {
        Self {
            id: record.id,
            current: record.current,
            total: record.total,
            kind: record.kind,
            data: record.data,
            created_at: record.created_at,
        }
    }
}

/// One event on a subscriber's stream.
///
/// Serialises to the wire shape directly: a snapshot body, or
/// `{"error":"Not found"}` when the record vanished before completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Snapshot(ProgressSnapshot),
    Error { error: String },
}

/// A boxed stream of progress events for one subscriber.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Owns progress record lifecycle and subscriber streams.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    poll_interval: Duration,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Return the existing record unchanged, or create a fresh one.
    /// Never resets an in-progress record.
    pub async fn get_or_create(&self, owner_id: &str, id: &str, kind: &str) -> ProgressRecord {
        self.store
            .create(ProgressRecord::new(owner_id, id, kind))
            .await
    }

    /// Additive, commutative increment; safe under interleaved callers.
    pub async fn increment(
        &self,
        owner_id: &str,
        id: &str,
        amount: u32,
    ) -> Option<ProgressRecord> {
        self.store.increment(owner_id, id, amount).await
    }

    /// Absolute overwrite of the given fields.
    pub async fn update(
        &self,
        owner_id: &str,
        id: &str,
        patch: ProgressPatch,
    ) -> Option<ProgressRecord> {
        self.store.set_fields(owner_id, id, patch).await
    }

    /// Owner-scoped point-in-time snapshot.
    pub async fn read(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<ProgressRecord, LedgerLensError> {
        self.store
            .get(owner_id, id)
            .await
            .ok_or_else(|| LedgerLensError::ProgressNotFound { id: id.to_string() })
    }

    /// Record one item's outcome in the record's data payload.
    pub async fn append_report(
        &self,
        owner_id: &str,
        id: &str,
        report: ItemReport,
    ) -> Option<ProgressRecord> {
        self.store.append_report(owner_id, id, report).await
    }

    /// Subscribe to a record, creating it if needed.
    ///
    /// The stream pushes the current snapshot immediately, then one event
    /// per observed change. On `current == total > 0` it pushes the final
    /// snapshot and closes; if the record disappears first it pushes a
    /// single `{"error":"Not found"}` and closes. Dropping the stream
    /// stops the polling loop at once.
    pub async fn subscribe(&self, owner_id: &str, id: &str, kind: &str) -> ProgressStream {
        let initial: ProgressSnapshot = self.get_or_create(owner_id, id, kind).await.into();
        debug!("Subscriber attached to progress '{}'", id);

        struct PollState {
            store: Arc<dyn ProgressStore>,
            owner_id: String,
            id: String,
            interval: Duration,
            pending_first: Option<ProgressSnapshot>,
            last: Option<ProgressSnapshot>,
            done: bool,
        }

        let state = PollState {
            store: Arc::clone(&self.store),
            owner_id: owner_id.to_string(),
            id: id.to_string(),
            interval: self.poll_interval,
            pending_first: Some(initial),
            last: None,
            done: false,
        };

        let stream = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let snapshot = match st.pending_first.take() {
                    Some(first) => Some(first),
                    None => {
                        tokio::time::sleep(st.interval).await;
                        st.store
                            .get(&st.owner_id, &st.id)
                            .await
                            .map(ProgressSnapshot::from)
                    }
                };

                let Some(snapshot) = snapshot else {
                    // Deleted externally before completion: one diagnostic
                    // event, then the stream closes.
                    st.done = true;
                    return Some((
                        ProgressEvent::Error {
                            error: "Not found".to_string(),
                        },
                        st,
                    ));
                };

                let complete = snapshot.is_complete();
                if st.last.as_ref() != Some(&snapshot) {
                    st.last = Some(snapshot.clone());
                    if complete {
                        st.done = true;
                    }
                    return Some((ProgressEvent::Snapshot(snapshot), st));
                }
                if complete {
                    // Final snapshot already pushed on a previous poll.
                    st.done = true;
                    return None;
                }
            }
        });

        Box::pin(stream)
    }
}
