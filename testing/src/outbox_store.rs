//! In-memory outbox store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use outbox_core::outbox::{
    AtomicWrite, ClaimRequest, OutboxError, OutboxRecord, OutboxStore, ResolvedRecord,
    apply_resolution,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct StoreState {
    states: HashMap<(String, String), serde_json::Value>,
    records: Vec<OutboxRecord>,
    next_position: i64,
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail the next commit after staging this many records.
    commit_after_records: Option<usize>,
    claim: bool,
    resolve: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: StoreState,
    faults: Faults,
}

/// Transactional outbox store backed by a mutex-guarded vector.
///
/// Every operation runs under one lock, which gives the same guarantees the SQL
/// store gets from transactions and `FOR UPDATE SKIP LOCKED`. Failures can be
/// injected into the next commit, claim or resolve.
///
/// # Example
///
/// ```
/// use outbox_testing::InMemoryOutboxStore;
///
/// let store = InMemoryOutboxStore::new();
/// store.fail_next_commit_after(1);
/// assert!(store.records().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after it staged `records` outbox rows.
    ///
    /// The state row is always staged first, so any value simulates a failure
    /// in the middle of the transaction.
    pub fn fail_next_commit_after(&self, records: usize) {
        self.inner.lock().unwrap().faults.commit_after_records = Some(records);
    }

    /// Make the next claim fail.
    pub fn fail_next_claim(&self) {
        self.inner.lock().unwrap().faults.claim = true;
    }

    /// Make the next resolve fail.
    pub fn fail_next_resolve(&self) {
        self.inner.lock().unwrap().faults.resolve = true;
    }

    /// Snapshot of every record in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().unwrap().state.records.clone()
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.inner
            .lock()
            .unwrap()
            .state
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Latest state document of an aggregate.
    #[must_use]
    pub fn state_of(&self, aggregate_type: &str, aggregate_id: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .state
            .states
            .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
            .cloned()
    }

    /// Modify a stored record in place, e.g. to age a lease.
    pub fn update_record(&self, id: Uuid, update: impl FnOnce(&mut OutboxRecord)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.state.records.iter_mut().find(|r| r.id == id) {
            update(record);
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().state.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit_now(&self, write: AtomicWrite) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().unwrap();
        let fail_after = inner.faults.commit_after_records.take();

        // Stage on a copy; only a complete transaction replaces the live state.
        let mut staged = inner.state.clone();
        staged.states.insert(
            (write.state.aggregate_type, write.state.aggregate_id),
            write.state.state,
        );
        for (index, record) in write.records.into_iter().enumerate() {
            if fail_after == Some(index) {
                return Err(OutboxError::DatabaseError(
                    "injected failure during commit".to_string(),
                ));
            }
            if staged.records.iter().any(|r| r.id == record.id) {
                return Err(OutboxError::DatabaseError(format!(
                    "duplicate key value violates unique constraint: {}",
                    record.id
                )));
            }
            staged.next_position += 1;
            let position = staged.next_position;
            staged.records.push(record.into_pending(position));
        }
        if fail_after.is_some() {
            return Err(OutboxError::DatabaseError(
                "injected failure during commit".to_string(),
            ));
        }

        inner.state = staged;
        Ok(())
    }

    fn claim_now(&self, request: &ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.faults.claim) {
            return Err(OutboxError::DatabaseError(
                "injected failure during claim".to_string(),
            ));
        }

        let stale_before = request.stale_before();
        let records = &inner.state.records;
        let mut candidates: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_claimable(request.now, stale_before))
            .filter(|(_, r)| {
                !records
                    .iter()
                    .any(|earlier| earlier.holds_back(r, request.now, stale_before))
            })
            .map(|(index, _)| index)
            .collect();
        candidates.sort_by_key(|&index| {
            let r = &inner.state.records[index];
            (r.occurred_at, r.position)
        });
        candidates.truncate(request.batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for index in candidates {
            let record = &mut inner.state.records[index];
            record.locked_at = Some(request.now);
            record.locked_by = Some(request.worker_id.clone());
            claimed.push(record.clone());
        }
        Ok(claimed)
    }

    fn resolve_now(&self, worker_id: &str, outcomes: &[ResolvedRecord]) -> Result<usize, OutboxError> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.faults.resolve) {
            return Err(OutboxError::DatabaseError(
                "injected failure during resolve".to_string(),
            ));
        }

        let mut updated = 0;
        for resolved in outcomes {
            let Some(record) = inner.state.records.iter_mut().find(|r| r.id == resolved.id) else {
                continue;
            };
            let still_ours = record.locked_by.as_deref() == Some(worker_id);
            if still_ours && !record.status().is_terminal() {
                apply_resolution(record, resolved);
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn pending_now(&self, limit: usize) -> Vec<OutboxRecord> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<OutboxRecord> = inner
            .state
            .records
            .iter()
            .filter(|r| !r.status().is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.occurred_at, r.position));
        pending.truncate(limit);
        pending
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn commit(
        &self,
        write: AtomicWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move { self.commit_now(write) })
    }

    fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, OutboxError>> + Send + '_>>
    {
        let state = self.state_of(aggregate_type, aggregate_id);
        Box::pin(async move { Ok(state) })
    }

    fn claim_batch(
        &self,
        request: ClaimRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move { self.claim_now(&request) })
    }

    fn resolve(
        &self,
        worker_id: &str,
        outcomes: Vec<ResolvedRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, OutboxError>> + Send + '_>> {
        let worker_id = worker_id.to_string();
        Box::pin(async move { self.resolve_now(&worker_id, &outcomes) })
    }

    fn get(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.record(id)) })
    }

    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.pending_now(limit)) })
    }
}
