//! In-process implementation of every store contract.
//!
//! All state sits behind one `tokio::sync::Mutex`, so each call is atomic
//! with respect to every other call. Lease expiry uses `tokio::time::Instant`
//! and therefore follows paused test clocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{
    Boundary, Contact, ContactField, CounterDelta, LocalRecord, OrgId, ResolvedAnswer,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    floored_total, CheckpointStore, CounterScope, CounterStore, Lease, LockService, RecordStore,
    ResumeState, SquashResult, StoreResult,
};

pub type Table<R> = BTreeMap<(OrgId, String), R>;

#[derive(Debug, Clone)]
struct DeltaRow {
    scope: CounterScope,
    count: i64,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    fields: Table<ContactField>,
    boundaries: Table<Boundary>,
    contacts: Table<Contact>,
    answers: Table<ResolvedAnswer>,
    checkpoints: HashMap<(OrgId, String), DateTime<Utc>>,
    resumes: HashMap<(OrgId, String), ResumeState>,
    leases: HashMap<String, (String, Instant)>,
    deltas: Vec<DeltaRow>,
    totals: BTreeMap<CounterScope, i64>,
}

impl MemoryState {
    fn append_deltas(&mut self, org: OrgId, deltas: &[CounterDelta]) {
        self.deltas.extend(
            deltas
                .iter()
                .filter(|d| d.count != 0)
                .map(|d| DeltaRow {
                    scope: CounterScope::new(org, d.key.clone()),
                    count: d.count,
                }),
        );
    }
}

/// Record types that have a table in [`MemoryStore`].
pub trait MemoryTable: LocalRecord {
    fn table(state: &mut MemoryState) -> &mut Table<Self>;
}

impl MemoryTable for ContactField {
    fn table(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.fields
    }
}

impl MemoryTable for Boundary {
    fn table(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.boundaries
    }
}

impl MemoryTable for Contact {
    fn table(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.contacts
    }
}

impl MemoryTable for ResolvedAnswer {
    fn table(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.answers
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delta rows not yet squashed, across all organizations.
    pub async fn pending_delta_rows(&self) -> usize {
        self.state.lock().await.deltas.len()
    }
}

#[async_trait]
impl<R: MemoryTable> RecordStore<R> for MemoryStore {
    async fn load(&self, org: OrgId, key: &str) -> StoreResult<Option<R>> {
        let mut state = self.state.lock().await;
        Ok(R::table(&mut state).get(&(org, key.to_string())).cloned())
    }

    async fn load_many(&self, org: OrgId, keys: &[String]) -> StoreResult<Vec<R>> {
        let mut state = self.state.lock().await;
        let table = R::table(&mut state);
        let unique: BTreeSet<&String> = keys.iter().collect();
        Ok(unique
            .into_iter()
            .filter_map(|key| table.get(&(org, key.clone())).cloned())
            .collect())
    }

    async fn load_all(&self, org: OrgId) -> StoreResult<Vec<R>> {
        let mut state = self.state.lock().await;
        Ok(R::table(&mut state)
            .iter()
            .filter(|((record_org, _), _)| *record_org == org)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn save_batch(
        &self,
        org: OrgId,
        records: &[R],
        deltas: &[CounterDelta],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let table = R::table(&mut state);
        for record in records {
            table.insert((record.org_id(), record.natural_key()), record.clone());
        }
        state.append_deltas(org, deltas);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn checkpoint(&self, org: OrgId, scope: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(&(org, scope.to_string())).copied())
    }

    async fn set_checkpoint(
        &self,
        org: OrgId,
        scope: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.checkpoints.insert((org, scope.to_string()), at);
        Ok(())
    }

    async fn resume_state(&self, org: OrgId, scope: &str) -> StoreResult<Option<ResumeState>> {
        let state = self.state.lock().await;
        Ok(state.resumes.get(&(org, scope.to_string())).cloned())
    }

    async fn set_resume_state(
        &self,
        org: OrgId,
        scope: &str,
        resume: &ResumeState,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.resumes.insert((org, scope.to_string()), resume.clone());
        Ok(())
    }

    async fn clear_resume_state(&self, org: OrgId, scope: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.resumes.remove(&(org, scope.to_string()));
        Ok(())
    }
}

#[async_trait]
impl LockService for MemoryStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let lease = Lease::new(key, ttl);
        state
            .leases
            .insert(key.to_string(), (lease.holder.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(&lease.key)
            .is_some_and(|(holder, _)| *holder == lease.holder)
        {
            state.leases.remove(&lease.key);
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn append(&self, org: OrgId, deltas: &[CounterDelta]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.append_deltas(org, deltas);
        Ok(())
    }

    async fn counts(&self, org: OrgId, prefix: Option<&str>) -> StoreResult<BTreeMap<String, i64>> {
        let state = self.state.lock().await;
        let matches = |scope: &CounterScope| {
            scope.org_id == org && prefix.is_none_or(|p| scope.key.starts_with(p))
        };
        let mut counts = BTreeMap::new();
        for row in state.deltas.iter().filter(|row| matches(&row.scope)) {
            *counts.entry(row.scope.key.clone()).or_insert(0) += row.count;
        }
        for (scope, total) in state.totals.iter().filter(|(scope, _)| matches(scope)) {
            *counts.entry(scope.key.clone()).or_insert(0) += *total;
        }
        Ok(counts)
    }

    async fn unsquashed_scopes(
        &self,
        after: Option<&CounterScope>,
        limit: usize,
    ) -> StoreResult<Vec<CounterScope>> {
        let state = self.state.lock().await;
        let distinct: BTreeSet<&CounterScope> = state
            .deltas
            .iter()
            .map(|row| &row.scope)
            .filter(|scope| after.is_none_or(|a| *scope > a))
            .collect();
        Ok(distinct.into_iter().take(limit).cloned().collect())
    }

    async fn squash(&self, scope: &CounterScope) -> StoreResult<SquashResult> {
        let mut state = self.state.lock().await;
        let mut rows = 0usize;
        let mut delta = 0i64;
        state.deltas.retain(|row| {
            if row.scope == *scope {
                rows += 1;
                delta += row.count;
                false
            } else {
                true
            }
        });
        let existing = state.totals.get(scope).copied().unwrap_or_default();
        let (total, clamped) = floored_total(existing, delta);
        if total == 0 {
            state.totals.remove(scope);
        } else {
            state.totals.insert(scope.clone(), total);
        }
        Ok(SquashResult {
            rows,
            delta,
            total,
            clamped,
        })
    }
}
