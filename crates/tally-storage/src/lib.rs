//! Local persistence for tally: record tables, sync checkpoints, leases and
//! delta counters, plus the HTTP fetch utilities used to reach the remote
//! platform.
//!
//! Every contract is an object-safe `async_trait` so jobs can hold stores
//! behind `Arc`. [`MemoryStore`] backs tests and single-process runs;
//! [`PgStore`] is the shared store used by a pool of workers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{
    Boundary, Contact, ContactField, CounterDelta, LocalRecord, OrgId, ResolvedAnswer,
};

pub mod error;
pub mod http;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use http::{FetchError, HttpClientConfig, HttpFetcher, RetryPolicy, TokenBucketConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence of one local record kind, keyed by `(organization, natural key)`.
#[async_trait]
pub trait RecordStore<R: LocalRecord>: Send + Sync {
    /// Loads the record with the given natural key, active or retired.
    async fn load(&self, org: OrgId, key: &str) -> StoreResult<Option<R>>;

    /// Loads every record among `keys` that exists; missing keys are skipped.
    async fn load_many(&self, org: OrgId, keys: &[String]) -> StoreResult<Vec<R>>;

    /// Loads every record of the organization, active or retired.
    async fn load_all(&self, org: OrgId) -> StoreResult<Vec<R>>;

    /// Upserts `records` and appends `deltas` for `org` as one atomic unit.
    async fn save_batch(
        &self,
        org: OrgId,
        records: &[R],
        deltas: &[CounterDelta],
    ) -> StoreResult<()>;
}

/// A paused window of an incremental pull, resumable from `cursor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub cursor: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: DateTime<Utc>,
}

/// Durable "pulled changes up to here" watermarks per `(organization, scope)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(&self, org: OrgId, scope: &str) -> StoreResult<Option<DateTime<Utc>>>;

    async fn set_checkpoint(&self, org: OrgId, scope: &str, at: DateTime<Utc>)
        -> StoreResult<()>;

    async fn resume_state(&self, org: OrgId, scope: &str) -> StoreResult<Option<ResumeState>>;

    async fn set_resume_state(
        &self,
        org: OrgId,
        scope: &str,
        state: &ResumeState,
    ) -> StoreResult<()>;

    async fn clear_resume_state(&self, org: OrgId, scope: &str) -> StoreResult<()>;
}

/// A held, time-bounded mutual-exclusion grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

/// Named, TTL-bounded leases. Acquisition never blocks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Returns `None` when another holder has an unexpired lease on `key`.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>>;

    /// Releases `lease` if it is still held by the same holder.
    async fn release(&self, lease: &Lease) -> StoreResult<()>;
}

/// Dimension key of one counter within an organization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterScope {
    pub org_id: OrgId,
    pub key: String,
}

impl CounterScope {
    pub fn new(org_id: OrgId, key: impl Into<String>) -> Self {
        Self {
            org_id,
            key: key.into(),
        }
    }
}

/// What one single-key squash step did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SquashResult {
    /// Delta rows folded into the total.
    pub rows: usize,
    /// Sum of the folded delta rows.
    pub delta: i64,
    /// Squashed total after the step.
    pub total: i64,
    /// Whether the total was floored at zero.
    pub clamped: bool,
}

/// Append-only delta counters with a squashed running total per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Appends delta rows; safe for any number of concurrent writers.
    async fn append(&self, org: OrgId, deltas: &[CounterDelta]) -> StoreResult<()>;

    /// Sum of unsquashed delta rows plus the squashed total, per key.
    async fn counts(&self, org: OrgId, prefix: Option<&str>) -> StoreResult<BTreeMap<String, i64>>;

    /// Distinct scopes with at least one delta row, ordered, strictly after `after`.
    async fn unsquashed_scopes(
        &self,
        after: Option<&CounterScope>,
        limit: usize,
    ) -> StoreResult<Vec<CounterScope>>;

    /// Atomically folds every delta row of `scope` into its squashed total,
    /// flooring the total at zero.
    async fn squash(&self, scope: &CounterScope) -> StoreResult<SquashResult>;
}

/// Everything the sync jobs need from one backend.
pub trait Store:
    RecordStore<ContactField>
    + RecordStore<Boundary>
    + RecordStore<Contact>
    + RecordStore<ResolvedAnswer>
    + CheckpointStore
    + LockService
    + CounterStore
    + 'static
{
}

impl<T> Store for T where
    T: RecordStore<ContactField>
        + RecordStore<Boundary>
        + RecordStore<Contact>
        + RecordStore<ResolvedAnswer>
        + CheckpointStore
        + LockService
        + CounterStore
        + 'static
{
}

/// Folds an existing total and a delta sum, flooring at zero.
pub(crate) fn floored_total(existing: i64, delta: i64) -> (i64, bool) {
    let raw = existing.saturating_add(delta);
    if raw < 0 {
        (0, true)
    } else {
        (raw, false)
    }
}
