//! Synchronization engine for tally.
//!
//! Mirrors an organization's contact fields, boundaries, contacts and poll
//! results from the remote platform into a local [`Store`], maintaining
//! delta counters as records change. Full-set kinds are diffed wholesale,
//! contacts are pulled incrementally behind a checkpoint, and poll runs are
//! resolved to one latest answer per respondent and question.
//!
//! [`Store`]: tally_storage::Store

pub mod config;
pub mod error;
pub mod jobs;
pub mod queries;
pub mod reconcile;
pub mod results;
pub mod squash;
pub mod syncer;

pub use config::{
    BackendConfig, ContactLabels, LockTiers, OrgConfig, OrgRegistry, PollConfig, SyncConfig,
    DEFAULT_MAX_RUNS_PER_PULL,
};
pub use error::{ClassificationError, SyncError, SyncResult};
pub use jobs::{
    contact_pull_lease, maybe_build_scheduler, results_pull_lease, ContactPullReport, JobOutcome,
    JobRunner, SQUASH_LEASE,
};
pub use queries::{boundaries_at_level, counter_values, country_boundaries};
pub use reconcile::{reconcile_full_set, reconcile_incremental, ChangeStreams, IncrementalReport};
pub use results::{pull_results, results_scope, PullStatus, ResultsReport, RunBudget};
pub use squash::{rebuild_contact_counts, squash_all, SquashReport, SQUASH_BATCH};
pub use syncer::{
    decide, BoundaryIndex, BoundarySyncer, ContactSyncer, Decision, FieldSyncer, Syncer,
};
