//! Lease-guarded sync jobs: the contact pull, results pulls, counter squash
//! and counter rebuild, plus the cron scheduler that fires them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tally_adapters::{load_country_boundaries, RemoteBackend, StaticPages};
use tally_core::{Boundary, ContactField, OrgId, SyncReport};
use tally_storage::{HttpFetcher, RecordStore, Store};
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{OrgConfig, OrgRegistry, SyncConfig};
use crate::reconcile::{
    reconcile_full_set, reconcile_incremental, ChangeStreams, IncrementalReport,
};
use crate::results::{pull_results, PullStatus, ResultsReport, RunBudget};
use crate::squash::{rebuild_contact_counts, squash_all, SquashReport, SQUASH_BATCH};
use crate::syncer::{BoundaryIndex, BoundarySyncer, ContactSyncer, FieldSyncer};

pub const SQUASH_LEASE: &str = "squash-counters";

pub fn contact_pull_lease(org: OrgId) -> String {
    format!("contact-pull:{org}")
}

pub fn results_pull_lease(org: OrgId, flow: &str) -> String {
    format!("poll-pull-results:{org}:{flow}")
}

/// What a lease-guarded job did this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Ran(T),
    /// Another holder had the lease; nothing was done.
    Skipped,
    /// Work was done but the window is not finished yet.
    Paused(T),
}

impl<T> JobOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::Skipped)
    }
}

/// Per-kind reports of one contact pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactPullReport {
    pub fields: SyncReport,
    pub boundaries: SyncReport,
    pub contacts: IncrementalReport,
}

/// Runs sync jobs for the organizations of one registry against one store.
pub struct JobRunner<St> {
    store: Arc<St>,
    config: SyncConfig,
    registry: OrgRegistry,
    http: Arc<HttpFetcher>,
}

impl<St: Store> JobRunner<St> {
    pub fn new(store: Arc<St>, config: SyncConfig, registry: OrgRegistry) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client()).context("building http fetcher")?;
        Ok(Self {
            store,
            config,
            registry,
            http: Arc::new(http),
        })
    }

    /// Loads the registry from `config.orgs_path()`.
    pub async fn from_config(store: Arc<St>, config: SyncConfig) -> Result<Self> {
        let registry = OrgRegistry::load(&config.orgs_path()).await?;
        Self::new(store, config, registry)
    }

    pub fn registry(&self) -> &OrgRegistry {
        &self.registry
    }

    fn org(&self, org: OrgId) -> Result<&OrgConfig> {
        self.registry
            .get(org)
            .ok_or_else(|| anyhow!("org {org} is not in the registry"))
    }

    fn backend(&self, org: &OrgConfig) -> Result<Arc<dyn RemoteBackend>> {
        org.remote_backend(&self.http, &self.config.workspace_root)
    }

    /// Lease key and TTL shared by the contact pull and the counter rebuild.
    fn contact_pull_lease_for(&self, org: OrgId) -> (String, Duration) {
        (contact_pull_lease(org), self.config.lock_tiers.contact_pull)
    }

    /// Runs `body` while holding the lease `key`. Returns `None` without
    /// running it when the lease is busy. The lease is released whether or
    /// not `body` succeeds.
    async fn with_lease<T, F, Fut>(&self, key: &str, ttl: Duration, body: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(lease) = self.store.try_acquire(key, ttl).await? else {
            warn!(lease = key, "lease busy; skipping job");
            return Ok(None);
        };
        let result = body().await;
        if let Err(err) = self.store.release(&lease).await {
            warn!(lease = key, error = %err, "failed to release lease; it will expire");
        }
        result.map(Some)
    }

    /// Pulls fields, then boundaries, then contacts for one organization.
    pub async fn pull_contacts(&self, org: OrgId) -> Result<JobOutcome<ContactPullReport>> {
        let org_config = self.org(org)?;
        let (key, ttl) = self.contact_pull_lease_for(org);
        let span = info_span!("sync_job", %org, kind = "contacts");
        let outcome = self
            .with_lease(&key, ttl, || self.contact_pull_body(org_config))
            .instrument(span)
            .await?;
        Ok(outcome.map_or(JobOutcome::Skipped, JobOutcome::Ran))
    }

    async fn contact_pull_body(&self, org_config: &OrgConfig) -> Result<ContactPullReport> {
        let org = org_config.id;
        let store = &*self.store;
        let backend = self.backend(org_config)?;
        let started = Instant::now();

        let fields = reconcile_full_set(&FieldSyncer, store, org, &*backend.fields()).await?;
        info!(%org, kind = "fields", %fields, "full-set pull finished");

        let boundaries = if org_config.is_global {
            let path = self.config.countries_path();
            let countries = load_country_boundaries(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            let source = StaticPages::single(countries);
            reconcile_full_set(&BoundarySyncer, store, org, &source).await?
        } else {
            reconcile_full_set(&BoundarySyncer, store, org, &*backend.boundaries()).await?
        };
        info!(%org, kind = "boundaries", %boundaries, "full-set pull finished");

        let local_boundaries: Vec<Boundary> = RecordStore::<Boundary>::load_all(store, org).await?;
        let local_fields: Vec<ContactField> = RecordStore::<ContactField>::load_all(store, org)
            .await?
            .into_iter()
            .filter(|field| field.is_active)
            .collect();
        let syncer = ContactSyncer::new(
            org_config.reporter_group.clone(),
            org_config.labels.clone(),
            org_config.is_global,
            BoundaryIndex::build(&local_boundaries),
            &local_fields,
        );
        let open_streams = |window| ChangeStreams {
            changed: backend.contacts_changed(window),
            deleted: backend.contacts_deleted(window),
        };
        let contacts = reconcile_incremental(&syncer, store, org, Utc::now(), open_streams).await?;
        info!(
            %org,
            kind = "contacts",
            report = %contacts.report,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "contact pull finished"
        );

        Ok(ContactPullReport {
            fields,
            boundaries,
            contacts,
        })
    }

    /// Pulls the results of one configured poll, resuming a paused window.
    pub async fn pull_poll_results(
        &self,
        org: OrgId,
        flow: &str,
    ) -> Result<JobOutcome<ResultsReport>> {
        let org_config = self.org(org)?;
        let poll = org_config
            .polls
            .iter()
            .find(|poll| poll.flow == flow)
            .ok_or_else(|| anyhow!("org {org} has no poll for flow {flow}"))?;
        let key = results_pull_lease(org, flow);
        let ttl = self.config.lock_tiers.results;
        let span = info_span!("sync_job", %org, kind = "poll-results", flow);

        let outcome = self
            .with_lease(&key, ttl, || async move {
                let backend = self.backend(org_config)?;
                let budget = RunBudget::for_lease(self.config.max_runs_per_pull, ttl);
                let started = Instant::now();
                let outcome =
                    pull_results(&*self.store, &*backend, org, poll, Utc::now(), budget).await?;
                info!(
                    %org,
                    flow,
                    report = %outcome.report,
                    runs = outcome.runs,
                    status = ?outcome.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "results pull finished"
                );
                Ok(outcome)
            })
            .instrument(span)
            .await?;

        Ok(match outcome {
            None => JobOutcome::Skipped,
            Some(report) if report.status == PullStatus::Paused => JobOutcome::Paused(report),
            Some(report) => JobOutcome::Ran(report),
        })
    }

    /// Pulls every configured poll of `org`. A failing poll is logged and
    /// does not stop the others.
    pub async fn pull_all_results(
        &self,
        org: OrgId,
    ) -> Result<Vec<(String, JobOutcome<ResultsReport>)>> {
        let flows: Vec<String> = self.org(org)?.polls.iter().map(|p| p.flow.clone()).collect();
        let mut outcomes = Vec::with_capacity(flows.len());
        for flow in flows {
            match self.pull_poll_results(org, &flow).await {
                Ok(outcome) => outcomes.push((flow, outcome)),
                Err(err) => warn!(%org, flow = %flow, error = %format!("{err:#}"), "results pull failed"),
            }
        }
        Ok(outcomes)
    }

    /// Folds every pending delta row into the squashed totals.
    pub async fn squash(&self) -> Result<JobOutcome<SquashReport>> {
        let span = info_span!("sync_job", kind = "squash");
        let outcome = self
            .with_lease(SQUASH_LEASE, self.config.lock_tiers.global, || async move {
                let started = Instant::now();
                let report = squash_all(&*self.store, SQUASH_BATCH).await?;
                info!(
                    scopes = report.scopes,
                    rows = report.rows,
                    clamped = report.clamped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "squash finished"
                );
                Ok(report)
            })
            .instrument(span)
            .await?;
        Ok(outcome.map_or(JobOutcome::Skipped, JobOutcome::Ran))
    }

    /// Recomputes the contact counters of `org`. Holds the contact-pull lease
    /// so no pull changes contacts during the recount.
    pub async fn rebuild_counts(&self, org: OrgId) -> Result<JobOutcome<BTreeMap<String, i64>>> {
        self.org(org)?;
        let (key, ttl) = self.contact_pull_lease_for(org);
        let span = info_span!("sync_job", %org, kind = "rebuild-counts");
        let outcome = self
            .with_lease(&key, ttl, || async move {
                let applied = rebuild_contact_counts(&*self.store, org).await?;
                info!(%org, corrected = applied.len(), "contact counters rebuilt");
                Ok(applied)
            })
            .instrument(span)
            .await?;
        Ok(outcome.map_or(JobOutcome::Skipped, JobOutcome::Ran))
    }

    async fn run_contact_pulls(&self) {
        for org in self.registry.orgs.iter().map(|o| o.id) {
            if let Err(err) = self.pull_contacts(org).await {
                warn!(%org, error = %format!("{err:#}"), "scheduled contact pull failed");
            }
        }
    }

    async fn run_results_pulls(&self) {
        for org in self.registry.orgs.iter().map(|o| o.id) {
            if let Err(err) = self.pull_all_results(org).await {
                warn!(%org, error = %format!("{err:#}"), "scheduled results pull failed");
            }
        }
    }

    async fn run_squash(&self) {
        if let Err(err) = self.squash().await {
            warn!(error = %format!("{err:#}"), "scheduled squash failed");
        }
    }
}

#[derive(Clone, Copy)]
enum ScheduledJob {
    Contacts,
    Results,
    Squash,
}

/// Builds a scheduler firing contact pulls, results pulls and squash passes
/// on the configured crons, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler<St: Store>(
    runner: Arc<JobRunner<St>>,
) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        (runner.config.contacts_cron.clone(), ScheduledJob::Contacts),
        (runner.config.results_cron.clone(), ScheduledJob::Results),
        (runner.config.squash_cron.clone(), ScheduledJob::Squash),
    ];
    for (cron, which) in crons {
        let runner = Arc::clone(&runner);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                match which {
                    ScheduledJob::Contacts => runner.run_contact_pulls().await,
                    ScheduledJob::Results => runner.run_results_pulls().await,
                    ScheduledJob::Squash => runner.run_squash().await,
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ContactLabels, PollConfig};
    use tally_storage::{LockService, MemoryStore};

    fn registry(dir: &std::path::Path) -> OrgRegistry {
        OrgRegistry {
            orgs: vec![OrgConfig {
                id: OrgId(7),
                name: "Test".into(),
                backend: BackendConfig::Fixtures {
                    dir: dir.to_path_buf(),
                },
                is_global: false,
                reporter_group: "Reporters".into(),
                labels: ContactLabels::default(),
                polls: vec![PollConfig {
                    flow: "F1".into(),
                    questions: Vec::new(),
                }],
            }],
        }
    }

    #[test]
    fn lease_keys_are_scoped() {
        assert_eq!(contact_pull_lease(OrgId(3)), "contact-pull:3");
        assert_eq!(results_pull_lease(OrgId(3), "F1"), "poll-pull-results:3:F1");
    }

    #[tokio::test]
    async fn busy_leases_skip_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner =
            JobRunner::new(Arc::clone(&store), SyncConfig::default(), registry(dir.path()))
                .unwrap();

        let held = store
            .try_acquire(&contact_pull_lease(OrgId(7)), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(runner.pull_contacts(OrgId(7)).await.unwrap().is_skipped());
        assert!(runner.rebuild_counts(OrgId(7)).await.unwrap().is_skipped());
        store.release(&held).await.unwrap();

        let outcome = runner.pull_contacts(OrgId(7)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Ran(_)));
        assert!(store
            .try_acquire(&contact_pull_lease(OrgId(7)), Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn contact_pull_lease_outlives_a_long_first_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner =
            JobRunner::new(Arc::clone(&store), SyncConfig::default(), registry(dir.path()))
                .unwrap();
        let (key, ttl) = runner.contact_pull_lease_for(OrgId(7));
        assert_eq!(ttl, Duration::from_secs(12 * 60 * 60));

        let ran = runner
            .with_lease(&key, ttl, || async {
                tokio::time::advance(Duration::from_secs(45 * 60)).await;
                let second = store.try_acquire(&key, ttl).await?;
                Ok::<_, anyhow::Error>(second.is_none())
            })
            .await
            .unwrap();
        assert_eq!(ran, Some(true));

        let held = store.try_acquire(&key, ttl).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(3 * 60 * 60)).await;
        assert!(runner.pull_contacts(OrgId(7)).await.unwrap().is_skipped());
        store.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_orgs_and_polls_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(
            Arc::new(MemoryStore::new()),
            SyncConfig::default(),
            registry(dir.path()),
        )
        .unwrap();
        assert!(runner.pull_contacts(OrgId(99)).await.is_err());
        assert!(runner.pull_poll_results(OrgId(7), "F9").await.is_err());
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(
            Arc::new(MemoryStore::new()),
            SyncConfig::default(),
            registry(dir.path()),
        )
        .unwrap();
        assert!(maybe_build_scheduler(Arc::new(runner)).await.unwrap().is_none());
    }
}
