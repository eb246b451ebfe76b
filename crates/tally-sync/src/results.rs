//! Poll results ingestion: pulls a flow's runs inside a time window and
//! resolves them into one current answer per respondent and question.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_adapters::{RemoteBackend, TimeWindow};
use tally_core::records::truncate_answer_text;
use tally_core::remote::{RemoteRun, RunValue};
use tally_core::{Contact, LocalRecord, OrgId, ResolvedAnswer, SyncOutcome, SyncReport};
use tally_storage::{CheckpointStore, RecordStore, ResumeState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::error::SyncResult;
use crate::reconcile::ChangeSet;

/// Checkpoint scope of one poll's results pull.
pub fn results_scope(flow: &str) -> String {
    format!("poll-results:{flow}")
}

/// Limits on how much one invocation may ingest before pausing.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    max_runs: usize,
    deadline: Instant,
}

impl RunBudget {
    pub fn new(max_runs: usize, time_limit: Duration) -> Self {
        Self {
            max_runs,
            deadline: Instant::now() + time_limit,
        }
    }

    /// Stops at 80% of the lease TTL so the pause is recorded while the
    /// lease is still held.
    pub fn for_lease(max_runs: usize, lease_ttl: Duration) -> Self {
        Self::new(max_runs, lease_ttl.mul_f64(0.8))
    }

    pub fn exhausted(&self, runs: usize) -> bool {
        runs >= self.max_runs || Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// The window was drained and the checkpoint advanced.
    Completed,
    /// The budget ran out or the remote throttled; a resume cursor was kept.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultsReport {
    pub report: SyncReport,
    pub runs: usize,
    pub window: TimeWindow,
    pub status: PullStatus,
}

/// Whether an answer recorded at `incoming` supersedes one recorded at
/// `existing`. An answer without a time never supersedes a stored one.
fn is_newer(incoming: Option<DateTime<Utc>>, existing: Option<DateTime<Utc>>) -> bool {
    match (incoming, existing) {
        (Some(incoming), Some(existing)) => incoming > existing,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn answer_from(
    org: OrgId,
    poll: &PollConfig,
    run: &RemoteRun,
    value: &RunValue,
    contact: Option<&Contact>,
) -> ResolvedAnswer {
    ResolvedAnswer {
        org_id: org,
        flow: poll.flow.clone(),
        question: value.node.clone(),
        respondent: run.contact.uuid.clone(),
        category: value.category.clone(),
        text: value.value.as_deref().map(truncate_answer_text),
        answered_at: value.time,
        completed: run.completed(),
        state: None,
        district: None,
        ward: None,
        gender: None,
        born: None,
        scheme: None,
    }
    .with_snapshot(contact)
}

/// Answer steps of `run` that count for `poll`.
fn tracked_values<'a>(
    poll: &'a PollConfig,
    run: &'a RemoteRun,
) -> impl Iterator<Item = &'a RunValue> {
    run.ordered_values()
        .into_iter()
        .filter(|value| value.category.is_some() && poll.tracks(&value.node))
}

/// Resolves one page of runs into answer writes and counter deltas.
async fn ingest_page<St>(
    store: &St,
    org: OrgId,
    poll: &PollConfig,
    runs: &[RemoteRun],
    report: &mut SyncReport,
) -> SyncResult<()>
where
    St: RecordStore<ResolvedAnswer> + RecordStore<Contact> + ?Sized,
{
    let mut respondents: Vec<String> = runs.iter().map(|run| run.contact.uuid.clone()).collect();
    respondents.sort();
    respondents.dedup();
    let contacts: HashMap<String, Contact> =
        RecordStore::<Contact>::load_many(store, org, &respondents)
            .await?
            .into_iter()
            .map(|contact| (contact.uuid.clone(), contact))
            .collect();

    let mut identities: Vec<String> = runs
        .iter()
        .flat_map(|run| {
            tracked_values(poll, run).map(move |value| {
                ResolvedAnswer::identity_key(&poll.flow, &value.node, &run.contact.uuid)
            })
        })
        .collect();
    identities.sort();
    identities.dedup();
    let existing: HashMap<String, ResolvedAnswer> =
        RecordStore::<ResolvedAnswer>::load_many(store, org, &identities)
            .await?
            .into_iter()
            .map(|answer| (answer.natural_key(), answer))
            .collect();

    // identity -> (stored before this page, latest seen in this page)
    let mut pending: HashMap<String, (Option<ResolvedAnswer>, ResolvedAnswer)> = HashMap::new();
    for run in runs {
        let contact = contacts.get(&run.contact.uuid);
        for value in tracked_values(poll, run) {
            let incoming = answer_from(org, poll, run, value, contact);
            let identity = incoming.natural_key();
            let current_time = match pending.get(&identity) {
                Some((_, current)) => Some(current.answered_at),
                None => existing.get(&identity).map(|answer| answer.answered_at),
            };
            let outcome = match current_time {
                None => {
                    pending.insert(identity, (None, incoming));
                    SyncOutcome::Created
                }
                Some(current) if is_newer(incoming.answered_at, current) => {
                    let original = match pending.remove(&identity) {
                        Some((original, _)) => original,
                        None => existing.get(&identity).cloned(),
                    };
                    pending.insert(identity, (original, incoming));
                    SyncOutcome::Updated
                }
                Some(_) => SyncOutcome::Ignored,
            };
            report.record(outcome);
        }
    }

    let mut changes = ChangeSet::<ResolvedAnswer>::new();
    for (original, current) in pending.into_values() {
        changes.push(original.as_ref(), current);
    }
    changes.flush(store, org).await?;
    Ok(())
}

/// Pulls one poll's runs, resuming a paused window when one is stored.
///
/// The checkpoint moves to the window end only once the last page is
/// ingested. When the budget runs out or the remote rate limits, the next
/// page cursor is stored and the pull reports [`PullStatus::Paused`].
pub async fn pull_results<St>(
    store: &St,
    backend: &dyn RemoteBackend,
    org: OrgId,
    poll: &PollConfig,
    now: DateTime<Utc>,
    budget: RunBudget,
) -> SyncResult<ResultsReport>
where
    St: RecordStore<ResolvedAnswer> + RecordStore<Contact> + CheckpointStore + ?Sized,
{
    let scope = results_scope(&poll.flow);
    let (window, mut cursor) = match store.resume_state(org, &scope).await? {
        Some(state) => {
            debug!(%org, flow = %poll.flow, cursor = %state.cursor, "resuming paused results pull");
            let window = TimeWindow {
                after: state.window_start,
                before: state.window_end,
            };
            (window, Some(state.cursor))
        }
        None => {
            let window = TimeWindow {
                after: store.checkpoint(org, &scope).await?,
                before: now,
            };
            (window, None)
        }
    };

    let source = backend.runs(&poll.flow, window);
    let mut report = SyncReport::default();
    let mut runs = 0;
    let mut pages = 0;

    let paused = |runs: usize, report: SyncReport| ResultsReport {
        report,
        runs,
        window,
        status: PullStatus::Paused,
    };

    loop {
        if let Some(next) = cursor.as_ref().filter(|_| pages > 0 && budget.exhausted(runs)) {
            store
                .set_resume_state(org, &scope, &resume_state(next, window))
                .await?;
            info!(%org, flow = %poll.flow, runs, cursor = %next, "results pull paused on budget");
            return Ok(paused(runs, report));
        }

        let page = match source.fetch_page(cursor.clone()).await {
            Ok(page) => page,
            Err(err) if err.is_rate_limited() => {
                if let Some(next) = &cursor {
                    store
                        .set_resume_state(org, &scope, &resume_state(next, window))
                        .await?;
                }
                warn!(%org, flow = %poll.flow, runs, "results pull paused by remote rate limit");
                return Ok(paused(runs, report));
            }
            Err(err) => return Err(err.into()),
        };
        pages += 1;
        runs += page.records.len();
        ingest_page(store, org, poll, &page.records, &mut report).await?;

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    store.set_checkpoint(org, &scope, window.before).await?;
    store.clear_resume_state(org, &scope).await?;
    Ok(ResultsReport {
        report,
        runs,
        window,
        status: PullStatus::Completed,
    })
}

fn resume_state(cursor: &str, window: TimeWindow) -> ResumeState {
    ResumeState {
        cursor: cursor.to_string(),
        window_start: window.after,
        window_end: window.before,
    }
}
