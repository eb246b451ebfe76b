//! Full-set and incremental reconciliation of remote pages into local records.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tally_adapters::{PageSource, TimeWindow};
use tally_core::{diff_counters, CounterSet, LocalRecord, OrgId, SyncOutcome, SyncReport};
use tally_storage::{CheckpointStore, RecordStore, StoreResult};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::syncer::{decide, retire_decision, Decision, Syncer};

/// Local writes and counter deltas accumulated for one page.
pub(crate) struct ChangeSet<L> {
    records: Vec<L>,
    counters: CounterSet,
}

impl<L: LocalRecord> ChangeSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
            counters: CounterSet::new(),
        }
    }

    pub(crate) fn push(&mut self, before: Option<&L>, after: L) {
        let before = before.map(LocalRecord::counters).unwrap_or_default();
        for delta in diff_counters(&before, &after.counters()) {
            self.counters.add(delta.key, delta.count);
        }
        self.records.push(after);
    }

    pub(crate) async fn flush<St>(&mut self, store: &St, org: OrgId) -> StoreResult<()>
    where
        St: RecordStore<L> + ?Sized,
    {
        if self.records.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.records);
        let deltas = std::mem::take(&mut self.counters).into_deltas();
        store.save_batch(org, &records, &deltas).await
    }
}

/// Drops all but the last record for each natural key, keeping page order.
/// Returns the kept records and the number of superseded duplicates.
fn dedupe_page<S: Syncer + ?Sized>(
    syncer: &S,
    records: Vec<S::Remote>,
) -> (Vec<(String, S::Remote)>, usize) {
    let total = records.len();
    let mut seen = HashSet::new();
    let mut kept: Vec<(String, S::Remote)> = records
        .into_iter()
        .rev()
        .filter_map(|remote| {
            let key = syncer.remote_key(&remote);
            seen.insert(key.clone()).then_some((key, remote))
        })
        .collect();
    kept.reverse();
    let duplicates = total - kept.len();
    (kept, duplicates)
}

/// Applies `decision` to the change set and returns its outcome.
fn apply<L: LocalRecord>(
    changes: &mut ChangeSet<L>,
    local: Option<&L>,
    decision: Decision<L>,
) -> (SyncOutcome, Option<L>) {
    match decision {
        Decision::Create(record) => {
            changes.push(None, record.clone());
            (SyncOutcome::Created, Some(record))
        }
        Decision::Update(record) => {
            changes.push(local, record.clone());
            (SyncOutcome::Updated, Some(record))
        }
        Decision::Retire(record) => {
            changes.push(local, record.clone());
            (SyncOutcome::Deleted, Some(record))
        }
        Decision::Ignore => (SyncOutcome::Ignored, None),
    }
}

fn classify_or_ignore<S: Syncer + ?Sized>(
    syncer: &S,
    org: OrgId,
    key: &str,
    remote: &S::Remote,
    local: Option<&S::Local>,
) -> Decision<S::Local> {
    match decide(syncer, org, remote, local) {
        Ok(decision) => decision,
        Err(err) => {
            warn!(kind = %syncer.kind(), %org, key, error = %err, "skipping unclassifiable record");
            Decision::Ignore
        }
    }
}

/// Pulls the whole remote collection and diffs it against every local record
/// of the organization. Active local records the remote no longer reports are
/// retired after the last page.
pub async fn reconcile_full_set<S, St>(
    syncer: &S,
    store: &St,
    org: OrgId,
    source: &dyn PageSource<S::Remote>,
) -> SyncResult<SyncReport>
where
    S: Syncer + ?Sized,
    St: RecordStore<S::Local> + ?Sized,
{
    let mut locals: HashMap<String, S::Local> = store
        .load_all(org)
        .await?
        .into_iter()
        .map(|record| (record.natural_key(), record))
        .collect();
    let mut seen = HashSet::new();
    let mut report = SyncReport::default();
    let mut changes = ChangeSet::new();
    let mut cursor = None;

    loop {
        let page = source.fetch_page(cursor).await?;
        let (records, duplicates) = dedupe_page(syncer, page.records);
        report.ignored += duplicates;

        for (key, remote) in records {
            seen.insert(key.clone());
            let local = locals.get(&key);
            let decision = classify_or_ignore(syncer, org, &key, &remote, local);
            let (outcome, written) = apply(&mut changes, local, decision);
            report.record(outcome);
            if let Some(written) = written {
                locals.insert(key, written);
            }
        }
        changes.flush(store, org).await?;

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let mut unseen: Vec<&S::Local> = locals
        .iter()
        .filter(|(key, record)| record.is_active() && !seen.contains(*key))
        .map(|(_, record)| record)
        .collect();
    unseen.sort_by_key(|record| record.natural_key());
    for local in unseen {
        let (outcome, _) = apply(&mut changes, Some(local), retire_decision(syncer, local));
        report.record(outcome);
    }
    changes.flush(store, org).await?;

    debug!(kind = %syncer.kind(), %org, %report, "full-set reconcile finished");
    Ok(report)
}

/// The changed and deleted streams of one incremental window.
pub struct ChangeStreams<R> {
    pub changed: Box<dyn PageSource<R>>,
    pub deleted: Box<dyn PageSource<R>>,
}

/// Result of one incremental run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalReport {
    pub report: SyncReport,
    pub window: TimeWindow,
}

/// Pulls records changed or deleted since the kind's checkpoint.
///
/// The window end is captured before the first fetch and becomes the new
/// checkpoint only when both streams are drained.
pub async fn reconcile_incremental<S, St, F>(
    syncer: &S,
    store: &St,
    org: OrgId,
    now: DateTime<Utc>,
    open_streams: F,
) -> SyncResult<IncrementalReport>
where
    S: Syncer + ?Sized,
    St: RecordStore<S::Local> + CheckpointStore + ?Sized,
    F: FnOnce(TimeWindow) -> ChangeStreams<S::Remote>,
{
    let scope = syncer.kind().as_str();
    let window = TimeWindow {
        after: store.checkpoint(org, scope).await?,
        before: now,
    };
    let streams = open_streams(window);
    let mut report = SyncReport::default();
    let mut changes = ChangeSet::<S::Local>::new();

    let mut cursor = None;
    loop {
        let page = streams.changed.fetch_page(cursor).await?;
        let (records, duplicates) = dedupe_page(syncer, page.records);
        report.ignored += duplicates;
        let locals: HashMap<String, S::Local> = load_page_locals(store, org, &records).await?;

        for (key, remote) in &records {
            let local = locals.get(key);
            let decision = classify_or_ignore(syncer, org, key, remote, local);
            let (outcome, _) = apply(&mut changes, local, decision);
            report.record(outcome);
        }
        changes.flush(store, org).await?;

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let mut cursor = None;
    loop {
        let page = streams.deleted.fetch_page(cursor).await?;
        let (records, duplicates) = dedupe_page(syncer, page.records);
        report.ignored += duplicates;
        let locals: HashMap<String, S::Local> = load_page_locals(store, org, &records).await?;

        for (key, _) in &records {
            let decision = match locals.get(key) {
                Some(local) => retire_decision(syncer, local),
                None => Decision::Ignore,
            };
            let (outcome, _) = apply(&mut changes, locals.get(key), decision);
            report.record(outcome);
        }
        changes.flush(store, org).await?;

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    store.set_checkpoint(org, scope, window.before).await?;
    debug!(kind = %syncer.kind(), %org, %report, "incremental reconcile finished");
    Ok(IncrementalReport { report, window })
}

async fn load_page_locals<L, R, St>(
    store: &St,
    org: OrgId,
    records: &[(String, R)],
) -> StoreResult<HashMap<String, L>>
where
    L: LocalRecord,
    St: RecordStore<L> + ?Sized,
{
    let keys: Vec<String> = records.iter().map(|(key, _)| key.clone()).collect();
    Ok(store
        .load_many(org, &keys)
        .await?
        .into_iter()
        .map(|record| (record.natural_key(), record))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::{BoundarySyncer, FieldSyncer};
    use tally_adapters::{InjectedFailure, StaticPages};
    use tally_core::remote::{RemoteBoundary, RemoteField};
    use tally_core::ContactField;
    use tally_storage::MemoryStore;

    const ORG: OrgId = OrgId(1);

    fn field(key: &str, label: &str) -> RemoteField {
        RemoteField {
            key: key.into(),
            label: label.into(),
            value_type: "text".into(),
        }
    }

    async fn stored_fields(store: &MemoryStore) -> HashMap<String, ContactField> {
        let all: Vec<ContactField> = store.load_all(ORG).await.unwrap();
        all.into_iter().map(|f| (f.key.clone(), f)).collect()
    }

    #[tokio::test]
    async fn second_full_set_run_is_all_ignored() {
        let store = MemoryStore::new();
        let remote = vec![field("a", "A"), field("b", "B")];

        let first = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(remote.clone()))
            .await
            .unwrap();
        assert_eq!(first.created, 2);

        let before = stored_fields(&store).await;
        let second = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(remote))
            .await
            .unwrap();
        assert_eq!(
            second,
            SyncReport {
                ignored: 2,
                ..SyncReport::default()
            }
        );
        assert!(!second.has_mutations());
        assert_eq!(stored_fields(&store).await, before);
    }

    #[tokio::test]
    async fn missing_records_are_swept_and_reappearing_ones_reactivated() {
        let store = MemoryStore::new();
        let all = vec![field("a", "A"), field("b", "B"), field("c", "C")];
        reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(all.clone()))
            .await
            .unwrap();

        let without_b = vec![field("a", "A"), field("c", "C")];
        let report = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::chunked(without_b, 1))
            .await
            .unwrap();
        assert_eq!(
            report,
            SyncReport {
                ignored: 2,
                deleted: 1,
                ..SyncReport::default()
            }
        );
        assert!(!stored_fields(&store).await["b"].is_active);

        let report = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(all))
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.ignored, 2);
        assert!(stored_fields(&store).await["b"].is_active);
    }

    #[tokio::test]
    async fn empty_remote_collection_retires_everything() {
        let store = MemoryStore::new();
        reconcile_full_set(
            &FieldSyncer,
            &store,
            ORG,
            &StaticPages::single(vec![field("a", "A"), field("b", "B")]),
        )
        .await
        .unwrap();
        let report = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(Vec::new()))
            .await
            .unwrap();
        assert_eq!(report.deleted, 2);
        assert!(stored_fields(&store).await.values().all(|f| !f.is_active));
    }

    #[tokio::test]
    async fn duplicate_keys_in_a_page_keep_the_last_record() {
        let store = MemoryStore::new();
        let page = vec![field("a", "First"), field("b", "B"), field("a", "Second")];
        let report = reconcile_full_set(&FieldSyncer, &store, ORG, &StaticPages::single(page))
            .await
            .unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.ignored, 1);
        assert_eq!(stored_fields(&store).await["a"].label, "Second");
    }

    #[tokio::test]
    async fn unclassifiable_records_are_ignored_without_aborting() {
        let store = MemoryStore::new();
        let pages = StaticPages::single(vec![
            serde_json::from_str::<RemoteBoundary>(r#"{"osm_id":"R1","name":"North","level":0}"#)
                .unwrap(),
            serde_json::from_str::<RemoteBoundary>(r#"{"osm_id":"R9","name":"Bad","level":12}"#)
                .unwrap(),
        ]);
        let report = reconcile_full_set(&BoundarySyncer, &store, ORG, &pages)
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.ignored, 1);
    }

    #[tokio::test]
    async fn failed_full_set_fetch_skips_the_sweep() {
        let store = MemoryStore::new();
        reconcile_full_set(
            &FieldSyncer,
            &store,
            ORG,
            &StaticPages::single(vec![field("a", "A"), field("b", "B")]),
        )
        .await
        .unwrap();

        let failing = StaticPages::new(vec![vec![field("a", "A")], vec![]])
            .fail_at(1, InjectedFailure::Unavailable);
        assert!(reconcile_full_set(&FieldSyncer, &store, ORG, &failing)
            .await
            .is_err());
        assert!(stored_fields(&store).await["b"].is_active);
    }

    #[tokio::test]
    async fn incremental_failure_keeps_the_checkpoint() {
        let store = MemoryStore::new();
        let t0: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        store.set_checkpoint(ORG, "fields", t0).await.unwrap();

        let result = reconcile_incremental(
            &FieldSyncer,
            &store,
            ORG,
            "2024-01-02T00:00:00Z".parse().unwrap(),
            |_| ChangeStreams {
                changed: Box::new(
                    StaticPages::new(vec![vec![field("a", "A")], vec![field("b", "B")]])
                        .fail_at(1, InjectedFailure::Unavailable),
                ),
                deleted: Box::new(StaticPages::single(Vec::new())),
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(store.checkpoint(ORG, "fields").await.unwrap(), Some(t0));
    }

    #[tokio::test]
    async fn incremental_run_retires_reported_deletions() {
        let store = MemoryStore::new();
        let t1: DateTime<Utc> = "2024-01-02T00:00:00Z".parse().unwrap();
        let outcome = reconcile_incremental(&FieldSyncer, &store, ORG, t1, |window| {
            assert_eq!(window.after, None);
            ChangeStreams {
                changed: Box::new(StaticPages::single(vec![field("a", "A"), field("b", "B")])),
                deleted: Box::new(StaticPages::single(vec![field("b", "B"), field("zz", "ZZ")])),
            }
        })
        .await
        .unwrap();

        assert_eq!(
            outcome.report,
            SyncReport {
                created: 2,
                deleted: 1,
                ignored: 1,
                updated: 0
            }
        );
        assert_eq!(store.checkpoint(ORG, "fields").await.unwrap(), Some(t1));
        assert!(!stored_fields(&store).await["b"].is_active);
    }
}
