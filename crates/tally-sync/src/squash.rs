//! Folding of counter delta rows into squashed totals, and recount of the
//! contact counters from the stored contacts.

use std::collections::BTreeMap;

use tally_core::{diff_counters, Contact, CounterSet, LocalRecord, OrgId};
use tally_storage::{CounterScope, CounterStore, RecordStore, StoreResult};
use tracing::debug;

/// Scopes fetched per `unsquashed_scopes` call.
pub const SQUASH_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SquashReport {
    pub scopes: usize,
    pub rows: usize,
    /// Scopes whose total would have gone negative and was floored.
    pub clamped: usize,
}

/// Squashes every scope that has delta rows. Scopes are visited in order
/// once each, so rows appended behind the cursor wait for the next pass.
pub async fn squash_all<St>(store: &St, batch: usize) -> StoreResult<SquashReport>
where
    St: CounterStore + ?Sized,
{
    let mut report = SquashReport::default();
    let mut after: Option<CounterScope> = None;
    loop {
        let scopes = store.unsquashed_scopes(after.as_ref(), batch.max(1)).await?;
        let Some(last) = scopes.last().cloned() else {
            break;
        };
        for scope in &scopes {
            let result = store.squash(scope).await?;
            report.scopes += 1;
            report.rows += result.rows;
            if result.clamped {
                report.clamped += 1;
                debug!(
                    org = %scope.org_id,
                    key = %scope.key,
                    delta = result.delta,
                    "counter total floored at zero"
                );
            }
        }
        after = Some(last);
    }
    Ok(report)
}

/// Appends the deltas that bring an organization's contact counters in line
/// with its active contacts. Returns the appended deltas' keys and counts.
pub async fn rebuild_contact_counts<St>(
    store: &St,
    org: OrgId,
) -> StoreResult<BTreeMap<String, i64>>
where
    St: RecordStore<Contact> + CounterStore + ?Sized,
{
    let mut expected = CounterSet::new();
    for contact in RecordStore::<Contact>::load_all(store, org).await? {
        for (key, count) in contact.counters().iter() {
            expected.add(key.clone(), *count);
        }
    }

    let current: CounterSet = store
        .counts(org, None)
        .await?
        .into_iter()
        .filter(|(key, _)| !key.starts_with("ruleset:"))
        .collect();

    let deltas = diff_counters(&current, &expected);
    if !deltas.is_empty() {
        store.append(org, &deltas).await?;
    }
    Ok(deltas.into_iter().map(|d| (d.key, d.count)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CounterDelta, Gender};
    use tally_storage::MemoryStore;

    const ORG: OrgId = OrgId(4);

    #[tokio::test]
    async fn squash_all_preserves_counts_and_empties_the_delta_log() {
        let store = MemoryStore::new();
        store
            .append(
                ORG,
                &[
                    CounterDelta::new("gender:f", 3),
                    CounterDelta::new("gender:f", -1),
                    CounterDelta::new("total-reporters", 5),
                ],
            )
            .await
            .unwrap();
        store
            .append(OrgId(5), &[CounterDelta::new("total-reporters", 2)])
            .await
            .unwrap();
        let before = store.counts(ORG, None).await.unwrap();

        let report = squash_all(&store, 1).await.unwrap();
        assert_eq!(report.scopes, 3);
        assert_eq!(report.rows, 4);
        assert_eq!(report.clamped, 0);
        assert_eq!(store.counts(ORG, None).await.unwrap(), before);
        assert_eq!(store.pending_delta_rows().await, 0);

        assert_eq!(squash_all(&store, 10).await.unwrap(), SquashReport::default());
    }

    #[tokio::test]
    async fn negative_totals_are_counted_as_clamped() {
        let store = MemoryStore::new();
        store
            .append(ORG, &[CounterDelta::new("gender:m", -2)])
            .await
            .unwrap();
        let report = squash_all(&store, SQUASH_BATCH).await.unwrap();
        assert_eq!(report.clamped, 1);
        let counts = store.counts(ORG, Some("gender:")).await.unwrap();
        assert_eq!(counts.get("gender:m").copied().unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn rebuild_restores_drifted_contact_counters() {
        let store = MemoryStore::new();
        let mut female = Contact::bare(ORG, "C1");
        female.gender = Some(Gender::Female);
        let mut retired = Contact::bare(ORG, "C2");
        retired.gender = Some(Gender::Male);
        retired.is_active = false;
        store.save_batch(ORG, &[female, retired], &[]).await.unwrap();
        store
            .append(
                ORG,
                &[
                    CounterDelta::new("gender:m", 1),
                    CounterDelta::new("ruleset:q1:total-ruleset-polled", 7),
                ],
            )
            .await
            .unwrap();

        let applied = rebuild_contact_counts(&store, ORG).await.unwrap();
        assert_eq!(applied.get("gender:m"), Some(&-1));
        assert_eq!(applied.get("gender:f"), Some(&1));

        let counts = store.counts(ORG, None).await.unwrap();
        assert_eq!(counts.get("total-reporters"), Some(&1));
        assert_eq!(counts.get("gender:f"), Some(&1));
        assert_eq!(counts.get("gender:m").copied().unwrap_or(0), 0);
        assert_eq!(counts.get("ruleset:q1:total-ruleset-polled"), Some(&7));

        assert!(rebuild_contact_counts(&store, ORG).await.unwrap().is_empty());
    }
}
