//! Read-side lookups over the synchronized tables.

use std::collections::BTreeMap;

use tally_core::{Boundary, OrgId};
use tally_storage::{CounterStore, RecordStore, StoreResult};

/// Active boundaries of `org`, optionally restricted to one level, ordered
/// by OSM id.
pub async fn boundaries_at_level<St>(
    store: &St,
    org: OrgId,
    level: Option<i32>,
) -> StoreResult<Vec<Boundary>>
where
    St: RecordStore<Boundary> + ?Sized,
{
    let mut boundaries: Vec<Boundary> = store
        .load_all(org)
        .await?
        .into_iter()
        .filter(|b| b.is_active && level.is_none_or(|level| b.level == level))
        .collect();
    boundaries.sort_by(|a, b| a.osm_id.cmp(&b.osm_id));
    Ok(boundaries)
}

pub async fn country_boundaries<St>(store: &St, org: OrgId) -> StoreResult<Vec<Boundary>>
where
    St: RecordStore<Boundary> + ?Sized,
{
    boundaries_at_level(store, org, Some(Boundary::COUNTRY_LEVEL)).await
}

/// Current counter values under `prefix`, omitting keys that net to zero.
pub async fn counter_values<St>(
    store: &St,
    org: OrgId,
    prefix: Option<&str>,
) -> StoreResult<BTreeMap<String, i64>>
where
    St: CounterStore + ?Sized,
{
    Ok(store
        .counts(org, prefix)
        .await?
        .into_iter()
        .filter(|(_, count)| *count != 0)
        .collect())
}
