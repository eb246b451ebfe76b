//! PostgreSQL implementation of the store contracts.
//!
//! Record tables are keyed by `(org_id, natural key)`. Leases are rows in
//! `sync_leases` taken with a conditional upsert, so any number of worker
//! processes can share one database.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tally_core::{
    Boundary, Contact, ContactField, CounterDelta, FieldValueType, Gender, LocalRecord, OrgId,
    ResolvedAnswer,
};
use tracing::debug;

use crate::{
    floored_total, CheckpointStore, CounterScope, CounterStore, Lease, LockService, RecordStore,
    ResumeState, SquashResult, StoreError, StoreResult,
};

type PgQuery = Query<'static, Postgres, PgArguments>;

/// Row mapping for one record table.
pub trait PgTable: LocalRecord {
    const TABLE: &'static str;
    const KEY_COLUMN: &'static str;
    const COLUMNS: &'static str;

    fn from_row(row: &PgRow) -> StoreResult<Self>;

    /// An `INSERT ... ON CONFLICT DO UPDATE` with every column bound.
    fn upsert(&self) -> PgQuery;
}

impl PgTable for ContactField {
    const TABLE: &'static str = "contact_fields";
    const KEY_COLUMN: &'static str = "key";
    const COLUMNS: &'static str = "org_id, key, label, value_type, is_active";

    fn from_row(row: &PgRow) -> StoreResult<Self> {
        let code: String = row.try_get("value_type")?;
        Ok(ContactField {
            org_id: OrgId(row.try_get("org_id")?),
            key: row.try_get("key")?,
            label: row.try_get("label")?,
            value_type: FieldValueType::from_code(&code)
                .ok_or_else(|| StoreError::corrupt(Self::TABLE, format!("value type '{code}'")))?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn upsert(&self) -> PgQuery {
        sqlx::query(
            r#"
            INSERT INTO contact_fields (org_id, key, label, value_type, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (org_id, key) DO UPDATE
               SET label = EXCLUDED.label,
                   value_type = EXCLUDED.value_type,
                   is_active = EXCLUDED.is_active
            "#,
        )
        .bind(self.org_id.0)
        .bind(self.key.clone())
        .bind(self.label.clone())
        .bind(self.value_type.code())
        .bind(self.is_active)
    }
}

impl PgTable for Boundary {
    const TABLE: &'static str = "boundaries";
    const KEY_COLUMN: &'static str = "osm_id";
    const COLUMNS: &'static str = "org_id, osm_id, name, level, parent_osm_id, geometry, is_active";

    fn from_row(row: &PgRow) -> StoreResult<Self> {
        Ok(Boundary {
            org_id: OrgId(row.try_get("org_id")?),
            osm_id: row.try_get("osm_id")?,
            name: row.try_get("name")?,
            level: row.try_get("level")?,
            parent_osm_id: row.try_get("parent_osm_id")?,
            geometry: row.try_get("geometry")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn upsert(&self) -> PgQuery {
        sqlx::query(
            r#"
            INSERT INTO boundaries (org_id, osm_id, name, level, parent_osm_id, geometry, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, osm_id) DO UPDATE
               SET name = EXCLUDED.name,
                   level = EXCLUDED.level,
                   parent_osm_id = EXCLUDED.parent_osm_id,
                   geometry = EXCLUDED.geometry,
                   is_active = EXCLUDED.is_active
            "#,
        )
        .bind(self.org_id.0)
        .bind(self.osm_id.clone())
        .bind(self.name.clone())
        .bind(self.level)
        .bind(self.parent_osm_id.clone())
        .bind(self.geometry.clone())
        .bind(self.is_active)
    }
}

fn gender_column(row: &PgRow, table: &'static str) -> StoreResult<Option<Gender>> {
    let code: Option<String> = row.try_get("gender")?;
    code.map(|code| {
        Gender::from_code(&code)
            .ok_or_else(|| StoreError::corrupt(table, format!("gender code '{code}'")))
    })
    .transpose()
}

impl PgTable for Contact {
    const TABLE: &'static str = "contacts";
    const KEY_COLUMN: &'static str = "uuid";
    const COLUMNS: &'static str = "org_id, uuid, gender, born, occupation, registered_on, state, \
                                   district, ward, scheme, is_active";

    fn from_row(row: &PgRow) -> StoreResult<Self> {
        Ok(Contact {
            org_id: OrgId(row.try_get("org_id")?),
            uuid: row.try_get("uuid")?,
            gender: gender_column(row, Self::TABLE)?,
            born: row.try_get("born")?,
            occupation: row.try_get("occupation")?,
            registered_on: row.try_get("registered_on")?,
            state: row.try_get("state")?,
            district: row.try_get("district")?,
            ward: row.try_get("ward")?,
            scheme: row.try_get("scheme")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn upsert(&self) -> PgQuery {
        sqlx::query(
            r#"
            INSERT INTO contacts (org_id, uuid, gender, born, occupation, registered_on,
                                  state, district, ward, scheme, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (org_id, uuid) DO UPDATE
               SET gender = EXCLUDED.gender,
                   born = EXCLUDED.born,
                   occupation = EXCLUDED.occupation,
                   registered_on = EXCLUDED.registered_on,
                   state = EXCLUDED.state,
                   district = EXCLUDED.district,
                   ward = EXCLUDED.ward,
                   scheme = EXCLUDED.scheme,
                   is_active = EXCLUDED.is_active
            "#,
        )
        .bind(self.org_id.0)
        .bind(self.uuid.clone())
        .bind(self.gender.map(Gender::code))
        .bind(self.born)
        .bind(self.occupation.clone())
        .bind(self.registered_on)
        .bind(self.state.clone())
        .bind(self.district.clone())
        .bind(self.ward.clone())
        .bind(self.scheme.clone())
        .bind(self.is_active)
    }
}

impl PgTable for ResolvedAnswer {
    const TABLE: &'static str = "poll_results";
    const KEY_COLUMN: &'static str = "identity";
    const COLUMNS: &'static str = "org_id, flow, question, respondent, category, text, answered_at, \
                                   completed, state, district, ward, gender, born, scheme";

    fn from_row(row: &PgRow) -> StoreResult<Self> {
        Ok(ResolvedAnswer {
            org_id: OrgId(row.try_get("org_id")?),
            flow: row.try_get("flow")?,
            question: row.try_get("question")?,
            respondent: row.try_get("respondent")?,
            category: row.try_get("category")?,
            text: row.try_get("text")?,
            answered_at: row.try_get("answered_at")?,
            completed: row.try_get("completed")?,
            state: row.try_get("state")?,
            district: row.try_get("district")?,
            ward: row.try_get("ward")?,
            gender: gender_column(row, Self::TABLE)?,
            born: row.try_get("born")?,
            scheme: row.try_get("scheme")?,
        })
    }

    fn upsert(&self) -> PgQuery {
        sqlx::query(
            r#"
            INSERT INTO poll_results (org_id, identity, flow, question, respondent, category, text,
                                      answered_at, completed, state, district, ward, gender, born,
                                      scheme)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (org_id, identity) DO UPDATE
               SET category = EXCLUDED.category,
                   text = EXCLUDED.text,
                   answered_at = EXCLUDED.answered_at,
                   completed = EXCLUDED.completed,
                   state = EXCLUDED.state,
                   district = EXCLUDED.district,
                   ward = EXCLUDED.ward,
                   gender = EXCLUDED.gender,
                   born = EXCLUDED.born,
                   scheme = EXCLUDED.scheme
            "#,
        )
        .bind(self.org_id.0)
        .bind(self.natural_key())
        .bind(self.flow.clone())
        .bind(self.question.clone())
        .bind(self.respondent.clone())
        .bind(self.category.clone())
        .bind(self.text.clone())
        .bind(self.answered_at)
        .bind(self.completed)
        .bind(self.state.clone())
        .bind(self.district.clone())
        .bind(self.ward.clone())
        .bind(self.gender.map(Gender::code))
        .bind(self.born)
        .bind(self.scheme.clone())
    }
}

fn append_deltas_query(org: OrgId, deltas: &[CounterDelta]) -> Option<PgQuery> {
    let (keys, counts): (Vec<String>, Vec<i64>) = deltas
        .iter()
        .filter(|d| d.count != 0)
        .map(|d| (d.key.clone(), d.count))
        .unzip();
    if keys.is_empty() {
        return None;
    }
    Some(
        sqlx::query(
            r#"
            INSERT INTO counter_deltas (org_id, counter_key, count)
            SELECT $1, k, c FROM UNNEST($2::text[], $3::bigint[]) AS d(k, c)
            "#,
        )
        .bind(org.0)
        .bind(keys)
        .bind(counts),
    )
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: PgTable> RecordStore<R> for PgStore {
    async fn load(&self, org: OrgId, key: &str) -> StoreResult<Option<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE org_id = $1 AND {} = $2",
            R::COLUMNS,
            R::TABLE,
            R::KEY_COLUMN
        );
        let row = sqlx::query(&sql)
            .bind(org.0)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(R::from_row).transpose()
    }

    async fn load_many(&self, org: OrgId, keys: &[String]) -> StoreResult<Vec<R>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE org_id = $1 AND {} = ANY($2)",
            R::COLUMNS,
            R::TABLE,
            R::KEY_COLUMN
        );
        let rows = sqlx::query(&sql)
            .bind(org.0)
            .bind(keys.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(R::from_row).collect()
    }

    async fn load_all(&self, org: OrgId) -> StoreResult<Vec<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE org_id = $1 ORDER BY {}",
            R::COLUMNS,
            R::TABLE,
            R::KEY_COLUMN
        );
        let rows = sqlx::query(&sql)
            .bind(org.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(R::from_row).collect()
    }

    async fn save_batch(
        &self,
        org: OrgId,
        records: &[R],
        deltas: &[CounterDelta],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            record.upsert().execute(&mut *tx).await?;
        }
        if let Some(query) = append_deltas_query(org, deltas) {
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(table = R::TABLE, %org, records = records.len(), deltas = deltas.len(), "saved batch");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn checkpoint(&self, org: OrgId, scope: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT synced_until FROM sync_checkpoints WHERE org_id = $1 AND scope = $2",
        )
        .bind(org.0)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get("synced_until")?),
            None => Ok(None),
        }
    }

    async fn set_checkpoint(
        &self,
        org: OrgId,
        scope: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (org_id, scope, synced_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (org_id, scope) DO UPDATE
               SET synced_until = EXCLUDED.synced_until,
                   updated_at = now()
            "#,
        )
        .bind(org.0)
        .bind(scope)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume_state(&self, org: OrgId, scope: &str) -> StoreResult<Option<ResumeState>> {
        let row = sqlx::query(
            r#"
            SELECT resume_cursor, resume_window_start, resume_window_end
              FROM sync_checkpoints
             WHERE org_id = $1 AND scope = $2
               AND resume_cursor IS NOT NULL
               AND resume_window_end IS NOT NULL
            "#,
        )
        .bind(org.0)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ResumeState {
            cursor: row.try_get("resume_cursor")?,
            window_start: row.try_get("resume_window_start")?,
            window_end: row.try_get("resume_window_end")?,
        }))
    }

    async fn set_resume_state(
        &self,
        org: OrgId,
        scope: &str,
        state: &ResumeState,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (org_id, scope, resume_cursor, resume_window_start,
                                          resume_window_end)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (org_id, scope) DO UPDATE
               SET resume_cursor = EXCLUDED.resume_cursor,
                   resume_window_start = EXCLUDED.resume_window_start,
                   resume_window_end = EXCLUDED.resume_window_end,
                   updated_at = now()
            "#,
        )
        .bind(org.0)
        .bind(scope)
        .bind(&state.cursor)
        .bind(state.window_start)
        .bind(state.window_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_resume_state(&self, org: OrgId, scope: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_checkpoints
               SET resume_cursor = NULL,
                   resume_window_start = NULL,
                   resume_window_end = NULL,
                   updated_at = now()
             WHERE org_id = $1 AND scope = $2
            "#,
        )
        .bind(org.0)
        .bind(scope)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for PgStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        let lease = Lease::new(key, ttl);
        let row = sqlx::query(
            r#"
            INSERT INTO sync_leases (lease_key, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3::double precision))
            ON CONFLICT (lease_key) DO UPDATE
               SET holder = EXCLUDED.holder,
                   expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at <= now()
            RETURNING holder
            "#,
        )
        .bind(&lease.key)
        .bind(&lease.holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_leases WHERE lease_key = $1 AND holder = $2")
            .bind(&lease.key)
            .bind(&lease.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn append(&self, org: OrgId, deltas: &[CounterDelta]) -> StoreResult<()> {
        if let Some(query) = append_deltas_query(org, deltas) {
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn counts(&self, org: OrgId, prefix: Option<&str>) -> StoreResult<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT counter_key, SUM(count)::bigint AS count
              FROM (
                    SELECT counter_key, count FROM counter_deltas
                     WHERE org_id = $1 AND ($2::text IS NULL OR starts_with(counter_key, $2))
                    UNION ALL
                    SELECT counter_key, count FROM counter_totals
                     WHERE org_id = $1 AND ($2::text IS NULL OR starts_with(counter_key, $2))
                   ) AS c
             GROUP BY counter_key
            "#,
        )
        .bind(org.0)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(row.try_get("counter_key")?, row.try_get("count")?);
        }
        Ok(counts)
    }

    async fn unsquashed_scopes(
        &self,
        after: Option<&CounterScope>,
        limit: usize,
    ) -> StoreResult<Vec<CounterScope>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT org_id, counter_key COLLATE "C" AS counter_key
              FROM counter_deltas
             WHERE $1::bigint IS NULL
                OR org_id > $1
                OR (org_id = $1 AND counter_key COLLATE "C" > $2)
             ORDER BY org_id, counter_key
             LIMIT $3
            "#,
        )
        .bind(after.map(|a| a.org_id.0))
        .bind(after.map(|a| a.key.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CounterScope::new(
                    OrgId(row.try_get("org_id")?),
                    row.try_get::<String, _>("counter_key")?,
                ))
            })
            .collect()
    }

    async fn squash(&self, scope: &CounterScope) -> StoreResult<SquashResult> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM counter_deltas WHERE org_id = $1 AND counter_key = $2 RETURNING count",
        )
        .bind(scope.org_id.0)
        .bind(&scope.key)
        .fetch_all(&mut *tx)
        .await?;
        let mut delta = 0i64;
        for row in &removed {
            delta = delta.saturating_add(row.try_get::<i64, _>("count")?);
        }

        let existing: i64 = sqlx::query(
            "SELECT count FROM counter_totals WHERE org_id = $1 AND counter_key = $2 FOR UPDATE",
        )
        .bind(scope.org_id.0)
        .bind(&scope.key)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("count"))
        .transpose()?
        .unwrap_or_default();

        let (total, clamped) = floored_total(existing, delta);
        if total == 0 {
            sqlx::query("DELETE FROM counter_totals WHERE org_id = $1 AND counter_key = $2")
                .bind(scope.org_id.0)
                .bind(&scope.key)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO counter_totals (org_id, counter_key, count, squashed_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (org_id, counter_key) DO UPDATE
                   SET count = EXCLUDED.count,
                       squashed_at = EXCLUDED.squashed_at
                "#,
            )
            .bind(scope.org_id.0)
            .bind(&scope.key)
            .bind(total)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(SquashResult {
            rows: removed.len(),
            delta,
            total,
            clamped,
        })
    }
}
