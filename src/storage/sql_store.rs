use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use futures_util::{StreamExt, stream};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, Row as _};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::sql::{Dialect, render, render_status_query};
use super::{Row, RowStream, ShutdownCandidate, StepStore};
use crate::engine::aggregate::derive_instance_state;
use crate::engine::planner::QueryPlan;
use crate::engine::precedence;
use crate::engine::status::worst_status;
use crate::engine::types::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const INDEX_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS step_record (
        id TEXT PRIMARY KEY,
        prev_id TEXT,
        workflow_id BIGINT NOT NULL,
        branch_id TEXT NOT NULL,
        step BIGINT NOT NULL,
        activity_id BIGINT NOT NULL,
        next_activity BIGINT NOT NULL,
        basic_status BIGINT NOT NULL,
        engine_status BIGINT NOT NULL,
        adv_status TEXT,
        service_name TEXT NOT NULL,
        definition_id BIGINT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        status_report TEXT,
        indexed BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS step_record_branch_step
        ON step_record (workflow_id, branch_id, step)",
    "CREATE INDEX IF NOT EXISTS step_record_engine_status
        ON step_record (engine_status, indexed)",
    "CREATE TABLE IF NOT EXISTS instance_inactive (
        workflow_id BIGINT PRIMARY KEY,
        reason TEXT NOT NULL,
        marked_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS instance_index (
        workflow_id BIGINT PRIMARY KEY,
        state BIGINT NOT NULL,
        status BIGINT NOT NULL,
        definition_id BIGINT NOT NULL,
        start_time TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS hint (
        workflow_id BIGINT NOT NULL,
        branch_id TEXT NOT NULL,
        state TEXT NOT NULL,
        engine_status BIGINT NOT NULL,
        basic_status BIGINT NOT NULL,
        adv_status TEXT,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (workflow_id, branch_id)
    )",
];

const RECORD_COLUMNS: &str = "id, prev_id, workflow_id, branch_id, step, activity_id, next_activity, \
     basic_status, engine_status, adv_status, service_name, definition_id, start_time, end_time, \
     status_report, indexed";

/// Step store backed by a SQL database through the sqlx `Any` driver.
///
/// The instance index is recomputed inside the same transaction as every
/// write that touches an instance, so filter scans only read it and never
/// see an entry that disagrees with the committed records.
pub struct SqlStepStore {
    pool: AnyPool,
    dialect: Dialect,
    fetch_size: usize,
}

impl SqlStepStore {
    /// Connect and create the schema if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPool::connect(url)
            .await
            .with_context(|| format!("Failed to connect to database '{}'", url))?;

        let store = Self {
            pool,
            dialect: Dialect::from_url(url),
            fetch_size: 10,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Rows buffered ahead of the consumer during filter scans.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create schema")?;
        }
        Ok(())
    }

    fn sql(&self, statement: &str) -> String {
        self.dialect.placeholders(statement)
    }

    async fn records(&self, conn: &mut AnyConnection, workflow_id: WorkflowId) -> Result<Vec<StepRecord>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM step_record WHERE workflow_id = ? ORDER BY branch_id, step",
            RECORD_COLUMNS
        ));
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&mut *conn).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn inactive_on(&self, conn: &mut AnyConnection, workflow_id: WorkflowId) -> Result<bool> {
        let sql = self.sql("SELECT reason FROM instance_inactive WHERE workflow_id = ?");
        let row = sqlx::query(&sql).bind(workflow_id).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }

    /// Lock the index row of an existing instance until the transaction ends.
    ///
    /// Writers on the same instance queue here, so each recompute reads the
    /// records committed by the writer before it.
    async fn lock_index(&self, conn: &mut AnyConnection, workflow_id: WorkflowId) -> Result<()> {
        let sql = self.sql("UPDATE instance_index SET state = state WHERE workflow_id = ?");
        sqlx::query(&sql)
            .bind(workflow_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to lock index of workflow {}", workflow_id))?;
        Ok(())
    }

    /// Recompute the index entry of one instance from its records, on the
    /// connection of the transaction that wrote them.
    async fn refresh_index(&self, conn: &mut AnyConnection, workflow_id: WorkflowId) -> Result<()> {
        let records = self.records(conn, workflow_id).await?;
        let Some(first) = records.iter().min_by_key(|r| r.start_time) else {
            return Ok(());
        };

        let mut latest: HashMap<&str, &StepRecord> = HashMap::new();
        for record in &records {
            latest
                .entry(record.branch_id.as_str())
                .and_modify(|cur| {
                    if record.step > cur.step {
                        *cur = record;
                    }
                })
                .or_insert(record);
        }

        let inactive = self.inactive_on(conn, workflow_id).await?;
        let state = derive_instance_state(latest.values().copied(), inactive);
        let status = worst_status(records.iter().map(|r| r.basic_status));

        let sql = self.sql(
            "INSERT INTO instance_index (workflow_id, state, status, definition_id, start_time)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET
                state = excluded.state,
                status = excluded.status,
                definition_id = excluded.definition_id,
                start_time = excluded.start_time",
        );
        sqlx::query(&sql)
            .bind(workflow_id)
            .bind(precedence::encode(state) as i64)
            .bind(status.code() as i64)
            .bind(first.definition_id)
            .bind(first.start_time.trunc_subsecs(0).format(INDEX_TIME_FORMAT).to_string())
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to refresh index for workflow {}", workflow_id))?;

        debug!(workflow_id = %workflow_id, state = %state, status = %status, "Index refreshed");
        Ok(())
    }
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format(TIME_FORMAT).to_string()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("Invalid timestamp '{}'", raw))?;
    Ok(naive.and_utc())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid record id '{}'", raw))
}

fn record_from_row(row: &AnyRow) -> Result<StepRecord> {
    let id: String = row.try_get("id")?;
    let prev_id: Option<String> = row.try_get("prev_id")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;

    Ok(StepRecord {
        id: parse_uuid(&id)?,
        prev_id: prev_id.as_deref().map(parse_uuid).transpose()?,
        workflow_id: row.try_get::<i64, _>("workflow_id")?,
        branch_id: row.try_get("branch_id")?,
        step: row.try_get::<i64, _>("step")?,
        activity_id: row.try_get::<i64, _>("activity_id")? as i32,
        next_activity: NextActivity::from_code(row.try_get::<i64, _>("next_activity")? as i32),
        basic_status: BasicStatus::from_code(row.try_get::<i64, _>("basic_status")? as i32),
        engine_status: EngineStatus::from_code(row.try_get::<i64, _>("engine_status")? as i32),
        adv_status: row.try_get("adv_status")?,
        service_name: row.try_get("service_name")?,
        definition_id: row.try_get::<i64, _>("definition_id")?,
        start_time: parse_time(&start_time)?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
        status_report: row.try_get("status_report")?,
        indexed: row.try_get::<i64, _>("indexed")? != 0,
    })
}

fn filter_row(row: &AnyRow) -> Result<Row> {
    Ok(Row {
        workflow_id: row.try_get::<i64, _>(0)?,
        state_code: row.try_get::<i64, _>(1)? as i32,
    })
}

#[async_trait]
impl StepStore for SqlStepStore {
    async fn insert_step(&self, record: &StepRecord) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        // Creates the index row of a new instance so the lock has a row to
        // hold; the recompute below overwrites the placeholder values.
        let claim = self.sql(
            "INSERT INTO instance_index (workflow_id, state, status, definition_id, start_time)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET state = instance_index.state",
        );
        sqlx::query(&claim)
            .bind(record.workflow_id)
            .bind(precedence::encode(LifecycleState::Unknown) as i64)
            .bind(Status::Unknown.code() as i64)
            .bind(record.definition_id)
            .bind(record.start_time.trunc_subsecs(0).format(INDEX_TIME_FORMAT).to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to lock index of workflow {}", record.workflow_id))?;

        let sql = self.sql(&format!(
            "INSERT INTO step_record ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RECORD_COLUMNS
        ));
        sqlx::query(&sql)
            .bind(record.id.to_string())
            .bind(record.prev_id.map(|id| id.to_string()))
            .bind(record.workflow_id)
            .bind(record.branch_id.clone())
            .bind(record.step)
            .bind(record.activity_id as i64)
            .bind(record.next_activity.code() as i64)
            .bind(record.basic_status.code() as i64)
            .bind(record.engine_status.code() as i64)
            .bind(record.adv_status.clone())
            .bind(record.service_name.clone())
            .bind(record.definition_id)
            .bind(format_time(&record.start_time))
            .bind(record.end_time.as_ref().map(format_time))
            .bind(record.status_report.clone())
            .bind(i64::from(record.indexed))
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to insert step {} for workflow {} branch '{}'",
                    record.step, record.workflow_id, record.branch_id
                )
            })?;

        self.refresh_index(&mut tx, record.workflow_id).await?;
        tx.commit().await?;
        Ok(record.id)
    }

    async fn latest_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<StepRecord>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM step_record WHERE workflow_id = ? AND branch_id = ? ORDER BY step DESC LIMIT 1",
            RECORD_COLUMNS
        ));
        let row = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(branch_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn branch_ids(&self, workflow_id: WorkflowId) -> Result<Vec<String>> {
        let sql = self.sql(
            "SELECT branch_id FROM step_record WHERE workflow_id = ?
             GROUP BY branch_id ORDER BY MIN(start_time), branch_id",
        );
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(anyhow::Error::from))
            .collect()
    }

    async fn branch_history(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Vec<StepRecord>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM step_record WHERE workflow_id = ? AND branch_id = ? ORDER BY step",
            RECORD_COLUMNS
        ));
        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(branch_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn basic_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<BasicStatus>> {
        let sql = self.sql("SELECT basic_status FROM step_record WHERE workflow_id = ?");
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok(BasicStatus::from_code(row.try_get::<i64, _>(0)? as i32)))
            .collect()
    }

    async fn worst_statuses(&self, ids: &[WorkflowId]) -> Result<HashMap<WorkflowId, Status>> {
        let mut out = HashMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let rows = sqlx::query(&render_status_query(ids))
            .fetch_all(&self.pool)
            .await
            .context("Failed to read bulk status")?;
        for row in &rows {
            let id = row.try_get::<i64, _>(0)?;
            let status = Status::from_code(row.try_get::<i64, _>(1)?);
            // Rows arrive worst first within an id.
            out.entry(id).or_insert(status);
        }
        Ok(out)
    }

    fn query_by_filter<'a>(&'a self, plan: &'a QueryPlan) -> RowStream<'a> {
        let sql = render(plan, self.dialect);
        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel::<Result<Row>>(self.fetch_size);
        debug!(sql = %sql, "Filter scan");

        tokio::spawn(async move {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(next) = rows.next().await {
                let item = next.map_err(anyhow::Error::from).and_then(|row| filter_row(&row));
                let failed = item.is_err();
                // The receiver is dropped once the consumer has enough ids.
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn overwrite_latest_status(&self, record_id: Uuid, status: BasicStatus, note: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        // Lock before reading so the transaction starts as a writer.
        let lock = self.sql(
            "UPDATE instance_index SET state = state
             WHERE workflow_id = (SELECT workflow_id FROM step_record WHERE id = ?)",
        );
        sqlx::query(&lock)
            .bind(record_id.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to lock index for record {}", record_id))?;

        let lookup = self.sql("SELECT workflow_id FROM step_record WHERE id = ?");
        let owner = sqlx::query(&lookup)
            .bind(record_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(owner) = owner else {
            return Ok(0);
        };
        let workflow_id: i64 = owner.try_get(0)?;

        let sql = self.sql("UPDATE step_record SET basic_status = ?, status_report = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(status.code() as i64)
            .bind(note.to_string())
            .bind(record_id.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to overwrite status of record {}", record_id))?;

        self.refresh_index(&mut tx, workflow_id).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn mark_inactive(&self, workflow_id: WorkflowId, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.lock_index(&mut tx, workflow_id).await?;

        let sql = self.sql(
            "INSERT INTO instance_inactive (workflow_id, reason, marked_at) VALUES (?, ?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET reason = excluded.reason, marked_at = excluded.marked_at",
        );
        sqlx::query(&sql)
            .bind(workflow_id)
            .bind(reason.to_string())
            .bind(format_time(&Utc::now()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to mark workflow {} inactive", workflow_id))?;

        self.refresh_index(&mut tx, workflow_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn is_marked_inactive(&self, workflow_id: WorkflowId) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        self.inactive_on(&mut conn, workflow_id).await
    }

    async fn shutdown_candidates(&self) -> Result<Vec<ShutdownCandidate>> {
        let sql = self.sql(
            "SELECT workflow_id, branch_id, step FROM step_record
             WHERE engine_status = ? AND indexed = 0
             ORDER BY workflow_id, branch_id, step",
        );
        let rows = sqlx::query(&sql)
            .bind(EngineStatus::SystemShutdown.code() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ShutdownCandidate {
                    workflow_id: row.try_get::<i64, _>(0)?,
                    branch_id: row.try_get::<String, _>(1)?,
                    step: row.try_get::<i64, _>(2)?,
                })
            })
            .collect()
    }

    async fn current_step(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<i64>> {
        let sql = self.sql("SELECT MAX(step) FROM step_record WHERE workflow_id = ? AND branch_id = ?");
        let row = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(branch_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>(0)?)
    }

    async fn save_hint(&self, hint: &Hint) -> Result<()> {
        let sql = self.sql(
            "INSERT INTO hint (workflow_id, branch_id, state, engine_status, basic_status, adv_status, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (workflow_id, branch_id) DO UPDATE SET
                state = excluded.state,
                engine_status = excluded.engine_status,
                basic_status = excluded.basic_status,
                adv_status = excluded.adv_status,
                recorded_at = excluded.recorded_at",
        );
        sqlx::query(&sql)
            .bind(hint.workflow_id)
            .bind(hint.branch_id.clone())
            .bind(hint.state.to_string())
            .bind(hint.engine_status.code() as i64)
            .bind(hint.basic_status.code() as i64)
            .bind(hint.adv_status.clone())
            .bind(format_time(&hint.recorded_at))
            .execute(&self.pool)
            .await
            .context("Failed to save hint")?;
        Ok(())
    }

    async fn hint(&self, workflow_id: WorkflowId, branch_id: &str) -> Result<Option<Hint>> {
        let sql = self.sql(
            "SELECT state, engine_status, basic_status, adv_status, recorded_at FROM hint
             WHERE workflow_id = ? AND branch_id = ?",
        );
        let row = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(branch_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get(0)?;
        let recorded_at: String = row.try_get(4)?;
        Ok(Some(Hint {
            workflow_id,
            branch_id: branch_id.to_string(),
            state: state.parse()?,
            engine_status: EngineStatus::from_code(row.try_get::<i64, _>(1)? as i32),
            basic_status: BasicStatus::from_code(row.try_get::<i64, _>(2)? as i32),
            adv_status: row.try_get(3)?,
            recorded_at: parse_time(&recorded_at)?,
        }))
    }

    async fn invalidate_hints(&self, workflow_id: WorkflowId) -> Result<()> {
        let sql = self.sql("DELETE FROM hint WHERE workflow_id = ?");
        sqlx::query(&sql).bind(workflow_id).execute(&self.pool).await?;
        Ok(())
    }
}
