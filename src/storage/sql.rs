//! Rendering of query plans into SQL text for each supported dialect.
//!
//! Rendered queries run against the schema created by
//! [`crate::storage::sql_store::SqlStepStore`]: `step_record` aliased `r`
//! (latest record of each branch) joined with `instance_index` aliased `x`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::planner::{Clause, QueryPlan};
use crate::engine::status::error_codes;
use crate::engine::types::NextActivity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    Oracle,
    Mssql,
    Db2,
    Informix,
}

impl Dialect {
    /// Guess the dialect from a database URL scheme.
    pub fn from_url(url: &str) -> Dialect {
        if url.starts_with("postgres") {
            Dialect::Postgres
        } else {
            Dialect::Sqlite
        }
    }

    /// Date literal for a timestamp, second precision.
    pub fn date_literal(&self, ts: &DateTime<Utc>) -> String {
        let t = ts.format("%Y-%m-%d %H:%M:%S");
        match self {
            Dialect::Mssql => format!("CONVERT(DATETIME,'{}',120)", t),
            Dialect::Informix => format!("TO_DATE('{}','%Y-%m-%d %H:%M:%S')", t),
            Dialect::Oracle | Dialect::Db2 => format!("TO_DATE('{}','YYYY-MM-DD HH24:MI:SS')", t),
            Dialect::Sqlite | Dialect::Postgres => format!("'{}'", t),
        }
    }

    /// Rewrite `?` placeholders for drivers that number their parameters.
    pub fn placeholders(&self, sql: &str) -> String {
        if *self != Dialect::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0;
        for ch in sql.chars() {
            if ch == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        out
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Oracle => write!(f, "oracle"),
            Dialect::Mssql => write!(f, "mssql"),
            Dialect::Db2 => write!(f, "db2"),
            Dialect::Informix => write!(f, "informix"),
        }
    }
}

fn join_list<T: ToString>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join(", ")
}

fn render_clause(clause: &Clause, dialect: Dialect) -> String {
    match clause {
        Clause::BasicStatusIn(codes) => format!("r.basic_status IN ({})", join_list(codes)),
        Clause::NextActivityDone => format!("r.next_activity = {}", NextActivity::DONE_CODE),
        Clause::NextActivityNotDone => format!("r.next_activity <> {}", NextActivity::DONE_CODE),
        Clause::ErrorExists => format!(
            "EXISTS (SELECT 1 FROM step_record e WHERE e.workflow_id = r.workflow_id AND e.basic_status IN ({}))",
            join_list(&error_codes())
        ),
        Clause::NotIndexed => "r.indexed = 0".to_string(),
        Clause::AnyOf(alternatives) => {
            let parts: Vec<String> = alternatives.iter().map(|c| render_clause(c, dialect)).collect();
            format!("({})", parts.join(" OR "))
        }
        Clause::DefinitionIn(ids) => format!("x.definition_id IN ({})", join_list(ids)),
        Clause::WorkflowIn(ids) => format!("r.workflow_id IN ({})", join_list(ids)),
        Clause::StartedWithin(window) => match (window.from, window.to) {
            (Some(from), Some(to)) => format!(
                "x.start_time BETWEEN {} AND {}",
                dialect.date_literal(&from),
                dialect.date_literal(&to)
            ),
            (Some(from), None) => format!("x.start_time >= {}", dialect.date_literal(&from)),
            (None, Some(to)) => format!("x.start_time <= {}", dialect.date_literal(&to)),
            (None, None) => "1 = 1".to_string(),
        },
        Clause::StateIn(codes) => format!("x.state IN ({})", join_list(codes)),
        Clause::StatusIn(codes) => format!("x.status IN ({})", join_list(codes)),
    }
}

/// Render a plan as one SELECT returning `(workflow_id, state)` per branch row.
pub fn render(plan: &QueryPlan, dialect: Dialect) -> String {
    let mut sql = String::from("SELECT ");

    if let Some(hint) = plan.hint {
        match dialect {
            Dialect::Oracle => sql.push_str(&format!("/*+ FIRST_ROWS({}) */ ", hint.rows)),
            Dialect::Informix => sql.push_str("{+FIRST_ROWS} "),
            _ => {}
        }
    }

    sql.push_str(
        "r.workflow_id, x.state FROM step_record r \
         JOIN instance_index x ON x.workflow_id = r.workflow_id \
         WHERE r.step = (SELECT MAX(s.step) FROM step_record s \
         WHERE s.workflow_id = r.workflow_id AND s.branch_id = r.branch_id)",
    );

    for clause in &plan.clauses {
        sql.push_str(" AND ");
        sql.push_str(&render_clause(clause, dialect));
    }

    if plan.order_by_workflow_id {
        sql.push_str(" ORDER BY r.workflow_id, r.branch_id");
    }

    if let Some(hint) = plan.hint {
        match dialect {
            Dialect::Mssql => sql.push_str(&format!(" OPTION (FAST {})", hint.rows)),
            Dialect::Db2 => sql.push_str(&format!(" OPTIMIZE FOR {} ROWS", hint.rows)),
            _ => {}
        }
    }

    sql
}

/// Worst-status query for a batch of ids: one row per record, worst first
/// within each id.
pub fn render_status_query(ids: &[i64]) -> String {
    let errors = join_list(&error_codes());
    format!(
        "SELECT DISTINCT workflow_id, \
         CASE WHEN basic_status IN ({errors}) THEN 2 \
              WHEN basic_status = {warning} THEN 1 \
              ELSE 0 END AS status \
         FROM step_record WHERE workflow_id IN ({ids}) \
         ORDER BY workflow_id, status DESC",
        errors = errors,
        warning = crate::engine::types::BasicStatus::Warning.code(),
        ids = join_list(ids),
    )
}
