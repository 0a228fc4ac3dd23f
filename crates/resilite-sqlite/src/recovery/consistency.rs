//! Application-level consistency rules
//!
//! Engine checks say nothing about the data model. These rules describe the
//! invariants the application relies on (every child row has a parent, unique
//! columns hold no duplicates, values stay in range, timestamps are set) and
//! how to restore them deterministically when they are broken.
//!
//! Every correction finds nothing to do on a dataset it already corrected.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};

use resilite_core::error::{DbError, DbResult};
use resilite_core::identifier::SqlIdentifier;

use crate::connection::table_exists;

pub const QUARANTINE_TABLE: &str = "consistency_quarantine";

/// Which row of a duplicate group survives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    KeepOldest,
    KeepNewest,
}

/// What happens to a row that fails a range rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidRowAction {
    #[default]
    Delete,
    /// Copy the row as JSON into `consistency_quarantine`, then delete it
    Quarantine,
}

/// How a backfilled timestamp is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// RFC 3339 text
    #[default]
    Text,
    UnixSeconds,
}

/// Child rows must reference an existing parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRule {
    pub child_table: SqlIdentifier,
    pub child_column: SqlIdentifier,
    pub parent_table: SqlIdentifier,
    pub parent_column: SqlIdentifier,
}

impl OrphanRule {
    pub fn new(child_table: &str, child_column: &str, parent_table: &str, parent_column: &str) -> DbResult<Self> {
        Ok(Self {
            child_table: SqlIdentifier::new(child_table)?,
            child_column: SqlIdentifier::new(child_column)?,
            parent_table: SqlIdentifier::new(parent_table)?,
            parent_column: SqlIdentifier::new(parent_column)?,
        })
    }

    fn condition(&self) -> String {
        format!(
            "{col} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {parent} AS p WHERE p.{pcol} = {child}.{col})",
            child = self.child_table.quoted(),
            col = self.child_column.quoted(),
            parent = self.parent_table.quoted(),
            pcol = self.parent_column.quoted(),
        )
    }
}

/// A column whose non-null values must be unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueRule {
    pub table: SqlIdentifier,
    pub column: SqlIdentifier,
    /// Column defining age; rows with equal age fall back to rowid order
    pub order_by: Option<SqlIdentifier>,
    #[serde(default)]
    pub policy: DuplicatePolicy,
}

impl UniqueRule {
    pub fn new(table: &str, column: &str) -> DbResult<Self> {
        Ok(Self {
            table: SqlIdentifier::new(table)?,
            column: SqlIdentifier::new(column)?,
            order_by: None,
            policy: DuplicatePolicy::default(),
        })
    }

    pub fn ordered_by(mut self, column: &str) -> DbResult<Self> {
        self.order_by = Some(SqlIdentifier::new(column)?);
        Ok(self)
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Numeric bounds a column must respect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub table: SqlIdentifier,
    pub column: SqlIdentifier,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default = "default_true")]
    pub allow_null: bool,
    #[serde(default)]
    pub action: InvalidRowAction,
}

fn default_true() -> bool {
    true
}

impl RangeRule {
    pub fn new(table: &str, column: &str, min: Option<f64>, max: Option<f64>) -> DbResult<Self> {
        if min.is_none() && max.is_none() {
            return Err(DbError::Config(format!(
                "range rule on {}.{} needs a min or a max",
                table, column
            )));
        }
        Ok(Self {
            table: SqlIdentifier::new(table)?,
            column: SqlIdentifier::new(column)?,
            min,
            max,
            allow_null: true,
            action: InvalidRowAction::default(),
        })
    }

    pub fn reject_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    pub fn with_action(mut self, action: InvalidRowAction) -> Self {
        self.action = action;
        self
    }

    fn condition(&self) -> (String, Vec<Value>) {
        let col = self.column.quoted();
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if !self.allow_null {
            clauses.push(format!("{} IS NULL", col));
        }
        if let Some(min) = self.min {
            clauses.push(format!("{} < ?", col));
            params.push(Value::Real(min));
        }
        if let Some(max) = self.max {
            clauses.push(format!("{} > ?", col));
            params.push(Value::Real(max));
        }
        (format!("({})", clauses.join(" OR ")), params)
    }

    fn describe(&self) -> String {
        match (self.min, self.max) {
            (Some(min), Some(max)) => format!("{} outside [{}, {}]", self.column, min, max),
            (Some(min), None) => format!("{} below {}", self.column, min),
            (None, Some(max)) => format!("{} above {}", self.column, max),
            (None, None) => format!("{} is null", self.column),
        }
    }
}

/// A timestamp column that must never be empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRule {
    pub table: SqlIdentifier,
    pub column: SqlIdentifier,
    #[serde(default)]
    pub format: TimestampFormat,
}

impl TimestampRule {
    pub fn new(table: &str, column: &str) -> DbResult<Self> {
        Ok(Self {
            table: SqlIdentifier::new(table)?,
            column: SqlIdentifier::new(column)?,
            format: TimestampFormat::default(),
        })
    }

    pub fn with_format(mut self, format: TimestampFormat) -> Self {
        self.format = format;
        self
    }

    fn condition(&self) -> String {
        let col = self.column.quoted();
        format!("({col} IS NULL OR {col} = '')")
    }

    fn now(&self) -> Value {
        let now = Utc::now();
        match self.format {
            TimestampFormat::Text => Value::Text(now.to_rfc3339()),
            TimestampFormat::UnixSeconds => Value::Integer(now.timestamp()),
        }
    }
}

/// The full set of invariants checked for one database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyRules {
    pub orphans: Vec<OrphanRule>,
    pub uniques: Vec<UniqueRule>,
    pub ranges: Vec<RangeRule>,
    pub timestamps: Vec<TimestampRule>,
}

impl ConsistencyRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orphan(mut self, rule: OrphanRule) -> Self {
        self.orphans.push(rule);
        self
    }

    pub fn unique(mut self, rule: UniqueRule) -> Self {
        self.uniques.push(rule);
        self
    }

    pub fn range(mut self, rule: RangeRule) -> Self {
        self.ranges.push(rule);
        self
    }

    pub fn timestamp(mut self, rule: TimestampRule) -> Self {
        self.timestamps.push(rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
            && self.uniques.is_empty()
            && self.ranges.is_empty()
            && self.timestamps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    Orphan,
    Duplicate,
    OutOfRange,
    MissingTimestamp,
}

/// Result of one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFinding {
    pub kind: InconsistencyKind,
    pub table: String,
    pub description: String,
    pub found: usize,
    pub corrected: usize,
}

/// Counts found and corrected across all rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub found: usize,
    pub corrected: usize,
    pub findings: Vec<RuleFinding>,
    /// Rules that could not be checked or corrected
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.found == self.corrected && self.errors.is_empty()
    }

    pub fn count(&self, kind: InconsistencyKind) -> usize {
        self.findings
            .iter()
            .filter(|f| f.kind == kind)
            .map(|f| f.found)
            .sum()
    }

    fn record(&mut self, finding: RuleFinding) {
        self.found += finding.found;
        self.corrected += finding.corrected;
        if finding.found > 0 {
            self.findings.push(finding);
        }
    }

    /// Summary for logs and error messages
    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            return "no inconsistencies".to_string();
        }
        self.findings
            .iter()
            .map(|f| format!("{} {} ({})", f.found, f.description, f.table))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn count(conn: &Connection, table: &SqlIdentifier, condition: &str, params: &[Value]) -> DbResult<usize> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE {}", table.quoted(), condition),
        params_from_iter(params.iter()),
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

fn require_table(conn: &Connection, table: &SqlIdentifier) -> DbResult<()> {
    if table_exists(conn, table.as_str())? {
        Ok(())
    } else {
        Err(DbError::Config(format!("table {} does not exist", table)))
    }
}

fn duplicate_rowids_sql(rule: &UniqueRule) -> String {
    let direction = match rule.policy {
        DuplicatePolicy::KeepOldest => "ASC",
        DuplicatePolicy::KeepNewest => "DESC",
    };
    let order = match &rule.order_by {
        Some(col) => format!(
            "{col} IS NULL, {col} {dir}, rowid {dir}",
            col = col.quoted(),
            dir = direction
        ),
        None => format!("rowid {}", direction),
    };
    format!(
        "SELECT rid FROM (
            SELECT rowid AS rid,
                   ROW_NUMBER() OVER (PARTITION BY {col} ORDER BY {order}) AS rn
            FROM {table}
            WHERE {col} IS NOT NULL
        ) WHERE rn > 1",
        col = rule.column.quoted(),
        table = rule.table.quoted(),
    )
}

fn check_orphans(conn: &Connection, rule: &OrphanRule, correct: bool) -> DbResult<RuleFinding> {
    require_table(conn, &rule.child_table)?;
    require_table(conn, &rule.parent_table)?;
    let condition = rule.condition();
    let found = count(conn, &rule.child_table, &condition, &[])?;
    let corrected = if correct && found > 0 {
        conn.execute(
            &format!("DELETE FROM {} WHERE {}", rule.child_table.quoted(), condition),
            [],
        )?
    } else {
        0
    };
    Ok(RuleFinding {
        kind: InconsistencyKind::Orphan,
        table: rule.child_table.to_string(),
        description: format!(
            "orphaned {}.{} -> {}.{}",
            rule.child_table, rule.child_column, rule.parent_table, rule.parent_column
        ),
        found,
        corrected,
    })
}

fn check_duplicates(conn: &Connection, rule: &UniqueRule, correct: bool) -> DbResult<RuleFinding> {
    require_table(conn, &rule.table)?;
    let select = duplicate_rowids_sql(rule);
    let found: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM ({})", select), [], |row| row.get(0))?;
    let found = found.max(0) as usize;
    let corrected = if correct && found > 0 {
        conn.execute(
            &format!("DELETE FROM {} WHERE rowid IN ({})", rule.table.quoted(), select),
            [],
        )?
    } else {
        0
    };
    Ok(RuleFinding {
        kind: InconsistencyKind::Duplicate,
        table: rule.table.to_string(),
        description: format!("duplicate {} values", rule.column),
        found,
        corrected,
    })
}

fn ensure_quarantine_table(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS consistency_quarantine (
            id INTEGER PRIMARY KEY,
            table_name TEXT NOT NULL,
            row_data TEXT NOT NULL,
            reason TEXT NOT NULL,
            quarantined_at DATETIME NOT NULL
        )",
    )?;
    Ok(())
}

/// `json_object('a', "a", 'b', "b", ...)` over every column of `table`
fn row_json_expression(conn: &Connection, table: &SqlIdentifier) -> DbResult<String> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.quoted()))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    let pairs: Vec<String> = columns
        .iter()
        .map(|name| {
            format!(
                "'{}', \"{}\"",
                name.replace('\'', "''"),
                name.replace('"', "\"\"")
            )
        })
        .collect();
    Ok(format!("json_object({})", pairs.join(", ")))
}

fn check_range(conn: &Connection, rule: &RangeRule, correct: bool) -> DbResult<RuleFinding> {
    require_table(conn, &rule.table)?;
    let (condition, params) = rule.condition();
    let found = count(conn, &rule.table, &condition, &params)?;

    let mut corrected = 0;
    if correct && found > 0 {
        let tx = conn.unchecked_transaction()?;
        if rule.action == InvalidRowAction::Quarantine {
            ensure_quarantine_table(&tx)?;
            let mut insert_params = vec![
                Value::Text(rule.table.to_string()),
                Value::Text(rule.describe()),
                Value::Text(Utc::now().to_rfc3339()),
            ];
            insert_params.extend(params.iter().cloned());
            tx.execute(
                &format!(
                    "INSERT INTO consistency_quarantine (table_name, row_data, reason, quarantined_at)
                     SELECT ?, {}, ?, ? FROM {} WHERE {}",
                    row_json_expression(&tx, &rule.table)?,
                    rule.table.quoted(),
                    condition
                ),
                params_from_iter(insert_params.iter()),
            )?;
        }
        corrected = tx.execute(
            &format!("DELETE FROM {} WHERE {}", rule.table.quoted(), condition),
            params_from_iter(params.iter()),
        )?;
        tx.commit()?;
    }

    Ok(RuleFinding {
        kind: InconsistencyKind::OutOfRange,
        table: rule.table.to_string(),
        description: rule.describe(),
        found,
        corrected,
    })
}

fn check_timestamps(conn: &Connection, rule: &TimestampRule, correct: bool) -> DbResult<RuleFinding> {
    require_table(conn, &rule.table)?;
    let condition = rule.condition();
    let found = count(conn, &rule.table, &condition, &[])?;
    let corrected = if correct && found > 0 {
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {}",
                rule.table.quoted(),
                rule.column.quoted(),
                condition
            ),
            [rule.now()],
        )?
    } else {
        0
    };
    Ok(RuleFinding {
        kind: InconsistencyKind::MissingTimestamp,
        table: rule.table.to_string(),
        description: format!("missing {} timestamps", rule.column),
        found,
        corrected,
    })
}

fn apply(report: &mut ConsistencyReport, result: DbResult<RuleFinding>, label: String) {
    match result {
        Ok(finding) => report.record(finding),
        Err(e) => {
            tracing::warn!(rule = %label, error = %e, "consistency rule failed");
            report.errors.push(format!("{}: {}", label, e));
        }
    }
}

fn run(conn: &Connection, rules: &ConsistencyRules, correct: bool) -> ConsistencyReport {
    let mut report = ConsistencyReport::default();

    for rule in &rules.uniques {
        apply(
            &mut report,
            check_duplicates(conn, rule, correct),
            format!("unique {}.{}", rule.table, rule.column),
        );
    }
    for rule in &rules.ranges {
        apply(
            &mut report,
            check_range(conn, rule, correct),
            format!("range {}.{}", rule.table, rule.column),
        );
    }
    for rule in &rules.timestamps {
        apply(
            &mut report,
            check_timestamps(conn, rule, correct),
            format!("timestamp {}.{}", rule.table, rule.column),
        );
    }

    // deleting parents above can orphan children, and deleting children can
    // orphan grandchildren, so orphan rules run last and repeat until stable
    let passes = if correct { rules.orphans.len().max(1) } else { 1 };
    for _ in 0..passes {
        let before = report.corrected;
        for rule in &rules.orphans {
            apply(
                &mut report,
                check_orphans(conn, rule, correct),
                format!("orphans {}.{}", rule.child_table, rule.child_column),
            );
        }
        if !correct || report.corrected == before {
            break;
        }
    }
    report
}

/// Count violations without changing anything
pub fn verify(conn: &Connection, rules: &ConsistencyRules) -> ConsistencyReport {
    run(conn, rules, false)
}

/// Find and correct every violation
pub fn verify_and_correct(conn: &Connection, rules: &ConsistencyRules) -> ConsistencyReport {
    let report = run(conn, rules, true);
    if report.found > 0 {
        tracing::info!(
            found = report.found,
            corrected = report.corrected,
            summary = %report.summary(),
            "consistency corrections applied"
        );
    }
    report
}
