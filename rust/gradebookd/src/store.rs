use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// One persisted record: a JSON object with top-level fields.
pub type Row = Map<String, Value>;

/// Every collection the persistence service knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Students,
    Teachers,
    Subjects,
    Results,
    Classes,
    Attendance,
    Profiles,
    Schools,
    SubjectAssignments,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Students,
        Collection::Teachers,
        Collection::Subjects,
        Collection::Results,
        Collection::Classes,
        Collection::Attendance,
        Collection::Profiles,
        Collection::Schools,
        Collection::SubjectAssignments,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Self::Students => "students",
            Self::Teachers => "teachers",
            Self::Subjects => "subjects",
            Self::Results => "results",
            Self::Classes => "classes",
            Self::Attendance => "attendance",
            Self::Profiles => "profiles",
            Self::Schools => "schools",
            Self::SubjectAssignments => "subject_assignments",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.table() == s)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Conjunction of top-level equality tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    eq: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.eq
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub descending: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Row-level CRUD over named collections.
///
/// Writes are last-write-wins; implementations give no version check.
pub trait PersistenceService {
    fn select(
        &self,
        collection: Collection,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Row>>;

    /// Inserts one row and returns it as stored (with its assigned `id`).
    fn insert(&mut self, collection: Collection, row: Row) -> StoreResult<Row>;

    /// Merges `patch` into every live row whose `key_field` equals `key`.
    fn update(
        &mut self,
        collection: Collection,
        patch: Row,
        key_field: &str,
        key: &Value,
    ) -> StoreResult<usize>;

    /// Inserts or updates each row keyed by `conflict_key`. All or nothing.
    fn upsert(
        &mut self,
        collection: Collection,
        rows: Vec<Row>,
        conflict_key: &str,
    ) -> StoreResult<UpsertSummary>;

    fn delete(
        &mut self,
        collection: Collection,
        key_field: &str,
        key: &Value,
        soft: bool,
    ) -> StoreResult<usize>;
}

/// Current time in the format written to `updated_at` markers.
pub fn now_stamp() -> String {
    Utc::now().to_rfc3339()
}

pub fn is_valid_field(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// True for values that do not identify a row (`null`, blank strings).
pub fn is_blank_key(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn check_field(name: &str) -> StoreResult<()> {
    if is_valid_field(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidField(name.to_string()))
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

// JSON null has no SQL equality; callers turn `None` into `IS NULL`.
fn to_sql(v: &Value) -> Option<SqlValue> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlValue::Integer(i)),
            None => Some(SqlValue::Real(n.as_f64().unwrap_or(0.0))),
        },
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

fn key_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_eq(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    field: &str,
    value: &Value,
) -> StoreResult<()> {
    check_field(field)?;
    let lhs = if field == "id" {
        "id"
    } else {
        params.push(SqlValue::Text(json_path(field)));
        "json_extract(data, ?)"
    };
    match to_sql(value) {
        None => clauses.push(format!("{} IS NULL", lhs)),
        Some(v) => {
            params.push(v);
            clauses.push(format!("{} = ?", lhs));
        }
    }
    Ok(())
}

fn parse_data(raw: &str) -> StoreResult<Row> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject),
    }
}

fn select_live(
    conn: &Connection,
    collection: Collection,
    filter: &Filter,
    order: Option<&Order>,
) -> StoreResult<Vec<(String, Row)>> {
    let mut clauses = vec!["deleted_at IS NULL".to_string()];
    let mut params: Vec<SqlValue> = Vec::new();
    for (field, value) in filter.clauses() {
        push_eq(&mut clauses, &mut params, field, value)?;
    }

    let mut sql = format!(
        "SELECT id, data FROM {} WHERE {}",
        collection.table(),
        clauses.join(" AND ")
    );
    match order {
        Some(o) => {
            check_field(&o.field)?;
            params.push(SqlValue::Text(json_path(&o.field)));
            sql.push_str(if o.descending {
                " ORDER BY json_extract(data, ?) DESC, rowid"
            } else {
                " ORDER BY json_extract(data, ?) ASC, rowid"
            });
        }
        None => sql.push_str(" ORDER BY rowid"),
    }

    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(id, data)| Ok((id, parse_data(&data)?)))
        .collect()
}

fn insert_row(conn: &Connection, collection: Collection, mut row: Row) -> StoreResult<Row> {
    for field in row.keys() {
        check_field(field)?;
    }
    let id = match row.get("id") {
        Some(v) if !is_blank_key(v) => key_text(v),
        _ => {
            let id = Uuid::new_v4().to_string();
            row.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    };
    let now = now_stamp();
    // A soft-deleted row with the same id is revived in place.
    let n = conn.execute(
        &format!(
            "INSERT INTO {0}(id, data, created_at, updated_at) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = NULL
             WHERE {0}.deleted_at IS NOT NULL",
            collection.table()
        ),
        (&id, serde_json::to_string(&row)?, &now, &now),
    )?;
    if n == 0 {
        return Err(StoreError::DuplicateKey { collection, key: id });
    }
    Ok(row)
}

fn merge_into(
    conn: &Connection,
    collection: Collection,
    targets: Vec<(String, Row)>,
    patch: &Row,
) -> StoreResult<usize> {
    let now = now_stamp();
    let mut n = 0;
    for (id, mut data) in targets {
        for (k, v) in patch {
            // Row identity is fixed once inserted.
            if k == "id" {
                continue;
            }
            data.insert(k.clone(), v.clone());
        }
        n += conn.execute(
            &format!(
                "UPDATE {} SET data = ?, updated_at = ? WHERE id = ?",
                collection.table()
            ),
            (serde_json::to_string(&data)?, &now, &id),
        )?;
    }
    Ok(n)
}

fn update_rows(
    conn: &Connection,
    collection: Collection,
    patch: &Row,
    key_field: &str,
    key: &Value,
) -> StoreResult<usize> {
    for field in patch.keys() {
        check_field(field)?;
    }
    let targets = select_live(
        conn,
        collection,
        &Filter::all().eq(key_field, key.clone()),
        None,
    )?;
    merge_into(conn, collection, targets, patch)
}

/// `PersistenceService` over the workspace SQLite database.
///
/// Each collection table stores the record as JSON in `data`, mirrored `id`,
/// plus `created_at`/`updated_at`/`deleted_at` bookkeeping columns.
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl PersistenceService for SqliteStore<'_> {
    fn select(
        &self,
        collection: Collection,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Row>> {
        Ok(select_live(self.conn, collection, filter, order)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    fn insert(&mut self, collection: Collection, row: Row) -> StoreResult<Row> {
        insert_row(self.conn, collection, row)
    }

    fn update(
        &mut self,
        collection: Collection,
        patch: Row,
        key_field: &str,
        key: &Value,
    ) -> StoreResult<usize> {
        update_rows(self.conn, collection, &patch, key_field, key)
    }

    fn upsert(
        &mut self,
        collection: Collection,
        rows: Vec<Row>,
        conflict_key: &str,
    ) -> StoreResult<UpsertSummary> {
        check_field(conflict_key)?;
        // Dropping the transaction on an early return rolls the batch back.
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = UpsertSummary::default();
        for row in rows {
            let key = match row.get(conflict_key) {
                Some(v) if !is_blank_key(v) => v.clone(),
                _ => return Err(StoreError::MissingKey(conflict_key.to_string())),
            };
            let existing = select_live(
                &tx,
                collection,
                &Filter::all().eq(conflict_key, key),
                None,
            )?;
            if existing.is_empty() {
                insert_row(&tx, collection, row)?;
                summary.inserted += 1;
            } else {
                merge_into(&tx, collection, existing, &row)?;
                summary.updated += 1;
            }
        }
        tx.commit()?;
        Ok(summary)
    }

    fn delete(
        &mut self,
        collection: Collection,
        key_field: &str,
        key: &Value,
        soft: bool,
    ) -> StoreResult<usize> {
        let mut clauses = vec!["deleted_at IS NULL".to_string()];
        let mut params: Vec<SqlValue> = Vec::new();
        push_eq(&mut clauses, &mut params, key_field, key)?;
        let where_sql = clauses.join(" AND ");

        let n = if soft {
            let now = now_stamp();
            let mut all = vec![SqlValue::Text(now.clone()), SqlValue::Text(now)];
            all.extend(params);
            self.conn.execute(
                &format!(
                    "UPDATE {} SET deleted_at = ?, updated_at = ? WHERE {}",
                    collection.table(),
                    where_sql
                ),
                params_from_iter(all),
            )?
        } else {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE {}", collection.table(), where_sql),
                params_from_iter(params),
            )?
        };
        Ok(n)
    }
}
