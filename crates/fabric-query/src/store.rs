//! Local registry store seam.
//!
//! The engine only needs two things from the node's own database: run a
//! query and report which registry a node's store belongs to. `MemoryStore`
//! is the in-process implementation used by the simulator and tests; it
//! understands `SELECT *|col, ... FROM table [WHERE col = literal [AND ...]]`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use fabric_protocol::{NodeId, Row, Value};

/// Failure executing a query against the local store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LocalQueryError {
    #[error("Unsupported query: {0}")]
    Parse(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A node's local registry database.
pub trait LocalStore: Send + Sync {
    /// Run `query_text` against this node's own data.
    fn execute(&self, query_text: &str) -> Result<Vec<Row>, LocalQueryError>;

    /// Registry UID of the store backing `node`, when known.
    ///
    /// Two nodes reporting the same UID share one database, so a child
    /// need not run the query again for its parent.
    fn registry_uid_of(&self, _node: &NodeId) -> Option<String> {
        None
    }
}

/// In-memory table store.
#[derive(Default)]
pub struct MemoryStore {
    /// Tables keyed by upper-cased name.
    tables: RwLock<HashMap<String, Vec<Row>>>,
    registry_uids: RwLock<HashMap<NodeId, String>>,
    failure: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of `table`.
    pub fn insert_table(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_ascii_uppercase(), rows);
    }

    pub fn insert_row(&self, table: &str, row: Row) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_ascii_uppercase())
            .or_default()
            .push(row);
    }

    /// Record which registry `node`'s store belongs to.
    pub fn publish_registry_uid(&self, node: NodeId, registry_uid: impl Into<String>) {
        self.registry_uids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, registry_uid.into());
    }

    /// Make every subsequent query fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl LocalStore for MemoryStore {
    fn execute(&self, query_text: &str) -> Result<Vec<Row>, LocalQueryError> {
        if let Some(message) = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(LocalQueryError::Unavailable(message));
        }

        let select = Select::parse(query_text)?;
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let rows = tables
            .get(&select.table.to_ascii_uppercase())
            .ok_or_else(|| LocalQueryError::UnknownTable(select.table.clone()))?;

        Ok(rows
            .iter()
            .filter(|row| select.filters.iter().all(|(col, expected)| matches(row, col, expected)))
            .map(|row| select.project(row))
            .collect())
    }

    fn registry_uid_of(&self, node: &NodeId) -> Option<String> {
        let uids = self.registry_uids.read().unwrap_or_else(PoisonError::into_inner);
        uids.get(node)
            .or_else(|| {
                uids.iter()
                    .find(|(known, _)| known.same_node(node))
                    .map(|(_, uid)| uid)
            })
            .cloned()
    }
}

// ─── SELECT subset ──────────────────────────────────────────────

#[derive(Debug)]
struct Select {
    /// `None` selects every column.
    columns: Option<Vec<String>>,
    table: String,
    filters: Vec<(String, Value)>,
}

impl Select {
    fn parse(text: &str) -> Result<Self, LocalQueryError> {
        let text = text.trim().trim_end_matches(';').trim();
        let upper = text.to_ascii_uppercase();
        if !upper.starts_with("SELECT ") {
            return Err(LocalQueryError::Parse("only SELECT statements are supported".into()));
        }
        let from_at = find_keyword(&upper, "FROM")
            .ok_or_else(|| LocalQueryError::Parse("missing FROM clause".into()))?;

        let projection = text["SELECT".len()..from_at].trim();
        let columns = if projection == "*" {
            None
        } else {
            let cols: Vec<String> = projection
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if cols.is_empty() {
                return Err(LocalQueryError::Parse("empty column list".into()));
            }
            Some(cols)
        };

        let rest = text[from_at + "FROM".len()..].trim();
        let rest_upper = rest.to_ascii_uppercase();
        let (table, where_clause) = match find_keyword(&rest_upper, "WHERE") {
            Some(at) => (rest[..at].trim(), Some(rest[at + "WHERE".len()..].trim())),
            None => (rest, None),
        };
        if table.is_empty() || table.contains(char::is_whitespace) {
            return Err(LocalQueryError::Parse(format!("bad table reference '{table}'")));
        }

        let mut filters = Vec::new();
        if let Some(clause) = where_clause {
            for condition in split_keyword(clause, "AND") {
                let (col, literal) = condition.split_once('=').ok_or_else(|| {
                    LocalQueryError::Parse(format!("expected col = value, got '{condition}'"))
                })?;
                let col = col.trim();
                if col.is_empty() {
                    return Err(LocalQueryError::Parse("missing column in WHERE".into()));
                }
                filters.push((col.to_string(), parse_literal(literal)));
            }
        }

        Ok(Self {
            columns,
            table: table.to_string(),
            filters,
        })
    }

    fn project(&self, row: &Row) -> Row {
        match &self.columns {
            None => row.clone(),
            Some(cols) => cols
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect(),
        }
    }
}

/// Byte offset of `keyword` as a whole word in upper-cased `text`.
fn find_keyword(upper: &str, keyword: &str) -> Option<usize> {
    upper.match_indices(keyword).map(|(at, _)| at).find(|&at| {
        let before = upper[..at].chars().next_back();
        let after = upper[at + keyword.len()..].chars().next();
        before.is_some_and(char::is_whitespace) && after.map_or(true, char::is_whitespace)
    })
}

fn split_keyword<'a>(text: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = text;
    loop {
        let upper = rest.to_ascii_uppercase();
        match find_keyword(&upper, keyword) {
            Some(at) => {
                parts.push(rest[..at].trim());
                rest = &rest[at + keyword.len()..];
            }
            None => {
                parts.push(rest.trim());
                return parts;
            }
        }
    }
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')));
    if quoted {
        return Value::Text(raw[1..raw.len() - 1].to_string());
    }
    if raw.eq_ignore_ascii_case("NULL") {
        Value::Null
    } else if raw.eq_ignore_ascii_case("TRUE") {
        Value::Bool(true)
    } else if raw.eq_ignore_ascii_case("FALSE") {
        Value::Bool(false)
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Text(raw.to_string())
    }
}

fn matches(row: &Row, column: &str, expected: &Value) -> bool {
    match (row.get(column), expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(Value::Int(a)), Value::Float(b)) => (*a as f64) == *b,
        (Some(Value::Float(a)), Value::Int(b)) => *a == (*b as f64),
        (Some(actual), Value::Text(text)) => actual.as_text().as_deref() == Some(text.as_str()),
        (Some(actual), expected) => actual == expected,
    }
}
