//! Policy evaluation: connection access, allow-list matching, and the
//! optional SQL semantic gate.

use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;

use crate::config::{ConfigSnapshot, ConnectionDefinition, Policy, TagMatch};
use crate::error::BrokerError;

fn tags_match(conn_tags: &HashSet<String>, policy_tags: &HashSet<String>, mode: TagMatch) -> bool {
    if policy_tags.is_empty() {
        // An empty tag set under `any` never matches any connection;
        // under `all` it's vacuously true.
        return matches!(mode, TagMatch::All);
    }
    match mode {
        TagMatch::All => policy_tags.iter().all(|t| conn_tags.contains(t)),
        TagMatch::Any => policy_tags.iter().any(|t| conn_tags.contains(t)),
    }
}

fn connection_matches_policy(conn: &ConnectionDefinition, policy: &Policy) -> bool {
    tags_match(&conn.tags, &policy.tags, policy.tag_match)
}

pub struct Authorizer<'a> {
    snapshot: &'a ConfigSnapshot,
}

impl<'a> Authorizer<'a> {
    pub fn new(snapshot: &'a ConfigSnapshot) -> Self {
        Self { snapshot }
    }

    /// Connections the caller's roles can see at all, for `GET /connections`.
    pub fn accessible_connections(&self, roles: &HashSet<String>) -> Vec<&'a ConnectionDefinition> {
        self.snapshot
            .raw
            .connections
            .iter()
            .filter(|c| self.allow_list_for(roles, &c.name).is_ok())
            .collect()
    }

    /// Resolves `(roles, connection_name)` into the effective allow-list,
    /// or a [`BrokerError`] (`NotFound`/`Forbidden`).
    pub fn allow_list_for(
        &self,
        roles: &HashSet<String>,
        connection_name: &str,
    ) -> Result<Vec<String>, BrokerError> {
        let conn = self
            .snapshot
            .connection(connection_name)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown connection: {connection_name}")))?;

        let matching: Vec<&Policy> = self
            .snapshot
            .raw
            .policies
            .iter()
            .filter(|p| !p.roles.is_disjoint(roles) && connection_matches_policy(conn, p))
            .collect();

        if matching.is_empty() {
            return Err(BrokerError::Forbidden(format!(
                "no policy grants access to {connection_name}"
            )));
        }

        let mut allow_list: Vec<String> = Vec::new();
        for p in matching {
            for pat in &p.whitelist {
                if !allow_list.contains(pat) {
                    allow_list.push(pat.clone());
                }
            }
        }
        Ok(allow_list)
    }
}

/// Checks `input` against `allow_list`. An empty allow-list accepts
/// everything. Patterns that fail to compile are reported as errors, not
/// silently treated as non-matching.
pub fn validate_pattern(input: &str, allow_list: &[String]) -> Result<bool, BrokerError> {
    if allow_list.is_empty() {
        return Ok(true);
    }
    for pat in allow_list {
        let re = Regex::new(&format!("(?i){pat}"))
            .map_err(|e| BrokerError::ConfigError(format!("invalid pattern {pat:?}: {e}")))?;
        if re.is_match(input) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// SQL statement operations the semantic gate can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    Drop,
    Alter,
    Create,
    Grant,
}

impl SqlOperation {
    fn from_keyword(kw: &str) -> Option<Self> {
        match kw.to_ascii_uppercase().as_str() {
            "SELECT" | "WITH" => Some(SqlOperation::Select),
            "INSERT" => Some(SqlOperation::Insert),
            "UPDATE" => Some(SqlOperation::Update),
            "DELETE" => Some(SqlOperation::Delete),
            "TRUNCATE" => Some(SqlOperation::Truncate),
            "DROP" => Some(SqlOperation::Drop),
            "ALTER" => Some(SqlOperation::Alter),
            "CREATE" => Some(SqlOperation::Create),
            "GRANT" => Some(SqlOperation::Grant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Truncate => "TRUNCATE",
            SqlOperation::Drop => "DROP",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Create => "CREATE",
            SqlOperation::Grant => "GRANT",
        }
    }
}

/// One parsed statement: its operation plus every table it references,
/// including via JOIN and FROM-clause subqueries.
#[derive(Debug, Clone)]
pub struct ParsedStatement {
    pub operation: SqlOperation,
    pub tables: Vec<String>,
}

/// A minimal, hand-rolled scanner — not a full SQL parser — sufficient to
/// classify top-level operation and referenced tables for the semantic
/// gate. Good enough for the common single/multi-statement forms; anything
/// it can't confidently classify is treated as "no tables found" rather
/// than guessed.
pub fn parse_statements(sql: &str) -> Vec<ParsedStatement> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(parse_one_statement)
        .collect()
}

fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    for c in sql.chars() {
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '*' {
            cur.push(c);
        } else {
            if !cur.is_empty() {
                tokens.push(std::mem::take(&mut cur));
            }
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

fn parse_one_statement(sql: &str) -> Option<ParsedStatement> {
    let tokens = tokenize(sql);
    let first = tokens.first()?;
    let operation = SqlOperation::from_keyword(first)?;

    let mut tables = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let upper = tokens[i].to_ascii_uppercase();
        let introduces_table = matches!(upper.as_str(), "FROM" | "JOIN" | "INTO" | "UPDATE" | "TABLE");
        if introduces_table {
            if let Some(next) = tokens.get(i + 1) {
                let next_upper = next.to_ascii_uppercase();
                if !matches!(next_upper.as_str(), "SELECT" | "(" ) {
                    tables.push(next.clone());
                }
            }
        }
        i += 1;
    }
    tables.sort();
    tables.dedup();

    Some(ParsedStatement { operation, tables })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablePermission {
    pub operations: Vec<SqlOperation>,
    pub tables: Vec<String>,
}

fn table_pattern_matches(pattern: &str, table: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return table.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return table.ends_with(suffix);
    }
    pattern == table
}

/// Checks every `(operation, table)` pair referenced by `sql` against
/// `rules`; a multi-statement query must satisfy every operation on every
/// table it touches.
pub fn sql_semantic_check(sql: &str, rules: &[TablePermission]) -> Result<(), BrokerError> {
    for stmt in parse_statements(sql) {
        if stmt.tables.is_empty() {
            continue;
        }
        for table in &stmt.tables {
            let allowed = rules.iter().any(|r| {
                r.operations.contains(&stmt.operation)
                    && r.tables.iter().any(|t| table_pattern_matches(t, table))
            });
            if !allowed {
                return Err(BrokerError::Forbidden(format!(
                    "{} on {} is not permitted",
                    stmt.operation.as_str(),
                    table
                )));
            }
        }
    }
    Ok(())
}
