//! SQL preprocessing for shell queries.
//!
//! Uses sqlparser-rs with the T-SQL dialect (the remote engine's flavour) to
//! find and expand wildcards, extract referenced tables and aliases, and infer
//! the typed output schema of a SELECT.

mod analyzer;
mod infer;

pub use analyzer::{QueryAnalyzer, TableAliasMap};
pub use infer::{finalize_column_names, SchemaInferrer, MAX_COLUMN_NAME_LENGTH, TRUNCATED_COLUMN_NAME_LENGTH};

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::{
    visit_relations, Ident, ObjectName, Query, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{Result, ShellQueryError};

/// T-SQL words that must be bracket-quoted when used as column names.
const RESERVED_WORDS: &[&str] = &[
    "ADD", "ALL", "ALTER", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN",
    "CROSS", "CURRENT", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXISTS",
    "FOR", "FROM", "FULL", "FUNCTION", "GROUP", "HAVING", "IN", "INDEX", "INNER", "INSERT", "INTO",
    "IS", "JOIN", "KEY", "LEFT", "LIKE", "NOT", "NULL", "OF", "ON", "OR", "ORDER", "OUTER",
    "PERCENT", "PRIMARY", "RIGHT", "SELECT", "SET", "TABLE", "THEN", "TO", "TOP", "UNION",
    "UNIQUE", "UPDATE", "USER", "VALUES", "VIEW", "WHEN", "WHERE", "WITH",
];

/// Parses SQL with the engine dialect.
pub(crate) fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(&MsSqlDialect {}, sql)
        .map_err(|e| ShellQueryError::inference(format!("SQL parse error: {e}")))
}

/// Returns the first statement of `statements` as a query, if it is one.
pub(crate) fn as_query(statements: &[Statement]) -> Option<&Query> {
    match statements.first() {
        Some(Statement::Query(query)) => Some(query),
        _ => None,
    }
}

/// Joins the parts of an object name with dots, without quoting.
pub(crate) fn object_name_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Flattens the relations of a FROM clause (main relations and joins).
pub(crate) fn relations(from: &[TableWithJoins]) -> Vec<&TableFactor> {
    let mut out = Vec::new();
    for twj in from {
        out.push(&twj.relation);
        for join in &twj.joins {
            out.push(&join.relation);
        }
    }
    out
}

/// Returns the alias of a relation, if it has one.
pub(crate) fn relation_alias(factor: &TableFactor) -> Option<&str> {
    match factor {
        TableFactor::Table { alias, .. }
        | TableFactor::Derived { alias, .. }
        | TableFactor::NestedJoin { alias, .. } => alias.as_ref().map(|a| a.name.value.as_str()),
        _ => None,
    }
}

/// Names of the CTEs defined directly on `query`, lowercased.
pub(crate) fn cte_names(query: &Query) -> HashSet<String> {
    query
        .with
        .as_ref()
        .map(|with| {
            with.cte_tables
                .iter()
                .map(|cte| cte.alias.name.value.to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Names of every CTE defined anywhere in the query tree, lowercased.
pub(crate) fn all_cte_names(query: &Query) -> HashSet<String> {
    let mut names = cte_names(query);
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            names.extend(all_cte_names(&cte.query));
        }
    }
    collect_nested_ctes(&query.body, &mut names);
    names
}

fn collect_nested_ctes(body: &SetExpr, names: &mut HashSet<String>) {
    match body {
        SetExpr::Query(query) => names.extend(all_cte_names(query)),
        SetExpr::SetOperation { left, right, .. } => {
            collect_nested_ctes(left, names);
            collect_nested_ctes(right, names);
        }
        SetExpr::Select(select) => {
            for factor in relations(&select.from) {
                if let TableFactor::Derived { subquery, .. } = factor {
                    names.extend(all_cte_names(subquery));
                }
            }
        }
        _ => {}
    }
}

/// Every relation name referenced by the statements, in encounter order and
/// without duplicates. Includes relations inside subqueries anywhere in the
/// statement; CTE references are excluded.
pub(crate) fn referenced_relations(statements: &[Statement]) -> Vec<String> {
    let ctes: HashSet<String> = statements
        .iter()
        .filter_map(|s| match s {
            Statement::Query(q) => Some(all_cte_names(q)),
            _ => None,
        })
        .flatten()
        .collect();

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for statement in statements {
        let _ = visit_relations(statement, |relation| {
            let name = object_name_string(relation);
            let key = name.to_lowercase();
            if !ctes.contains(&key) && seen.insert(key) {
                names.push(name);
            }
            ControlFlow::<()>::Continue(())
        });
    }
    names
}

/// Returns true if a column name must be bracket-quoted.
pub(crate) fn needs_quoting(name: &str) -> bool {
    static PLAIN: OnceLock<Option<Regex>> = OnceLock::new();
    let plain = PLAIN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    !plain || RESERVED_WORDS.iter().any(|w| w.eq_ignore_ascii_case(name))
}

/// Builds an identifier for a column name, bracket-quoting when required.
///
/// Names containing `]` cannot be bracket-quoted and are rejected.
pub(crate) fn column_ident(name: &str) -> Result<Ident> {
    if name.contains(']') {
        return Err(ShellQueryError::expansion(format!(
            "Field name '{name}' contains ']' and cannot be quoted"
        )));
    }
    if needs_quoting(name) {
        Ok(Ident::with_quote('[', name))
    } else {
        Ok(Ident::new(name))
    }
}
