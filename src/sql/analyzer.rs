//! Wildcard detection and expansion, table and alias extraction.
//!
//! Expansion runs in three passes: a read-only walk collects the tables whose
//! columns are needed, their metadata is fetched (the only async step), then a
//! mutable walk splices explicit column lists in place of each star and the
//! statement is re-serialized.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::{Expr, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor};
use tracing::{debug, warn};

use super::{
    all_cte_names, column_ident, object_name_string, parse_sql, referenced_relations,
    relation_alias, relations,
};
use crate::error::{Result, ShellQueryError};
use crate::metadata::{normalize_table_name, resolve_fields, FieldDefinition, MetadataFetcher};

/// Alias → table name map for the relations of one statement.
///
/// Lookups are case-insensitive, matching the engine's identifier rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableAliasMap {
    entries: HashMap<String, String>,
}

impl TableAliasMap {
    /// Records `alias` as referring to `table`.
    pub fn insert(&mut self, alias: &str, table: &str) {
        self.entries.insert(alias.to_lowercase(), table.to_string());
    }

    /// Resolves an alias to its table name.
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.entries.get(&alias.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Inspects and rewrites SQL submitted to the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    /// Creates a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Returns true if any SELECT in `sql` projects `*` or `alias.*`.
    ///
    /// Falls back to a textual scan of the select lists when the SQL cannot be
    /// parsed.
    pub fn contains_select_star(&self, sql: &str) -> bool {
        match parse_sql(sql) {
            Ok(statements) => statements.iter().any(|statement| match statement {
                Statement::Query(query) => query_has_star(query),
                _ => false,
            }),
            Err(e) => {
                debug!("Falling back to heuristic star detection: {e}");
                heuristic_select_star(sql)
            }
        }
    }

    /// Returns the names of every table read by `sql`, including tables inside
    /// derived tables and subselects. Returns an empty set if parsing fails.
    pub fn extract_table_names(&self, sql: &str) -> BTreeSet<String> {
        match parse_sql(sql) {
            Ok(statements) => referenced_relations(&statements).into_iter().collect(),
            Err(e) => {
                debug!("Could not extract table names: {e}");
                BTreeSet::new()
            }
        }
    }

    /// Builds the alias map for every aliased table in `sql`.
    pub fn build_table_alias_map(&self, sql: &str) -> TableAliasMap {
        let mut map = TableAliasMap::default();
        if let Ok(statements) = parse_sql(sql) {
            for statement in &statements {
                if let Statement::Query(query) = statement {
                    collect_aliases(query, &mut map);
                }
            }
        }
        map
    }

    /// Rewrites every `SELECT *` / `SELECT alias.*` in `sql` into an explicit
    /// column list.
    ///
    /// Fails when an unqualified star is ambiguous (more than one FROM source)
    /// or when a target table has no metadata. If the rewritten statement does
    /// not survive re-serialization, the original SQL is returned unchanged.
    pub async fn expand_select_star(
        &self,
        sql: &str,
        fetcher: &dyn MetadataFetcher,
    ) -> Result<String> {
        let mut statements = match parse_sql(sql) {
            Ok(statements) => statements,
            Err(e) => {
                warn!("Cannot expand SELECT * in unparseable SQL: {e}");
                return Ok(sql.to_string());
            }
        };

        let mut needed = Vec::new();
        for statement in &statements {
            if let Statement::Query(query) = statement {
                let ctes = all_cte_names(query);
                collect_star_tables(query, &ctes, &mut needed)?;
            }
        }

        let mut fields = HashMap::new();
        for table in needed {
            let key = table_key(&table);
            if fields.contains_key(&key) {
                continue;
            }
            match resolve_fields(fetcher, &table).await? {
                Some(found) if !found.is_empty() => {
                    fields.insert(key, found);
                }
                _ => {
                    return Err(ShellQueryError::expansion(format!(
                        "No metadata found for table '{table}'"
                    )));
                }
            }
        }

        let mut expander = Expander {
            fields: &fields,
            cte_columns: HashMap::new(),
        };
        for statement in statements.iter_mut() {
            if let Statement::Query(query) = statement {
                expander.expand_query(query)?;
            }
        }

        let rendered = statements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";\n");

        match parse_sql(&rendered) {
            Ok(_) => Ok(rendered),
            Err(e) => {
                warn!("Expanded SQL failed to re-parse, keeping original: {e}");
                Ok(sql.to_string())
            }
        }
    }
}

fn table_key(table: &str) -> String {
    normalize_table_name(table).to_lowercase()
}

fn is_star(item: &SelectItem) -> bool {
    matches!(
        item,
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
    )
}

fn query_has_star(query: &Query) -> bool {
    let in_ctes = query
        .with
        .as_ref()
        .is_some_and(|with| with.cte_tables.iter().any(|cte| query_has_star(&cte.query)));
    in_ctes || set_expr_has_star(&query.body)
}

fn set_expr_has_star(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => {
            select.projection.iter().any(is_star)
                || relations(&select.from).into_iter().any(|factor| match factor {
                    TableFactor::Derived { subquery, .. } => query_has_star(subquery),
                    _ => false,
                })
        }
        SetExpr::Query(query) => query_has_star(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_has_star(left) || set_expr_has_star(right)
        }
        _ => false,
    }
}

/// Scans the text between each SELECT and FROM for a bare `*` select item.
fn heuristic_select_star(sql: &str) -> bool {
    static SELECT_LIST: OnceLock<Option<Regex>> = OnceLock::new();
    static MODIFIERS: OnceLock<Option<Regex>> = OnceLock::new();
    let (Some(select_list), Some(modifiers)) = (
        SELECT_LIST
            .get_or_init(|| Regex::new(r"(?is)\bselect\b(.*?)\bfrom\b").ok())
            .as_ref(),
        MODIFIERS
            .get_or_init(|| {
                Regex::new(r"(?i)^(distinct|all)\s+|^top\s*\(?\s*\d+\s*\)?(\s+percent)?\s*").ok()
            })
            .as_ref(),
    ) else {
        return false;
    };

    select_list.captures_iter(sql).any(|caps| {
        split_top_level(&caps[1]).into_iter().any(|item| {
            let mut item = item.trim().to_string();
            while let Some(m) = modifiers.find(&item) {
                if m.as_str().is_empty() {
                    break;
                }
                item = item[m.end()..].trim_start().to_string();
            }
            item == "*" || item.ends_with(".*")
        })
    })
}

/// Splits a select list on commas that are not inside parentheses.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&list[start..]);
    items
}

fn collect_aliases(query: &Query, map: &mut TableAliasMap) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_aliases(&cte.query, map);
        }
    }
    collect_set_expr_aliases(&query.body, map);
}

fn collect_set_expr_aliases(body: &SetExpr, map: &mut TableAliasMap) {
    match body {
        SetExpr::Select(select) => {
            for factor in relations(&select.from) {
                collect_factor_aliases(factor, map);
            }
        }
        SetExpr::Query(query) => collect_aliases(query, map),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr_aliases(left, map);
            collect_set_expr_aliases(right, map);
        }
        _ => {}
    }
}

fn collect_factor_aliases(factor: &TableFactor, map: &mut TableAliasMap) {
    match factor {
        TableFactor::Table {
            name,
            alias: Some(alias),
            ..
        } => map.insert(&alias.name.value, &object_name_string(name)),
        TableFactor::Derived { subquery, .. } => collect_aliases(subquery, map),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            for inner in relations(std::slice::from_ref(&**table_with_joins)) {
                collect_factor_aliases(inner, map);
            }
        }
        _ => {}
    }
}

/// Where a star's columns come from.
enum StarSource<'a> {
    /// A relation in the SELECT's FROM clause.
    Relation(&'a TableFactor),
    /// A qualifier that matched nothing in FROM; treated as a table name.
    Literal(String),
}

/// Locates the source of a star select item. Returns `None` for non-star items.
fn locate_star<'a>(
    item: &SelectItem,
    select: &'a Select,
) -> Result<Option<(Option<ObjectName>, StarSource<'a>)>> {
    match item {
        SelectItem::Wildcard(_) => {
            let sources = relations(&select.from);
            match sources.as_slice() {
                [single] => Ok(Some((None, StarSource::Relation(single)))),
                [] => Err(ShellQueryError::expansion(
                    "SELECT * requires a FROM clause",
                )),
                _ => Err(ShellQueryError::expansion(
                    "SELECT * is ambiguous with more than one table in FROM; qualify the star (alias.*)",
                )),
            }
        }
        SelectItem::QualifiedWildcard(prefix, _) => {
            let wanted = object_name_string(prefix);
            let found = relations(&select.from).into_iter().find(|factor| {
                if relation_alias(factor).is_some_and(|a| a.eq_ignore_ascii_case(&wanted)) {
                    return true;
                }
                match factor {
                    TableFactor::Table { name, .. } => {
                        table_key(&object_name_string(name)) == table_key(&wanted)
                    }
                    _ => false,
                }
            });
            let source = match found {
                Some(factor) => StarSource::Relation(factor),
                None => StarSource::Literal(wanted),
            };
            Ok(Some((Some(prefix.clone()), source)))
        }
        _ => Ok(None),
    }
}

fn collect_star_tables(query: &Query, ctes: &HashSet<String>, out: &mut Vec<String>) -> Result<()> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_star_tables(&cte.query, ctes, out)?;
        }
    }
    collect_set_expr_star_tables(&query.body, ctes, out)
}

fn collect_set_expr_star_tables(
    body: &SetExpr,
    ctes: &HashSet<String>,
    out: &mut Vec<String>,
) -> Result<()> {
    match body {
        SetExpr::Select(select) => {
            for factor in relations(&select.from) {
                if let TableFactor::Derived { subquery, .. } = factor {
                    collect_star_tables(subquery, ctes, out)?;
                }
            }
            for item in &select.projection {
                let table = match locate_star(item, select)? {
                    Some((_, StarSource::Relation(TableFactor::Table { name, .. }))) => {
                        object_name_string(name)
                    }
                    Some((_, StarSource::Literal(name))) => name,
                    _ => continue,
                };
                if !ctes.contains(&table.to_lowercase()) {
                    out.push(table);
                }
            }
            Ok(())
        }
        SetExpr::Query(query) => collect_star_tables(query, ctes, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr_star_tables(left, ctes, out)?;
            collect_set_expr_star_tables(right, ctes, out)
        }
        _ => Ok(()),
    }
}

/// Output column names of a query, when every column has a usable name.
fn output_column_names(query: &Query) -> Option<Vec<String>> {
    let mut body = query.body.as_ref();
    loop {
        match body {
            SetExpr::Select(select) => {
                return select
                    .projection
                    .iter()
                    .map(|item| match item {
                        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
                        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                            Some(ident.value.clone())
                        }
                        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                            parts.last().map(|ident| ident.value.clone())
                        }
                        _ => None,
                    })
                    .collect();
            }
            SetExpr::Query(inner) => body = inner.body.as_ref(),
            SetExpr::SetOperation { left, .. } => body = left.as_ref(),
            _ => return None,
        }
    }
}

struct Expander<'a> {
    fields: &'a HashMap<String, Vec<FieldDefinition>>,
    cte_columns: HashMap<String, Vec<String>>,
}

impl Expander<'_> {
    fn expand_query(&mut self, query: &mut Query) -> Result<()> {
        if let Some(with) = query.with.as_mut() {
            for cte in with.cte_tables.iter_mut() {
                self.expand_query(&mut cte.query)?;
                if let Some(columns) = output_column_names(&cte.query) {
                    self.cte_columns
                        .insert(cte.alias.name.value.to_lowercase(), columns);
                }
            }
        }
        self.expand_set_expr(&mut query.body)
    }

    fn expand_set_expr(&mut self, body: &mut SetExpr) -> Result<()> {
        match body {
            SetExpr::Select(select) => self.expand_select(select),
            SetExpr::Query(query) => self.expand_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.expand_set_expr(left)?;
                self.expand_set_expr(right)
            }
            _ => Ok(()),
        }
    }

    fn expand_select(&mut self, select: &mut Select) -> Result<()> {
        for twj in select.from.iter_mut() {
            if let TableFactor::Derived { subquery, .. } = &mut twj.relation {
                self.expand_query(subquery)?;
            }
            for join in twj.joins.iter_mut() {
                if let TableFactor::Derived { subquery, .. } = &mut join.relation {
                    self.expand_query(subquery)?;
                }
            }
        }

        if !select.projection.iter().any(is_star) {
            return Ok(());
        }

        let mut replacements = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            replacements.push(match locate_star(item, select)? {
                Some((qualifier, source)) => Some((qualifier, self.columns_for(source)?)),
                None => None,
            });
        }

        let original = std::mem::take(&mut select.projection);
        for (item, replacement) in original.into_iter().zip(replacements) {
            match replacement {
                None => select.projection.push(item),
                Some((qualifier, columns)) => {
                    for column in columns {
                        let ident = column_ident(&column)?;
                        let expr = match &qualifier {
                            Some(prefix) => {
                                let mut parts = prefix.0.clone();
                                parts.push(ident);
                                Expr::CompoundIdentifier(parts)
                            }
                            None => Expr::Identifier(ident),
                        };
                        select.projection.push(SelectItem::UnnamedExpr(expr));
                    }
                }
            }
        }
        Ok(())
    }

    fn columns_for(&self, source: StarSource<'_>) -> Result<Vec<String>> {
        let table = match source {
            StarSource::Relation(TableFactor::Table { name, .. }) => object_name_string(name),
            StarSource::Relation(TableFactor::Derived { subquery, .. }) => {
                return output_column_names(subquery).ok_or_else(|| {
                    ShellQueryError::expansion(
                        "Cannot expand * over a derived table with unnamed columns",
                    )
                });
            }
            StarSource::Relation(_) => {
                return Err(ShellQueryError::expansion(
                    "SELECT * is only supported over tables and derived tables",
                ));
            }
            StarSource::Literal(name) => name,
        };

        if let Some(columns) = self.cte_columns.get(&table.to_lowercase()) {
            return Ok(columns.clone());
        }

        self.fields
            .get(&table_key(&table))
            .map(|fields| fields.iter().map(|f| f.name.clone()).collect())
            .ok_or_else(|| {
                ShellQueryError::expansion(format!("No metadata found for table '{table}'"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldType, MetadataFetcher};
    use async_trait::async_trait;

    struct StaticFetcher(HashMap<String, Vec<FieldDefinition>>);

    impl StaticFetcher {
        fn new(tables: &[(&str, Vec<FieldDefinition>)]) -> Self {
            Self(
                tables
                    .iter()
                    .map(|(name, fields)| (name.to_lowercase(), fields.clone()))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl MetadataFetcher for StaticFetcher {
        async fn get_fields_for_table(
            &self,
            table: &str,
        ) -> Result<Option<Vec<FieldDefinition>>> {
            Ok(self.0.get(&table.to_lowercase()).cloned())
        }
    }

    fn de_fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("ID", FieldType::Number),
            FieldDefinition::text("Name", 100),
        ]
    }

    #[test]
    fn test_contains_select_star() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer.contains_select_star("SELECT * FROM DE"));
        assert!(analyzer.contains_select_star("SELECT d.* FROM DE d"));
        assert!(analyzer.contains_select_star(
            "SELECT Id FROM (SELECT * FROM DE) sub"
        ));
        assert!(!analyzer.contains_select_star("SELECT COUNT(*) FROM DE"));
        assert!(!analyzer.contains_select_star("SELECT Id, Name FROM DE"));
    }

    #[test]
    fn test_contains_select_star_heuristic_on_parse_failure() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer.contains_select_star("SELECT TOP 5 * FROM DE WHERE ((("));
        assert!(analyzer.contains_select_star("SELECT DISTINCT a.* FROM DE a WHERE ((("));
        assert!(!analyzer.contains_select_star("SELECT COUNT(*) FROM DE WHERE ((("));
    }

    #[test]
    fn test_extract_table_names_recurses_into_derived_tables() {
        let analyzer = QueryAnalyzer::new();
        let names = analyzer.extract_table_names(
            "SELECT s.SubscriberKey FROM (SELECT SubscriberKey FROM _Open) s \
             JOIN ENT.Customers c ON c.Key = s.SubscriberKey",
        );
        assert!(names.contains("_Open"));
        assert!(names.contains("ENT.Customers"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_extract_table_names_parse_failure_is_empty() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer.extract_table_names("SELECT FROM WHERE (((").is_empty());
    }

    #[test]
    fn test_build_table_alias_map() {
        let analyzer = QueryAnalyzer::new();
        let map = analyzer.build_table_alias_map(
            "SELECT o.Id FROM Orders AS o INNER JOIN [Customer Master] cm ON cm.Id = o.CustomerId",
        );
        assert_eq!(map.resolve("o"), Some("Orders"));
        assert_eq!(map.resolve("CM"), Some("Customer Master"));
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_expand_simple_star() {
        let fetcher = StaticFetcher::new(&[("DE", de_fields())]);
        let sql = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM DE", &fetcher)
            .await
            .unwrap();
        assert!(sql.contains("ID, Name"), "got: {sql}");
        assert!(!sql.contains('*'));
    }

    #[tokio::test]
    async fn test_expand_qualified_star_uses_alias() {
        let fetcher = StaticFetcher::new(&[
            ("DE", de_fields()),
            ("Orders", vec![FieldDefinition::new("Total", FieldType::Decimal)]),
        ]);
        let sql = QueryAnalyzer::new()
            .expand_select_star(
                "SELECT d.*, o.Total FROM DE d JOIN Orders o ON o.ID = d.ID",
                &fetcher,
            )
            .await
            .unwrap();
        assert!(sql.contains("d.ID, d.Name, o.Total"), "got: {sql}");
    }

    #[tokio::test]
    async fn test_expand_unqualified_star_with_join_is_ambiguous() {
        let fetcher = StaticFetcher::new(&[("A", de_fields()), ("B", de_fields())]);
        let err = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM A JOIN B ON A.ID = B.ID", &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellQueryError::SelectStarExpansionFailed(_)));
    }

    #[tokio::test]
    async fn test_expand_unqualified_star_with_comma_join_is_ambiguous() {
        let fetcher = StaticFetcher::new(&[("A", de_fields()), ("B", de_fields())]);
        let result = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM A, B", &fetcher)
            .await;
        assert!(matches!(
            result,
            Err(ShellQueryError::SelectStarExpansionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_expand_missing_metadata_names_table() {
        let fetcher = StaticFetcher::new(&[]);
        let err = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM Missing", &fetcher)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[tokio::test]
    async fn test_expand_system_view_without_fetch() {
        let fetcher = StaticFetcher::new(&[]);
        let sql = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM ENT._Sent", &fetcher)
            .await
            .unwrap();
        assert!(sql.contains("SubscriberKey"));
        assert!(sql.contains("EventDate"));
    }

    #[tokio::test]
    async fn test_expand_brackets_names_that_need_quoting() {
        let fetcher = StaticFetcher::new(&[(
            "Contacts",
            vec![
                FieldDefinition::text("First Name", 50),
                FieldDefinition::text("Key", 36),
            ],
        )]);
        let sql = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM Contacts", &fetcher)
            .await
            .unwrap();
        assert!(sql.contains("[First Name], [Key]"), "got: {sql}");
    }

    #[tokio::test]
    async fn test_expand_rejects_field_with_closing_bracket() {
        let fetcher = StaticFetcher::new(&[("Odd", vec![FieldDefinition::text("a]b", 10)])]);
        let result = QueryAnalyzer::new()
            .expand_select_star("SELECT * FROM Odd", &fetcher)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_expand_star_over_derived_table() {
        let fetcher = StaticFetcher::new(&[("DE", de_fields())]);
        let sql = QueryAnalyzer::new()
            .expand_select_star(
                "SELECT * FROM (SELECT ID, Name AS FullName FROM DE) sub",
                &fetcher,
            )
            .await
            .unwrap();
        assert!(sql.starts_with("SELECT ID, FullName FROM"), "got: {sql}");
    }

    #[tokio::test]
    async fn test_expand_star_over_cte() {
        let fetcher = StaticFetcher::new(&[("DE", de_fields())]);
        let sql = QueryAnalyzer::new()
            .expand_select_star(
                "WITH base AS (SELECT * FROM DE) SELECT * FROM base",
                &fetcher,
            )
            .await
            .unwrap();
        assert!(!sql.contains('*'), "got: {sql}");
        assert!(sql.ends_with("SELECT ID, Name FROM base"), "got: {sql}");
    }

    #[tokio::test]
    async fn test_expand_without_star_is_unchanged_semantically() {
        let fetcher = StaticFetcher::new(&[]);
        let sql = QueryAnalyzer::new()
            .expand_select_star("SELECT ID FROM DE", &fetcher)
            .await
            .unwrap();
        assert_eq!(sql, "SELECT ID FROM DE");
    }

    #[tokio::test]
    async fn test_expand_unparseable_sql_returns_original() {
        let fetcher = StaticFetcher::new(&[]);
        let original = "SELECT * FROM DE WHERE (((";
        let sql = QueryAnalyzer::new()
            .expand_select_star(original, &fetcher)
            .await
            .unwrap();
        assert_eq!(sql, original);
    }
}
