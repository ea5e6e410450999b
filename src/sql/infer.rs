//! Output schema inference for SELECT statements.
//!
//! Columns are typed from table metadata where they are direct references and
//! from a fixed rule set otherwise. Stars are expected to have been expanded
//! already; a bare star in the projection is skipped.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Query,
    Select, SelectItem, SetExpr, TableFactor, UnaryOperator, Value,
};
use tracing::debug;

use super::{as_query, object_name_string, parse_sql, referenced_relations, relations};
use crate::error::{Result, ShellQueryError};
use crate::metadata::{
    normalize_table_name, resolve_fields, FieldDefinition, FieldType, InferredField,
    MetadataFetcher, DEFAULT_TEXT_LENGTH, STRING_FUNCTION_LENGTH,
};

/// Longest column name the engine accepts without truncation.
pub const MAX_COLUMN_NAME_LENGTH: usize = 50;

/// Length that over-long column names are cut down to.
pub const TRUNCATED_COLUMN_NAME_LENGTH: usize = 45;

const DECIMAL_SCALE: u32 = 2;
const DECIMAL_PRECISION: u32 = 18;

const STRING_FUNCTIONS: &[&str] = &[
    "UPPER", "LOWER", "TRIM", "LTRIM", "RTRIM", "CONCAT", "CONCAT_WS", "SUBSTRING", "LEFT",
    "RIGHT", "REPLACE", "REPLICATE", "REVERSE", "STUFF", "FORMAT", "LEN",
];
const DATE_FUNCTIONS: &[&str] = &["GETDATE", "GETUTCDATE", "SYSDATETIME", "DATEADD"];
const DATE_PART_FUNCTIONS: &[&str] = &["DATEDIFF", "DATEPART", "YEAR", "MONTH", "DAY"];

type TableFields = HashMap<String, Option<Vec<FieldDefinition>>>;
type CteColumns = HashMap<String, Vec<InferredField>>;

/// Derives the typed output columns of a SELECT.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaInferrer;

impl SchemaInferrer {
    pub fn new() -> Self {
        Self
    }

    /// Infers the output schema with engine-safe column names: names longer
    /// than [`MAX_COLUMN_NAME_LENGTH`] are truncated and duplicates suffixed.
    pub async fn infer_schema(
        &self,
        sql: &str,
        fetcher: &dyn MetadataFetcher,
    ) -> Result<Vec<InferredField>> {
        let columns = self.infer_columns(sql, fetcher).await?;
        Ok(finalize_column_names(columns))
    }

    /// Infers the output columns with their names as written in the query.
    pub async fn infer_columns(
        &self,
        sql: &str,
        fetcher: &dyn MetadataFetcher,
    ) -> Result<Vec<InferredField>> {
        let statements = parse_sql(sql)?;
        let query = as_query(&statements)
            .ok_or_else(|| ShellQueryError::inference("Only SELECT statements are supported"))?;

        let mut tables = TableFields::new();
        for table in referenced_relations(std::slice::from_ref(&statements[0])) {
            let key = table_key(&table);
            if !tables.contains_key(&key) {
                let fields = resolve_fields(fetcher, &table).await?;
                if fields.is_none() {
                    debug!(table = %table, "No metadata for referenced table");
                }
                tables.insert(key, fields);
            }
        }

        Inference { tables: &tables }.query(query, &CteColumns::new())
    }
}

/// Truncates over-long names and disambiguates duplicates (case-insensitive)
/// by appending `_1`, `_2`, ... in encounter order.
pub fn finalize_column_names(fields: Vec<InferredField>) -> Vec<InferredField> {
    let mut seen = HashSet::new();
    fields
        .into_iter()
        .map(|mut field| {
            if field.name.chars().count() > MAX_COLUMN_NAME_LENGTH {
                field.name = field.name.chars().take(TRUNCATED_COLUMN_NAME_LENGTH).collect();
            }
            if !seen.insert(field.name.to_lowercase()) {
                let base = field.name.clone();
                let mut n = 1;
                loop {
                    let candidate = format!("{base}_{n}");
                    if seen.insert(candidate.to_lowercase()) {
                        field.name = candidate;
                        break;
                    }
                    n += 1;
                }
            }
            field
        })
        .collect()
}

fn table_key(table: &str) -> String {
    normalize_table_name(table).to_lowercase()
}

fn text(length: u32) -> InferredField {
    InferredField::new("", FieldType::Text).with_max_length(length)
}

fn default_text() -> InferredField {
    text(DEFAULT_TEXT_LENGTH)
}

fn typed(field_type: FieldType) -> InferredField {
    InferredField::new("", field_type)
}

fn decimal(scale: u32, precision: u32) -> InferredField {
    typed(FieldType::Decimal).with_decimal(scale, precision)
}

/// One relation visible to a SELECT's projection.
struct Source {
    alias: Option<String>,
    table: Option<String>,
    /// `None` when the relation's columns are unknown.
    fields: Option<Vec<InferredField>>,
}

impl Source {
    fn matches(&self, qualifier: &str) -> bool {
        self.alias
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(qualifier))
            || self
                .table
                .as_deref()
                .is_some_and(|t| table_key(t) == table_key(qualifier))
    }

    fn column(&self, name: &str) -> Option<&InferredField> {
        self.fields
            .as_ref()?
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    fn describe(&self) -> &str {
        self.table
            .as_deref()
            .or(self.alias.as_deref())
            .unwrap_or("derived table")
    }
}

struct Scope<'a> {
    sources: Vec<Source>,
    ctes: &'a CteColumns,
}

struct Inference<'a> {
    tables: &'a TableFields,
}

impl Inference<'_> {
    fn query(&self, query: &Query, ctes: &CteColumns) -> Result<Vec<InferredField>> {
        let mut local = ctes.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let columns = self.query(&cte.query, &local)?;
                local.insert(cte.alias.name.value.to_lowercase(), columns);
            }
        }
        self.set_expr(&query.body, &local)
    }

    fn set_expr(&self, body: &SetExpr, ctes: &CteColumns) -> Result<Vec<InferredField>> {
        match body {
            SetExpr::Select(select) => self.select(select, ctes),
            SetExpr::Query(query) => self.query(query, ctes),
            // A set operation's columns are named and typed by its first branch.
            SetExpr::SetOperation { left, .. } => self.set_expr(left, ctes),
            _ => Err(ShellQueryError::inference(
                "Only SELECT queries can be used to infer a schema",
            )),
        }
    }

    fn select(&self, select: &Select, ctes: &CteColumns) -> Result<Vec<InferredField>> {
        let mut sources = Vec::new();
        for factor in relations(&select.from) {
            self.collect_sources(factor, ctes, &mut sources)?;
        }
        let scope = Scope { sources, ctes };

        let mut columns = Vec::with_capacity(select.projection.len());
        for (index, item) in select.projection.iter().enumerate() {
            let (expr, name) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, column_name(expr, index)),
                SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.clone()),
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => continue,
            };
            let mut field = self.expr(expr, &scope)?;
            field.name = name;
            columns.push(field);
        }

        if columns.is_empty() {
            return Err(ShellQueryError::inference(
                "Cannot infer schema: the query selects no explicit columns",
            ));
        }
        Ok(columns)
    }

    fn collect_sources(
        &self,
        factor: &TableFactor,
        ctes: &CteColumns,
        out: &mut Vec<Source>,
    ) -> Result<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = object_name_string(name);
                let fields = match ctes.get(&table.to_lowercase()) {
                    Some(columns) => Some(columns.clone()),
                    None => self.tables.get(&table_key(&table)).cloned().flatten().map(|defs| {
                        defs.iter()
                            .map(|d| InferredField::from_definition(d.name.clone(), d))
                            .collect()
                    }),
                };
                out.push(Source {
                    alias: alias.as_ref().map(|a| a.name.value.clone()),
                    table: Some(table),
                    fields,
                });
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => out.push(Source {
                alias: alias.as_ref().map(|a| a.name.value.clone()),
                table: None,
                fields: Some(self.query(subquery, ctes)?),
            }),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                for inner in relations(std::slice::from_ref(&**table_with_joins)) {
                    self.collect_sources(inner, ctes, out)?;
                }
            }
            _ => out.push(Source {
                alias: super::relation_alias(factor).map(str::to_string),
                table: None,
                fields: None,
            }),
        }
        Ok(())
    }

    /// Infers an expression, falling back to the default text type when a
    /// column it references cannot be resolved.
    fn lenient(&self, expr: &Expr, scope: &Scope<'_>) -> InferredField {
        self.expr(expr, scope).unwrap_or_else(|_| default_text())
    }

    fn expr(&self, expr: &Expr, scope: &Scope<'_>) -> Result<InferredField> {
        match expr {
            Expr::Identifier(ident) => self.column(None, &ident.value, scope),
            Expr::CompoundIdentifier(parts) => match parts.split_last() {
                Some((column, [])) => self.column(None, &column.value, scope),
                Some((column, qualifier)) => {
                    let qualifier = qualifier
                        .iter()
                        .map(|p| p.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".");
                    self.column(Some(&qualifier), &column.value, scope)
                }
                None => Ok(default_text()),
            },
            Expr::Nested(inner) => self.expr(inner, scope),
            Expr::UnaryOp {
                op: UnaryOperator::Minus | UnaryOperator::Plus,
                expr,
            } => self.expr(expr, scope),
            Expr::Function(function) => Ok(self.function(function, scope)),
            Expr::BinaryOp { left, op, right } => Ok(self.binary(left, op, right, scope)),
            Expr::Value(value) => Ok(literal(value)),
            Expr::Case {
                results,
                else_result,
                ..
            } => Ok(results
                .first()
                .or(else_result.as_deref())
                .map(|branch| self.lenient(branch, scope))
                .unwrap_or_else(default_text)),
            Expr::Cast { data_type, .. } => Ok(map_data_type(&data_type.to_string())),
            Expr::Convert { data_type, .. } => Ok(data_type
                .as_ref()
                .map(|dt| map_data_type(&dt.to_string()))
                .unwrap_or_else(default_text)),
            Expr::Substring { .. } | Expr::Trim { .. } => Ok(text(STRING_FUNCTION_LENGTH)),
            Expr::Extract { .. } => Ok(typed(FieldType::Number)),
            Expr::Subquery(query) => Ok(self
                .query(query, scope.ctes)
                .ok()
                .and_then(|columns| columns.into_iter().next())
                .unwrap_or_else(default_text)),
            _ => Ok(default_text()),
        }
    }

    /// Resolves a direct column reference.
    ///
    /// A column missing from known metadata is typed as default text; a
    /// reference whose table has no metadata at all fails.
    fn column(
        &self,
        qualifier: Option<&str>,
        name: &str,
        scope: &Scope<'_>,
    ) -> Result<InferredField> {
        if let Some(qualifier) = qualifier {
            let source = scope
                .sources
                .iter()
                .find(|s| s.matches(qualifier))
                .ok_or_else(|| {
                    ShellQueryError::inference(format!(
                        "Unknown table or alias '{qualifier}' for column '{name}'"
                    ))
                })?;
            if source.fields.is_none() {
                return Err(ShellQueryError::inference(format!(
                    "No metadata available for table '{}' (column '{name}')",
                    source.describe()
                )));
            }
            return Ok(source.column(name).cloned().unwrap_or_else(default_text));
        }

        if let Some(found) = scope.sources.iter().find_map(|s| s.column(name)) {
            return Ok(found.clone());
        }
        if let Some(unknown) = scope.sources.iter().find(|s| s.fields.is_none()) {
            return Err(ShellQueryError::inference(format!(
                "No metadata available for table '{}' (column '{name}')",
                unknown.describe()
            )));
        }
        Ok(default_text())
    }

    fn function(&self, function: &Function, scope: &Scope<'_>) -> InferredField {
        let name = function
            .name
            .0
            .last()
            .map(|ident| ident.value.to_uppercase())
            .unwrap_or_default();

        match name.as_str() {
            "COUNT" | "COUNT_BIG" | "SUM" => typed(FieldType::Number),
            "AVG" => decimal(DECIMAL_SCALE, DECIMAL_PRECISION),
            "MIN" | "MAX" => first_arg(function)
                .map(|arg| self.lenient(arg, scope))
                .unwrap_or_else(default_text),
            "ISNULL" | "COALESCE" => default_text(),
            n if STRING_FUNCTIONS.contains(&n) => text(STRING_FUNCTION_LENGTH),
            n if DATE_FUNCTIONS.contains(&n) => typed(FieldType::Date),
            n if DATE_PART_FUNCTIONS.contains(&n) => typed(FieldType::Number),
            _ => default_text(),
        }
    }

    fn binary(
        &self,
        left: &Expr,
        op: &BinaryOperator,
        right: &Expr,
        scope: &Scope<'_>,
    ) -> InferredField {
        match op {
            BinaryOperator::StringConcat => text(STRING_FUNCTION_LENGTH),
            BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo => {
                let lhs = self.lenient(left, scope);
                let rhs = self.lenient(right, scope);
                if *op == BinaryOperator::Plus
                    && (lhs.field_type.is_textual() || rhs.field_type.is_textual())
                    && !(lhs.field_type.is_numeric() || rhs.field_type.is_numeric())
                {
                    return text(STRING_FUNCTION_LENGTH);
                }
                match (lhs.field_type, rhs.field_type) {
                    (FieldType::Decimal, _) => lhs,
                    (_, FieldType::Decimal) => rhs,
                    (FieldType::Number, _) | (_, FieldType::Number) => typed(FieldType::Number),
                    _ => default_text(),
                }
            }
            _ => default_text(),
        }
    }
}

fn first_arg(function: &Function) -> Option<&Expr> {
    match &function.args {
        FunctionArguments::List(list) => list.args.iter().find_map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
            _ => None,
        }),
        _ => None,
    }
}

fn literal(value: &Value) -> InferredField {
    match value {
        // Integer and fractional literals are not distinguished.
        Value::Number(_, _) => typed(FieldType::Number),
        _ => default_text(),
    }
}

/// Maps a CAST/CONVERT target type, as rendered SQL, to an engine field type.
fn map_data_type(rendered: &str) -> InferredField {
    static TYPE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = TYPE_RE
        .get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_ ]*?)\s*(?:\(\s*([^)]*)\))?\s*$").ok())
        .as_ref()
    else {
        return default_text();
    };
    let Some(caps) = re.captures(rendered) else {
        return default_text();
    };

    let base = caps[1].to_uppercase();
    let args: Vec<&str> = caps
        .get(2)
        .map(|m| m.as_str().split(',').map(str::trim).collect())
        .unwrap_or_default();
    let number = |i: usize| args.get(i).and_then(|a| a.parse::<u32>().ok());

    match base.as_str() {
        "VARCHAR" | "NVARCHAR" | "CHAR" | "NCHAR" | "CHARACTER VARYING" | "CHARACTER"
        | "TEXT" | "NTEXT" => {
            let length = match args.first() {
                Some(a) if a.eq_ignore_ascii_case("MAX") => STRING_FUNCTION_LENGTH,
                _ => number(0).unwrap_or(DEFAULT_TEXT_LENGTH),
            };
            text(length)
        }
        "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" => typed(FieldType::Number),
        "DECIMAL" | "NUMERIC" | "DEC" => {
            let precision = number(0).unwrap_or(DECIMAL_PRECISION);
            let scale = number(1).unwrap_or(DECIMAL_SCALE);
            decimal(scale, precision)
        }
        "MONEY" | "SMALLMONEY" | "FLOAT" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => {
            decimal(DECIMAL_SCALE, DECIMAL_PRECISION)
        }
        "DATE" | "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "DATETIMEOFFSET" | "TIME"
        | "TIMESTAMP" => typed(FieldType::Date),
        "BIT" | "BOOLEAN" | "BOOL" => typed(FieldType::Boolean),
        _ => default_text(),
    }
}

/// Name of an unaliased projection item: the source column name for column
/// references, a positional placeholder otherwise.
fn column_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| format!("Column{}", index + 1)),
        Expr::Nested(inner) => column_name(inner, index),
        _ => format!("Column{}", index + 1),
    }
}
