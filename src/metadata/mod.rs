//! Table metadata for destinations on the remote engine.
//!
//! Field definitions are what the analyzer needs to expand wildcards and what
//! the inferrer produces when describing a query's output.

mod registry;

pub use registry::{is_system_table, system_fields, SYSTEM_TABLES};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default length for text fields whose size cannot be determined.
pub const DEFAULT_TEXT_LENGTH: u32 = 254;

/// Length used for the output of string functions.
pub const STRING_FUNCTION_LENGTH: u32 = 4000;

/// Field types supported by destinations on the remote engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Number,
    Decimal,
    Date,
    Boolean,
    EmailAddress,
    Phone,
}

impl FieldType {
    /// Returns the engine's name for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Number => "Number",
            Self::Decimal => "Decimal",
            Self::Date => "Date",
            Self::Boolean => "Boolean",
            Self::EmailAddress => "EmailAddress",
            Self::Phone => "Phone",
        }
    }

    /// Parses an engine type name. Unknown names are treated as text.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "number" => Self::Number,
            "decimal" => Self::Decimal,
            "date" => Self::Date,
            "boolean" => Self::Boolean,
            "emailaddress" => Self::EmailAddress,
            "phone" => Self::Phone,
            _ => Self::Text,
        }
    }

    /// Returns true for Number and Decimal.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Decimal)
    }

    /// Returns true for types stored as character data.
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Text | Self::EmailAddress | Self::Phone)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A field on an existing destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_primary_key: bool,
}

impl FieldDefinition {
    /// Creates a field of the given type with no size information.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            max_length: None,
            scale: None,
            precision: None,
            is_required: false,
            is_primary_key: false,
        }
    }

    /// Creates a text field with the given maximum length.
    pub fn text(name: impl Into<String>, max_length: u32) -> Self {
        Self::new(name, FieldType::Text).with_max_length(max_length)
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_required = true;
        self
    }
}

/// A column of a query's inferred output schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InferredField {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

impl InferredField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            max_length: None,
            scale: None,
            precision: None,
        }
    }

    /// Text field with the default length.
    pub fn default_text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text).with_max_length(DEFAULT_TEXT_LENGTH)
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_decimal(mut self, scale: u32, precision: u32) -> Self {
        self.scale = Some(scale);
        self.precision = Some(precision);
        self
    }

    /// Copies type and size information from an existing field.
    pub fn from_definition(name: impl Into<String>, field: &FieldDefinition) -> Self {
        Self {
            name: name.into(),
            field_type: field.field_type,
            max_length: field.max_length,
            scale: field.scale,
            precision: field.precision,
        }
    }
}

/// Source of field definitions for a table referenced by a query.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Returns the fields of `table`, or `None` if the table is unknown.
    async fn get_fields_for_table(&self, table: &str) -> Result<Option<Vec<FieldDefinition>>>;
}

/// Strips bracket quoting and the enterprise `ENT.` prefix from a table name.
pub fn normalize_table_name(name: &str) -> String {
    let unbracketed: String = name
        .trim()
        .chars()
        .filter(|c| *c != '[' && *c != ']')
        .collect();
    match unbracketed.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("ent.") => unbracketed[4..].to_string(),
        _ => unbracketed,
    }
}

/// Resolves a table's fields, consulting the built-in system views first.
pub async fn resolve_fields(
    fetcher: &dyn MetadataFetcher,
    table: &str,
) -> Result<Option<Vec<FieldDefinition>>> {
    let normalized = normalize_table_name(table);
    if let Some(fields) = system_fields(&normalized) {
        return Ok(Some(fields));
    }
    fetcher.get_fields_for_table(&normalized).await
}
