//! Schema-related data models.
//!
//! This module defines types for database schema introspection.

use super::result::TypeTag;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableSummary {
    pub name: String,
    pub table_type: TableType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Catalog estimate, not an exact count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
}

impl TableSummary {
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            table_type,
            schema: None,
            estimated_rows: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_estimated_rows(mut self, rows: Option<u64>) -> Self {
        self.estimated_rows = rows;
        self
    }
}

/// Type of database table object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
    MaterializedView,
    SystemTable,
    TemporaryTable,
}

impl TableType {
    /// Parse table type from database-specific string.
    pub fn parse(s: &str) -> Self {
        let lower = s.to_lowercase();
        match lower.as_str() {
            "table" | "base table" => Self::Table,
            "view" => Self::View,
            "materialized view" | "matview" => Self::MaterializedView,
            "system table" | "system view" => Self::SystemTable,
            "local temporary" | "temporary" | "temp" => Self::TemporaryTable,
            _ => Self::Table,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::View => write!(f, "view"),
            Self::MaterializedView => write!(f, "materialized_view"),
            Self::SystemTable => write!(f, "system_table"),
            Self::TemporaryTable => write!(f, "temporary_table"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnDescription {
    pub name: String,
    /// Full type (e.g., `varchar(30)`, `bigint unsigned`)
    pub native_type: String,
    pub type_tag: TypeTag,
    pub nullable: bool,
    /// Default expression as the catalog reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub is_primary_key: bool,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, native_type: impl Into<String>, nullable: bool) -> Self {
        let native_type = native_type.into();
        Self {
            name: name.into(),
            type_tag: crate::db::types::categorize_type(&native_type),
            native_type,
            nullable,
            default: None,
            is_primary_key: false,
        }
    }

    pub fn with_default(mut self, default: Option<String>) -> Self {
        self.default = default;
        self
    }

    pub fn with_primary_key(mut self, is_pk: bool) -> Self {
        self.is_primary_key = is_pk;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

impl IndexInfo {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            primary: false,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Primary key indexes are always unique.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        if primary {
            self.unique = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableDescription {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub columns: Vec<ColumnDescription>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
}

impl TableDescription {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            columns: Vec::new(),
            primary_keys: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            estimated_rows: None,
        }
    }

    /// Get the fully qualified table name.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_type_parse() {
        assert_eq!(TableType::parse("BASE TABLE"), TableType::Table);
        assert_eq!(TableType::parse("VIEW"), TableType::View);
        assert_eq!(TableType::parse("matview"), TableType::MaterializedView);
        assert_eq!(TableType::parse("LOCAL TEMPORARY"), TableType::TemporaryTable);
        assert_eq!(TableType::parse("something"), TableType::Table);
    }

    #[test]
    fn test_column_description_tags_type() {
        let col = ColumnDescription::new("price", "numeric(10,2)", true);
        assert_eq!(col.type_tag, TypeTag::Decimal);
        let col = ColumnDescription::new("id", "bigint unsigned", false).with_primary_key(true);
        assert_eq!(col.type_tag, TypeTag::Integer);
        assert!(col.is_primary_key);
    }

    #[test]
    fn test_primary_index_is_unique() {
        let idx = IndexInfo::new("PRIMARY", vec!["id".into()]).with_primary(true);
        assert!(idx.unique);
    }

    #[test]
    fn test_qualified_name() {
        let mut desc = TableDescription::new("users");
        assert_eq!(desc.qualified_name(), "users");
        desc.schema = Some("public".into());
        assert_eq!(desc.qualified_name(), "public.users");
    }
}
