//! Canonical schema registry.
//!
//! Single source of truth for every published field: name, semantic type,
//! nullability. No consumer redefines these ad hoc; the coercion layer, the
//! validator, and the artifact store all consult this table.

use serde::Serialize;

/// Version identifier embedded in every published artifact. Consumers must
/// reject files whose version they do not recognize.
pub const SCHEMA_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Float,
    Text,
    Date,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDef {
    pub name: &'static str,
    pub semantic: SemanticType,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    fields: Vec<FieldDef>,
}

impl SchemaRegistry {
    /// The published rankings schema.
    ///
    /// Market fields are required: rank is derived from market cap, so a row
    /// without one is not rankable and never reaches this schema.
    pub fn canonical() -> Self {
        use SemanticType::*;
        let field = |name, semantic, nullable| FieldDef {
            name,
            semantic,
            nullable,
        };
        Self {
            fields: vec![
                field("date", Date, false),
                field("rank", Integer, false),
                field("coin_id", Text, false),
                field("symbol", Text, true),
                field("name", Text, true),
                field("market_cap", Float, false),
                field("price", Float, false),
                field("volume_24h", Float, false),
                field("circulating_supply", Float, true),
                field("source", Text, false),
                field("quality_tier", Text, false),
            ],
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.nullable)
    }

    pub fn version(&self) -> &'static str {
        SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_field_lookup() {
        let registry = SchemaRegistry::canonical();
        let rank = registry.field("rank").unwrap();
        assert_eq!(rank.semantic, SemanticType::Integer);
        assert!(!rank.nullable);

        let supply = registry.field("circulating_supply").unwrap();
        assert!(supply.nullable);

        assert!(registry.field("no_such_field").is_none());
    }

    #[test]
    fn required_fields_exclude_nullable() {
        let registry = SchemaRegistry::canonical();
        let required: Vec<&str> = registry.required_fields().map(|f| f.name).collect();
        assert!(required.contains(&"date"));
        assert!(required.contains(&"market_cap"));
        assert!(!required.contains(&"symbol"));
        assert!(!required.contains(&"circulating_supply"));
    }
}
