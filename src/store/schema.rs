use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{EntityKind, ALL_ENTITY_KINDS, ALL_RELATION_KINDS};

/// Bumped whenever a migration step adds columns to existing tables.
pub const SCHEMA_VERSION: u32 = 1;

/// Columns every node table carries.
const BASE_COLUMNS: &[&str] = &["id", "name", "qualified_name", "file_path", "start_line", "end_line"];

/// The declared store schema: one node table per entity kind, one
/// relationship table per relationship kind. Fixed at creation time and
/// strictly additive on upgrade — columns are never renamed or removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphSchema {
    pub version: u32,
    /// Table name → column names.
    pub node_tables: BTreeMap<String, Vec<String>>,
    pub rel_tables: BTreeSet<String>,
}

/// What a schema probe found and did at store open.
#[derive(Debug, Default, Clone)]
pub struct SchemaReport {
    pub created_tables: Vec<String>,
    /// (table, column) pairs added by the versioned migration step.
    pub migrated_columns: Vec<(String, String)>,
    pub version: u32,
}

/// Kind-specific columns beyond the base set.
fn extra_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::File => &["language", "selectors"],
        EntityKind::Module => &["docstring"],
        EntityKind::Class | EntityKind::Interface => &["docstring", "is_exported", "decorators"],
        EntityKind::TypeAlias | EntityKind::Enum => &["is_exported"],
        EntityKind::Function
        | EntityKind::Method
        | EntityKind::ArrowFunction
        | EntityKind::GeneratorFunction => &["complexity", "is_async", "is_exported", "docstring"],
        EntityKind::Variable => &["is_exported", "docstring"],
        EntityKind::Import => &["specifier", "alias"],
        EntityKind::Component => &[
            "selector",
            "template",
            "styles",
            "decorators",
            "is_exported",
            "docstring",
        ],
        EntityKind::Service => &["provided_in", "decorators", "is_exported", "docstring"],
        EntityKind::Directive | EntityKind::NgModule => &["selector", "decorators", "is_exported"],
        EntityKind::Pipe => &["alias", "decorators", "is_exported"],
        EntityKind::External => &[],
    }
}

impl GraphSchema {
    /// The schema this build of the extractor declares.
    pub fn declared() -> Self {
        let mut node_tables = BTreeMap::new();
        for kind in ALL_ENTITY_KINDS {
            let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| (*c).to_owned()).collect();
            columns.extend(extra_columns(*kind).iter().map(|c| (*c).to_owned()));
            node_tables.insert(kind.as_str().to_owned(), columns);
        }
        let rel_tables = ALL_RELATION_KINDS
            .iter()
            .map(|k| k.as_str().to_owned())
            .collect();
        Self {
            version: SCHEMA_VERSION,
            node_tables,
            rel_tables,
        }
    }

    pub fn has_node_table(&self, kind: EntityKind) -> bool {
        self.node_tables.contains_key(kind.as_str())
    }

    /// Reconcile an existing (persisted) schema with the declared one.
    ///
    /// Missing tables are created outright; missing columns run through a
    /// versioned migration step that bumps the stored version. Existing
    /// tables and columns are never dropped, so downgrade-opened stores keep
    /// working.
    pub fn probe(existing: &mut GraphSchema) -> SchemaReport {
        let declared = Self::declared();
        let mut report = SchemaReport::default();

        for (table, columns) in &declared.node_tables {
            match existing.node_tables.get_mut(table) {
                None => {
                    existing.node_tables.insert(table.clone(), columns.clone());
                    report.created_tables.push(table.clone());
                }
                Some(existing_columns) => {
                    for column in columns {
                        if !existing_columns.contains(column) {
                            existing_columns.push(column.clone());
                            report.migrated_columns.push((table.clone(), column.clone()));
                        }
                    }
                }
            }
        }
        for table in &declared.rel_tables {
            if existing.rel_tables.insert(table.clone()) {
                report.created_tables.push(table.clone());
            }
        }

        if !report.migrated_columns.is_empty() {
            existing.version = existing.version.max(declared.version) + 1;
        } else if existing.version < declared.version {
            existing.version = declared.version;
        }
        report.version = existing.version;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_schema_covers_every_kind() {
        let schema = GraphSchema::declared();
        assert_eq!(schema.node_tables.len(), ALL_ENTITY_KINDS.len());
        assert_eq!(schema.rel_tables.len(), ALL_RELATION_KINDS.len());
        for columns in schema.node_tables.values() {
            assert!(columns.contains(&"id".to_owned()));
            assert!(columns.contains(&"file_path".to_owned()));
        }
        assert!(schema
            .node_tables
            .get("Component")
            .unwrap()
            .contains(&"selector".to_owned()));
    }

    #[test]
    fn test_probe_creates_missing_tables() {
        let mut existing = GraphSchema {
            version: SCHEMA_VERSION,
            node_tables: BTreeMap::new(),
            rel_tables: BTreeSet::new(),
        };
        let report = GraphSchema::probe(&mut existing);
        assert_eq!(report.created_tables.len(), ALL_ENTITY_KINDS.len() + ALL_RELATION_KINDS.len());
        assert!(report.migrated_columns.is_empty());
        assert_eq!(existing, GraphSchema::declared());
    }

    #[test]
    fn test_probe_migrates_missing_columns_and_bumps_version() {
        let mut existing = GraphSchema::declared();
        // Simulate a store created by an older build without `complexity`.
        existing
            .node_tables
            .get_mut("Function")
            .unwrap()
            .retain(|c| c != "complexity");
        let report = GraphSchema::probe(&mut existing);
        assert!(report
            .migrated_columns
            .contains(&("Function".to_owned(), "complexity".to_owned())));
        assert!(existing.version > SCHEMA_VERSION, "migration bumps the version");
    }

    #[test]
    fn test_probe_never_removes_columns() {
        let mut existing = GraphSchema::declared();
        existing
            .node_tables
            .get_mut("Function")
            .unwrap()
            .push("legacy_extra".to_owned());
        GraphSchema::probe(&mut existing);
        assert!(existing
            .node_tables
            .get("Function")
            .unwrap()
            .contains(&"legacy_extra".to_owned()));
    }

    #[test]
    fn test_probe_is_idempotent() {
        let mut existing = GraphSchema::declared();
        let first = GraphSchema::probe(&mut existing);
        assert!(first.created_tables.is_empty());
        let second = GraphSchema::probe(&mut existing);
        assert!(second.created_tables.is_empty());
        assert!(second.migrated_columns.is_empty());
        assert_eq!(existing.version, SCHEMA_VERSION);
    }
}
