use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::model::{Entity, EntityId, FileParse, PropertyBag, RelationKind, Relationship};

use super::schema::{GraphSchema, SchemaReport};

/// The store-error taxonomy. Only `Io`, `Locked` and `Corrupt` are fatal to
/// a run; everything else is handled row-by-row by the adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is locked by another process ({0})")]
    Locked(PathBuf),
    #[error("entity kind '{0}' is not declared in the store schema")]
    UnknownTable(String),
    #[error("duplicate row for key '{0}'")]
    RowConflict(String),
    #[error("relationship endpoint '{0}' does not exist in the store")]
    MissingEndpoint(String),
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("query rejected: {0}")]
    QueryValidation(String),
    #[error("query exceeded the {0:?} deadline")]
    Timeout(Duration),
    #[error("unsupported query construct: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Fatal errors abort the run; the rest degrade per row.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Locked(_) | Self::Corrupt(_))
    }
}

/// A cross-file edge snapshot taken before a file subtree is detach-deleted,
/// so identity-stable targets can be re-attached after the re-insert.
#[derive(Debug, Clone)]
pub struct CrossEdge {
    pub source: EntityId,
    pub source_path: PathBuf,
    pub target: EntityId,
    pub kind: RelationKind,
    pub target_name: Option<String>,
    pub props: PropertyBag,
}

/// What a detach-delete removed, plus the files that had edges into the
/// deleted subtree (they need re-resolution).
#[derive(Debug, Default, Clone)]
pub struct DetachOutcome {
    pub removed_entities: usize,
    pub removed_relationships: usize,
    pub dangling_importers: Vec<PathBuf>,
}

/// Node/relationship counts per kind, for `status` and the run report.
#[derive(Debug, Default, Clone)]
pub struct StoreCounts {
    pub entities: BTreeMap<&'static str, usize>,
    pub relationships: BTreeMap<&'static str, usize>,
}

impl StoreCounts {
    pub fn total_entities(&self) -> usize {
        self.entities.values().sum()
    }
    pub fn total_relationships(&self) -> usize {
        self.relationships.values().sum()
    }
}

/// A relationship as read back out of the store.
#[derive(Debug, Clone)]
pub struct StoredRelationship {
    pub source: EntityId,
    pub target: EntityId,
    pub kind: RelationKind,
    pub target_name: Option<String>,
    pub props: PropertyBag,
}

/// The seam between the store adapter and the property-graph engine.
///
/// The adapter owns the write protocol (validation, batching, per-row retry,
/// endpoint demotion); the backend owns storage. The bundled implementation
/// is the embedded petgraph store; a Cypher-speaking engine slots in behind
/// the same trait.
pub trait GraphBackend {
    /// Compare declared to existing tables at open; create what is missing,
    /// run the versioned migration step for missing columns.
    fn probe_schema(&mut self) -> Result<SchemaReport, StoreError>;

    fn schema(&self) -> &GraphSchema;

    /// Parameterized upsert keyed on identity.
    fn upsert_entity(&mut self, entity: &Entity) -> Result<(), StoreError>;

    /// Insert one relationship. Fails with `MissingEndpoint` when either end
    /// is absent and `RowConflict` when the identical edge already exists.
    fn insert_relationship(&mut self, rel: &Relationship) -> Result<(), StoreError>;

    fn has_entity(&self, id: EntityId) -> bool;

    fn entity(&self, id: EntityId) -> Option<&Entity>;

    /// Remove the File entity for `path` and every entity it transitively
    /// contains, along with all edges touching the subtree.
    fn detach_delete_file(&mut self, path: &Path) -> Result<DetachOutcome, StoreError>;

    /// Cross-file edges pointing into `path`'s subtree (sources outside it).
    fn incoming_cross_edges(&self, path: &Path) -> Vec<CrossEdge>;

    /// Drop External entities no edge targets anymore. Returns how many.
    fn sweep_orphan_externals(&mut self) -> Result<usize, StoreError>;

    /// Paths of every File entity in the store.
    fn tracked_files(&self) -> Vec<PathBuf>;

    /// Rebuild a minimal `FileParse` from stored rows, sufficient to seed
    /// the symbol registry for an unchanged file (entities, containment,
    /// exports, import bindings and specifiers).
    fn reconstruct_parse(&self, path: &Path) -> Option<FileParse>;

    /// External names currently in the store, each with the owning files of
    /// the edges that target it. Drives re-resolution when new exports
    /// appear.
    fn externals_with_sources(&self) -> Vec<(String, Vec<PathBuf>)>;

    fn counts(&self) -> StoreCounts;

    /// All entities / relationships, for read-query evaluation.
    fn all_entities(&self) -> Vec<&Entity>;
    fn all_relationships(&self) -> Vec<StoredRelationship>;

    /// Drop every row (schema and lock survive). Used by `--full`.
    fn clear(&mut self) -> Result<(), StoreError>;

    /// Flush to disk (atomic replace).
    fn persist(&mut self) -> Result<(), StoreError>;
}
