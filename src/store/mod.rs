pub mod backend;
pub mod cypher;
pub mod embedded;
pub mod schema;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::config::AtlasConfig;
use crate::extractor::ExtractionDelta;
use crate::model::{Entity, EntityId, FileParse, PropKey, PropValue, Relationship};

pub use backend::{
    CrossEdge, DetachOutcome, GraphBackend, StoreCounts, StoreError, StoredRelationship,
};
pub use embedded::EmbeddedStore;
pub use schema::{GraphSchema, SchemaReport, SCHEMA_VERSION};

/// A row the adapter could not write, with enough context to report it.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub context: String,
    pub error: String,
}

/// What one `apply` call did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub entities_written: usize,
    pub relationships_written: usize,
    /// Edges whose target endpoint was missing and got demoted to an
    /// interned External.
    pub demoted_edges: usize,
    pub deleted_files: usize,
    pub orphan_externals_removed: usize,
    /// Files outside the delta whose edges pointed at entities that no
    /// longer exist — candidates for re-resolution by the incremental
    /// engine.
    pub dangling_importers: Vec<PathBuf>,
    /// Entity kinds refused because the schema does not declare them
    /// (reported once per run).
    pub unknown_kinds: BTreeSet<String>,
    pub row_failures: Vec<RowFailure>,
}

/// The store adapter: translates extraction deltas into identity-keyed
/// upserts against the backend, batching writes with per-row retry, and
/// exposes the validated read-query surface.
pub struct StoreAdapter<B: GraphBackend = EmbeddedStore> {
    backend: B,
    batch_size: usize,
    query_timeout: Duration,
    schema_report: SchemaReport,
}

impl StoreAdapter<EmbeddedStore> {
    /// Open (or create) the embedded store configured for this project.
    /// Runs the schema probe: missing tables are created, missing columns
    /// migrate with a version bump.
    pub fn open(dir: &Path, config: &AtlasConfig) -> Result<Self, StoreError> {
        let backend = EmbeddedStore::open(dir)?;
        Self::with_backend(backend, config.batch_size, Duration::from_secs(config.query_timeout_secs))
    }
}

impl<B: GraphBackend> StoreAdapter<B> {
    pub fn with_backend(
        mut backend: B,
        batch_size: usize,
        query_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let schema_report = backend.probe_schema()?;
        if !schema_report.created_tables.is_empty() {
            tracing::info!(
                tables = schema_report.created_tables.len(),
                "schema probe created missing tables"
            );
        }
        for (table, column) in &schema_report.migrated_columns {
            tracing::info!(table, column, "schema migration added column");
        }
        Ok(Self {
            backend,
            batch_size: batch_size.max(1),
            query_timeout,
            schema_report,
        })
    }

    pub fn schema_report(&self) -> &SchemaReport {
        &self.schema_report
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // -- write path ---------------------------------------------------------

    /// Apply an extraction delta.
    ///
    /// Order of operations keeps endpoint closure intact at every step:
    /// deletions, then entity upserts (externals first, then per-file
    /// subtrees, replacing re-parsed files), then relationship inserts, then
    /// re-attachment of surviving cross-file edges, then the orphan-External
    /// sweep, then one atomic persist. Only store-I/O failures abort; bad
    /// rows degrade individually.
    pub fn apply(&mut self, delta: &ExtractionDelta) -> Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();

        // Deletions first. Files with edges into deleted subtrees need
        // re-resolution by the caller.
        let mut dangling: BTreeSet<PathBuf> = BTreeSet::new();
        for path in &delta.deleted_files {
            let outcome = self.backend.detach_delete_file(path)?;
            if outcome.removed_entities > 0 {
                report.deleted_files += 1;
            }
            dangling.extend(outcome.dangling_importers);
        }

        // Snapshot incoming cross-file edges of every re-parsed file before
        // any subtree is detached: identity-stable targets get re-attached
        // after the re-insert.
        let mut snapshots: Vec<CrossEdge> = Vec::new();
        let replaced: HashSet<PathBuf> = delta.files.iter().map(|f| f.file.path.clone()).collect();
        for fd in &delta.files {
            snapshots.extend(self.backend.incoming_cross_edges(&fd.file.path));
        }
        for fd in &delta.files {
            self.backend.detach_delete_file(&fd.file.path)?;
        }

        // Entities: externals first (edges may target them), then files.
        self.upsert_batch(&delta.externals, &mut report)?;
        for fd in &delta.files {
            let mut rows: Vec<&Entity> = Vec::with_capacity(fd.entities.len() + 1);
            rows.push(&fd.file);
            rows.extend(fd.entities.iter());
            self.upsert_refs(&rows, &mut report)?;
        }

        // Relationships, endpoints guaranteed inserted above.
        for fd in &delta.files {
            self.insert_relationship_batch(&fd.relationships, &mut report)?;
        }

        // Re-attach surviving snapshot edges. Sources inside the replaced
        // set re-emitted their own edges (conflicts are skipped); vanished
        // targets leave their source files dangling.
        for edge in snapshots {
            if !self.backend.has_entity(edge.source) {
                continue;
            }
            if !self.backend.has_entity(edge.target) {
                if !replaced.contains(&edge.source_path) {
                    dangling.insert(edge.source_path.clone());
                }
                continue;
            }
            let mut rel = Relationship {
                source: edge.source,
                target: edge.target,
                kind: edge.kind,
                target_name: edge.target_name,
                props: edge.props,
            };
            rel.props.entry(PropKey::Line).or_insert(PropValue::Int(0));
            match self.backend.insert_relationship(&rel) {
                Ok(()) => report.relationships_written += 1,
                Err(StoreError::RowConflict(_)) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => report.row_failures.push(RowFailure {
                    context: format!("re-attach {}", rel.kind.as_str()),
                    error: err.to_string(),
                }),
            }
        }

        report.orphan_externals_removed = self.backend.sweep_orphan_externals()?;
        report.dangling_importers = dangling.into_iter().collect();

        self.backend.persist()?;
        Ok(report)
    }

    fn upsert_batch(&mut self, entities: &[Entity], report: &mut ApplyReport) -> Result<(), StoreError> {
        let refs: Vec<&Entity> = entities.iter().collect();
        self.upsert_refs(&refs, report)
    }

    /// Parameterized upserts keyed on identity, in batches. A failed batch
    /// is retried row by row; surviving rows commit, failures are reported
    /// with row context.
    fn upsert_refs(&mut self, rows: &[&Entity], report: &mut ApplyReport) -> Result<(), StoreError> {
        for chunk in rows.chunks(self.batch_size) {
            let batch_result: Result<(), StoreError> = chunk.iter().try_for_each(|entity| {
                self.check_kind(entity, report)?;
                self.backend.upsert_entity(entity)
            });
            match batch_result {
                Ok(()) => report.entities_written += chunk.len(),
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => {
                    // Per-row retry: upserts are idempotent, so rows already
                    // applied by the failed batch pass are harmless.
                    for entity in chunk {
                        if let Err(err) = self
                            .check_kind(entity, report)
                            .and_then(|_| self.backend.upsert_entity(entity))
                        {
                            if err.is_fatal() {
                                return Err(err);
                            }
                            report.row_failures.push(RowFailure {
                                context: format!(
                                    "{} '{}' in {}",
                                    entity.kind.as_str(),
                                    entity.name,
                                    entity.path.display()
                                ),
                                error: err.to_string(),
                            });
                        } else {
                            report.entities_written += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The adapter refuses entity kinds the schema does not declare; the
    /// missing kind is reported once per run.
    fn check_kind(&self, entity: &Entity, report: &mut ApplyReport) -> Result<(), StoreError> {
        if self.backend.schema().has_node_table(entity.kind) {
            return Ok(());
        }
        report.unknown_kinds.insert(entity.kind.as_str().to_owned());
        Err(StoreError::UnknownTable(entity.kind.as_str().to_owned()))
    }

    fn insert_relationship_batch(
        &mut self,
        rows: &[Relationship],
        report: &mut ApplyReport,
    ) -> Result<(), StoreError> {
        for chunk in rows.chunks(self.batch_size) {
            for rel in chunk {
                self.insert_one_relationship(rel, report)?;
            }
        }
        Ok(())
    }

    fn insert_one_relationship(
        &mut self,
        rel: &Relationship,
        report: &mut ApplyReport,
    ) -> Result<(), StoreError> {
        // Endpoints are looked up by identity before the edge write.
        if !self.backend.has_entity(rel.source) {
            report.row_failures.push(RowFailure {
                context: format!("{} edge", rel.kind.as_str()),
                error: "source endpoint missing".to_owned(),
            });
            return Ok(());
        }
        let mut rel = rel.clone();
        if !self.backend.has_entity(rel.target) {
            // Missing target: demote to an External interned by name.
            let Some(name) = rel.target_name.clone() else {
                report.row_failures.push(RowFailure {
                    context: format!("{} edge", rel.kind.as_str()),
                    error: "target endpoint missing and unnamed".to_owned(),
                });
                return Ok(());
            };
            let external = Entity::external(&name);
            self.backend.upsert_entity(&external)?;
            report.entities_written += 1;
            rel.target = external.id;
            report.demoted_edges += 1;
        }
        match self.backend.insert_relationship(&rel) {
            Ok(()) => report.relationships_written += 1,
            Err(StoreError::RowConflict(context)) => {
                tracing::debug!(context, "duplicate relationship row skipped");
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => report.row_failures.push(RowFailure {
                context: format!("{} edge", rel.kind.as_str()),
                error: err.to_string(),
            }),
        }
        Ok(())
    }

    /// Drop every row (schema survives). The `--full` reset path.
    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        self.backend.clear()?;
        self.backend.persist()
    }

    // -- read path ----------------------------------------------------------

    /// Run a validated read-only query with the configured deadline.
    pub fn query(
        &self,
        text: &str,
        params: &HashMap<String, JsonValue>,
    ) -> Result<Vec<JsonMap<String, JsonValue>>, StoreError> {
        cypher::validate_read_only(text)?;
        let parsed = cypher::parse(text)?;
        cypher::evaluate(&self.backend, &parsed, params, self.query_timeout)
    }

    pub fn counts(&self) -> StoreCounts {
        self.backend.counts()
    }

    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.backend.tracked_files()
    }

    pub fn reconstruct_parse(&self, path: &Path) -> Option<FileParse> {
        self.backend.reconstruct_parse(path)
    }

    pub fn externals_with_sources(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.backend.externals_with_sources()
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.backend.has_entity(id)
    }

    pub fn persist(&mut self) -> Result<(), StoreError> {
        self.backend.persist()
    }
}
