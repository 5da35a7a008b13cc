use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::model::{
    Entity, EntityId, EntityKind, ExportedName, FileParse, ImportBinding, PendingEdge,
    PendingTarget, PropKey, PropValue, PropertyBag, RelationKind, Relationship, ScopeChain,
};

use super::backend::{
    CrossEdge, DetachOutcome, GraphBackend, StoreCounts, StoreError, StoredRelationship,
};
use super::schema::{GraphSchema, SchemaReport};

/// Bumped when the envelope layout changes (entity struct fields, edge
/// payload fields) — a mismatched store refuses to load rather than
/// misread rows; `reset` is the recovery path.
const STORE_FORMAT_VERSION: u32 = 1;

const STORE_FILE: &str = "store.bin";
const LOCK_FILE: &str = "lock";

/// Edge payload stored in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgePayload {
    kind: RelationKind,
    target_name: Option<String>,
    props: PropertyBag,
}

/// Envelope wrapping the serialized graph with format version and schema.
#[derive(Serialize, Deserialize)]
struct StoreEnvelope {
    version: u32,
    schema: GraphSchema,
    graph: StableGraph<Entity, EdgePayload>,
}

/// Process-level exclusive writer lock: a `lock` file created with
/// `create_new` semantics. A second process opening the same store fails
/// fast instead of corrupting it. Released on drop.
#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Locked(dir.to_path_buf()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The bundled embedded property-graph store: a petgraph `StableGraph` with
/// O(1) identity and file-path indexes, persisted as a versioned bincode
/// envelope written atomically through a temp file.
#[derive(Debug)]
pub struct EmbeddedStore {
    dir: PathBuf,
    graph: StableGraph<Entity, EdgePayload>,
    id_index: HashMap<EntityId, NodeIndex>,
    file_index: HashMap<PathBuf, NodeIndex>,
    schema: GraphSchema,
    _lock: StoreLock,
}

impl EmbeddedStore {
    /// Open or create the store under `dir`. Fails fast when another
    /// process holds the lock, and refuses to load an incompatible format.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let lock = StoreLock::acquire(dir)?;

        let store_path = dir.join(STORE_FILE);
        let (graph, schema) = if store_path.exists() {
            let bytes = std::fs::read(&store_path)?;
            let (envelope, _): (StoreEnvelope, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| StoreError::Corrupt(format!("cannot decode store: {e}")))?;
            if envelope.version != STORE_FORMAT_VERSION {
                return Err(StoreError::Corrupt(format!(
                    "store format version {} does not match {} — run `atlas reset`",
                    envelope.version, STORE_FORMAT_VERSION
                )));
            }
            (envelope.graph, envelope.schema)
        } else {
            (StableGraph::new(), GraphSchema::declared())
        };

        let mut store = Self {
            dir: dir.to_path_buf(),
            graph,
            id_index: HashMap::new(),
            file_index: HashMap::new(),
            schema,
            _lock: lock,
        };
        store.rebuild_indexes();
        Ok(store)
    }

    fn rebuild_indexes(&mut self) {
        self.id_index.clear();
        self.file_index.clear();
        for idx in self.graph.node_indices() {
            let entity = &self.graph[idx];
            self.id_index.insert(entity.id, idx);
            if entity.kind == EntityKind::File {
                self.file_index.insert(entity.path.clone(), idx);
            }
        }
    }

    /// All node indexes in a file's containment subtree, the File included.
    fn subtree_of(&self, file_idx: NodeIndex) -> HashSet<NodeIndex> {
        let mut subtree = HashSet::new();
        let mut stack = vec![file_idx];
        while let Some(idx) = stack.pop() {
            if !subtree.insert(idx) {
                continue;
            }
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if edge.weight().kind.is_containment() {
                    stack.push(edge.target());
                }
            }
        }
        subtree
    }

    fn remove_node(&mut self, idx: NodeIndex) -> Option<Entity> {
        let entity = self.graph.remove_node(idx)?;
        self.id_index.remove(&entity.id);
        if entity.kind == EntityKind::File {
            self.file_index.remove(&entity.path);
        }
        Some(entity)
    }
}

impl GraphBackend for EmbeddedStore {
    fn probe_schema(&mut self) -> Result<SchemaReport, StoreError> {
        Ok(GraphSchema::probe(&mut self.schema))
    }

    fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    fn upsert_entity(&mut self, entity: &Entity) -> Result<(), StoreError> {
        match self.id_index.get(&entity.id) {
            Some(&idx) => {
                // Property-only update: identity unchanged, bag replaced.
                self.graph[idx] = entity.clone();
            }
            None => {
                let idx = self.graph.add_node(entity.clone());
                self.id_index.insert(entity.id, idx);
                if entity.kind == EntityKind::File {
                    self.file_index.insert(entity.path.clone(), idx);
                }
            }
        }
        Ok(())
    }

    fn insert_relationship(&mut self, rel: &Relationship) -> Result<(), StoreError> {
        let source = *self
            .id_index
            .get(&rel.source)
            .ok_or_else(|| StoreError::MissingEndpoint(rel.source.to_hex()))?;
        let target = *self.id_index.get(&rel.target).ok_or_else(|| {
            StoreError::MissingEndpoint(
                rel.target_name.clone().unwrap_or_else(|| rel.target.to_hex()),
            )
        })?;

        let duplicate = self
            .graph
            .edges_directed(source, Direction::Outgoing)
            .any(|e| {
                e.target() == target
                    && e.weight().kind == rel.kind
                    && e.weight().props.get(&PropKey::AccessPath) == rel.props.get(&PropKey::AccessPath)
            });
        if duplicate {
            return Err(StoreError::RowConflict(format!(
                "{} {} -> {}",
                rel.kind.as_str(),
                rel.source.to_hex(),
                rel.target.to_hex()
            )));
        }

        self.graph.add_edge(
            source,
            target,
            EdgePayload {
                kind: rel.kind,
                target_name: rel.target_name.clone(),
                props: rel.props.clone(),
            },
        );
        Ok(())
    }

    fn has_entity(&self, id: EntityId) -> bool {
        self.id_index.contains_key(&id)
    }

    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.id_index.get(&id).map(|&idx| &self.graph[idx])
    }

    fn detach_delete_file(&mut self, path: &Path) -> Result<DetachOutcome, StoreError> {
        let Some(&file_idx) = self.file_index.get(path) else {
            return Ok(DetachOutcome::default());
        };
        let subtree = self.subtree_of(file_idx);

        let mut outcome = DetachOutcome::default();
        let mut dangling: HashSet<PathBuf> = HashSet::new();
        for &idx in &subtree {
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                if !subtree.contains(&edge.source()) {
                    let source = &self.graph[edge.source()];
                    if !source.path.as_os_str().is_empty() {
                        dangling.insert(source.path.clone());
                    }
                }
            }
        }

        let edges_before = self.graph.edge_count();
        for idx in subtree {
            if self.remove_node(idx).is_some() {
                outcome.removed_entities += 1;
            }
        }
        outcome.removed_relationships = edges_before - self.graph.edge_count();
        let mut dangling: Vec<PathBuf> = dangling.into_iter().collect();
        dangling.sort();
        outcome.dangling_importers = dangling;
        Ok(outcome)
    }

    fn incoming_cross_edges(&self, path: &Path) -> Vec<CrossEdge> {
        let Some(&file_idx) = self.file_index.get(path) else {
            return Vec::new();
        };
        let subtree = self.subtree_of(file_idx);
        let mut edges = Vec::new();
        for &idx in &subtree {
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                if subtree.contains(&edge.source()) {
                    continue;
                }
                let source = &self.graph[edge.source()];
                edges.push(CrossEdge {
                    source: source.id,
                    source_path: source.path.clone(),
                    target: self.graph[idx].id,
                    kind: edge.weight().kind,
                    target_name: edge.weight().target_name.clone(),
                    props: edge.weight().props.clone(),
                });
            }
        }
        edges.sort_by(|a, b| (a.source, a.target, a.kind).cmp(&(b.source, b.target, b.kind)));
        edges
    }

    fn sweep_orphan_externals(&mut self) -> Result<usize, StoreError> {
        let orphans: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph[idx].kind == EntityKind::External
                    && self
                        .graph
                        .edges_directed(idx, Direction::Incoming)
                        .next()
                        .is_none()
            })
            .collect();
        let count = orphans.len();
        for idx in orphans {
            self.remove_node(idx);
        }
        Ok(count)
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.file_index.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn reconstruct_parse(&self, path: &Path) -> Option<FileParse> {
        let &file_idx = self.file_index.get(path)?;
        let file = self.graph[file_idx].clone();
        let subtree = self.subtree_of(file_idx);
        let language = match file.props.get(&PropKey::Language) {
            Some(PropValue::Str(s)) => s.clone(),
            _ => String::new(),
        };

        let mut entities = Vec::new();
        let mut relationships = Vec::new();
        let mut exports: Vec<ExportedName> = Vec::new();
        let mut import_bindings = Vec::new();
        let mut pending = Vec::new();

        for &idx in &subtree {
            if idx == file_idx {
                continue;
            }
            entities.push(self.graph[idx].clone());
        }
        // Deterministic order: reconstruction feeds the registry and must
        // not vary with hash iteration order.
        entities.sort_by_key(|e| e.id);

        for &idx in &subtree {
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let payload = edge.weight();
                if payload.kind.is_containment() && subtree.contains(&edge.target()) {
                    relationships.push(Relationship {
                        source: self.graph[idx].id,
                        target: self.graph[edge.target()].id,
                        kind: payload.kind,
                        target_name: payload.target_name.clone(),
                        props: payload.props.clone(),
                    });
                }
                // Persisted Exports edges name the addressable surface.
                if payload.kind == RelationKind::Exports && idx == file_idx {
                    let target = &self.graph[edge.target()];
                    let name = payload
                        .target_name
                        .clone()
                        .unwrap_or_else(|| target.name.clone());
                    exports.push(ExportedName {
                        name,
                        entity: target.id,
                    });
                }
            }
        }
        relationships.sort_by_key(|r| (r.source, r.target, r.kind));

        for entity in &entities {
            if entity.kind == EntityKind::Import {
                // Bindings were persisted as `local=original` alias entries.
                if let Some(PropValue::StrList(aliases)) = entity.props.get(&PropKey::Alias) {
                    for alias in aliases {
                        let (local, original) = match alias.split_once('=') {
                            Some((l, o)) => (l.to_owned(), Some(o.to_owned())),
                            None => (alias.clone(), None),
                        };
                        if language == "python" {
                            exports.push(ExportedName {
                                name: local.clone(),
                                entity: entity.id,
                            });
                        }
                        import_bindings.push(ImportBinding {
                            local,
                            original,
                            import_entity: entity.id,
                        });
                    }
                }
                if let Some(PropValue::Str(spec)) = entity.props.get(&PropKey::Specifier) {
                    pending.push(PendingEdge {
                        source: entity.id,
                        kind: RelationKind::Imports,
                        target: PendingTarget::Specifier(spec.clone()),
                        scope: ScopeChain {
                            file: file.id,
                            chain: Vec::new(),
                        },
                        line: entity.span.start,
                    });
                }
            } else if language == "python"
                && entity.kind != EntityKind::Module
                && relationships.iter().any(|r| {
                    r.source == file.id && r.target == entity.id && r.kind.is_containment()
                })
            {
                // Python: every top-level name is a module attribute.
                exports.push(ExportedName {
                    name: entity.name.clone(),
                    entity: entity.id,
                });
            }
        }

        Some(FileParse {
            file,
            entities,
            relationships,
            pending,
            exports,
            import_bindings,
            diagnostics: Vec::new(),
        })
    }

    fn externals_with_sources(&self) -> Vec<(String, Vec<PathBuf>)> {
        let mut out = Vec::new();
        for idx in self.graph.node_indices() {
            let entity = &self.graph[idx];
            if entity.kind != EntityKind::External {
                continue;
            }
            let mut sources: HashSet<PathBuf> = HashSet::new();
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                let source = &self.graph[edge.source()];
                if !source.path.as_os_str().is_empty() {
                    sources.insert(source.path.clone());
                }
            }
            let mut sources: Vec<PathBuf> = sources.into_iter().collect();
            sources.sort();
            out.push((entity.name.clone(), sources));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn counts(&self) -> StoreCounts {
        let mut counts = StoreCounts::default();
        for idx in self.graph.node_indices() {
            *counts
                .entities
                .entry(self.graph[idx].kind.as_str())
                .or_insert(0) += 1;
        }
        for edge in self.graph.edge_indices() {
            *counts
                .relationships
                .entry(self.graph[edge].kind.as_str())
                .or_insert(0) += 1;
        }
        counts
    }

    fn all_entities(&self) -> Vec<&Entity> {
        let mut entities: Vec<&Entity> = self
            .graph
            .node_indices()
            .map(|idx| &self.graph[idx])
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    fn all_relationships(&self) -> Vec<StoredRelationship> {
        let mut rels: Vec<StoredRelationship> = self
            .graph
            .edge_references()
            .map(|edge| StoredRelationship {
                source: self.graph[edge.source()].id,
                target: self.graph[edge.target()].id,
                kind: edge.weight().kind,
                target_name: edge.weight().target_name.clone(),
                props: edge.weight().props.clone(),
            })
            .collect();
        rels.sort_by_key(|r| (r.source, r.target, r.kind));
        rels
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.graph = StableGraph::new();
        self.id_index.clear();
        self.file_index.clear();
        Ok(())
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let envelope = StoreEnvelope {
            version: STORE_FORMAT_VERSION,
            schema: self.schema.clone(),
            graph: self.graph.clone(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        bincode::serde::encode_into_std_write(&envelope, &mut tmp, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(format!("cannot encode store: {e}")))?;
        tmp.as_file().flush()?;
        tmp.persist(self.dir.join(STORE_FILE))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineSpan;

    fn entity(kind: EntityKind, name: &str, path: &str, line: u32) -> Entity {
        let mut e = Entity::new(kind, name, name, PathBuf::from(path), line, line + 2);
        if kind == EntityKind::File {
            e.span = LineSpan { start: 1, end: 10 };
        }
        e
    }

    fn open_tmp(dir: &Path) -> EmbeddedStore {
        let mut store = EmbeddedStore::open(dir).unwrap();
        store.probe_schema().unwrap();
        store
    }

    #[test]
    fn test_lock_fails_fast_for_second_opener() {
        let dir = tempfile::tempdir().unwrap();
        let _first = open_tmp(dir.path());
        match EmbeddedStore::open(dir.path()) {
            Err(StoreError::Locked(_)) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = open_tmp(dir.path());
        }
        let _second = open_tmp(dir.path());
    }

    #[test]
    fn test_upsert_then_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = entity(EntityKind::File, "a.py", "/p/a.py", 1);
        let func = entity(EntityKind::Function, "f", "/p/a.py", 2);
        {
            let mut store = open_tmp(dir.path());
            store.upsert_entity(&file).unwrap();
            store.upsert_entity(&func).unwrap();
            store
                .insert_relationship(&Relationship::new(
                    file.id,
                    func.id,
                    RelationKind::FileContainsFunction,
                ))
                .unwrap();
            store.persist().unwrap();
        }
        let store = open_tmp(dir.path());
        assert!(store.has_entity(file.id));
        assert!(store.has_entity(func.id));
        assert_eq!(store.counts().total_relationships(), 1);
        assert_eq!(store.tracked_files(), vec![PathBuf::from("/p/a.py")]);
    }

    #[test]
    fn test_duplicate_relationship_is_a_row_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_tmp(dir.path());
        let file = entity(EntityKind::File, "a.py", "/p/a.py", 1);
        let func = entity(EntityKind::Function, "f", "/p/a.py", 2);
        store.upsert_entity(&file).unwrap();
        store.upsert_entity(&func).unwrap();
        let rel = Relationship::new(file.id, func.id, RelationKind::FileContainsFunction);
        store.insert_relationship(&rel).unwrap();
        match store.insert_relationship(&rel) {
            Err(StoreError::RowConflict(_)) => {}
            other => panic!("expected RowConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_endpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_tmp(dir.path());
        let file = entity(EntityKind::File, "a.py", "/p/a.py", 1);
        store.upsert_entity(&file).unwrap();
        let ghost = entity(EntityKind::Function, "ghost", "/p/b.py", 1);
        let rel = Relationship::new(file.id, ghost.id, RelationKind::FileContainsFunction)
            .named("ghost");
        match store.insert_relationship(&rel) {
            Err(StoreError::MissingEndpoint(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected MissingEndpoint, got {other:?}"),
        }
    }

    #[test]
    fn test_detach_delete_cascades_and_reports_importers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_tmp(dir.path());
        let file_a = entity(EntityKind::File, "a.py", "/p/a.py", 1);
        let func_f = entity(EntityKind::Function, "f", "/p/a.py", 2);
        let file_b = entity(EntityKind::File, "b.py", "/p/b.py", 1);
        let func_g = entity(EntityKind::Function, "g", "/p/b.py", 2);
        for e in [&file_a, &func_f, &file_b, &func_g] {
            store.upsert_entity(e).unwrap();
        }
        store
            .insert_relationship(&Relationship::new(
                file_a.id,
                func_f.id,
                RelationKind::FileContainsFunction,
            ))
            .unwrap();
        store
            .insert_relationship(&Relationship::new(
                file_b.id,
                func_g.id,
                RelationKind::FileContainsFunction,
            ))
            .unwrap();
        // f calls g across files.
        store
            .insert_relationship(&Relationship::new(func_f.id, func_g.id, RelationKind::Calls))
            .unwrap();

        let outcome = store.detach_delete_file(Path::new("/p/b.py")).unwrap();
        assert_eq!(outcome.removed_entities, 2);
        assert_eq!(
            outcome.dangling_importers,
            vec![PathBuf::from("/p/a.py")],
            "a.py had an edge into the deleted subtree"
        );
        assert!(!store.has_entity(func_g.id));
        assert!(store.has_entity(func_f.id), "other files untouched");
        assert_eq!(store.counts().total_relationships(), 1);
    }

    #[test]
    fn test_orphan_external_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_tmp(dir.path());
        let external = Entity::external("numpy");
        store.upsert_entity(&external).unwrap();
        assert_eq!(store.sweep_orphan_externals().unwrap(), 1);
        assert!(!store.has_entity(external.id));
    }

    #[test]
    fn test_clear_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_tmp(dir.path());
        let file = entity(EntityKind::File, "a.py", "/p/a.py", 1);
        store.upsert_entity(&file).unwrap();
        store.clear().unwrap();
        assert_eq!(store.counts().total_entities(), 0);
        assert!(store.schema().has_node_table(EntityKind::Function));
    }
}
