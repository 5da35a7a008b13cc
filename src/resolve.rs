use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::model::{
    Entity, EntityId, EntityKind, FileParse, PendingEdge, PendingTarget, PropKey, PropValue,
    RelationKind, Relationship,
};
use crate::registry::SymbolRegistry;

/// Bound on re-export / submodule chain following. Deep chains beyond this
/// degrade to an External, never to unbounded recursion.
const MAX_FOLLOW_DEPTH: usize = 8;

/// Counts for one pass-2 run over a file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveStats {
    /// Pending edges resolved to a concrete in-project entity.
    pub resolved: usize,
    /// Pending edges demoted to an External placeholder.
    pub external: usize,
    /// Pending edges dropped (absent asset targets, unresolvable decorators).
    pub dropped: usize,
}

impl ResolveStats {
    pub fn merge(&mut self, other: ResolveStats) {
        self.resolved += other.resolved;
        self.external += other.external;
        self.dropped += other.dropped;
    }
}

/// The pass-2 output for one file: final edges plus any External placeholders
/// interned while resolving. Externals are deduplicated across files by the
/// driver (identity is deterministic, so set-dedup equals interning).
#[derive(Debug, Default)]
pub struct ResolvedFile {
    pub relationships: Vec<Relationship>,
    pub externals: Vec<Entity>,
    pub stats: ResolveStats,
}

/// What a name reference resolved to.
enum Target {
    Entity { id: EntityId, kind: EntityKind, name: String },
    External(Entity),
}

/// Resolve every pending edge of one parsed file against the frozen registry.
///
/// Pure function of `(registry, parse)`: no entities are created except
/// External placeholders, and the registry is never written. Imports resolve
/// first so that name resolution can follow `import` indirections within the
/// same file.
pub fn resolve_file(parse: &FileParse, registry: &SymbolRegistry) -> ResolvedFile {
    let mut out = ResolvedFile::default();
    let resolver = Resolver {
        parse,
        registry,
        local_kinds: parse
            .entities
            .iter()
            .map(|e| (e.id, e.kind))
            .chain(std::iter::once((parse.file.id, parse.file.kind)))
            .collect(),
    };

    // Imports first: name resolution consults the per-file import targets.
    let mut import_targets: HashMap<EntityId, ImportTarget> = HashMap::new();
    let mut seen_edges: HashSet<(EntityId, EntityId, RelationKind, String)> = HashSet::new();

    for pending in &parse.pending {
        if pending.kind != RelationKind::Imports {
            continue;
        }
        let PendingTarget::Specifier(spec) = &pending.target else {
            continue;
        };
        match registry.resolve_module(&parse.file.path, spec) {
            Some(hit) => {
                out.stats.resolved += 1;
                import_targets.insert(pending.source, ImportTarget::File(hit.file));
                push_edge(
                    &mut out.relationships,
                    &mut seen_edges,
                    Relationship::new(pending.source, hit.file, RelationKind::Imports)
                        .with_prop(PropKey::Specifier, PropValue::Str(spec.clone()))
                        .with_prop(PropKey::Line, PropValue::Int(pending.line as i64)),
                );
            }
            None => {
                // Resolution miss: silently demoted to an External interned
                // by canonical package name.
                let external = Entity::external(&external_name_for_specifier(spec));
                out.stats.external += 1;
                import_targets.insert(pending.source, ImportTarget::External(external.id));
                push_edge(
                    &mut out.relationships,
                    &mut seen_edges,
                    Relationship::new(pending.source, external.id, RelationKind::Imports)
                        .named(external.name.clone())
                        .with_prop(PropKey::Specifier, PropValue::Str(spec.clone()))
                        .with_prop(PropKey::Line, PropValue::Int(pending.line as i64)),
                );
                out.externals.push(external);
            }
        }
    }

    for pending in &parse.pending {
        match (&pending.kind, &pending.target) {
            (RelationKind::Imports, _) => {}
            (RelationKind::UsesTemplate | RelationKind::UsesStyles, PendingTarget::Asset { role, spec }) => {
                // Absent side-files emit no edge at all — a missing template
                // is not an external dependency.
                match registry.resolve_asset(*role, &parse.file.path, spec) {
                    Some(hit) => {
                        out.stats.resolved += 1;
                        push_edge(
                            &mut out.relationships,
                            &mut seen_edges,
                            Relationship::new(pending.source, hit.file, pending.kind)
                                .with_prop(PropKey::Specifier, PropValue::Str(spec.clone()))
                                .with_prop(PropKey::Line, PropValue::Int(pending.line as i64)),
                        );
                    }
                    None => out.stats.dropped += 1,
                }
            }
            (RelationKind::Decorates, PendingTarget::Name { head, tail }) => {
                // Decorates runs decorator → class; only concrete in-project
                // decorators produce the edge.
                match resolver.resolve_name(head, tail, pending, &import_targets) {
                    Resolution::Hit { target: Target::Entity { id, .. }, .. } => {
                        out.stats.resolved += 1;
                        push_edge(
                            &mut out.relationships,
                            &mut seen_edges,
                            Relationship::new(id, pending.source, RelationKind::Decorates)
                                .with_prop(PropKey::Line, PropValue::Int(pending.line as i64)),
                        );
                    }
                    _ => out.stats.dropped += 1,
                }
            }
            (_, PendingTarget::Name { head, tail }) => {
                match resolver.resolve_name(head, tail, pending, &import_targets) {
                    Resolution::Hit { target, access_path } => {
                        let (target_id, target_kind, target_name, is_external) = match target {
                            Target::Entity { id, kind, name } => (id, kind, name, false),
                            Target::External(external) => {
                                let id = external.id;
                                let name = external.name.clone();
                                out.externals.push(external);
                                (id, EntityKind::External, name, true)
                            }
                        };
                        if is_external {
                            out.stats.external += 1;
                        } else {
                            out.stats.resolved += 1;
                        }

                        let source_kind = resolver
                            .local_kinds
                            .get(&pending.source)
                            .copied()
                            .unwrap_or(EntityKind::File);
                        let kind = final_kind(pending.kind, source_kind, target_kind);
                        let mut edge = Relationship::new(pending.source, target_id, kind)
                            .named(target_name)
                            .with_prop(PropKey::Line, PropValue::Int(pending.line as i64));
                        if !access_path.is_empty() {
                            edge = edge.with_prop(
                                PropKey::AccessPath,
                                PropValue::Str(access_path.join(".")),
                            );
                        }
                        push_edge(&mut out.relationships, &mut seen_edges, edge);
                    }
                    Resolution::Drop => out.stats.dropped += 1,
                }
            }
            _ => out.stats.dropped += 1,
        }
    }

    out
}

/// Calls run strictly Function→Function. A call whose target is not callable
/// (class instantiation, module object, external) or whose origin is not a
/// callable scope (module-level code, field initializers) is recorded as
/// Uses; everything else keeps its pending kind.
fn final_kind(pending: RelationKind, source: EntityKind, target: EntityKind) -> RelationKind {
    match pending {
        RelationKind::Calls if !source.is_callable() || !target.is_callable() => {
            RelationKind::Uses
        }
        other => other,
    }
}

fn push_edge(
    edges: &mut Vec<Relationship>,
    seen: &mut HashSet<(EntityId, EntityId, RelationKind, String)>,
    edge: Relationship,
) {
    let access = edge
        .props
        .get(&PropKey::AccessPath)
        .and_then(|v| match v {
            PropValue::Str(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default();
    if seen.insert((edge.source, edge.target, edge.kind, access)) {
        edges.push(edge);
    }
}

/// Canonical External name for an unresolvable import specifier.
/// `lodash/merge` → `lodash`, `@org/utils/helpers` → `@org/utils`,
/// `..helpers` → `helpers`; Python dotted specifiers keep their full path.
fn external_name_for_specifier(specifier: &str) -> String {
    let trimmed = specifier
        .trim_start_matches("./")
        .trim_start_matches("../")
        .trim_start_matches('.');
    let trimmed = if trimmed.is_empty() { specifier } else { trimmed };

    if trimmed.contains('.') && !trimmed.contains('/') {
        // Python dotted form — interned per name, full path kept.
        return trimmed.to_owned();
    }
    if let Some(rest) = trimmed.strip_prefix('@') {
        // Scoped npm package: keep scope + name.
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) => return format!("@{scope}/{name}"),
            _ => return trimmed.to_owned(),
        }
    }
    trimmed.split('/').next().unwrap_or(trimmed).to_owned()
}

// ---------------------------------------------------------------------------
// Name resolution
// ---------------------------------------------------------------------------

enum ImportTarget {
    File(EntityId),
    External(EntityId),
}

enum Resolution {
    Hit {
        target: Target,
        access_path: Vec<String>,
    },
    Drop,
}

struct Resolver<'a> {
    parse: &'a FileParse,
    registry: &'a SymbolRegistry,
    local_kinds: HashMap<EntityId, EntityKind>,
}

impl<'a> Resolver<'a> {
    /// Resolve a (head, tail) reference inside-out: enclosing function
    /// locals → class members → file-level names (including import
    /// bindings) → exports of imported files → unique global candidate.
    /// Anything else becomes an External interned on the head, with the tail
    /// preserved as the access path.
    fn resolve_name(
        &self,
        head: &str,
        tail: &[String],
        pending: &PendingEdge,
        import_targets: &HashMap<EntityId, ImportTarget>,
    ) -> Resolution {
        let path = &self.parse.file.path;

        // `self.x` / `this.x` / `cls.x`: member lookup on the enclosing
        // class-like scope.
        if matches!(head, "self" | "this" | "cls") {
            let class_scope = pending
                .scope
                .chain
                .iter()
                .find(|id| {
                    self.local_kinds
                        .get(id)
                        .map(|k| k.is_class_like() || *k == EntityKind::Interface)
                        .unwrap_or(false)
                })
                .copied();
            let Some(class_id) = class_scope else {
                return Resolution::Drop;
            };
            let Some((member, _)) = tail.split_first() else {
                return Resolution::Drop;
            };
            return match self.registry.lookup_scoped(class_id, member, path) {
                Some(hit) => Resolution::Hit {
                    target: Target::Entity {
                        id: hit.entity,
                        kind: hit.kind,
                        name: member.clone(),
                    },
                    access_path: tail[1..].to_vec(),
                },
                // An unknown own-member stays unresolved rather than
                // becoming a spurious External.
                None => Resolution::Drop,
            };
        }

        // Lexical chain, innermost first, then file scope.
        let mut scopes: Vec<EntityId> = pending.scope.chain.clone();
        scopes.push(pending.scope.file);
        for scope in &scopes {
            if let Some(hit) = self.registry.lookup_scoped(*scope, head, path) {
                return self.descend(hit.entity, hit.kind, head, tail, import_targets);
            }
        }

        // Import bindings at file scope.
        if let Some(binding) = self.registry.lookup_binding(pending.scope.file, head) {
            let binding = binding.clone();
            return self.through_import(
                binding.import_entity,
                binding.original.as_deref(),
                tail,
                import_targets,
            );
        }

        // Exports of files this file imports (Python's bare-name reach into
        // imported modules). Imports are tried in source order, so the
        // winner does not depend on map iteration order.
        for pending_import in &self.parse.pending {
            if pending_import.kind != RelationKind::Imports {
                continue;
            }
            if let Some(ImportTarget::File(file_id)) = import_targets.get(&pending_import.source)
                && let Some(hit) = self.follow_export(*file_id, head, 0)
            {
                return self.descend(hit.0, hit.1, head, tail, import_targets);
            }
        }

        // Global fallback: the collision total order picks a unique winner.
        if let Some(hit) = self.registry.lookup_global(head, path) {
            return self.descend(hit.entity, hit.kind, head, tail, import_targets);
        }

        Resolution::Hit {
            target: Target::External(Entity::external(head)),
            access_path: tail.to_vec(),
        }
    }

    /// Walk the tail through member/submodule scopes starting at a resolved
    /// head entity. Whatever cannot be descended into stays on the edge as
    /// the access path.
    fn descend(
        &self,
        id: EntityId,
        kind: EntityKind,
        name: &str,
        tail: &[String],
        import_targets: &HashMap<EntityId, ImportTarget>,
    ) -> Resolution {
        // A resolved import alias is an indirection, not a target.
        if kind == EntityKind::Import {
            let original = self
                .parse
                .import_bindings
                .iter()
                .find(|b| b.import_entity == id && b.local == name)
                .and_then(|b| b.original.clone());
            return self.through_import(id, original.as_deref(), tail, import_targets);
        }

        let mut current = (id, kind, name.to_owned());
        let mut index = 0;
        while index < tail.len() {
            let segment = &tail[index];
            let scoped = self
                .registry
                .lookup_scoped(current.0, segment, &self.parse.file.path);
            match scoped {
                Some(hit) if current.1.is_class_like() || current.1 == EntityKind::Module => {
                    current = (hit.entity, hit.kind, segment.clone());
                    index += 1;
                }
                _ => break,
            }
        }
        Resolution::Hit {
            target: Target::Entity {
                id: current.0,
                kind: current.1,
                name: current.2,
            },
            access_path: tail[index..].to_vec(),
        }
    }

    /// Resolve through an Import entity: find the imported file (or
    /// External), then look the original/tail names up in its exports,
    /// following submodules when the exports miss.
    fn through_import(
        &self,
        import_entity: EntityId,
        original: Option<&str>,
        tail: &[String],
        import_targets: &HashMap<EntityId, ImportTarget>,
    ) -> Resolution {
        match import_targets.get(&import_entity) {
            Some(ImportTarget::External(external_id)) => {
                // Rebuild the interned External from the import specifier.
                let name = self
                    .registry
                    .import_info(import_entity)
                    .map(|i| external_name_for_specifier(&i.specifier))
                    .unwrap_or_default();
                let external = Entity::external(&name);
                debug_assert_eq!(external.id, *external_id);
                Resolution::Hit {
                    target: Target::External(external),
                    access_path: tail.to_vec(),
                }
            }
            Some(ImportTarget::File(file_id)) => {
                // `from m import f` binds an original name; `import m` binds
                // the module, so the first tail segment is the member.
                let (first_lookup, rest) = match original {
                    Some(orig) => (orig.to_owned(), tail),
                    None => match tail.split_first() {
                        Some((seg, rest)) => (seg.clone(), rest),
                        None => {
                            // Bare module reference: the File is the target.
                            let name = self
                                .registry
                                .import_info(import_entity)
                                .map(|i| i.specifier.clone())
                                .unwrap_or_default();
                            return Resolution::Hit {
                                target: Target::Entity {
                                    id: *file_id,
                                    kind: EntityKind::File,
                                    name,
                                },
                                access_path: Vec::new(),
                            };
                        }
                    },
                };

                if let Some((id, kind)) = self.follow_export(*file_id, &first_lookup, 0) {
                    return self.descend(id, kind, &first_lookup, rest, import_targets);
                }

                // Submodule import: `import pkg` then `pkg.mod.f()`.
                if let Some(info) = self.registry.import_info(import_entity) {
                    let sub = format!("{}.{}", info.specifier, first_lookup);
                    if let Some(hit) = self.registry.resolve_module(&info.path, &sub) {
                        if let Some((seg, remainder)) = rest.split_first()
                            && let Some((id, kind)) = self.follow_export(hit.file, seg, 0)
                        {
                            return self.descend(id, kind, seg, remainder, import_targets);
                        }
                        return Resolution::Hit {
                            target: Target::Entity {
                                id: hit.file,
                                kind: EntityKind::File,
                                name: sub,
                            },
                            access_path: rest.to_vec(),
                        };
                    }
                }

                // The imported file exists but the name does not: record the
                // access against the file rather than inventing an External.
                Resolution::Hit {
                    target: Target::Entity {
                        id: *file_id,
                        kind: EntityKind::File,
                        name: first_lookup.clone(),
                    },
                    access_path: std::iter::once(first_lookup)
                        .chain(rest.iter().cloned())
                        .collect(),
                }
            }
            None => Resolution::Drop,
        }
    }

    /// Look up an exported name, following re-export chains through Import
    /// entities in other files (depth-bounded).
    fn follow_export(&self, file: EntityId, name: &str, depth: usize) -> Option<(EntityId, EntityKind)> {
        if depth >= MAX_FOLLOW_DEPTH {
            return None;
        }
        let importer: &Path = &self.parse.file.path;
        let hit = self.registry.lookup_export(file, name, importer)?;
        if hit.kind != EntityKind::Import {
            return Some((hit.entity, hit.kind));
        }
        // Re-export: resolve the chained import's module and continue with
        // the original name (aliased re-exports keep local == original).
        let info = self.registry.import_info(hit.entity)?;
        let original = self
            .registry
            .lookup_binding(info.file, name)
            .filter(|b| b.import_entity == hit.entity)
            .and_then(|b| b.original.clone())
            .unwrap_or_else(|| name.to_owned());
        let next = self.registry.resolve_module(&info.path, &info.specifier)?;
        self.follow_export(next.file, &original, depth + 1)
    }
}
