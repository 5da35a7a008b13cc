use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::language::FrontendKind;
use crate::model::{
    AssetRole, EntityId, EntityKind, FileParse, ImportBinding, PendingTarget, RelationKind,
};

// ---------------------------------------------------------------------------
// Candidate records
// ---------------------------------------------------------------------------

/// A declared entity indexed under some lookup key. The owning path rides
/// along because the collision policy orders candidates by path.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub path: PathBuf,
}

/// A File entity reachable through a module-specifier or asset key.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub file: EntityId,
    pub path: PathBuf,
}

/// Where an Import entity lives and what it imports — needed to follow
/// re-export chains through files other than the one being resolved.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub specifier: String,
    pub file: EntityId,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The run-scoped symbol registry: populated (under a write lock, one batch
/// per file) during pass 1, consulted read-only during pass 2, discarded
/// after the run.
///
/// Key schemes:
/// - module specifiers: absolute path, extension-stripped path, directory
///   `index`/`__init__` entry, source-root-relative subpath (slashed and, for
///   Python, dotted);
/// - named exports: `(file id, exported name)`;
/// - template/style assets: `template:`/`styles:` prefixed filename and
///   absolute-path keys;
/// - scoped names: `(scope entity id, simple name)`;
/// - a global simple-name index used as the final resolution fallback.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    modules: HashMap<String, Vec<FileCandidate>>,
    assets: HashMap<String, Vec<FileCandidate>>,
    scoped: HashMap<(EntityId, String), Vec<Candidate>>,
    exports: HashMap<(EntityId, String), Vec<Candidate>>,
    bindings: HashMap<(EntityId, String), ImportBinding>,
    imports: HashMap<EntityId, ImportInfo>,
    global: HashMap<String, Vec<Candidate>>,
    files_by_path: HashMap<PathBuf, EntityId>,
}

/// One file's registry insertions, built lock-free by the parsing worker and
/// committed in a single write-lock acquisition.
#[derive(Debug, Default)]
pub struct RegistryBatch {
    modules: Vec<(String, FileCandidate)>,
    assets: Vec<(String, FileCandidate)>,
    scoped: Vec<((EntityId, String), Candidate)>,
    exports: Vec<((EntityId, String), Candidate)>,
    bindings: Vec<((EntityId, String), ImportBinding)>,
    imports: Vec<(EntityId, ImportInfo)>,
    global: Vec<(String, Candidate)>,
    file: (PathBuf, EntityId),
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry batch for one parsed file. Pure function of the
    /// parse result — runs on the worker thread without any lock held.
    pub fn batch_for(parse: &FileParse, source_roots: &[PathBuf]) -> RegistryBatch {
        let mut batch = RegistryBatch {
            file: (parse.file.path.clone(), parse.file.id),
            ..RegistryBatch::default()
        };
        let path = &parse.file.path;
        let file_id = parse.file.id;
        let file_candidate = FileCandidate {
            file: file_id,
            path: path.clone(),
        };

        for key in module_keys(path, source_roots) {
            batch.modules.push((key, file_candidate.clone()));
        }
        for key in asset_keys(path) {
            batch.assets.push((key, file_candidate.clone()));
        }

        // Scoped names: every entity indexed under its container.
        let containers: HashMap<EntityId, EntityId> = parse
            .relationships
            .iter()
            .filter(|r| r.kind.is_containment())
            .map(|r| (r.target, r.source))
            .collect();
        for entity in &parse.entities {
            let candidate = Candidate {
                entity: entity.id,
                kind: entity.kind,
                path: path.clone(),
            };
            let container = containers.get(&entity.id).copied().unwrap_or(file_id);
            batch
                .scoped
                .push(((container, entity.name.clone()), candidate.clone()));
            if entity.kind != EntityKind::Import {
                batch.global.push((entity.name.clone(), candidate));
            }
        }

        for export in &parse.exports {
            let kind = parse
                .entities
                .iter()
                .find(|e| e.id == export.entity)
                .map(|e| e.kind)
                .unwrap_or(EntityKind::External);
            batch.exports.push((
                (file_id, export.name.clone()),
                Candidate {
                    entity: export.entity,
                    kind,
                    path: path.clone(),
                },
            ));
        }

        for binding in &parse.import_bindings {
            batch
                .bindings
                .push(((file_id, binding.local.clone()), binding.clone()));
        }

        for pending in &parse.pending {
            if pending.kind == RelationKind::Imports
                && let PendingTarget::Specifier(spec) = &pending.target
            {
                batch.imports.push((
                    pending.source,
                    ImportInfo {
                        specifier: spec.clone(),
                        file: file_id,
                        path: path.clone(),
                    },
                ));
            }
        }

        batch
    }

    /// Merge a batch under the write lock. Insertion order does not affect
    /// resolution results: the collision policy is a total order on paths,
    /// not on arrival order.
    pub fn commit(&mut self, batch: RegistryBatch) {
        let (path, file_id) = batch.file;
        self.files_by_path.insert(path, file_id);
        for (key, candidate) in batch.modules {
            self.modules.entry(key).or_default().push(candidate);
        }
        for (key, candidate) in batch.assets {
            self.assets.entry(key).or_default().push(candidate);
        }
        for (key, candidate) in batch.scoped {
            self.scoped.entry(key).or_default().push(candidate);
        }
        for (key, candidate) in batch.exports {
            self.exports.entry(key).or_default().push(candidate);
        }
        for (key, binding) in batch.bindings {
            self.bindings.entry(key).or_insert(binding);
        }
        for (key, info) in batch.imports {
            self.imports.entry(key).or_insert(info);
        }
        for (key, candidate) in batch.global {
            self.global.entry(key).or_default().push(candidate);
        }
    }

    // -- lookups ------------------------------------------------------------

    pub fn file_for_path(&self, path: &Path) -> Option<EntityId> {
        self.files_by_path.get(path).copied()
    }

    /// Resolve a module specifier from the importing file's directory.
    /// Candidate keys are derived from the specifier shape (relative path,
    /// Python relative dots, bare subpath); the first key with candidates
    /// wins, ties broken by the collision policy.
    pub fn resolve_module(&self, importer: &Path, specifier: &str) -> Option<&FileCandidate> {
        let importer_dir = importer.parent().unwrap_or_else(|| Path::new("/"));

        for key in specifier_keys(importer_dir, specifier) {
            if let Some(candidates) = self.modules.get(&key)
                && let Some(winner) = pick(candidates, importer, |c| &c.path, |c| c.file)
            {
                return Some(winner);
            }
        }
        None
    }

    /// Resolve a template/style reference. The absolute form (joined against
    /// the component file's directory) is tried first, then the bare
    /// filename key.
    pub fn resolve_asset(
        &self,
        role: AssetRole,
        component_path: &Path,
        spec: &str,
    ) -> Option<&FileCandidate> {
        let prefix = asset_prefix(role);
        let dir = component_path.parent().unwrap_or_else(|| Path::new("/"));
        let absolute = normalize(&dir.join(spec));
        let abs_key = format!("{}{}", prefix, absolute.to_string_lossy());
        if let Some(candidates) = self.assets.get(&abs_key)
            && let Some(winner) = pick(candidates, component_path, |c| &c.path, |c| c.file)
        {
            return Some(winner);
        }
        let name = Path::new(spec)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.to_owned());
        let name_key = format!("{}{}", prefix, name);
        self.assets
            .get(&name_key)
            .and_then(|candidates| pick(candidates, component_path, |c| &c.path, |c| c.file))
    }

    pub fn lookup_scoped(&self, scope: EntityId, name: &str, importer: &Path) -> Option<&Candidate> {
        self.scoped
            .get(&(scope, name.to_owned()))
            .and_then(|candidates| pick(candidates, importer, |c| &c.path, |c| c.entity))
    }

    pub fn lookup_export(&self, file: EntityId, name: &str, importer: &Path) -> Option<&Candidate> {
        self.exports
            .get(&(file, name.to_owned()))
            .and_then(|candidates| pick(candidates, importer, |c| &c.path, |c| c.entity))
    }

    pub fn lookup_binding(&self, file: EntityId, local: &str) -> Option<&ImportBinding> {
        self.bindings.get(&(file, local.to_owned()))
    }

    pub fn import_info(&self, import_entity: EntityId) -> Option<&ImportInfo> {
        self.imports.get(&import_entity)
    }

    /// Global fallback: a unique best candidate by the collision total order.
    pub fn lookup_global(&self, name: &str, importer: &Path) -> Option<&Candidate> {
        self.global
            .get(name)
            .and_then(|candidates| pick(candidates, importer, |c| &c.path, |c| c.entity))
    }

    pub fn len_files(&self) -> usize {
        self.files_by_path.len()
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

fn asset_prefix(role: AssetRole) -> &'static str {
    match role {
        AssetRole::Template => "template:",
        AssetRole::Styles => "styles:",
    }
}

/// All module keys a file is reachable under.
fn module_keys(path: &Path, source_roots: &[PathBuf]) -> Vec<String> {
    let mut keys = Vec::new();
    let abs = path.to_string_lossy().into_owned();
    keys.push(abs.clone());

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stripped = path.with_extension("");
    if stripped.to_string_lossy() != abs {
        keys.push(stripped.to_string_lossy().into_owned());
    }

    // `index.ts` / `__init__.py` make the directory itself importable.
    if (stem == "index" || stem == "__init__")
        && let Some(dir) = path.parent()
    {
        keys.push(dir.to_string_lossy().into_owned());
    }

    let is_python = path.extension().and_then(|e| e.to_str()) == Some("py");
    for root in source_roots {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel_str = rel.to_string_lossy().into_owned();
        keys.push(rel_str.clone());
        let rel_stripped = rel.with_extension("").to_string_lossy().into_owned();
        if rel_stripped != rel_str {
            keys.push(rel_stripped.clone());
        }
        if is_python {
            let mut dotted = rel_stripped.replace(['/', '\\'], ".");
            if let Some(pkg) = dotted.strip_suffix(".__init__") {
                dotted = pkg.to_owned();
            }
            if !dotted.is_empty() {
                keys.push(dotted);
            }
        } else if stem == "index"
            && let Some(dir) = rel.parent()
            && !dir.as_os_str().is_empty()
        {
            keys.push(dir.to_string_lossy().into_owned());
        }
    }

    keys.sort();
    keys.dedup();
    keys
}

/// Asset keys for template/stylesheet files.
fn asset_keys(path: &Path) -> Vec<String> {
    let Some(frontend) = FrontendKind::for_path(path) else {
        return Vec::new();
    };
    let prefix = match frontend {
        FrontendKind::Template => "template:",
        FrontendKind::Stylesheet => "styles:",
        _ => return Vec::new(),
    };
    let mut keys = vec![format!("{}{}", prefix, path.to_string_lossy())];
    if let Some(name) = path.file_name() {
        keys.push(format!("{}{}", prefix, name.to_string_lossy()));
    }
    keys
}

/// Candidate lookup keys for a specifier, most specific first.
fn specifier_keys(importer_dir: &Path, specifier: &str) -> Vec<String> {
    let mut keys = Vec::new();

    if specifier.starts_with('.') && !specifier.starts_with("./") && !specifier.starts_with("../") {
        // Python relative import: `.`, `..pkg`, `.sibling.mod`.
        let dots = specifier.chars().take_while(|&c| c == '.').count();
        let rest = &specifier[dots..];
        let mut base = importer_dir.to_path_buf();
        for _ in 1..dots {
            base.pop();
        }
        let target = if rest.is_empty() {
            base
        } else {
            base.join(rest.replace('.', "/"))
        };
        keys.push(normalize(&target).to_string_lossy().into_owned());
    } else if specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
    {
        // JS/TS relative path (or absolute).
        let joined = if specifier.starts_with('/') {
            PathBuf::from(specifier)
        } else {
            importer_dir.join(specifier)
        };
        keys.push(normalize(&joined).to_string_lossy().into_owned());
    } else {
        // Bare specifier: source-root-relative subpath (slashed or dotted).
        keys.push(specifier.to_owned());
    }
    keys
}

/// Lexical path normalization (no filesystem access): resolves `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Collision policy
// ---------------------------------------------------------------------------

/// Pick the winning candidate under the documented total order:
/// same file > same directory > shortest relative path > lexicographic
/// absolute path. The order is total, so a non-empty candidate set always
/// has a unique winner; `id_of` breaks exact path ties deterministically.
fn pick<'a, T>(
    candidates: &'a [T],
    importer: &Path,
    path_of: impl Fn(&T) -> &Path,
    id_of: impl Fn(&T) -> EntityId,
) -> Option<&'a T> {
    let importer_dir = importer.parent().unwrap_or_else(|| Path::new("/"));
    candidates.iter().min_by_key(|c| {
        let path = path_of(c);
        let same_file = path == importer;
        let same_dir = path.parent() == Some(importer_dir);
        (
            !same_file,
            !same_dir,
            relative_distance(importer_dir, path),
            path.to_path_buf(),
            id_of(c),
        )
    })
}

/// Component count of the relative path between two locations — the
/// "shortest relative path" measure of the collision order.
fn relative_distance(from_dir: &Path, to: &Path) -> usize {
    let from: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    (from.len() - common) + (to_components.len() - common)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parse_file, ParseOptions};

    fn registry_for(files: &[(&str, &str)], root: &Path) -> SymbolRegistry {
        let opts = ParseOptions {
            source_roots: vec![root.to_path_buf()],
            ..ParseOptions::default()
        };
        let mut registry = SymbolRegistry::new();
        for (rel, content) in files {
            let path = root.join(rel);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            let parse = parse_file(&path, &opts);
            let batch = SymbolRegistry::batch_for(&parse, &opts.source_roots);
            registry.commit(batch);
        }
        registry
    }

    #[test]
    fn test_relative_ts_specifier_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(
            &[("base.ts", "export class Base {}"), ("child.ts", "")],
            root,
        );
        let importer = root.join("child.ts");
        let hit = registry
            .resolve_module(&importer, "./base")
            .expect("./base should resolve");
        assert_eq!(hit.path, root.join("base.ts"));
    }

    #[test]
    fn test_index_file_claims_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(&[("lib/index.ts", "export const x = 1;")], root);
        let importer = root.join("app.ts");
        let hit = registry
            .resolve_module(&importer, "./lib")
            .expect("directory import should hit index.ts");
        assert_eq!(hit.path, root.join("lib/index.ts"));
    }

    #[test]
    fn test_python_dotted_specifier() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(&[("pkg/util.py", "def helper():\n    pass\n")], root);
        let importer = root.join("main.py");
        let hit = registry
            .resolve_module(&importer, "pkg.util")
            .expect("dotted specifier should resolve");
        assert_eq!(hit.path, root.join("pkg/util.py"));
    }

    #[test]
    fn test_python_relative_import() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(
            &[
                ("pkg/__init__.py", ""),
                ("pkg/helper.py", "def h():\n    pass\n"),
                ("pkg/main.py", ""),
            ],
            root,
        );
        let importer = root.join("pkg/main.py");
        let hit = registry
            .resolve_module(&importer, ".helper")
            .expect(".helper should resolve to the sibling module");
        assert_eq!(hit.path, root.join("pkg/helper.py"));
        // Bare `.` resolves to the package __init__.
        let pkg = registry
            .resolve_module(&importer, ".")
            .expect("package-relative dot should resolve");
        assert_eq!(pkg.path, root.join("pkg/__init__.py"));
    }

    #[test]
    fn test_collision_prefers_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(
            &[
                ("a/util.py", "def f():\n    pass\n"),
                ("b/util.py", "def f():\n    pass\n"),
                ("a/caller.py", ""),
            ],
            root,
        );
        let importer = root.join("a/caller.py");
        let hit = registry
            .lookup_global("f", &importer)
            .expect("global lookup should pick a winner");
        assert_eq!(hit.path, root.join("a/util.py"), "same-directory candidate wins");
    }

    #[test]
    fn test_collision_total_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        // Importer is equidistant from both candidates — lexicographic path
        // order must break the tie the same way every run.
        let registry = registry_for(
            &[
                ("x/util.py", "def f():\n    pass\n"),
                ("y/util.py", "def f():\n    pass\n"),
                ("z/caller.py", ""),
            ],
            root,
        );
        let importer = root.join("z/caller.py");
        let first = registry.lookup_global("f", &importer).unwrap().path.clone();
        for _ in 0..3 {
            assert_eq!(registry.lookup_global("f", &importer).unwrap().path, first);
        }
        assert_eq!(first, root.join("x/util.py"));
    }

    #[test]
    fn test_asset_resolution_prefers_absolute_key() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(
            &[
                ("app/x.component.html", "<div></div>"),
                ("other/x.component.html", "<div></div>"),
            ],
            root,
        );
        let component = root.join("app/x.component.ts");
        let hit = registry
            .resolve_asset(AssetRole::Template, &component, "./x.component.html")
            .expect("template should resolve");
        assert_eq!(hit.path, root.join("app/x.component.html"));
    }

    #[test]
    fn test_export_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(&[("base.ts", "export class Base {}")], root);
        let file_id = registry.file_for_path(&root.join("base.ts")).unwrap();
        let importer = root.join("child.ts");
        let hit = registry
            .lookup_export(file_id, "Base", &importer)
            .expect("exported name should be indexed");
        assert_eq!(hit.kind, EntityKind::Class);
    }

    #[test]
    fn test_missing_specifier_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let registry = registry_for(&[("a.py", "")], root);
        assert!(registry
            .resolve_module(&root.join("a.py"), "nonexistent")
            .is_none());
    }
}
