use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use rayon::prelude::*;

use crate::config::AtlasConfig;
use crate::frontend::{self, ParseOptions};
use crate::language::FrontendKind;
use crate::model::{DiagnosticKind, Entity, FileParse, ParseDiagnostic, Relationship};
use crate::registry::SymbolRegistry;
use crate::resolve::{self, ResolveStats};

// ---------------------------------------------------------------------------
// Delta model
// ---------------------------------------------------------------------------

/// One file's contribution to the extraction delta.
#[derive(Debug)]
pub struct FileDelta {
    pub file: Entity,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    /// Names this file makes addressable to other files — consumed by the
    /// incremental engine to re-check previously-External references.
    pub exported_names: Vec<String>,
}

/// The ordered set of add/modify operations produced by one extraction run.
/// File deletions are appended by the incremental engine.
#[derive(Debug, Default)]
pub struct ExtractionDelta {
    pub files: Vec<FileDelta>,
    /// External placeholders interned during pass 2, deduplicated by id.
    pub externals: Vec<Entity>,
    pub deleted_files: Vec<PathBuf>,
}

/// Summary of an extraction run.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub parse_errors: usize,
    pub entities: usize,
    pub relationships: usize,
    pub resolution: ResolveStats,
    pub diagnostics: Vec<ParseDiagnostic>,
    /// True when the cancellation flag stopped the run between files.
    pub canceled: bool,
}

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub delta: ExtractionDelta,
    pub report: ExtractReport,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Walk the project tree and collect files claimed by a front-end.
///
/// Respects `.gitignore` rules (even outside a git repository), applies the
/// configured include/exclude globs, follows symlinks only when enabled, and
/// returns absolute, deduplicated, sorted paths — each of which exactly one
/// front-end claims.
pub fn discover_files(root: &Path, config: &AtlasConfig) -> anyhow::Result<Vec<PathBuf>> {
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(true)
        // Read .gitignore files even when the directory is not inside a git
        // repository, so exclusions work for standalone trees and fixtures.
        .require_git(false)
        .follow_links(config.follow_symlinks)
        .build();

    let include: Vec<glob::Pattern> = compile_patterns(&config.include);
    let exclude: Vec<glob::Pattern> = compile_patterns(&config.exclude);

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for result in walker {
        let entry = match result {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!("walk error: {err}");
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        if FrontendKind::for_path(path).is_none() {
            continue;
        }
        if is_excluded(path, root, &exclude) {
            continue;
        }
        if !include.is_empty() && !matches_any(path, root, &include) {
            continue;
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        if seen.insert(absolute.clone()) {
            files.push(absolute);
        }
    }

    files.sort();
    Ok(files)
}

fn compile_patterns(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!("invalid glob pattern '{p}': {err}");
                None
            }
        })
        .collect()
}

fn matches_any(path: &Path, root: &Path, patterns: &[glob::Pattern]) -> bool {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel_str = rel.to_string_lossy();
    patterns.iter().any(|p| {
        p.matches(&rel_str)
            || p.matches(&path.to_string_lossy())
            || rel.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .map(|s| p.matches(s))
                    .unwrap_or(false)
            })
    })
}

fn is_excluded(path: &Path, root: &Path, patterns: &[glob::Pattern]) -> bool {
    !patterns.is_empty() && matches_any(path, root, patterns)
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Run the two-pass extraction over a fixed set of paths.
///
/// `seeds` carries reconstructed parses of unchanged files (incremental
/// mode): they are registered into the symbol registry so cross-file
/// references from the re-parsed subset still resolve, but they produce no
/// delta of their own.
///
/// Pass 1 parses in parallel; each worker commits its registry batch in a
/// single write-lock acquisition per file and polls `cancel` between files.
/// Pass 2 runs against the frozen registry, also in parallel, and is a pure
/// function of (registry, parse). Scheduling order cannot influence the
/// result: identities are deterministic and every tie-break is a total order
/// on paths.
pub fn extract_paths(
    paths: &[PathBuf],
    options: &ParseOptions,
    seeds: Vec<FileParse>,
    cancel: &AtomicBool,
) -> ExtractionOutcome {
    // Discover & dedupe: absolute, claimed, one parse per path.
    let mut unique: Vec<PathBuf> = paths
        .iter()
        .filter(|p| FrontendKind::for_path(p).is_some())
        .cloned()
        .collect();
    unique.sort();
    unique.dedup();

    let registry = RwLock::new(SymbolRegistry::new());
    {
        let mut reg = registry.write().expect("registry lock poisoned");
        for seed in &seeds {
            let batch = SymbolRegistry::batch_for(seed, &options.source_roots);
            reg.commit(batch);
        }
    }

    // Pass 1: parse in parallel, registry inserts batched at end-of-file.
    let parses: Vec<FileParse> = unique
        .par_iter()
        .filter_map(|path| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            let mut parse = frontend::parse_file(path, options);
            coalesce(&mut parse);
            let batch = SymbolRegistry::batch_for(&parse, &options.source_roots);
            registry
                .write()
                .expect("registry lock poisoned")
                .commit(batch);
            Some(parse)
        })
        .collect();

    let canceled = cancel.load(Ordering::Relaxed);

    // Pass 2 reads the registry frozen.
    let registry = registry.into_inner().expect("registry lock poisoned");
    let resolved: Vec<resolve::ResolvedFile> = parses
        .par_iter()
        .map(|parse| resolve::resolve_file(parse, &registry))
        .collect();

    // Assemble the delta; Externals are interned across files by identity.
    let mut report = ExtractReport {
        canceled,
        ..ExtractReport::default()
    };
    let mut delta = ExtractionDelta::default();
    let mut external_ids = HashSet::new();

    for (parse, resolved) in parses.into_iter().zip(resolved) {
        report.resolution.merge(resolved.stats);
        let skipped = parse
            .diagnostics
            .iter()
            .any(|d| matches!(d.kind, DiagnosticKind::SkippedFile | DiagnosticKind::EncodingError));
        if skipped {
            report.files_skipped += 1;
        } else {
            report.files_parsed += 1;
        }
        report.parse_errors += parse
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::ParseError)
            .count();
        report.diagnostics.extend(parse.diagnostics.clone());

        for external in resolved.externals {
            if external_ids.insert(external.id) {
                delta.externals.push(external);
            }
        }

        let mut relationships = parse.relationships;
        relationships.extend(resolved.relationships);

        report.entities += parse.entities.len() + 1;
        report.relationships += relationships.len();

        delta.files.push(FileDelta {
            file: parse.file,
            entities: parse.entities,
            relationships,
            exported_names: parse.exports.iter().map(|e| e.name.clone()).collect(),
        });
    }

    // External ordering must not depend on scheduling.
    delta.externals.sort_by(|a, b| a.name.cmp(&b.name));

    ExtractionOutcome { delta, report }
}

/// Entities with identical identity within one file are duplicates of the
/// same declaration and are coalesced before anything downstream sees them.
fn coalesce(parse: &mut FileParse) {
    let mut seen = HashSet::new();
    parse.entities.retain(|e| seen.insert(e.id));
    let mut seen_edges = HashSet::new();
    parse
        .relationships
        .retain(|r| seen_edges.insert((r.source, r.target, r.kind)));
}

/// Convenience wrapper: discover under `root` and extract everything.
pub fn extract_tree(
    root: &Path,
    config: &AtlasConfig,
    cancel: &AtomicBool,
) -> anyhow::Result<ExtractionOutcome> {
    let files = discover_files(root, config)?;
    let options = config.parse_options(root);
    Ok(extract_paths(&files, &options, Vec::new(), cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, RelationKind};

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_discovery_claims_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "b.py", "x = 1\n");
        write(root, "a.ts", "export const y = 1;\n");
        write(root, "notes.txt", "ignored\n");
        let files = discover_files(root, &AtlasConfig::default()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.ts", "b.py"]);
    }

    #[test]
    fn test_discovery_respects_exclude_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/keep.py", "x = 1\n");
        write(root, "vendor/skip.py", "x = 1\n");
        let config = AtlasConfig {
            exclude: vec!["vendor".to_owned()],
            ..AtlasConfig::default()
        };
        let files = discover_files(root, &config).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/keep.py"));
    }

    #[test]
    fn test_cross_file_call_resolves_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.py", "import b\n\ndef f():\n    g()\n");
        let b = write(root, "b.py", "def g():\n    pass\n");
        let config = AtlasConfig::default();
        let options = config.parse_options(root);
        let outcome = extract_paths(&[a, b], &options, Vec::new(), &AtomicBool::new(false));

        let all_edges: Vec<_> = outcome
            .delta
            .files
            .iter()
            .flat_map(|f| f.relationships.iter())
            .collect();
        assert!(
            all_edges.iter().any(|r| r.kind == RelationKind::Calls),
            "f -> g call should resolve across files"
        );
        assert!(outcome.delta.externals.is_empty(), "no externals expected");
        assert_eq!(outcome.report.files_parsed, 2);
    }

    #[test]
    fn test_seeded_registry_resolves_without_reemitting() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let b = write(root, "b.py", "def g():\n    pass\n");
        let a = write(root, "a.py", "import b\n\ndef h():\n    b.g()\n");
        let config = AtlasConfig::default();
        let options = config.parse_options(root);

        // Parse b once, then feed it back as a seed while extracting only a.
        let seed = frontend::parse_file(&b, &options);
        let outcome = extract_paths(&[a], &options, vec![seed], &AtomicBool::new(false));

        assert_eq!(outcome.delta.files.len(), 1, "seeds emit no delta");
        let edges: Vec<_> = outcome.delta.files[0].relationships.iter().collect();
        assert!(
            edges.iter().any(|r| r.kind == RelationKind::Calls),
            "call into the seeded file should resolve"
        );
    }

    #[test]
    fn test_cancellation_stops_between_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.py", "x = 1\n");
        let config = AtlasConfig::default();
        let options = config.parse_options(root);
        let cancel = AtomicBool::new(true);
        let outcome = extract_paths(&[a], &options, Vec::new(), &cancel);
        assert!(outcome.report.canceled);
        assert!(outcome.delta.files.is_empty());
    }

    #[test]
    fn test_external_interning_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.py", "import numpy as np\n\ndef fa():\n    np.array([1])\n");
        let b = write(root, "b.py", "import numpy as np\n\ndef fb():\n    np.array([2])\n");
        let config = AtlasConfig::default();
        let options = config.parse_options(root);
        let outcome = extract_paths(&[a, b], &options, Vec::new(), &AtomicBool::new(false));

        let numpy: Vec<_> = outcome
            .delta
            .externals
            .iter()
            .filter(|e| e.name == "numpy")
            .collect();
        assert_eq!(numpy.len(), 1, "one External per distinct name");
        assert_eq!(numpy[0].kind, EntityKind::External);

        let uses_to_numpy = outcome
            .delta
            .files
            .iter()
            .flat_map(|f| f.relationships.iter())
            .filter(|r| r.kind == RelationKind::Uses && r.target == numpy[0].id)
            .count();
        assert_eq!(uses_to_numpy, 2, "each caller's function Uses the same External");
    }
}
