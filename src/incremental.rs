use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AtlasConfig;
use crate::extractor::{self, ExtractReport, ExtractionDelta};
use crate::model::FileParse;
use crate::store::{ApplyReport, GraphBackend, StoreAdapter};

/// Backstop on reconciliation rounds; the done-set already guarantees
/// termination, this bounds pathological invalidation chains.
const MAX_ROUNDS: usize = 8;

const JOURNAL_FILE: &str = "journal.json";
const JOURNAL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Content-hash journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    sha256: String,
    mtime_secs: u64,
}

/// Per-file content hashes and last-parsed mtimes, stored as a sibling file
/// of the store. `mtime` is only a fast path — classification is decided by
/// the content hash.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Journal {
    version: u32,
    entries: BTreeMap<PathBuf, JournalEntry>,
}

impl Journal {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(JOURNAL_FILE);
        let Ok(bytes) = std::fs::read(&path) else {
            return Self {
                version: JOURNAL_VERSION,
                ..Self::default()
            };
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(journal) if journal.version == JOURNAL_VERSION => journal,
            _ => {
                tracing::warn!("journal unreadable or outdated; all files treated as modified");
                Self {
                    version: JOURNAL_VERSION,
                    ..Self::default()
                }
            }
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.flush()?;
        tmp.persist(dir.join(JOURNAL_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn delete(dir: &Path) {
        let _ = std::fs::remove_file(dir.join(JOURNAL_FILE));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn mtime_secs(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Update engine
// ---------------------------------------------------------------------------

/// Summary of one `update` run.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Reconciliation rounds run (1 unless invalidation propagated).
    pub rounds: usize,
    pub full: bool,
    pub canceled: bool,
    pub extract: ExtractReport,
    pub entities_written: usize,
    pub relationships_written: usize,
    pub demoted_edges: usize,
    pub orphan_externals_removed: usize,
    pub row_failures: usize,
    pub unknown_kinds: Vec<String>,
}

impl UpdateReport {
    fn absorb_apply(&mut self, report: &ApplyReport) {
        self.entities_written += report.entities_written;
        self.relationships_written += report.relationships_written;
        self.demoted_edges += report.demoted_edges;
        self.orphan_externals_removed += report.orphan_externals_removed;
        self.row_failures += report.row_failures.len();
        for kind in &report.unknown_kinds {
            if !self.unknown_kinds.contains(kind) {
                self.unknown_kinds.push(kind.clone());
            }
        }
    }

    fn absorb_extract(&mut self, report: ExtractReport) {
        self.extract.files_parsed += report.files_parsed;
        self.extract.files_skipped += report.files_skipped;
        self.extract.parse_errors += report.parse_errors;
        self.extract.entities += report.entities;
        self.extract.relationships += report.relationships;
        self.extract.resolution.merge(report.resolution);
        self.extract.diagnostics.extend(report.diagnostics);
        self.extract.canceled |= report.canceled;
    }
}

/// Reconcile the store with the filesystem under `root`.
///
/// Classification: `added = present − tracked`, `deleted = tracked −
/// present`, `modified = hash mismatch`, everything else untouched. Deleted
/// files detach-delete their subtree; `added ∪ modified` re-extracts with
/// the registry seeded from stored rows of unchanged files. When a
/// replacement removes an identity other files pointed at, or a new export
/// can satisfy a previously-External name, the affected files re-extract in
/// a following round until the graph reaches fixpoint — this is what keeps
/// the incremental result equal to a cold `--full` run.
pub fn run_update<B: GraphBackend>(
    store: &mut StoreAdapter<B>,
    root: &Path,
    config: &AtlasConfig,
    full: bool,
    cancel: &AtomicBool,
) -> anyhow::Result<UpdateReport> {
    run_update_scoped(store, root, root, config, full, cancel)
}

/// `run_update` with discovery restricted to `scan_root` (the `--path`
/// flag). The store, journal and source roots stay anchored at the project
/// root; tracked files outside the scanned subtree are left untouched.
pub fn run_update_scoped<B: GraphBackend>(
    store: &mut StoreAdapter<B>,
    root: &Path,
    scan_root: &Path,
    config: &AtlasConfig,
    full: bool,
    cancel: &AtomicBool,
) -> anyhow::Result<UpdateReport> {
    let store_dir = config.store_path(root);
    let mut report = UpdateReport {
        full,
        ..UpdateReport::default()
    };

    let mut journal = if full {
        // A reset is a reset: contents and journal both go.
        store.clear_all()?;
        Journal::delete(&store_dir);
        Journal {
            version: JOURNAL_VERSION,
            ..Journal::default()
        }
    } else {
        Journal::load(&store_dir)
    };

    // Enumerate tracked and on-disk sets. Tracked files outside the scanned
    // subtree are invisible to this run (neither re-parsed nor deleted).
    let present: Vec<PathBuf> = extractor::discover_files(scan_root, config)?;
    let present_set: HashSet<PathBuf> = present.iter().cloned().collect();
    let tracked: HashSet<PathBuf> = store
        .tracked_files()
        .into_iter()
        .filter(|p| p.starts_with(scan_root))
        .collect();

    // Classify. Hashes are computed lazily: an unchanged mtime trusts the
    // journal, everything else is re-hashed.
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut hashes: HashMap<PathBuf, JournalEntry> = HashMap::new();
    for path in &present {
        let mtime = mtime_secs(path);
        let journal_entry = journal.entries.get(path);
        if let Some(entry) = journal_entry
            && entry.mtime_secs == mtime
            && tracked.contains(path)
        {
            continue;
        }
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        let hash = sha256_hex(&bytes);
        let unchanged = journal_entry.map(|e| e.sha256 == hash).unwrap_or(false) && tracked.contains(path);
        hashes.insert(
            path.clone(),
            JournalEntry {
                sha256: hash,
                mtime_secs: mtime,
            },
        );
        if unchanged {
            // Touched but identical: refresh the journal mtime only.
            journal.entries.insert(path.clone(), hashes[path].clone());
            continue;
        }
        if tracked.contains(path) {
            modified.push(path.clone());
        } else {
            added.push(path.clone());
        }
    }
    let deleted: Vec<PathBuf> = {
        let mut d: Vec<PathBuf> = tracked.difference(&present_set).cloned().collect();
        d.sort();
        d
    };

    report.added = added.len();
    report.modified = modified.len();
    report.deleted = deleted.len();
    report.unchanged = present.len() - added.len() - modified.len();

    tracing::info!(
        added = report.added,
        modified = report.modified,
        deleted = report.deleted,
        unchanged = report.unchanged,
        full,
        "update classified"
    );

    // Delete first; importers of deleted subtrees re-resolve below.
    let mut work: HashSet<PathBuf> = added.into_iter().chain(modified).collect();
    if !deleted.is_empty() {
        let delete_delta = ExtractionDelta {
            files: Vec::new(),
            externals: Vec::new(),
            deleted_files: deleted.clone(),
        };
        let apply = store.apply(&delete_delta)?;
        report.absorb_apply(&apply);
        for path in apply.dangling_importers {
            if present_set.contains(&path) {
                work.insert(path);
            }
        }
        for path in &deleted {
            journal.entries.remove(path);
        }
    }

    // Reconciliation rounds.
    let options = config.parse_options(root);
    let mut done: HashSet<PathBuf> = HashSet::new();
    while !work.is_empty() && report.rounds < MAX_ROUNDS {
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            report.canceled = true;
            break;
        }
        report.rounds += 1;

        let mut batch: Vec<PathBuf> = work
            .drain()
            .filter(|p| !done.contains(p) && present_set.contains(p))
            .collect();
        if batch.is_empty() {
            break;
        }
        batch.sort();

        // Seed the registry from stored rows of every tracked file outside
        // this batch, so cross-file references still resolve.
        let batch_set: HashSet<PathBuf> = batch.iter().cloned().collect();
        let seeds: Vec<FileParse> = store
            .tracked_files()
            .into_iter()
            .filter(|p| !batch_set.contains(p))
            .filter_map(|p| store.reconstruct_parse(&p))
            .collect();

        let outcome = extractor::extract_paths(&batch, &options, seeds, cancel);
        if outcome.report.canceled {
            report.canceled = true;
            report.absorb_extract(outcome.report);
            break;
        }

        let new_names: HashSet<String> = outcome
            .delta
            .files
            .iter()
            .flat_map(|f| f.exported_names.iter().cloned())
            .collect();

        report.absorb_extract(outcome.report);
        let apply = store.apply(&outcome.delta)?;
        report.absorb_apply(&apply);

        // Journal the files just reconciled.
        for path in &batch {
            let entry = hashes.remove(path).unwrap_or_else(|| {
                let bytes = std::fs::read(path).unwrap_or_default();
                JournalEntry {
                    sha256: sha256_hex(&bytes),
                    mtime_secs: mtime_secs(path),
                }
            });
            journal.entries.insert(path.clone(), entry);
        }
        done.extend(batch);

        // Next round: files whose edges dangled after the replacement, plus
        // files still holding an External that a fresh export now satisfies.
        let mut next: HashSet<PathBuf> = HashSet::new();
        for path in apply.dangling_importers {
            if present_set.contains(&path) && !done.contains(&path) {
                next.insert(path);
            }
        }
        if !new_names.is_empty() {
            for (name, sources) in store.externals_with_sources() {
                if !new_names.contains(&name) {
                    continue;
                }
                for source in sources {
                    if present_set.contains(&source) && !done.contains(&source) {
                        next.insert(source);
                    }
                }
            }
        }
        work = next;
    }

    journal.save(&store_dir)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EmbeddedStore;
    use std::sync::atomic::AtomicBool;

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn update(root: &Path, config: &AtlasConfig, full: bool) -> UpdateReport {
        let mut store = StoreAdapter::open(&config.store_path(root), config).unwrap();
        run_update(&mut store, root, config, full, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn test_initial_run_adds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.py", "def f():\n    pass\n");
        write(root, "b.py", "def g():\n    pass\n");
        let config = AtlasConfig::default();
        let report = update(root, &config, false);
        assert_eq!(report.added, 2);
        assert_eq!(report.modified, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.rounds, 1);
    }

    #[test]
    fn test_second_run_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.py", "def f():\n    pass\n");
        let config = AtlasConfig::default();
        update(root, &config, false);
        let report = update(root, &config, false);
        assert_eq!(report.added, 0);
        assert_eq!(report.modified, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.rounds, 0, "nothing to reconcile");
    }

    #[test]
    fn test_touch_without_change_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.py", "def f():\n    pass\n");
        let config = AtlasConfig::default();
        update(root, &config, false);
        // Rewrite identical bytes: mtime moves, hash does not.
        std::fs::write(&a, "def f():\n    pass\n").unwrap();
        let report = update(root, &config, false);
        assert_eq!(report.modified, 0);
        assert_eq!(report.unchanged, 1);
    }

    #[test]
    fn test_modification_is_detected_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write(root, "a.py", "def f():\n    pass\n");
        let config = AtlasConfig::default();
        update(root, &config, false);
        std::fs::write(&a, "def f():\n    pass\n\ndef h():\n    pass\n").unwrap();
        let report = update(root, &config, false);
        assert_eq!(report.modified, 1);
        assert_eq!(report.added, 0);
    }

    #[test]
    fn test_full_mode_resets_journal_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.py", "def f():\n    pass\n");
        let config = AtlasConfig::default();
        update(root, &config, false);
        let report = update(root, &config, true);
        assert!(report.full);
        assert_eq!(report.added, 1, "--full treats everything as new");
        let journal = Journal::load(&config.store_path(root));
        assert_eq!(journal.len(), 1, "journal rebuilt from scratch");
    }

    #[test]
    fn test_journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal {
            version: JOURNAL_VERSION,
            ..Journal::default()
        };
        journal.entries.insert(
            PathBuf::from("/p/a.py"),
            JournalEntry {
                sha256: "ab".into(),
                mtime_secs: 7,
            },
        );
        journal.save(dir.path()).unwrap();
        let loaded = Journal::load(dir.path());
        assert_eq!(loaded.len(), 1);
        assert!(!loaded.is_empty());
    }

    #[test]
    fn test_store_survives_reopen_between_updates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.py", "def f():\n    pass\n");
        let config = AtlasConfig::default();
        update(root, &config, false);

        let store = StoreAdapter::<EmbeddedStore>::open(&config.store_path(root), &config).unwrap();
        assert_eq!(store.tracked_files().len(), 1);
    }
}
