use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use code_atlas::cli::{Cli, Commands};
use code_atlas::config::AtlasConfig;
use code_atlas::incremental;
use code_atlas::output;
use code_atlas::store::StoreAdapter;

/// Resolve an optional project-root argument to an absolute path.
fn project_root(path: Option<PathBuf>) -> Result<PathBuf> {
    let root = match path {
        Some(p) => p,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("project root {} does not exist", root.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            let root = project_root(path)?;
            let config = AtlasConfig::load(&root);
            let wrote_config = AtlasConfig::write_default(&root)?;
            let store_dir = config.store_path(&root);
            let mut store = StoreAdapter::open(&store_dir, &config)
                .with_context(|| format!("cannot open store at {}", store_dir.display()))?;
            store.persist()?;
            println!("Initialized store at {}", store_dir.display());
            if wrote_config {
                println!("Wrote {}", root.join("atlas.toml").display());
            }
        }

        Commands::Update {
            full,
            path,
            project,
        } => {
            let root = project_root(project)?;
            let config = AtlasConfig::load(&root);
            let scan_root = match path {
                Some(p) => {
                    let p = if p.is_absolute() { p } else { root.join(p) };
                    p.canonicalize()
                        .with_context(|| format!("path {} does not exist", p.display()))?
                }
                None => root.clone(),
            };

            let store_dir = config.store_path(&root);
            let mut store = StoreAdapter::open(&store_dir, &config)
                .with_context(|| format!("cannot open store at {}", store_dir.display()))?;

            let start = std::time::Instant::now();
            let cancel = AtomicBool::new(false);
            let report = incremental::run_update_scoped(
                &mut store, &root, &scan_root, &config, full, &cancel,
            )?;
            output::print_update_summary(&report, start.elapsed().as_secs_f64());
        }

        Commands::Query {
            query,
            format,
            limit,
            project,
        } => {
            let root = project_root(project)?;
            let config = AtlasConfig::load(&root);
            let store_dir = config.store_path(&root);
            let store = StoreAdapter::open(&store_dir, &config)
                .with_context(|| format!("cannot open store at {}", store_dir.display()))?;

            let mut rows = store
                .query(&query, &HashMap::new())
                .context("query failed")?;
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            output::print_rows(&rows, format);
        }

        Commands::Status { path, json } => {
            let root = project_root(path)?;
            let config = AtlasConfig::load(&root);
            let store_dir = config.store_path(&root);
            let store = StoreAdapter::open(&store_dir, &config)
                .with_context(|| format!("cannot open store at {}", store_dir.display()))?;
            let counts = store.counts();
            let tracked = store.tracked_files().len();
            let version = store.schema_report().version;
            output::print_status(&counts, &store_dir, version, tracked, json);
        }

        Commands::Reset { path } => {
            let root = project_root(path)?;
            let config = AtlasConfig::load(&root);
            let store_dir = config.store_path(&root);
            reset_store(&store_dir)?;
            println!("Removed {}", store_dir.display());
        }
    }

    Ok(())
}

/// Deleting the store directory is the supported reset operation; the
/// journal lives inside it and goes with it.
fn reset_store(store_dir: &Path) -> Result<()> {
    if store_dir.exists() {
        std::fs::remove_dir_all(store_dir)
            .with_context(|| format!("cannot remove {}", store_dir.display()))?;
    }
    Ok(())
}
