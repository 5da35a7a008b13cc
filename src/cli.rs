use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Extract a typed, queryable code graph from a source tree.
///
/// atlas parses your project into entities (files, classes, functions,
/// components, ...) and relationships (contains, calls, inherits, imports,
/// ...), stores them in an embedded graph store, and reconciles the store
/// incrementally as files change.
#[derive(Parser, Debug)]
#[command(name = "atlas", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for query results.
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq)]
pub enum OutputFormat {
    /// Human-readable columnar table (default).
    #[default]
    Table,
    /// Structured JSON array suitable for programmatic consumption.
    Json,
    /// Comma-separated values with a header row.
    Csv,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the store and write a starter atlas.toml.
    Init {
        /// Project root (default: current directory).
        path: Option<PathBuf>,
    },

    /// Reconcile the graph store with the filesystem.
    ///
    /// Classifies files as added / modified / deleted by content hash and
    /// re-extracts only what changed. Exit status is non-zero on I/O or
    /// store errors; per-file parse errors are reported but do not fail the
    /// run.
    Update {
        /// Drop the store contents and journal, then re-extract everything.
        #[arg(long)]
        full: bool,

        /// Subtree to reconcile (default: the project root).
        #[arg(long)]
        path: Option<PathBuf>,

        /// Project root holding atlas.toml and the store (default: current
        /// directory).
        #[arg(short = 'C', long)]
        project: Option<PathBuf>,
    },

    /// Run a one-shot read-only query against the store.
    Query {
        /// The query text, e.g. "MATCH (n:Function) RETURN n.name LIMIT 10".
        query: String,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Cap the number of returned rows.
        #[arg(long)]
        limit: Option<usize>,

        /// Project root (default: current directory).
        #[arg(short = 'C', long)]
        project: Option<PathBuf>,
    },

    /// Entity and relationship counts per kind, plus store health.
    Status {
        /// Project root (default: current directory).
        path: Option<PathBuf>,

        /// Output results as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Delete the store directory. The supported reset operation.
    Reset {
        /// Project root (default: current directory).
        path: Option<PathBuf>,
    },
}
