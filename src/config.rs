use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::frontend::ParseOptions;

/// Configuration loaded from `atlas.toml` at the project root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Glob patterns restricting which files are extracted. Empty means
    /// every claimed extension under the root.
    pub include: Vec<String>,
    /// Additional path patterns to exclude (beyond .gitignore).
    pub exclude: Vec<String>,
    /// Source roots (relative to the project root) used for module-name
    /// derivation and bare-specifier resolution. Defaults to the root itself.
    pub source_roots: Vec<PathBuf>,
    /// Files larger than this many bytes are skipped (File entity still
    /// created).
    pub max_file_size: u64,
    /// Follow symlinks during discovery.
    pub follow_symlinks: bool,
    /// Capture Python docstrings as entity properties.
    pub capture_docstrings: bool,
    /// Rows per store write batch.
    pub batch_size: usize,
    /// Per-call read-query deadline in seconds.
    pub query_timeout_secs: u64,
    /// Store directory name under the project root.
    pub store_dir: String,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            source_roots: Vec::new(),
            max_file_size: 1024 * 1024,
            follow_symlinks: false,
            capture_docstrings: true,
            batch_size: 1000,
            query_timeout_secs: 30,
            store_dir: ".atlas".to_owned(),
        }
    }
}

impl AtlasConfig {
    /// Load configuration from `atlas.toml` in the given root directory.
    ///
    /// Returns the default configuration if the file does not exist or
    /// cannot be parsed.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join("atlas.toml");

        if !config_path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!("failed to parse atlas.toml: {err}. Using defaults.");
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!("failed to read atlas.toml: {err}. Using defaults.");
                Self::default()
            }
        }
    }

    /// Absolute source roots for a project rooted at `root`.
    pub fn absolute_source_roots(&self, root: &Path) -> Vec<PathBuf> {
        if self.source_roots.is_empty() {
            return vec![root.to_path_buf()];
        }
        self.source_roots
            .iter()
            .map(|r| if r.is_absolute() { r.clone() } else { root.join(r) })
            .collect()
    }

    /// Front-end options for a run over `root`.
    pub fn parse_options(&self, root: &Path) -> ParseOptions {
        ParseOptions {
            max_file_size: self.max_file_size,
            capture_docstrings: self.capture_docstrings,
            source_roots: self.absolute_source_roots(root),
        }
    }

    /// The store directory for a project rooted at `root`.
    pub fn store_path(&self, root: &Path) -> PathBuf {
        root.join(&self.store_dir)
    }

    /// Write a starter `atlas.toml` if none exists yet. Returns whether a
    /// file was written.
    pub fn write_default(root: &Path) -> std::io::Result<bool> {
        let config_path = root.join("atlas.toml");
        if config_path.exists() {
            return Ok(false);
        }
        std::fs::write(
            &config_path,
            "# code-atlas configuration\n\
             #\n\
             # include = [\"src/**\"]\n\
             # exclude = [\"**/generated/**\"]\n\
             # source_roots = [\"src\"]\n\
             # max_file_size = 1048576\n\
             # follow_symlinks = false\n\
             # capture_docstrings = true\n\
             # batch_size = 1000\n\
             # query_timeout_secs = 30\n\
             # store_dir = \".atlas\"\n",
        )?;
        Ok(true)
    }
}
