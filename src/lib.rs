//! code-atlas — a graph extraction core.
//!
//! Ingests a source tree, extracts a typed property graph of code entities
//! and their relationships via a two-pass parser pipeline, persists it in an
//! embedded graph store, and keeps the store consistent with the filesystem
//! through content-hash-driven incremental updates.

pub mod cli;
pub mod config;
pub mod extractor;
pub mod frontend;
pub mod incremental;
pub mod language;
pub mod model;
pub mod output;
pub mod registry;
pub mod resolve;
pub mod store;
