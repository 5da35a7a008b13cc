pub mod assets;
pub mod decorators;
pub mod python;
pub mod typescript;

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use tree_sitter::{Node, Parser, Tree};

use crate::language::FrontendKind;
use crate::model::{
    DiagnosticKind, Entity, EntityKind, FileParse, ParseDiagnostic, PropKey, PropValue,
};

// Thread-local Parser instances — one per rayon worker thread, zero lock
// contention. Each Parser is initialised once per thread with the
// appropriate grammar.
thread_local! {
    static PARSER_TS: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()).unwrap();
        p
    });
    static PARSER_TSX: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into()).unwrap();
        p
    });
    static PARSER_JS: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        p.set_language(&tree_sitter_javascript::LANGUAGE.into()).unwrap();
        p
    });
    static PARSER_PY: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        p.set_language(&tree_sitter_python::LANGUAGE.into()).unwrap();
        p
    });
}

/// Parse `source` with the thread-local parser for `ext`.
/// Returns `None` for unsupported extensions or when tree-sitter gives up
/// (truncated input, allocation failure).
pub(crate) fn parse_source(ext: &str, source: &[u8]) -> Option<Tree> {
    match ext {
        "ts" => PARSER_TS.with(|p| p.borrow_mut().parse(source, None)),
        "tsx" => PARSER_TSX.with(|p| p.borrow_mut().parse(source, None)),
        "js" | "jsx" | "mjs" | "cjs" => PARSER_JS.with(|p| p.borrow_mut().parse(source, None)),
        "py" => PARSER_PY.with(|p| p.borrow_mut().parse(source, None)),
        _ => None,
    }
}

/// Per-run options threaded into every front-end invocation. Constructed by
/// the extractor driver from the loaded configuration — there is no global
/// parser registry.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Files larger than this are skipped (the File entity is still created).
    pub max_file_size: u64,
    /// Capture Python docstrings as the `docstring` property.
    pub capture_docstrings: bool,
    /// Roots used to derive module dotted names and package subpaths.
    pub source_roots: Vec<PathBuf>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            capture_docstrings: true,
            source_roots: Vec::new(),
        }
    }
}

/// Extract the UTF-8 text of a node from the original source bytes.
pub(crate) fn node_text<'a>(node: Node<'a>, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

/// 1-based line of a node's start position.
pub(crate) fn start_line(node: Node) -> u32 {
    node.start_position().row as u32 + 1
}

/// 1-based line of a node's end position.
pub(crate) fn end_line(node: Node) -> u32 {
    node.end_position().row as u32 + 1
}

/// Build the File entity for `path`: name is the file name, the span covers
/// the whole file, and the language string is stored as a property.
///
/// A File's identity tuple pins the line fields to zero: the entity lives
/// until the path is deleted from disk, and growing a file must not
/// re-identify it (edges from other files reference the File by id).
pub(crate) fn file_entity(path: &Path, line_count: u32, language: &str) -> Entity {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut entity = Entity::new(
        EntityKind::File,
        name.clone(),
        name,
        path.to_path_buf(),
        0,
        0,
    );
    entity.span = crate::model::LineSpan {
        start: 1,
        end: line_count.max(1),
    };
    entity.with_prop(PropKey::Language, PropValue::Str(language.to_owned()))
}

/// Parse one source file through the front-end claiming its extension.
///
/// This is the single entry point the driver calls per file. It enforces the
/// size cap and encoding policy, then dispatches. Failures degrade per the
/// error policy: the File entity is always produced, problems are reported
/// as diagnostics, nothing is thrown.
pub fn parse_file(path: &Path, opts: &ParseOptions) -> FileParse {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let Some(kind) = FrontendKind::for_extension(ext) else {
        // The driver only hands over claimed paths; an unclaimed path here is
        // a File entity with nothing in it.
        return FileParse::file_only(file_entity(path, 1, "unknown"));
    };
    let language = kind.language_name(ext);

    // Size cap check before reading — over-cap files are skipped with a
    // warning but still materialize so links to them resolve.
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > opts.max_file_size => {
            tracing::warn!(
                path = %path.display(),
                size = meta.len(),
                cap = opts.max_file_size,
                "file exceeds size cap, skipping declarations"
            );
            let mut parse = FileParse::file_only(file_entity(path, 1, language));
            parse.diagnostics.push(ParseDiagnostic {
                path: path.to_path_buf(),
                line: 0,
                column: 0,
                kind: DiagnosticKind::SkippedFile,
                message: format!(
                    "file size {} exceeds cap {}",
                    meta.len(),
                    opts.max_file_size
                ),
            });
            return parse;
        }
        Ok(_) => {}
        Err(err) => {
            let mut parse = FileParse::file_only(file_entity(path, 1, language));
            parse.diagnostics.push(ParseDiagnostic {
                path: path.to_path_buf(),
                line: 0,
                column: 0,
                kind: DiagnosticKind::SkippedFile,
                message: format!("cannot stat file: {err}"),
            });
            return parse;
        }
    }

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(err) => {
            let mut parse = FileParse::file_only(file_entity(path, 1, language));
            parse.diagnostics.push(ParseDiagnostic {
                path: path.to_path_buf(),
                line: 0,
                column: 0,
                kind: DiagnosticKind::SkippedFile,
                message: format!("cannot read file: {err}"),
            });
            return parse;
        }
    };

    if std::str::from_utf8(&bytes).is_err() {
        let mut parse = FileParse::file_only(file_entity(path, 1, language));
        parse.diagnostics.push(ParseDiagnostic {
            path: path.to_path_buf(),
            line: 0,
            column: 0,
            kind: DiagnosticKind::EncodingError,
            message: "file is not valid UTF-8".to_owned(),
        });
        return parse;
    }

    let line_count = bytes.iter().filter(|&&b| b == b'\n').count() as u32 + 1;
    let file = file_entity(path, line_count, language);

    match kind {
        FrontendKind::Python => python::extract(path, &bytes, file, opts),
        FrontendKind::TypeScript | FrontendKind::JavaScript => {
            typescript::extract(path, &bytes, ext, file, opts)
        }
        FrontendKind::Template => assets::extract_template(path, &bytes, file),
        FrontendKind::Stylesheet => assets::extract_stylesheet(path, &bytes, file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_oversized_file_degrades_to_file_entity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.py");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"def f():\n    pass\n").unwrap();

        let opts = ParseOptions {
            max_file_size: 4,
            ..ParseOptions::default()
        };
        let parse = parse_file(&path, &opts);
        assert_eq!(parse.file.kind, EntityKind::File);
        assert!(parse.entities.is_empty(), "no declarations past the cap");
        assert_eq!(parse.diagnostics.len(), 1);
        assert_eq!(parse.diagnostics[0].kind, DiagnosticKind::SkippedFile);
    }

    #[test]
    fn test_non_utf8_reports_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.py");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x41]).unwrap();

        let parse = parse_file(&path, &ParseOptions::default());
        assert!(parse.entities.is_empty());
        assert_eq!(parse.diagnostics[0].kind, DiagnosticKind::EncodingError);
    }

    #[test]
    fn test_file_entity_identity_is_path_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "x = 1\n").unwrap();

        let a = parse_file(&path, &ParseOptions::default());
        let b = parse_file(&path, &ParseOptions::default());
        assert_eq!(a.file.id, b.file.id);
    }
}
