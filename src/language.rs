use std::path::Path;

use serde::{Deserialize, Serialize};
use tree_sitter::Language;

/// A language front-end handled by the extractor.
///
/// Uses a plain enum (not trait objects) to avoid `dyn` overhead. Cheap to
/// copy and pattern-matched at dispatch boundaries. Each extension is claimed
/// by exactly one front-end; the claim table is built once per run from the
/// configuration rather than from a global registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrontendKind {
    Python,
    TypeScript,
    JavaScript,
    Template,
    Stylesheet,
}

impl FrontendKind {
    /// The front-end claiming `ext`, or `None` for unsupported extensions.
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(Self::Python),
            "ts" | "tsx" => Some(Self::TypeScript),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "html" | "htm" => Some(Self::Template),
            "css" | "scss" | "sass" | "less" => Some(Self::Stylesheet),
            _ => None,
        }
    }

    /// The front-end claiming `path`'s extension.
    pub fn for_path(path: &Path) -> Option<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::for_extension(ext)
    }

    /// Canonical language string stored on File entities.
    pub fn language_name(&self, ext: &str) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript => {
                if ext == "tsx" {
                    "tsx"
                } else {
                    "typescript"
                }
            }
            Self::JavaScript => "javascript",
            Self::Template => "html",
            Self::Stylesheet => "stylesheet",
        }
    }

    /// True for front-ends that extract declarations (the static-asset
    /// front-ends only materialize File entities).
    pub fn extracts_declarations(&self) -> bool {
        matches!(self, Self::Python | Self::TypeScript | Self::JavaScript)
    }
}

/// Return the tree-sitter [`Language`] for the given file extension, or
/// `None` if the extension has no grammar (asset files are not parsed with
/// tree-sitter).
///
/// # Grammar selection rules
/// - `.ts`        -> TypeScript grammar (`LANGUAGE_TYPESCRIPT`)
/// - `.tsx`       -> TSX grammar        (`LANGUAGE_TSX`)
///   These MUST be different: the TypeScript grammar cannot parse JSX, and
///   the TSX grammar breaks angle-bracket type assertions (`<T>expr`).
/// - `.js`/`.jsx` -> JavaScript grammar
/// - `.py`        -> Python grammar
pub fn grammar_for_extension(ext: &str) -> Option<Language> {
    match ext {
        "ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "py" => Some(tree_sitter_python::LANGUAGE.into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_claims_are_disjoint() {
        assert_eq!(FrontendKind::for_extension("py"), Some(FrontendKind::Python));
        assert_eq!(FrontendKind::for_extension("ts"), Some(FrontendKind::TypeScript));
        assert_eq!(FrontendKind::for_extension("jsx"), Some(FrontendKind::JavaScript));
        assert_eq!(FrontendKind::for_extension("scss"), Some(FrontendKind::Stylesheet));
        assert_eq!(FrontendKind::for_extension("html"), Some(FrontendKind::Template));
        assert_eq!(FrontendKind::for_extension("rs"), None);
    }

    #[test]
    fn test_grammar_only_for_parsed_languages() {
        assert!(grammar_for_extension("py").is_some());
        assert!(grammar_for_extension("ts").is_some());
        assert!(grammar_for_extension("html").is_none());
        assert!(grammar_for_extension("scss").is_none());
    }

    #[test]
    fn test_language_names() {
        assert_eq!(FrontendKind::TypeScript.language_name("tsx"), "tsx");
        assert_eq!(FrontendKind::TypeScript.language_name("ts"), "typescript");
        assert_eq!(FrontendKind::Python.language_name("py"), "python");
    }
}
