use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{Entity, FileParse, PropKey, PropValue};

// ---------------------------------------------------------------------------
// Static-asset front-ends
//
// Templates and stylesheets never declare entities. They produce exactly one
// File entity per file so that framework edges (UsesTemplate / UsesStyles)
// have a resolvable target, plus recognized selector patterns as properties.
// ---------------------------------------------------------------------------

static ELEMENT_SELECTOR_RE: OnceLock<Regex> = OnceLock::new();
static CLASS_SELECTOR_RE: OnceLock<Regex> = OnceLock::new();

/// Hyphenated custom-element tags (`<app-user-card>`) — the shape Angular
/// component selectors take in templates.
fn element_selector_re() -> &'static Regex {
    ELEMENT_SELECTOR_RE
        .get_or_init(|| Regex::new(r"<([a-z][a-z0-9]*(?:-[a-z0-9]+)+)[\s>/]").expect("valid regex"))
}

/// Class selectors at rule position (`.card { ... }`).
fn class_selector_re() -> &'static Regex {
    CLASS_SELECTOR_RE
        .get_or_init(|| Regex::new(r"\.([-_a-zA-Z][-_a-zA-Z0-9]*)").expect("valid regex"))
}

/// Template front-end: one File entity, custom-element selectors recorded.
pub fn extract_template(_path: &Path, source: &[u8], mut file: Entity) -> FileParse {
    let text = String::from_utf8_lossy(source);
    let selectors: BTreeSet<String> = element_selector_re()
        .captures_iter(&text)
        .map(|c| c[1].to_owned())
        .collect();
    if !selectors.is_empty() {
        file.props.insert(
            PropKey::Selectors,
            PropValue::StrList(selectors.into_iter().collect()),
        );
    }
    FileParse::file_only(file)
}

/// Stylesheet front-end: one File entity, class selectors recorded.
pub fn extract_stylesheet(_path: &Path, source: &[u8], mut file: Entity) -> FileParse {
    let text = String::from_utf8_lossy(source);
    let selectors: BTreeSet<String> = class_selector_re()
        .captures_iter(&text)
        .map(|c| c[1].to_owned())
        .collect();
    if !selectors.is_empty() {
        file.props.insert(
            PropKey::Selectors,
            PropValue::StrList(selectors.into_iter().collect()),
        );
    }
    FileParse::file_only(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::file_entity;
    use crate::model::EntityKind;
    use std::path::PathBuf;

    #[test]
    fn test_template_produces_single_file_entity() {
        let path = PathBuf::from("/p/x.component.html");
        let file = file_entity(&path, 3, "html");
        let src = b"<div>\n  <app-user-card></app-user-card>\n</div>\n";
        let parse = extract_template(&path, src, file);
        assert_eq!(parse.file.kind, EntityKind::File);
        assert!(parse.entities.is_empty(), "templates declare nothing");
        assert!(parse.pending.is_empty());
        assert_eq!(
            parse.file.props.get(&PropKey::Selectors),
            Some(&PropValue::StrList(vec!["app-user-card".to_owned()]))
        );
    }

    #[test]
    fn test_plain_html_tags_are_not_selectors() {
        let path = PathBuf::from("/p/page.html");
        let file = file_entity(&path, 1, "html");
        let parse = extract_template(&path, b"<div><span>hi</span></div>", file);
        assert!(parse.file.props.get(&PropKey::Selectors).is_none());
    }

    #[test]
    fn test_stylesheet_records_class_selectors() {
        let path = PathBuf::from("/p/x.component.scss");
        let file = file_entity(&path, 2, "stylesheet");
        let parse = extract_stylesheet(&path, b".card { color: red; }\n.card-title { }\n", file);
        assert_eq!(
            parse.file.props.get(&PropKey::Selectors),
            Some(&PropValue::StrList(vec![
                "card".to_owned(),
                "card-title".to_owned()
            ]))
        );
    }
}
