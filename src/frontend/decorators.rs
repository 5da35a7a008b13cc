use tree_sitter::Node;

use super::{node_text, start_line};
use crate::model::{
    AssetRole, Entity, EntityKind, PendingEdge, PendingTarget, PropKey, PropValue, RelationKind,
    ScopeChain,
};

/// Map a recognized decorator name to the kind its class is promoted to.
/// Unrecognized decorators leave the class alone (they are still recorded in
/// the `decorators` property).
fn rekind_for(decorator: &str) -> Option<EntityKind> {
    match decorator {
        "Component" => Some(EntityKind::Component),
        "Injectable" => Some(EntityKind::Service),
        "Directive" => Some(EntityKind::Directive),
        "Pipe" => Some(EntityKind::Pipe),
        "NgModule" => Some(EntityKind::NgModule),
        _ => None,
    }
}

/// Apply the framework-decorator step to a freshly extracted class entity.
///
/// `decorator_nodes` are the `decorator` nodes attached to the declaration —
/// the caller gathers them from the class node itself and, for exported
/// classes, from the wrapping export statement (the grammar hangs them
/// there). The first recognized decorator rekinds the class in place — the
/// identity (already computed from the Class tuple) is preserved, so running
/// the step twice over unchanged source is idempotent and no plain Class
/// shadow ever materializes. Metadata is lifted into properties;
/// `templateUrl` and `styleUrls` become pending `UsesTemplate`/`UsesStyles`
/// edges while inline `template`/`styles` stay properties only. Every
/// decorator name also yields a pending `Decorates` reference so locally
/// declared decorator functions get wired to the classes they decorate.
pub fn apply(
    entity: &mut Entity,
    decorator_nodes: &[Node],
    source: &[u8],
    scope: &ScopeChain,
) -> Vec<PendingEdge> {
    let mut pending = Vec::new();
    let mut names = Vec::new();

    for &child in decorator_nodes {
        let Some((name, args)) = decorator_parts(child, source) else {
            continue;
        };

        pending.push(PendingEdge {
            source: entity.id,
            kind: RelationKind::Decorates,
            target: PendingTarget::Name {
                head: name.clone(),
                tail: Vec::new(),
            },
            scope: scope.clone(),
            line: start_line(child),
        });

        if let Some(kind) = rekind_for(&name)
            && entity.kind == EntityKind::Class
        {
            entity.kind = kind;
            if let Some(metadata) = args {
                extract_metadata(entity, metadata, source, scope, &mut pending);
            }
        }
        names.push(name);
    }

    if !names.is_empty() {
        entity
            .props
            .insert(PropKey::Decorators, PropValue::StrList(names));
    }
    pending
}

/// Split a `decorator` node into its name and (optional) call arguments.
/// Handles `@Name`, `@Name(...)` and `@ns.Name(...)` — the name is the last
/// path segment.
fn decorator_parts<'a>(decorator: Node<'a>, source: &[u8]) -> Option<(String, Option<Node<'a>>)> {
    let mut cursor = decorator.walk();
    for child in decorator.children(&mut cursor) {
        match child.kind() {
            "identifier" => return Some((node_text(child, source).to_owned(), None)),
            "member_expression" => {
                let name = node_text(child, source)
                    .rsplit('.')
                    .next()
                    .unwrap_or_default()
                    .to_owned();
                return Some((name, None));
            }
            "call_expression" => {
                let func = child.child_by_field_name("function")?;
                let name = node_text(func, source)
                    .rsplit('.')
                    .next()
                    .unwrap_or_default()
                    .to_owned();
                let args = child
                    .child_by_field_name("arguments")
                    .and_then(|a| first_object_arg(a));
                return Some((name, args));
            }
            _ => {}
        }
    }
    None
}

fn first_object_arg<'a>(arguments: Node<'a>) -> Option<Node<'a>> {
    let mut cursor = arguments.walk();
    arguments
        .children(&mut cursor)
        .find(|c| c.kind() == "object")
}

/// Lift recognized keys of the decorator metadata object into properties and
/// pending asset edges.
fn extract_metadata(
    entity: &mut Entity,
    object: Node,
    source: &[u8],
    scope: &ScopeChain,
    pending: &mut Vec<PendingEdge>,
) {
    let mut cursor = object.walk();
    for pair in object.children(&mut cursor) {
        if pair.kind() != "pair" {
            continue;
        }
        let Some(key_node) = pair.child_by_field_name("key") else {
            continue;
        };
        let Some(value) = pair.child_by_field_name("value") else {
            continue;
        };
        let key = string_content(key_node, source).unwrap_or_else(|| node_text(key_node, source).to_owned());

        match key.as_str() {
            "selector" => {
                if let Some(s) = string_content(value, source) {
                    entity.props.insert(PropKey::Selector, PropValue::Str(s));
                }
            }
            "providedIn" => {
                let s = string_content(value, source)
                    .unwrap_or_else(|| node_text(value, source).to_owned());
                entity.props.insert(PropKey::ProvidedIn, PropValue::Str(s));
            }
            "name" => {
                // Pipe name — keep it addressable for template lookups.
                if let Some(s) = string_content(value, source) {
                    entity.props.insert(PropKey::Alias, PropValue::Str(s));
                }
            }
            "templateUrl" => {
                if let Some(spec) = string_content(value, source) {
                    pending.push(PendingEdge {
                        source: entity.id,
                        kind: RelationKind::UsesTemplate,
                        target: PendingTarget::Asset {
                            role: AssetRole::Template,
                            spec,
                        },
                        scope: scope.clone(),
                        line: start_line(pair),
                    });
                }
            }
            "styleUrl" | "styleUrls" => {
                for spec in string_list(value, source) {
                    pending.push(PendingEdge {
                        source: entity.id,
                        kind: RelationKind::UsesStyles,
                        target: PendingTarget::Asset {
                            role: AssetRole::Styles,
                            spec,
                        },
                        scope: scope.clone(),
                        line: start_line(pair),
                    });
                }
            }
            "template" => {
                // Inline template — stored as a property, deliberately no edge.
                entity.props.insert(
                    PropKey::Template,
                    PropValue::Str(raw_string_content(value, source)),
                );
            }
            "styles" => {
                let entries = string_list(value, source);
                let value = if entries.is_empty() {
                    PropValue::Str(raw_string_content(value, source))
                } else {
                    PropValue::StrList(entries)
                };
                entity.props.insert(PropKey::Styles, value);
            }
            _ => {}
        }
    }
}

/// The unquoted content of a string literal node, or `None` for non-strings.
fn string_content(node: Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "string" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "string_fragment" {
                    return Some(node_text(child, source).to_owned());
                }
            }
            // Empty string literal has no fragment child.
            Some(String::new())
        }
        "template_string" => Some(
            node_text(node, source)
                .trim_matches('`')
                .to_owned(),
        ),
        _ => None,
    }
}

/// Raw text of a string-ish node with its delimiters stripped; falls back to
/// the node text for non-string expressions.
fn raw_string_content(node: Node, source: &[u8]) -> String {
    string_content(node, source).unwrap_or_else(|| node_text(node, source).to_owned())
}

/// Flatten a scalar string or an array of strings into a list.
fn string_list(node: Node, source: &[u8]) -> Vec<String> {
    match node.kind() {
        "array" => {
            let mut out = Vec::new();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if let Some(s) = string_content(child, source) {
                    out.push(s);
                }
            }
            out
        }
        _ => string_content(node, source).into_iter().collect(),
    }
}
