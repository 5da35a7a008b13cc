use std::collections::HashSet;
use std::path::Path;

use tree_sitter::Node;

use super::{decorators, end_line, node_text, parse_source, start_line, ParseOptions};
use crate::model::{
    DiagnosticKind, Entity, EntityId, EntityKind, ExportedName, FileParse, ImportBinding,
    ParseDiagnostic, PendingEdge, PendingTarget, PropKey, PropValue, RelationKind, Relationship,
    ScopeChain,
};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Extract entities and pending relationships from a TypeScript or JavaScript
/// file (pass 1).
///
/// Walks the syntax tree once with an explicit visitor that tracks the
/// lexical scope chain, so nested declarations land under the right container
/// and references carry the scope they must be resolved in. Parse errors
/// degrade: everything extracted before (and around) the error survives, and
/// an error record is appended.
pub fn extract(
    path: &Path,
    source: &[u8],
    ext: &str,
    file: Entity,
    _opts: &ParseOptions,
) -> FileParse {
    let Some(tree) = parse_source(ext, source) else {
        let mut parse = FileParse::file_only(file);
        parse.diagnostics.push(ParseDiagnostic {
            path: path.to_path_buf(),
            line: 0,
            column: 0,
            kind: DiagnosticKind::ParseError,
            message: "tree-sitter produced no tree".to_owned(),
        });
        return parse;
    };

    let mut walker = Walker::new(path, source, file);
    let root = tree.root_node();
    if root.has_error() {
        walker.record_syntax_error(root);
    }

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        walker.visit_statement(child, false, false);
    }
    walker.finish()
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum ScopeKind {
    Module,
    ClassLike,
    Function,
}

struct Scope {
    id: EntityId,
    kind: ScopeKind,
    name: String,
}

struct Walker<'a> {
    path: &'a Path,
    source: &'a [u8],
    file: Entity,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    pending: Vec<PendingEdge>,
    exports: Vec<ExportedName>,
    import_bindings: Vec<ImportBinding>,
    diagnostics: Vec<ParseDiagnostic>,
    scopes: Vec<Scope>,
    /// `export { a, b }` statements name locals that may be declared later in
    /// the file; resolved against the extracted entities in `finish`.
    deferred_exports: Vec<(String, String)>,
    /// Dedupe key for pending references: (source, kind, rendered target, line).
    seen_refs: HashSet<(EntityId, RelationKind, String, u32)>,
}

impl<'a> Walker<'a> {
    fn new(path: &'a Path, source: &'a [u8], file: Entity) -> Self {
        Self {
            path,
            source,
            file,
            entities: Vec::new(),
            relationships: Vec::new(),
            pending: Vec::new(),
            exports: Vec::new(),
            import_bindings: Vec::new(),
            diagnostics: Vec::new(),
            scopes: Vec::new(),
            deferred_exports: Vec::new(),
            seen_refs: HashSet::new(),
        }
    }

    fn finish(mut self) -> FileParse {
        // Resolve deferred `export { a as b }` statements against the names
        // declared anywhere in the file.
        let deferred = std::mem::take(&mut self.deferred_exports);
        for (local, exported_as) in deferred {
            if let Some(entity) = self
                .entities
                .iter_mut()
                .find(|e| e.qualified_name == local)
            {
                entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
                let id = entity.id;
                self.exports.push(ExportedName {
                    name: exported_as.clone(),
                    entity: id,
                });
                self.relationships.push(
                    Relationship::new(self.file.id, id, RelationKind::Exports).named(exported_as),
                );
            }
        }

        FileParse {
            file: self.file,
            entities: self.entities,
            relationships: self.relationships,
            pending: self.pending,
            exports: self.exports,
            import_bindings: self.import_bindings,
            diagnostics: self.diagnostics,
        }
    }

    // -- scope helpers ------------------------------------------------------

    fn qualified(&self, name: &str) -> String {
        if self.scopes.is_empty() {
            name.to_owned()
        } else {
            let mut q = String::new();
            for s in &self.scopes {
                q.push_str(&s.name);
                q.push('.');
            }
            q.push_str(name);
            q
        }
    }

    /// Enclosing scope chain, innermost first (resolution walks it in order).
    fn scope_chain(&self) -> ScopeChain {
        ScopeChain {
            file: self.file.id,
            chain: self.scopes.iter().rev().map(|s| s.id).collect(),
        }
    }

    /// The entity a reference edge originates from: the innermost enclosing
    /// callable, falling back to the innermost scope, then the file itself.
    fn reference_source(&self) -> EntityId {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
            .or_else(|| self.scopes.last())
            .map(|s| s.id)
            .unwrap_or(self.file.id)
    }

    /// Record a new entity with its containment edge and return its id.
    fn add_entity(&mut self, entity: Entity) -> EntityId {
        let id = entity.id;
        let (parent, kind) = self.containment_for(entity.kind);
        if let Some(kind) = kind {
            self.relationships.push(Relationship::new(parent, id, kind));
        }
        self.entities.push(entity);
        id
    }

    /// Pick the container and containment-edge kind for a new entity given
    /// the current scope. Kinds the innermost scope cannot contain fall back
    /// to the file (their qualified name still records the nesting).
    fn containment_for(&self, kind: EntityKind) -> (EntityId, Option<RelationKind>) {
        if let Some(scope) = self.scopes.last() {
            let by_scope = match scope.kind {
                ScopeKind::Function => kind.function_containment(),
                ScopeKind::ClassLike => kind.class_containment(),
                ScopeKind::Module => kind.module_containment(),
            };
            if let Some(edge) = by_scope {
                return (scope.id, Some(edge));
            }
        }
        (self.file.id, kind.file_containment())
    }

    fn mark_exported(&mut self, entity_id: EntityId, name: &str, is_default: bool) {
        self.exports.push(ExportedName {
            name: name.to_owned(),
            entity: entity_id,
        });
        self.relationships.push(
            Relationship::new(self.file.id, entity_id, RelationKind::Exports).named(name),
        );
        if is_default {
            self.exports.push(ExportedName {
                name: "default".to_owned(),
                entity: entity_id,
            });
        }
    }

    fn push_pending(&mut self, kind: RelationKind, source: EntityId, target: PendingTarget, line: u32) {
        let rendered = match &target {
            PendingTarget::Specifier(s) => s.clone(),
            PendingTarget::Name { head, tail } => {
                if tail.is_empty() {
                    head.clone()
                } else {
                    format!("{}.{}", head, tail.join("."))
                }
            }
            PendingTarget::Asset { spec, .. } => spec.clone(),
        };
        if !self.seen_refs.insert((source, kind, rendered, line)) {
            return;
        }
        self.pending.push(PendingEdge {
            source,
            kind,
            target,
            scope: self.scope_chain(),
            line,
        });
    }

    fn record_syntax_error(&mut self, root: Node) {
        let err = find_error_node(root).unwrap_or(root);
        self.diagnostics.push(ParseDiagnostic {
            path: self.path.to_path_buf(),
            line: start_line(err),
            column: err.start_position().column as u32,
            kind: DiagnosticKind::ParseError,
            message: "syntax error".to_owned(),
        });
    }

    // -- statement dispatch -------------------------------------------------

    fn visit_statement(&mut self, node: Node, exported: bool, is_default: bool) {
        match node.kind() {
            "export_statement" => self.handle_export(node),
            "import_statement" => self.handle_import(node),
            "function_declaration" | "function_signature" => {
                self.handle_function(node, EntityKind::Function, exported, is_default)
            }
            "generator_function_declaration" => {
                self.handle_function(node, EntityKind::GeneratorFunction, exported, is_default)
            }
            "class_declaration" | "abstract_class_declaration" => {
                self.handle_class(node, exported, is_default, &[])
            }
            "interface_declaration" => self.handle_interface(node, exported),
            "type_alias_declaration" => self.handle_type_alias(node, exported),
            "enum_declaration" => self.handle_enum(node, exported),
            "lexical_declaration" | "variable_declaration" => {
                self.handle_variables(node, exported, is_default)
            }
            "internal_module" | "module" => self.handle_namespace(node, exported),
            "ambient_declaration" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.visit_statement(child, exported, false);
                }
            }
            "statement_block" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.visit_statement(child, false, false);
                }
            }
            _ => self.scan_expressions(node),
        }
    }

    // -- imports / exports --------------------------------------------------

    fn handle_import(&mut self, node: Node) {
        let Some(specifier) = import_source(node, self.source) else {
            return;
        };
        let import_id = self.new_import_entity(&specifier, node);

        // Bindings introduced by the import clause.
        let mut locals = Vec::new();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() != "import_clause" {
                continue;
            }
            let mut clause_cursor = child.walk();
            for part in child.children(&mut clause_cursor) {
                match part.kind() {
                    "identifier" => {
                        // Default import: `import Foo from './x'`
                        let local = node_text(part, self.source).to_owned();
                        locals.push(format!("{local}=default"));
                        self.import_bindings.push(ImportBinding {
                            local,
                            original: Some("default".to_owned()),
                            import_entity: import_id,
                        });
                    }
                    "named_imports" => {
                        let mut spec_cursor = part.walk();
                        for spec in part.children(&mut spec_cursor) {
                            if spec.kind() != "import_specifier" {
                                continue;
                            }
                            let Some(name_node) = spec.child_by_field_name("name") else {
                                continue;
                            };
                            let original = node_text(name_node, self.source).to_owned();
                            let local = spec
                                .child_by_field_name("alias")
                                .map(|a| node_text(a, self.source).to_owned())
                                .unwrap_or_else(|| original.clone());
                            locals.push(format!("{local}={original}"));
                            self.import_bindings.push(ImportBinding {
                                local,
                                original: Some(original),
                                import_entity: import_id,
                            });
                        }
                    }
                    "namespace_import" => {
                        let mut ns_cursor = part.walk();
                        for ns in part.children(&mut ns_cursor) {
                            if ns.kind() == "identifier" {
                                let local = node_text(ns, self.source).to_owned();
                                locals.push(local.clone());
                                self.import_bindings.push(ImportBinding {
                                    local,
                                    original: None,
                                    import_entity: import_id,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if !locals.is_empty()
            && let Some(entity) = self.entities.iter_mut().find(|e| e.id == import_id)
        {
            entity.props.insert(PropKey::Alias, PropValue::StrList(locals));
        }
    }

    /// Create the Import entity for `specifier` plus its containment edge and
    /// the pending `Imports` edge carrying the textual specifier.
    fn new_import_entity(&mut self, specifier: &str, node: Node) -> EntityId {
        let entity = Entity::new(
            EntityKind::Import,
            specifier,
            format!("import:{specifier}"),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        )
        .with_prop(PropKey::Specifier, PropValue::Str(specifier.to_owned()));
        let id = self.add_entity(entity);
        self.push_pending(
            RelationKind::Imports,
            id,
            PendingTarget::Specifier(specifier.to_owned()),
            start_line(node),
        );
        id
    }

    fn handle_export(&mut self, node: Node) {
        let is_default = (0..node.child_count())
            .any(|i| node.child(i as u32).is_some_and(|c| c.kind() == "default"));

        // Re-exports carry a source module: `export { X } from './m'`,
        // `export * from './m'`. They behave like imports whose bindings are
        // only visible to other files.
        if let Some(source_node) = node.child_by_field_name("source") {
            let specifier = string_fragment(source_node, self.source);
            let import_id = self.new_import_entity(&specifier, node);
            let mut reexported = Vec::new();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() != "export_clause" {
                    continue;
                }
                let mut spec_cursor = child.walk();
                for spec in child.children(&mut spec_cursor) {
                    if spec.kind() != "export_specifier" {
                        continue;
                    }
                    let Some(name_node) = spec.child_by_field_name("name") else {
                        continue;
                    };
                    let original = node_text(name_node, self.source).to_owned();
                    let exported_as = spec
                        .child_by_field_name("alias")
                        .map(|a| node_text(a, self.source).to_owned())
                        .unwrap_or_else(|| original.clone());
                    self.exports.push(ExportedName {
                        name: exported_as,
                        entity: import_id,
                    });
                    // Resolution follows the re-export through the import
                    // entity; remember what the target module calls it.
                    reexported.push(format!("{original}={original}"));
                    self.import_bindings.push(ImportBinding {
                        local: original.clone(),
                        original: Some(original),
                        import_entity: import_id,
                    });
                }
            }
            if !reexported.is_empty()
                && let Some(entity) = self.entities.iter_mut().find(|e| e.id == import_id)
            {
                entity
                    .props
                    .insert(PropKey::Alias, PropValue::StrList(reexported));
            }
            return;
        }

        if let Some(decl) = node.child_by_field_name("declaration") {
            // Decorators on an exported class hang off the export statement,
            // not the class declaration itself.
            if matches!(decl.kind(), "class_declaration" | "abstract_class_declaration") {
                let mut decorator_nodes = Vec::new();
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "decorator" {
                        decorator_nodes.push(child);
                    }
                }
                self.handle_class(decl, true, is_default, &decorator_nodes);
            } else {
                self.visit_statement(decl, true, is_default);
            }
            return;
        }

        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "export_clause" => {
                    let mut spec_cursor = child.walk();
                    for spec in child.children(&mut spec_cursor) {
                        if spec.kind() != "export_specifier" {
                            continue;
                        }
                        let Some(name_node) = spec.child_by_field_name("name") else {
                            continue;
                        };
                        let local = node_text(name_node, self.source).to_owned();
                        let exported_as = spec
                            .child_by_field_name("alias")
                            .map(|a| node_text(a, self.source).to_owned())
                            .unwrap_or_else(|| local.clone());
                        self.deferred_exports.push((local, exported_as));
                    }
                }
                "identifier" if is_default => {
                    // `export default foo;`
                    let local = node_text(child, self.source).to_owned();
                    self.deferred_exports.push((local, "default".to_owned()));
                }
                _ => self.visit_statement(child, true, is_default),
            }
        }
    }

    // -- declarations -------------------------------------------------------

    fn handle_function(
        &mut self,
        node: Node,
        kind: EntityKind,
        exported: bool,
        is_default: bool,
    ) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            kind,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        entity
            .props
            .insert(PropKey::Complexity, PropValue::Int(complexity(node)));
        if has_keyword_child(node, "async") {
            entity.props.insert(PropKey::IsAsync, PropValue::Bool(true));
        }
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, is_default);
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::Function,
                name,
            });
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                self.visit_statement(child, false, false);
            }
            self.scopes.pop();
        }
        self.scan_signature_types(node);
    }

    fn handle_class(
        &mut self,
        node: Node,
        exported: bool,
        is_default: bool,
        extra_decorators: &[Node],
    ) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::Class,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }

        let mut decorator_nodes: Vec<Node> = extra_decorators.to_vec();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "decorator" {
                decorator_nodes.push(child);
            }
        }

        // Framework-decorator step: rekind in place, lift metadata, queue
        // template/style pending edges. Runs before containment so the edge
        // kind matches the final entity kind.
        let scope = self.scope_chain();
        let decorator_pending = decorators::apply(&mut entity, &decorator_nodes, self.source, &scope);
        for edge in decorator_pending {
            self.push_pending(edge.kind, edge.source, edge.target, edge.line);
        }

        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, is_default);
        }

        // Heritage clauses → pending Inherits / Implements, resolved in the
        // scope surrounding the class.
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() != "class_heritage" {
                continue;
            }
            let mut heritage_cursor = child.walk();
            for clause in child.children(&mut heritage_cursor) {
                match clause.kind() {
                    "extends_clause" => {
                        if let Some(value) = clause.child_by_field_name("value")
                            && let Some(path) = dotted_path(value, self.source)
                        {
                            let (head, tail) = split_path(path);
                            self.push_pending(
                                RelationKind::Inherits,
                                id,
                                PendingTarget::Name { head, tail },
                                start_line(clause),
                            );
                        }
                    }
                    "implements_clause" => {
                        let mut impl_cursor = clause.walk();
                        for ty in clause.named_children(&mut impl_cursor) {
                            if let Some(name) = type_head(ty, self.source) {
                                self.push_pending(
                                    RelationKind::Implements,
                                    id,
                                    PendingTarget::Name {
                                        head: name,
                                        tail: Vec::new(),
                                    },
                                    start_line(clause),
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::ClassLike,
                name,
            });
            self.visit_class_body(body);
            self.scopes.pop();
        }
    }

    fn visit_class_body(&mut self, body: Node) {
        let mut cursor = body.walk();
        for member in body.named_children(&mut cursor) {
            match member.kind() {
                "method_definition" | "abstract_method_signature" | "method_signature" => {
                    self.handle_method(member)
                }
                "public_field_definition" | "property_signature" => self.handle_field(member),
                _ => {}
            }
        }
    }

    fn handle_method(&mut self, node: Node) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        if name_node.kind() == "computed_property_name" {
            return;
        }
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::Method,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        entity
            .props
            .insert(PropKey::Complexity, PropValue::Int(complexity(node)));
        if has_keyword_child(node, "async") {
            entity.props.insert(PropKey::IsAsync, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::Function,
                name,
            });
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                self.visit_statement(child, false, false);
            }
            self.scopes.pop();
        }
        self.scan_signature_types(node);
    }

    fn handle_field(&mut self, node: Node) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        if name_node.kind() == "computed_property_name" {
            return;
        }
        let name = node_text(name_node, self.source).to_owned();

        // A field holding a function value is a callable member, not data.
        let value = node.child_by_field_name("value");
        let is_function_value = value
            .map(|v| matches!(v.kind(), "arrow_function" | "function_expression" | "function"))
            .unwrap_or(false);

        if is_function_value {
            let value = value.unwrap();
            let mut entity = Entity::new(
                EntityKind::Method,
                name.clone(),
                self.qualified(&name),
                self.path.to_path_buf(),
                start_line(node),
                end_line(node),
            );
            entity
                .props
                .insert(PropKey::Complexity, PropValue::Int(complexity(value)));
            if has_keyword_child(value, "async") {
                entity.props.insert(PropKey::IsAsync, PropValue::Bool(true));
            }
            let id = self.add_entity(entity);
            if let Some(body) = value.child_by_field_name("body") {
                self.scopes.push(Scope {
                    id,
                    kind: ScopeKind::Function,
                    name,
                });
                self.visit_statement(body, false, false);
                self.scopes.pop();
            }
        } else {
            let entity = Entity::new(
                EntityKind::Variable,
                name.clone(),
                self.qualified(&name),
                self.path.to_path_buf(),
                start_line(node),
                end_line(node),
            );
            self.add_entity(entity);
            self.scan_signature_types(node);
            if let Some(v) = value {
                self.scan_expressions(v);
            }
        }
    }

    fn handle_interface(&mut self, node: Node, exported: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::Interface,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, false);
        }

        // `interface IFoo extends IBar` uses extends_type_clause in the TS
        // grammar (extends_clause is for classes only).
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "extends_type_clause" {
                let mut type_cursor = child.walk();
                for ty in child.named_children(&mut type_cursor) {
                    if let Some(parent) = type_head(ty, self.source) {
                        self.push_pending(
                            RelationKind::Extends,
                            id,
                            PendingTarget::Name {
                                head: parent,
                                tail: Vec::new(),
                            },
                            start_line(child),
                        );
                    }
                }
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::ClassLike,
                name,
            });
            self.visit_class_body(body);
            self.scopes.pop();
        }
    }

    fn handle_type_alias(&mut self, node: Node, exported: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::TypeAlias,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, false);
        }
        if let Some(value) = node.child_by_field_name("value") {
            self.collect_type_refs(value, id);
        }
    }

    fn handle_enum(&mut self, node: Node, exported: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::Enum,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, false);
        }
    }

    fn handle_variables(&mut self, node: Node, exported: bool, is_default: bool) {
        let mut cursor = node.walk();
        for declarator in node.named_children(&mut cursor) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let Some(name_node) = declarator.child_by_field_name("name") else {
                continue;
            };
            let value = declarator.child_by_field_name("value");

            match name_node.kind() {
                "identifier" => {
                    let name = node_text(name_node, self.source).to_owned();
                    let kind = match value.map(|v| v.kind()) {
                        Some("arrow_function") => EntityKind::ArrowFunction,
                        Some("function_expression") | Some("function") => EntityKind::Function,
                        Some("generator_function") => EntityKind::GeneratorFunction,
                        _ => EntityKind::Variable,
                    };
                    let mut entity = Entity::new(
                        kind,
                        name.clone(),
                        self.qualified(&name),
                        self.path.to_path_buf(),
                        start_line(declarator),
                        end_line(declarator),
                    );
                    if exported {
                        entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
                    }
                    if kind.is_callable() {
                        let value = value.unwrap();
                        entity
                            .props
                            .insert(PropKey::Complexity, PropValue::Int(complexity(value)));
                        if has_keyword_child(value, "async") {
                            entity.props.insert(PropKey::IsAsync, PropValue::Bool(true));
                        }
                    }
                    let id = self.add_entity(entity);
                    if exported {
                        self.mark_exported(id, &name, is_default);
                    }

                    if kind.is_callable() {
                        let value = value.unwrap();
                        if let Some(body) = value.child_by_field_name("body") {
                            self.scopes.push(Scope {
                                id,
                                kind: ScopeKind::Function,
                                name,
                            });
                            self.visit_statement(body, false, false);
                            self.scopes.pop();
                        }
                    } else if let Some(v) = value {
                        self.scan_expressions(v);
                    }
                    self.scan_signature_types(declarator);
                }
                "object_pattern" | "array_pattern" => {
                    // Destructuring: one Variable entity per bound name.
                    let mut names = Vec::new();
                    collect_pattern_names(name_node, self.source, &mut names);
                    for name in names {
                        let mut entity = Entity::new(
                            EntityKind::Variable,
                            name.clone(),
                            self.qualified(&name),
                            self.path.to_path_buf(),
                            start_line(declarator),
                            end_line(declarator),
                        );
                        if exported {
                            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
                        }
                        let id = self.add_entity(entity);
                        if exported {
                            self.mark_exported(id, &name, false);
                        }
                    }
                    if let Some(v) = value {
                        self.scan_expressions(v);
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_namespace(&mut self, node: Node, exported: bool) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let mut entity = Entity::new(
            EntityKind::Module,
            name.clone(),
            self.qualified(&name),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        );
        if exported {
            entity.props.insert(PropKey::IsExported, PropValue::Bool(true));
        }
        let id = self.add_entity(entity);
        if exported {
            self.mark_exported(id, &name, false);
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::Module,
                name,
            });
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                self.visit_statement(child, false, false);
            }
            self.scopes.pop();
        }
    }

    // -- references ---------------------------------------------------------

    /// Scan an expression subtree for calls, member accesses and type
    /// references. Declarations are not handled here — bodies reach this
    /// only through `visit_statement`'s default arm.
    fn scan_expressions(&mut self, node: Node) {
        match node.kind() {
            "call_expression" => {
                if let Some(function) = node.child_by_field_name("function") {
                    if let Some(path) = dotted_path(function, self.source) {
                        let (head, tail) = split_path(path);
                        self.push_pending(
                            RelationKind::Calls,
                            self.reference_source(),
                            PendingTarget::Name { head, tail },
                            start_line(node),
                        );
                    } else if function.kind() == "call_expression" {
                        // Chained call — the receiver call still counts.
                        self.scan_expressions(function);
                    }
                }
                if let Some(args) = node.child_by_field_name("arguments") {
                    self.scan_expressions(args);
                }
            }
            "new_expression" => {
                if let Some(ctor) = node.child_by_field_name("constructor")
                    && let Some(path) = dotted_path(ctor, self.source)
                {
                    let (head, tail) = split_path(path);
                    self.push_pending(
                        RelationKind::Calls,
                        self.reference_source(),
                        PendingTarget::Name { head, tail },
                        start_line(node),
                    );
                }
                if let Some(args) = node.child_by_field_name("arguments") {
                    self.scan_expressions(args);
                }
            }
            "member_expression" => {
                // A standalone member access (call receivers never reach
                // here — handle above does not recurse into them).
                if let Some(path) = dotted_path(node, self.source)
                    && path.len() > 1
                {
                    let (head, tail) = split_path(path);
                    self.push_pending(
                        RelationKind::Accesses,
                        self.reference_source(),
                        PendingTarget::Name { head, tail },
                        start_line(node),
                    );
                }
            }
            "type_annotation" | "type_arguments" => {
                self.collect_type_refs(node, self.reference_source());
            }
            _ => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.scan_expressions(child);
                }
            }
        }
    }

    /// Type annotations on parameters, return types and fields.
    fn scan_signature_types(&mut self, node: Node) {
        let source_id = self.reference_source();
        if let Some(params) = node.child_by_field_name("parameters") {
            self.collect_type_refs(params, source_id);
        }
        if let Some(ret) = node.child_by_field_name("return_type") {
            self.collect_type_refs(ret, source_id);
        }
        if let Some(ty) = node.child_by_field_name("type") {
            self.collect_type_refs(ty, source_id);
        }
    }

    /// Emit a pending `Uses` edge for every type identifier in a type subtree.
    fn collect_type_refs(&mut self, node: Node, source_id: EntityId) {
        if node.kind() == "type_identifier" {
            let name = node_text(node, self.source).to_owned();
            self.push_pending(
                RelationKind::Uses,
                source_id,
                PendingTarget::Name {
                    head: name,
                    tail: Vec::new(),
                },
                start_line(node),
            );
            return;
        }
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            self.collect_type_refs(child, source_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Node helpers
// ---------------------------------------------------------------------------

/// The raw specifier of an import statement (`'./x'` with quotes stripped).
fn import_source(node: Node, source: &[u8]) -> Option<String> {
    let source_node = node.child_by_field_name("source").or_else(|| {
        let mut cursor = node.walk();
        node.children(&mut cursor).find(|c| c.kind() == "string")
    })?;
    Some(string_fragment(source_node, source))
}

fn string_fragment(node: Node, source: &[u8]) -> String {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "string_fragment" {
            return node_text(child, source).to_owned();
        }
    }
    node_text(node, source).trim_matches(['"', '\'']).to_owned()
}

/// True when the node has a bare keyword child of the given kind (`async`,
/// `default`, ...).
fn has_keyword_child(node: Node, keyword: &str) -> bool {
    (0..node.child_count()).any(|i| node.child(i as u32).is_some_and(|c| c.kind() == keyword))
}

/// Reduce a callee/heritage expression to a dotted path. Chained call
/// receivers (`a().b`) are not reducible and return `None`.
fn dotted_path(node: Node, source: &[u8]) -> Option<Vec<String>> {
    match node.kind() {
        "identifier" | "type_identifier" => Some(vec![node_text(node, source).to_owned()]),
        "this" => Some(vec!["this".to_owned()]),
        "member_expression" => {
            let object = node.child_by_field_name("object")?;
            let property = node.child_by_field_name("property")?;
            let mut path = dotted_path(object, source)?;
            path.push(node_text(property, source).to_owned());
            Some(path)
        }
        "non_null_expression" | "parenthesized_expression" => {
            let mut cursor = node.walk();
            let inner = node.named_children(&mut cursor).next()?;
            dotted_path(inner, source)
        }
        _ => None,
    }
}

fn split_path(mut path: Vec<String>) -> (String, Vec<String>) {
    let head = path.remove(0);
    (head, path)
}

/// The head identifier of a heritage type (`Base` in `Base<T>`).
fn type_head(node: Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "type_identifier" | "identifier" => Some(node_text(node, source).to_owned()),
        "generic_type" => {
            let name = node.child_by_field_name("name")?;
            Some(node_text(name, source).to_owned())
        }
        "nested_type_identifier" | "member_expression" => Some(
            node_text(node, source)
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_owned(),
        ),
        _ => None,
    }
}

/// Flatten a destructuring pattern into its bound identifier names.
fn collect_pattern_names(node: Node, source: &[u8], out: &mut Vec<String>) {
    match node.kind() {
        "shorthand_property_identifier_pattern" | "identifier" => {
            out.push(node_text(node, source).to_owned());
        }
        "pair_pattern" => {
            if let Some(value) = node.child_by_field_name("value") {
                collect_pattern_names(value, source, out);
            }
        }
        "rest_pattern" | "object_pattern" | "array_pattern" | "assignment_pattern" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_pattern_names(child, source, out);
            }
        }
        _ => {}
    }
}

/// Cyclomatic-style complexity: one plus the number of decision points.
fn complexity(node: Node) -> i64 {
    fn count(node: Node) -> i64 {
        let mut n = match node.kind() {
            "if_statement" | "for_statement" | "for_in_statement" | "while_statement"
            | "do_statement" | "switch_case" | "catch_clause" | "ternary_expression" => 1,
            "binary_expression" => {
                let op = node
                    .child_by_field_name("operator")
                    .map(|o| o.kind())
                    .unwrap_or("");
                if matches!(op, "&&" | "||" | "??") { 1 } else { 0 }
            }
            _ => 0,
        };
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            n += count(child);
        }
        n
    }
    1 + count(node)
}

fn find_error_node(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = find_error_node(child) {
            return Some(found);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::file_entity;
    use std::path::PathBuf;

    fn extract_ts(source: &str) -> FileParse {
        let path = PathBuf::from("/project/src/test.ts");
        let file = file_entity(&path, source.lines().count() as u32, "typescript");
        extract(&path, source.as_bytes(), "ts", file, &ParseOptions::default())
    }

    fn entity<'a>(parse: &'a FileParse, name: &str) -> &'a Entity {
        parse
            .entities
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("expected entity '{name}'"))
    }

    #[test]
    fn test_exported_function() {
        let parse = extract_ts("export function hello() {}");
        let sym = entity(&parse, "hello");
        assert_eq!(sym.kind, EntityKind::Function);
        assert_eq!(sym.props.get(&PropKey::IsExported), Some(&PropValue::Bool(true)));
        assert!(parse.exports.iter().any(|e| e.name == "hello"));
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FileContainsFunction && r.target == sym.id));
    }

    #[test]
    fn test_generator_and_async() {
        let parse = extract_ts("function* gen() {}\nasync function load() {}");
        assert_eq!(entity(&parse, "gen").kind, EntityKind::GeneratorFunction);
        let load = entity(&parse, "load");
        assert_eq!(load.props.get(&PropKey::IsAsync), Some(&PropValue::Bool(true)));
    }

    #[test]
    fn test_class_with_methods_and_fields() {
        let parse = extract_ts("class Dog {\n  name: string = 'rex';\n  bark() {}\n}");
        let class = entity(&parse, "Dog");
        assert_eq!(class.kind, EntityKind::Class);
        let bark = entity(&parse, "bark");
        assert_eq!(bark.kind, EntityKind::Method);
        assert_eq!(bark.qualified_name, "Dog.bark");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ClassContainsFunction
                && r.source == class.id
                && r.target == bark.id));
        let field = entity(&parse, "name");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ClassContainsVariable && r.target == field.id));
    }

    #[test]
    fn test_arrow_function_const() {
        let parse = extract_ts("export const greet = () => {};");
        let sym = entity(&parse, "greet");
        assert_eq!(sym.kind, EntityKind::ArrowFunction);
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FileContainsArrowFunction && r.target == sym.id));
    }

    #[test]
    fn test_destructuring_flattens_to_one_variable_per_name() {
        let parse = extract_ts("const { a, b: renamed } = source();");
        assert_eq!(entity(&parse, "a").kind, EntityKind::Variable);
        assert_eq!(entity(&parse, "renamed").kind, EntityKind::Variable);
    }

    #[test]
    fn test_import_bindings() {
        let parse = extract_ts("import { Base as B, Other } from './base';\nimport * as ns from './ns';");
        let imports: Vec<_> = parse
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Import)
            .collect();
        assert_eq!(imports.len(), 2);
        let b = parse
            .import_bindings
            .iter()
            .find(|b| b.local == "B")
            .expect("binding for B");
        assert_eq!(b.original.as_deref(), Some("Base"));
        let ns = parse
            .import_bindings
            .iter()
            .find(|b| b.local == "ns")
            .expect("binding for ns");
        assert!(ns.original.is_none(), "namespace import binds the whole module");
        // Each import carries a pending Imports edge with the raw specifier.
        let specs: Vec<_> = parse
            .pending
            .iter()
            .filter_map(|p| match &p.target {
                PendingTarget::Specifier(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert!(specs.contains(&"./base") && specs.contains(&"./ns"));
    }

    #[test]
    fn test_inheritance_pending_edges() {
        let parse = extract_ts(
            "class Child extends Base implements IThing {}\ninterface IFoo extends IBar {}",
        );
        let child = entity(&parse, "Child");
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Inherits
            && p.source == child.id
            && matches!(&p.target, PendingTarget::Name { head, .. } if head == "Base")));
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Implements
            && matches!(&p.target, PendingTarget::Name { head, .. } if head == "IThing")));
        let ifoo = entity(&parse, "IFoo");
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Extends
            && p.source == ifoo.id
            && matches!(&p.target, PendingTarget::Name { head, .. } if head == "IBar")));
    }

    #[test]
    fn test_calls_carry_dotted_path() {
        let parse = extract_ts("function f() { svc.users.load(); g(); }");
        let f = entity(&parse, "f");
        let call_targets: Vec<_> = parse
            .pending
            .iter()
            .filter(|p| p.kind == RelationKind::Calls && p.source == f.id)
            .collect();
        assert_eq!(call_targets.len(), 2);
        assert!(call_targets.iter().any(|p| matches!(
            &p.target,
            PendingTarget::Name { head, tail } if head == "svc" && tail == &["users", "load"]
        )));
        assert!(call_targets.iter().any(|p| matches!(
            &p.target,
            PendingTarget::Name { head, tail } if head == "g" && tail.is_empty()
        )));
    }

    #[test]
    fn test_component_rekind_with_template_urls() {
        let src = r#"
import { Component } from '@angular/core';

@Component({
  selector: 'app-x',
  templateUrl: './x.component.html',
  styleUrls: ['./x.component.scss'],
})
export class XComponent {}
"#;
        let parse = extract_ts(src);
        let comp = entity(&parse, "XComponent");
        assert_eq!(comp.kind, EntityKind::Component, "class must be rekinded, not duplicated");
        assert_eq!(
            comp.props.get(&PropKey::Selector),
            Some(&PropValue::Str("app-x".to_owned()))
        );
        // No plain Class shadow.
        assert!(!parse.entities.iter().any(|e| e.kind == EntityKind::Class));
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::UsesTemplate
            && matches!(&p.target, PendingTarget::Asset { spec, .. } if spec == "./x.component.html")));
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::UsesStyles
            && matches!(&p.target, PendingTarget::Asset { spec, .. } if spec == "./x.component.scss")));
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FileContainsComponent && r.target == comp.id));
    }

    #[test]
    fn test_inline_template_stores_property_without_edge() {
        let src = "@Component({ template: '<div></div>' })\nclass Inline {}";
        let parse = extract_ts(src);
        let comp = entity(&parse, "Inline");
        assert_eq!(comp.kind, EntityKind::Component);
        assert!(comp.props.contains_key(&PropKey::Template));
        assert!(!parse.pending.iter().any(|p| p.kind == RelationKind::UsesTemplate));
    }

    #[test]
    fn test_rekind_preserves_identity_of_class_tuple() {
        // The identity is computed from the Class tuple before rekinding, so
        // adding or removing the decorator's metadata keys never re-identifies
        // the entity — only the decorator's presence does (through line shifts).
        let a = extract_ts("@Component({ selector: 's' })\nclass C {}");
        let b = extract_ts("@Component({ selector: 's' })\nclass C {}");
        assert_eq!(entity(&a, "C").id, entity(&b, "C").id);
    }

    #[test]
    fn test_namespace_module_containment() {
        let parse = extract_ts("namespace Util {\n  export function helper() {}\n  export const N = 1;\n}");
        let module = entity(&parse, "Util");
        assert_eq!(module.kind, EntityKind::Module);
        let helper = entity(&parse, "helper");
        assert_eq!(helper.qualified_name, "Util.helper");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ModuleContainsFunction
                && r.source == module.id
                && r.target == helper.id));
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ModuleContainsVariable && r.target == entity(&parse, "N").id));
    }

    #[test]
    fn test_reexport_registers_export_through_import_entity() {
        let parse = extract_ts("export { Widget } from './widget';");
        let import = parse
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::Import)
            .expect("re-export produces an import entity");
        assert!(parse
            .exports
            .iter()
            .any(|e| e.name == "Widget" && e.entity == import.id));
    }

    #[test]
    fn test_nested_function_containment() {
        let parse = extract_ts("function outer() { function inner() {} const x = 1; }");
        let outer = entity(&parse, "outer");
        let inner = entity(&parse, "inner");
        assert_eq!(inner.qualified_name, "outer.inner");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FunctionContainsFunction
                && r.source == outer.id
                && r.target == inner.id));
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FunctionContainsVariable
                && r.target == entity(&parse, "x").id));
    }

    #[test]
    fn test_syntax_error_keeps_prefix_entities() {
        let parse = extract_ts("export function ok() {}\nclass {{{");
        assert!(parse.entities.iter().any(|e| e.name == "ok"));
        assert!(parse
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::ParseError));
    }

    #[test]
    fn test_complexity_counts_decision_points() {
        let parse = extract_ts(
            "function branchy(a: number) { if (a > 0) { return 1; } for (;;) { break; } return a ? 2 : 3; }",
        );
        let f = entity(&parse, "branchy");
        let PropValue::Int(c) = f.props.get(&PropKey::Complexity).unwrap() else {
            panic!("complexity must be an int");
        };
        assert_eq!(*c, 4, "if + for + ternary + 1");
    }
}
