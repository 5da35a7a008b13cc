use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tree_sitter::Node;

use super::{end_line, node_text, parse_source, start_line, ParseOptions};
use crate::model::{
    DiagnosticKind, Entity, EntityId, EntityKind, ExportedName, FileParse, ImportBinding,
    ParseDiagnostic, PendingEdge, PendingTarget, PropKey, PropValue, RelationKind, Relationship,
    ScopeChain,
};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Extract entities and pending relationships from a Python file (pass 1).
///
/// Python emits an implicit Module entity per file carrying the dotted module
/// path derived from the configured source roots. Declarations attach to the
/// File; references originating in module-level code attribute to the Module.
/// Name resolution scope is recorded inside-out: enclosing function chain,
/// then class, then file.
pub fn extract(path: &Path, source: &[u8], file: Entity, opts: &ParseOptions) -> FileParse {
    let Some(tree) = parse_source("py", source) else {
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

    let root = tree.root_node();
    let mut walker = PyWalker::new(path, source, file, opts);
    if root.has_error() {
        walker.record_syntax_error(root);
    }

    walker.add_module_entity(root);

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        walker.visit_statement(child);
    }
    walker.finish()
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum ScopeKind {
    ClassLike,
    Function,
}

struct Scope {
    id: EntityId,
    kind: ScopeKind,
    name: String,
}

struct PyWalker<'a> {
    path: &'a Path,
    source: &'a [u8],
    file: Entity,
    opts: &'a ParseOptions,
    module_id: Option<EntityId>,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    pending: Vec<PendingEdge>,
    exports: Vec<ExportedName>,
    import_bindings: Vec<ImportBinding>,
    diagnostics: Vec<ParseDiagnostic>,
    scopes: Vec<Scope>,
    seen_refs: HashSet<(EntityId, RelationKind, String, u32)>,
}

impl<'a> PyWalker<'a> {
    fn new(path: &'a Path, source: &'a [u8], file: Entity, opts: &'a ParseOptions) -> Self {
        Self {
            path,
            source,
            file,
            opts,
            module_id: None,
            entities: Vec::new(),
            relationships: Vec::new(),
            pending: Vec::new(),
            exports: Vec::new(),
            import_bindings: Vec::new(),
            diagnostics: Vec::new(),
            scopes: Vec::new(),
            seen_refs: HashSet::new(),
        }
    }

    fn finish(self) -> FileParse {
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

    /// The implicit module: one per file, named by its dotted path from the
    /// nearest source root (`pkg/util.py` → `pkg.util`, `pkg/__init__.py` →
    /// `pkg`). Falls back to the file stem outside every root.
    fn add_module_entity(&mut self, root: Node) {
        let name = module_dotted_name(self.path, &self.opts.source_roots);
        let mut entity = Entity::new(
            EntityKind::Module,
            name.clone(),
            name,
            self.path.to_path_buf(),
            start_line(root),
            end_line(root),
        );
        if self.opts.capture_docstrings
            && let Some(doc) = block_docstring(root, self.source)
        {
            entity.props.insert(PropKey::Docstring, PropValue::Str(doc));
        }
        let id = entity.id;
        self.relationships.push(Relationship::new(
            self.file.id,
            id,
            RelationKind::FileContainsModule,
        ));
        self.entities.push(entity);
        self.module_id = Some(id);
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

    fn scope_chain(&self) -> ScopeChain {
        ScopeChain {
            file: self.file.id,
            chain: self.scopes.iter().rev().map(|s| s.id).collect(),
        }
    }

    /// References in module-level code originate from the Module entity.
    fn reference_source(&self) -> EntityId {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
            .map(|s| s.id)
            .or(self.module_id)
            .unwrap_or(self.file.id)
    }

    fn add_entity(&mut self, entity: Entity) -> EntityId {
        let id = entity.id;
        let name = entity.name.clone();
        let (parent, kind) = self.containment_for(entity.kind);
        if let Some(kind) = kind {
            self.relationships.push(Relationship::new(parent, id, kind));
        }
        // Every top-level name is addressable as a module attribute.
        if self.scopes.is_empty() {
            self.exports.push(ExportedName { name, entity: id });
        }
        self.entities.push(entity);
        id
    }

    fn containment_for(&self, kind: EntityKind) -> (EntityId, Option<RelationKind>) {
        if let Some(scope) = self.scopes.last() {
            let by_scope = match scope.kind {
                ScopeKind::Function => kind.function_containment(),
                ScopeKind::ClassLike => kind.class_containment(),
            };
            if let Some(edge) = by_scope {
                return (scope.id, Some(edge));
            }
        }
        (self.file.id, kind.file_containment())
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

    fn visit_statement(&mut self, node: Node) {
        match node.kind() {
            "import_statement" => self.handle_import(node),
            "import_from_statement" => self.handle_import_from(node),
            "future_import_statement" => {}
            "function_definition" => self.handle_function(node, &[]),
            "class_definition" => self.handle_class(node, &[]),
            "decorated_definition" => self.handle_decorated(node),
            "expression_statement" => self.handle_expression_statement(node),
            // Conditional module-level definitions (`if TYPE_CHECKING:`,
            // try/except import fallbacks) still declare names.
            "if_statement" | "try_statement" | "with_statement" | "for_statement"
            | "while_statement" => {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    match child.kind() {
                        "block" | "else_clause" | "elif_clause" | "except_clause"
                        | "finally_clause" => self.visit_block(child),
                        _ => self.scan_expressions(child),
                    }
                }
            }
            _ => self.scan_expressions(node),
        }
    }

    fn visit_block(&mut self, node: Node) {
        if node.kind() == "block" {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                self.visit_statement(child);
            }
            return;
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "block" {
                self.visit_block(child);
            }
        }
    }

    // -- imports ------------------------------------------------------------

    /// `import a`, `import a.b as c`, `import a, b`: one Import entity per
    /// imported module, each with a pending Imports edge carrying the dotted
    /// specifier.
    fn handle_import(&mut self, node: Node) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "dotted_name" => {
                    let specifier = node_text(child, self.source).to_owned();
                    let local = specifier.split('.').next().unwrap_or(&specifier).to_owned();
                    self.new_import_entity(&specifier, local, None, node);
                }
                "aliased_import" => {
                    let Some(name_node) = child.child_by_field_name("name") else {
                        continue;
                    };
                    let specifier = node_text(name_node, self.source).to_owned();
                    let local = child
                        .child_by_field_name("alias")
                        .map(|a| node_text(a, self.source).to_owned())
                        .unwrap_or_else(|| specifier.clone());
                    self.new_import_entity(&specifier, local, None, node);
                }
                _ => {}
            }
        }
    }

    /// `from M import a as b, c` / `from . import x` / `from M import *`:
    /// one Import entity for the statement's module, bindings per name.
    fn handle_import_from(&mut self, node: Node) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let specifier = node_text(module_node, self.source).to_owned();

        let entity_id = self.import_entity_for(&specifier, node);
        let before = self.import_bindings.len();

        let mut cursor = node.walk();
        let mut saw_module_name = false;
        for child in node.named_children(&mut cursor) {
            // The first dotted_name/relative_import is the module itself.
            if !saw_module_name && child.id() == module_node.id() {
                saw_module_name = true;
                continue;
            }
            match child.kind() {
                "dotted_name" => {
                    let original = node_text(child, self.source).to_owned();
                    self.bind_import(entity_id, original.clone(), Some(original));
                }
                "aliased_import" => {
                    let Some(name_node) = child.child_by_field_name("name") else {
                        continue;
                    };
                    let original = node_text(name_node, self.source).to_owned();
                    let local = child
                        .child_by_field_name("alias")
                        .map(|a| node_text(a, self.source).to_owned())
                        .unwrap_or_else(|| original.clone());
                    self.bind_import(entity_id, local, Some(original));
                }
                "wildcard_import" => {}
                _ => {}
            }
        }
        self.store_alias_prop(entity_id, before);
    }

    /// Persist bindings added since `from_index` onto the Import entity's
    /// `alias` property as `local=original` pairs, so registry seeding from
    /// the store can rebuild them without re-parsing.
    fn store_alias_prop(&mut self, entity_id: EntityId, from_index: usize) {
        let encoded: Vec<String> = self.import_bindings[from_index..]
            .iter()
            .filter(|b| b.import_entity == entity_id)
            .map(|b| match &b.original {
                Some(original) => format!("{}={}", b.local, original),
                None => b.local.clone(),
            })
            .collect();
        if encoded.is_empty() {
            return;
        }
        if let Some(entity) = self.entities.iter_mut().find(|e| e.id == entity_id) {
            entity.props.insert(PropKey::Alias, PropValue::StrList(encoded));
        }
    }

    fn import_entity_for(&mut self, specifier: &str, node: Node) -> EntityId {
        let entity = Entity::new(
            EntityKind::Import,
            specifier,
            format!("import:{specifier}"),
            self.path.to_path_buf(),
            start_line(node),
            end_line(node),
        )
        .with_prop(PropKey::Specifier, PropValue::Str(specifier.to_owned()));
        let id = entity.id;
        self.relationships.push(Relationship::new(
            self.file.id,
            id,
            RelationKind::FileContainsImport,
        ));
        self.entities.push(entity);
        self.push_pending(
            RelationKind::Imports,
            id,
            PendingTarget::Specifier(specifier.to_owned()),
            start_line(node),
        );
        id
    }

    fn new_import_entity(&mut self, specifier: &str, local: String, original: Option<String>, node: Node) {
        let id = self.import_entity_for(specifier, node);
        let before = self.import_bindings.len();
        self.bind_import(id, local, original);
        self.store_alias_prop(id, before);
    }

    fn bind_import(&mut self, import_entity: EntityId, local: String, original: Option<String>) {
        // Imported names become module attributes too (`from b import f`
        // makes `a.f` addressable through `import a`).
        self.exports.push(ExportedName {
            name: local.clone(),
            entity: import_entity,
        });
        self.import_bindings.push(ImportBinding {
            local,
            original,
            import_entity,
        });
    }

    // -- declarations -------------------------------------------------------

    fn handle_decorated(&mut self, node: Node) {
        let mut decorator_nodes = Vec::new();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "decorator" {
                decorator_nodes.push(child);
            }
        }
        if let Some(definition) = node.child_by_field_name("definition") {
            match definition.kind() {
                "function_definition" => self.handle_function(definition, &decorator_nodes),
                "class_definition" => self.handle_class(definition, &decorator_nodes),
                _ => {}
            }
        }
    }

    fn handle_function(&mut self, node: Node, decorator_nodes: &[Node]) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = node_text(name_node, self.source).to_owned();
        let in_class = self
            .scopes
            .last()
            .map(|s| s.kind == ScopeKind::ClassLike)
            .unwrap_or(false);
        let kind = if in_class {
            EntityKind::Method
        } else {
            EntityKind::Function
        };

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
        if self.opts.capture_docstrings
            && let Some(body) = node.child_by_field_name("body")
            && let Some(doc) = block_docstring(body, self.source)
        {
            entity.props.insert(PropKey::Docstring, PropValue::Str(doc));
        }
        self.attach_decorators(&mut entity, decorator_nodes);
        let id = self.add_entity(entity);
        self.emit_decorates(id, decorator_nodes);

        self.scan_parameter_types(node, id);

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::Function,
                name,
            });
            self.visit_block(body);
            self.scopes.pop();
        }
    }

    fn handle_class(&mut self, node: Node, decorator_nodes: &[Node]) {
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
        if self.opts.capture_docstrings
            && let Some(body) = node.child_by_field_name("body")
            && let Some(doc) = block_docstring(body, self.source)
        {
            entity.props.insert(PropKey::Docstring, PropValue::Str(doc));
        }
        self.attach_decorators(&mut entity, decorator_nodes);
        let id = self.add_entity(entity);
        self.emit_decorates(id, decorator_nodes);

        // Superclasses: `class C(Base, pkg.Mixin)` — inheritance targets
        // resolve by the same lexical rule as calls.
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            let mut cursor = superclasses.walk();
            for arg in superclasses.named_children(&mut cursor) {
                if arg.kind() == "keyword_argument" {
                    continue;
                }
                if let Some(path) = dotted_path(arg, self.source) {
                    let (head, tail) = split_path(path);
                    self.push_pending(
                        RelationKind::Inherits,
                        id,
                        PendingTarget::Name { head, tail },
                        start_line(arg),
                    );
                }
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                id,
                kind: ScopeKind::ClassLike,
                name,
            });
            self.visit_block(body);
            self.scopes.pop();
        }
    }

    /// Assignments produce Variable entities at module scope and in class
    /// bodies; function-local assignments only contribute references.
    fn handle_expression_statement(&mut self, node: Node) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() != "assignment" && child.kind() != "augmented_assignment" {
                self.scan_expressions(child);
                continue;
            }
            let extract_variables = child.kind() == "assignment"
                && self
                    .scopes
                    .last()
                    .map(|s| s.kind == ScopeKind::ClassLike)
                    .unwrap_or(true);
            if extract_variables
                && let Some(left) = child.child_by_field_name("left")
            {
                let mut names = Vec::new();
                collect_target_names(left, self.source, &mut names);
                for name in names {
                    let entity = Entity::new(
                        EntityKind::Variable,
                        name.clone(),
                        self.qualified(&name),
                        self.path.to_path_buf(),
                        start_line(child),
                        end_line(child),
                    );
                    self.add_entity(entity);
                }
            }
            if let Some(ty) = child.child_by_field_name("type") {
                self.collect_type_refs(ty, self.reference_source());
            }
            if let Some(right) = child.child_by_field_name("right") {
                self.scan_expressions(right);
            }
        }
    }

    fn attach_decorators(&mut self, entity: &mut Entity, decorator_nodes: &[Node]) {
        if decorator_nodes.is_empty() {
            return;
        }
        let names: Vec<String> = decorator_nodes
            .iter()
            .filter_map(|d| decorator_name(*d, self.source))
            .collect();
        if !names.is_empty() {
            entity
                .props
                .insert(PropKey::Decorators, PropValue::StrList(names));
        }
    }

    fn emit_decorates(&mut self, target: EntityId, decorator_nodes: &[Node]) {
        for decorator in decorator_nodes {
            if let Some(path) = decorator_dotted_path(*decorator, self.source) {
                let (head, tail) = split_path(path);
                self.push_pending(
                    RelationKind::Decorates,
                    target,
                    PendingTarget::Name { head, tail },
                    start_line(*decorator),
                );
            }
        }
    }

    // -- references ---------------------------------------------------------

    fn scan_expressions(&mut self, node: Node) {
        match node.kind() {
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    if let Some(path) = dotted_path(function, self.source) {
                        let (head, tail) = split_path(path);
                        self.push_pending(
                            RelationKind::Calls,
                            self.reference_source(),
                            PendingTarget::Name { head, tail },
                            start_line(node),
                        );
                    } else if function.kind() == "call" {
                        self.scan_expressions(function);
                    }
                }
                if let Some(args) = node.child_by_field_name("arguments") {
                    self.scan_expressions(args);
                }
            }
            "attribute" => {
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
            _ => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.scan_expressions(child);
                }
            }
        }
    }

    fn scan_parameter_types(&mut self, node: Node, source_id: EntityId) {
        if let Some(params) = node.child_by_field_name("parameters") {
            let mut cursor = params.walk();
            for param in params.named_children(&mut cursor) {
                if let Some(ty) = param.child_by_field_name("type") {
                    self.collect_type_refs(ty, source_id);
                }
            }
        }
        if let Some(ret) = node.child_by_field_name("return_type") {
            self.collect_type_refs(ret, source_id);
        }
    }

    fn collect_type_refs(&mut self, node: Node, source_id: EntityId) {
        match node.kind() {
            "identifier" => {
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
            }
            "attribute" => {
                if let Some(path) = dotted_path(node, self.source) {
                    let (head, tail) = split_path(path);
                    self.push_pending(
                        RelationKind::Uses,
                        source_id,
                        PendingTarget::Name { head, tail },
                        start_line(node),
                    );
                }
            }
            _ => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.collect_type_refs(child, source_id);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node helpers
// ---------------------------------------------------------------------------

/// Dotted module name for a file relative to the nearest source root.
fn module_dotted_name(path: &Path, source_roots: &[PathBuf]) -> String {
    let stripped = source_roots
        .iter()
        .filter_map(|root| path.strip_prefix(root).ok())
        .min_by_key(|rel| rel.components().count());

    let rel: PathBuf = match stripped {
        Some(rel) => rel.to_path_buf(),
        None => PathBuf::from(path.file_name().unwrap_or_default()),
    };

    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let Some(last) = parts.last_mut() {
        *last = last.trim_end_matches(".py").to_owned();
    }
    if parts.last().map(String::as_str) == Some("__init__") {
        parts.pop();
    }
    if parts.is_empty() {
        return path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    parts.join(".")
}

/// The docstring of a block: a leading expression statement holding a string.
fn block_docstring(block: Node, source: &[u8]) -> Option<String> {
    let mut cursor = block.walk();
    let first = block.named_children(&mut cursor).next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut inner = first.walk();
    let expr = first.named_children(&mut inner).next()?;
    if expr.kind() != "string" {
        return None;
    }
    let raw = node_text(expr, source);
    let trimmed = raw
        .trim_start_matches(['r', 'b', 'u', 'f', 'R', 'B', 'U', 'F'])
        .trim_matches('"')
        .trim_matches('\'');
    Some(trimmed.trim().to_owned())
}

fn has_keyword_child(node: Node, keyword: &str) -> bool {
    (0..node.child_count()).any(|i| node.child(i as u32).is_some_and(|c| c.kind() == keyword))
}

/// Reduce `a.b.c` / `self.x` to a dotted path; call receivers and subscripts
/// are not reducible.
fn dotted_path(node: Node, source: &[u8]) -> Option<Vec<String>> {
    match node.kind() {
        "identifier" => Some(vec![node_text(node, source).to_owned()]),
        "attribute" => {
            let object = node.child_by_field_name("object")?;
            let attr = node.child_by_field_name("attribute")?;
            let mut path = dotted_path(object, source)?;
            path.push(node_text(attr, source).to_owned());
            Some(path)
        }
        "parenthesized_expression" => {
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

/// Display name of a decorator: `@app.route("/x")` → `app.route`.
fn decorator_name(decorator: Node, source: &[u8]) -> Option<String> {
    decorator_dotted_path(decorator, source).map(|p| p.join("."))
}

fn decorator_dotted_path(decorator: Node, source: &[u8]) -> Option<Vec<String>> {
    let mut cursor = decorator.walk();
    for child in decorator.named_children(&mut cursor) {
        let expr = if child.kind() == "call" {
            child.child_by_field_name("function")?
        } else {
            child
        };
        if let Some(path) = dotted_path(expr, source) {
            return Some(path);
        }
    }
    None
}

/// Names bound by an assignment target (`x`, `x, y`, `(a, b)`).
fn collect_target_names(node: Node, source: &[u8], out: &mut Vec<String>) {
    match node.kind() {
        "identifier" => out.push(node_text(node, source).to_owned()),
        "pattern_list" | "tuple_pattern" | "list_pattern" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_target_names(child, source, out);
            }
        }
        _ => {}
    }
}

/// Cyclomatic-style complexity for Python bodies.
fn complexity(node: Node) -> i64 {
    fn count(node: Node) -> i64 {
        let mut n = match node.kind() {
            "if_statement" | "elif_clause" | "for_statement" | "while_statement"
            | "except_clause" | "conditional_expression" | "boolean_operator" | "case_clause" => 1,
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

    fn extract_py(source: &str) -> FileParse {
        let path = PathBuf::from("/project/src/mod.py");
        let file = file_entity(&path, source.lines().count() as u32, "python");
        let opts = ParseOptions {
            source_roots: vec![PathBuf::from("/project/src")],
            ..ParseOptions::default()
        };
        extract(&path, source.as_bytes(), file, &opts)
    }

    fn entity<'a>(parse: &'a FileParse, name: &str) -> &'a Entity {
        parse
            .entities
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("expected entity '{name}'"))
    }

    #[test]
    fn test_module_entity_per_file() {
        let parse = extract_py("x = 1\n");
        let module = parse
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::Module)
            .expect("implicit module entity");
        assert_eq!(module.name, "mod");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FileContainsModule && r.target == module.id));
    }

    #[test]
    fn test_init_file_names_the_package() {
        let path = PathBuf::from("/project/src/pkg/__init__.py");
        assert_eq!(
            module_dotted_name(&path, &[PathBuf::from("/project/src")]),
            "pkg"
        );
        let nested = PathBuf::from("/project/src/pkg/util.py");
        assert_eq!(
            module_dotted_name(&nested, &[PathBuf::from("/project/src")]),
            "pkg.util"
        );
    }

    #[test]
    fn test_function_and_call() {
        let parse = extract_py("def f():\n    g()\n");
        let f = entity(&parse, "f");
        assert_eq!(f.kind, EntityKind::Function);
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FileContainsFunction && r.target == f.id));
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Calls
            && p.source == f.id
            && matches!(&p.target, PendingTarget::Name { head, tail } if head == "g" && tail.is_empty())));
    }

    #[test]
    fn test_class_with_methods_and_inheritance() {
        let src = "class Child(Base):\n    rate = 2\n    def run(self):\n        self.step()\n";
        let parse = extract_py(src);
        let class = entity(&parse, "Child");
        assert_eq!(class.kind, EntityKind::Class);
        let run = entity(&parse, "run");
        assert_eq!(run.kind, EntityKind::Method);
        assert_eq!(run.qualified_name, "Child.run");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ClassContainsFunction && r.target == run.id));
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::ClassContainsVariable
                && r.target == entity(&parse, "rate").id));
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Inherits
            && p.source == class.id
            && matches!(&p.target, PendingTarget::Name { head, .. } if head == "Base")));
        // self.step() resolves through the class scope at pass 2.
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Calls
            && p.source == run.id
            && matches!(&p.target, PendingTarget::Name { head, tail } if head == "self" && tail == &["step"])));
    }

    #[test]
    fn test_async_function_flag() {
        let parse = extract_py("async def fetch():\n    pass\n");
        let f = entity(&parse, "fetch");
        assert_eq!(f.props.get(&PropKey::IsAsync), Some(&PropValue::Bool(true)));
    }

    #[test]
    fn test_import_forms() {
        let src = "import numpy as np\nfrom collections import OrderedDict as OD\nfrom . import helper\n";
        let parse = extract_py(src);
        let imports: Vec<_> = parse
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Import)
            .collect();
        assert_eq!(imports.len(), 3);

        let np = parse
            .import_bindings
            .iter()
            .find(|b| b.local == "np")
            .expect("np binding");
        assert!(np.original.is_none(), "plain import binds the module itself");
        let od = parse
            .import_bindings
            .iter()
            .find(|b| b.local == "OD")
            .expect("OD binding");
        assert_eq!(od.original.as_deref(), Some("OrderedDict"));

        let specs: Vec<_> = parse
            .pending
            .iter()
            .filter_map(|p| match &p.target {
                PendingTarget::Specifier(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert!(specs.contains(&"numpy"));
        assert!(specs.contains(&"collections"));
        assert!(specs.contains(&"."));
    }

    #[test]
    fn test_top_level_names_are_module_attributes() {
        let parse = extract_py("LIMIT = 10\ndef f():\n    pass\n");
        let names: Vec<_> = parse.exports.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"LIMIT"));
        assert!(names.contains(&"f"));
    }

    #[test]
    fn test_function_locals_are_not_entities() {
        let parse = extract_py("def f():\n    local = 1\n    return local\n");
        assert!(!parse.entities.iter().any(|e| e.name == "local"));
    }

    #[test]
    fn test_docstring_capture() {
        let src = "\"\"\"Module doc.\"\"\"\n\ndef f():\n    \"\"\"Does f things.\"\"\"\n    pass\n";
        let parse = extract_py(src);
        let module = parse
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::Module)
            .unwrap();
        assert_eq!(
            module.props.get(&PropKey::Docstring),
            Some(&PropValue::Str("Module doc.".to_owned()))
        );
        let f = entity(&parse, "f");
        assert_eq!(
            f.props.get(&PropKey::Docstring),
            Some(&PropValue::Str("Does f things.".to_owned()))
        );
    }

    #[test]
    fn test_decorated_class_records_decorator_names() {
        let src = "@register\nclass Plugin:\n    pass\n";
        let parse = extract_py(src);
        let class = entity(&parse, "Plugin");
        assert_eq!(
            class.props.get(&PropKey::Decorators),
            Some(&PropValue::StrList(vec!["register".to_owned()]))
        );
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Decorates
            && p.source == class.id
            && matches!(&p.target, PendingTarget::Name { head, .. } if head == "register")));
    }

    #[test]
    fn test_qualified_call_records_access_path() {
        let parse = extract_py("def load():\n    return np.array([1])\n");
        let load = entity(&parse, "load");
        assert!(parse.pending.iter().any(|p| p.kind == RelationKind::Calls
            && p.source == load.id
            && matches!(&p.target, PendingTarget::Name { head, tail } if head == "np" && tail == &["array"])));
    }

    #[test]
    fn test_nested_function() {
        let parse = extract_py("def outer():\n    def inner():\n        pass\n");
        let inner = entity(&parse, "inner");
        assert_eq!(inner.qualified_name, "outer.inner");
        assert!(parse
            .relationships
            .iter()
            .any(|r| r.kind == RelationKind::FunctionContainsFunction && r.target == inner.id));
    }

    #[test]
    fn test_syntax_error_preserves_prefix() {
        let parse = extract_py("def ok():\n    pass\n\ndef broken(:\n");
        assert!(parse.entities.iter().any(|e| e.name == "ok"));
        assert!(parse
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::ParseError));
    }

    #[test]
    fn test_conditional_imports_are_extracted() {
        let src = "try:\n    import fast_json as json\nexcept ImportError:\n    import json\n";
        let parse = extract_py(src);
        let imports = parse
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Import)
            .count();
        assert_eq!(imports, 2);
    }
}
