pub mod identity;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use identity::{EntityId, entity_identity, external_identity, sanitize_external_name};

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// The closed set of entity kinds tracked in the graph.
///
/// `Component`, `Service`, `Directive`, `Pipe` and `NgModule` are classes
/// rekinded by the framework-decorator step — the class entity is replaced,
/// never duplicated. `External` stands in for symbols referenced but not
/// declared inside the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    File,
    Module,
    Class,
    Interface,
    TypeAlias,
    Enum,
    Function,
    Method,
    ArrowFunction,
    GeneratorFunction,
    Variable,
    Import,
    Component,
    Service,
    Directive,
    Pipe,
    NgModule,
    External,
}

/// Every entity kind, in schema-declaration order.
pub const ALL_ENTITY_KINDS: &[EntityKind] = &[
    EntityKind::File,
    EntityKind::Module,
    EntityKind::Class,
    EntityKind::Interface,
    EntityKind::TypeAlias,
    EntityKind::Enum,
    EntityKind::Function,
    EntityKind::Method,
    EntityKind::ArrowFunction,
    EntityKind::GeneratorFunction,
    EntityKind::Variable,
    EntityKind::Import,
    EntityKind::Component,
    EntityKind::Service,
    EntityKind::Directive,
    EntityKind::Pipe,
    EntityKind::NgModule,
    EntityKind::External,
];

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "File",
            Self::Module => "Module",
            Self::Class => "Class",
            Self::Interface => "Interface",
            Self::TypeAlias => "TypeAlias",
            Self::Enum => "Enum",
            Self::Function => "Function",
            Self::Method => "Method",
            Self::ArrowFunction => "ArrowFunction",
            Self::GeneratorFunction => "GeneratorFunction",
            Self::Variable => "Variable",
            Self::Import => "Import",
            Self::Component => "Component",
            Self::Service => "Service",
            Self::Directive => "Directive",
            Self::Pipe => "Pipe",
            Self::NgModule => "NgModule",
            Self::External => "External",
        }
    }

    /// True for callable entities — the legal sources of `Calls` edges.
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Function | Self::Method | Self::ArrowFunction | Self::GeneratorFunction
        )
    }

    /// True for class-like entities (including the decorator-derived kinds,
    /// which remain classes structurally).
    pub fn is_class_like(&self) -> bool {
        matches!(
            self,
            Self::Class
                | Self::Component
                | Self::Service
                | Self::Directive
                | Self::Pipe
                | Self::NgModule
        )
    }

    /// The containment edge kind for an entity of this kind owned directly by
    /// a file, or `None` when the kind never hangs off a file (`Method` lives
    /// under a class; `File` and `External` have no container).
    pub fn file_containment(&self) -> Option<RelationKind> {
        match self {
            Self::Module => Some(RelationKind::FileContainsModule),
            Self::Class => Some(RelationKind::FileContainsClass),
            Self::Function => Some(RelationKind::FileContainsFunction),
            Self::Variable => Some(RelationKind::FileContainsVariable),
            Self::Import => Some(RelationKind::FileContainsImport),
            Self::Component => Some(RelationKind::FileContainsComponent),
            Self::Service => Some(RelationKind::FileContainsService),
            Self::Directive => Some(RelationKind::FileContainsDirective),
            Self::Pipe => Some(RelationKind::FileContainsPipe),
            Self::NgModule => Some(RelationKind::FileContainsNgModule),
            Self::Interface => Some(RelationKind::FileContainsInterface),
            Self::TypeAlias => Some(RelationKind::FileContainsTypeAlias),
            Self::Enum => Some(RelationKind::FileContainsEnum),
            Self::ArrowFunction => Some(RelationKind::FileContainsArrowFunction),
            Self::GeneratorFunction => Some(RelationKind::FileContainsGeneratorFunction),
            Self::File | Self::Method | Self::External => None,
        }
    }

    /// The containment edge kind for an entity of this kind owned by an
    /// explicit module (TS namespace).
    pub fn module_containment(&self) -> Option<RelationKind> {
        match self {
            k if k.is_class_like() => Some(RelationKind::ModuleContainsClass),
            k if k.is_callable() => Some(RelationKind::ModuleContainsFunction),
            Self::Variable => Some(RelationKind::ModuleContainsVariable),
            _ => None,
        }
    }

    /// The containment edge kind for an entity owned by a class-like entity.
    pub fn class_containment(&self) -> Option<RelationKind> {
        match self {
            k if k.is_callable() => Some(RelationKind::ClassContainsFunction),
            Self::Variable => Some(RelationKind::ClassContainsVariable),
            _ => None,
        }
    }

    /// The containment edge kind for an entity owned by a function.
    pub fn function_containment(&self) -> Option<RelationKind> {
        match self {
            k if k.is_callable() => Some(RelationKind::FunctionContainsFunction),
            Self::Variable => Some(RelationKind::FunctionContainsVariable),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Relationship kinds
// ---------------------------------------------------------------------------

/// The closed set of relationship kinds. These names are user-visible in the
/// query surface and in the persisted relationship tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationKind {
    // File containment
    FileContainsModule,
    FileContainsClass,
    FileContainsFunction,
    FileContainsVariable,
    FileContainsImport,
    FileContainsComponent,
    FileContainsService,
    FileContainsDirective,
    FileContainsPipe,
    FileContainsNgModule,
    FileContainsInterface,
    FileContainsTypeAlias,
    FileContainsEnum,
    FileContainsArrowFunction,
    FileContainsGeneratorFunction,
    // Nested scoping
    ModuleContainsClass,
    ModuleContainsFunction,
    ModuleContainsVariable,
    ClassContainsFunction,
    ClassContainsVariable,
    FunctionContainsFunction,
    FunctionContainsVariable,
    // References
    Calls,
    Inherits,
    Implements,
    Imports,
    Uses,
    Accesses,
    Decorates,
    Extends,
    Exports,
    UsesTemplate,
    UsesStyles,
}

/// Every relationship kind, in schema-declaration order.
pub const ALL_RELATION_KINDS: &[RelationKind] = &[
    RelationKind::FileContainsModule,
    RelationKind::FileContainsClass,
    RelationKind::FileContainsFunction,
    RelationKind::FileContainsVariable,
    RelationKind::FileContainsImport,
    RelationKind::FileContainsComponent,
    RelationKind::FileContainsService,
    RelationKind::FileContainsDirective,
    RelationKind::FileContainsPipe,
    RelationKind::FileContainsNgModule,
    RelationKind::FileContainsInterface,
    RelationKind::FileContainsTypeAlias,
    RelationKind::FileContainsEnum,
    RelationKind::FileContainsArrowFunction,
    RelationKind::FileContainsGeneratorFunction,
    RelationKind::ModuleContainsClass,
    RelationKind::ModuleContainsFunction,
    RelationKind::ModuleContainsVariable,
    RelationKind::ClassContainsFunction,
    RelationKind::ClassContainsVariable,
    RelationKind::FunctionContainsFunction,
    RelationKind::FunctionContainsVariable,
    RelationKind::Calls,
    RelationKind::Inherits,
    RelationKind::Implements,
    RelationKind::Imports,
    RelationKind::Uses,
    RelationKind::Accesses,
    RelationKind::Decorates,
    RelationKind::Extends,
    RelationKind::Exports,
    RelationKind::UsesTemplate,
    RelationKind::UsesStyles,
];

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileContainsModule => "FileContainsModule",
            Self::FileContainsClass => "FileContainsClass",
            Self::FileContainsFunction => "FileContainsFunction",
            Self::FileContainsVariable => "FileContainsVariable",
            Self::FileContainsImport => "FileContainsImport",
            Self::FileContainsComponent => "FileContainsComponent",
            Self::FileContainsService => "FileContainsService",
            Self::FileContainsDirective => "FileContainsDirective",
            Self::FileContainsPipe => "FileContainsPipe",
            Self::FileContainsNgModule => "FileContainsNgModule",
            Self::FileContainsInterface => "FileContainsInterface",
            Self::FileContainsTypeAlias => "FileContainsTypeAlias",
            Self::FileContainsEnum => "FileContainsEnum",
            Self::FileContainsArrowFunction => "FileContainsArrowFunction",
            Self::FileContainsGeneratorFunction => "FileContainsGeneratorFunction",
            Self::ModuleContainsClass => "ModuleContainsClass",
            Self::ModuleContainsFunction => "ModuleContainsFunction",
            Self::ModuleContainsVariable => "ModuleContainsVariable",
            Self::ClassContainsFunction => "ClassContainsFunction",
            Self::ClassContainsVariable => "ClassContainsVariable",
            Self::FunctionContainsFunction => "FunctionContainsFunction",
            Self::FunctionContainsVariable => "FunctionContainsVariable",
            Self::Calls => "Calls",
            Self::Inherits => "Inherits",
            Self::Implements => "Implements",
            Self::Imports => "Imports",
            Self::Uses => "Uses",
            Self::Accesses => "Accesses",
            Self::Decorates => "Decorates",
            Self::Extends => "Extends",
            Self::Exports => "Exports",
            Self::UsesTemplate => "UsesTemplate",
            Self::UsesStyles => "UsesStyles",
        }
    }

    /// True for the strictly hierarchical containment kinds. The containment
    /// subgraph must form a forest rooted at File entities.
    pub fn is_containment(&self) -> bool {
        matches!(
            self,
            Self::FileContainsModule
                | Self::FileContainsClass
                | Self::FileContainsFunction
                | Self::FileContainsVariable
                | Self::FileContainsImport
                | Self::FileContainsComponent
                | Self::FileContainsService
                | Self::FileContainsDirective
                | Self::FileContainsPipe
                | Self::FileContainsNgModule
                | Self::FileContainsInterface
                | Self::FileContainsTypeAlias
                | Self::FileContainsEnum
                | Self::FileContainsArrowFunction
                | Self::FileContainsGeneratorFunction
                | Self::ModuleContainsClass
                | Self::ModuleContainsFunction
                | Self::ModuleContainsVariable
                | Self::ClassContainsFunction
                | Self::ClassContainsVariable
                | Self::FunctionContainsFunction
                | Self::FunctionContainsVariable
        )
    }
}

// ---------------------------------------------------------------------------
// Property bags
// ---------------------------------------------------------------------------

/// The closed set of property keys an entity or relationship may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropKey {
    Docstring,
    IsAsync,
    IsExported,
    IsDefault,
    Complexity,
    Selector,
    ProvidedIn,
    Template,
    Styles,
    Decorators,
    Selectors,
    Language,
    Specifier,
    Alias,
    AccessPath,
    Line,
}

impl PropKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docstring => "docstring",
            Self::IsAsync => "is_async",
            Self::IsExported => "is_exported",
            Self::IsDefault => "is_default",
            Self::Complexity => "complexity",
            Self::Selector => "selector",
            Self::ProvidedIn => "provided_in",
            Self::Template => "template",
            Self::Styles => "styles",
            Self::Decorators => "decorators",
            Self::Selectors => "selectors",
            Self::Language => "language",
            Self::Specifier => "specifier",
            Self::Alias => "alias",
            Self::AccessPath => "access_path",
            Self::Line => "line",
        }
    }
}

/// A property value — the small scalar/list vocabulary the store understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
}

impl PropValue {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Int(n) => serde_json::Value::from(*n),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::StrList(v) => serde_json::Value::from(v.clone()),
        }
    }
}

pub type PropertyBag = BTreeMap<PropKey, PropValue>;

// ---------------------------------------------------------------------------
// Entities and relationships
// ---------------------------------------------------------------------------

/// Inclusive 1-based line range of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan {
    pub start: u32,
    pub end: u32,
}

/// A declared source construct tracked as a node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Display name (simple, unqualified).
    pub name: String,
    /// Dotted name from enclosing scopes, e.g. `Outer.method`.
    pub qualified_name: String,
    /// Absolute path of the owning file. Empty for External placeholders.
    pub path: PathBuf,
    pub span: LineSpan,
    pub props: PropertyBag,
}

impl Entity {
    /// Build an entity, deriving its identity from the identity tuple.
    pub fn new(
        kind: EntityKind,
        name: impl Into<String>,
        qualified_name: impl Into<String>,
        path: PathBuf,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        let name = name.into();
        let qualified_name = qualified_name.into();
        let id = entity_identity(kind, &path, &qualified_name, start_line, end_line);
        Self {
            id,
            kind,
            name,
            qualified_name,
            path,
            span: LineSpan {
                start: start_line,
                end: end_line,
            },
            props: PropertyBag::new(),
        }
    }

    /// Build the interned External placeholder for a (possibly raw) name.
    pub fn external(raw_name: &str) -> Self {
        let canonical = sanitize_external_name(raw_name);
        let id = external_identity(&canonical);
        Self {
            id,
            kind: EntityKind::External,
            name: canonical.clone(),
            qualified_name: canonical,
            path: PathBuf::new(),
            span: LineSpan { start: 0, end: 0 },
            props: PropertyBag::new(),
        }
    }

    pub fn with_prop(mut self, key: PropKey, value: PropValue) -> Self {
        self.props.insert(key, value);
        self
    }
}

/// A directed, kinded, property-carrying edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityId,
    pub target: EntityId,
    pub kind: RelationKind,
    /// Display name of the target at emission time. Used when a missing
    /// endpoint must be demoted to an External interned by name.
    pub target_name: Option<String>,
    pub props: PropertyBag,
}

impl Relationship {
    pub fn new(source: EntityId, target: EntityId, kind: RelationKind) -> Self {
        Self {
            source,
            target,
            kind,
            target_name: None,
            props: PropertyBag::new(),
        }
    }

    pub fn named(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = Some(target_name.into());
        self
    }

    pub fn with_prop(mut self, key: PropKey, value: PropValue) -> Self {
        self.props.insert(key, value);
        self
    }
}

// ---------------------------------------------------------------------------
// Pending edges (pass 1 → pass 2 handoff)
// ---------------------------------------------------------------------------

/// Which side-file role a framework asset reference plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetRole {
    Template,
    Styles,
}

/// The textual target of a pending edge, awaiting pass-2 resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingTarget {
    /// A module specifier exactly as written in the import statement.
    Specifier(String),
    /// A (possibly dotted) name reference. `head` is resolved against the
    /// lexical chain; `tail` becomes the access path on the resolved edge.
    Name { head: String, tail: Vec<String> },
    /// A template/style path expression from decorator metadata.
    Asset { role: AssetRole, spec: String },
}

/// The lexical context a pending reference must be resolved in: the owning
/// file plus the chain of enclosing scope entities, innermost first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeChain {
    pub file: EntityId,
    pub chain: Vec<EntityId>,
}

/// An edge emitted in pass 1 whose target is still textual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEdge {
    pub source: EntityId,
    pub kind: RelationKind,
    pub target: PendingTarget,
    pub scope: ScopeChain,
    pub line: u32,
}

// ---------------------------------------------------------------------------
// Front-end output
// ---------------------------------------------------------------------------

/// The severity/category of a per-file extraction problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    ParseError,
    SkippedFile,
    EncodingError,
}

/// A reported (never thrown) problem encountered while extracting one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseDiagnostic {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// A name addressable from outside the file (module attribute, named export)
/// and the entity it denotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedName {
    pub name: String,
    pub entity: EntityId,
}

/// A local name bound by an import statement.
///
/// `original` is the name exported by the target module (`Base` in
/// `import { Base as B }`), or `None` when the binding denotes the whole
/// module (`import b`, `import * as ns`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBinding {
    pub local: String,
    pub original: Option<String>,
    pub import_entity: EntityId,
}

/// The complete pass-1 result for one source file.
#[derive(Debug, Clone)]
pub struct FileParse {
    /// The File entity itself — always present, even for failed parses.
    pub file: Entity,
    /// Declarations extracted from the file (excludes the File entity).
    pub entities: Vec<Entity>,
    /// Edges whose both endpoints were known at pass-1 time (containment,
    /// Exports, Decorates-within-file).
    pub relationships: Vec<Relationship>,
    /// Edges awaiting pass-2 resolution.
    pub pending: Vec<PendingEdge>,
    /// Names the registry should index as addressable from other files.
    pub exports: Vec<ExportedName>,
    /// Local names bound by this file's import statements.
    pub import_bindings: Vec<ImportBinding>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl FileParse {
    /// An empty parse carrying only the File entity (over-cap or unreadable
    /// files still materialize so links to them can resolve).
    pub fn file_only(file: Entity) -> Self {
        Self {
            file,
            entities: Vec::new(),
            relationships: Vec::new(),
            pending: Vec::new(),
            exports: Vec::new(),
            import_bindings: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_relation_kind_names_match_vocabulary() {
        assert_eq!(RelationKind::FileContainsFunction.as_str(), "FileContainsFunction");
        assert_eq!(RelationKind::UsesTemplate.as_str(), "UsesTemplate");
        assert_eq!(RelationKind::Inherits.as_str(), "Inherits");
        // Every kind renders a unique non-empty name.
        let mut seen = std::collections::HashSet::new();
        for kind in ALL_RELATION_KINDS {
            assert!(seen.insert(kind.as_str()), "duplicate name {}", kind.as_str());
        }
        assert_eq!(seen.len(), ALL_RELATION_KINDS.len());
    }

    #[test]
    fn test_file_containment_covers_spec_kinds() {
        // Method and External deliberately have no file containment.
        assert!(EntityKind::Method.file_containment().is_none());
        assert!(EntityKind::External.file_containment().is_none());
        assert_eq!(
            EntityKind::Component.file_containment(),
            Some(RelationKind::FileContainsComponent)
        );
        assert_eq!(
            EntityKind::GeneratorFunction.file_containment(),
            Some(RelationKind::FileContainsGeneratorFunction)
        );
    }

    #[test]
    fn test_entity_new_derives_identity_from_tuple() {
        let a = Entity::new(EntityKind::Class, "C", "C", PathBuf::from("/p/x.ts"), 1, 5);
        let b = Entity::new(EntityKind::Class, "C", "C", PathBuf::from("/p/x.ts"), 1, 5);
        assert_eq!(a.id, b.id);
        let c = Entity::new(EntityKind::Class, "C", "C", PathBuf::from("/p/x.ts"), 2, 5);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_external_entity_interns_by_name() {
        let a = Entity::external("numpy");
        let b = Entity::external("numpy");
        assert_eq!(a.id, b.id);
        assert_eq!(a.kind, EntityKind::External);
        assert_eq!(a.name, "numpy");
    }

    #[test]
    fn test_containment_classifier() {
        assert!(RelationKind::ClassContainsFunction.is_containment());
        assert!(!RelationKind::Calls.is_containment());
        assert!(!RelationKind::Exports.is_containment());
        let count = ALL_RELATION_KINDS.iter().filter(|k| k.is_containment()).count();
        assert_eq!(count, 22, "15 file + 3 module + 2 class + 2 function kinds");
    }
}
