use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::model::Entity;

use super::backend::{GraphBackend, StoreError};

// ---------------------------------------------------------------------------
// Read-only validation
// ---------------------------------------------------------------------------

static WRITE_VERB_RE: OnceLock<Regex> = OnceLock::new();

fn write_verb_re() -> &'static Regex {
    WRITE_VERB_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(CREATE|MERGE|DELETE|DETACH|SET|REMOVE|DROP)\b").expect("valid regex")
    })
}

/// Reject queries containing write verbs before anything is dispatched.
/// Rows are matched structurally afterwards — string parameters are bound,
/// never concatenated into the query text.
pub fn validate_read_only(text: &str) -> Result<(), StoreError> {
    if let Some(found) = write_verb_re().find(text) {
        return Err(StoreError::QueryValidation(format!(
            "write verb '{}' is not allowed in read queries",
            found.as_str().to_uppercase()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Query model
// ---------------------------------------------------------------------------

/// A parsed read query: a single node pattern or a single relationship hop,
/// with property filters, projections and a limit. This is the conservative
/// subset the embedded engine evaluates; an external Cypher engine behind
/// the backend seam accepts the full dialect.
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub source: NodePattern,
    pub hop: Option<Hop>,
    pub conditions: Vec<Condition>,
    pub returns: Vec<ReturnItem>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NodePattern {
    pub var: String,
    pub label: Option<String>,
    /// Inline `{prop: value}` equality filters.
    pub props: Vec<(String, ValueExpr)>,
}

#[derive(Debug, Clone)]
pub struct Hop {
    pub rel_var: Option<String>,
    pub rel_kind: Option<String>,
    pub target: NodePattern,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub var: String,
    pub prop: String,
    pub op: CompareOp,
    pub value: ValueExpr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Contains,
}

#[derive(Debug, Clone)]
pub enum ValueExpr {
    Literal(JsonValue),
    Param(String),
}

#[derive(Debug, Clone)]
pub enum ReturnItem {
    Var { var: String, alias: String },
    Prop { var: String, prop: String, alias: String },
    Count { var: String, alias: String },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Param(String),
    Symbol(char),
    Arrow,
}

fn tokenize(text: &str) -> Result<Vec<Token>, StoreError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ':' | ',' | '.' | '=' => {
                chars.next();
                tokens.push(Token::Symbol(c));
            }
            '-' => {
                chars.next();
                tokens.push(Token::Symbol('-'));
            }
            '>' => {
                chars.next();
                tokens.push(Token::Arrow);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Symbol('!'));
                } else {
                    return Err(StoreError::Unsupported(
                        "left-pointing relationships are not supported".to_owned(),
                    ));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(StoreError::QueryValidation(
                                "unterminated string literal".to_owned(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                chars.next();
                let mut name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Param(name));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| StoreError::QueryValidation(format!("bad number '{num}'")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(StoreError::Unsupported(format!(
                    "unexpected character '{other}' in query"
                )))
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), StoreError> {
        match self.next() {
            Some(Token::Symbol(s)) if s == symbol => Ok(()),
            other => Err(StoreError::QueryValidation(format!(
                "expected '{symbol}', found {other:?}"
            ))),
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(ident)) = self.peek()
            && ident.eq_ignore_ascii_case(word)
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn ident(&mut self) -> Result<String, StoreError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(StoreError::QueryValidation(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    fn value(&mut self) -> Result<ValueExpr, StoreError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(ValueExpr::Literal(JsonValue::String(s))),
            Some(Token::Num(n)) => Ok(ValueExpr::Literal(serde_json::json!(n))),
            Some(Token::Param(p)) => Ok(ValueExpr::Param(p)),
            Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case("true") => {
                Ok(ValueExpr::Literal(JsonValue::Bool(true)))
            }
            Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case("false") => {
                Ok(ValueExpr::Literal(JsonValue::Bool(false)))
            }
            other => Err(StoreError::QueryValidation(format!(
                "expected value, found {other:?}"
            ))),
        }
    }

    fn node_pattern(&mut self) -> Result<NodePattern, StoreError> {
        self.expect_symbol('(')?;
        let var = match self.peek() {
            Some(Token::Ident(_)) => self.ident()?,
            _ => String::new(),
        };
        let label = if matches!(self.peek(), Some(Token::Symbol(':'))) {
            self.next();
            Some(self.ident()?)
        } else {
            None
        };
        let mut props = Vec::new();
        if matches!(self.peek(), Some(Token::Symbol('{'))) {
            self.next();
            loop {
                let key = self.ident()?;
                self.expect_symbol(':')?;
                let value = self.value()?;
                props.push((key, value));
                match self.next() {
                    Some(Token::Symbol(',')) => continue,
                    Some(Token::Symbol('}')) => break,
                    other => {
                        return Err(StoreError::QueryValidation(format!(
                            "expected ',' or '}}' in property map, found {other:?}"
                        )))
                    }
                }
            }
        }
        self.expect_symbol(')')?;
        Ok(NodePattern { var, label, props })
    }
}

/// Parse a read query. Constructs beyond the supported subset are reported
/// as `Unsupported` with the offending token — never silently ignored.
pub fn parse(text: &str) -> Result<ReadQuery, StoreError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };

    if !parser.keyword("MATCH") {
        return Err(StoreError::QueryValidation(
            "read queries must start with MATCH".to_owned(),
        ));
    }
    let source = parser.node_pattern()?;

    let hop = if matches!(parser.peek(), Some(Token::Symbol('-'))) {
        parser.next();
        parser.expect_symbol('[')?;
        let rel_var = match parser.peek() {
            Some(Token::Ident(_)) => Some(parser.ident()?),
            _ => None,
        };
        let rel_kind = if matches!(parser.peek(), Some(Token::Symbol(':'))) {
            parser.next();
            Some(parser.ident()?)
        } else {
            None
        };
        parser.expect_symbol(']')?;
        parser.expect_symbol('-')?;
        match parser.next() {
            Some(Token::Arrow) => {}
            other => {
                return Err(StoreError::QueryValidation(format!(
                    "expected '->', found {other:?}"
                )))
            }
        }
        let target = parser.node_pattern()?;
        Some(Hop {
            rel_var,
            rel_kind,
            target,
        })
    } else {
        None
    };

    let mut conditions = Vec::new();
    if parser.keyword("WHERE") {
        loop {
            let var = parser.ident()?;
            parser.expect_symbol('.')?;
            let prop = parser.ident()?;
            let op = match parser.next() {
                Some(Token::Symbol('=')) => CompareOp::Eq,
                Some(Token::Symbol('!')) => CompareOp::Ne,
                Some(Token::Ident(word)) if word.eq_ignore_ascii_case("CONTAINS") => {
                    CompareOp::Contains
                }
                other => {
                    return Err(StoreError::Unsupported(format!(
                        "unsupported comparison {other:?}"
                    )))
                }
            };
            let value = parser.value()?;
            conditions.push(Condition {
                var,
                prop,
                op,
                value,
            });
            if !parser.keyword("AND") {
                break;
            }
        }
    }

    if !parser.keyword("RETURN") {
        return Err(StoreError::QueryValidation(
            "read queries must have a RETURN clause".to_owned(),
        ));
    }
    let mut returns = Vec::new();
    loop {
        if let Some(Token::Ident(ident)) = parser.peek()
            && ident.eq_ignore_ascii_case("count")
        {
            parser.next();
            parser.expect_symbol('(')?;
            let var = parser.ident()?;
            parser.expect_symbol(')')?;
            let alias = if parser.keyword("AS") {
                parser.ident()?
            } else {
                format!("count({var})")
            };
            returns.push(ReturnItem::Count { var, alias });
        } else {
            let var = parser.ident()?;
            if matches!(parser.peek(), Some(Token::Symbol('.'))) {
                parser.next();
                let prop = parser.ident()?;
                let alias = if parser.keyword("AS") {
                    parser.ident()?
                } else {
                    format!("{var}.{prop}")
                };
                returns.push(ReturnItem::Prop { var, prop, alias });
            } else {
                let alias = if parser.keyword("AS") {
                    parser.ident()?
                } else {
                    var.clone()
                };
                returns.push(ReturnItem::Var { var, alias });
            }
        }
        if matches!(parser.peek(), Some(Token::Symbol(','))) {
            parser.next();
            continue;
        }
        break;
    }

    let limit = if parser.keyword("LIMIT") {
        match parser.next() {
            Some(Token::Num(n)) if n >= 0.0 => Some(n as usize),
            other => {
                return Err(StoreError::QueryValidation(format!(
                    "expected LIMIT count, found {other:?}"
                )))
            }
        }
    } else {
        None
    };

    if let Some(trailing) = parser.peek() {
        return Err(StoreError::Unsupported(format!(
            "trailing query content: {trailing:?}"
        )));
    }

    Ok(ReadQuery {
        source,
        hop,
        conditions,
        returns,
        limit,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// How many row candidates are scanned between deadline polls.
const DEADLINE_STRIDE: usize = 256;

/// A variable binding for one candidate row.
struct Row<'a> {
    bindings: Vec<(&'a str, &'a Entity)>,
    rel_kind: Option<&'static str>,
    rel_var: Option<&'a str>,
}

/// Evaluate a parsed query against the backend. The deadline is polled
/// between candidates; expired queries report a timeout and leave no state
/// behind.
pub fn evaluate<B: GraphBackend + ?Sized>(
    backend: &B,
    query: &ReadQuery,
    params: &HashMap<String, JsonValue>,
    timeout: Duration,
) -> Result<Vec<JsonMap<String, JsonValue>>, StoreError> {
    let deadline = Instant::now() + timeout;
    let mut rows: Vec<JsonMap<String, JsonValue>> = Vec::new();
    let mut count: usize = 0;
    let mut scanned: usize = 0;
    let counting = query
        .returns
        .iter()
        .any(|r| matches!(r, ReturnItem::Count { .. }));
    let limit = query.limit.unwrap_or(usize::MAX);

    // Returns `Ok(false)` once the row budget is exhausted so the scan can
    // stop early; timeout polling happens every DEADLINE_STRIDE candidates.
    let mut consider = |row: Row| -> Result<bool, StoreError> {
        scanned += 1;
        if scanned % DEADLINE_STRIDE == 0 && Instant::now() > deadline {
            return Err(StoreError::Timeout(timeout));
        }
        for condition in &query.conditions {
            let entity = row
                .bindings
                .iter()
                .find(|(var, _)| *var == condition.var)
                .map(|(_, e)| *e);
            let Some(entity) = entity else {
                return Err(StoreError::QueryValidation(format!(
                    "unknown variable '{}' in WHERE",
                    condition.var
                )));
            };
            let actual = entity_prop(entity, &condition.prop);
            let expected = resolve_value(&condition.value, params)?;
            if !compare(condition.op, actual.as_ref(), &expected) {
                return Ok(true);
            }
        }
        if counting {
            count += 1;
            return Ok(true);
        }
        let mut out = JsonMap::new();
        for item in &query.returns {
            match item {
                ReturnItem::Var { var, alias } => {
                    let entity = row.bindings.iter().find(|(v, _)| v == var).map(|(_, e)| *e);
                    match entity {
                        Some(entity) => {
                            out.insert(alias.clone(), entity_json(entity));
                        }
                        None if Some(var.as_str()) == row.rel_var => {
                            out.insert(
                                alias.clone(),
                                JsonValue::String(row.rel_kind.unwrap_or("").to_owned()),
                            );
                        }
                        None => {
                            return Err(StoreError::QueryValidation(format!(
                                "unknown variable '{var}' in RETURN"
                            )))
                        }
                    }
                }
                ReturnItem::Prop { var, prop, alias } => {
                    let entity = row.bindings.iter().find(|(v, _)| v == var).map(|(_, e)| *e);
                    let Some(entity) = entity else {
                        return Err(StoreError::QueryValidation(format!(
                            "unknown variable '{var}' in RETURN"
                        )));
                    };
                    out.insert(
                        alias.clone(),
                        entity_prop(entity, prop).unwrap_or(JsonValue::Null),
                    );
                }
                ReturnItem::Count { .. } => {}
            }
        }
        rows.push(out);
        Ok(rows.len() < limit)
    };

    match &query.hop {
        None => {
            for entity in backend.all_entities() {
                if !node_matches(entity, &query.source, params)? {
                    continue;
                }
                let keep_going = consider(Row {
                    bindings: vec![(query.source.var.as_str(), entity)],
                    rel_kind: None,
                    rel_var: None,
                })?;
                if !keep_going {
                    break;
                }
            }
        }
        Some(hop) => {
            for rel in backend.all_relationships() {
                if let Some(kind) = &hop.rel_kind
                    && rel.kind.as_str() != kind
                {
                    continue;
                }
                let (Some(source), Some(target)) =
                    (backend.entity(rel.source), backend.entity(rel.target))
                else {
                    continue;
                };
                if !node_matches(source, &query.source, params)?
                    || !node_matches(target, &hop.target, params)?
                {
                    continue;
                }
                let keep_going = consider(Row {
                    bindings: vec![
                        (query.source.var.as_str(), source),
                        (hop.target.var.as_str(), target),
                    ],
                    rel_kind: Some(rel.kind.as_str()),
                    rel_var: hop.rel_var.as_deref(),
                })?;
                if !keep_going {
                    break;
                }
            }
        }
    }

    if counting {
        let mut out = JsonMap::new();
        for item in &query.returns {
            if let ReturnItem::Count { alias, .. } = item {
                out.insert(alias.clone(), serde_json::json!(count));
            }
        }
        rows = vec![out];
    }

    Ok(rows)
}

fn node_matches(
    entity: &Entity,
    pattern: &NodePattern,
    params: &HashMap<String, JsonValue>,
) -> Result<bool, StoreError> {
    if let Some(label) = &pattern.label
        && entity.kind.as_str() != label
    {
        return Ok(false);
    }
    for (prop, value) in &pattern.props {
        let expected = resolve_value(value, params)?;
        if !compare(CompareOp::Eq, entity_prop(entity, prop).as_ref(), &expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn resolve_value(
    value: &ValueExpr,
    params: &HashMap<String, JsonValue>,
) -> Result<JsonValue, StoreError> {
    match value {
        ValueExpr::Literal(v) => Ok(v.clone()),
        ValueExpr::Param(name) => params.get(name).cloned().ok_or_else(|| {
            StoreError::QueryValidation(format!("missing query parameter '${name}'"))
        }),
    }
}

fn compare(op: CompareOp, actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match op {
        CompareOp::Eq => match (actual, expected) {
            (Some(JsonValue::Number(a)), JsonValue::Number(b)) => {
                a.as_f64() == b.as_f64()
            }
            (Some(a), b) => a == b,
            (None, _) => false,
        },
        CompareOp::Ne => !compare(CompareOp::Eq, actual, expected),
        CompareOp::Contains => match (actual, expected) {
            (Some(JsonValue::String(a)), JsonValue::String(b)) => a.contains(b.as_str()),
            _ => false,
        },
    }
}

/// Resolve a property name against an entity: the base columns first, then
/// the kind-specific property bag.
fn entity_prop(entity: &Entity, name: &str) -> Option<JsonValue> {
    match name {
        "id" => return Some(JsonValue::String(entity.id.to_hex())),
        "kind" => return Some(JsonValue::String(entity.kind.as_str().to_owned())),
        "name" => return Some(JsonValue::String(entity.name.clone())),
        "qualified_name" => return Some(JsonValue::String(entity.qualified_name.clone())),
        "file_path" => {
            return Some(JsonValue::String(
                entity.path.to_string_lossy().into_owned(),
            ))
        }
        "start_line" => return Some(serde_json::json!(entity.span.start)),
        "end_line" => return Some(serde_json::json!(entity.span.end)),
        _ => {}
    }
    entity
        .props
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value.as_json())
}

/// The full-row JSON shape for `RETURN n`.
fn entity_json(entity: &Entity) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert("id".to_owned(), JsonValue::String(entity.id.to_hex()));
    map.insert(
        "kind".to_owned(),
        JsonValue::String(entity.kind.as_str().to_owned()),
    );
    map.insert("name".to_owned(), JsonValue::String(entity.name.clone()));
    map.insert(
        "qualified_name".to_owned(),
        JsonValue::String(entity.qualified_name.clone()),
    );
    map.insert(
        "file_path".to_owned(),
        JsonValue::String(entity.path.to_string_lossy().into_owned()),
    );
    map.insert("start_line".to_owned(), serde_json::json!(entity.span.start));
    map.insert("end_line".to_owned(), serde_json::json!(entity.span.end));
    for (key, value) in &entity.props {
        map.insert(key.as_str().to_owned(), value.as_json());
    }
    JsonValue::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_verbs_rejected() {
        for query in [
            "CREATE (n:Function) RETURN n",
            "MATCH (n) DELETE n",
            "match (n) set n.name = 'x' return n",
            "MATCH (n) DETACH DELETE n",
            "DROP TABLE Function",
        ] {
            assert!(validate_read_only(query).is_err(), "should reject: {query}");
        }
    }

    #[test]
    fn test_read_queries_pass_validation() {
        for query in [
            "MATCH (n:Function) RETURN n.name LIMIT 10",
            "MATCH (a:Function)-[r:Calls]->(b:Function) RETURN a.name, b.name",
        ] {
            assert!(validate_read_only(query).is_ok(), "should accept: {query}");
        }
    }

    #[test]
    fn test_validation_is_not_fooled_by_identifier_substrings() {
        // `offset` contains SET; `created_at` contains CREATE.
        assert!(validate_read_only("MATCH (n) WHERE n.offset = 1 RETURN n.created_at").is_ok());
    }

    #[test]
    fn test_parse_node_query() {
        let q = parse("MATCH (n:Function {name: 'f'}) WHERE n.file_path CONTAINS 'a.py' RETURN n.name AS fn, n LIMIT 5").unwrap();
        assert_eq!(q.source.label.as_deref(), Some("Function"));
        assert_eq!(q.source.props.len(), 1);
        assert_eq!(q.conditions.len(), 1);
        assert_eq!(q.conditions[0].op, CompareOp::Contains);
        assert_eq!(q.returns.len(), 2);
        assert_eq!(q.limit, Some(5));
    }

    #[test]
    fn test_parse_relationship_query() {
        let q = parse("MATCH (a:Function)-[r:Calls]->(b:Function) RETURN a.name, b.name").unwrap();
        let hop = q.hop.expect("hop");
        assert_eq!(hop.rel_kind.as_deref(), Some("Calls"));
        assert_eq!(hop.target.label.as_deref(), Some("Function"));
    }

    #[test]
    fn test_parse_count() {
        let q = parse("MATCH (n:Class) RETURN count(n) AS classes").unwrap();
        assert!(matches!(&q.returns[0], ReturnItem::Count { alias, .. } if alias == "classes"));
    }

    #[test]
    fn test_unsupported_constructs_are_explicit() {
        assert!(matches!(
            parse("MATCH (a)<-[r]-(b) RETURN a"),
            Err(StoreError::Unsupported(_))
        ));
        assert!(parse("RETURN 1").is_err());
    }
}
