// ============================================================================
// Operation Parsing & Shape Limits
// ============================================================================
//
// A small recursive-descent parser for executable GraphQL operation
// documents: operation kind, name, and the selection tree with aliases.
// Arguments, variable definitions, and directives are consumed lexically
// (string- and paren-aware) but not interpreted; each field keeps its raw
// source span so the planner can reassemble per-subgraph operations verbatim.
//
// Depth and complexity ceilings are enforced here, before authorization or
// routing, so an oversized operation never reaches a backend. The parser
// itself carries a hard nesting cap so a hostile document cannot exhaust the
// stack during parsing.
//
// Fragments are not supported by the composed schema surface and are rejected
// with a validation error.
//
// ============================================================================

use crate::error::{GatewayError, GatewayResult};

/// Hard cap on selection-set nesting inside the parser itself. The parser
/// recurses per nesting level, so this bounds stack growth on documents that
/// would otherwise abort the process before `enforce_limits` can run. Far
/// above any configurable depth ceiling.
const MAX_PARSE_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

/// One field in a selection set. `source` is the exact document substring for
/// this field (alias, arguments, and nested selection included).
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub children: Vec<Field>,
    pub source: String,
}

impl Field {
    /// The key this field occupies in the response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    /// Raw variable-definitions text including parentheses, e.g.
    /// `($id: ID!, $limit: Int)`. Kept verbatim for sub-request reassembly.
    pub variable_defs: Option<String>,
    pub fields: Vec<Field>,
}

impl Operation {
    /// Deepest selection nesting; a bare top-level field has depth 1.
    pub fn depth(&self) -> usize {
        fn depth_of(fields: &[Field]) -> usize {
            fields
                .iter()
                .map(|f| 1 + depth_of(&f.children))
                .max()
                .unwrap_or(0)
        }
        depth_of(&self.fields)
    }

    /// Complexity score: one point per field, summed through nesting.
    pub fn complexity(&self) -> usize {
        fn count(fields: &[Field]) -> usize {
            fields.iter().map(|f| 1 + count(&f.children)).sum()
        }
        count(&self.fields)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// Parse a request document and select the operation to execute.
///
/// With several operations in one document, `operation_name` must pick one;
/// with a single operation it may be omitted.
pub fn parse_operation(document: &str, operation_name: Option<&str>) -> GatewayResult<Operation> {
    let operations = Parser::new(document).parse_document()?;

    match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|op| op.name.as_deref() == Some(wanted))
            .ok_or_else(|| {
                GatewayError::validation(format!("operation {} not found in document", wanted))
            }),
        None => {
            let mut iter = operations.into_iter();
            let first = iter
                .next()
                .ok_or_else(|| GatewayError::validation("document contains no operations"))?;
            if iter.next().is_some() {
                return Err(GatewayError::validation(
                    "operationName is required when the document defines multiple operations",
                ));
            }
            Ok(first)
        }
    }
}

/// Enforce the configured shape ceilings on a parsed operation.
pub fn enforce_limits(
    operation: &Operation,
    max_depth: usize,
    max_complexity: usize,
) -> GatewayResult<()> {
    let depth = operation.depth();
    if depth > max_depth {
        return Err(GatewayError::validation(format!(
            "query depth {} exceeds maximum of {}",
            depth, max_depth
        )));
    }
    let complexity = operation.complexity();
    if complexity > max_complexity {
        return Err(GatewayError::validation(format!(
            "query complexity {} exceeds maximum of {}",
            complexity, max_complexity
        )));
    }
    Ok(())
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    /// Current selection-set nesting level, bounded by `MAX_PARSE_DEPTH`.
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse_document(&mut self) -> GatewayResult<Vec<Operation>> {
        let mut operations = Vec::new();
        self.skip_ignored();
        while self.pos < self.bytes.len() {
            operations.push(self.parse_operation_definition()?);
            self.skip_ignored();
        }
        if operations.is_empty() {
            return Err(GatewayError::validation("empty operation document"));
        }
        Ok(operations)
    }

    fn parse_operation_definition(&mut self) -> GatewayResult<Operation> {
        // Shorthand form: a bare selection set is an anonymous query.
        if self.peek() == Some(b'{') {
            let fields = self.parse_selection_set()?;
            return Ok(Operation {
                kind: OperationKind::Query,
                name: None,
                variable_defs: None,
                fields,
            });
        }

        let keyword = self.parse_name()?;
        let kind = match keyword.as_str() {
            "query" => OperationKind::Query,
            "mutation" => OperationKind::Mutation,
            "subscription" => OperationKind::Subscription,
            "fragment" => {
                return Err(GatewayError::validation(
                    "fragment definitions are not supported",
                ))
            }
            other => {
                return Err(GatewayError::validation(format!(
                    "expected operation keyword, found {:?}",
                    other
                )))
            }
        };

        self.skip_ignored();
        let name = if self
            .peek()
            .map(|b| b.is_ascii_alphabetic() || b == b'_')
            .unwrap_or(false)
        {
            Some(self.parse_name()?)
        } else {
            None
        };

        self.skip_ignored();
        let variable_defs = if self.peek() == Some(b'(') {
            let start = self.pos;
            self.skip_balanced(b'(', b')')?;
            let defs = self.src[start..self.pos].to_string();
            self.skip_ignored();
            Some(defs)
        } else {
            None
        };
        self.skip_directives()?;

        let fields = self.parse_selection_set()?;
        Ok(Operation {
            kind,
            name,
            variable_defs,
            fields,
        })
    }

    fn parse_selection_set(&mut self) -> GatewayResult<Vec<Field>> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(GatewayError::validation(format!(
                "selection nesting exceeds {} levels",
                MAX_PARSE_DEPTH
            )));
        }
        self.expect(b'{')?;
        let mut fields = Vec::new();
        loop {
            self.skip_ignored();
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b'.') => {
                    return Err(GatewayError::validation(
                        "fragment spreads are not supported",
                    ))
                }
                Some(_) => fields.push(self.parse_field()?),
                None => {
                    return Err(GatewayError::validation(
                        "unterminated selection set",
                    ))
                }
            }
        }
        if fields.is_empty() {
            return Err(GatewayError::validation("empty selection set"));
        }
        self.depth -= 1;
        Ok(fields)
    }

    fn parse_field(&mut self) -> GatewayResult<Field> {
        let start = self.pos;
        let first = self.parse_name()?;
        self.skip_ignored();

        // `alias: name`
        let (alias, name) = if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_ignored();
            (Some(first), self.parse_name()?)
        } else {
            (None, first)
        };

        self.skip_ignored();
        if self.peek() == Some(b'(') {
            self.skip_balanced(b'(', b')')?;
            self.skip_ignored();
        }
        self.skip_directives()?;

        let children = if self.peek() == Some(b'{') {
            self.parse_selection_set()?
        } else {
            Vec::new()
        };

        let source = self.src[start..self.pos].trim_end().to_string();
        Ok(Field {
            name,
            alias,
            children,
            source,
        })
    }

    fn parse_name(&mut self) -> GatewayResult<String> {
        self.skip_ignored();
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(GatewayError::validation(format!(
                "expected a name at offset {}",
                start
            )));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn skip_directives(&mut self) -> GatewayResult<()> {
        loop {
            self.skip_ignored();
            if self.peek() != Some(b'@') {
                return Ok(());
            }
            self.pos += 1;
            self.parse_name()?;
            self.skip_ignored();
            if self.peek() == Some(b'(') {
                self.skip_balanced(b'(', b')')?;
            }
        }
    }

    /// Consume a balanced `open`...`close` region, ignoring brackets inside
    /// string literals.
    fn skip_balanced(&mut self, open: u8, close: u8) -> GatewayResult<()> {
        debug_assert_eq!(self.peek(), Some(open));
        let start = self.pos;
        let mut level = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'"' => self.skip_string()?,
                b'#' => self.skip_comment(),
                _ => {
                    if b == open {
                        level += 1;
                    } else if b == close {
                        level -= 1;
                        if level == 0 {
                            self.pos += 1;
                            return Ok(());
                        }
                    }
                    self.pos += 1;
                }
            }
        }
        Err(GatewayError::validation(format!(
            "unbalanced {} starting at offset {}",
            open as char, start
        )))
    }

    fn skip_string(&mut self) -> GatewayResult<()> {
        // Block string: """..."""
        if self.bytes[self.pos..].starts_with(b"\"\"\"") {
            self.pos += 3;
            while self.pos < self.bytes.len() {
                if self.bytes[self.pos..].starts_with(b"\"\"\"") {
                    self.pos += 3;
                    return Ok(());
                }
                self.pos += 1;
            }
            return Err(GatewayError::validation("unterminated block string"));
        }

        self.pos += 1; // opening quote
        while let Some(b) = self.peek() {
            match b {
                b'\\' => self.pos += 2,
                b'"' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(GatewayError::validation("unterminated string literal"))
    }

    fn skip_comment(&mut self) {
        while let Some(b) = self.peek() {
            self.pos += 1;
            if b == b'\n' {
                break;
            }
        }
    }

    fn skip_ignored(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' => self.pos += 1,
                b'#' => self.skip_comment(),
                _ => break,
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> GatewayResult<()> {
        self.skip_ignored();
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(GatewayError::validation(format!(
                "expected {:?} at offset {}",
                expected as char, self.pos
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shorthand_query() {
        let op = parse_operation("{ inventory { items } }", None).unwrap();
        assert_eq!(op.kind, OperationKind::Query);
        assert!(op.name.is_none());
        assert_eq!(op.fields.len(), 1);
        assert_eq!(op.fields[0].name, "inventory");
        assert_eq!(op.fields[0].children[0].name, "items");
    }

    #[test]
    fn parses_named_mutation_with_arguments() {
        let doc = r#"mutation CreateUser($name: String!) {
            createUser(input: { name: $name, note: "a \" tricky } string" }) {
                id
            }
        }"#;
        let op = parse_operation(doc, None).unwrap();
        assert_eq!(op.kind, OperationKind::Mutation);
        assert_eq!(op.name.as_deref(), Some("CreateUser"));
        assert_eq!(op.variable_defs.as_deref(), Some("($name: String!)"));
        assert_eq!(op.fields[0].name, "createUser");
        assert!(op.fields[0].source.contains("tricky } string"));
    }

    #[test]
    fn aliases_set_the_response_key() {
        let op = parse_operation("{ current: inventory { items } }", None).unwrap();
        assert_eq!(op.fields[0].name, "inventory");
        assert_eq!(op.fields[0].response_key(), "current");
    }

    #[test]
    fn selects_operation_by_name() {
        let doc = "query A { a } query B { b }";
        let op = parse_operation(doc, Some("B")).unwrap();
        assert_eq!(op.fields[0].name, "b");

        let err = parse_operation(doc, None).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn rejects_fragments() {
        let err = parse_operation("{ ...parts }", None).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn rejects_malformed_document() {
        for doc in ["{ unterminated", "query {{}}", "", "garbage tokens"] {
            let err = parse_operation(doc, None).unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "doc: {}", doc);
        }
    }

    #[test]
    fn computes_depth_and_complexity() {
        let op = parse_operation("{ a { b { c } } d }", None).unwrap();
        assert_eq!(op.depth(), 3);
        assert_eq!(op.complexity(), 4);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let op = parse_operation("{ a { b { c { d } } } }", None).unwrap();
        assert!(enforce_limits(&op, 10, 1000).is_ok());
        let err = enforce_limits(&op, 3, 1000).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(err.error_code(), "GRAPHQL_VALIDATION_FAILED");
    }

    #[test]
    fn complexity_limit_is_enforced() {
        let op = parse_operation("{ a b c d e f }", None).unwrap();
        assert!(enforce_limits(&op, 10, 6).is_ok());
        assert!(enforce_limits(&op, 10, 5).is_err());
    }

    #[test]
    fn comments_and_commas_are_ignored() {
        let doc = "# leading comment\n{ a, b # trailing\n c }";
        let op = parse_operation(doc, None).unwrap();
        assert_eq!(op.fields.len(), 3);
    }

    #[test]
    fn hostile_nesting_is_rejected_without_exhausting_the_stack() {
        // A megabyte of `{a{a{a…` once aborted the process with a stack
        // overflow before the depth limit could run.
        let levels = 200_000;
        let mut doc = String::with_capacity(levels * 3);
        for _ in 0..levels {
            doc.push_str("{a");
        }
        doc.push_str(&"}".repeat(levels));

        let err = parse_operation(&doc, None).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(err.error_code(), "GRAPHQL_VALIDATION_FAILED");
    }

    #[test]
    fn nesting_below_the_parse_cap_still_parses() {
        let levels = MAX_PARSE_DEPTH - 1;
        let mut doc = String::new();
        for _ in 0..levels {
            doc.push_str("{a");
        }
        doc.push_str(&"}".repeat(levels));

        let op = parse_operation(&doc, None).unwrap();
        assert_eq!(op.depth(), levels);
    }

    #[test]
    fn subscription_kind_is_recognized() {
        let op = parse_operation("subscription Watch { ticks }", None).unwrap();
        assert_eq!(op.kind, OperationKind::Subscription);
        assert_eq!(op.kind.as_str(), "subscription");
    }
}
