use crate::ast::{
    BoolOperator, CmpOperator, Comprehension, Constant, Conversion, DictEntry, Expr, ExprKind,
    Keyword, Module, Operator, Parameter, Position, Span, Stmt, StmtKind, UnaryOperator,
};
use crate::error::{ConvertError, SyntaxError};
use crate::literal::{decode_escapes, parse_number, string_prefix, unescape_braces};
use std::cell::Cell;
use tree_sitter::{Node, Parser};

const INVALID_SYNTAX: &str = "invalid syntax";
const UNEXPECTED_INDENT: &str = "unexpected indent";
const UNMATCHED_DEDENT: &str = "unindent does not match any outer indentation level";
const GENERATOR_NOT_PARENTHESIZED: &str = "Generator expression must be parenthesized";

pub const MAX_DEPTH: usize = 1000;

pub fn parse_module(source: &str) -> Result<Module, ConvertError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|err| ConvertError::Grammar(err.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ConvertError::Grammar("parser returned no tree".to_string()))?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(locate_syntax_error(root, source).into());
    }
    // The grammar's scanner accepts misindented bodies without error nodes.
    if let Some(err) = check_indentation(root, source) {
        return Err(err.into());
    }
    Lowering::new(source).module(root)
}

fn locate_syntax_error(root: Node, source: &str) -> SyntaxError {
    let node = first_error(root).unwrap_or(root);
    let byte = if node.is_missing() {
        // Point just past the last token before the gap.
        source[..node.start_byte().min(source.len())].trim_end().len()
    } else {
        let region = source.get(node.byte_range()).unwrap_or("");
        let trimmed_end = node.start_byte() + region.trim_end().len();
        let rest_of_line = source[trimmed_end..].split('\n').next().unwrap_or("");
        let rest = rest_of_line.trim();
        if rest.is_empty() || rest.starts_with('#') {
            trimmed_end
        } else {
            node.start_byte()
        }
    };
    syntax_error_at(source, byte, INVALID_SYNTAX)
}

fn first_error(root: Node) -> Option<Node> {
    let mut node = root;
    loop {
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        let mut cursor = node.walk();
        let next = node.children(&mut cursor).find(|child| child.has_error());
        node = next?;
    }
}

fn check_indentation(root: Node, source: &str) -> Option<SyntaxError> {
    let mut found: Option<(usize, String)> = None;
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if matches!(node.kind(), "module" | "block") {
            if let Some((byte, message)) = suite_indentation(node, source) {
                if found.as_ref().map_or(true, |(first, _)| byte < *first) {
                    found = Some((byte, message));
                }
            }
        }
        let mut cursor = node.walk();
        stack.extend(node.named_children(&mut cursor));
    }
    found.map(|(byte, message)| syntax_error_at(source, byte, &message))
}

fn suite_indentation(suite: Node, source: &str) -> Option<(usize, String)> {
    let statements = named_children(suite);
    if suite.kind() == "block" && statements.is_empty() {
        return Some((next_content_byte(source, suite.start_byte()), expected_block_message(suite)));
    }
    let mut column = (suite.kind() == "module").then_some(0);
    for statement in statements
        .iter()
        .filter(|statement| starts_line(source, statement.start_byte()))
    {
        let current = statement.start_position().column;
        match column {
            None => column = Some(current),
            Some(expected) if current != expected => {
                let message = if current < previous_line_indent(source, statement.start_byte()) {
                    UNMATCHED_DEDENT
                } else {
                    UNEXPECTED_INDENT
                };
                return Some((statement.start_byte(), message.to_string()));
            }
            Some(_) => {}
        }
    }
    None
}

fn previous_line_indent(source: &str, byte: usize) -> usize {
    let line_start = source[..byte].rfind('\n').map(|i| i + 1).unwrap_or(0);
    source[..line_start]
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|line| {
            let content = line.trim_start();
            !content.is_empty() && !content.starts_with('#')
        })
        .map(|line| line.len() - line.trim_start().len())
        .unwrap_or(0)
}

fn expected_block_message(suite: Node) -> String {
    let Some(owner) = suite.parent() else {
        return "expected an indented block".to_string();
    };
    let line = owner.start_position().row + 1;
    let after = match owner.kind() {
        "function_definition" => "function definition".to_string(),
        "class_definition" => "class definition".to_string(),
        other => match other.split('_').next() {
            Some(keyword) if !keyword.is_empty() => format!("'{}' statement", keyword),
            _ => return "expected an indented block".to_string(),
        },
    };
    format!("expected an indented block after {} on line {}", after, line)
}

fn starts_line(source: &str, byte: usize) -> bool {
    let line_start = source[..byte].rfind('\n').map(|i| i + 1).unwrap_or(0);
    source[line_start..byte].trim().is_empty()
}

// Byte of the first token on a line after `from`'s, skipping blank and comment lines.
fn next_content_byte(source: &str, from: usize) -> usize {
    let from = from.min(source.len());
    let mut line_start = if starts_line(source, from) {
        source[..from].rfind('\n').map(|i| i + 1).unwrap_or(0)
    } else {
        match source[from..].find('\n') {
            Some(i) => from + i + 1,
            None => return source.len(),
        }
    };
    while line_start < source.len() {
        let line_end = source[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(source.len());
        let line = &source[line_start..line_end];
        let content = line.trim_start();
        if !content.is_empty() && !content.starts_with('#') {
            return line_start + (line.len() - content.len());
        }
        line_start = line_end + 1;
    }
    source.len()
}

fn syntax_error_at(source: &str, byte: usize, message: &str) -> SyntaxError {
    let byte = byte.min(source.len());
    let line_start = source[..byte].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = source[byte..]
        .find('\n')
        .map(|i| byte + i + 1)
        .unwrap_or(source.len());
    SyntaxError {
        lineno: source[..line_start].matches('\n').count() + 1,
        offset: source[line_start..byte].chars().count() + 1,
        text: source[line_start..line_end].to_string(),
        message: message.to_string(),
    }
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

fn all_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

fn fields<'t>(node: Node<'t>, name: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(name, &mut cursor)
        .filter(|child| child.is_named() && !child.is_extra())
        .collect()
}

fn source_comma_before(source: &str, byte: usize) -> usize {
    source[..byte.min(source.len())].rfind(',').unwrap_or(byte)
}

fn field<'t>(node: Node<'t>, name: &str) -> Result<Node<'t>, ConvertError> {
    node.child_by_field_name(name)
        .ok_or_else(|| ConvertError::malformed(node.kind(), format!("missing '{}'", name)))
}

fn has_token(node: Node, token: &str) -> bool {
    all_children(node)
        .iter()
        .any(|child| !child.is_named() && child.kind() == token)
}

enum Piece {
    Literal(String),
    Value(Expr),
}

struct Lowering<'s> {
    source: &'s str,
    depth: Cell<usize>,
}

struct DepthGuard<'a>(&'a Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl<'s> Lowering<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            depth: Cell::new(0),
        }
    }

    fn descend(&self) -> Result<DepthGuard<'_>, ConvertError> {
        let depth = self.depth.get() + 1;
        if depth > MAX_DEPTH {
            return Err(ConvertError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth.set(depth);
        Ok(DepthGuard(&self.depth))
    }

    fn text(&self, node: Node) -> &'s str {
        self.source.get(node.byte_range()).unwrap_or("")
    }

    fn span(&self, node: Node) -> Span {
        let point = node.start_position();
        Span::new(
            node.start_byte(),
            node.end_byte(),
            Position::new(point.row + 1, point.column),
        )
    }

    fn span_between(&self, first: Node, last: Node) -> Span {
        let mut span = self.span(first);
        span.end = last.end_byte();
        span
    }

    fn module(&self, root: Node) -> Result<Module, ConvertError> {
        Ok(Module {
            body: self.statements(root)?,
        })
    }

    fn statements(&self, node: Node) -> Result<Vec<Stmt>, ConvertError> {
        named_children(node)
            .into_iter()
            .map(|child| self.stmt(child))
            .collect()
    }

    fn stmt(&self, node: Node) -> Result<Stmt, ConvertError> {
        let _depth = self.descend()?;
        let span = self.span(node);
        let kind = match node.kind() {
            "expression_statement" => return self.expression_statement(node),
            "assignment" => return self.assignment(node, span),
            "augmented_assignment" => return self.augmented_assignment(node, span),
            "return_statement" => StmtKind::Return {
                value: named_children(node)
                    .first()
                    .map(|child| self.expr(*child))
                    .transpose()?,
            },
            "pass_statement" => StmtKind::Pass,
            "break_statement" => StmtKind::Break,
            "continue_statement" => StmtKind::Continue,
            "if_statement" => {
                let alternatives = fields(node, "alternative");
                StmtKind::If {
                    test: self.expr(field(node, "condition")?)?,
                    body: self.statements(field(node, "consequence")?)?,
                    orelse: self.if_alternatives(&alternatives)?,
                }
            }
            "while_statement" => StmtKind::While {
                test: self.expr(field(node, "condition")?)?,
                body: self.statements(field(node, "body")?)?,
                orelse: self.else_clause(node)?,
            },
            "for_statement" => StmtKind::For {
                target: self.target(field(node, "left")?)?,
                iter: self.expr_list(&fields(node, "right"))?,
                body: self.statements(field(node, "body")?)?,
                orelse: self.else_clause(node)?,
                is_async: has_token(node, "async"),
            },
            "function_definition" => self.function_definition(node)?,
            "class_definition" => StmtKind::ClassDef,
            "decorated_definition" => return self.decorated_definition(node, span),
            "delete_statement" => StmtKind::Delete,
            "global_statement" => StmtKind::Global,
            "nonlocal_statement" => StmtKind::Nonlocal,
            "with_statement" => StmtKind::With {
                is_async: has_token(node, "async"),
            },
            "match_statement" => StmtKind::Match,
            "raise_statement" => StmtKind::Raise,
            "try_statement" => StmtKind::Try,
            "assert_statement" => StmtKind::Assert,
            "import_statement" | "future_import_statement" => StmtKind::Import,
            "import_from_statement" => StmtKind::ImportFrom,
            "type_alias_statement" => StmtKind::TypeAlias,
            "print_statement" | "exec_statement" => {
                let keyword = if node.kind() == "print_statement" {
                    "print"
                } else {
                    "exec"
                };
                return Err(syntax_error_at(
                    self.source,
                    node.start_byte(),
                    &format!(
                        "Missing parentheses in call to '{}'. Did you mean {}(...)?",
                        keyword, keyword
                    ),
                )
                .into());
            }
            other => return Err(ConvertError::malformed("statement", format!("unknown kind '{}'", other))),
        };
        Ok(Stmt { span, kind })
    }

    fn expression_statement(&self, node: Node) -> Result<Stmt, ConvertError> {
        let span = self.span(node);
        let children = named_children(node);
        match children.as_slice() {
            [only] if only.kind() == "assignment" => self.assignment(*only, span),
            [only] if only.kind() == "augmented_assignment" => {
                self.augmented_assignment(*only, span)
            }
            [only] => Ok(Stmt {
                span,
                kind: StmtKind::Expr {
                    value: self.expr(*only)?,
                },
            }),
            [] => Err(ConvertError::malformed("expression_statement", "empty")),
            many => {
                let elts = many
                    .iter()
                    .map(|child| self.expr(*child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stmt {
                    span,
                    kind: StmtKind::Expr {
                        value: Expr::new(span, ExprKind::Tuple { elts }),
                    },
                })
            }
        }
    }

    fn assignment(&self, node: Node, span: Span) -> Result<Stmt, ConvertError> {
        let left = field(node, "left")?;
        if let Some(annotation) = node.child_by_field_name("type") {
            return Ok(Stmt {
                span,
                kind: StmtKind::AnnAssign {
                    target: self.target(left)?,
                    annotation: self.expr(annotation)?,
                    value: node
                        .child_by_field_name("right")
                        .map(|right| self.expr(right))
                        .transpose()?,
                },
            });
        }

        // `a = b = 1` nests as assignment(a, assignment(b, 1)).
        let mut targets = vec![self.target(left)?];
        let mut right = field(node, "right")?;
        while right.kind() == "assignment" {
            targets.push(self.target(field(right, "left")?)?);
            right = field(right, "right")?;
        }
        Ok(Stmt {
            span,
            kind: StmtKind::Assign {
                targets,
                value: self.expr(right)?,
            },
        })
    }

    fn augmented_assignment(&self, node: Node, span: Span) -> Result<Stmt, ConvertError> {
        let operator = field(node, "operator")?;
        let op = Operator::from_augmented(self.text(operator)).ok_or_else(|| {
            ConvertError::malformed(
                "augmented_assignment",
                format!("unknown operator '{}'", self.text(operator)),
            )
        })?;
        Ok(Stmt {
            span,
            kind: StmtKind::AugAssign {
                target: self.target(field(node, "left")?)?,
                op,
                value: self.expr(field(node, "right")?)?,
            },
        })
    }

    fn if_alternatives(&self, alternatives: &[Node]) -> Result<Vec<Stmt>, ConvertError> {
        let _depth = self.descend()?;
        let Some((first, rest)) = alternatives.split_first() else {
            return Ok(Vec::new());
        };
        match first.kind() {
            "elif_clause" => {
                let last = rest.last().copied().unwrap_or(*first);
                Ok(vec![Stmt {
                    span: self.span_between(*first, last),
                    kind: StmtKind::If {
                        test: self.expr(field(*first, "condition")?)?,
                        body: self.statements(field(*first, "consequence")?)?,
                        orelse: self.if_alternatives(rest)?,
                    },
                }])
            }
            "else_clause" => self.statements(field(*first, "body")?),
            other => Err(ConvertError::malformed(
                "if_statement",
                format!("unexpected alternative '{}'", other),
            )),
        }
    }

    fn else_clause(&self, node: Node) -> Result<Vec<Stmt>, ConvertError> {
        match node.child_by_field_name("alternative") {
            Some(clause) => self.statements(field(clause, "body")?),
            None => Ok(Vec::new()),
        }
    }

    fn decorated_definition(&self, node: Node, span: Span) -> Result<Stmt, ConvertError> {
        let mut inner = self.stmt(field(node, "definition")?)?;
        if let StmtKind::FunctionDef { decorated, .. } = &mut inner.kind {
            *decorated = true;
        }
        inner.span = span;
        Ok(inner)
    }

    fn function_definition(&self, node: Node) -> Result<StmtKind, ConvertError> {
        Ok(StmtKind::FunctionDef {
            name: self.text(field(node, "name")?).to_string(),
            params: match node.child_by_field_name("parameters") {
                Some(params) => self.parameters(params)?,
                None => Vec::new(),
            },
            body: self.statements(field(node, "body")?)?,
            decorated: false,
            is_async: has_token(node, "async"),
        })
    }

    fn parameters(&self, node: Node) -> Result<Vec<Parameter>, ConvertError> {
        let mut params = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "positional_separator" | "keyword_separator" => {}
                "identifier" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                    params.push(self.parameter(child, None, None)?)
                }
                "default_parameter" => {
                    let default = Some(self.expr(field(child, "value")?)?);
                    params.push(self.parameter(field(child, "name")?, None, default)?);
                }
                "typed_default_parameter" => {
                    let annotation = Some(self.expr(field(child, "type")?)?);
                    let default = Some(self.expr(field(child, "value")?)?);
                    params.push(self.parameter(field(child, "name")?, annotation, default)?);
                }
                "typed_parameter" => {
                    let annotation = Some(self.expr(field(child, "type")?)?);
                    let name = named_children(child)
                        .into_iter()
                        .next()
                        .ok_or_else(|| ConvertError::malformed("typed_parameter", "missing name"))?;
                    params.push(self.parameter(name, annotation, None)?);
                }
                other => {
                    return Err(ConvertError::malformed(
                        "parameters",
                        format!("unexpected '{}'", other),
                    ))
                }
            }
        }
        Ok(params)
    }

    fn parameter(
        &self,
        name: Node,
        annotation: Option<Expr>,
        default: Option<Expr>,
    ) -> Result<Parameter, ConvertError> {
        // `*args` / `**kwargs` patterns wrap the identifier.
        let ident = match name.kind() {
            "list_splat_pattern" | "dictionary_splat_pattern" => named_children(name)
                .into_iter()
                .next()
                .ok_or_else(|| ConvertError::malformed(name.kind(), "missing name"))?,
            _ => name,
        };
        Ok(Parameter {
            name: self.text(ident).to_string(),
            annotation,
            default,
        })
    }

    fn target(&self, node: Node) -> Result<Expr, ConvertError> {
        let _depth = self.descend()?;
        let span = self.span(node);
        match node.kind() {
            "pattern_list" | "tuple_pattern" => Ok(Expr::new(
                span,
                ExprKind::Tuple {
                    elts: self.targets(node)?,
                },
            )),
            "list_pattern" => Ok(Expr::new(
                span,
                ExprKind::List {
                    elts: self.targets(node)?,
                },
            )),
            "list_splat_pattern" => {
                let inner = named_children(node)
                    .into_iter()
                    .next()
                    .ok_or_else(|| ConvertError::malformed("list_splat_pattern", "empty"))?;
                Ok(Expr::new(
                    span,
                    ExprKind::Starred {
                        value: Box::new(self.target(inner)?),
                    },
                ))
            }
            _ => self.expr(node),
        }
    }

    fn targets(&self, node: Node) -> Result<Vec<Expr>, ConvertError> {
        named_children(node)
            .into_iter()
            .map(|child| self.target(child))
            .collect()
    }

    fn expr_list(&self, nodes: &[Node]) -> Result<Expr, ConvertError> {
        match nodes {
            [only] => self.expr(*only),
            [first, .., last] => Ok(Expr::new(
                self.span_between(*first, *last),
                ExprKind::Tuple {
                    elts: nodes
                        .iter()
                        .map(|node| self.expr(*node))
                        .collect::<Result<_, _>>()?,
                },
            )),
            [] => Err(ConvertError::malformed("expression", "empty expression list")),
        }
    }

    fn exprs(&self, node: Node) -> Result<Vec<Expr>, ConvertError> {
        named_children(node)
            .into_iter()
            .map(|child| self.expr(child))
            .collect()
    }

    fn expr(&self, node: Node) -> Result<Expr, ConvertError> {
        let _depth = self.descend()?;
        let span = self.span(node);
        let kind = match node.kind() {
            "identifier" | "keyword_identifier" => ExprKind::Name {
                id: self.text(node).to_string(),
            },
            "integer" | "float" => ExprKind::Constant(parse_number(self.text(node))),
            "true" => ExprKind::Constant(Constant::Bool(true)),
            "false" => ExprKind::Constant(Constant::Bool(false)),
            "none" => ExprKind::Constant(Constant::None),
            "ellipsis" => ExprKind::Constant(Constant::Ellipsis),
            "string" => return self.strings(&[node], span),
            "concatenated_string" => {
                let parts = named_children(node)
                    .into_iter()
                    .filter(|child| child.kind() == "string")
                    .collect::<Vec<_>>();
                return self.strings(&parts, span);
            }
            "parenthesized_expression" => {
                return match named_children(node).as_slice() {
                    [inner] => self.expr(*inner),
                    _ => Err(ConvertError::malformed(
                        "parenthesized_expression",
                        "expected one inner expression",
                    )),
                };
            }
            "binary_operator" => {
                let operator = field(node, "operator")?;
                ExprKind::BinOp {
                    left: Box::new(self.expr(field(node, "left")?)?),
                    op: Operator::from_symbol(self.text(operator)).ok_or_else(|| {
                        ConvertError::malformed(
                            "binary_operator",
                            format!("unknown operator '{}'", self.text(operator)),
                        )
                    })?,
                    right: Box::new(self.expr(field(node, "right")?)?),
                }
            }
            "unary_operator" => {
                let op = match self.text(field(node, "operator")?) {
                    "-" => UnaryOperator::USub,
                    "+" => UnaryOperator::UAdd,
                    "~" => UnaryOperator::Invert,
                    other => {
                        return Err(ConvertError::malformed(
                            "unary_operator",
                            format!("unknown operator '{}'", other),
                        ))
                    }
                };
                ExprKind::UnaryOp {
                    op,
                    operand: Box::new(self.expr(field(node, "argument")?)?),
                }
            }
            "not_operator" => ExprKind::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(self.expr(field(node, "argument")?)?),
            },
            "boolean_operator" => {
                let op = self.bool_operator(node)?;
                let mut values = Vec::new();
                self.collect_bool_operands(node, op, &mut values)?;
                ExprKind::BoolOp { op, values }
            }
            "comparison_operator" => self.comparison(node)?,
            "call" => self.call(node)?,
            "attribute" => ExprKind::Attribute {
                value: Box::new(self.expr(field(node, "object")?)?),
                attr: self.text(field(node, "attribute")?).to_string(),
            },
            "subscript" => {
                let subscripts = fields(node, "subscript");
                ExprKind::Subscript {
                    value: Box::new(self.expr(field(node, "value")?)?),
                    slice: Box::new(self.expr_list(&subscripts)?),
                }
            }
            "slice" => self.slice(node)?,
            "list" => ExprKind::List {
                elts: self.exprs(node)?,
            },
            "tuple" | "expression_list" | "pattern_list" | "tuple_pattern" => ExprKind::Tuple {
                elts: self.exprs(node)?,
            },
            "list_pattern" => ExprKind::List {
                elts: self.exprs(node)?,
            },
            "set" => ExprKind::Set {
                elts: self.exprs(node)?,
            },
            "dictionary" => ExprKind::Dict {
                entries: self.dict_entries(node)?,
            },
            "list_splat" | "list_splat_pattern" | "splat_type" => match named_children(node).as_slice() {
                [inner] => ExprKind::Starred {
                    value: Box::new(self.expr(*inner)?),
                },
                _ => return Err(ConvertError::malformed(node.kind(), "expected one operand")),
            },
            "list_comprehension" | "set_comprehension" | "generator_expression" => {
                let elt = Box::new(self.expr(field(node, "body")?)?);
                let generators = self.comprehension_clauses(node)?;
                match node.kind() {
                    "list_comprehension" => ExprKind::ListComp { elt, generators },
                    "set_comprehension" => ExprKind::SetComp { elt, generators },
                    _ => ExprKind::GeneratorExp { elt, generators },
                }
            }
            "dictionary_comprehension" => {
                let pair = field(node, "body")?;
                ExprKind::DictComp {
                    key: Box::new(self.expr(field(pair, "key")?)?),
                    value: Box::new(self.expr(field(pair, "value")?)?),
                    generators: self.comprehension_clauses(node)?,
                }
            }
            "conditional_expression" => match named_children(node).as_slice() {
                [body, test, orelse] => ExprKind::IfExp {
                    test: Box::new(self.expr(*test)?),
                    body: Box::new(self.expr(*body)?),
                    orelse: Box::new(self.expr(*orelse)?),
                },
                _ => {
                    return Err(ConvertError::malformed(
                        "conditional_expression",
                        "expected three operands",
                    ))
                }
            },
            "named_expression" => ExprKind::NamedExpr {
                target: Box::new(self.expr(field(node, "name")?)?),
                value: Box::new(self.expr(field(node, "value")?)?),
            },
            "lambda" => ExprKind::Lambda,
            "await" => ExprKind::Await,
            "yield" => {
                if has_token(node, "from") {
                    ExprKind::YieldFrom
                } else {
                    ExprKind::Yield
                }
            }
            // Annotation-only forms.
            "type" | "constrained_type" => {
                return match named_children(node).first() {
                    Some(inner) => self.expr(*inner),
                    None => Err(ConvertError::malformed(node.kind(), "empty")),
                };
            }
            "generic_type" => {
                let children = named_children(node);
                let (base, params) = match children.as_slice() {
                    [base, params] => (*base, *params),
                    _ => return Err(ConvertError::malformed("generic_type", "expected base and parameters")),
                };
                ExprKind::Subscript {
                    value: Box::new(self.expr(base)?),
                    slice: Box::new(self.expr_list(&named_children(params))?),
                }
            }
            "union_type" => match named_children(node).as_slice() {
                [left, right] => ExprKind::BinOp {
                    left: Box::new(self.expr(*left)?),
                    op: Operator::BitOr,
                    right: Box::new(self.expr(*right)?),
                },
                _ => return Err(ConvertError::malformed("union_type", "expected two operands")),
            },
            "member_type" => match named_children(node).as_slice() {
                [value, attr] => ExprKind::Attribute {
                    value: Box::new(self.expr(*value)?),
                    attr: self.text(*attr).to_string(),
                },
                _ => return Err(ConvertError::malformed("member_type", "expected two parts")),
            },
            other => {
                return Err(ConvertError::malformed(
                    "expression",
                    format!("unknown kind '{}'", other),
                ))
            }
        };
        Ok(Expr::new(span, kind))
    }

    fn bool_operator(&self, node: Node) -> Result<BoolOperator, ConvertError> {
        match self.text(field(node, "operator")?) {
            "and" => Ok(BoolOperator::And),
            "or" => Ok(BoolOperator::Or),
            other => Err(ConvertError::malformed(
                "boolean_operator",
                format!("unknown operator '{}'", other),
            )),
        }
    }

    // `a or b or c` parses left-nested; flatten same-operator chains into one
    // operand list. Parenthesized groups stay nested.
    fn collect_bool_operands(
        &self,
        node: Node,
        op: BoolOperator,
        values: &mut Vec<Expr>,
    ) -> Result<(), ConvertError> {
        let _depth = self.descend()?;
        let left = field(node, "left")?;
        if left.kind() == "boolean_operator" && self.bool_operator(left)? == op {
            self.collect_bool_operands(left, op, values)?;
        } else {
            values.push(self.expr(left)?);
        }
        values.push(self.expr(field(node, "right")?)?);
        Ok(())
    }

    fn comparison(&self, node: Node) -> Result<ExprKind, ConvertError> {
        let mut operands = Vec::new();
        let mut ops = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        for child in all_children(node) {
            if child.is_named() {
                if !operands.is_empty() {
                    let symbol = pending.join(" ");
                    ops.push(CmpOperator::from_symbol(&symbol).ok_or_else(|| {
                        ConvertError::malformed(
                            "comparison_operator",
                            format!("unknown operator '{}'", symbol),
                        )
                    })?);
                }
                pending.clear();
                operands.push(self.expr(child)?);
            } else {
                pending.push(child.kind());
            }
        }
        let mut operands = operands.into_iter();
        let left = operands
            .next()
            .ok_or_else(|| ConvertError::malformed("comparison_operator", "no operands"))?;
        let comparators = operands.collect::<Vec<_>>();
        // Folded into one nested block per comparator.
        if comparators.len() > MAX_DEPTH {
            return Err(ConvertError::TooDeep { limit: MAX_DEPTH });
        }
        if comparators.is_empty() || comparators.len() != ops.len() {
            return Err(ConvertError::malformed(
                "comparison_operator",
                "operators and operands do not line up",
            ));
        }
        Ok(ExprKind::Compare {
            left: Box::new(left),
            ops,
            comparators,
        })
    }

    fn call(&self, node: Node) -> Result<ExprKind, ConvertError> {
        let func = Box::new(self.expr(field(node, "function")?)?);
        let arguments = field(node, "arguments")?;
        if arguments.kind() == "generator_expression" {
            // `f(x for x in y, 1)`: the grammar folds the trailing arguments into the loop.
            let swallows_arguments = named_children(arguments)
                .into_iter()
                .filter(|clause| clause.kind() == "for_in_clause")
                .any(|clause| fields(clause, "right").len() > 1);
            if swallows_arguments {
                return Err(syntax_error_at(
                    self.source,
                    field(arguments, "body")?.start_byte(),
                    GENERATOR_NOT_PARENTHESIZED,
                )
                .into());
            }
            return Ok(ExprKind::Call {
                func,
                args: vec![self.expr(arguments)?],
                keywords: Vec::new(),
            });
        }

        let mut args = Vec::new();
        let mut keywords = Vec::new();
        for child in named_children(arguments) {
            match child.kind() {
                "keyword_argument" => keywords.push(Keyword {
                    arg: Some(self.text(field(child, "name")?).to_string()),
                    value: self.expr(field(child, "value")?)?,
                }),
                "dictionary_splat" => {
                    let inner = named_children(child)
                        .into_iter()
                        .next()
                        .ok_or_else(|| ConvertError::malformed("dictionary_splat", "empty"))?;
                    keywords.push(Keyword {
                        arg: None,
                        value: self.expr(inner)?,
                    });
                }
                _ => args.push(self.expr(child)?),
            }
        }
        Ok(ExprKind::Call {
            func,
            args,
            keywords,
        })
    }

    fn slice(&self, node: Node) -> Result<ExprKind, ConvertError> {
        let mut parts: [Option<Box<Expr>>; 3] = [None, None, None];
        let mut colons = 0usize;
        for child in all_children(node) {
            if child.kind() == ":" {
                colons += 1;
            } else if child.is_named() {
                parts[colons.min(2)] = Some(Box::new(self.expr(child)?));
            }
        }
        let [lower, upper, step] = parts;
        Ok(ExprKind::Slice { lower, upper, step })
    }

    fn dict_entries(&self, node: Node) -> Result<Vec<DictEntry>, ConvertError> {
        named_children(node)
            .into_iter()
            .map(|child| match child.kind() {
                "pair" => Ok(DictEntry {
                    key: Some(self.expr(field(child, "key")?)?),
                    value: self.expr(field(child, "value")?)?,
                }),
                "dictionary_splat" => match named_children(child).as_slice() {
                    [inner] => Ok(DictEntry {
                        key: None,
                        value: self.expr(*inner)?,
                    }),
                    _ => Err(ConvertError::malformed("dictionary_splat", "expected one operand")),
                },
                other => Err(ConvertError::malformed(
                    "dictionary",
                    format!("unexpected entry '{}'", other),
                )),
            })
            .collect()
    }

    fn comprehension_clauses(&self, node: Node) -> Result<Vec<Comprehension>, ConvertError> {
        let body = field(node, "body")?;
        let mut generators: Vec<Comprehension> = Vec::new();
        for child in named_children(node) {
            if child.id() == body.id() {
                continue;
            }
            match child.kind() {
                "for_in_clause" => generators.push(Comprehension {
                    target: self.target(field(child, "left")?)?,
                    iter: self.comprehension_iter(child)?,
                    ifs: Vec::new(),
                    is_async: has_token(child, "async"),
                }),
                "if_clause" => {
                    let condition = named_children(child)
                        .into_iter()
                        .next()
                        .ok_or_else(|| ConvertError::malformed("if_clause", "empty"))?;
                    let current = generators.last_mut().ok_or_else(|| {
                        ConvertError::malformed(node.kind(), "'if' before any 'for'")
                    })?;
                    current.ifs.push(self.expr(condition)?);
                }
                other => {
                    return Err(ConvertError::malformed(
                        node.kind(),
                        format!("unexpected clause '{}'", other),
                    ))
                }
            }
        }
        Ok(generators)
    }

    fn comprehension_iter(&self, clause: Node) -> Result<Expr, ConvertError> {
        match fields(clause, "right").as_slice() {
            [only] => self.expr(*only),
            [_, second, ..] => {
                // `[x for x in a, b]` needs parentheses around the iterable.
                let comma = source_comma_before(self.source, second.start_byte());
                Err(syntax_error_at(self.source, comma, INVALID_SYNTAX).into())
            }
            [] => Err(ConvertError::malformed("for_in_clause", "missing iterable")),
        }
    }

    fn strings(&self, nodes: &[Node], span: Span) -> Result<Expr, ConvertError> {
        let mut pieces = Vec::new();
        let mut formatted = false;
        let mut all_bytes = !nodes.is_empty();
        for node in nodes {
            let prefix = string_prefix(self.text(*node))?;
            formatted |= prefix.formatted;
            all_bytes &= prefix.bytes;
            let content_start = node.start_byte() + prefix.open_len;
            let content_end = node.end_byte().saturating_sub(prefix.close_len).max(content_start);
            if prefix.formatted {
                self.collect_pieces(
                    *node,
                    "interpolation",
                    content_start,
                    content_end,
                    prefix.raw,
                    &mut pieces,
                )?;
            } else {
                pieces.push(Piece::Literal(self.literal_text(
                    content_start,
                    content_end,
                    prefix.raw,
                    false,
                )));
            }
        }

        if all_bytes {
            return Ok(Expr::new(
                span,
                ExprKind::Constant(Constant::Bytes(span.text(self.source).to_string())),
            ));
        }
        if !formatted {
            let value = pieces
                .into_iter()
                .filter_map(|piece| match piece {
                    Piece::Literal(text) => Some(text),
                    Piece::Value(_) => None,
                })
                .collect::<String>();
            return Ok(Expr::new(span, ExprKind::Constant(Constant::Str(value))));
        }
        Ok(Expr::new(
            span,
            ExprKind::JoinedStr {
                values: self.join_pieces(pieces, span),
            },
        ))
    }

    fn literal_text(&self, start: usize, end: usize, raw: bool, formatted: bool) -> String {
        let text = self.source.get(start..end).unwrap_or("");
        let decoded = if raw {
            text.to_string()
        } else {
            decode_escapes(text)
        };
        if formatted {
            unescape_braces(&decoded)
        } else {
            decoded
        }
    }

    fn collect_pieces(
        &self,
        node: Node,
        interpolation_kind: &str,
        start: usize,
        end: usize,
        raw: bool,
        pieces: &mut Vec<Piece>,
    ) -> Result<(), ConvertError> {
        let mut cursor = start;
        for child in named_children(node)
            .into_iter()
            .filter(|child| child.kind() == interpolation_kind)
        {
            if child.start_byte() > cursor {
                pieces.push(Piece::Literal(self.literal_text(
                    cursor,
                    child.start_byte(),
                    raw,
                    true,
                )));
            }
            self.interpolation(child, raw, pieces)?;
            cursor = child.end_byte();
        }
        if end > cursor {
            pieces.push(Piece::Literal(self.literal_text(cursor, end, raw, true)));
        }
        Ok(())
    }

    fn interpolation(&self, node: Node, raw: bool, pieces: &mut Vec<Piece>) -> Result<(), ConvertError> {
        let span = self.span(node);
        let value = self.expr(field(node, "expression")?)?;
        let type_conversion = node.child_by_field_name("type_conversion");
        let format_specifier = node.child_by_field_name("format_specifier");
        let mut conversion = type_conversion
            .and_then(|conv| self.text(conv).trim_start_matches('!').chars().next())
            .and_then(Conversion::from_char);

        if has_token(node, "=") {
            // `f"{x=}"` also prints the expression text itself.
            let boundary = type_conversion
                .or(format_specifier)
                .map(|next| next.start_byte())
                .unwrap_or_else(|| node.end_byte().saturating_sub(1));
            let debug_text = self
                .source
                .get(node.start_byte() + 1..boundary)
                .unwrap_or("")
                .to_string();
            pieces.push(Piece::Literal(debug_text));
            if conversion.is_none() && format_specifier.is_none() {
                conversion = Some(Conversion::Repr);
            }
        }

        let format_spec = match format_specifier {
            Some(spec) => {
                let spec_span = self.span(spec);
                let mut spec_pieces = Vec::new();
                // Skip the leading ':'.
                self.collect_pieces(
                    spec,
                    "format_expression",
                    spec.start_byte() + 1,
                    spec.end_byte(),
                    raw,
                    &mut spec_pieces,
                )?;
                Some(Box::new(Expr::new(
                    spec_span,
                    ExprKind::JoinedStr {
                        values: self.join_pieces(spec_pieces, spec_span),
                    },
                )))
            }
            None => None,
        };

        pieces.push(Piece::Value(Expr::new(
            span,
            ExprKind::FormattedValue {
                value: Box::new(value),
                conversion,
                format_spec,
            },
        )));
        Ok(())
    }

    fn join_pieces(&self, pieces: Vec<Piece>, span: Span) -> Vec<Expr> {
        let mut values = Vec::new();
        let mut literal = String::new();
        for piece in pieces {
            match piece {
                Piece::Literal(text) => literal.push_str(&text),
                Piece::Value(expr) => {
                    if !literal.is_empty() {
                        values.push(Expr::new(
                            span,
                            ExprKind::Constant(Constant::Str(std::mem::take(&mut literal))),
                        ));
                    }
                    values.push(expr);
                }
            }
        }
        if !literal.is_empty() {
            values.push(Expr::new(span, ExprKind::Constant(Constant::Str(literal))));
        }
        values
    }
}
