//! A `nom`-based parser for the query language: XPath 1.0 location paths
//! and expressions, extended with `quo`, the ternary conditional, the
//! `not`/`empty` unary operators and `{expr}` templates.
//!
//! Entry points come in pairs: the short form parses with an empty
//! namespace context, the `_with` form takes a namespace context for prefix
//! resolution plus the declared extension-function signatures. All of them
//! reject unconsumed trailing input and report the byte offset of a failure
//! inside the original query.

use crate::ast::{
    Anchor, Axis, BinaryOperator, Expression, LocationPath, NodeTest, NodeTypeTest, Pattern, Step,
    UnaryOperator,
};
use crate::error::XPathError;
use crate::functions::{Builtin, ExtensionSignatures};
use crate::namespace::NamespaceContext;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, recognize},
    multi::separated_list0,
    sequence::{delimited, pair},
};
use std::cell::RefCell;

type NomError<'i> = nom::error::Error<&'i str>;

/// Read-only state threaded through the grammar functions.
#[derive(Clone, Copy)]
struct ParseCtx<'c> {
    query: &'c str,
    namespace: &'c NamespaceContext,
    extensions: Option<&'c ExtensionSignatures>,
    /// A resolution failure that must surface verbatim instead of the
    /// generic syntax error nom would report.
    fatal: &'c RefCell<Option<XPathError>>,
}

impl<'c> ParseCtx<'c> {
    fn fail<'i>(&self, input: &'i str, error: XPathError) -> nom::Err<NomError<'i>> {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        nom::Err::Failure(NomError::new(input, nom::error::ErrorKind::Verify))
    }
}

// --- Public entry points ---

pub fn parse_expression(input: &str) -> Result<Expression, XPathError> {
    parse_expression_with(input, &NamespaceContext::new(), None)
}

pub fn parse_expression_with(
    input: &str,
    namespace: &NamespaceContext,
    extensions: Option<&ExtensionSignatures>,
) -> Result<Expression, XPathError> {
    let fatal = RefCell::new(None);
    let ctx = ParseCtx {
        query: input,
        namespace,
        extensions,
        fatal: &fatal,
    };
    finish(&ctx, expression(ctx, input))
}

/// Parses a select pattern: a path evaluated relative to a context node.
/// A scalar query is wrapped so that selecting it yields its node-set
/// coercion.
pub fn parse_select(input: &str) -> Result<Pattern, XPathError> {
    parse_select_with(input, &NamespaceContext::new(), None)
}

pub fn parse_select_with(
    input: &str,
    namespace: &NamespaceContext,
    extensions: Option<&ExtensionSignatures>,
) -> Result<Pattern, XPathError> {
    let expr = parse_expression_with(input, namespace, extensions)?;
    Ok(to_pattern(expr))
}

/// Parses a match pattern: a path anchored at no particular context, used
/// for template/rule matching. Relative branches match at any depth.
pub fn parse_match(input: &str) -> Result<Pattern, XPathError> {
    parse_match_with(input, &NamespaceContext::new(), None)
}

pub fn parse_match_with(
    input: &str,
    namespace: &NamespaceContext,
    extensions: Option<&ExtensionSignatures>,
) -> Result<Pattern, XPathError> {
    let mut pattern = parse_select_with(input, namespace, extensions)?;
    for path in &mut pattern.paths {
        if path.anchor == Anchor::Context {
            path.anchor = Anchor::Any;
        }
    }
    Ok(pattern)
}

/// Parses an attribute-value template: literal text with embedded `{expr}`
/// segments. `{{` and `}}` denote literal braces.
pub fn parse_template(input: &str) -> Result<Expression, XPathError> {
    parse_template_with(input, &NamespaceContext::new(), None)
}

pub fn parse_template_with(
    input: &str,
    namespace: &NamespaceContext,
    extensions: Option<&ExtensionSignatures>,
) -> Result<Expression, XPathError> {
    let mut parts: Vec<Expression> = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("{{") {
            literal.push('{');
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("}}") {
            literal.push('}');
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('{') {
            let end = template_expr_end(stripped).ok_or_else(|| XPathError::Syntax {
                query: input.to_string(),
                position: input.len() - rest.len(),
                message: "unterminated '{' in template".to_string(),
            })?;
            if !literal.is_empty() {
                parts.push(Expression::Literal(std::mem::take(&mut literal)));
            }
            parts.push(parse_expression_with(&stripped[..end], namespace, extensions)?);
            rest = &stripped[end + 1..];
        } else if rest.starts_with('}') {
            return Err(XPathError::Syntax {
                query: input.to_string(),
                position: input.len() - rest.len(),
                message: "unmatched '}' in template".to_string(),
            });
        } else {
            let next = rest
                .char_indices()
                .find(|(_, c)| *c == '{' || *c == '}')
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            literal.push_str(&rest[..next]);
            rest = &rest[next..];
        }
    }
    if !literal.is_empty() || parts.is_empty() {
        parts.push(Expression::Literal(literal));
    }
    if parts.len() == 1 && matches!(parts[0], Expression::Literal(_)) {
        return Ok(parts.into_iter().next().unwrap_or(Expression::Literal(String::new())));
    }
    Ok(Expression::Interpolation(parts))
}

/// Finds the index of the `}` closing a template expression, honoring
/// string literals and nested `{uri}name` braces inside the expression.
fn template_expr_end(input: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '{' => depth += 1,
                '}' => {
                    if depth == 0 {
                        return Some(i);
                    }
                    depth -= 1;
                }
                _ => {}
            },
        }
    }
    None
}

fn finish<T>(ctx: &ParseCtx<'_>, result: IResult<&str, T>) -> Result<T, XPathError> {
    if let Some(error) = ctx.fatal.borrow_mut().take() {
        return Err(error);
    }
    match result {
        Ok((rem, value)) => {
            let rem = rem.trim_start();
            if rem.is_empty() {
                Ok(value)
            } else {
                let bad = rem.chars().next().unwrap_or(' ');
                Err(XPathError::syntax(
                    ctx.query,
                    rem,
                    format!("unexpected character '{}'", bad),
                ))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            if let Some(error) = ctx.fatal.borrow_mut().take() {
                return Err(error);
            }
            Err(XPathError::syntax(ctx.query, e.input, "malformed query"))
        }
        Err(nom::Err::Incomplete(_)) => {
            Err(XPathError::syntax(ctx.query, "", "unexpected end of input"))
        }
    }
}

/// Wraps a parsed expression as a pattern, the way a node-set is expected:
/// an existing pattern is used directly, anything else becomes the start
/// point of an empty path.
fn to_pattern(expr: Expression) -> Pattern {
    match expr {
        Expression::NodeSet(pattern) => pattern,
        other => Pattern::single(LocationPath {
            anchor: Anchor::Expr(Box::new(other)),
            steps: vec![],
        }),
    }
}

// --- Character classes ---

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn nc_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(is_name_start),
        take_while(is_name_char),
    ))
    .parse(input)
}

fn qualified_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(nc_name, opt(pair(tag(":"), nc_name)))).parse(input)
}

// --- Expression grammar, lowest precedence first ---

fn expression<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    let (i, cond) = or_expr(ctx, input)?;
    let (i2, _) = multispace0(i)?;
    if let Ok((i3, _)) = char::<&str, NomError>('?')(i2) {
        let (i4, then) = expression(ctx, i3)?;
        let (i5, _) = multispace0(i4)?;
        let (i6, _) = char(':')(i5)?;
        let (i7, otherwise) = expression(ctx, i6)?;
        Ok((
            i7,
            Expression::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
        ))
    } else {
        Ok((i, cond))
    }
}

/// A keyword operator only matches when not followed by another name
/// character, so `x or y` parses while `orange` stays a name.
fn keyword<'i>(word: &'static str) -> impl FnMut(&'i str) -> IResult<&'i str, &'i str> {
    move |input| {
        let (i, matched) = tag(word)(input)?;
        if i.chars().next().is_some_and(is_name_char) {
            Err(nom::Err::Error(NomError::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        } else {
            Ok((i, matched))
        }
    }
}

fn or_op(input: &str) -> IResult<&str, BinaryOperator> {
    map(keyword("or"), |_| BinaryOperator::Or).parse(input)
}

fn and_op(input: &str) -> IResult<&str, BinaryOperator> {
    map(keyword("and"), |_| BinaryOperator::And).parse(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOperator> {
    alt((
        map(tag("!="), |_| BinaryOperator::NotEquals),
        map(tag("<="), |_| BinaryOperator::LessThanOrEqual),
        map(tag(">="), |_| BinaryOperator::GreaterThanOrEqual),
        map(tag("&lt;="), |_| BinaryOperator::LessThanOrEqual),
        map(tag("&gt;="), |_| BinaryOperator::GreaterThanOrEqual),
        map(tag("&lt;"), |_| BinaryOperator::LessThan),
        map(tag("&gt;"), |_| BinaryOperator::GreaterThan),
        map(tag("="), |_| BinaryOperator::Equals),
        map(tag("<"), |_| BinaryOperator::LessThan),
        map(tag(">"), |_| BinaryOperator::GreaterThan),
    ))
    .parse(input)
}

fn additive_op(input: &str) -> IResult<&str, BinaryOperator> {
    alt((
        map(char('+'), |_| BinaryOperator::Plus),
        map(char('-'), |_| BinaryOperator::Minus),
    ))
    .parse(input)
}

fn multiplicative_op(input: &str) -> IResult<&str, BinaryOperator> {
    alt((
        map(char('*'), |_| BinaryOperator::Multiply),
        map(keyword("div"), |_| BinaryOperator::Divide),
        map(keyword("quo"), |_| BinaryOperator::Quotient),
        map(keyword("mod"), |_| BinaryOperator::Modulo),
    ))
    .parse(input)
}

fn binary_level<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    sub: fn(ParseCtx<'c>, &'i str) -> IResult<&'i str, Expression>,
    op: fn(&'i str) -> IResult<&'i str, BinaryOperator>,
) -> IResult<&'i str, Expression> {
    let (mut i, mut left) = sub(ctx, input)?;
    loop {
        let attempt = delimited(multispace0, op, multispace0).parse(i);
        match attempt {
            Ok((i2, operator)) => {
                let (i3, right) = sub(ctx, i2)?;
                left = Expression::Binary {
                    op: operator,
                    left: Box::new(left),
                    right: Box::new(right),
                };
                i = i3;
            }
            Err(_) => return Ok((i, left)),
        }
    }
}

fn or_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    binary_level(ctx, input, and_expr, or_op)
}

fn and_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    binary_level(ctx, input, comparison_expr, and_op)
}

fn comparison_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    binary_level(ctx, input, additive_expr, comparison_op)
}

fn additive_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    binary_level(ctx, input, multiplicative_expr, additive_op)
}

fn multiplicative_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    binary_level(ctx, input, unary_expr, multiplicative_op)
}

fn unary_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    let (i, _) = multispace0(input)?;

    if let Ok((i2, _)) = char::<&str, NomError>('-')(i) {
        let (i3, operand) = unary_expr(ctx, i2)?;
        return Ok((
            i3,
            Expression::Unary {
                op: UnaryOperator::Minus,
                expr: Box::new(operand),
            },
        ));
    }
    // unary plus is accepted and ignored
    if let Ok((i2, _)) = char::<&str, NomError>('+')(i) {
        return unary_expr(ctx, i2);
    }
    // `not` / `empty` keywords; a lone name like `empty` still parses as a
    // path because the operand parse fails and we fall through
    if let Ok((i2, _)) = keyword("not")(i) {
        if let Ok((i3, operand)) = unary_expr(ctx, i2) {
            return Ok((
                i3,
                Expression::Unary {
                    op: UnaryOperator::Not,
                    expr: Box::new(operand),
                },
            ));
        }
    }
    if let Ok((i2, _)) = keyword("empty")(i) {
        if let Ok((i3, operand)) = unary_expr(ctx, i2) {
            return Ok((
                i3,
                Expression::Unary {
                    op: UnaryOperator::Empty,
                    expr: Box::new(operand),
                },
            ));
        }
    }
    path_expr(ctx, i)
}

// --- Paths and primaries ---

fn path_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    let (i, _) = multispace0(input)?;
    // primaries first: `position()` must win over a step named `position`
    let (i, first) = match primary_expr(ctx, i) {
        Ok(result) => result,
        Err(nom::Err::Failure(e)) => return Err(nom::Err::Failure(e)),
        Err(_) => {
            let (i2, path) = location_path(ctx, i)?;
            (i2, Expression::NodeSet(Pattern::single(path)))
        }
    };
    path_continuation(ctx, i, first)
}

/// A node-set valued primary followed by `/`, `[` or `|` continues as a
/// path, a filter or a union.
fn path_continuation<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    first: Expression,
) -> IResult<&'i str, Expression> {
    let (i, _) = multispace0(input)?;
    let continues = i.starts_with('/') || i.starts_with('[') || i.starts_with('|');
    if !continues {
        return Ok((i, first));
    }

    let mut path = match first {
        Expression::NodeSet(mut pattern) if pattern.paths.len() == 1 => {
            match pattern.paths.pop() {
                Some(path) => path,
                None => LocationPath {
                    anchor: Anchor::Context,
                    steps: vec![],
                },
            }
        }
        other => LocationPath {
            anchor: Anchor::Expr(Box::new(other)),
            steps: vec![],
        },
    };

    // `expr[...]` filters the node list itself
    let (i, predicates) = predicate_list(ctx, i)?;
    if !predicates.is_empty() {
        path.steps.push(Step {
            axis: Axis::SelfAxis,
            node_test: NodeTest::NodeType(NodeTypeTest::Node),
            predicates,
        });
    }
    let (i, _) = path_tail(ctx, i, &mut path.steps)?;

    let mut paths = vec![path];
    let (i, _) = union_tail(ctx, i, &mut paths)?;
    Ok((i, Expression::NodeSet(Pattern { paths })))
}

fn union_tail<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    paths: &mut Vec<LocationPath>,
) -> IResult<&'i str, ()> {
    let mut i = input;
    loop {
        let (i2, _) = multispace0(i)?;
        let Ok((i3, _)) = char::<&str, NomError>('|')(i2) else {
            return Ok((i2, ()));
        };
        let (i4, branch) = location_path(ctx, i3)?;
        paths.push(branch);
        i = i4;
    }
}

fn path_tail<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    steps: &mut Vec<Step>,
) -> IResult<&'i str, ()> {
    let mut i = input;
    loop {
        let (i2, _) = multispace0(i)?;
        if let Ok((i3, _)) = tag::<&str, &str, NomError>("//")(i2) {
            steps.push(Step::descendant_gap());
            let (i4, next) = step(ctx, i3)?;
            steps.push(next);
            i = i4;
        } else if let Ok((i3, _)) = char::<&str, NomError>('/')(i2) {
            let (i4, next) = step(ctx, i3)?;
            steps.push(next);
            i = i4;
        } else {
            return Ok((i2, ()));
        }
    }
}

fn location_path<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, LocationPath> {
    let (i, _) = multispace0(input)?;

    // current() and context() anchor a path at the environment's current
    // node / the context node
    for (name, anchor) in [("current", Anchor::Current), ("context", Anchor::Context)] {
        if let Ok((i2, _)) = empty_call(name)(i) {
            let mut steps = Vec::new();
            let (i3, _) = path_tail(ctx, i2, &mut steps)?;
            return Ok((i3, LocationPath { anchor, steps }));
        }
    }

    let (mut i, anchor, mut steps) =
        if let Ok((i2, _)) = tag::<&str, &str, NomError>("//")(i) {
            let (i3, first) = step(ctx, i2)?;
            (i3, Anchor::Root, vec![Step::descendant_gap(), first])
        } else if let Ok((i2, _)) = char::<&str, NomError>('/')(i) {
            match step(ctx, i2) {
                Ok((i3, first)) => (i3, Anchor::Root, vec![first]),
                // a path of just "/"
                Err(_) => (i2, Anchor::Root, vec![]),
            }
        } else {
            let (i2, first) = step(ctx, i)?;
            (i2, Anchor::Context, vec![first])
        };

    let (i2, _) = path_tail(ctx, i, &mut steps)?;
    i = i2;
    Ok((i, LocationPath { anchor, steps }))
}

/// Matches `name` followed by an empty argument list.
fn empty_call<'i>(name: &'static str) -> impl FnMut(&'i str) -> IResult<&'i str, ()> {
    move |input| {
        let (i, _) = keyword(name)(input)?;
        let (i, _) = multispace0(i)?;
        let (i, _) = char('(')(i)?;
        let (i, _) = multispace0(i)?;
        let (i, _) = char(')')(i)?;
        Ok((i, ()))
    }
}

fn step<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Step> {
    let (i, _) = multispace0(input)?;

    // abbreviated steps
    if let Ok((i2, _)) = tag::<&str, &str, NomError>("..")(i) {
        let (i3, predicates) = predicate_list(ctx, i2)?;
        return Ok((
            i3,
            Step {
                axis: Axis::Parent,
                node_test: NodeTest::NodeType(NodeTypeTest::Node),
                predicates,
            },
        ));
    }
    if i.starts_with('.') && !i[1..].starts_with(|c: char| c.is_ascii_digit()) {
        let i2 = &i[1..];
        let (i3, predicates) = predicate_list(ctx, i2)?;
        return Ok((
            i3,
            Step {
                axis: Axis::SelfAxis,
                node_test: NodeTest::NodeType(NodeTypeTest::Node),
                predicates,
            },
        ));
    }

    // @node-test
    if let Ok((i2, _)) = char::<&str, NomError>('@')(i) {
        let (i3, node_test) = node_test(ctx, i2, Axis::Attribute)?;
        let (i4, predicates) = predicate_list(ctx, i3)?;
        return Ok((
            i4,
            Step {
                axis: Axis::Attribute,
                node_test,
                predicates,
            },
        ));
    }

    // axis::node-test
    let (i, axis) = axis_prefix(ctx, i)?;
    let axis = axis.unwrap_or(Axis::Child);
    let (i, node_test) = node_test(ctx, i, axis)?;
    let (i, predicates) = predicate_list(ctx, i)?;
    Ok((
        i,
        Step {
            axis,
            node_test,
            predicates,
        },
    ))
}

/// Parses `word::`, mapping the word through the axis table. A word before
/// `::` that is not an axis keyword is a hard error.
fn axis_prefix<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Option<Axis>> {
    let attempt: IResult<&str, (&str, &str)> = pair(nc_name, tag("::")).parse(input);
    match attempt {
        Ok((i, (word, _))) => match Axis::from_keyword(word) {
            Some(axis) => Ok((i, Some(axis))),
            None => Err(ctx.fail(
                input,
                XPathError::syntax(ctx.query, input, format!("unknown axis '{}'", word)),
            )),
        },
        Err(_) => Ok((input, None)),
    }
}

fn node_test<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    axis: Axis,
) -> IResult<&'i str, NodeTest> {
    let (i, _) = multispace0(input)?;

    if let Ok((i2, _)) = char::<&str, NomError>('*')(i) {
        return Ok((i2, NodeTest::Wildcard));
    }

    // {uri}local
    if let Ok((i2, _)) = char::<&str, NomError>('{')(i) {
        let (i3, uri) = take_while(|c| c != '}')(i2)?;
        let (i4, _) = char('}')(i3)?;
        let (i5, local) = nc_name(i4)?;
        return Ok((
            i5,
            NodeTest::Qualified {
                uri: uri.to_string(),
                local: local.to_string(),
            },
        ));
    }

    let (i, name) = nc_name(i)?;

    // prefix:* and prefix:local
    if let Ok((i2, _)) = tag::<&str, &str, NomError>(":*")(i) {
        let uri = ctx.namespace.find(name).map(str::to_string);
        return Ok((
            i2,
            NodeTest::NamespaceWildcard {
                prefix: name.to_string(),
                uri,
            },
        ));
    }
    if let Ok((i2, _)) = char::<&str, NomError>(':')(i) {
        if let Ok((i3, local)) = nc_name(i2) {
            return Ok((
                i3,
                match ctx.namespace.find(name) {
                    Some(uri) => NodeTest::Qualified {
                        uri: uri.to_string(),
                        local: local.to_string(),
                    },
                    None => NodeTest::Name(format!("{}:{}", name, local)),
                },
            ));
        }
    }

    // name( ... ) in a step is a node-type test
    let (i_ws, _) = multispace0(i)?;
    if i_ws.starts_with('(') {
        return node_type_test(ctx, i_ws, name);
    }

    // a bare element name picks up the default element namespace
    if axis != Axis::Attribute && axis != Axis::Namespace {
        if let Some(uri) = ctx.namespace.find("") {
            return Ok((
                i,
                NodeTest::Qualified {
                    uri: uri.to_string(),
                    local: name.to_string(),
                },
            ));
        }
    }
    Ok((i, NodeTest::Name(name.to_string())))
}

fn node_type_test<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    name: &'i str,
) -> IResult<&'i str, NodeTest> {
    let test = match name {
        "text" => Some(NodeTypeTest::Text),
        "comment" => Some(NodeTypeTest::Comment),
        "node" => Some(NodeTypeTest::Node),
        "processing-instruction" | "pi" => Some(NodeTypeTest::ProcessingInstruction),
        "entity-reference" | "er" => Some(NodeTypeTest::EntityReference),
        _ => None,
    };
    let Some(test) = test else {
        return Err(nom::Err::Error(NomError::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    };

    let (i, _) = char('(')(input)?;
    let (i, _) = multispace0(i)?;

    // processing-instruction('target') narrows by target name
    if test == NodeTypeTest::ProcessingInstruction && !i.starts_with(')') {
        let (i2, target) = string_literal(i)?;
        let (i3, _) = multispace0(i2)?;
        let (i4, _) = char(')')(i3)?;
        return Ok((i4, NodeTest::PiTarget(target)));
    }

    match char::<&str, NomError>(')')(i) {
        Ok((i2, _)) => Ok((i2, NodeTest::NodeType(test))),
        Err(_) => Err(ctx.fail(
            i,
            XPathError::syntax(ctx.query, i, format!("{}() takes no arguments", name)),
        )),
    }
}

fn predicate_list<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
) -> IResult<&'i str, Vec<Expression>> {
    let mut predicates = Vec::new();
    let mut i = input;
    loop {
        let (i2, _) = multispace0(i)?;
        let Ok((i3, _)) = char::<&str, NomError>('[')(i2) else {
            return Ok((i2, predicates));
        };
        let (i4, predicate) = expression(ctx, i3)?;
        let (i5, _) = multispace0(i4)?;
        let (i6, _) = char(']')(i5)?;
        predicates.push(predicate);
        i = i6;
    }
}

fn primary_expr<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    let (i, _) = multispace0(input)?;

    if let Ok((i2, expr)) = variable_reference(i) {
        return Ok((i2, expr));
    }
    if let Ok((i2, expr)) = number_literal(i) {
        return Ok((i2, expr));
    }
    if let Ok((i2, s)) = string_literal(i) {
        return Ok((i2, Expression::Literal(s)));
    }
    if i.starts_with('(') {
        let (i2, _) = char('(')(i)?;
        let (i3, inner) = expression(ctx, i2)?;
        let (i4, _) = multispace0(i3)?;
        let (i5, _) = char(')')(i4)?;
        return Ok((i5, inner));
    }
    function_call(ctx, i)
}

fn variable_reference(input: &str) -> IResult<&str, Expression> {
    let (i, _) = char('$')(input)?;
    let (i2, name) = qualified_name(i)?;
    Ok((i2, Expression::Variable(name.to_string())))
}

fn number_literal(input: &str) -> IResult<&str, Expression> {
    let (i, int_part) = take_while(|c: char| c.is_ascii_digit())(input)?;
    let (i, frac_part) = if let Ok((i2, _)) = char::<&str, NomError>('.')(i) {
        let (i3, digits) = take_while(|c: char| c.is_ascii_digit())(i2)?;
        (i3, Some(digits))
    } else {
        (i, None)
    };
    if int_part.is_empty() && frac_part.is_none_or(str::is_empty) {
        return Err(nom::Err::Error(NomError::new(
            input,
            nom::error::ErrorKind::Digit,
        )));
    }

    let (i, exponent) = match exponent_part(i) {
        Ok((i2, exp)) => (i2, Some(exp)),
        Err(_) => (i, None),
    };

    // digits accumulate as an integer, then scale by the fraction and
    // exponent
    let mut value: f64 = 0.0;
    for d in int_part.bytes() {
        value = value * 10.0 + (d - b'0') as f64;
    }
    let mut scale: f64 = 1.0;
    if let Some(frac) = frac_part {
        for d in frac.bytes() {
            value = value * 10.0 + (d - b'0') as f64;
            scale *= 10.0;
        }
    }
    let value = value / scale * 10f64.powi(exponent.unwrap_or(0));

    if frac_part.is_none() && exponent.is_none() {
        if let Ok(long) = int_part.parse::<i64>() {
            return Ok((i, Expression::Long(long)));
        }
    }
    Ok((i, Expression::Double(value)))
}

fn exponent_part(input: &str) -> IResult<&str, i32> {
    let (i, _) = alt((char('e'), char('E'))).parse(input)?;
    let (i, sign) = match alt((char::<&str, NomError>('-'), char('+'))).parse(i) {
        Ok((i2, '-')) => (i2, -1i32),
        Ok((i2, _)) => (i2, 1),
        Err(_) => (i, 1),
    };
    let (i, digits) = take_while1(|c: char| c.is_ascii_digit())(i)?;
    let magnitude: i32 = digits.parse().unwrap_or(i32::MAX);
    Ok((i, sign * magnitude))
}

/// A quoted literal; a doubled quote character denotes one literal quote,
/// so `'it''s'` is the string `it's`.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (rest, quote) = alt((char('\''), char('"'))).parse(input)?;
    let mut out = String::new();
    let mut rest = rest;
    loop {
        match rest.find(quote) {
            None => {
                return Err(nom::Err::Error(NomError::new(
                    input,
                    nom::error::ErrorKind::Char,
                )));
            }
            Some(pos) => {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + 1..];
                if after.starts_with(quote) {
                    out.push(quote);
                    rest = &after[1..];
                } else {
                    return Ok((after, out));
                }
            }
        }
    }
}

/// Names that are node tests or anchors, never scalar function calls; a
/// primary seeing one must fail so the path grammar picks it up.
fn is_node_test_function(name: &str) -> bool {
    matches!(
        name,
        "text"
            | "comment"
            | "node"
            | "processing-instruction"
            | "pi"
            | "entity-reference"
            | "er"
            | "current"
            | "context"
    )
}

fn function_call<'c, 'i>(ctx: ParseCtx<'c>, input: &'i str) -> IResult<&'i str, Expression> {
    let (i, name) = qualified_name(input)?;
    let (i_ws, _) = multispace0(i)?;
    if !i_ws.starts_with('(') || is_node_test_function(name) {
        return Err(nom::Err::Error(NomError::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }

    let (i2, args) = delimited(
        delimited(multispace0, char('('), multispace0),
        separated_list0(
            delimited(multispace0, char(','), multispace0),
            |inner| expression(ctx, inner),
        ),
        delimited(multispace0, char(')'), multispace0),
    )
    .parse(i_ws)?;

    resolve_call(ctx, input, name, args).map(|expr| (i2, expr))
}

/// Resolution order: the library table, then declared extension signatures
/// (by literal name, then by namespace-resolved `{uri}local` key), then a
/// deferred call resolved at evaluation time. A prefixed name whose prefix
/// resolves but has no matching signature is a parse-time error.
fn resolve_call<'c, 'i>(
    ctx: ParseCtx<'c>,
    input: &'i str,
    name: &'i str,
    args: Vec<Expression>,
) -> Result<Expression, nom::Err<NomError<'i>>> {
    if name == "if" {
        if args.len() != 3 {
            return Err(ctx.fail(
                input,
                XPathError::syntax(ctx.query, input, "if() needs three arguments"),
            ));
        }
        let mut args = args;
        let otherwise = Box::new(args.pop().unwrap_or(Expression::Literal(String::new())));
        let then = Box::new(args.pop().unwrap_or(Expression::Literal(String::new())));
        let cond = Box::new(args.pop().unwrap_or(Expression::Literal(String::new())));
        return Ok(Expression::Conditional {
            cond,
            then,
            otherwise,
        });
    }

    if let Some(builtin) = Builtin::lookup(name) {
        return Ok(Expression::Builtin(builtin, args));
    }

    if let Some(signatures) = ctx.extensions {
        if signatures.contains(name) {
            let kind = signatures
                .resolve(name, name, args.len())
                .map_err(|e| ctx.fail(input, e))?;
            return Ok(Expression::Extension {
                name: name.to_string(),
                key: name.to_string(),
                kind,
                args,
            });
        }
        if let Some((prefix, local)) = name.split_once(':') {
            if let Some(uri) = ctx.namespace.find(prefix) {
                let key = format!("{{{}}}{}", uri, local);
                let kind = signatures
                    .resolve(name, &key, args.len())
                    .map_err(|e| ctx.fail(input, e))?;
                return Ok(Expression::Extension {
                    name: name.to_string(),
                    key,
                    kind,
                    args,
                });
            }
        }
    }

    Ok(Expression::Function {
        name: name.to_string(),
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_step(name: &str) -> Step {
        Step::new(Axis::Child, NodeTest::Name(name.to_string()))
    }

    #[test]
    fn test_simple_path() {
        let pattern = parse_select("foo/bar").unwrap();
        assert_eq!(
            pattern,
            Pattern::single(LocationPath {
                anchor: Anchor::Context,
                steps: vec![child_step("foo"), child_step("bar")],
            })
        );
    }

    #[test]
    fn test_absolute_and_descendant_paths() {
        let pattern = parse_select("//foo").unwrap();
        assert_eq!(
            pattern,
            Pattern::single(LocationPath {
                anchor: Anchor::Root,
                steps: vec![Step::descendant_gap(), child_step("foo")],
            })
        );

        let root_only = parse_select("/").unwrap();
        assert_eq!(
            root_only,
            Pattern::single(LocationPath {
                anchor: Anchor::Root,
                steps: vec![],
            })
        );
    }

    #[test]
    fn test_axes() {
        let pattern = parse_select("ancestor-or-self::section").unwrap();
        assert_eq!(pattern.paths[0].steps[0].axis, Axis::AncestorOrSelf);

        let pattern = parse_select("preceding-sibling::*").unwrap();
        assert_eq!(pattern.paths[0].steps[0].axis, Axis::PrecedingSibling);
        assert_eq!(pattern.paths[0].steps[0].node_test, NodeTest::Wildcard);

        let err = parse_select("sideways::foo").unwrap_err();
        match err {
            XPathError::Syntax { message, .. } => assert!(message.contains("unknown axis")),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_node_type_tests() {
        let pattern = parse_select("foo/text()").unwrap();
        assert_eq!(
            pattern.paths[0].steps[1].node_test,
            NodeTest::NodeType(NodeTypeTest::Text)
        );

        let pattern = parse_select("processing-instruction('page')").unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::PiTarget("page".to_string())
        );

        let pattern = parse_select("self::node()").unwrap();
        assert_eq!(pattern.paths[0].steps[0].axis, Axis::SelfAxis);
    }

    #[test]
    fn test_namespace_node_tests() {
        let ns = NamespaceContext::new().with_binding("fig", "urn:figures");
        let pattern = parse_select_with("fig:image", &ns, None).unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::Qualified {
                uri: "urn:figures".to_string(),
                local: "image".to_string(),
            }
        );

        let pattern = parse_select_with("fig:*", &ns, None).unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::NamespaceWildcard {
                prefix: "fig".to_string(),
                uri: Some("urn:figures".to_string()),
            }
        );

        let pattern = parse_select("{urn:direct}thing").unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::Qualified {
                uri: "urn:direct".to_string(),
                local: "thing".to_string(),
            }
        );

        // unresolved prefixes keep the display name
        let pattern = parse_select("fig:image").unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::Name("fig:image".to_string())
        );
    }

    #[test]
    fn test_operator_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expression::Binary {
                op: BinaryOperator::Plus,
                left: Box::new(Expression::Long(1)),
                right: Box::new(Expression::Binary {
                    op: BinaryOperator::Multiply,
                    left: Box::new(Expression::Long(2)),
                    right: Box::new(Expression::Long(3)),
                }),
            }
        );
    }

    #[test]
    fn test_boolean_precedence() {
        let expr = parse_expression("a = 1 or b = 2 and c = 3").unwrap();
        match expr {
            Expression::Binary {
                op: BinaryOperator::Or,
                right,
                ..
            } => match *right {
                Expression::Binary {
                    op: BinaryOperator::And,
                    ..
                } => {}
                other => panic!("expected and under or, got {:?}", other),
            },
            other => panic!("expected or at top, got {:?}", other),
        }
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(parse_expression("42").unwrap(), Expression::Long(42));
        assert_eq!(parse_expression("3.5").unwrap(), Expression::Double(3.5));
        assert_eq!(parse_expression(".5").unwrap(), Expression::Double(0.5));
        assert_eq!(parse_expression("2e3").unwrap(), Expression::Double(2000.0));
        assert_eq!(
            parse_expression("1.5e-2").unwrap(),
            Expression::Double(0.015)
        );
    }

    #[test]
    fn test_string_literals_with_doubled_quotes() {
        assert_eq!(
            parse_expression("'it''s'").unwrap(),
            Expression::Literal("it's".to_string())
        );
        assert_eq!(
            parse_expression("\"say \"\"hi\"\"\"").unwrap(),
            Expression::Literal("say \"hi\"".to_string())
        );
        assert!(parse_expression("'unterminated").is_err());
    }

    #[test]
    fn test_quo_and_div() {
        let expr = parse_expression("7 quo 2").unwrap();
        assert!(matches!(
            expr,
            Expression::Binary {
                op: BinaryOperator::Quotient,
                ..
            }
        ));

        // `division` is a name, not the div operator
        assert!(parse_expression("7 division 2").is_err());
    }

    #[test]
    fn test_unary_keywords() {
        let expr = parse_expression("empty $x").unwrap();
        assert!(matches!(
            expr,
            Expression::Unary {
                op: UnaryOperator::Empty,
                ..
            }
        ));

        let expr = parse_expression("not(true())").unwrap();
        assert!(matches!(
            expr,
            Expression::Unary {
                op: UnaryOperator::Not,
                ..
            }
        ));

        // a lone `empty` is an element name
        let expr = parse_expression("empty").unwrap();
        assert!(matches!(expr, Expression::NodeSet(_)));
    }

    #[test]
    fn test_ternary() {
        let expr = parse_expression("$x > 1 ? 'many' : 'one'").unwrap();
        assert!(matches!(expr, Expression::Conditional { .. }));

        let expr = parse_expression("if($x > 1, 'many', 'one')").unwrap();
        assert!(matches!(expr, Expression::Conditional { .. }));

        let err = parse_expression("if($x, 1)").unwrap_err();
        assert!(matches!(err, XPathError::Syntax { .. }));
    }

    #[test]
    fn test_function_calls_lower_to_builtins() {
        let expr = parse_expression("starts-with($s, 'a')").unwrap();
        assert!(matches!(
            expr,
            Expression::Builtin(Builtin::StartsWith, _)
        ));

        let expr = parse_expression("mystery(1, 2)").unwrap();
        assert!(matches!(expr, Expression::Function { .. }));
    }

    #[test]
    fn test_function_vs_node_test_collision() {
        // bare text() is a node test
        let expr = parse_expression("text()").unwrap();
        assert!(matches!(expr, Expression::NodeSet(_)));

        // position() is a function even though it could look like a step
        let expr = parse_expression("position()").unwrap();
        assert!(matches!(expr, Expression::Builtin(Builtin::Position, _)));

        // an axis prefix forces the node-test reading
        let pattern = parse_select("self::text()").unwrap();
        assert_eq!(
            pattern.paths[0].steps[0].node_test,
            NodeTest::NodeType(NodeTypeTest::Text)
        );
    }

    #[test]
    fn test_primary_continued_as_path() {
        let expr = parse_expression("$doc/chapter[1]").unwrap();
        let Expression::NodeSet(pattern) = expr else {
            panic!("expected node-set");
        };
        assert!(matches!(pattern.paths[0].anchor, Anchor::Expr(_)));
        assert_eq!(pattern.paths[0].steps.len(), 1);

        let expr = parse_expression("mystery()[2]").unwrap();
        let Expression::NodeSet(pattern) = expr else {
            panic!("expected node-set");
        };
        assert_eq!(pattern.paths[0].steps[0].axis, Axis::SelfAxis);
        assert_eq!(pattern.paths[0].steps[0].predicates, vec![Expression::Long(2)]);
    }

    #[test]
    fn test_union() {
        let expr = parse_expression("a|b|c").unwrap();
        let Expression::NodeSet(pattern) = expr else {
            panic!("expected node-set");
        };
        assert_eq!(pattern.paths.len(), 3);
    }

    #[test]
    fn test_match_patterns_are_unanchored() {
        let pattern = parse_match("chapter/para").unwrap();
        assert_eq!(pattern.paths[0].anchor, Anchor::Any);

        let pattern = parse_match("/chapter").unwrap();
        assert_eq!(pattern.paths[0].anchor, Anchor::Root);
    }

    #[test]
    fn test_unconsumed_input_is_an_error() {
        let err = parse_expression("1 + 2 )").unwrap_err();
        match err {
            XPathError::Syntax { position, .. } => assert_eq!(position, 6),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_extension_resolution() {
        use crate::functions::ExtensionKind;

        let mut signatures = ExtensionSignatures::new();
        signatures.declare("{urn:demo}parse", ExtensionKind::Static, 1);
        signatures.declare("fn:trace", ExtensionKind::Static, 2);
        let ns = NamespaceContext::new().with_binding("d", "urn:demo");

        let expr =
            parse_expression_with("d:parse('x')", &ns, Some(&signatures)).unwrap();
        match expr {
            Expression::Extension { key, kind, .. } => {
                assert_eq!(key, "{urn:demo}parse");
                assert_eq!(kind, ExtensionKind::Static);
            }
            other => panic!("expected extension, got {:?}", other),
        }

        let expr =
            parse_expression_with("fn:trace('x', 1)", &ns, Some(&signatures)).unwrap();
        assert!(matches!(expr, Expression::Extension { .. }));

        // arity mismatch is a parse-time failure
        let err = parse_expression_with("d:parse('x', 'y')", &ns, Some(&signatures)).unwrap_err();
        assert!(matches!(err, XPathError::ExtensionResolution { .. }));

        // resolvable prefix with no signature is a parse-time failure
        let err = parse_expression_with("d:gone()", &ns, Some(&signatures)).unwrap_err();
        assert!(matches!(err, XPathError::ExtensionResolution { .. }));

        // unresolvable prefix defers to the evaluation-time table
        let expr = parse_expression_with("other:fun()", &ns, Some(&signatures)).unwrap();
        assert!(matches!(expr, Expression::Function { .. }));
    }

    #[test]
    fn test_current_anchor() {
        let pattern = parse_select("current()/para").unwrap();
        assert_eq!(pattern.paths[0].anchor, Anchor::Current);
        assert_eq!(pattern.paths[0].steps, vec![child_step("para")]);
    }

    #[test]
    fn test_template_parsing() {
        let expr = parse_template("hello {name}, {{literal}}").unwrap();
        let Expression::Interpolation(parts) = expr else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Expression::Literal("hello ".to_string()));
        assert!(matches!(parts[1], Expression::NodeSet(_)));
        assert_eq!(parts[2], Expression::Literal(", {literal}".to_string()));

        let plain = parse_template("no expressions").unwrap();
        assert_eq!(plain, Expression::Literal("no expressions".to_string()));

        assert!(parse_template("broken {oops").is_err());
    }

    #[test]
    fn test_round_trip_through_source_form() {
        let queries = [
            "foo/bar",
            "//para[2]",
            "chapter[@id = 'c1']/para",
            "1 + 2 * 3",
            "(1 + 2) * 3",
            "7 div 2 = 3.5 or 7 quo 2 = 3",
            "not($x) and empty $y",
            "$cond ? concat('a', 'b') : substring('abc', 2)",
            "ancestor-or-self::section[position() = last()]",
            "a|b|chapter/para",
            "self::text()",
            "processing-instruction('page')",
            "-3.5e2",
            "'it''s'",
            "current()/para",
            "id('c1 c2')",
        ];
        for query in queries {
            let first = parse_expression(query).unwrap();
            let reparsed = parse_expression(&first.to_string())
                .unwrap_or_else(|e| panic!("'{}' -> '{}' failed: {}", query, first, e));
            assert_eq!(first, reparsed, "round trip changed '{}'", query);
        }
    }
}
