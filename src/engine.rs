//! The evaluation engine: the loosely-typed value model and the interpreter
//! for compiled expressions and patterns.

use crate::ast::{Anchor, Axis, Expression, LocationPath, NodeTest, NodeTypeTest, Pattern, Step};
use crate::datasource::{DataSourceNode, NodeType};
use crate::env::Environment;
use crate::error::XPathError;
use crate::{axes, functions, operators};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

/// The result of evaluating an expression.
///
/// The engine is loosely typed: every value coerces to every scalar category
/// following the XPath 1.0 rules, extended with exact-decimal and integral
/// arms for the host arithmetic (see `operators`).
#[derive(Debug, Clone, PartialEq)]
pub enum XPathValue<N> {
    /// Absent value, distinct from the empty string and from an unresolved
    /// variable (the latter never reaches a value).
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    NodeSet(Vec<N>),
}

pub(crate) fn string_to_number(s: &str) -> f64 {
    s.trim().parse().unwrap_or(f64::NAN)
}

/// Formats a double per the XPath display rule: integral values print
/// without a fractional part.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl<'a, N: DataSourceNode<'a>> XPathValue<N> {
    /// Boolean coercion: absent/zero/NaN/empty are false.
    pub fn to_bool(&self) -> bool {
        match self {
            XPathValue::Null => false,
            XPathValue::Boolean(b) => *b,
            XPathValue::Long(v) => *v != 0,
            XPathValue::Double(d) => *d != 0.0 && !d.is_nan(),
            XPathValue::Decimal(d) => !d.is_zero(),
            XPathValue::String(s) => !s.is_empty(),
            XPathValue::NodeSet(nodes) => !nodes.is_empty(),
        }
    }

    /// Numeric coercion: strings parse as doubles (non-parseable is NaN),
    /// a node-set coerces through its first node's string value.
    pub fn to_number(&self) -> f64 {
        match self {
            XPathValue::Null => 0.0,
            XPathValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            XPathValue::Long(v) => *v as f64,
            XPathValue::Double(d) => *d,
            XPathValue::Decimal(d) => d.to_string().parse().unwrap_or(f64::NAN),
            XPathValue::String(s) => string_to_number(s),
            XPathValue::NodeSet(nodes) => match nodes.first() {
                Some(n) => string_to_number(&n.string_value()),
                None => f64::NAN,
            },
        }
    }

    /// Integral coercion: non-integral inputs truncate through the double
    /// representation, so `'1.0'` coerces to `1`.
    pub fn to_long(&self) -> i64 {
        match self {
            XPathValue::Long(v) => *v,
            _ => {
                let d = self.to_number();
                if d.is_nan() { 0 } else { d.trunc() as i64 }
            }
        }
    }

    /// Exact-decimal coercion for the high-precision arithmetic arm.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            XPathValue::Null => Some(Decimal::ZERO),
            XPathValue::Boolean(b) => Some(Decimal::from(if *b { 1i64 } else { 0i64 })),
            XPathValue::Long(v) => Some(Decimal::from(*v)),
            XPathValue::Double(d) => Decimal::from_f64(*d),
            XPathValue::Decimal(d) => Some(*d),
            XPathValue::String(s) => s.trim().parse().ok(),
            XPathValue::NodeSet(nodes) => nodes
                .first()
                .and_then(|n| n.string_value().trim().parse().ok()),
        }
    }

    /// True for the values the `empty` operator accepts: absent values, the
    /// empty string and the empty node-set.
    pub fn is_empty_value(&self) -> bool {
        match self {
            XPathValue::Null => true,
            XPathValue::String(s) => s.is_empty(),
            XPathValue::NodeSet(nodes) => nodes.is_empty(),
            _ => false,
        }
    }

    pub fn first_node(&self) -> Option<N> {
        match self {
            XPathValue::NodeSet(nodes) => nodes.first().copied(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            XPathValue::Long(_) | XPathValue::Double(_) | XPathValue::Decimal(_)
        )
    }
}

impl<'a, N: DataSourceNode<'a>> fmt::Display for XPathValue<N> {
    /// String coercion per XPath 1.0: first node's string value for
    /// node-sets, integral doubles print without a trailing `.0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XPathValue::Null => Ok(()),
            XPathValue::Boolean(b) => write!(f, "{}", b),
            XPathValue::Long(v) => write!(f, "{}", v),
            XPathValue::Double(d) => write!(f, "{}", format_number(*d)),
            XPathValue::Decimal(d) => write!(f, "{}", d),
            XPathValue::String(s) => write!(f, "{}", s),
            XPathValue::NodeSet(nodes) => write!(
                f,
                "{}",
                nodes.first().map(|n| n.string_value()).unwrap_or_default()
            ),
        }
    }
}

/// All state needed while evaluating one expression: the context node, its
/// position/size in the current candidate list, the document root, and the
/// variable environment.
///
/// `'a` is the data source lifetime, `'d` the lifetime of the evaluation.
pub struct EvaluationContext<'a, 'd, N: DataSourceNode<'a>> {
    pub context_node: N,
    pub root_node: N,
    /// 1-based position within the current candidate list.
    pub context_position: usize,
    pub context_size: usize,
    pub env: &'d Environment<'a, N>,
    _marker: PhantomData<&'a ()>,
}

impl<'a, 'd, N: DataSourceNode<'a>> EvaluationContext<'a, 'd, N> {
    pub fn new(
        context_node: N,
        root_node: N,
        context_position: usize,
        context_size: usize,
        env: &'d Environment<'a, N>,
    ) -> Self {
        Self {
            context_node,
            root_node,
            context_position,
            context_size,
            env,
            _marker: PhantomData,
        }
    }

    /// A context for one candidate of a predicate list, sharing everything
    /// but the focus.
    fn at(&self, node: N, position: usize, size: usize) -> Self {
        Self::new(node, self.root_node, position, size, self.env)
    }
}

/// Walks to the top of the tree containing `node`.
pub fn document_root<'a, N: DataSourceNode<'a>>(node: N) -> N {
    let mut current = node;
    while let Some(parent) = current.parent() {
        current = parent;
    }
    current
}

/// Evaluates an expression to a value.
pub fn evaluate<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match expr {
        Expression::Literal(s) => Ok(XPathValue::String(s.clone())),
        Expression::Long(v) => Ok(XPathValue::Long(*v)),
        Expression::Double(d) => Ok(XPathValue::Double(*d)),
        Expression::Variable(name) => Ok(e_ctx.env.get_var(name).unwrap_or(XPathValue::Null)),
        Expression::Builtin(builtin, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, e_ctx)?);
            }
            functions::evaluate_builtin(*builtin, evaluated, e_ctx)
        }
        Expression::Function { name, args } => {
            let fun = e_ctx
                .env
                .function(name)
                .ok_or_else(|| XPathError::UnknownFunction(name.clone()))?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, e_ctx)?);
            }
            fun.call(evaluated)
        }
        Expression::Extension { name, key, args, .. } => {
            let invoker = e_ctx.env.extension(key).ok_or_else(|| {
                XPathError::Evaluation(format!(
                    "extension function '{}' is not registered on this environment",
                    name
                ))
            })?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, e_ctx)?);
            }
            invoker.call(evaluated)
        }
        Expression::Binary { op, left, right } => {
            let left_val = evaluate(left, e_ctx)?;
            let right_val = evaluate(right, e_ctx)?;
            operators::evaluate_binary(*op, left_val, right_val)
        }
        Expression::Unary { op, expr } => {
            let val = evaluate(expr, e_ctx)?;
            operators::evaluate_unary(*op, val)
        }
        Expression::Conditional {
            cond,
            then,
            otherwise,
        } => {
            // only the taken branch is evaluated, for every result type
            if evaluate(cond, e_ctx)?.to_bool() {
                evaluate(then, e_ctx)
            } else {
                evaluate(otherwise, e_ctx)
            }
        }
        Expression::Interpolation(_) => {
            let mut out = String::new();
            evaluate_string_into(expr, e_ctx, &mut out)?;
            Ok(XPathValue::String(out))
        }
        Expression::NodeSet(pattern) => {
            Ok(XPathValue::NodeSet(select_pattern(pattern, e_ctx)?))
        }
    }
}

pub fn evaluate_boolean<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    Ok(evaluate(expr, e_ctx)?.to_bool())
}

pub fn evaluate_number<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<f64, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    Ok(evaluate(expr, e_ctx)?.to_number())
}

pub fn evaluate_string<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<String, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let mut out = String::new();
    evaluate_string_into(expr, e_ctx, &mut out)?;
    Ok(out)
}

/// Streams the string value of an expression into `out`. Interpolation
/// chains append segment by segment without materializing an intermediate
/// string per segment.
pub fn evaluate_string_into<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
    out: &mut String,
) -> Result<(), XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match expr {
        Expression::Literal(s) => {
            out.push_str(s);
            Ok(())
        }
        Expression::Interpolation(parts) => {
            for part in parts {
                evaluate_string_into(part, e_ctx, out)?;
            }
            Ok(())
        }
        Expression::Conditional {
            cond,
            then,
            otherwise,
        } => {
            if evaluate(cond, e_ctx)?.to_bool() {
                evaluate_string_into(then, e_ctx, out)
            } else {
                evaluate_string_into(otherwise, e_ctx, out)
            }
        }
        _ => {
            match evaluate(expr, e_ctx)? {
                XPathValue::String(s) => out.push_str(&s),
                value => out.push_str(&value.to_string()),
            }
            Ok(())
        }
    }
}

pub fn evaluate_node_set<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match evaluate(expr, e_ctx)? {
        XPathValue::NodeSet(nodes) => Ok(nodes),
        other => Err(XPathError::Type(format!(
            "expected a node-set, got {:?}",
            other
        ))),
    }
}

/// Evaluates a select pattern against the context, returning matches in
/// document order. Union branches are merged, deduplicated and sorted by
/// document position.
pub fn select_pattern<'a, N>(
    pattern: &Pattern,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    if pattern.paths.len() == 1 {
        return evaluate_location_path(&pattern.paths[0], e_ctx);
    }

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for path in &pattern.paths {
        for node in evaluate_location_path(path, e_ctx)? {
            if seen.insert(node) {
                merged.push(node);
            }
        }
    }
    merged.sort();
    Ok(merged)
}

fn evaluate_location_path<'a, N>(
    path: &LocationPath,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let initial = match &path.anchor {
        Anchor::Context | Anchor::Any => vec![e_ctx.context_node],
        Anchor::Root => vec![e_ctx.root_node],
        Anchor::Current => vec![
            e_ctx
                .env
                .current_node()
                .unwrap_or(e_ctx.context_node),
        ],
        Anchor::Expr(expr) => match evaluate(expr, e_ctx)? {
            XPathValue::NodeSet(nodes) => nodes,
            // a scalar start point yields no nodes
            _ => return Ok(vec![]),
        },
    };

    let mut current = initial;
    for step in &path.steps {
        current = evaluate_step(step, &current, e_ctx)?;
    }
    Ok(current)
}

/// One step: collect along the axis, filter by node test, apply predicates.
fn evaluate_step<'a, N>(
    step: &Step,
    context_nodes: &[N],
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let collected = collect_axis(step.axis, context_nodes);
    let tested: Vec<N> = collected
        .into_iter()
        .filter(|&node| node_test_matches(node, &step.node_test, step.axis))
        .collect();
    apply_predicates(&tested, &step.predicates, e_ctx)
}

fn collect_axis<'a, N>(axis: Axis, context_nodes: &[N]) -> Vec<N>
where
    N: DataSourceNode<'a> + 'a,
{
    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for &node in context_nodes {
        match axis {
            Axis::Ancestor => axes::collect_ancestors(node, &mut seen, &mut results),
            Axis::AncestorOrSelf => axes::collect_ancestors_or_self(node, &mut seen, &mut results),
            Axis::Attribute => axes::collect_attributes(node, &mut seen, &mut results),
            Axis::Child => axes::collect_children(node, &mut seen, &mut results),
            Axis::Descendant => axes::collect_descendants(node, &mut seen, &mut results),
            Axis::DescendantOrSelf => {
                axes::collect_descendants_or_self(node, &mut seen, &mut results)
            }
            Axis::Following => axes::collect_following(node, &mut seen, &mut results),
            Axis::FollowingSibling => {
                axes::collect_following_siblings(node, &mut seen, &mut results)
            }
            Axis::Namespace => axes::collect_namespaces(node, &mut seen, &mut results),
            Axis::Parent => axes::collect_parent(node, &mut seen, &mut results),
            Axis::Preceding => axes::collect_preceding(node, &mut seen, &mut results),
            Axis::PrecedingSibling => {
                axes::collect_preceding_siblings(node, &mut seen, &mut results)
            }
            Axis::SelfAxis => axes::collect_self(node, &mut seen, &mut results),
        }
    }
    results
}

/// The principal node kind of an axis: attributes for the attribute and
/// namespace axes, elements otherwise.
fn principal_node_type(axis: Axis) -> NodeType {
    match axis {
        Axis::Attribute | Axis::Namespace => NodeType::Attribute,
        _ => NodeType::Element,
    }
}

pub(crate) fn node_test_matches<'a, N>(node: N, test: &NodeTest, axis: Axis) -> bool
where
    N: DataSourceNode<'a> + 'a,
{
    let principal = principal_node_type(axis);
    match test {
        NodeTest::Wildcard => node.node_type() == principal,
        NodeTest::Name(name) => {
            node.node_type() == principal
                && node.name().is_some_and(|q| {
                    if name.contains(':') {
                        q.qualified() == *name
                    } else {
                        q.prefix.is_none() && q.local_part == name
                    }
                })
        }
        NodeTest::NamespaceWildcard { prefix, uri } => {
            node.node_type() == principal
                && node.name().is_some_and(|q| match uri {
                    Some(uri) => q.namespace == Some(uri.as_str()),
                    None => q.prefix == Some(prefix.as_str()),
                })
        }
        NodeTest::Qualified { uri, local } => {
            node.node_type() == principal
                && node
                    .name()
                    .is_some_and(|q| q.namespace == Some(uri.as_str()) && q.local_part == local)
        }
        NodeTest::NodeType(test) => match test {
            NodeTypeTest::Text => node.node_type() == NodeType::Text,
            NodeTypeTest::Comment => node.node_type() == NodeType::Comment,
            NodeTypeTest::ProcessingInstruction => {
                node.node_type() == NodeType::ProcessingInstruction
            }
            NodeTypeTest::EntityReference => node.node_type() == NodeType::EntityReference,
            NodeTypeTest::Node => true,
        },
        NodeTest::PiTarget(target) => {
            node.node_type() == NodeType::ProcessingInstruction
                && node.name().is_some_and(|q| q.local_part == target)
        }
    }
}

/// Applies predicates in sequence. Each predicate re-evaluates position and
/// size relative to the surviving candidate list; a numeric predicate keeps
/// only the candidate whose position equals the number.
fn apply_predicates<'a, N>(
    nodes: &[N],
    predicates: &[Expression],
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let mut current = nodes.to_vec();
    for predicate in predicates {
        let size = current.len();
        let mut surviving = Vec::new();
        for (i, node) in current.iter().enumerate() {
            let candidate_ctx = e_ctx.at(*node, i + 1, size);
            let value = evaluate(predicate, &candidate_ctx)?;
            let keep = if value.is_numeric() {
                value.to_number() == (i + 1) as f64
            } else {
                value.to_bool()
            };
            if keep {
                surviving.push(*node);
            }
        }
        current = surviving;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::{MockNode, MockTree, sample_tree};
    use crate::parser::{parse_expression, parse_select};

    fn ctx<'a, 'd>(
        tree: &'a MockTree<'a>,
        env: &'d Environment<'a, MockNode<'a>>,
    ) -> EvaluationContext<'a, 'd, MockNode<'a>> {
        EvaluationContext::new(tree.root(), tree.root(), 1, 1, env)
    }

    #[test]
    fn test_value_coercions() {
        type V = XPathValue<MockNode<'static>>;
        assert!(!V::Null.to_bool());
        assert!(!V::Double(f64::NAN).to_bool());
        assert!(!V::String(String::new()).to_bool());
        assert!(V::String("abc".into()).to_bool());
        assert_eq!(V::Null.to_number(), 0.0);
        assert_eq!(V::String(" 1.5 ".into()).to_number(), 1.5);
        assert!(V::String("abc".into()).to_number().is_nan());
        assert_eq!(V::String("1.0".into()).to_long(), 1);
        assert_eq!(V::Double(3.0).to_string(), "3");
        assert_eq!(V::Double(3.5).to_string(), "3.5");
        assert_eq!(V::Double(f64::INFINITY).to_string(), "Infinity");
    }

    #[test]
    fn test_select_child_paths() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("chapter/para").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(5), tree.node(7), tree.node(14)]);
    }

    #[test]
    fn test_select_with_positional_predicate() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("chapter[1]/para[2]").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(7)]);
    }

    #[test]
    fn test_select_with_attribute_predicate() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("chapter[@id = 'c2']").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(12)]);
    }

    #[test]
    fn test_select_last_predicate() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("chapter[1]/*[last()]").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(9)]);
    }

    #[test]
    fn test_union_is_document_ordered() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        // note appears before para in the query but after it in the document
        let pattern = parse_select("chapter/note|chapter/para").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(
            nodes,
            vec![tree.node(5), tree.node(7), tree.node(9), tree.node(14)]
        );
    }

    #[test]
    fn test_descendant_shorthand() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("//para").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(5), tree.node(7), tree.node(14)]);
    }

    #[test]
    fn test_text_node_test() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let pattern = parse_select("chapter/para/text()").unwrap();
        let nodes = select_pattern(&pattern, &e_ctx).unwrap();
        assert_eq!(nodes, vec![tree.node(6), tree.node(8), tree.node(15)]);
    }

    #[test]
    fn test_conditional_short_circuits() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        // the untaken branch calls an unknown function and would error
        let expr = parse_expression("1 = 1 ? 'yes' : mystery()").unwrap();
        let value = evaluate(&expr, &e_ctx).unwrap();
        assert_eq!(value.to_string(), "yes");

        let expr = parse_expression("1 = 2 ? mystery() : 'no'").unwrap();
        let value = evaluate(&expr, &e_ctx).unwrap();
        assert_eq!(value.to_string(), "no");
    }

    #[test]
    fn test_variable_lookup_and_unresolved_reads_as_null() {
        let tree = sample_tree();
        let mut env = Environment::new();
        env.add_var("answer", XPathValue::Long(42));
        let e_ctx = ctx(&tree, &env);

        let expr = parse_expression("$answer + 1").unwrap();
        assert_eq!(evaluate(&expr, &e_ctx).unwrap(), XPathValue::Long(43));

        let expr = parse_expression("$missing").unwrap();
        assert_eq!(evaluate(&expr, &e_ctx).unwrap(), XPathValue::Null);
    }

    #[test]
    fn test_path_from_variable_node_set() {
        let tree = sample_tree();
        let mut env = Environment::new();
        env.add_var("chapters", XPathValue::NodeSet(vec![tree.node(12)]));
        let e_ctx = ctx(&tree, &env);

        let expr = parse_expression("$chapters/para").unwrap();
        let value = evaluate(&expr, &e_ctx).unwrap();
        assert_eq!(value, XPathValue::NodeSet(vec![tree.node(14)]));
    }

    #[test]
    fn test_interpolation_streams_segments() {
        let tree = sample_tree();
        let env = Environment::new();
        let e_ctx = ctx(&tree, &env);

        let expr = crate::parser::parse_template("first: {chapter[1]/para[1]}!").unwrap();
        let mut out = String::new();
        evaluate_string_into(&expr, &e_ctx, &mut out).unwrap();
        assert_eq!(out, "first: alpha!");
    }
}
