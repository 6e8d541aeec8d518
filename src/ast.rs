//! The abstract syntax tree for compiled queries.
//!
//! Every node is immutable once constructed. Each variant has a canonical
//! source form (`Display`) that re-parses to a behaviorally identical tree;
//! the source form is used for diagnostics and cache inspection, never for
//! evaluation dispatch.

use crate::functions::{Builtin, ExtensionKind};
use std::fmt;

/// An evaluable expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A string literal.
    Literal(String),
    /// An integral number literal.
    Long(i64),
    /// A fractional or exponent-form number literal.
    Double(f64),
    /// A `$name` variable reference.
    Variable(String),
    /// A call to a library function, lowered to a [`Builtin`] at parse time.
    Builtin(Builtin, Vec<Expression>),
    /// A deferred function call resolved through the environment's function
    /// table at evaluation time.
    Function { name: String, args: Vec<Expression> },
    /// A namespace-qualified extension function resolved against the
    /// registry at parse time. `key` is the registry key; the invoker is
    /// looked up on the evaluating environment.
    Extension {
        name: String,
        key: String,
        kind: ExtensionKind,
        args: Vec<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// `cond ? then : otherwise` (also produced by `if(c, a, b)`).
    /// Only the taken branch is evaluated.
    Conditional {
        cond: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    /// A `{expr}` template: literal and expression segments concatenated
    /// lazily, streamable into a caller's buffer.
    Interpolation(Vec<Expression>),
    /// A pattern used where a scalar may be expected; coerced per context.
    NodeSet(Pattern),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Or,
    And,
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Plus,
    Minus,
    Multiply,
    Divide,
    /// Truncating integer division (`quo`), an extension over XPath 1.0.
    Quotient,
    Modulo,
}

impl BinaryOperator {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Or => "or",
            BinaryOperator::And => "and",
            BinaryOperator::Equals => "=",
            BinaryOperator::NotEquals => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "div",
            BinaryOperator::Quotient => "quo",
            BinaryOperator::Modulo => "mod",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Equals
            | BinaryOperator::NotEquals
            | BinaryOperator::LessThan
            | BinaryOperator::LessThanOrEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanOrEqual => 3,
            BinaryOperator::Plus | BinaryOperator::Minus => 4,
            BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Quotient
            | BinaryOperator::Modulo => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
    Not,
    /// True for null, the empty string and the empty node-set.
    Empty,
}

/// A compiled pattern: one or more location paths joined by `|`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub paths: Vec<LocationPath>,
}

impl Pattern {
    pub fn single(path: LocationPath) -> Self {
        Pattern { paths: vec![path] }
    }

    /// True if every branch only walks upward from its anchor. Ascending
    /// patterns can be evaluated without computing context position/size
    /// for a candidate list.
    pub fn is_ascending(&self) -> bool {
        self.paths.iter().all(LocationPath::is_ascending)
    }
}

/// Where a location path starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Anchor {
    /// The supplied context node (select patterns).
    Context,
    /// The document root (`/...`).
    Root,
    /// Any ancestor (match patterns, which are anchored nowhere).
    Any,
    /// The environment's current node (`current()`).
    Current,
    /// The node-set value of an arbitrary expression (`(expr)/...`).
    Expr(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    pub anchor: Anchor,
    pub steps: Vec<Step>,
}

impl LocationPath {
    pub fn is_ascending(&self) -> bool {
        !matches!(self.anchor, Anchor::Expr(_)) && self.steps.iter().all(|s| s.axis.is_ascending())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub node_test: NodeTest,
    pub predicates: Vec<Expression>,
}

impl Step {
    pub fn new(axis: Axis, node_test: NodeTest) -> Self {
        Step {
            axis,
            node_test,
            predicates: vec![],
        }
    }

    /// The `//` separator compiles to this step between the surrounding ones.
    pub fn descendant_gap() -> Self {
        Step::new(Axis::DescendantOrSelf, NodeTest::NodeType(NodeTypeTest::Node))
    }

    pub fn is_descendant_gap(&self) -> bool {
        self.axis == Axis::DescendantOrSelf
            && self.node_test == NodeTest::NodeType(NodeTypeTest::Node)
            && self.predicates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Ancestor,
    AncestorOrSelf,
    Attribute,
    Child,
    Descendant,
    DescendantOrSelf,
    Following,
    FollowingSibling,
    Namespace,
    Parent,
    Preceding,
    PrecedingSibling,
    SelfAxis,
}

impl Axis {
    pub fn keyword(&self) -> &'static str {
        match self {
            Axis::Ancestor => "ancestor",
            Axis::AncestorOrSelf => "ancestor-or-self",
            Axis::Attribute => "attribute",
            Axis::Child => "child",
            Axis::Descendant => "descendant",
            Axis::DescendantOrSelf => "descendant-or-self",
            Axis::Following => "following",
            Axis::FollowingSibling => "following-sibling",
            Axis::Namespace => "namespace",
            Axis::Parent => "parent",
            Axis::Preceding => "preceding",
            Axis::PrecedingSibling => "preceding-sibling",
            Axis::SelfAxis => "self",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Axis> {
        Some(match word {
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "attribute" => Axis::Attribute,
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "following" => Axis::Following,
            "following-sibling" => Axis::FollowingSibling,
            "namespace" => Axis::Namespace,
            "parent" => Axis::Parent,
            "preceding" => Axis::Preceding,
            "preceding-sibling" => Axis::PrecedingSibling,
            "self" => Axis::SelfAxis,
            _ => return None,
        })
    }

    fn is_ascending(&self) -> bool {
        matches!(
            self,
            Axis::SelfAxis | Axis::Parent | Axis::Ancestor | Axis::AncestorOrSelf
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// `*`
    Wildcard,
    /// An unqualified (or unresolvable-prefix) name, matched against the
    /// node's local name or `prefix:local` display form.
    Name(String),
    /// `prefix:*` - any local name inside the prefix's namespace.
    NamespaceWildcard { prefix: String, uri: Option<String> },
    /// `{uri}local`, or a prefixed name whose prefix the namespace context
    /// resolved at parse time.
    Qualified { uri: String, local: String },
    NodeType(NodeTypeTest),
    /// `processing-instruction('target')`
    PiTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTypeTest {
    Text,
    Comment,
    ProcessingInstruction,
    EntityReference,
    Node,
}

impl NodeTypeTest {
    fn name(&self) -> &'static str {
        match self {
            NodeTypeTest::Text => "text",
            NodeTypeTest::Comment => "comment",
            NodeTypeTest::ProcessingInstruction => "processing-instruction",
            NodeTypeTest::EntityReference => "entity-reference",
            NodeTypeTest::Node => "node",
        }
    }
}

// --- Canonical source forms ---

impl Expression {
    fn precedence(&self) -> u8 {
        match self {
            Expression::Conditional { .. } => 0,
            Expression::Binary { op, .. } => op.precedence(),
            Expression::Unary { .. } => 6,
            _ => 7,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[Expression]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

fn fmt_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "'")?;
    for ch in s.chars() {
        if ch == '\'' {
            write!(f, "''")?;
        } else {
            write!(f, "{}", ch)?;
        }
    }
    write!(f, "'")
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(s) => fmt_string_literal(f, s),
            Expression::Long(v) => write!(f, "{}", v),
            Expression::Double(v) => {
                if v.is_finite() && v.fract() == 0.0 {
                    // keep the fractional marker so the literal re-parses as
                    // a double, not a long
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Expression::Variable(name) => write!(f, "${}", name),
            Expression::Builtin(builtin, args) => {
                write!(f, "{}(", builtin.name())?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            Expression::Function { name, args } => {
                write!(f, "{}(", name)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            Expression::Extension { name, args, .. } => {
                write!(f, "{}(", name)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            Expression::Binary { op, left, right } => {
                let prec = op.precedence();
                left.fmt_operand(f, prec)?;
                write!(f, " {} ", op.symbol())?;
                // operators are left-associative; an equal-precedence right
                // operand needs parentheses to keep its grouping
                right.fmt_operand(f, prec + 1)
            }
            Expression::Unary { op, expr } => {
                match op {
                    UnaryOperator::Minus => write!(f, "-")?,
                    UnaryOperator::Not => write!(f, "not ")?,
                    UnaryOperator::Empty => write!(f, "empty ")?,
                }
                expr.fmt_operand(f, 6)
            }
            Expression::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.fmt_operand(f, 1)?;
                write!(f, " ? {} : {}", then, otherwise)
            }
            Expression::Interpolation(parts) => {
                for part in parts {
                    match part {
                        Expression::Literal(s) => {
                            for ch in s.chars() {
                                match ch {
                                    '{' => write!(f, "{{{{")?,
                                    '}' => write!(f, "}}}}")?,
                                    _ => write!(f, "{}", ch)?,
                                }
                            }
                        }
                        expr => write!(f, "{{{}}}", expr)?,
                    }
                }
                Ok(())
            }
            Expression::NodeSet(pattern) => write!(f, "{}", pattern),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, path) in self.paths.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", path)?;
        }
        Ok(())
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut need_sep = false;
        match &self.anchor {
            Anchor::Context | Anchor::Any => {}
            Anchor::Root => {
                write!(f, "/")?;
            }
            Anchor::Current => {
                write!(f, "current()")?;
                need_sep = true;
            }
            Anchor::Expr(expr) => {
                write!(f, "({})", expr)?;
                need_sep = true;
            }
        }
        if self.steps.is_empty() {
            if matches!(self.anchor, Anchor::Context | Anchor::Any) {
                write!(f, ".")?;
            }
            return Ok(());
        }
        for step in &self.steps {
            if need_sep {
                write!(f, "/")?;
            }
            write!(f, "{}", step)?;
            need_sep = true;
        }
        Ok(())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.axis {
            Axis::Child => {}
            Axis::Attribute => write!(f, "@")?,
            axis => write!(f, "{}::", axis.keyword())?,
        }
        write!(f, "{}", self.node_test)?;
        for pred in &self.predicates {
            write!(f, "[{}]", pred)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTest::Wildcard => write!(f, "*"),
            NodeTest::Name(name) => write!(f, "{}", name),
            NodeTest::NamespaceWildcard { prefix, .. } => write!(f, "{}:*", prefix),
            NodeTest::Qualified { uri, local } => write!(f, "{{{}}}{}", uri, local),
            NodeTest::NodeType(test) => write!(f, "{}()", test.name()),
            NodeTest::PiTarget(target) => {
                write!(f, "processing-instruction(")?;
                fmt_string_literal(f, target)?;
                write!(f, ")")
            }
        }
    }
}
