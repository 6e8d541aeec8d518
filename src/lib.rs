//! An XPath 1.0-style query engine over pluggable tree data sources.
//!
//! Queries are compiled to immutable ASTs (cached per scope in bounded LRU
//! caches) and evaluated against any tree implementing [`DataSourceNode`].
//! The expression language follows XPath 1.0 coercion semantics with a few
//! host extensions: `quo` truncating division, a ternary conditional, the
//! `not`/`empty` unary operators and `{expr}` templates.

pub mod ast;
pub mod axes;
pub mod cache;
pub mod datasource;
pub mod engine;
pub mod env;
pub mod error;
pub mod functions;
pub mod namespace;
pub mod operators;
pub mod parser;
pub mod pattern;
pub mod query;

pub use ast::{
    Anchor, Axis, BinaryOperator, Expression, LocationPath, NodeTest, NodeTypeTest, Pattern, Step,
    UnaryOperator,
};
pub use datasource::{DataSourceNode, NodeType, QName};
pub use engine::{EvaluationContext, XPathValue, evaluate};
pub use env::{Environment, VariableResolver};
pub use error::XPathError;
pub use functions::{Builtin, ExtensionKind, ExtensionRegistry, ExtensionSignatures, XPathFun};
pub use namespace::NamespaceContext;
pub use parser::{parse_expression, parse_match, parse_select, parse_template};
pub use query::{
    Selected, XPath, create_environment, create_environment_with_globals, eval_boolean,
    eval_number, eval_string, eval_value, find, select,
};
