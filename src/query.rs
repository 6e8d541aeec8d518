//! The public query surface: one-shot helpers and the [`XPath`] handle that
//! ties a namespace context, an extension-signature set and a compiled-query
//! cache scope together.

use crate::ast::{Expression, Pattern};
use crate::cache::{self, CompiledQueries};
use crate::datasource::DataSourceNode;
use crate::engine::{self, EvaluationContext, XPathValue};
use crate::env::Environment;
use crate::error::XPathError;
use crate::functions::ExtensionSignatures;
use crate::namespace::NamespaceContext;
use std::collections::HashMap;
use std::sync::Arc;

/// A configured query engine. Cheap to clone conceptually; create one per
/// namespace context / cache scope and share it.
pub struct XPath {
    scope: Arc<CompiledQueries>,
    namespace: NamespaceContext,
    signatures: Option<ExtensionSignatures>,
}

impl Default for XPath {
    fn default() -> Self {
        Self::new()
    }
}

impl XPath {
    /// An engine over the process-default cache scope.
    pub fn new() -> Self {
        XPath {
            scope: cache::default_scope(),
            namespace: NamespaceContext::new(),
            signatures: None,
        }
    }

    /// An engine whose compiled queries are cached under `handle`, isolated
    /// from other scopes.
    pub fn with_scope(handle: &str) -> Self {
        XPath {
            scope: cache::cache_scope(handle),
            namespace: NamespaceContext::new(),
            signatures: None,
        }
    }

    pub fn with_namespace_context(mut self, namespace: NamespaceContext) -> Self {
        self.namespace = namespace;
        self
    }

    /// Adds one prefix binding, builder style.
    pub fn namespace(mut self, prefix: &str, uri: &str) -> Self {
        self.namespace.bind(prefix, uri);
        self
    }

    /// Declares the extension-function signatures available to the parser.
    pub fn with_extensions(mut self, signatures: ExtensionSignatures) -> Self {
        self.signatures = Some(signatures);
        self
    }

    // --- Compilation (cached) ---

    pub fn parse_select(&self, query: &str) -> Result<Arc<Pattern>, XPathError> {
        self.scope
            .select_pattern(query, &self.namespace, self.signatures.as_ref())
    }

    pub fn parse_match(&self, query: &str) -> Result<Arc<Pattern>, XPathError> {
        self.scope
            .match_pattern(query, &self.namespace, self.signatures.as_ref())
    }

    pub fn parse_expression(&self, query: &str) -> Result<Arc<Expression>, XPathError> {
        self.scope
            .expression(query, &self.namespace, self.signatures.as_ref())
    }

    // --- Selection ---

    /// The first node matching `query` in document order, or `None`.
    pub fn find<'a, N>(&self, query: &str, context: N) -> Result<Option<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.find_with_env(query, context, &env)
    }

    pub fn find_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<Option<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let pattern = self.parse_select(query)?;
        let e_ctx = eval_context(env, context);
        Ok(engine::select_pattern(&pattern, &e_ctx)?.into_iter().next())
    }

    /// All nodes matching `query`, as a finite single-pass iterator.
    pub fn select<'a, N>(&self, query: &str, context: N) -> Result<Selected<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.select_with_env(query, context, &env)
    }

    pub fn select_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<Selected<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let pattern = self.parse_select(query)?;
        let e_ctx = eval_context(env, context);
        Ok(Selected {
            nodes: engine::select_pattern(&pattern, &e_ctx)?.into_iter(),
        })
    }

    /// True if `node` matches the match pattern `query`.
    pub fn matches<'a, N>(&self, query: &str, node: N) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.matches_with_env(query, node, &env)
    }

    pub fn matches_with_env<'a, N>(
        &self,
        query: &str,
        node: N,
        env: &Environment<'a, N>,
    ) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let pattern = self.parse_match(query)?;
        pattern.matches(node, engine::document_root(node), env)
    }

    // --- Typed evaluation ---

    pub fn eval_string<'a, N>(&self, query: &str, context: N) -> Result<String, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.eval_string_with_env(query, context, &env)
    }

    pub fn eval_string_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<String, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let expr = self.parse_expression(query)?;
        engine::evaluate_string(&expr, &eval_context(env, context))
    }

    pub fn eval_number<'a, N>(&self, query: &str, context: N) -> Result<f64, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.eval_number_with_env(query, context, &env)
    }

    pub fn eval_number_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<f64, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let expr = self.parse_expression(query)?;
        engine::evaluate_number(&expr, &eval_context(env, context))
    }

    pub fn eval_boolean<'a, N>(&self, query: &str, context: N) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.eval_boolean_with_env(query, context, &env)
    }

    pub fn eval_boolean_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let expr = self.parse_expression(query)?;
        engine::evaluate_boolean(&expr, &eval_context(env, context))
    }

    /// Evaluates to the untyped value, preserving the result's category.
    pub fn eval_value<'a, N>(&self, query: &str, context: N) -> Result<XPathValue<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let env = Environment::new();
        self.eval_value_with_env(query, context, &env)
    }

    pub fn eval_value_with_env<'a, N>(
        &self,
        query: &str,
        context: N,
        env: &Environment<'a, N>,
    ) -> Result<XPathValue<N>, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        let expr = self.parse_expression(query)?;
        engine::evaluate(&expr, &eval_context(env, context))
    }
}

/// The nodes selected by a query: finite, document-ordered, single-pass.
/// Re-invoke `select` to traverse again.
pub struct Selected<N> {
    nodes: std::vec::IntoIter<N>,
}

impl<N> Iterator for Selected<N> {
    type Item = N;

    fn next(&mut self) -> Option<N> {
        self.nodes.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.nodes.size_hint()
    }
}

fn eval_context<'a, 'd, N>(
    env: &'d Environment<'a, N>,
    context: N,
) -> EvaluationContext<'a, 'd, N>
where
    N: DataSourceNode<'a> + 'a,
{
    EvaluationContext::new(
        context,
        engine::document_root(context),
        env.context_position(),
        env.context_size(),
        env,
    )
}

// --- Module-level convenience API over the default scope ---

pub fn find<'a, N>(query: &str, context: N) -> Result<Option<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().find(query, context)
}

pub fn select<'a, N>(query: &str, context: N) -> Result<Selected<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().select(query, context)
}

pub fn eval_string<'a, N>(query: &str, context: N) -> Result<String, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().eval_string(query, context)
}

pub fn eval_number<'a, N>(query: &str, context: N) -> Result<f64, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().eval_number(query, context)
}

pub fn eval_boolean<'a, N>(query: &str, context: N) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().eval_boolean(query, context)
}

pub fn eval_value<'a, N>(query: &str, context: N) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    XPath::new().eval_value(query, context)
}

/// A fresh root environment.
pub fn create_environment<'a, N: DataSourceNode<'a> + 'a>() -> Environment<'a, N> {
    Environment::new()
}

/// A fresh root environment seeded with globals. Nested scopes and
/// macro-style call frames are opened on the environment itself with
/// [`Environment::push_frame`] and [`Environment::push_call_frame`].
pub fn create_environment_with_globals<'a, N: DataSourceNode<'a> + 'a>(
    globals: HashMap<String, XPathValue<N>>,
) -> Environment<'a, N> {
    Environment::with_globals(globals)
}
