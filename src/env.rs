//! The variable/function environment consulted during evaluation.
//!
//! An `Environment` owns the globals, the function tables and a stack of
//! local variables partitioned into frames. Locals are pushed and popped in
//! LIFO order; the most recently pushed binding for a name shadows earlier
//! ones in the same frame. A frame sees its own locals, the globals and the
//! external resolver, but never the locals of enclosing frames.
//!
//! Frames come in two kinds: a child frame starts with a fresh evaluation
//! context (a nested scope such as a for-each body), while a call frame
//! inherits the caller's current-node/select/position/size snapshot so a
//! macro body can still answer `position()` and `last()` for the caller's
//! iteration.

use crate::ast::Pattern;
use crate::datasource::{DataSourceNode, NodeType};
use crate::engine::{self, EvaluationContext, XPathValue};
use crate::functions::XPathFun;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// External variable lookup, consulted after locals and globals.
/// `None` means unresolved, which is distinct from a bound null.
pub trait VariableResolver<'a, N: DataSourceNode<'a>> {
    fn resolve(&self, name: &str) -> Option<XPathValue<N>>;
}

impl<'a, N, F> VariableResolver<'a, N> for F
where
    N: DataSourceNode<'a>,
    F: Fn(&str) -> Option<XPathValue<N>>,
{
    fn resolve(&self, name: &str) -> Option<XPathValue<N>> {
        self(name)
    }
}

#[derive(Debug, Clone)]
struct ContextState<N> {
    current_node: Option<N>,
    context_node: Option<N>,
    select: Option<Arc<Pattern>>,
    /// Explicit `position()` override; 0 means unset.
    position: usize,
    /// Explicit `last()` override; 0 means unset.
    size: usize,
    position_index: usize,
    has_more_positions: bool,
}

impl<N> ContextState<N> {
    fn empty() -> Self {
        ContextState {
            current_node: None,
            context_node: None,
            select: None,
            position: 0,
            size: 0,
            position_index: 0,
            has_more_positions: false,
        }
    }
}

struct Frame<N> {
    base: usize,
    saved: ContextState<N>,
}

pub struct Environment<'a, N: DataSourceNode<'a>> {
    globals: HashMap<String, XPathValue<N>>,
    functions: HashMap<String, Arc<dyn XPathFun<N> + 'a>>,
    extensions: HashMap<String, Arc<dyn XPathFun<N> + 'a>>,
    resolver: Option<Box<dyn VariableResolver<'a, N> + 'a>>,
    names: Vec<String>,
    values: Vec<XPathValue<N>>,
    frames: Vec<Frame<N>>,
    context: ContextState<N>,
    id_cache: RefCell<HashMap<N, HashMap<String, Vec<N>>>>,
}

impl<'a, N: DataSourceNode<'a> + 'a> Default for Environment<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, N: DataSourceNode<'a> + 'a> Environment<'a, N> {
    pub fn new() -> Self {
        Environment {
            globals: HashMap::new(),
            functions: HashMap::new(),
            extensions: HashMap::new(),
            resolver: None,
            names: Vec::new(),
            values: Vec::new(),
            frames: Vec::new(),
            context: ContextState::empty(),
            id_cache: RefCell::new(HashMap::new()),
        }
    }

    /// A fresh root environment seeded with globals.
    pub fn with_globals(globals: HashMap<String, XPathValue<N>>) -> Self {
        let mut env = Self::new();
        env.globals = globals;
        env
    }

    // --- Frames ---

    /// Opens a child frame: own locals, fresh evaluation context.
    pub fn push_frame(&mut self) {
        let saved = std::mem::replace(&mut self.context, ContextState::empty());
        self.frames.push(Frame {
            base: self.names.len(),
            saved,
        });
    }

    /// Opens a call frame: own locals, but the caller's current-node,
    /// select pattern and position/size snapshot stay visible.
    pub fn push_call_frame(&mut self) {
        let saved = self.context.clone();
        self.context.position_index = 0;
        self.context.has_more_positions = false;
        self.frames.push(Frame {
            base: self.names.len(),
            saved,
        });
    }

    /// Closes the innermost frame, dropping its locals and restoring the
    /// caller's context snapshot. Closing with no open frame is a
    /// programming error.
    pub fn pop_frame(&mut self) {
        debug_assert!(!self.frames.is_empty(), "pop_frame without a frame");
        if let Some(frame) = self.frames.pop() {
            self.names.truncate(frame.base);
            self.values.truncate(frame.base);
            self.context = frame.saved;
        }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    // --- Variables ---

    /// Looks up a variable: current frame's locals newest-first, then
    /// globals, then the external resolver. `None` means unresolved.
    pub fn get_var(&self, name: &str) -> Option<XPathValue<N>> {
        let base = self.frame_base();
        for i in (base..self.names.len()).rev() {
            if self.names[i] == name {
                return Some(self.values[i].clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Some(value.clone());
        }
        self.resolver.as_ref().and_then(|r| r.resolve(name))
    }

    /// Pushes a local binding, shadowing earlier bindings for the same name
    /// in this frame. Returns the binding's stack index.
    pub fn add_var(&mut self, name: &str, value: XPathValue<N>) -> usize {
        self.names.push(name.to_string());
        self.values.push(value);
        self.names.len() - 1
    }

    /// Pushes a node sequence, materializing it eagerly: an iterator cannot
    /// be replayed safely across repeated predicate evaluations.
    pub fn add_var_nodes(&mut self, name: &str, nodes: impl IntoIterator<Item = N>) -> usize {
        self.add_var(name, XPathValue::NodeSet(nodes.into_iter().collect()))
    }

    /// Rebinds an existing local in the current frame, or pushes a new
    /// binding when the name is unbound.
    pub fn set_var(&mut self, name: &str, value: XPathValue<N>) {
        let base = self.frame_base();
        for i in (base..self.names.len()).rev() {
            if self.names[i] == name {
                self.values[i] = value;
                return;
            }
        }
        self.add_var(name, value);
    }

    /// The current local stack depth; pair with [`Environment::pop_to`] to
    /// restore an exact prior depth.
    pub fn var_count(&self) -> usize {
        self.names.len()
    }

    /// Pops the `count` most recent locals. Popping more than this frame
    /// pushed is a programming error.
    pub fn pop_vars(&mut self, count: usize) {
        let base = self.frame_base();
        debug_assert!(
            self.names.len().saturating_sub(count) >= base,
            "pop_vars crosses a frame boundary"
        );
        let target = self.names.len().saturating_sub(count).max(base);
        self.names.truncate(target);
        self.values.truncate(target);
    }

    /// Pops locals down to a depth previously returned by
    /// [`Environment::var_count`].
    pub fn pop_to(&mut self, top: usize) {
        debug_assert!(top >= self.frame_base(), "pop_to crosses a frame boundary");
        let target = top.max(self.frame_base());
        self.names.truncate(target);
        self.values.truncate(target);
    }

    /// Binds a global on the root scope, visible from every frame.
    pub fn set_global(&mut self, name: &str, value: XPathValue<N>) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn set_resolver(&mut self, resolver: impl VariableResolver<'a, N> + 'a) {
        self.resolver = Some(Box::new(resolver));
    }

    // --- Functions ---

    pub fn add_function(&mut self, name: &str, fun: impl XPathFun<N> + 'a) {
        self.functions.insert(name.to_string(), Arc::new(fun));
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn XPathFun<N> + 'a>> {
        self.functions.get(name).cloned()
    }

    pub fn add_extension(&mut self, key: &str, fun: Arc<dyn XPathFun<N> + 'a>) {
        self.extensions.insert(key.to_string(), fun);
    }

    pub fn extension(&self, key: &str) -> Option<Arc<dyn XPathFun<N> + 'a>> {
        self.extensions.get(key).cloned()
    }

    // --- Evaluation context ---

    pub fn current_node(&self) -> Option<N> {
        self.context.current_node
    }

    pub fn set_current_node(&mut self, node: N) {
        self.context.current_node = Some(node);
    }

    pub fn context_node(&self) -> Option<N> {
        self.context.context_node
    }

    pub fn set_context_node(&mut self, node: N) -> Option<N> {
        self.context.context_node.replace(node)
    }

    /// Records the selection the current node was drawn from, clearing any
    /// explicit position. Returns the previous selection.
    pub fn set_select(&mut self, context_node: N, select: Arc<Pattern>) -> Option<Arc<Pattern>> {
        self.context.context_node = Some(context_node);
        self.context.position = 0;
        self.context.select.replace(select)
    }

    pub fn select(&self) -> Option<Arc<Pattern>> {
        self.context.select.clone()
    }

    /// Supplies a pre-computed `position()`, returning the old override.
    pub fn set_context_position(&mut self, position: usize) -> usize {
        std::mem::replace(&mut self.context.position, position)
    }

    /// Supplies a pre-computed `last()`, returning the old override.
    pub fn set_context_size(&mut self, size: usize) -> usize {
        std::mem::replace(&mut self.context.size, size)
    }

    pub fn position_index(&self) -> usize {
        self.context.position_index
    }

    pub fn set_position_index(&mut self, index: usize) -> usize {
        std::mem::replace(&mut self.context.position_index, index)
    }

    pub fn has_more_positions(&self) -> bool {
        self.context.has_more_positions
    }

    pub fn set_more_positions(&mut self, more: bool) -> bool {
        std::mem::replace(&mut self.context.has_more_positions, more)
    }

    /// The context position: the explicit override when one was supplied,
    /// otherwise recomputed by re-walking the recorded select pattern up to
    /// the current node. The fallback is O(n) per call; callers that already
    /// walked the axis should supply the override instead.
    pub fn context_position(&self) -> usize {
        if self.context.position > 0 {
            return self.context.position;
        }
        let (Some(current), Some(context)) = (self.context.current_node, self.context.context_node)
        else {
            return 1;
        };
        if let Some(nodes) = self.walk_select(context) {
            if let Some(idx) = nodes.iter().position(|n| *n == current) {
                return idx + 1;
            }
        }
        let mut position = 1;
        for child in context.children() {
            if child == current {
                break;
            }
            position += 1;
        }
        position
    }

    /// The context size, with the same override-then-recompute behavior as
    /// [`Environment::context_position`].
    pub fn context_size(&self) -> usize {
        if self.context.size > 0 {
            return self.context.size;
        }
        let Some(context) = self.context.context_node else {
            return 1;
        };
        if let Some(nodes) = self.walk_select(context) {
            return nodes.len();
        }
        context.children().count().max(1)
    }

    fn walk_select(&self, context: N) -> Option<Vec<N>> {
        let select = self.context.select.as_ref()?;
        let root = engine::document_root(context);
        let e_ctx = EvaluationContext::new(context, root, 1, 1, self);
        engine::select_pattern(select, &e_ctx).ok()
    }

    // --- id() support ---

    /// Resolves `id()` lookups against a lazily built per-document index of
    /// `id`/`xml:id` attributes.
    pub fn nodes_with_ids(&self, root: N, wanted: &[String]) -> Vec<N> {
        let mut cache = self.id_cache.borrow_mut();
        let index = cache.entry(root).or_insert_with(|| build_id_index(root));

        let mut results: Vec<N> = Vec::new();
        for id in wanted {
            if let Some(nodes) = index.get(id) {
                for &node in nodes {
                    if !results.contains(&node) {
                        results.push(node);
                    }
                }
            }
        }
        results.sort();
        results
    }
}

fn build_id_index<'a, N: DataSourceNode<'a>>(root: N) -> HashMap<String, Vec<N>> {
    let mut index: HashMap<String, Vec<N>> = HashMap::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.node_type() == NodeType::Element {
            for attr in node.attributes() {
                let is_id = attr
                    .name()
                    .is_some_and(|q| {
                        (q.prefix.is_none() || q.prefix == Some("xml")) && q.local_part == "id"
                    });
                if is_id {
                    index.entry(attr.string_value()).or_default().push(node);
                }
            }
        }
        stack.extend(node.children());
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::{MockNode, sample_tree};
    use crate::parser::parse_select;

    type V<'a> = XPathValue<MockNode<'a>>;

    #[test]
    fn test_shadowing_and_pop_restores_global() {
        let mut env: Environment<MockNode> = Environment::new();
        env.set_global("x", V::String("global".into()));

        let top = env.var_count();
        env.add_var("x", V::String("local".into()));
        assert_eq!(env.get_var("x"), Some(V::String("local".into())));

        env.pop_to(top);
        assert_eq!(env.get_var("x"), Some(V::String("global".into())));
    }

    #[test]
    fn test_later_bindings_shadow_earlier_in_same_frame() {
        let mut env: Environment<MockNode> = Environment::new();
        env.add_var("x", V::Long(1));
        env.add_var("x", V::Long(2));
        assert_eq!(env.get_var("x"), Some(V::Long(2)));

        env.pop_vars(1);
        assert_eq!(env.get_var("x"), Some(V::Long(1)));
    }

    #[test]
    fn test_child_frame_hides_caller_locals() {
        let mut env: Environment<MockNode> = Environment::new();
        env.add_var("caller", V::Long(7));
        env.set_global("shared", V::Long(9));

        env.push_frame();
        assert_eq!(env.get_var("caller"), None);
        assert_eq!(env.get_var("shared"), Some(V::Long(9)));
        env.add_var("inner", V::Long(1));
        env.pop_frame();

        assert_eq!(env.get_var("caller"), Some(V::Long(7)));
        assert_eq!(env.get_var("inner"), None);
    }

    #[test]
    fn test_call_frame_inherits_context_snapshot() {
        let tree = sample_tree();
        let mut env = Environment::new();
        env.set_current_node(tree.node(7));
        env.set_context_node(tree.node(1));
        env.set_context_position(2);
        env.set_context_size(3);

        env.push_call_frame();
        assert_eq!(env.current_node(), Some(tree.node(7)));
        assert_eq!(env.context_position(), 2);
        assert_eq!(env.context_size(), 3);
        env.pop_frame();

        env.push_frame();
        assert_eq!(env.current_node(), None);
        env.pop_frame();
    }

    #[test]
    fn test_set_var_rebinds_in_place() {
        let mut env: Environment<MockNode> = Environment::new();
        env.add_var("x", V::Long(1));
        let depth = env.var_count();
        env.set_var("x", V::Long(2));
        assert_eq!(env.var_count(), depth);
        assert_eq!(env.get_var("x"), Some(V::Long(2)));

        env.set_var("fresh", V::Long(3));
        assert_eq!(env.var_count(), depth + 1);
    }

    #[test]
    fn test_resolver_distinguishes_unresolved_from_null() {
        let mut env: Environment<MockNode> = Environment::new();
        env.set_resolver(|name: &str| {
            if name == "known-null" {
                Some(V::Null)
            } else {
                None
            }
        });

        assert_eq!(env.get_var("known-null"), Some(V::Null));
        assert_eq!(env.get_var("unknown"), None);
    }

    #[test]
    fn test_position_override_wins() {
        let tree = sample_tree();
        let mut env = Environment::new();
        env.set_current_node(tree.node(7));
        env.set_context_node(tree.node(1));
        env.set_context_position(5);
        assert_eq!(env.context_position(), 5);
    }

    #[test]
    fn test_position_recomputed_from_select_walk() {
        let tree = sample_tree();
        let mut env = Environment::new();
        let select = Arc::new(parse_select("para").unwrap());
        env.set_current_node(tree.node(7));
        env.set_select(tree.node(1), select);

        // second para inside the first chapter
        assert_eq!(env.context_position(), 2);
        assert_eq!(env.context_size(), 2);
    }

    #[test]
    fn test_position_falls_back_to_sibling_walk() {
        let tree = sample_tree();
        let mut env = Environment::new();
        env.set_current_node(tree.node(9));
        env.set_context_node(tree.node(1));

        assert_eq!(env.context_position(), 3);
        assert_eq!(env.context_size(), 3);
    }

    #[test]
    fn test_id_index() {
        let tree = sample_tree();
        let env = Environment::new();
        let found = env.nodes_with_ids(tree.root(), &["c2".to_string(), "c1".to_string()]);
        assert_eq!(found, vec![tree.node(1), tree.node(12)]);
    }
}
