//! Match-pattern evaluation: deciding whether a node matches a compiled
//! pattern, as used for template/rule matching.
//!
//! A match pattern is tested by walking its steps in reverse from the
//! candidate node toward the root. A `//` separator compiles to a
//! descendant gap step that may swallow any number of ancestors, handled by
//! backtracking. Select-pattern evaluation (walking forward from a context)
//! lives in `engine`.

use crate::ast::{Anchor, Axis, LocationPath, Pattern, Step};
use crate::datasource::{DataSourceNode, NodeType};
use crate::engine::{self, EvaluationContext, XPathValue};
use crate::env::Environment;
use crate::error::XPathError;

impl Pattern {
    /// True if `node` matches any branch of this pattern. `root` anchors
    /// absolute branches; `env` supplies variables for predicates.
    pub fn matches<'a, N>(
        &self,
        node: N,
        root: N,
        env: &Environment<'a, N>,
    ) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        for path in &self.paths {
            if path_matches(path, node, root, env)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn path_matches<'a, N>(
    path: &LocationPath,
    node: N,
    root: N,
    env: &Environment<'a, N>,
) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    if path.steps.is_empty() {
        return Ok(match &path.anchor {
            Anchor::Root => node == root,
            _ => true,
        });
    }
    match_from_end(&path.steps, Some(node), &path.anchor, root, env)
}

/// Matches the step chain back-to-front. `node` is the candidate for the
/// last unconsumed step; once every step is consumed, the remaining
/// position must satisfy the anchor.
fn match_from_end<'a, N>(
    steps: &[Step],
    node: Option<N>,
    anchor: &Anchor,
    root: N,
    env: &Environment<'a, N>,
) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let Some((last, rest)) = steps.split_last() else {
        return anchor_matches(anchor, node, root, env);
    };

    if last.is_descendant_gap() {
        // `//` - the gap may swallow any number of ancestors
        let mut current = node;
        loop {
            if match_from_end(rest, current, anchor, root, env)? {
                return Ok(true);
            }
            match current {
                Some(n) => current = n.parent(),
                None => return Ok(false),
            }
        }
    }

    let Some(n) = node else {
        return Ok(false);
    };
    if !step_matches(last, n, env)? {
        return Ok(false);
    }
    match_from_end(rest, n.parent(), anchor, root, env)
}

fn anchor_matches<'a, N>(
    anchor: &Anchor,
    node: Option<N>,
    root: N,
    env: &Environment<'a, N>,
) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match anchor {
        Anchor::Root => Ok(node == Some(root)),
        Anchor::Context | Anchor::Any => Ok(true),
        Anchor::Current => Ok(match env.current_node() {
            Some(current) => node == Some(current),
            None => true,
        }),
        Anchor::Expr(expr) => {
            let Some(n) = node else {
                return Ok(false);
            };
            let e_ctx = EvaluationContext::new(root, root, 1, 1, env);
            match engine::evaluate(expr, &e_ctx)? {
                XPathValue::NodeSet(nodes) => Ok(nodes.contains(&n)),
                _ => Ok(false),
            }
        }
    }
}

fn step_matches<'a, N>(step: &Step, node: N, env: &Environment<'a, N>) -> Result<bool, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let node_type = node.node_type();
    match step.axis {
        Axis::Attribute | Axis::Namespace => {
            if node_type != NodeType::Attribute {
                return Ok(false);
            }
        }
        _ => {
            if node_type == NodeType::Attribute {
                return Ok(false);
            }
        }
    }

    if !engine::node_test_matches(node, &step.node_test, step.axis) {
        return Ok(false);
    }

    for predicate in &step.predicates {
        let (position, size) = sibling_position(node, step);
        let root = engine::document_root(node);
        let e_ctx = EvaluationContext::new(node, root, position, size, env);
        let value = engine::evaluate(predicate, &e_ctx)?;
        let holds = if value.is_numeric() {
            value.to_number() == position as f64
        } else {
            value.to_bool()
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The node's 1-based position among its siblings passing the step's node
/// test, and the number of such siblings.
fn sibling_position<'a, N>(node: N, step: &Step) -> (usize, usize)
where
    N: DataSourceNode<'a> + 'a,
{
    let Some(parent) = node.parent() else {
        return (1, 1);
    };
    let siblings: Box<dyn Iterator<Item = N>> = if step.axis == Axis::Attribute {
        parent.attributes()
    } else {
        parent.children()
    };

    let mut position = 0;
    let mut size = 0;
    for sibling in siblings {
        if engine::node_test_matches(sibling, &step.node_test, step.axis) {
            size += 1;
            if sibling == node {
                position = size;
            }
        }
    }
    (position.max(1), size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::sample_tree;
    use crate::parser::parse_match;

    #[test]
    fn test_name_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("para").unwrap();

        assert!(pattern.matches(tree.node(5), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(1), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(6), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_relative_path_matches_anywhere() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("chapter/para").unwrap();

        assert!(pattern.matches(tree.node(5), tree.root(), &env).unwrap());
        assert!(pattern.matches(tree.node(14), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(9), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_absolute_match_is_anchored() {
        let tree = sample_tree();
        let env = Environment::new();

        let pattern = parse_match("/chapter").unwrap();
        assert!(pattern.matches(tree.node(1), tree.root(), &env).unwrap());

        let nested = parse_match("/para").unwrap();
        assert!(!nested.matches(tree.node(5), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_root_pattern() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("/").unwrap();

        assert!(pattern.matches(tree.root(), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(1), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_descendant_gap_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("//para").unwrap();

        assert!(pattern.matches(tree.node(5), tree.root(), &env).unwrap());
        assert!(pattern.matches(tree.node(14), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(9), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_union_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("nonexistent|note").unwrap();

        assert!(pattern.matches(tree.node(9), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(5), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_attribute_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("@id").unwrap();

        assert!(pattern.matches(tree.node(2), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(1), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_positional_predicate_in_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("para[2]").unwrap();

        assert!(pattern.matches(tree.node(7), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(5), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_text_match() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("para/text()").unwrap();

        assert!(pattern.matches(tree.node(6), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(5), tree.root(), &env).unwrap());
    }

    #[test]
    fn test_wildcard_match_is_elements_only() {
        let tree = sample_tree();
        let env = Environment::new();
        let pattern = parse_match("*").unwrap();

        assert!(pattern.matches(tree.node(1), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.node(11), tree.root(), &env).unwrap());
        assert!(!pattern.matches(tree.root(), tree.root(), &env).unwrap());
    }
}
