//! Pure functions collecting nodes along each axis, in document order.

use crate::datasource::DataSourceNode;
use std::collections::HashSet;

fn add_node<'a, N: DataSourceNode<'a>>(node: N, seen: &mut HashSet<N>, results: &mut Vec<N>) {
    if seen.insert(node) {
        results.push(node);
    }
}

pub fn collect_self<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    add_node(node, seen, results);
}

pub fn collect_children<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    for child in node.children() {
        add_node(child, seen, results);
    }
}

pub fn collect_attributes<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    for attr in node.attributes() {
        add_node(attr, seen, results);
    }
}

/// The namespace axis. The datasource trait does not model namespace nodes
/// as a distinct kind; the axis yields the attributes that declare
/// namespaces (`xmlns`, `xmlns:prefix`).
pub fn collect_namespaces<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    for attr in node.attributes() {
        let declares_namespace = attr
            .name()
            .is_some_and(|q| q.prefix == Some("xmlns") || (q.prefix.is_none() && q.local_part == "xmlns"));
        if declares_namespace {
            add_node(attr, seen, results);
        }
    }
}

pub fn collect_descendants<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    for child in node.children() {
        add_node(child, seen, results);
        collect_descendants(child, seen, results);
    }
}

pub fn collect_descendants_or_self<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    add_node(node, seen, results);
    collect_descendants(node, seen, results);
}

pub fn collect_parent<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    if let Some(parent) = node.parent() {
        add_node(parent, seen, results);
    }
}

pub fn collect_ancestors<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    let mut current = node.parent();
    while let Some(p) = current {
        add_node(p, seen, results);
        current = p.parent();
    }
}

pub fn collect_ancestors_or_self<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    add_node(node, seen, results);
    collect_ancestors(node, seen, results);
}

pub fn collect_following_siblings<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    if let Some(parent) = node.parent() {
        let mut found_self = false;
        for sibling in parent.children() {
            if found_self {
                add_node(sibling, seen, results);
            }
            if sibling == node {
                found_self = true;
            }
        }
    }
}

pub fn collect_preceding_siblings<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    if let Some(parent) = node.parent() {
        for sibling in parent.children() {
            if sibling == node {
                break;
            }
            add_node(sibling, seen, results);
        }
    }
}

pub fn collect_following<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    let mut current = Some(node);
    while let Some(c) = current {
        let parent = c.parent();
        if let Some(p) = parent {
            let mut found = false;
            for sibling in p.children() {
                if found {
                    collect_descendants_or_self(sibling, seen, results);
                }
                if sibling == c {
                    found = true;
                }
            }
        }
        current = parent;
    }
}

pub fn collect_preceding<'a, N: DataSourceNode<'a>>(
    node: N,
    seen: &mut HashSet<N>,
    results: &mut Vec<N>,
) {
    let mut current = Some(node);
    while let Some(c) = current {
        let parent = c.parent();
        if let Some(p) = parent {
            for sibling in p.children() {
                if sibling == c {
                    break;
                }
                collect_descendants_or_self(sibling, seen, results);
            }
        }
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::sample_tree;

    #[test]
    fn test_collect_children() {
        let tree = sample_tree();
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        collect_children(tree.root(), &mut seen, &mut results);
        assert_eq!(
            results,
            vec![tree.node(1), tree.node(11), tree.node(12), tree.node(16)]
        );
    }

    #[test]
    fn test_collect_descendants_in_document_order() {
        let tree = sample_tree();
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        collect_descendants(tree.node(1), &mut seen, &mut results);
        assert_eq!(
            results,
            vec![
                tree.node(5),
                tree.node(6),
                tree.node(7),
                tree.node(8),
                tree.node(9),
                tree.node(10)
            ]
        );
    }

    #[test]
    fn test_collect_ancestors_or_self() {
        let tree = sample_tree();
        let text = tree.node(6);
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        collect_ancestors_or_self(text, &mut seen, &mut results);
        assert_eq!(results, vec![text, tree.node(5), tree.node(1), tree.root()]);
    }

    #[test]
    fn test_collect_siblings() {
        let tree = sample_tree();
        let first_chapter = tree.node(1);
        let mut seen = HashSet::new();
        let mut following = Vec::new();
        collect_following_siblings(first_chapter, &mut seen, &mut following);
        assert_eq!(
            following,
            vec![tree.node(11), tree.node(12), tree.node(16)]
        );

        let mut seen = HashSet::new();
        let mut preceding = Vec::new();
        collect_preceding_siblings(tree.node(12), &mut seen, &mut preceding);
        assert_eq!(preceding, vec![tree.node(1), tree.node(11)]);
    }

    #[test]
    fn test_collect_following_and_preceding() {
        let tree = sample_tree();
        // Everything after the first para element and below/after its
        // ancestors' later siblings.
        let mut seen = HashSet::new();
        let mut following = Vec::new();
        collect_following(tree.node(5), &mut seen, &mut following);
        assert!(following.contains(&tree.node(7)));
        assert!(following.contains(&tree.node(14)));
        assert!(!following.contains(&tree.node(6))); // own descendant

        let mut seen = HashSet::new();
        let mut preceding = Vec::new();
        collect_preceding(tree.node(12), &mut seen, &mut preceding);
        assert!(preceding.contains(&tree.node(1)));
        assert!(preceding.contains(&tree.node(11)));
        assert!(!preceding.contains(&tree.node(16)));
    }

    #[test]
    fn test_collect_namespaces() {
        let tree = sample_tree();
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        collect_namespaces(tree.node(1), &mut seen, &mut results);
        assert_eq!(results, vec![tree.node(4)]);
    }
}
