//! The core abstraction for a navigable, read-only tree of nodes.
use std::hash::Hash;

/// A qualified name: optional prefix, optional namespace URI, local part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QName<'a> {
    pub prefix: Option<&'a str>,
    pub namespace: Option<&'a str>,
    pub local_part: &'a str,
}

impl<'a> QName<'a> {
    /// The `prefix:local` display form used by the `name()` function and by
    /// unresolved-prefix node tests.
    pub fn qualified(&self) -> String {
        match self.prefix {
            Some(p) => format!("{}:{}", p, self.local_part),
            None => self.local_part.to_string(),
        }
    }
}

/// The kind of a node, aligned with the XPath 1.0 data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Root,
    Element,
    Attribute,
    Text,
    Comment,
    ProcessingInstruction,
    EntityReference,
}

/// The contract for a node in a read-only, hierarchical data source.
///
/// The engine is written exclusively against this trait, so it can query any
/// tree shape (an XML document, a virtual DOM, a UI widget tree) that
/// implements it. The engine never mutates the tree.
///
/// The `Ord` bound doubles as document order: implementations must order
/// nodes by position in the document, which the engine relies on when
/// merging union branches.
///
/// `'a` is the lifetime of the underlying data source.
pub trait DataSourceNode<'a>:
    std::fmt::Debug + Clone + Copy + PartialEq + Eq + Hash + PartialOrd + Ord
{
    /// The kind of the node (element, attribute, text, ...).
    fn node_type(&self) -> NodeType;

    /// The qualified name of the node. `None` for unnamed node kinds such as
    /// text, comments and the root. For a processing instruction this is its
    /// target.
    fn name(&self) -> Option<QName<'a>>;

    /// The string value of the node per the XPath 1.0 `string()` rule:
    /// text content for leaves, concatenated descendant text for elements.
    fn string_value(&self) -> String;

    /// The attribute nodes of this node; empty for non-elements.
    fn attributes(&self) -> Box<dyn Iterator<Item = Self> + 'a>;

    /// The child nodes of this node; empty for leaves.
    fn children(&self) -> Box<dyn Iterator<Item = Self> + 'a>;

    /// The parent node, or `None` for the root.
    fn parent(&self) -> Option<Self>;

    /// Looks up an attribute by its qualified display name.
    fn attribute(&self, name: &str) -> Option<Self> {
        self.attributes()
            .find(|a| a.name().is_some_and(|q| q.qualified() == name))
    }
}

// Test fixture - exported so downstream crates can drive the engine against
// an in-memory tree in their own tests.
pub mod tests {
    use super::*;
    use std::cmp::Ordering;
    use std::hash::Hasher;

    #[derive(Debug, Clone)]
    struct MockNodeData<'a> {
        node_type: NodeType,
        name: Option<QName<'a>>,
        text: String,
        children: Vec<usize>,
        attributes: Vec<usize>,
        parent: Option<usize>,
    }

    /// A small in-memory tree. Node ids are assigned in document order, so
    /// ordering `MockNode`s by id is ordering them by document position.
    #[derive(Debug)]
    pub struct MockTree<'a> {
        nodes: Vec<MockNodeData<'a>>,
    }

    #[derive(Debug, Clone, Copy)]
    pub struct MockNode<'a> {
        pub id: usize,
        pub tree: &'a MockTree<'a>,
    }

    impl<'a> MockTree<'a> {
        pub const ROOT: usize = 0;

        pub fn new() -> Self {
            MockTree {
                nodes: vec![MockNodeData {
                    node_type: NodeType::Root,
                    name: None,
                    text: String::new(),
                    children: vec![],
                    attributes: vec![],
                    parent: None,
                }],
            }
        }

        pub fn node(&'a self, id: usize) -> MockNode<'a> {
            MockNode { id, tree: self }
        }

        pub fn root(&'a self) -> MockNode<'a> {
            self.node(Self::ROOT)
        }

        fn push(&mut self, parent: usize, data: MockNodeData<'a>) -> usize {
            let id = self.nodes.len();
            self.nodes.push(data);
            if self.nodes[id].node_type == NodeType::Attribute {
                self.nodes[parent].attributes.push(id);
            } else {
                self.nodes[parent].children.push(id);
            }
            id
        }

        pub fn element(&mut self, parent: usize, name: &'a str) -> usize {
            let q = split_name(name);
            self.push(
                parent,
                MockNodeData {
                    node_type: NodeType::Element,
                    name: Some(q),
                    text: String::new(),
                    children: vec![],
                    attributes: vec![],
                    parent: Some(parent),
                },
            )
        }

        pub fn attribute(&mut self, parent: usize, name: &'a str, value: &str) -> usize {
            let q = split_name(name);
            self.push(
                parent,
                MockNodeData {
                    node_type: NodeType::Attribute,
                    name: Some(q),
                    text: value.to_string(),
                    children: vec![],
                    attributes: vec![],
                    parent: Some(parent),
                },
            )
        }

        pub fn text(&mut self, parent: usize, value: &str) -> usize {
            self.leaf(parent, NodeType::Text, None, value)
        }

        pub fn comment(&mut self, parent: usize, value: &str) -> usize {
            self.leaf(parent, NodeType::Comment, None, value)
        }

        pub fn processing_instruction(
            &mut self,
            parent: usize,
            target: &'a str,
            value: &str,
        ) -> usize {
            self.leaf(parent, NodeType::ProcessingInstruction, Some(target), value)
        }

        pub fn entity_reference(&mut self, parent: usize, name: &'a str) -> usize {
            self.leaf(parent, NodeType::EntityReference, Some(name), "")
        }

        fn leaf(
            &mut self,
            parent: usize,
            node_type: NodeType,
            name: Option<&'a str>,
            value: &str,
        ) -> usize {
            self.push(
                parent,
                MockNodeData {
                    node_type,
                    name: name.map(split_name),
                    text: value.to_string(),
                    children: vec![],
                    attributes: vec![],
                    parent: Some(parent),
                },
            )
        }
    }

    fn split_name(name: &str) -> QName<'_> {
        match name.split_once(':') {
            Some((prefix, local)) => QName {
                prefix: Some(prefix),
                namespace: None,
                local_part: local,
            },
            None => QName {
                prefix: None,
                namespace: None,
                local_part: name,
            },
        }
    }

    impl<'a> PartialEq for MockNode<'a> {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }
    impl<'a> Eq for MockNode<'a> {}

    impl<'a> PartialOrd for MockNode<'a> {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl<'a> Ord for MockNode<'a> {
        fn cmp(&self, other: &Self) -> Ordering {
            self.id.cmp(&other.id)
        }
    }

    impl<'a> Hash for MockNode<'a> {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.id.hash(state);
        }
    }

    impl<'a> DataSourceNode<'a> for MockNode<'a> {
        fn node_type(&self) -> NodeType {
            self.tree.nodes[self.id].node_type
        }

        fn name(&self) -> Option<QName<'a>> {
            self.tree.nodes[self.id].name
        }

        fn string_value(&self) -> String {
            let data = &self.tree.nodes[self.id];
            match data.node_type {
                NodeType::Element | NodeType::Root => {
                    let mut out = String::new();
                    collect_text(self.tree, self.id, &mut out);
                    out
                }
                _ => data.text.clone(),
            }
        }

        fn attributes(&self) -> Box<dyn Iterator<Item = Self> + 'a> {
            let tree = self.tree;
            let ids = tree.nodes[self.id].attributes.clone();
            Box::new(ids.into_iter().map(move |id| MockNode { id, tree }))
        }

        fn children(&self) -> Box<dyn Iterator<Item = Self> + 'a> {
            let tree = self.tree;
            let ids = tree.nodes[self.id].children.clone();
            Box::new(ids.into_iter().map(move |id| MockNode { id, tree }))
        }

        fn parent(&self) -> Option<Self> {
            self.tree.nodes[self.id].parent.map(|id| MockNode {
                id,
                tree: self.tree,
            })
        }
    }

    fn collect_text(tree: &MockTree, id: usize, out: &mut String) {
        let data = &tree.nodes[id];
        if data.node_type == NodeType::Text {
            out.push_str(&data.text);
        }
        for &child in &data.children {
            collect_text(tree, child, out);
        }
    }

    /// Builds the standard test document used across the engine's tests:
    ///
    /// ```text
    /// <root>                          id 0
    ///   <chapter id="c1" xml:lang="en" xmlns:fig="urn:figures">
    ///                                 id 1 (attrs 2, 3, 4)
    ///     <para>alpha</para>          id 5 (text 6)
    ///     <para>beta</para>           id 7 (text 8)
    ///     <note>gamma</note>          id 9 (text 10)
    ///   </chapter>
    ///   <!-- annotation -->           id 11
    ///   <chapter id="c2">             id 12 (attr 13)
    ///     <para>delta</para>          id 14 (text 15)
    ///   </chapter>
    ///   <?page break?>                id 16
    /// </root>
    /// ```
    pub fn sample_tree() -> MockTree<'static> {
        let mut t = MockTree::new();
        let ch1 = t.element(MockTree::ROOT, "chapter");
        t.attribute(ch1, "id", "c1");
        t.attribute(ch1, "xml:lang", "en");
        t.attribute(ch1, "xmlns:fig", "urn:figures");
        let p1 = t.element(ch1, "para");
        t.text(p1, "alpha");
        let p2 = t.element(ch1, "para");
        t.text(p2, "beta");
        let n = t.element(ch1, "note");
        t.text(n, "gamma");
        t.comment(MockTree::ROOT, " annotation ");
        let ch2 = t.element(MockTree::ROOT, "chapter");
        t.attribute(ch2, "id", "c2");
        let p3 = t.element(ch2, "para");
        t.text(p3, "delta");
        t.processing_instruction(MockTree::ROOT, "page", "break");
        t
    }
}

#[cfg(test)]
mod unit {
    use super::tests::*;
    use super::*;

    #[test]
    fn test_sample_tree_navigation() {
        let tree = sample_tree();
        let root = tree.root();
        assert_eq!(root.node_type(), NodeType::Root);

        let children: Vec<_> = root.children().collect();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].name().map(|q| q.local_part), Some("chapter"));
        assert_eq!(children[1].node_type(), NodeType::Comment);
        assert_eq!(children[3].node_type(), NodeType::ProcessingInstruction);

        let chapter = children[0];
        assert_eq!(chapter.attribute("id").map(|a| a.string_value()), Some("c1".into()));
        assert_eq!(chapter.attribute("xml:lang").map(|a| a.string_value()), Some("en".into()));
        assert_eq!(chapter.string_value(), "alphabetagamma");
        assert_eq!(chapter.parent(), Some(root));
    }

    #[test]
    fn test_document_order_is_id_order() {
        let tree = sample_tree();
        let first_para = tree.node(5);
        let second_chapter = tree.node(12);
        assert!(first_para < second_chapter);
    }
}
