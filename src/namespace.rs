//! Prefix-to-URI bindings consulted while compiling a query.
//!
//! A `NamespaceContext` is part of the compiled-query cache key, so two
//! queries with the same text but different prefix bindings never collide.

/// An immutable chain of prefix→URI bindings. Later bindings shadow earlier
/// ones for the same prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NamespaceContext {
    bindings: Vec<(String, String)>,
}

impl NamespaceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding, convenient for tests and one-off contexts.
    pub fn with_binding(mut self, prefix: &str, uri: &str) -> Self {
        self.bind(prefix, uri);
        self
    }

    pub fn bind(&mut self, prefix: &str, uri: &str) {
        self.bindings.push((prefix.to_string(), uri.to_string()));
    }

    /// Resolves a prefix, scanning the most recent bindings first.
    pub fn find(&self, prefix: &str) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_and_shadowing() {
        let ns = NamespaceContext::new()
            .with_binding("fig", "urn:figures")
            .with_binding("fig", "urn:figures-v2");

        assert_eq!(ns.find("fig"), Some("urn:figures-v2"));
        assert_eq!(ns.find("missing"), None);
    }

    #[test]
    fn test_contexts_compare_by_bindings() {
        let a = NamespaceContext::new().with_binding("x", "urn:x");
        let b = NamespaceContext::new().with_binding("x", "urn:x");
        let c = NamespaceContext::new().with_binding("x", "urn:y");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
