//! Bounded caches of compiled queries.
//!
//! Three independent least-recently-used caches (match patterns, select
//! patterns, scalar expressions) are kept per logical scope. The cache key
//! is the query string together with its namespace-context snapshot, so the
//! same text compiled under different prefix bindings never collides.
//!
//! Lookup-or-compile is not atomic across threads: two racing callers may
//! both compile the same query, which is harmless (compilation is a pure
//! function of its inputs). The internal bookkeeping is lock-protected and
//! never corrupts under concurrent use.

use crate::ast::{Expression, Pattern};
use crate::error::XPathError;
use crate::functions::ExtensionSignatures;
use crate::namespace::NamespaceContext;
use crate::parser;
use lru::LruCache;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(128) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    namespace: NamespaceContext,
}

impl CacheKey {
    fn new(query: &str, namespace: &NamespaceContext) -> Self {
        CacheKey {
            query: query.to_string(),
            namespace: namespace.clone(),
        }
    }
}

/// The compiled-query caches for one scope.
pub struct CompiledQueries {
    match_patterns: Mutex<LruCache<CacheKey, Arc<Pattern>>>,
    select_patterns: Mutex<LruCache<CacheKey, Arc<Pattern>>>,
    expressions: Mutex<LruCache<CacheKey, Arc<Expression>>>,
}

impl Default for CompiledQueries {
    fn default() -> Self {
        Self::new()
    }
}

impl CompiledQueries {
    pub fn new() -> Self {
        CompiledQueries {
            match_patterns: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            select_patterns: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            expressions: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    /// Looks up or compiles a select pattern. A failed compile is never
    /// cached.
    pub fn select_pattern(
        &self,
        query: &str,
        namespace: &NamespaceContext,
        extensions: Option<&ExtensionSignatures>,
    ) -> Result<Arc<Pattern>, XPathError> {
        lookup_or_compile(&self.select_patterns, "select", query, namespace, || {
            parser::parse_select_with(query, namespace, extensions)
        })
    }

    /// Looks up or compiles a match pattern.
    pub fn match_pattern(
        &self,
        query: &str,
        namespace: &NamespaceContext,
        extensions: Option<&ExtensionSignatures>,
    ) -> Result<Arc<Pattern>, XPathError> {
        lookup_or_compile(&self.match_patterns, "match", query, namespace, || {
            parser::parse_match_with(query, namespace, extensions)
        })
    }

    /// Looks up or compiles a scalar expression.
    pub fn expression(
        &self,
        query: &str,
        namespace: &NamespaceContext,
        extensions: Option<&ExtensionSignatures>,
    ) -> Result<Arc<Expression>, XPathError> {
        lookup_or_compile(&self.expressions, "expr", query, namespace, || {
            parser::parse_expression_with(query, namespace, extensions)
        })
    }
}

fn lookup_or_compile<T>(
    cache: &Mutex<LruCache<CacheKey, Arc<T>>>,
    kind: &str,
    query: &str,
    namespace: &NamespaceContext,
    compile: impl FnOnce() -> Result<T, XPathError>,
) -> Result<Arc<T>, XPathError> {
    let key = CacheKey::new(query, namespace);

    if let Ok(mut cache) = cache.lock() {
        if let Some(compiled) = cache.get(&key) {
            log::debug!("{} cache hit for '{}'", kind, query);
            return Ok(compiled.clone());
        }
    }

    log::debug!("{} cache miss for '{}', compiling", kind, query);
    let compiled = Arc::new(compile()?);
    if let Ok(mut cache) = cache.lock() {
        cache.put(key, compiled.clone());
    }
    Ok(compiled)
}

static SCOPES: Lazy<RwLock<HashMap<String, Arc<CompiledQueries>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Returns the cache scope registered under `handle`, creating it on first
/// use. Scopes let a host isolate caches per deployment unit.
pub fn cache_scope(handle: &str) -> Arc<CompiledQueries> {
    if let Ok(scopes) = SCOPES.read() {
        if let Some(scope) = scopes.get(handle) {
            return scope.clone();
        }
    }
    let mut scopes = match SCOPES.write() {
        Ok(scopes) => scopes,
        Err(poisoned) => poisoned.into_inner(),
    };
    scopes
        .entry(handle.to_string())
        .or_insert_with(|| Arc::new(CompiledQueries::new()))
        .clone()
}

/// Drops the cache scope registered under `handle`. Evaluators already
/// holding compiled queries from the scope are unaffected.
pub fn drop_cache_scope(handle: &str) {
    let mut scopes = match SCOPES.write() {
        Ok(scopes) => scopes,
        Err(poisoned) => poisoned.into_inner(),
    };
    scopes.remove(handle);
}

/// The process-default scope used by the plain module-level API.
pub fn default_scope() -> Arc<CompiledQueries> {
    cache_scope("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_lookup_returns_same_compile() {
        let cache = CompiledQueries::new();
        let ns = NamespaceContext::new();

        let first = cache.select_pattern("chapter/para", &ns, None).unwrap();
        let second = cache.select_pattern("chapter/para", &ns, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_namespace_contexts_do_not_collide() {
        let cache = CompiledQueries::new();
        let plain = NamespaceContext::new();
        let bound = NamespaceContext::new().with_binding("fig", "urn:figures");

        let a = cache.select_pattern("fig:image", &plain, None).unwrap();
        let b = cache.select_pattern("fig:image", &bound, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.as_ref(), b.as_ref());
    }

    #[test]
    fn test_failed_compiles_are_not_cached() {
        let cache = CompiledQueries::new();
        let ns = NamespaceContext::new();

        assert!(cache.expression("1 +", &ns, None).is_err());
        // a later valid compile with the same prefix works
        assert!(cache.expression("1 + 2", &ns, None).is_ok());
    }

    #[test]
    fn test_eviction_keeps_capacity() {
        let cache = CompiledQueries::new();
        let ns = NamespaceContext::new();

        for i in 0..200 {
            let query = format!("item{}", i);
            cache.select_pattern(&query, &ns, None).unwrap();
        }
        let guard = cache.select_patterns.lock().unwrap();
        assert_eq!(guard.len(), 128);
    }

    #[test]
    fn test_scope_registry() {
        let a = cache_scope("unit-test-scope-a");
        let a_again = cache_scope("unit-test-scope-a");
        let b = cache_scope("unit-test-scope-b");
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));

        drop_cache_scope("unit-test-scope-a");
        let fresh = cache_scope("unit-test-scope-a");
        assert!(!Arc::ptr_eq(&a, &fresh));
    }
}
