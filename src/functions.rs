//! The XPath function library and the extension-function machinery.
//!
//! Library functions are lowered to the [`Builtin`] enum at parse time, so
//! evaluation dispatches on an enum tag instead of a name string. Functions
//! that are not in the table are either namespace-qualified extensions
//! (resolved against a registry of declared signatures while parsing) or
//! deferred calls resolved through the environment's function table when
//! evaluated.

use crate::datasource::DataSourceNode;
use crate::engine::{EvaluationContext, XPathValue, string_to_number};
use crate::error::XPathError;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The fixed library function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    True,
    False,
    Not,
    Boolean,
    StartsWith,
    Contains,
    Lang,
    Number,
    Sum,
    Floor,
    Ceiling,
    Round,
    Position,
    Last,
    Count,
    StringLength,
    String,
    Concat,
    Substring,
    SubstringBefore,
    SubstringAfter,
    NormalizeSpace,
    Translate,
    LocalName,
    NamespaceUri,
    Name,
    GenerateId,
    Id,
    FunctionAvailable,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "true" => Builtin::True,
            "false" => Builtin::False,
            "not" => Builtin::Not,
            "boolean" => Builtin::Boolean,
            "starts-with" => Builtin::StartsWith,
            "contains" => Builtin::Contains,
            "lang" => Builtin::Lang,
            "number" => Builtin::Number,
            "sum" => Builtin::Sum,
            "floor" => Builtin::Floor,
            "ceiling" => Builtin::Ceiling,
            "round" => Builtin::Round,
            "position" => Builtin::Position,
            "last" => Builtin::Last,
            "count" => Builtin::Count,
            "string-length" => Builtin::StringLength,
            "string" => Builtin::String,
            "concat" => Builtin::Concat,
            "substring" => Builtin::Substring,
            "substring-before" => Builtin::SubstringBefore,
            "substring-after" => Builtin::SubstringAfter,
            "normalize-space" => Builtin::NormalizeSpace,
            "translate" => Builtin::Translate,
            "local-name" | "local-part" => Builtin::LocalName,
            "namespace-uri" => Builtin::NamespaceUri,
            "name" => Builtin::Name,
            "generate-id" => Builtin::GenerateId,
            "id" => Builtin::Id,
            "function-available" => Builtin::FunctionAvailable,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::True => "true",
            Builtin::False => "false",
            Builtin::Not => "not",
            Builtin::Boolean => "boolean",
            Builtin::StartsWith => "starts-with",
            Builtin::Contains => "contains",
            Builtin::Lang => "lang",
            Builtin::Number => "number",
            Builtin::Sum => "sum",
            Builtin::Floor => "floor",
            Builtin::Ceiling => "ceiling",
            Builtin::Round => "round",
            Builtin::Position => "position",
            Builtin::Last => "last",
            Builtin::Count => "count",
            Builtin::StringLength => "string-length",
            Builtin::String => "string",
            Builtin::Concat => "concat",
            Builtin::Substring => "substring",
            Builtin::SubstringBefore => "substring-before",
            Builtin::SubstringAfter => "substring-after",
            Builtin::NormalizeSpace => "normalize-space",
            Builtin::Translate => "translate",
            Builtin::LocalName => "local-name",
            Builtin::NamespaceUri => "namespace-uri",
            Builtin::Name => "name",
            Builtin::GenerateId => "generate-id",
            Builtin::Id => "id",
            Builtin::FunctionAvailable => "function-available",
        }
    }
}

fn arity_error<N>(function: &str, expected: &str) -> Result<XPathValue<N>, XPathError> {
    Err(XPathError::Function {
        function: function.to_string(),
        message: format!("expected {} argument(s)", expected),
    })
}

/// Dispatches a lowered builtin call.
pub fn evaluate_builtin<'a, N>(
    builtin: Builtin,
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match builtin {
        Builtin::True => Ok(XPathValue::Boolean(true)),
        Builtin::False => Ok(XPathValue::Boolean(false)),
        Builtin::Not => {
            if args.len() != 1 {
                return arity_error("not", "1");
            }
            Ok(XPathValue::Boolean(!args[0].to_bool()))
        }
        Builtin::Boolean => {
            if args.len() != 1 {
                return arity_error("boolean", "1");
            }
            Ok(XPathValue::Boolean(args[0].to_bool()))
        }
        Builtin::StartsWith => {
            if args.len() != 2 {
                return arity_error("starts-with", "2");
            }
            let prefix = args.remove(1).to_string();
            let s = args.remove(0).to_string();
            Ok(XPathValue::Boolean(s.starts_with(&prefix)))
        }
        Builtin::Contains => {
            if args.len() != 2 {
                return arity_error("contains", "2");
            }
            let needle = args.remove(1).to_string();
            let s = args.remove(0).to_string();
            Ok(XPathValue::Boolean(s.contains(&needle)))
        }
        Builtin::Lang => {
            if args.len() != 1 {
                return arity_error("lang", "1");
            }
            let wanted = args.remove(0).to_string().to_ascii_lowercase();
            Ok(XPathValue::Boolean(context_lang(e_ctx.context_node)
                .is_some_and(|lang| {
                    let lang = lang.to_ascii_lowercase();
                    lang == wanted || lang.starts_with(&format!("{}-", wanted))
                })))
        }
        Builtin::Number => {
            if args.len() > 1 {
                return arity_error("number", "0 or 1");
            }
            let n = match args.pop() {
                Some(v) => v.to_number(),
                None => string_to_number(&e_ctx.context_node.string_value()),
            };
            Ok(XPathValue::Double(n))
        }
        Builtin::Sum => {
            let nodes = node_set_arg("sum", &mut args, e_ctx)?;
            let total: f64 = nodes
                .iter()
                .map(|n| string_to_number(&n.string_value()))
                .sum();
            Ok(XPathValue::Double(total))
        }
        Builtin::Floor => {
            if args.len() != 1 {
                return arity_error("floor", "1");
            }
            Ok(XPathValue::Double(args[0].to_number().floor()))
        }
        Builtin::Ceiling => {
            if args.len() != 1 {
                return arity_error("ceiling", "1");
            }
            Ok(XPathValue::Double(args[0].to_number().ceil()))
        }
        Builtin::Round => {
            if args.len() != 1 {
                return arity_error("round", "1");
            }
            Ok(XPathValue::Double(xpath_round(args[0].to_number())))
        }
        Builtin::Position => {
            if !args.is_empty() {
                return arity_error("position", "0");
            }
            Ok(XPathValue::Long(e_ctx.context_position as i64))
        }
        Builtin::Last => {
            if !args.is_empty() {
                return arity_error("last", "0");
            }
            Ok(XPathValue::Long(e_ctx.context_size as i64))
        }
        Builtin::Count => {
            let nodes = node_set_arg("count", &mut args, e_ctx)?;
            Ok(XPathValue::Long(nodes.len() as i64))
        }
        Builtin::StringLength => {
            if args.len() > 1 {
                return arity_error("string-length", "0 or 1");
            }
            let s = match args.pop() {
                Some(v) => v.to_string(),
                None => e_ctx.context_node.string_value(),
            };
            Ok(XPathValue::Long(s.chars().count() as i64))
        }
        Builtin::String => {
            if args.len() > 1 {
                return arity_error("string", "0 or 1");
            }
            let s = match args.pop() {
                Some(v) => v.to_string(),
                None => e_ctx.context_node.string_value(),
            };
            Ok(XPathValue::String(s))
        }
        Builtin::Concat => {
            if args.len() < 2 {
                return arity_error("concat", "2 or more");
            }
            let mut out = String::new();
            for arg in &args {
                out.push_str(&arg.to_string());
            }
            Ok(XPathValue::String(out))
        }
        Builtin::Substring => func_substring(args),
        Builtin::SubstringBefore => {
            if args.len() != 2 {
                return arity_error("substring-before", "2");
            }
            let sep = args.remove(1).to_string();
            let s = args.remove(0).to_string();
            let result = s.split_once(&sep).map(|(before, _)| before).unwrap_or("");
            Ok(XPathValue::String(result.to_string()))
        }
        Builtin::SubstringAfter => {
            if args.len() != 2 {
                return arity_error("substring-after", "2");
            }
            let sep = args.remove(1).to_string();
            let s = args.remove(0).to_string();
            let result = s.split_once(&sep).map(|(_, after)| after).unwrap_or("");
            Ok(XPathValue::String(result.to_string()))
        }
        Builtin::NormalizeSpace => {
            if args.len() > 1 {
                return arity_error("normalize-space", "0 or 1");
            }
            let s = match args.pop() {
                Some(v) => v.to_string(),
                None => e_ctx.context_node.string_value(),
            };
            Ok(XPathValue::String(
                s.split_whitespace().collect::<Vec<_>>().join(" "),
            ))
        }
        Builtin::Translate => {
            if args.len() != 3 {
                return arity_error("translate", "3");
            }
            let to: Vec<char> = args.remove(2).to_string().chars().collect();
            let from: Vec<char> = args.remove(1).to_string().chars().collect();
            let s = args.remove(0).to_string();
            let mut out = String::with_capacity(s.len());
            for ch in s.chars() {
                match from.iter().position(|&f| f == ch) {
                    Some(i) => {
                        if let Some(&replacement) = to.get(i) {
                            out.push(replacement);
                        }
                        // dropped when `to` is shorter than `from`
                    }
                    None => out.push(ch),
                }
            }
            Ok(XPathValue::String(out))
        }
        Builtin::LocalName => {
            let node = optional_node_arg("local-name", &mut args, e_ctx)?;
            let s = node
                .and_then(|n| n.name())
                .map(|q| q.local_part.to_string())
                .unwrap_or_default();
            Ok(XPathValue::String(s))
        }
        Builtin::NamespaceUri => {
            let node = optional_node_arg("namespace-uri", &mut args, e_ctx)?;
            let s = node
                .and_then(|n| n.name())
                .and_then(|q| q.namespace)
                .map(str::to_string)
                .unwrap_or_default();
            Ok(XPathValue::String(s))
        }
        Builtin::Name => {
            let node = optional_node_arg("name", &mut args, e_ctx)?;
            let s = node
                .and_then(|n| n.name())
                .map(|q| q.qualified())
                .unwrap_or_default();
            Ok(XPathValue::String(s))
        }
        Builtin::GenerateId => {
            let node = optional_node_arg("generate-id", &mut args, e_ctx)?;
            let s = match node {
                Some(n) => {
                    let mut hasher = DefaultHasher::new();
                    n.hash(&mut hasher);
                    format!("N{:x}", hasher.finish())
                }
                None => String::new(),
            };
            Ok(XPathValue::String(s))
        }
        Builtin::Id => {
            if args.len() != 1 {
                return arity_error("id", "1");
            }
            let wanted: Vec<String> = match args.remove(0) {
                XPathValue::NodeSet(nodes) => nodes
                    .iter()
                    .flat_map(|n| {
                        n.string_value()
                            .split_whitespace()
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .collect(),
                other => other
                    .to_string()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            };
            Ok(XPathValue::NodeSet(
                e_ctx.env.nodes_with_ids(e_ctx.root_node, &wanted),
            ))
        }
        Builtin::FunctionAvailable => {
            if args.len() != 1 {
                return arity_error("function-available", "1");
            }
            let name = args.remove(0).to_string();
            let available =
                Builtin::lookup(&name).is_some() || e_ctx.env.function(&name).is_some();
            Ok(XPathValue::Boolean(available))
        }
    }
}

/// XPath rounding: round(x) is floor(x + 0.5), which sends -0.5 to 0.
fn xpath_round(x: f64) -> f64 {
    if x.is_nan() { x } else { (x + 0.5).floor() }
}

fn func_substring<'a, N>(mut args: Vec<XPathValue<N>>) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    if args.len() != 2 && args.len() != 3 {
        return arity_error("substring", "2 or 3");
    }
    let length = if args.len() == 3 {
        Some(xpath_round(args.remove(2).to_number()))
    } else {
        None
    };
    let start = xpath_round(args.remove(1).to_number());
    let s = args.remove(0).to_string();

    if start.is_nan() || length.is_some_and(f64::is_nan) {
        return Ok(XPathValue::String(String::new()));
    }

    let end = length.map(|len| start + len);
    let out: String = s
        .chars()
        .enumerate()
        .filter(|(i, _)| {
            let pos = (*i + 1) as f64;
            pos >= start && end.is_none_or(|e| pos < e)
        })
        .map(|(_, ch)| ch)
        .collect();
    Ok(XPathValue::String(out))
}

fn node_set_arg<'a, N>(
    function: &str,
    args: &mut Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match args.pop() {
        None => Ok(vec![e_ctx.context_node]),
        Some(XPathValue::NodeSet(nodes)) => Ok(nodes),
        Some(other) => Err(XPathError::Type(format!(
            "{}() requires a node-set, got {:?}",
            function, other
        ))),
    }
}

fn optional_node_arg<'a, N>(
    function: &str,
    args: &mut Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Option<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match args.pop() {
        None => Ok(Some(e_ctx.context_node)),
        Some(XPathValue::NodeSet(nodes)) => Ok(nodes.first().copied()),
        Some(other) => Err(XPathError::Type(format!(
            "{}() requires a node-set, got {:?}",
            function, other
        ))),
    }
}

fn context_lang<'a, N: DataSourceNode<'a>>(node: N) -> Option<String> {
    let mut current = Some(node);
    while let Some(n) = current {
        if let Some(attr) = n.attribute("xml:lang") {
            return Some(attr.string_value());
        }
        current = n.parent();
    }
    None
}

// --- Environment-registered functions (deferred calls) ---

/// A function registered on an environment and called by name at evaluation
/// time, after parse-time resolution found no builtin or extension.
pub trait XPathFun<N> {
    fn call(&self, args: Vec<XPathValue<N>>) -> Result<XPathValue<N>, XPathError>;
}

impl<N, F> XPathFun<N> for F
where
    F: Fn(Vec<XPathValue<N>>) -> Result<XPathValue<N>, XPathError>,
{
    fn call(&self, args: Vec<XPathValue<N>>) -> Result<XPathValue<N>, XPathError> {
        self(args)
    }
}

// --- Extension functions (parse-time resolved) ---

/// How an extension callable consumes its arguments. `Instance` descriptors
/// take their receiver as the first argument, so a call with N arguments
/// matches a descriptor declaring N-1 parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Constructor,
    Static,
    Instance,
}

/// The declared signatures the parser resolves qualified function names
/// against. Registration keys are either a literal name (`fn:trace`) or the
/// `{uri}local` form produced by resolving a prefix through the namespace
/// context.
#[derive(Debug, Clone, Default)]
pub struct ExtensionSignatures {
    signatures: HashMap<String, Vec<(ExtensionKind, usize)>>,
}

impl ExtensionSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, key: &str, kind: ExtensionKind, param_count: usize) {
        self.signatures
            .entry(key.to_string())
            .or_default()
            .push((kind, param_count));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.signatures.contains_key(key)
    }

    /// Resolves a call with `arg_count` arguments. Constructors and statics
    /// must match the declared parameter count exactly; instance callables
    /// match when the count minus the receiver does.
    pub fn resolve(&self, name: &str, key: &str, arg_count: usize) -> Result<ExtensionKind, XPathError> {
        let candidates = self.signatures.get(key).ok_or_else(|| {
            XPathError::ExtensionResolution {
                name: name.to_string(),
                message: "unknown extension function".to_string(),
            }
        })?;

        for wanted in [
            ExtensionKind::Constructor,
            ExtensionKind::Instance,
            ExtensionKind::Static,
        ] {
            for (kind, params) in candidates {
                if *kind != wanted {
                    continue;
                }
                let matches = match kind {
                    ExtensionKind::Instance => arg_count > 0 && *params == arg_count - 1,
                    _ => *params == arg_count,
                };
                if matches {
                    return Ok(*kind);
                }
            }
        }

        Err(XPathError::ExtensionResolution {
            name: name.to_string(),
            message: format!(
                "no overload accepts {} argument(s) among {} candidate(s)",
                arg_count,
                candidates.len()
            ),
        })
    }
}

/// Runtime half of the extension registry: the invoker closures, installed
/// on an environment. The signatures half is handed to the parser.
pub struct ExtensionRegistry<'a, N> {
    signatures: ExtensionSignatures,
    invokers: HashMap<String, Arc<dyn XPathFun<N> + 'a>>,
}

impl<'a, N> Default for ExtensionRegistry<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, N> ExtensionRegistry<'a, N> {
    pub fn new() -> Self {
        ExtensionRegistry {
            signatures: ExtensionSignatures::new(),
            invokers: HashMap::new(),
        }
    }

    /// Registers a callable under `key` (a literal name or `{uri}local`).
    /// A method named `new` is conventionally registered as a constructor.
    pub fn register(
        &mut self,
        key: &str,
        kind: ExtensionKind,
        param_count: usize,
        fun: impl XPathFun<N> + 'a,
    ) {
        self.signatures.declare(key, kind, param_count);
        self.invokers.insert(key.to_string(), Arc::new(fun));
    }

    pub fn signatures(&self) -> &ExtensionSignatures {
        &self.signatures
    }

    pub fn invoker(&self, key: &str) -> Option<Arc<dyn XPathFun<N> + 'a>> {
        self.invokers.get(key).cloned()
    }
}

impl<'a, N: DataSourceNode<'a> + 'a> ExtensionRegistry<'a, N> {
    /// Installs every registered invoker on an environment, so compiled
    /// extension calls can find them at evaluation time.
    pub fn install(&self, env: &mut crate::env::Environment<'a, N>) {
        for (key, fun) in &self.invokers {
            env.add_extension(key, fun.clone());
        }
    }
}
