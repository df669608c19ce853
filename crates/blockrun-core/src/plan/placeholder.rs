//! `${scope.path}` placeholder parsing and resolution.
//!
//! Four scopes are recognized:
//!
//! - `vars.<path>` -- dotted lookup in the variable bag (missing -> null)
//! - `env.<NAME>` -- process environment
//! - `config.<path>` -- delegated to the [`ConfigStore`]
//! - `<node>.<alias>[.<path>]` -- a published output of a settled node
//!
//! Node references are the only scope that can be *pending*: the referenced
//! node has not produced its outputs yet. Callers treat a pending reference
//! as "not ready" and defer the node rather than failing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config_store::ConfigStore;

/// Scope names that are never node ids.
pub const RESERVED_SCOPES: [&str; 3] = ["vars", "env", "config"];

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A parsed placeholder body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Vars(Vec<String>),
    Env(String),
    Config(String),
    Node {
        node: String,
        alias: String,
        path: Vec<String>,
    },
}

impl Reference {
    /// Parse the text between `${` and `}`.
    pub fn parse(body: &str) -> Result<Self, String> {
        let body = body.trim();
        if body.is_empty() {
            return Err("empty placeholder".to_string());
        }
        let mut segments = body.split('.').map(str::trim);
        let scope = segments.next().unwrap_or_default();
        if scope.is_empty() {
            return Err(format!("'${{{body}}}' is missing a scope"));
        }
        let rest: Vec<String> = segments.map(str::to_string).collect();
        if rest.iter().any(String::is_empty) {
            return Err(format!("empty path segment in '${{{body}}}'"));
        }

        match scope {
            "vars" => Ok(Reference::Vars(rest)),
            "env" => match rest.as_slice() {
                [name] => Ok(Reference::Env(name.clone())),
                _ => Err(format!("'${{{body}}}' must name exactly one variable")),
            },
            "config" => {
                if rest.is_empty() {
                    Err(format!("'${{{body}}}' is missing a config path"))
                } else {
                    Ok(Reference::Config(rest.join(".")))
                }
            }
            node => {
                let mut rest = rest.into_iter();
                let alias = rest
                    .next()
                    .ok_or_else(|| format!("'${{{body}}}' must be <node>.<alias>"))?;
                Ok(Reference::Node {
                    node: node.to_string(),
                    alias,
                    path: rest.collect(),
                })
            }
        }
    }

    /// The referenced node id, for node-scoped references.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Reference::Node { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// A `${...}` occurrence inside a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span<'a> {
    pub start: usize,
    pub end: usize,
    pub body: &'a str,
}

/// Locate every `${...}` occurrence in `text`, in order.
///
/// An unterminated `${` ends the scan; the remainder is literal text.
pub fn find_placeholders(text: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some(rel) = text[offset..].find("${") {
        let start = offset + rel;
        let Some(close) = text[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + close + 1;
        spans.push(Span {
            start,
            end,
            body: &text[start + 2..end - 1],
        });
        offset = end;
    }
    spans
}

/// Every reference in a value, recursing through arrays and objects.
///
/// Unparseable placeholders are returned as `Err` so validation can report
/// them; resolution treats them as literal text.
pub fn scan_references(value: &Value) -> Vec<Result<Reference, String>> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<Result<Reference, String>>) {
    match value {
        Value::String(s) => found.extend(scan_text(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

/// References inside a plain string (guard or while condition text).
pub fn scan_text(text: &str) -> Vec<Result<Reference, String>> {
    find_placeholders(text)
        .into_iter()
        .map(|span| Reference::parse(span.body))
        .collect()
}

/// Node ids referenced anywhere in `value`.
pub fn node_references(value: &Value) -> BTreeSet<String> {
    scan_references(value)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|r| r.node_id().map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// Output table
// ---------------------------------------------------------------------------

/// Published outputs of settled nodes, visible to one plan execution.
///
/// Child runs (loop bodies) see their ancestors' outputs through `parent`.
/// A node skipped by its guard is present with an empty map, so references
/// to it resolve to null.
#[derive(Debug, Clone, Default)]
pub struct OutputTable {
    entries: HashMap<String, Map<String, Value>>,
    parent: Option<Arc<OutputTable>>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty table layered over a snapshot of `parent`.
    pub fn child_of(parent: Arc<OutputTable>) -> Self {
        Self {
            entries: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn insert(&mut self, node_id: impl Into<String>, published: Map<String, Value>) {
        self.entries.insert(node_id.into(), published);
    }

    /// Outputs of `node_id`, searching ancestors.
    pub fn get(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.entries
            .get(node_id)
            .or_else(|| self.parent.as_ref().and_then(|p| p.get(node_id)))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.get(node_id).is_some()
    }

    /// Whether `node_id` settled in this table (ignoring ancestors).
    pub fn contains_local(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    /// Outputs settled in this table (ignoring ancestors).
    pub fn local(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.entries.get(node_id)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// A node reference that cannot be resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("waiting on node '{node}'")]
pub struct Pending {
    pub node: String,
}

/// Resolves placeholders against one plan execution's visible state.
pub struct Resolver<'a> {
    vars: &'a Map<String, Value>,
    outputs: &'a OutputTable,
    config: &'a dyn ConfigStore,
}

impl<'a> Resolver<'a> {
    pub fn new(
        vars: &'a Map<String, Value>,
        outputs: &'a OutputTable,
        config: &'a dyn ConfigStore,
    ) -> Self {
        Self {
            vars,
            outputs,
            config,
        }
    }

    /// Resolve a single reference.
    pub fn lookup(&self, reference: &Reference) -> Result<Value, Pending> {
        match reference {
            Reference::Vars(path) => {
                let Some((head, tail)) = path.split_first() else {
                    return Ok(Value::Object(self.vars.clone()));
                };
                Ok(self
                    .vars
                    .get(head)
                    .and_then(|root| lookup_path(root, tail.iter().map(String::as_str)))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            Reference::Env(name) => Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null)),
            Reference::Config(path) => Ok(self.config.get(path).unwrap_or(Value::Null)),
            Reference::Node { node, alias, path } => {
                let outputs = self.outputs.get(node).ok_or_else(|| Pending {
                    node: node.clone(),
                })?;
                Ok(outputs
                    .get(alias)
                    .and_then(|root| lookup_path(root, path.iter().map(String::as_str)))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
        }
    }

    /// Deep-resolve a value.
    ///
    /// A string that is exactly one placeholder resolves to the referenced
    /// value with its type intact. Placeholders embedded in longer strings
    /// are string-coerced and concatenated.
    pub fn resolve(&self, value: &Value) -> Result<Value, Pending> {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.resolve_map(map).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Deep-resolve every entry of an input map.
    pub fn resolve_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>, Pending> {
        map.iter()
            .map(|(k, v)| self.resolve(v).map(|v| (k.clone(), v)))
            .collect()
    }

    fn resolve_str(&self, text: &str) -> Result<Value, Pending> {
        let spans = find_placeholders(text);
        if spans.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        if let [only] = spans.as_slice() {
            if only.start == 0 && only.end == text.len() {
                return match Reference::parse(only.body) {
                    Ok(reference) => self.lookup(&reference),
                    Err(_) => Ok(Value::String(text.to_string())),
                };
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for span in spans {
            out.push_str(&text[cursor..span.start]);
            match Reference::parse(span.body) {
                Ok(reference) => out.push_str(&value_to_string(&self.lookup(&reference)?)),
                Err(_) => out.push_str(&text[span.start..span.end]),
            }
            cursor = span.end;
        }
        out.push_str(&text[cursor..]);
        Ok(Value::String(out))
    }

    /// Node ids referenced by `value` that have not settled.
    pub fn pending_nodes(&self, value: &Value) -> BTreeSet<String> {
        node_references(value)
            .into_iter()
            .filter(|id| !self.outputs.contains(id))
            .collect()
    }
}

/// Walk `segments` into `root`. Numeric segments index arrays.
pub fn lookup_path<'v, 's>(
    root: &'v Value,
    segments: impl IntoIterator<Item = &'s str>,
) -> Option<&'v Value> {
    segments.into_iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// String form used when a value is spliced into a longer string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
