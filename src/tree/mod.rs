//! Untyped configuration trees addressed by dotted paths.
//!
//! Values documents and control-plane specs are both handled as
//! `serde_json::Value` trees while they are being translated. This module
//! holds the path type and the small set of operations translation needs:
//! lookup, insertion that creates intermediate mappings, deletion, leaf
//! enumeration, deep merge, and a longest-prefix rule table.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// A tree operation hit a node of the wrong shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct TreeError {
    /// Dotted path where the operation failed
    pub path: String,
    /// What went wrong
    pub message: String,
}

impl TreeError {
    fn at(path: &[String], message: impl Into<String>) -> Self {
        Self {
            path: path.join("."),
            message: message.into(),
        }
    }
}

/// Sequence of mapping keys from the root of a tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(Vec<String>);

impl Path {
    /// The empty path, addressing the root
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Split a dotted string into a path. The empty string is the root.
    pub fn parse(dotted: &str) -> Self {
        if dotted.is_empty() {
            return Self::root();
        }
        Self(dotted.split('.').map(str::to_string).collect())
    }

    /// Path extended by one key
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.into());
        Self(segments)
    }

    /// Path extended by several keys
    pub fn join(&self, suffix: &[String]) -> Self {
        let mut segments = self.0.clone();
        segments.extend_from_slice(suffix);
        Self(segments)
    }

    /// Path without its last key, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        let (_, init) = self.0.split_last()?;
        Some(Self(init.to_vec()))
    }

    /// Last key, `None` for the root
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Keys from the root
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the root
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for Path {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

impl Borrow<[String]> for Path {
    fn borrow(&self) -> &[String] {
        &self.0
    }
}

impl std::ops::Deref for Path {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

/// Value at `path`, if every key along the way exists.
pub fn get<'a>(tree: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(tree, |node, key| node.as_object()?.get(key))
}

/// Write `value` at `path`, creating intermediate mappings.
///
/// Null nodes on the way are replaced by mappings. Any other non-mapping
/// node is an error: the tree is never silently reshaped.
pub fn set(tree: &mut Value, path: &[String], value: Value) -> Result<(), TreeError> {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return Ok(());
    };

    let mut node = tree;
    for (depth, key) in parents.iter().enumerate() {
        node = as_mapping(node, &path[..depth])?
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_mapping(node, parents)?.insert(last.clone(), value);
    Ok(())
}

fn as_mapping<'a>(
    node: &'a mut Value,
    at: &[String],
) -> Result<&'a mut Map<String, Value>, TreeError> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => Ok(map),
        other => Err(TreeError::at(
            at,
            format!("expected a mapping, found {}", type_name(other)),
        )),
    }
}

/// Remove the value at `path`, pruning mappings left empty by the removal.
pub fn delete(tree: &mut Value, path: &[String]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    let map = tree.as_object_mut()?;
    if rest.is_empty() {
        return map.remove(first);
    }
    let child = map.get_mut(first)?;
    let removed = delete(child, rest);
    if removed.is_some() && child.as_object().is_some_and(Map::is_empty) {
        map.remove(first);
    }
    removed
}

/// Empty strings, numeric zero and null count as "not configured".
pub fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Every leaf of `tree` with its path, in key order.
///
/// Scalars and sequences are leaves; empty mappings contribute nothing.
pub fn leaves(tree: &Value) -> Vec<(Path, Value)> {
    let mut out = Vec::new();
    collect_leaves(tree, Path::root(), &mut out);
    out
}

fn collect_leaves(node: &Value, path: Path, out: &mut Vec<(Path, Value)>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                collect_leaves(child, path.child(key.as_str()), out);
            }
        }
        leaf if !path.is_empty() => out.push((path, leaf.clone())),
        _ => {}
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key; anything
/// else in the overlay replaces what is in the base.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Human name of a JSON node type, for error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Rules keyed by path, matched against the longest prefix of a lookup path.
#[derive(Clone, Debug)]
pub struct PrefixTable<T> {
    entries: BTreeMap<Path, T>,
}

impl<T> Default for PrefixTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PrefixTable<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for `path`
    pub fn insert(&mut self, path: Path, rule: T) {
        self.entries.insert(path, rule);
    }

    /// Rule registered for exactly `path`
    pub fn get(&self, path: &[String]) -> Option<&T> {
        self.entries.get(path)
    }

    /// The rule with the longest key that is a prefix of `path`, together
    /// with that key's length.
    pub fn longest_prefix(&self, path: &[String]) -> Option<(usize, &T)> {
        (1..=path.len())
            .rev()
            .find_map(|len| self.entries.get(&path[..len]).map(|rule| (len, rule)))
    }

    /// All rules in key order
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &T)> {
        self.entries.iter()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no rules
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> FromIterator<(Path, T)> for PrefixTable<T> {
    fn from_iter<I: IntoIterator<Item = (Path, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
