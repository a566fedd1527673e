//! Path redirection index.
//!
//! An index maps a logical path of the typed tree (`Forms/Main/module.bsl`)
//! to the place the file lives in the source directory (`common/main.bsl`).
//! Paths not in the index stay where they are.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsutil;

/// Key of the primary document naming additional documents to merge first.
pub const INCLUDE_KEY: &str = "index.json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMapping {
    map: BTreeMap<String, String>,
}

impl IndexMapping {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (normalize(k.as_ref()), normalize(v.as_ref())))
            .collect();
        Self { map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, logical: &str) -> Option<&str> {
        self.map.get(logical).map(String::as_str)
    }

    /// Where `logical` lives in the source directory.
    pub fn destination<'a>(&'a self, logical: &'a str) -> &'a str {
        self.get(logical).unwrap_or(logical)
    }

    /// True when the index sends `logical` somewhere other than itself.
    pub fn redirects(&self, logical: &str) -> bool {
        self.get(logical).map_or(false, |dest| dest != logical)
    }

    /// Destination → every logical path mapped onto it, in key order.
    pub fn reverse(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut reverse: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (logical, dest) in &self.map {
            reverse.entry(dest.as_str()).or_default().push(logical.as_str());
        }
        reverse
    }
}

/// Right fold over `mappings`: on a key collision the later mapping wins.
pub fn merge(mappings: Vec<IndexMapping>) -> IndexMapping {
    mappings.into_iter().fold(IndexMapping::default(), |mut acc, next| {
        acc.map.extend(next.map);
        acc
    })
}

/// Load a primary index document and the documents it includes.
///
/// Included documents are merged first, in listed order, and the primary's
/// own keys last. If any included document is empty the whole index is
/// empty.
pub fn load_index(path: &Path) -> Result<IndexMapping> {
    let mut primary = read_object(path)?;
    let includes = match primary.remove(INCLUDE_KEY) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(load_error(path, format!("'{INCLUDE_KEY}' lists a non-string {other}"))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(load_error(path, format!("'{INCLUDE_KEY}' must be an array, found {other}")));
        }
    };

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut mappings = Vec::with_capacity(includes.len() + 1);
    for include in includes {
        let sub_path = resolve(base, &include);
        let sub = to_mapping(&sub_path, read_object(&sub_path)?)?;
        if sub.is_empty() {
            warn!(index = %path.display(), include = %sub_path.display(), "included index is empty, whole index dropped");
            return Ok(IndexMapping::default());
        }
        debug!(include = %sub_path.display(), entries = sub.len(), "index document loaded");
        mappings.push(sub);
    }
    mappings.push(to_mapping(path, primary)?);
    Ok(merge(mappings))
}

fn resolve(base: &Path, include: &str) -> PathBuf {
    let include = Path::new(include);
    if include.is_absolute() {
        include.to_path_buf()
    } else {
        base.join(include)
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let bytes = fsutil::read(path).map_err(|e| load_error(path, crate::error::chain(&e)))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(load_error(path, format!("expected a JSON object, found {}", type_name(&other)))),
        Err(e) => Err(load_error(path, e.to_string())),
    }
}

fn to_mapping(path: &Path, object: Map<String, Value>) -> Result<IndexMapping> {
    let mut pairs = Vec::with_capacity(object.len());
    for (key, value) in object {
        match value {
            Value::String(dest) => pairs.push((key, dest)),
            other => return Err(load_error(path, format!("'{key}' maps to a {}", type_name(&other)))),
        }
    }
    Ok(IndexMapping::from_pairs(pairs))
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = path.trim_start_matches("./").trim_start_matches('/');
    path.to_string()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn load_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::IndexLoad { path: path.to_path_buf(), reason: reason.into() }
}
