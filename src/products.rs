//! Batch runs over a products file.
//!
//! ```json
//! {
//!   "report": {"src": "src/report", "bin": "bin/Report.epf", "version": 803},
//!   "ext":    {"src": "src/ext", "bin": "bin/Ext.cfe", "version": "80316", "descent": 3.1, "gui": "2"}
//! }
//! ```
//!
//! Products run in document order. Relative paths are resolved against the
//! directory of the products file.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::pipeline::{self, BuildOptions, ExtractOptions, RunReport};
use crate::version::DEFAULT_VERSION;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub src: PathBuf,
    pub bin: PathBuf,
    #[serde(default)]
    pub temp: Option<PathBuf>,
    #[serde(default)]
    pub index: Option<PathBuf>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub descent: Option<String>,
    #[serde(default, deserialize_with = "gui_code")]
    pub gui: Option<u8>,
}

impl Product {
    fn resolve(mut self, base: &Path) -> Self {
        let join = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };
        self.src = join(self.src);
        self.bin = join(self.bin);
        self.temp = self.temp.map(join);
        self.index = self.index.map(join);
        self
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            temp_dir: self.temp.clone(),
            index:    self.index.clone(),
            version:  self.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            descent:  self.descent.clone(),
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            temp_dir: self.temp.clone(),
            index:    self.index.clone(),
            version:  self.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            descent:  self.descent.clone(),
            gui:      self.gui,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("expected a string or number, found {other}"))),
    }
}

fn gui_code<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u8>, D::Error> {
    let Some(text) = string_or_number(deserializer)? else {
        return Ok(None);
    };
    text.trim()
        .parse::<u8>()
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("gui must be a small integer, found '{text}'")))
}

/// Products of `path` in document order, or just `code` when given.
pub fn load_products(path: &Path, code: Option<&str>) -> Result<Vec<(String, Value)>> {
    let bytes = fsutil::read(path)?;
    let products: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidOption(format!("products file {}: {e}", path.display())))?;
    match code {
        None => Ok(products.into_iter().collect()),
        Some(code) => products
            .get(code)
            .map(|params| vec![(code.to_string(), params.clone())])
            .ok_or_else(|| Error::InvalidOption(format!("no product '{code}' in {}", path.display()))),
    }
}

fn run_each<F>(path: &Path, code: Option<&str>, operation: &'static str, run: F) -> Result<Vec<RunReport>>
where
    F: Fn(&Product) -> RunReport,
{
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut reports = Vec::new();
    for (name, params) in load_products(path, code)? {
        info!(product = %name, operation, "product");
        let report = match serde_json::from_value::<Product>(params) {
            Ok(product) => run(&product.resolve(base)),
            Err(e) => pipeline::report(
                operation,
                Path::new(&name),
                Instant::now(),
                Err(Error::InvalidOption(format!("product '{name}': {e}"))),
            ),
        };
        reports.push(report);
    }
    Ok(reports)
}

pub fn extract_all(path: &Path, code: Option<&str>) -> Result<Vec<RunReport>> {
    run_each(path, code, "extract", |p| pipeline::extract(&p.bin, &p.src, &p.extract_options()))
}

pub fn build_all(path: &Path, code: Option<&str>) -> Result<Vec<RunReport>> {
    run_each(path, code, "build", |p| pipeline::build(&p.src, &p.bin, &p.build_options()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_numbers_where_strings_are_expected() {
        let product: Product = serde_json::from_str(
            r#"{"src": "s", "bin": "b.cfe", "version": 80316, "descent": 3.1, "gui": "2"}"#,
        )
        .unwrap();
        assert_eq!(product.version.as_deref(), Some("80316"));
        assert_eq!(product.descent.as_deref(), Some("3.1"));
        assert_eq!(product.gui, Some(2));
        assert_eq!(product.build_options().gui, Some(2));
    }

    #[test]
    fn keeps_document_order_and_selects_by_code() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("products.json");
        std::fs::write(&path, r#"{"zeta": {"src": "a", "bin": "b"}, "alpha": {"src": "c", "bin": "d"}}"#).unwrap();
        let names: Vec<String> = load_products(&path, None).unwrap().into_iter().map(|p| p.0).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(load_products(&path, Some("alpha")).unwrap().len(), 1);
        assert!(load_products(&path, Some("missing")).is_err());
    }

    #[test]
    fn one_bad_product_does_not_stop_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("products.json");
        std::fs::write(&path, r#"{"broken": {"src": 1}, "absent": {"src": "none", "bin": "none.epf"}}"#).unwrap();
        let reports = extract_all(&path, None).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| !r.success));
    }
}
