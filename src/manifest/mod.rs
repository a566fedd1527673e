//! Per-directory container manifest.
//!
//! Every directory that stands for a container carries a `.container.json`
//! describing the container header, the block order, the block names and
//! their timestamps. Block files are addressed by their *stem*: the
//! sanitized block name. Stages append extensions to a stem (`meta.json`,
//! `text1.txt`) but never change it, so the manifest written by the first
//! stage stays valid for all later generations.
//!
//! Header words and page geometry the writer cannot derive are kept here
//! too, and only when they differ from its defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::block::PageSpec;
use crate::container::EntryLayout;
use crate::error::{Error, Result};
use crate::header::DEFAULT_PAGE_SIZE;

pub const MANIFEST_FILE: &str = ".container.json";

/// Every extension a stage appends to a stem.
pub const MATERIALIZED_EXTS: [&str; 8] = ["json", "txt", "bsl", "png", "jpg", "gif", "bmp", "bin"];

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Container,
    Form,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Block name exactly as stored in the container.
    pub name: String,
    /// Sanitized on-disk stem, unique within the container.
    pub file: String,
    #[serde(default)]
    pub ctime: u64,
    #[serde(default)]
    pub mtime: u64,
    /// Stored as a raw DEFLATE stream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deflated: bool,
    #[serde(default, skip_serializing_if = "EntryLayout::is_default")]
    pub layout: EntryLayout,
}

impl ManifestEntry {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name:     name.into(),
            file:     file.into(),
            ctime:    0,
            mtime:    0,
            deflated: false,
            layout:   EntryLayout::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub page_size: u32,
    #[serde(default)]
    pub storage_version: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reserved: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc_pages: Option<Vec<PageSpec>>,
    /// Blocks of this container may be deflated (true for a root
    /// container); see [`ManifestEntry::deflated`].
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub kind: ContainerKind,
    pub entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            storage_version: 0,
            reserved: 0,
            toc_pages: None,
            compressed: false,
            kind: ContainerKind::Container,
            entries: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        Self::from_bytes(&bytes).map_err(|source| Error::Manifest { path, source })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = self
            .to_bytes()
            .map_err(|source| Error::Manifest { path: path.clone(), source })?;
        fs::write(&path, bytes).map_err(|e| Error::io(&path, e))
    }

    pub fn stems(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.file.as_str()).collect()
    }
}

/// Map a block name onto a file-system-safe stem.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Sanitize every name, disambiguating collisions with a `~N` suffix.
///
/// A stem claims itself and every `<stem>.<ext>` of [`MATERIALIZED_EXTS`],
/// case-insensitively, so the files of one block are never taken for
/// another's: blocks `a` and `a.json` get stems `a` and `a.json~1`.
pub fn assign_stems<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let base = sanitize(name);
            let mut stem = base.clone();
            let mut n = 1;
            loop {
                let claims = claims(&stem);
                if !claims.iter().any(|claim| taken.contains(claim)) {
                    taken.extend(claims);
                    break stem;
                }
                stem = format!("{base}~{n}");
                n += 1;
            }
        })
        .collect()
}

fn claims(stem: &str) -> Vec<String> {
    let stem = stem.to_lowercase();
    MATERIALIZED_EXTS
        .iter()
        .map(|ext| format!("{stem}.{ext}"))
        .chain(std::iter::once(stem.clone()))
        .collect()
}
