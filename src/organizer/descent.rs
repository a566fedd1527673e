//! Layered source directories for derived packages.
//!
//! A descent such as `3.0.75` names a layer directory `<root>/3.0.75/` that
//! only holds what differs from its less specific ancestors `3.0` and `3`.
//! Reading resolves each path from the most specific layer that has it.
//! Unpacking into a layer never removes anything already there.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::index::IndexMapping;
use crate::pool::WorkerPool;

use super::{plan_unpack, pack_files};

const MAX_COMPONENTS: usize = 4;
const MAX_DIGITS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descent {
    components: Vec<String>,
}

impl Descent {
    pub fn parse(id: &str) -> Result<Self> {
        let components: Vec<String> = id.split('.').map(str::to_string).collect();
        let valid = components.len() <= MAX_COMPONENTS
            && components
                .iter()
                .all(|c| !c.is_empty() && c.len() <= MAX_DIGITS && c.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(Error::InvalidDescent(id.to_string()));
        }
        Ok(Self { components })
    }

    pub fn id(&self) -> String {
        self.components.join(".")
    }

    /// Layer ids from most to least specific: `3.0.75`, `3.0`, `3`.
    pub fn chain(&self) -> Vec<String> {
        (1..=self.components.len()).rev().map(|n| self.components[..n].join(".")).collect()
    }

    pub fn layer_dir(&self, root: &Path) -> PathBuf {
        root.join(self.id())
    }
}

impl fmt::Display for Descent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Write the typed tree `src` into this descent's layer of `root`, leaving
/// out files the nearest ancestor layer already holds byte for byte.
///
/// The layer is not cleared. A file the layer already has is always
/// overwritten, since it shadows the ancestors on the way back.
pub fn unpack(src: &Path, root: &Path, descent: &Descent, index: &IndexMapping, pool: &WorkerPool) -> Result<()> {
    let placements = plan_unpack(src, index)?;
    let layer = descent.layer_dir(root);
    let ancestors: Vec<PathBuf> = descent.chain().iter().skip(1).map(|id| root.join(id)).collect();
    fsutil::create_dir(&layer)?;
    debug!(layer = %descent, files = placements.len(), "unpacking into layer");

    pool.run_units("organize", placements, |p| {
        let data = fsutil::read(&p.source)?;
        let target = layer.join(&p.dest);
        if target.is_file() {
            return fsutil::write(&target, &data);
        }
        if let Some(inherited) = nearest(&ancestors, &p.dest) {
            if blake3::hash(&fsutil::read(&inherited)?) == blake3::hash(&data) {
                debug!(path = %p.dest, from = %inherited.display(), "inherited, not written");
                return Ok(());
            }
        }
        fsutil::write(&target, &data)
    })
}

/// Rebuild the typed tree from the layers of `root` visible to `descent`.
pub fn pack(root: &Path, stage3: &Path, descent: &Descent, index: &IndexMapping, pool: &WorkerPool) -> Result<()> {
    pack_files(resolve_view(root, descent)?, stage3, index, pool)
}

/// Every relative path visible through the chain, each from the most
/// specific layer that has it. Absent layers are skipped.
pub fn resolve_view(root: &Path, descent: &Descent) -> Result<Vec<(String, PathBuf)>> {
    let mut view: BTreeMap<String, PathBuf> = BTreeMap::new();
    for id in descent.chain().iter().rev() {
        let layer = root.join(id);
        if !layer.is_dir() {
            debug!(layer = %id, "layer absent, skipped");
            continue;
        }
        view.extend(fsutil::walk_files(&layer)?);
    }
    Ok(view.into_iter().collect())
}

fn nearest(layers: &[PathBuf], rel: &str) -> Option<PathBuf> {
    layers.iter().map(|layer| layer.join(rel)).find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_builds_prefix_chain() {
        let d = Descent::parse("3.0.75.100").unwrap();
        assert_eq!(d.chain(), vec!["3.0.75.100", "3.0.75", "3.0", "3"]);
        assert_eq!(Descent::parse("7").unwrap().chain(), vec!["7"]);
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in ["", "3.", "1.2.3.4.5", "1234", "a.b", "3..1"] {
            assert!(matches!(Descent::parse(id), Err(Error::InvalidDescent(_))), "{id}");
        }
    }

    #[test]
    fn view_prefers_specific_layers_and_skips_absent_ones() {
        let tmp = tempfile::tempdir().unwrap();
        fsutil::write(&tmp.path().join("3/a.txt"), b"base").unwrap();
        fsutil::write(&tmp.path().join("3/b.txt"), b"base").unwrap();
        fsutil::write(&tmp.path().join("3.0.75/a.txt"), b"derived").unwrap();
        fsutil::write(&tmp.path().join("3.0.75.1/b.txt"), b"too specific").unwrap();

        let view = resolve_view(tmp.path(), &Descent::parse("3.0.75").unwrap()).unwrap();
        let view: Vec<(String, Vec<u8>)> =
            view.into_iter().map(|(rel, path)| (rel, std::fs::read(path).unwrap())).collect();
        assert_eq!(
            view,
            vec![("a.txt".to_string(), b"derived".to_vec()), ("b.txt".to_string(), b"base".to_vec())]
        );
    }

    #[test]
    fn unpack_writes_only_differences() {
        let tmp = tempfile::tempdir().unwrap();
        let (typed, root) = (tmp.path().join("typed"), tmp.path().join("src"));
        fsutil::write(&typed.join("same.txt"), b"shared").unwrap();
        fsutil::write(&typed.join("changed.txt"), b"new").unwrap();
        fsutil::write(&root.join("3/same.txt"), b"shared").unwrap();
        fsutil::write(&root.join("3/changed.txt"), b"old").unwrap();
        fsutil::write(&root.join("3.1/mine.txt"), b"kept").unwrap();

        let pool = WorkerPool::new(2).unwrap();
        unpack(&typed, &root, &Descent::parse("3.1").unwrap(), &IndexMapping::default(), &pool).unwrap();
        assert!(!root.join("3.1/same.txt").exists());
        assert_eq!(std::fs::read(root.join("3.1/mine.txt")).unwrap(), b"kept");
        assert_eq!(std::fs::read(root.join("3.1/changed.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(root.join("3/changed.txt")).unwrap(), b"old");
    }

    #[test]
    fn shadowing_copy_in_layer_is_refreshed() {
        let tmp = tempfile::tempdir().unwrap();
        let (typed, root) = (tmp.path().join("typed"), tmp.path().join("src"));
        fsutil::write(&typed.join("a.txt"), b"base").unwrap();
        fsutil::write(&root.join("3/a.txt"), b"base").unwrap();
        fsutil::write(&root.join("3.1/a.txt"), b"outdated").unwrap();

        let pool = WorkerPool::new(1).unwrap();
        let descent = Descent::parse("3.1").unwrap();
        unpack(&typed, &root, &descent, &IndexMapping::default(), &pool).unwrap();
        let view = resolve_view(&root, &descent).unwrap();
        assert_eq!(std::fs::read(&view[0].1).unwrap(), b"base");
    }
}
