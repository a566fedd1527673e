//! Placement of the typed tree in the user's source directory.
//!
//! The index redirects selected logical paths (shared modules, common
//! pictures) to other places in the source directory. Unpacking applies the
//! index forward; packing applies it in reverse, copying a shared file back
//! to every logical path that maps onto it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::index::IndexMapping;
use crate::manifest::MANIFEST_FILE;
use crate::pool::WorkerPool;

pub mod descent;

pub use descent::Descent;

/// One file of the typed tree and where it lands in the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub source:  PathBuf,
    pub logical: String,
    pub dest:    String,
}

/// Clear `out` and lay the typed tree `src` onto it.
pub fn unpack(src: &Path, out: &Path, index: &IndexMapping, pool: &WorkerPool) -> Result<()> {
    let placements = plan_unpack(src, index)?;
    fsutil::clear_dir(out)?;
    pool.run_units("organize", placements, |p| fsutil::copy(&p.source, &out.join(&p.dest)))
}

/// Destination of every file of `src`. When several logical paths share a
/// destination the first in path order is kept.
pub fn plan_unpack(src: &Path, index: &IndexMapping) -> Result<Vec<Placement>> {
    let mut claimed: BTreeMap<String, Placement> = BTreeMap::new();
    for (logical, source) in fsutil::walk_files(src)? {
        let dest = index.destination(&logical).to_string();
        check_inside(&dest)?;
        if let Some(first) = claimed.get(&dest) {
            if fsutil::read(&first.source)? != fsutil::read(&source)? {
                warn!(
                    dest = %dest, kept = %first.logical, dropped = %logical,
                    "paths sharing a destination differ, first one kept"
                );
            }
            continue;
        }
        claimed.insert(dest.clone(), Placement { source, logical, dest });
    }
    Ok(claimed.into_values().collect())
}

/// Rebuild the typed tree in `stage3` from the source directory `in_dir`.
pub fn pack(in_dir: &Path, stage3: &Path, index: &IndexMapping, pool: &WorkerPool) -> Result<()> {
    pack_files(fsutil::walk_files(in_dir)?, stage3, index, pool)
}

/// [`pack`] over an explicit `(relative path, file)` listing.
pub fn pack_files(
    files: Vec<(String, PathBuf)>,
    stage3: &Path,
    index: &IndexMapping,
    pool: &WorkerPool,
) -> Result<()> {
    let placements = plan_pack(files, index);
    fsutil::clear_dir(stage3)?;
    pool.run_units("collect", placements, |p| fsutil::copy(&p.source, &stage3.join(&p.logical)))
}

/// Reverse mapping: every logical path each source file stands for.
pub fn plan_pack(files: Vec<(String, PathBuf)>, index: &IndexMapping) -> Vec<Placement> {
    let reverse = index.reverse();
    let mut placements = Vec::new();
    for (rel, source) in files {
        let mut logicals: Vec<&str> = reverse.get(rel.as_str()).cloned().unwrap_or_default();
        if index.redirects(&rel) {
            if logicals.is_empty() {
                debug!(path = %rel, "stale copy of a redirected path, skipped");
            }
        } else if logicals.is_empty() {
            logicals.push(rel.as_str());
        }
        for logical in logicals {
            placements.push(Placement { source: source.clone(), logical: logical.to_string(), dest: rel.clone() });
        }
    }

    let containers: HashSet<String> = placements
        .iter()
        .filter(|p| file_name(&p.logical) == MANIFEST_FILE)
        .map(|p| fsutil::logical_parent(&p.logical).to_string())
        .collect();
    placements.retain(|p| {
        let inside = containers.contains(fsutil::logical_parent(&p.logical));
        if !inside {
            warn!(path = %p.dest, "not inside a container directory, skipped");
        }
        inside
    });
    placements
}

fn file_name(logical: &str) -> &str {
    logical.rsplit_once('/').map_or(logical, |(_, name)| name)
}

fn check_inside(dest: &str) -> Result<()> {
    let escapes = Path::new(dest)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || dest.is_empty() {
        return Err(Error::InvalidOption(format!("index destination '{dest}' leaves the source directory")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(paths: &[&str]) -> Vec<(String, PathBuf)> {
        paths.iter().map(|p| (p.to_string(), PathBuf::from(p))).collect()
    }

    fn logicals(placements: &[Placement]) -> Vec<&str> {
        placements.iter().map(|p| p.logical.as_str()).collect()
    }

    #[test]
    fn shared_destination_fans_out_on_pack() {
        let index = IndexMapping::from_pairs([("a/m.bsl", "common/m.bsl"), ("b/m.bsl", "common/m.bsl")]);
        let files = listing(&[".container.json", "a/.container.json", "b/.container.json", "common/m.bsl"]);
        let plan = plan_pack(files, &index);
        assert_eq!(
            logicals(&plan),
            vec![".container.json", "a/.container.json", "b/.container.json", "a/m.bsl", "b/m.bsl"]
        );
    }

    #[test]
    fn stale_and_orphan_files_are_skipped() {
        let index = IndexMapping::from_pairs([("a/m.bsl", "common/m.bsl")]);
        let files = listing(&[".container.json", "a/.container.json", "a/m.bsl", "notes/readme.txt"]);
        let plan = plan_pack(files, &index);
        assert_eq!(logicals(&plan), vec![".container.json", "a/.container.json"]);
    }

    #[test]
    fn first_path_wins_a_shared_destination() {
        let tmp = tempfile::tempdir().unwrap();
        fsutil::write(&tmp.path().join("a/m.bsl"), b"one").unwrap();
        fsutil::write(&tmp.path().join("b/m.bsl"), b"two").unwrap();
        let index = IndexMapping::from_pairs([("a/m.bsl", "common/m.bsl"), ("b/m.bsl", "common/m.bsl")]);
        let plan = plan_unpack(tmp.path(), &index).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].logical, "a/m.bsl");
    }

    #[test]
    fn escaping_destination_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fsutil::write(&tmp.path().join("a.txt"), b"x").unwrap();
        let index = IndexMapping::from_pairs([("a.txt", "x/../../a.txt")]);
        assert!(matches!(plan_unpack(tmp.path(), &index), Err(Error::InvalidOption(_))));
    }
}
