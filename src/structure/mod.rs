//! Typed tree of a container.
//!
//! `decode` turns the flat stage-2 tree (property tables as JSON, everything
//! else raw) into the tree users edit: wide text as `.txt`, module source
//! as `.bsl`, pictures under their format extension, forms and other nested
//! containers as directories. `encode` is the inverse and derives each
//! block's kind from the extension of the file that carries its stem.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result, ResultExt};
use crate::fsutil::{self, StemMatch};
use crate::manifest::{ContainerKind, Manifest, ManifestEntry, MANIFEST_FILE};
use crate::pool::WorkerPool;
use crate::version::VersionProfile;

pub mod kind;

pub use kind::{Kind, Leaf};

const PICTURE_EXTS: [&str; 4] = ["png", "jpg", "gif", "bmp"];

/// One block of the typed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureNode {
    /// JSON form of a property table.
    Meta(Vec<u8>),
    Leaf(Leaf),
    Container {
        manifest: Manifest,
        children: Vec<(ManifestEntry, StructureNode)>,
    },
}

impl StructureNode {
    pub fn kind(&self) -> Kind {
        match self {
            StructureNode::Meta(_) => Kind::Meta,
            StructureNode::Leaf(leaf) => leaf.kind(),
            StructureNode::Container { manifest, .. } => match manifest.kind {
                ContainerKind::Form => Kind::Form,
                ContainerKind::Container => Kind::Subcontainer,
            },
        }
    }
}

// ── Decode ───────────────────────────────────────────────────────────────────

pub fn decode(src: &Path, dst: &Path, profile: &VersionProfile, pool: &WorkerPool) -> Result<()> {
    let manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("structure decode", units, |entry| {
        match read_flat(src, entry, profile)? {
            Some(node) => write_typed(dst, &entry.file, &node),
            None => Ok(()),
        }
    })?;
    manifest.save(dst)
}

fn read_flat(dir: &Path, entry: &ManifestEntry, profile: &VersionProfile) -> Result<Option<StructureNode>> {
    let table = dir.join(format!("{}.json", entry.file));
    let plain = dir.join(&entry.file);
    if table.is_file() {
        Ok(Some(StructureNode::Meta(fsutil::read(&table)?)))
    } else if plain.is_dir() {
        read_flat_dir(&plain, profile)
            .with_context(|| format!("in container '{}'", entry.name))
            .map(Some)
    } else if plain.is_file() {
        Ok(Some(StructureNode::Leaf(Leaf::classify(fsutil::read(&plain)?, profile.text))))
    } else {
        warn!(block = %entry.name, "block file missing, skipped");
        Ok(None)
    }
}

fn read_flat_dir(dir: &Path, profile: &VersionProfile) -> Result<StructureNode> {
    let mut manifest = Manifest::load(dir)?;
    let mut children = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        if let Some(node) = read_flat(dir, entry, profile)? {
            children.push((entry.clone(), node));
        }
    }
    manifest.kind = if is_form(&children, profile) {
        ContainerKind::Form
    } else {
        ContainerKind::Container
    };
    Ok(StructureNode::Container { manifest, children })
}

/// A container is a form when every child sits in one of the profile's form
/// slots with an allowed kind and the `form` slot itself is present.
fn is_form(children: &[(ManifestEntry, StructureNode)], profile: &VersionProfile) -> bool {
    children.iter().any(|(entry, _)| entry.name == "form")
        && children.iter().all(|(entry, node)| {
            profile
                .form_slot(&entry.name)
                .map_or(false, |slot| slot.kinds.contains(&node.kind()))
        })
}

fn write_typed(dir: &Path, stem: &str, node: &StructureNode) -> Result<()> {
    match node {
        StructureNode::Meta(json) => fsutil::write(&dir.join(format!("{stem}.json")), json),
        StructureNode::Leaf(leaf) => {
            fsutil::write(&dir.join(format!("{stem}.{}", leaf.ext())), leaf.file_bytes())
        }
        StructureNode::Container { manifest, children } => {
            let sub = dir.join(stem);
            fsutil::create_dir(&sub)?;
            for (entry, child) in children {
                write_typed(&sub, &entry.file, child)?;
            }
            manifest.save(&sub)
        }
    }
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Rebuild the stage-2 tree from the typed tree. `gui` rewrites the
/// compatibility property of every root-level property table that has one.
pub fn encode(
    src: &Path,
    dst: &Path,
    profile: &VersionProfile,
    gui: Option<u8>,
    pool: &WorkerPool,
) -> Result<()> {
    if !Manifest::exists(src) {
        return Err(Error::mismatch(src, "source root has no container manifest"));
    }
    let manifest = Manifest::load(src)?;
    check_unlisted(src, &manifest, profile)?;
    fsutil::create_dir(dst)?;

    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("structure encode", units, |entry| {
        let Some(mut node) = read_typed(src, entry, profile)? else {
            return Ok(());
        };
        if let (Some(gui), StructureNode::Meta(json)) = (gui, &mut node) {
            *json = override_compat(&entry.name, json, profile, gui)?;
        }
        write_flat(dst, &entry.file, &node, profile)
    })?;
    manifest.save(dst)
}

fn read_typed(dir: &Path, entry: &ManifestEntry, profile: &VersionProfile) -> Result<Option<StructureNode>> {
    let mut found = fsutil::find_stem(dir, &entry.file)?;
    if found.len() > 1 {
        return Err(Error::mismatch(
            dir.join(&entry.file),
            format!("{} files claim block '{}'", found.len(), entry.name),
        ));
    }
    let Some(found) = found.pop() else {
        warn!(block = %entry.name, dir = %dir.display(), "no file for block, skipped");
        return Ok(None);
    };

    let node = match found {
        StemMatch::Dir(path) => read_typed_dir(&path, profile)
            .with_context(|| format!("in container '{}'", entry.name))?,
        StemMatch::File { path, ext } => match Kind::from_ext(&ext).filter(|kind| !kind.is_container()) {
            Some(Kind::Meta) => StructureNode::Meta(fsutil::read(&path)?),
            Some(Kind::Text) => StructureNode::Leaf(Leaf::Text(read_utf8(&path)?)),
            Some(Kind::Module) => StructureNode::Leaf(Leaf::Module(read_utf8(&path)?)),
            Some(Kind::Picture) => {
                let ext = PICTURE_EXTS.iter().copied().find(|e| *e == ext).unwrap_or("bin");
                StructureNode::Leaf(Leaf::Picture { ext, data: fsutil::read(&path)? })
            }
            Some(Kind::Unknown) => StructureNode::Leaf(Leaf::Unknown(fsutil::read(&path)?)),
            _ => {
                return Err(Error::mismatch(&path, format!("unrecognized extension '.{ext}'")));
            }
        },
    };
    Ok(Some(node))
}

fn read_typed_dir(dir: &Path, profile: &VersionProfile) -> Result<StructureNode> {
    if !Manifest::exists(dir) {
        return Err(Error::mismatch(dir, "directory has no container manifest"));
    }
    let manifest = Manifest::load(dir)?;
    check_unlisted(dir, &manifest, profile)?;

    let mut children = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        let Some(node) = read_typed(dir, entry, profile)? else {
            continue;
        };
        if manifest.kind == ContainerKind::Form {
            let slot = profile.form_slot(&entry.name).ok_or_else(|| {
                Error::mismatch(
                    dir.join(&entry.file),
                    format!("'{}' is not a form slot in version {profile}", entry.name),
                )
            })?;
            if !slot.kinds.contains(&node.kind()) {
                return Err(Error::mismatch(
                    dir.join(&entry.file),
                    format!("form slot '{}' cannot hold {:?}", slot.name, node.kind()),
                ));
            }
        }
        children.push((entry.clone(), node));
    }
    Ok(StructureNode::Container { manifest, children })
}

/// Warn about directory entries the manifest does not list. Inside a form
/// an unlisted entry that is not even a slot name is an error.
fn check_unlisted(dir: &Path, manifest: &Manifest, profile: &VersionProfile) -> Result<()> {
    let stems: HashSet<&str> = manifest.stems();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == MANIFEST_FILE {
            continue;
        }
        let stem = if entry.path().is_dir() {
            name.as_str()
        } else {
            name.rsplit_once('.').map_or(name.as_str(), |(stem, _)| stem)
        };
        if stems.contains(stem) {
            continue;
        }
        if manifest.kind == ContainerKind::Form && profile.form_slot(stem).is_none() {
            return Err(Error::mismatch(entry.path(), "not a slot of this form"));
        }
        warn!(path = %entry.path().display(), "not listed in the container manifest, skipped");
    }
    Ok(())
}

fn read_utf8(path: &Path) -> Result<String> {
    String::from_utf8(fsutil::read(path)?)
        .map_err(|e| Error::TextEncoding { path: path.to_path_buf(), reason: e.to_string() })
}

fn override_compat(block: &str, json: &[u8], profile: &VersionProfile, gui: u8) -> Result<Vec<u8>> {
    let bad = |e: serde_json::Error| Error::MetadataFormat { block: block.to_string(), reason: e.to_string() };
    let mut map: Map<String, Value> = serde_json::from_slice(json).map_err(bad)?;
    match map.get_mut(profile.compat_key) {
        Some(value) => {
            debug!(block, from = %value, to = gui, "compatibility override");
            *value = Value::from(gui);
            serde_json::to_vec(&map).map_err(bad)
        }
        None => Ok(json.to_vec()),
    }
}

fn write_flat(dir: &Path, stem: &str, node: &StructureNode, profile: &VersionProfile) -> Result<()> {
    match node {
        StructureNode::Meta(json) => fsutil::write(&dir.join(format!("{stem}.json")), json),
        StructureNode::Leaf(leaf) => {
            let path = dir.join(stem);
            let bytes = leaf.block_bytes(profile.text).map_err(|c| Error::TextEncoding {
                path:   path.clone(),
                reason: format!("U+{:04X} is outside the {:?} table of version {profile}", u32::from(c), profile.text),
            })?;
            fsutil::write(&path, &bytes)
        }
        StructureNode::Container { manifest, children } => {
            let sub = dir.join(stem);
            fsutil::create_dir(&sub)?;
            for (entry, child) in children {
                write_flat(&sub, &entry.file, child, profile)?;
            }
            manifest.save(&sub)
        }
    }
}
