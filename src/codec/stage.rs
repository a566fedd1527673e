use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::block::looks_like_container;
use crate::container::{build_from_dir, extract_to_dir, ExtractMode};
use crate::error::{Error, Result, ResultExt};
use crate::fsutil;
use crate::manifest::{Manifest, ManifestEntry};
use crate::pool::WorkerPool;

use super::{get_codec, sniff_deflate, CodecId, Sniffed};

/// Inflate every block of the container directory `src` into `dst`.
///
/// In a compressed container each block is sniffed on its own: a DEFLATE
/// stream is inflated and its entry marked `deflated`, anything else is
/// copied through. A block whose bytes turn out to be a container is
/// expanded into a subdirectory.
pub fn decompress_and_extract(src: &Path, dst: &Path, pool: &WorkerPool) -> Result<()> {
    let mut manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    let inflated = Mutex::new(HashSet::new());

    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("decompress", units, |entry| {
        let from = src.join(&entry.file);
        let to = dst.join(&entry.file);
        if from.is_dir() {
            return copy_tree(&from, &to);
        }
        let raw = fsutil::read(&from)?;
        let data = if manifest.compressed {
            let sniffed = sniff_deflate(&raw).map_err(|e| Error::CorruptCompressedBlock {
                block:  entry.name.clone(),
                reason: e.to_string(),
            })?;
            match sniffed {
                Sniffed::Inflated(data) => {
                    inflated.lock().unwrap_or_else(|p| p.into_inner()).insert(entry.file.clone());
                    data
                }
                Sniffed::Stored => {
                    debug!(block = %entry.name, "not deflated, copied through");
                    raw
                }
            }
        } else {
            raw
        };
        if looks_like_container(&data) {
            debug!(block = %entry.name, "expanding nested container");
            extract_to_dir(&data, &to, ExtractMode { compressed: false, recursive: true })
                .with_context(|| format!("expanding nested container '{}'", entry.name))?;
        } else {
            fsutil::write(&to, &data)?;
        }
        Ok(())
    })?;

    let inflated = inflated.into_inner().unwrap_or_else(|p| p.into_inner());
    for entry in &mut manifest.entries {
        entry.deflated = inflated.contains(&entry.file);
    }
    manifest.save(dst)
}

/// Inverse of [`decompress_and_extract`]: rebuild nested directories into
/// container bytes and deflate the blocks marked `deflated`.
pub fn compress_and_build(src: &Path, dst: &Path, pool: &WorkerPool) -> Result<()> {
    let mut manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    manifest.entries.retain(|entry| {
        let present = src.join(&entry.file).exists();
        if !present {
            warn!(block = %entry.name, "block missing before compression, dropped");
        }
        present
    });

    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("compress", units, |entry| {
        let from = src.join(&entry.file);
        let data = if from.is_dir() {
            build_from_dir(&from).with_context(|| format!("building nested container '{}'", entry.name))?
        } else {
            fsutil::read(&from)?
        };
        let codec = get_codec(CodecId::for_block(entry.deflated));
        debug!(block = %entry.name, codec = codec.codec_id().name(), bytes = data.len(), "compressing");
        let packed = codec.compress(&data).map_err(|e| Error::CorruptCompressedBlock {
            block:  entry.name.clone(),
            reason: e.to_string(),
        })?;
        fsutil::write(&dst.join(&entry.file), &packed)
    })?;

    manifest.save(dst)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for (rel, path) in fsutil::walk_files(from)? {
        fsutil::copy(&path, &to.join(rel))?;
    }
    Ok(())
}
