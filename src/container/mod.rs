//! Container engine: parse and build the v8 block container.
//!
//! # Reader
//! [`ContainerReader`] parses the 16-byte header, reads the TOC document at
//! offset 16 and resolves every entry's header and data documents. Page
//! chains are followed in pointer order and must stay inside the file.
//! When asked to, it recurses into blocks that are themselves containers,
//! down to [`MAX_NESTING_DEPTH`].
//!
//! # Writer
//! [`ContainerWriter`] lays blocks out in insertion order: header, TOC,
//! then a header document and a data document per block. A document is
//! stored as a single page unless the block carries the page geometry it
//! was read with ([`EntryLayout`]), in which case that geometry is replayed
//! as long as the data still fits it. Documents are placed contiguously
//! and page tails are zero-filled, so a container rebuilds byte-for-byte
//! unless its source had gaps, unreachable pages or non-zero padding.
//!
//! # Directory form
//! [`extract_to_dir`] and [`build_from_dir`] move a container to and from a
//! directory holding one file per block plus a [`Manifest`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use tracing::debug;

use crate::block::{looks_like_container, non_default, plan_pages, read_document, write_pages, PageSpec};
use crate::error::{Error, Result, ResultExt};
use crate::fsutil;
use crate::header::{ContainerHeader, END_MARKER, HEADER_SIZE};
use crate::manifest::{assign_stems, ContainerKind, Manifest, ManifestEntry};

/// Bound on container-in-block recursion.
pub const MAX_NESTING_DEPTH: usize = 16;

const TOC_ENTRY_SIZE: usize = 12;
const ENTRY_HEADER_FIXED: usize = 20;
const ENTRY_HEADER_TRAILER: usize = 4;

// ── Model ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    Leaf(Vec<u8>),
    Nested(Container),
}

/// Stored details of a block the writer cannot derive from its name and
/// data. Every field defaults to what [`ContainerWriter`] produces.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryLayout {
    /// Third word of the TOC entry; [`END_MARKER`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc_reserved: Option<u32>,
    /// Word between the timestamps and the name in the entry header.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attrs: u32,
    /// Zero UTF-16 units stored after the name.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub name_padding: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub trailer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_pages: Option<Vec<PageSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pages: Option<Vec<PageSpec>>,
}

impl EntryLayout {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name:   String,
    pub ctime:  u64,
    pub mtime:  u64,
    pub layout: EntryLayout,
    pub body:   BlockBody,
}

impl Block {
    pub fn leaf(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::with_body(name.into(), BlockBody::Leaf(data))
    }

    pub fn nested(name: impl Into<String>, container: Container) -> Self {
        Self::with_body(name.into(), BlockBody::Nested(container))
    }

    fn with_body(name: String, body: BlockBody) -> Self {
        Self { name, ctime: 0, mtime: 0, layout: EntryLayout::default(), body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    pub header:    ContainerHeader,
    /// TOC page geometry when it differs from a single page.
    pub toc_pages: Option<Vec<PageSpec>>,
    pub blocks:    Vec<Block>,
}

impl Container {
    pub fn new(header: ContainerHeader) -> Self {
        Self { header, toc_pages: None, blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) -> Result<()> {
        if self.blocks.iter().any(|b| b.name == block.name) {
            return Err(Error::malformed(format!("duplicate block name '{}'", block.name)));
        }
        self.blocks.push(block);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Parse `data`; see [`ContainerReader`].
    pub fn parse(data: &[u8], recursive: bool) -> Result<Self> {
        ContainerReader::new(data).recursive(recursive).read()
    }

    /// Serialize; see [`ContainerWriter`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        ContainerWriter::new(self.header).toc_pages(self.toc_pages.clone()).write(self)
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct ContainerReader<'a> {
    data:      &'a [u8],
    recursive: bool,
    depth:     usize,
}

impl<'a> ContainerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, recursive: false, depth: 0 }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn nested(&self, data: &'a [u8]) -> Self {
        Self { data, recursive: self.recursive, depth: self.depth + 1 }
    }

    pub fn read(&self) -> Result<Container> {
        if self.depth > MAX_NESTING_DEPTH {
            return Err(Error::malformed(format!(
                "containers nested deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        let header = ContainerHeader::read(Cursor::new(self.data))?;
        let (toc, toc_pages) = read_document(self.data, HEADER_SIZE as u32).context("reading TOC")?;
        if toc.len() % TOC_ENTRY_SIZE != 0 {
            return Err(Error::malformed(format!(
                "TOC size {} is not a multiple of {TOC_ENTRY_SIZE}",
                toc.len()
            )));
        }

        let mut container = Container::new(header);
        container.toc_pages = non_default(toc.len(), toc_pages, header.page_size);
        let mut seen = HashSet::new();
        let mut cursor = Cursor::new(&toc[..]);
        for index in 0..toc.len() / TOC_ENTRY_SIZE {
            let header_addr = cursor.read_u32::<LittleEndian>().map_err(truncated_toc)?;
            let data_addr = cursor.read_u32::<LittleEndian>().map_err(truncated_toc)?;
            let toc_reserved = cursor.read_u32::<LittleEndian>().map_err(truncated_toc)?;

            let (record, header_pages) = read_document(self.data, header_addr)
                .with_context(|| format!("reading header of TOC entry {index}"))?;
            let mut entry = parse_entry_header(&record)
                .with_context(|| format!("parsing header of TOC entry {index}"))?;
            let name = entry.name.clone();
            if !seen.insert(name.clone()) {
                return Err(Error::malformed(format!("duplicate block name '{name}'")));
            }
            let (data, data_pages) = read_document(self.data, data_addr)
                .with_context(|| format!("reading data of block '{name}'"))?;
            entry.layout.toc_reserved = (toc_reserved != END_MARKER).then_some(toc_reserved);
            entry.layout.header_pages = non_default(record.len(), header_pages, record.len() as u32);
            entry.layout.data_pages = non_default(data.len(), data_pages, header.page_size);

            let body = if self.recursive && looks_like_container(&data) {
                debug!(block = %name, depth = self.depth + 1, "descending into nested container");
                let nested = self
                    .nested(&data)
                    .read()
                    .with_context(|| format!("in nested container '{name}'"))?;
                BlockBody::Nested(nested)
            } else {
                BlockBody::Leaf(data)
            };
            container.blocks.push(Block { name, ctime: entry.ctime, mtime: entry.mtime, layout: entry.layout, body });
        }
        Ok(container)
    }
}

fn truncated_toc(_: std::io::Error) -> Error {
    Error::malformed("TOC truncated")
}

struct EntryHeader {
    name:   String,
    ctime:  u64,
    mtime:  u64,
    layout: EntryLayout,
}

fn parse_entry_header(record: &[u8]) -> Result<EntryHeader> {
    if record.len() < ENTRY_HEADER_FIXED + ENTRY_HEADER_TRAILER || record.len() % 2 != 0 {
        return Err(Error::malformed(format!("entry header of {} bytes", record.len())));
    }
    let mut cursor = Cursor::new(record);
    let ctime = cursor.read_u64::<LittleEndian>().map_err(truncated_toc)?;
    let mtime = cursor.read_u64::<LittleEndian>().map_err(truncated_toc)?;
    let attrs = cursor.read_u32::<LittleEndian>().map_err(truncated_toc)?;
    let (raw_name, raw_trailer) = record[ENTRY_HEADER_FIXED..]
        .split_at(record.len() - ENTRY_HEADER_FIXED - ENTRY_HEADER_TRAILER);
    let mut units: Vec<u16> = raw_name
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let mut name_padding = 0;
    while units.last() == Some(&0) {
        units.pop();
        name_padding += 1;
    }
    let name = String::from_utf16(&units)
        .map_err(|_| Error::malformed("block name is not valid UTF-16"))?;
    if name.is_empty() {
        return Err(Error::malformed("empty block name"));
    }
    let trailer = Cursor::new(raw_trailer).read_u32::<LittleEndian>().map_err(truncated_toc)?;
    let layout = EntryLayout { attrs, name_padding, trailer, ..EntryLayout::default() };
    Ok(EntryHeader { name, ctime, mtime, layout })
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// One block as handed to [`ContainerWriter::layout`].
#[derive(Debug, Clone, Copy)]
pub struct StoredBlock<'b> {
    pub name:   &'b str,
    pub ctime:  u64,
    pub mtime:  u64,
    pub layout: &'b EntryLayout,
    pub data:   &'b [u8],
}

pub struct ContainerWriter {
    header:    ContainerHeader,
    toc_pages: Option<Vec<PageSpec>>,
}

impl ContainerWriter {
    pub fn new(header: ContainerHeader) -> Self {
        Self { header, toc_pages: None }
    }

    /// TOC page geometry to replay when the TOC still fits it.
    pub fn toc_pages(mut self, pages: Option<Vec<PageSpec>>) -> Self {
        self.toc_pages = pages;
        self
    }

    pub fn write(&self, container: &Container) -> Result<Vec<u8>> {
        let mut bodies = Vec::with_capacity(container.blocks.len());
        for block in &container.blocks {
            let data = match &block.body {
                BlockBody::Leaf(data) => data.clone(),
                BlockBody::Nested(nested) => nested.to_bytes()?,
            };
            bodies.push((block, data));
        }
        self.layout(bodies.iter().map(|(b, d)| StoredBlock {
            name:   &b.name,
            ctime:  b.ctime,
            mtime:  b.mtime,
            layout: &b.layout,
            data:   d,
        }))
    }

    /// Lay out blocks in the given order.
    pub fn layout<'b, I>(&self, blocks: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = StoredBlock<'b>>,
    {
        let blocks: Vec<_> = blocks.into_iter().collect();
        let mut seen = HashSet::new();
        for block in &blocks {
            if !seen.insert(block.name) {
                return Err(Error::malformed(format!("duplicate block name '{}'", block.name)));
            }
        }

        let page = self.header.page_size;
        let toc_len = blocks.len() * TOC_ENTRY_SIZE;
        let toc_pages = plan_pages(toc_len, self.toc_pages.as_deref(), page);
        let mut out = Vec::new();
        self.header.write(&mut out).map_err(|e| Error::io("<memory>", e))?;

        // The TOC precedes the blocks, so reserve its pages and patch them afterwards.
        let toc_addr = write_pages(&mut out, &vec![0u8; toc_len], &toc_pages)?;
        debug_assert_eq!(toc_addr as usize, HEADER_SIZE);
        let toc_end = out.len();

        let mut toc = Vec::with_capacity(toc_len);
        for block in &blocks {
            let record = entry_header(block);
            let header_pages = plan_pages(record.len(), block.layout.header_pages.as_deref(), record.len() as u32);
            let header_addr = write_pages(&mut out, &record, &header_pages)?;
            let data_pages = plan_pages(block.data.len(), block.layout.data_pages.as_deref(), page);
            let data_addr = write_pages(&mut out, block.data, &data_pages)?;
            let reserved = block.layout.toc_reserved.unwrap_or(END_MARKER);
            for word in [header_addr, data_addr, reserved] {
                toc.write_u32::<LittleEndian>(word).map_err(|e| Error::io("<memory>", e))?;
            }
        }

        let mut patched = vec![0u8; HEADER_SIZE];
        write_pages(&mut patched, &toc, &toc_pages)?;
        out[HEADER_SIZE..toc_end].copy_from_slice(&patched[HEADER_SIZE..]);
        Ok(out)
    }
}

fn entry_header(block: &StoredBlock<'_>) -> Vec<u8> {
    let layout = block.layout;
    let mut record = Vec::with_capacity(ENTRY_HEADER_FIXED + block.name.len() * 2 + ENTRY_HEADER_TRAILER);
    record.extend_from_slice(&block.ctime.to_le_bytes());
    record.extend_from_slice(&block.mtime.to_le_bytes());
    record.extend_from_slice(&layout.attrs.to_le_bytes());
    for unit in block.name.encode_utf16() {
        record.extend_from_slice(&unit.to_le_bytes());
    }
    record.resize(record.len() + 2 * layout.name_padding as usize, 0);
    record.extend_from_slice(&layout.trailer.to_le_bytes());
    record
}

// ── Directory form ────────────────────────────────────────────────────────────

/// Options for [`extract_to_dir`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractMode {
    /// Mark the container's blocks as deflated in the manifest.
    pub compressed: bool,
    /// Expand nested containers into subdirectories.
    pub recursive:  bool,
}

/// Parse `data` and materialize one file per block under `dir`.
///
/// The whole input is parsed before anything is written, so a malformed
/// container leaves no directory behind.
pub fn extract_to_dir(data: &[u8], dir: &Path, mode: ExtractMode) -> Result<Manifest> {
    let container = Container::parse(data, mode.recursive)?;
    write_container_dir(&container, dir, mode.compressed)
}

fn write_container_dir(container: &Container, dir: &Path, compressed: bool) -> Result<Manifest> {
    fsutil::create_dir(dir)?;
    let stems = assign_stems(container.blocks.iter().map(|b| b.name.as_str()));
    let mut manifest = Manifest {
        page_size:       container.header.page_size,
        storage_version: container.header.storage_version,
        reserved:        container.header.reserved,
        toc_pages:       container.toc_pages.clone(),
        compressed,
        kind:            ContainerKind::Container,
        entries:         Vec::with_capacity(container.blocks.len()),
    };
    for (block, stem) in container.blocks.iter().zip(stems) {
        let path = dir.join(&stem);
        match &block.body {
            BlockBody::Leaf(data) => fsutil::write(&path, data)?,
            BlockBody::Nested(nested) => {
                write_container_dir(nested, &path, false)?;
            }
        }
        manifest.entries.push(ManifestEntry {
            name:     block.name.clone(),
            file:     stem,
            ctime:    block.ctime,
            mtime:    block.mtime,
            deflated: false,
            layout:   block.layout.clone(),
        });
    }
    manifest.save(dir)?;
    Ok(manifest)
}

/// Rebuild container bytes from a directory written by [`extract_to_dir`].
///
/// Blocks are taken in manifest order; subdirectories are rebuilt as nested
/// containers. A manifest entry without a file is skipped with a warning.
pub fn build_from_dir(dir: &Path) -> Result<Vec<u8>> {
    let manifest = Manifest::load(dir)?;
    let mut records = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        let path = dir.join(&entry.file);
        let data = if path.is_dir() {
            build_from_dir(&path).with_context(|| format!("building nested container '{}'", entry.name))?
        } else if path.is_file() {
            fsutil::read(&path)?
        } else {
            tracing::warn!(block = %entry.name, dir = %dir.display(), "block file missing, skipped");
            continue;
        };
        records.push((entry, data));
    }
    let header = ContainerHeader::with_layout(manifest.page_size, manifest.storage_version, manifest.reserved);
    ContainerWriter::new(header).toc_pages(manifest.toc_pages.clone()).layout(records.iter().map(|(e, d)| {
        StoredBlock { name: &e.name, ctime: e.ctime, mtime: e.mtime, layout: &e.layout, data: d }
    }))
}

/// Write container bytes to `out_file`, creating its directory.
pub fn write_file(out_file: &Path, bytes: &[u8]) -> Result<()> {
    fsutil::write(out_file, bytes)
}
