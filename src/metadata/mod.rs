//! Binary property tables and their JSON form.
//!
//! # Wire format
//!
//! ```text
//! magic        4 bytes  "V8PT"
//! entry_count  u16 LE
//! body_len     u32 LE   bytes after this 10-byte header
//! entry        key_len u8 | key (UTF-8) | value_len u16 LE | value
//! ```
//!
//! Values carry no type tag: the version profile's schema decides how a
//! value is rendered to JSON and at which width it is written back.
//! Unknown keys and values that do not decode cleanly are kept as
//! `{"raw": "<hex>"}` so that nothing is lost.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{json, Map, Value};
use std::io::{Cursor, Read};
use std::path::Path;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result, ResultExt};
use crate::fsutil;
use crate::manifest::{Manifest, ManifestEntry};
use crate::pool::WorkerPool;
use crate::version::{FieldType, VersionProfile};

pub const TABLE_MAGIC: [u8; 4] = *b"V8PT";
pub const TABLE_HEADER_SIZE: usize = 10;
pub const JSON_EXT: &str = "json";

const RAW_KEY: &str = "raw";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyTable {
    pub entries: Vec<(String, Vec<u8>)>,
}

impl PropertyTable {
    pub fn is_table(data: &[u8]) -> bool {
        data.len() >= TABLE_HEADER_SIZE && data[..4] == TABLE_MAGIC
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_slice())
    }

    /// Parse a table, checking that the declared counts and lengths agree
    /// with the bytes actually present.
    pub fn parse(block: &str, data: &[u8]) -> Result<Self> {
        let bad = |reason: String| Error::MetadataFormat { block: block.to_string(), reason };
        if !Self::is_table(data) {
            return Err(bad("missing property table magic".into()));
        }
        let mut cursor = Cursor::new(&data[4..]);
        let count = cursor.read_u16::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        let body_len = cursor.read_u32::<LittleEndian>().map_err(|e| bad(e.to_string()))? as usize;
        let body = &data[TABLE_HEADER_SIZE..];
        if body.len() != body_len {
            return Err(bad(format!("declares {body_len} body bytes, holds {}", body.len())));
        }

        let mut cursor = Cursor::new(body);
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count {
            let overrun = |_| bad(format!("entry {index} overruns the declared length"));
            let key_len = cursor.read_u8().map_err(overrun)? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key).map_err(overrun)?;
            let key = String::from_utf8(key).map_err(|_| bad(format!("entry {index} key is not UTF-8")))?;
            let value_len = cursor.read_u16::<LittleEndian>().map_err(overrun)? as usize;
            let mut value = vec![0u8; value_len];
            cursor.read_exact(&mut value).map_err(overrun)?;
            entries.push((key, value));
        }
        if cursor.position() as usize != body.len() {
            return Err(bad(format!(
                "{} trailing bytes after {count} entries",
                body.len() - cursor.position() as usize
            )));
        }
        Ok(Self { entries })
    }

    pub fn to_bytes(&self, block: &str) -> Result<Vec<u8>> {
        let bad = |reason: String| Error::MetadataFormat { block: block.to_string(), reason };
        let count = u16::try_from(self.entries.len()).map_err(|_| bad("too many entries".into()))?;
        let mut body = Vec::new();
        for (key, value) in &self.entries {
            let key_len = u8::try_from(key.len()).map_err(|_| bad(format!("key '{key}' is too long")))?;
            let value_len = u16::try_from(value.len())
                .map_err(|_| bad(format!("value of '{key}' is {} bytes", value.len())))?;
            body.push(key_len);
            body.extend_from_slice(key.as_bytes());
            body.write_u16::<LittleEndian>(value_len).map_err(|e| bad(e.to_string()))?;
            body.extend_from_slice(value);
        }
        let mut out = Vec::with_capacity(TABLE_HEADER_SIZE + body.len());
        out.extend_from_slice(&TABLE_MAGIC);
        out.write_u16::<LittleEndian>(count).map_err(|e| bad(e.to_string()))?;
        out.write_u32::<LittleEndian>(body.len() as u32).map_err(|e| bad(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Render as an ordered JSON object, typed by `profile`'s schema.
    pub fn to_json(&self, block: &str, profile: &VersionProfile) -> Map<String, Value> {
        let mut map = Map::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            let rendered = match profile.field_type(key) {
                None => {
                    warn!(block, key = %key, version = %profile, "property not in schema, kept raw");
                    raw(value)
                }
                Some(FieldType::Str) => match std::str::from_utf8(value) {
                    Ok(s) => Value::String(s.to_string()),
                    Err(_) => {
                        warn!(block, key = %key, "string property is not UTF-8, kept raw");
                        raw(value)
                    }
                },
                Some(ty) => decode_fixed(block, key, ty, value),
            };
            map.insert(key.clone(), rendered);
        }
        map
    }

    /// Inverse of [`to_json`](Self::to_json).
    pub fn from_json(block: &str, map: &Map<String, Value>, profile: &VersionProfile) -> Result<Self> {
        let bad = |reason: String| Error::MetadataFormat { block: block.to_string(), reason };
        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            if let Some(bytes) = as_raw(value) {
                let bytes = hex::decode(bytes).map_err(|e| bad(format!("'{key}': bad raw value: {e}")))?;
                entries.push((key.clone(), bytes));
                continue;
            }
            let ty = profile
                .field_type(key)
                .ok_or_else(|| bad(format!("'{key}' is not a property of version {profile}")))?;
            let type_error = || bad(format!("'{key}' expects {ty:?}, found {value}"));
            let bytes = match ty {
                FieldType::Str => value.as_str().ok_or_else(type_error)?.as_bytes().to_vec(),
                FieldType::Bool => vec![value.as_bool().ok_or_else(type_error)? as u8],
                FieldType::Guid => {
                    let text = value.as_str().ok_or_else(type_error)?;
                    let guid = Uuid::parse_str(text).map_err(|e| bad(format!("'{key}': {e}")))?;
                    guid.as_bytes().to_vec()
                }
                FieldType::U8 | FieldType::U16 | FieldType::U32 | FieldType::U64 => {
                    let n = value.as_u64().ok_or_else(type_error)?;
                    encode_unsigned(block, key, ty, n)
                }
            };
            entries.push((key.clone(), bytes));
        }
        Ok(Self { entries })
    }
}

fn raw(value: &[u8]) -> Value {
    json!({ RAW_KEY: hex::encode(value) })
}

fn as_raw(value: &Value) -> Option<&str> {
    match value {
        Value::Object(obj) if obj.len() == 1 => obj.get(RAW_KEY).and_then(Value::as_str),
        _ => None,
    }
}

fn decode_fixed(block: &str, key: &str, ty: FieldType, value: &[u8]) -> Value {
    let width = ty.width().unwrap_or(value.len());
    let mut bytes = value.to_vec();
    if bytes.len() != width {
        warn!(
            block, key, expected = width, found = bytes.len(),
            "property width differs from schema, {}",
            if bytes.len() > width { "truncated" } else { "zero-padded" }
        );
        bytes.resize(width, 0);
    }
    match ty {
        FieldType::Bool => match bytes[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => raw(&bytes),
        },
        FieldType::Guid => {
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&bytes);
            Value::String(Uuid::from_bytes(guid).hyphenated().to_string())
        }
        _ => {
            let mut wide = [0u8; 8];
            wide[..width].copy_from_slice(&bytes);
            Value::from(u64::from_le_bytes(wide))
        }
    }
}

fn encode_unsigned(block: &str, key: &str, ty: FieldType, n: u64) -> Vec<u8> {
    let width = ty.width().unwrap_or(8);
    let max = if width >= 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
    if n > max {
        warn!(block, key, value = n, width, "property value wider than its field, truncated");
    }
    n.to_le_bytes()[..width].to_vec()
}

// ── Stage functions ──────────────────────────────────────────────────────────

/// Replace every property table under `src` with its JSON form in `dst`.
pub fn json_decode(src: &Path, dst: &Path, profile: &VersionProfile, pool: &WorkerPool) -> Result<()> {
    let manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("json decode", units, |entry| decode_entry(src, dst, entry, profile))?;
    manifest.save(dst)
}

fn decode_dir(src: &Path, dst: &Path, profile: &VersionProfile) -> Result<()> {
    let manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    for entry in &manifest.entries {
        decode_entry(src, dst, entry, profile)?;
    }
    manifest.save(dst)
}

fn decode_entry(src: &Path, dst: &Path, entry: &ManifestEntry, profile: &VersionProfile) -> Result<()> {
    let from = src.join(&entry.file);
    if from.is_dir() {
        return decode_dir(&from, &dst.join(&entry.file), profile)
            .with_context(|| format!("in container '{}'", entry.name));
    }
    if !from.is_file() {
        warn!(block = %entry.name, "block file missing, skipped");
        return Ok(());
    }
    let data = fsutil::read(&from)?;
    if PropertyTable::is_table(&data) {
        let table = PropertyTable::parse(&entry.name, &data)?;
        let json = serde_json::to_vec(&table.to_json(&entry.name, profile)).map_err(|e| {
            Error::MetadataFormat { block: entry.name.clone(), reason: e.to_string() }
        })?;
        fsutil::write(&dst.join(format!("{}.{JSON_EXT}", entry.file)), &json)
    } else {
        fsutil::write(&dst.join(&entry.file), &data)
    }
}

/// Turn every `<stem>.json` under `src` back into a binary table in `dst`.
pub fn json_encode(src: &Path, dst: &Path, profile: &VersionProfile, pool: &WorkerPool) -> Result<()> {
    let manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    let units: Vec<&ManifestEntry> = manifest.entries.iter().collect();
    pool.run_units("json encode", units, |entry| encode_entry(src, dst, entry, profile))?;
    manifest.save(dst)
}

fn encode_dir(src: &Path, dst: &Path, profile: &VersionProfile) -> Result<()> {
    let manifest = Manifest::load(src)?;
    fsutil::create_dir(dst)?;
    for entry in &manifest.entries {
        encode_entry(src, dst, entry, profile)?;
    }
    manifest.save(dst)
}

fn encode_entry(src: &Path, dst: &Path, entry: &ManifestEntry, profile: &VersionProfile) -> Result<()> {
    let json_path = src.join(format!("{}.{JSON_EXT}", entry.file));
    let plain = src.join(&entry.file);
    if json_path.is_file() {
        let text = fsutil::read(&json_path)?;
        let map: Map<String, Value> = serde_json::from_slice(&text).map_err(|e| Error::MetadataFormat {
            block:  entry.name.clone(),
            reason: format!("{}: {e}", json_path.display()),
        })?;
        let table = PropertyTable::from_json(&entry.name, &map, profile)?;
        fsutil::write(&dst.join(&entry.file), &table.to_bytes(&entry.name)?)
    } else if plain.is_dir() {
        encode_dir(&plain, &dst.join(&entry.file), profile)
            .with_context(|| format!("in container '{}'", entry.name))
    } else if plain.is_file() {
        fsutil::copy(&plain, &dst.join(&entry.file))
    } else {
        warn!(block = %entry.name, "block file missing, skipped");
        Ok(())
    }
}
