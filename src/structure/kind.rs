//! Block kinds and their on-disk representation.

use crate::version::TextEncoding;

pub const UTF16_BOM: [u8; 2] = [0xFF, 0xFE];
pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF_SIGNATURE: &[u8] = b"GIF8";
const BMP_SIGNATURE: &[u8] = b"BM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Property table, already turned into JSON.
    Meta,
    /// Wide text with a UTF-16LE BOM.
    Text,
    /// Module source with a UTF-8 BOM.
    Module,
    Picture,
    Form,
    Subcontainer,
    Unknown,
}

impl Kind {
    /// Kind of a materialized file, from its extension.
    pub fn from_ext(ext: &str) -> Option<Kind> {
        match ext {
            "json" => Some(Kind::Meta),
            "txt" => Some(Kind::Text),
            "bsl" => Some(Kind::Module),
            "png" | "jpg" | "gif" | "bmp" => Some(Kind::Picture),
            "bin" => Some(Kind::Unknown),
            _ => None,
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, Kind::Form | Kind::Subcontainer)
    }
}

/// File extension of a picture, from its leading signature.
pub fn picture_ext(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(PNG_SIGNATURE) {
        Some("png")
    } else if data.starts_with(JPEG_SIGNATURE) {
        Some("jpg")
    } else if data.starts_with(GIF_SIGNATURE) {
        Some("gif")
    } else if data.starts_with(BMP_SIGNATURE) {
        Some("bmp")
    } else {
        None
    }
}

/// Decode BOM-less UTF-16LE under `encoding`'s rules. `None` if the bytes
/// are not a valid string of that table.
pub fn decode_wide(data: &[u8], encoding: TextEncoding) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    if encoding == TextEncoding::Ucs2 && units.iter().any(|u| (0xD800..=0xDFFF).contains(u)) {
        return None;
    }
    String::from_utf16(&units).ok()
}

/// UTF-16LE with BOM. Fails with the first character the table cannot hold.
pub fn encode_wide(text: &str, encoding: TextEncoding) -> std::result::Result<Vec<u8>, char> {
    if encoding == TextEncoding::Ucs2 {
        if let Some(c) = text.chars().find(|c| u32::from(*c) > 0xFFFF) {
            return Err(c);
        }
    }
    let mut out = Vec::with_capacity(2 + text.len() * 2);
    out.extend_from_slice(&UTF16_BOM);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// A leaf block after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    Text(String),
    Module(String),
    Picture { ext: &'static str, data: Vec<u8> },
    Unknown(Vec<u8>),
}

impl Leaf {
    pub fn classify(data: Vec<u8>, encoding: TextEncoding) -> Leaf {
        if let Some(body) = data.strip_prefix(&UTF16_BOM[..]) {
            if let Some(text) = decode_wide(body, encoding) {
                return Leaf::Text(text);
            }
        }
        if let Some(body) = data.strip_prefix(&UTF8_BOM[..]) {
            if let Ok(text) = std::str::from_utf8(body) {
                return Leaf::Module(text.to_string());
            }
        }
        match picture_ext(&data) {
            Some(ext) => Leaf::Picture { ext, data },
            None => Leaf::Unknown(data),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Leaf::Text(_) => Kind::Text,
            Leaf::Module(_) => Kind::Module,
            Leaf::Picture { .. } => Kind::Picture,
            Leaf::Unknown(_) => Kind::Unknown,
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            Leaf::Text(_) => "txt",
            Leaf::Module(_) => "bsl",
            Leaf::Picture { ext, .. } => ext,
            Leaf::Unknown(_) => "bin",
        }
    }

    /// Bytes of the materialized file.
    pub fn file_bytes(&self) -> &[u8] {
        match self {
            Leaf::Text(text) | Leaf::Module(text) => text.as_bytes(),
            Leaf::Picture { data, .. } | Leaf::Unknown(data) => data,
        }
    }

    /// Bytes of the block inside the container.
    pub fn block_bytes(&self, encoding: TextEncoding) -> std::result::Result<Vec<u8>, char> {
        match self {
            Leaf::Text(text) => encode_wide(text, encoding),
            Leaf::Module(text) => {
                let mut out = Vec::with_capacity(UTF8_BOM.len() + text.len());
                out.extend_from_slice(&UTF8_BOM);
                out.extend_from_slice(text.as_bytes());
                Ok(out)
            }
            Leaf::Picture { data, .. } | Leaf::Unknown(data) => Ok(data.clone()),
        }
    }
}
