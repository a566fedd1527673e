//! Version profiles.
//!
//! A version code is either a platform code (`801`, `802`, `803`) or a
//! five-digit compatibility code (`80306` = 8.3.6). It is resolved once per
//! run into a [`VersionProfile`] that every version-sensitive stage receives
//! explicitly: the wide-text table, the property table schema and the slot
//! layout of forms.

use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{Error, Result};
use crate::structure::kind::Kind;

pub const DEFAULT_VERSION: &str = "803";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// 8.1/8.2: one UTF-16 code unit per character, surrogates not allowed.
    Ucs2,
    /// 8.3: full UTF-16 with surrogate pairs.
    Utf16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    Bool,
    Guid,
    Str,
}

impl FieldType {
    /// Fixed on-disk width, `None` for variable-width strings.
    pub fn width(self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::Bool => Some(1),
            FieldType::U16 => Some(2),
            FieldType::U32 => Some(4),
            FieldType::U64 => Some(8),
            FieldType::Guid => Some(16),
            FieldType::Str => None,
        }
    }
}

/// A named child position of a form container and the kinds allowed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub name:  &'static str,
    pub kinds: &'static [Kind],
}

const LEGACY_SCHEMA: &[(&str, FieldType)] = &[
    ("kind", FieldType::Str),
    ("name", FieldType::Str),
    ("guid", FieldType::Guid),
    ("compat", FieldType::U8),
    ("format", FieldType::U16),
];

const EXTENDED_SCHEMA: &[(&str, FieldType)] = &[
    ("kind", FieldType::Str),
    ("name", FieldType::Str),
    ("guid", FieldType::Guid),
    ("compat", FieldType::U8),
    ("format", FieldType::U16),
    ("synonym", FieldType::Str),
    ("purpose", FieldType::U8),
    ("compat_version", FieldType::U32),
    ("flags", FieldType::U32),
];

const LEGACY_FORM_SLOTS: &[Slot] = &[
    Slot { name: "form", kinds: &[Kind::Meta] },
    Slot { name: "module", kinds: &[Kind::Module] },
];

const EXTENDED_FORM_SLOTS: &[Slot] = &[
    Slot { name: "form", kinds: &[Kind::Meta] },
    Slot { name: "module", kinds: &[Kind::Module] },
    Slot { name: "elements", kinds: &[Kind::Meta] },
    Slot { name: "help", kinds: &[Kind::Text] },
];

struct ProfileRow {
    minor:      u8,
    releases:   RangeInclusive<u8>,
    text:       TextEncoding,
    schema:     &'static [(&'static str, FieldType)],
    form_slots: &'static [Slot],
}

const PROFILES: &[ProfileRow] = &[
    ProfileRow { minor: 1, releases: 0..=99, text: TextEncoding::Ucs2, schema: LEGACY_SCHEMA, form_slots: LEGACY_FORM_SLOTS },
    ProfileRow { minor: 2, releases: 0..=99, text: TextEncoding::Ucs2, schema: LEGACY_SCHEMA, form_slots: LEGACY_FORM_SLOTS },
    ProfileRow { minor: 3, releases: 0..=99, text: TextEncoding::Utf16, schema: EXTENDED_SCHEMA, form_slots: EXTENDED_FORM_SLOTS },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProfile {
    pub code:       String,
    pub minor:      u8,
    pub release:    Option<u8>,
    pub text:       TextEncoding,
    pub schema:     &'static [(&'static str, FieldType)],
    pub form_slots: &'static [Slot],
    /// Property rewritten by the `gui` override.
    pub compat_key: &'static str,
}

impl VersionProfile {
    pub fn resolve(code: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedVersion(code.to_string());
        let digits = code.trim();
        if !digits.bytes().all(|b| b.is_ascii_digit()) || !digits.starts_with("80") {
            return Err(unsupported());
        }
        let (minor, release) = match digits.len() {
            3 => (digits[2..3].parse::<u8>().map_err(|_| unsupported())?, None),
            5 => (
                digits[2..3].parse::<u8>().map_err(|_| unsupported())?,
                Some(digits[3..5].parse::<u8>().map_err(|_| unsupported())?),
            ),
            _ => return Err(unsupported()),
        };
        let row = PROFILES
            .iter()
            .find(|row| row.minor == minor && release.map_or(true, |r| row.releases.contains(&r)))
            .ok_or_else(unsupported)?;
        Ok(Self {
            code: digits.to_string(),
            minor,
            release,
            text: row.text,
            schema: row.schema,
            form_slots: row.form_slots,
            compat_key: "compat",
        })
    }

    pub fn field_type(&self, key: &str) -> Option<FieldType> {
        self.schema.iter().find(|(k, _)| *k == key).map(|(_, t)| *t)
    }

    pub fn form_slot(&self, name: &str) -> Option<&Slot> {
        self.form_slots.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for VersionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.release {
            Some(release) => write!(f, "8.{}.{}", self.minor, release),
            None => write!(f, "8.{}", self.minor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_platform_and_compat_codes() {
        assert_eq!(VersionProfile::resolve("803").unwrap().text, TextEncoding::Utf16);
        assert_eq!(VersionProfile::resolve("802").unwrap().text, TextEncoding::Ucs2);
        let p = VersionProfile::resolve("80306").unwrap();
        assert_eq!(p.to_string(), "8.3.6");
        assert!(p.field_type("synonym").is_some());
        assert!(VersionProfile::resolve("80216").unwrap().field_type("synonym").is_none());
    }

    #[test]
    fn rejects_unknown_codes() {
        for code in ["804", "900", "8", "8030", "abc", ""] {
            assert!(
                matches!(VersionProfile::resolve(code), Err(Error::UnsupportedVersion(_))),
                "{code} should be rejected"
            );
        }
    }
}
