use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Marker written as the first free page address; doubles as the container magic.
pub const END_MARKER: u32 = 0x7FFF_FFFF;
pub const MAGIC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];
pub const HEADER_SIZE: usize = 16;
pub const DEFAULT_PAGE_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub first_free_page: u32,
    pub page_size: u32,
    pub storage_version: u32,
    pub reserved: u32,
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            first_free_page: END_MARKER,
            page_size: DEFAULT_PAGE_SIZE,
            storage_version: 0,
            reserved: 0,
        }
    }
}

impl ContainerHeader {
    pub fn with_layout(page_size: u32, storage_version: u32, reserved: u32) -> Self {
        Self { page_size, storage_version, reserved, ..Self::default() }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.first_free_page)?;
        writer.write_u32::<LittleEndian>(self.page_size)?;
        writer.write_u32::<LittleEndian>(self.storage_version)?;
        writer.write_u32::<LittleEndian>(self.reserved)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let truncated = |_| Error::malformed("container header truncated");
        let first_free_page = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if first_free_page != END_MARKER {
            return Err(Error::malformed(format!(
                "bad container magic 0x{first_free_page:08x}"
            )));
        }
        let page_size = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let storage_version = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let reserved = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if page_size == 0 {
            return Err(Error::malformed("container page size is zero"));
        }
        Ok(Self { first_free_page, page_size, storage_version, reserved })
    }
}
