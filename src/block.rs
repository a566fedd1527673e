//! Page headers and page-chained documents.
//!
//! Every document in a container (the TOC, block header records, block data)
//! is stored as a chain of pages. A page starts with a 31-byte ASCII header:
//!
//! ```text
//! \r\n DDDDDDDD ' ' PPPPPPPP ' ' NNNNNNNN ' ' \r\n
//!      doc size     page size     next page
//! ```
//!
//! followed by `page size` body bytes. Only the first page of a document
//! carries the total document size; the chain ends at [`END_MARKER`].
//!
//! The page geometry of a document read from a file is kept as a list of
//! [`PageSpec`]s so that a rebuild can lay it out the same way.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, Write};

use crate::error::{Error, Result};
use crate::header::END_MARKER;

pub const PAGE_HEADER_SIZE: usize = 31;

/// One page of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    /// Body size of the page.
    pub size: u32,
    /// Document-size field of a continuation page as stored. The first
    /// page always carries the real document size.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub doc_size: u32,
}

impl PageSpec {
    pub fn new(size: u32) -> Self {
        Self { size, doc_size: 0 }
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Pages to store a `len`-byte document in.
///
/// `recorded` is reused when every one of its pages still receives part of
/// the body; otherwise the document gets one page of `max(len, min_page)`.
pub fn plan_pages(len: usize, recorded: Option<&[PageSpec]>, min_page: u32) -> Vec<PageSpec> {
    if let Some(pages) = recorded.filter(|pages| fits(len, pages)) {
        return pages.to_vec();
    }
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    vec![PageSpec::new(len.max(min_page))]
}

fn fits(len: usize, pages: &[PageSpec]) -> bool {
    let Some((last, head)) = pages.split_last() else {
        return false;
    };
    let before: usize = head.iter().map(|p| p.size as usize).sum();
    (head.is_empty() || before < len) && before + last.size as usize >= len
}

/// `pages` unless it is what [`plan_pages`] produces anyway.
pub fn non_default(len: usize, pages: Vec<PageSpec>, min_page: u32) -> Option<Vec<PageSpec>> {
    (pages != plan_pages(len, None, min_page)).then_some(pages)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub doc_size: u32,
    pub page_size: u32,
    pub next_page: u32,
}

impl PageHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write!(
            writer,
            "\r\n{:08x} {:08x} {:08x} \r\n",
            self.doc_size, self.page_size, self.next_page
        )
    }

    /// Parse the page header stored at `addr` in `data`.
    pub fn parse(data: &[u8], addr: u32) -> Result<Self> {
        let start = addr as usize;
        let raw = start
            .checked_add(PAGE_HEADER_SIZE)
            .and_then(|end| data.get(start..end))
            .ok_or_else(|| {
                Error::malformed(format!(
                    "page header at 0x{addr:08x} lies past end of file ({} bytes)",
                    data.len()
                ))
            })?;
        if &raw[0..2] != b"\r\n" || &raw[29..31] != b"\r\n"
            || raw[10] != b' ' || raw[19] != b' ' || raw[28] != b' '
        {
            return Err(Error::malformed(format!("bad page header at 0x{addr:08x}")));
        }
        Ok(Self {
            doc_size: parse_hex(&raw[2..10], addr)?,
            page_size: parse_hex(&raw[11..19], addr)?,
            next_page: parse_hex(&raw[20..28], addr)?,
        })
    }
}

fn parse_hex(field: &[u8], addr: u32) -> Result<u32> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::malformed(format!("non-hex page header field at 0x{addr:08x}")))
}

/// True when `data` starts like a container: the magic followed by a TOC page header.
pub fn looks_like_container(data: &[u8]) -> bool {
    use crate::header::{HEADER_SIZE, MAGIC};
    data.len() >= HEADER_SIZE + PAGE_HEADER_SIZE
        && data[..4] == MAGIC
        && PageHeader::parse(data, HEADER_SIZE as u32).is_ok()
}

/// Reassemble the document whose first page is at `addr`, following the
/// page chain in pointer order. Also returns the geometry of every page the
/// body was read from.
pub fn read_document(data: &[u8], addr: u32) -> Result<(Vec<u8>, Vec<PageSpec>)> {
    let mut header = PageHeader::parse(data, addr)?;
    let total = header.doc_size as usize;
    let mut body = Vec::with_capacity(total.min(data.len()));
    let mut pages = Vec::new();
    let mut visited = HashSet::new();
    let mut page = addr;

    loop {
        if !visited.insert(page) {
            return Err(Error::malformed(format!(
                "cyclic page chain in document at 0x{addr:08x} (page 0x{page:08x} revisited)"
            )));
        }
        let body_start = page as usize + PAGE_HEADER_SIZE;
        let body_end = body_start + header.page_size as usize;
        if body_end > data.len() {
            return Err(Error::malformed(format!(
                "page at 0x{page:08x} declares {} bytes, overruns end of file ({} bytes)",
                header.page_size,
                data.len()
            )));
        }
        let take = (total - body.len()).min(header.page_size as usize);
        body.extend_from_slice(&data[body_start..body_start + take]);
        pages.push(PageSpec {
            size:     header.page_size,
            doc_size: if page == addr { 0 } else { header.doc_size },
        });

        if body.len() == total {
            return Ok((body, pages));
        }
        if header.next_page == END_MARKER {
            return Err(Error::malformed(format!(
                "document at 0x{addr:08x} declares {total} bytes, page chain holds {}",
                body.len()
            )));
        }
        page = header.next_page;
        header = PageHeader::parse(data, page)?;
    }
}

/// Append `body` to `out` spread over `pages`, chained in file order, and
/// return the address of the first page. Page tails are zero-filled.
pub fn write_pages(out: &mut Vec<u8>, body: &[u8], pages: &[PageSpec]) -> Result<u32> {
    let addr = address(out.len())?;
    let doc_size = u32::try_from(body.len())
        .map_err(|_| Error::malformed("document exceeds 4 GiB"))?;
    let mut rest = body;
    for (i, page) in pages.iter().enumerate() {
        let next_page = if i + 1 == pages.len() {
            END_MARKER
        } else {
            address(out.len() + PAGE_HEADER_SIZE + page.size as usize)?
        };
        let declared = if i == 0 { doc_size } else { page.doc_size };
        PageHeader { doc_size: declared, page_size: page.size, next_page }
            .write(&mut *out)
            .map_err(|e| Error::io("<memory>", e))?;
        let take = rest.len().min(page.size as usize);
        out.extend_from_slice(&rest[..take]);
        out.resize(out.len() + (page.size as usize - take), 0);
        rest = &rest[take..];
    }
    if !rest.is_empty() {
        return Err(Error::malformed(format!(
            "document of {} bytes does not fit its {} page(s)",
            body.len(),
            pages.len()
        )));
    }
    Ok(addr)
}

fn address(offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .filter(|addr| *addr != END_MARKER)
        .ok_or_else(|| Error::malformed("container exceeds 4 GiB addressing limit"))
}
