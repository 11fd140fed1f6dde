//! # CodeView
//!
//! Decoder for the CodeView records that make up a PDB's module and type
//! streams. The MSF container is not parsed here; callers hand over the
//! already-extracted streams in their COFF section layout:
//!
//! - `.debug$S`: a 4-byte signature followed by subsections (symbols, line
//!   blocks, file checksums, string table)
//! - `.debug$T`: a 4-byte signature followed by type records, the first of
//!   which has index `0x1000`
//!
//! ## Addresses
//!
//! CodeView names code and data by `segment:offset`. Segments are 1-based
//! section numbers resolved through [`SectionProvider::segment_address`].
//!
//! [`SectionProvider::segment_address`]: crate::image::SectionProvider::segment_address

pub mod lines;
pub mod symbols;
pub mod types;

mod backend;

pub use backend::PdbBackend;

use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::image::SectionProvider;

/// Signature of C13 CodeView sections
pub const CV_SIGNATURE_C13: u32 = 4;

/// Subsection kinds inside `.debug$S`
pub mod subsection
{
    pub const SYMBOLS: u32 = 0xf1;
    pub const LINES: u32 = 0xf2;
    pub const STRING_TABLE: u32 = 0xf3;
    pub const FILE_CHECKSUMS: u32 = 0xf4;
    /// Set on subsections the linker asks readers to skip
    pub const IGNORE: u32 = 0x8000_0000;
}

/// Numeric leaf kinds (values of `0x8000` and above)
mod leaf
{
    pub const LF_CHAR: u16 = 0x8000;
    pub const LF_SHORT: u16 = 0x8001;
    pub const LF_USHORT: u16 = 0x8002;
    pub const LF_LONG: u16 = 0x8003;
    pub const LF_ULONG: u16 = 0x8004;
    pub const LF_QUADWORD: u16 = 0x8009;
    pub const LF_UQUADWORD: u16 = 0x800a;
}

/// The two CodeView streams of one image
#[derive(Debug, Clone, Copy)]
pub struct CodeViewSections<'data>
{
    pub symbols: &'data [u8],
    /// Empty when the image carries no type records
    pub types: &'data [u8],
}

impl<'data> CodeViewSections<'data>
{
    /// Pull `.debug$S` and `.debug$T` from `provider`.
    pub fn load(provider: &dyn SectionProvider<'data>) -> Option<Self>
    {
        let symbols = provider.section(".debug$S")?.data;
        let types = provider.section(".debug$T").map_or(&[][..], |section| section.data);
        Some(Self { symbols, types })
    }
}

/// Check the leading signature and return the offset of the first record.
pub(crate) fn skip_signature(data: &[u8], what: &str) -> Result<usize>
{
    if data.is_empty() {
        return Ok(0);
    }
    let signature = BinaryCursor::new(data).read_u32()?;
    if signature != CV_SIGNATURE_C13 {
        return Err(SymError::Unsupported(format!("{what} signature {signature}")));
    }
    Ok(4)
}

/// One `.debug$S` subsection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsection<'data>
{
    pub kind: u32,
    /// Offset of `data` within the section
    pub offset: usize,
    pub data: &'data [u8],
}

/// Iterator over the subsections of `.debug$S`
pub struct Subsections<'data>
{
    cursor: BinaryCursor<'data>,
    done: bool,
}

impl<'data> Subsections<'data>
{
    pub fn new(section: &'data [u8]) -> Result<Self>
    {
        let start = skip_signature(section, ".debug$S")?;
        Ok(Self {
            cursor: BinaryCursor::with_range(section, start, section.len()),
            done: false,
        })
    }

    fn read(&mut self) -> Result<Subsection<'data>>
    {
        let kind = self.cursor.read_u32()?;
        let length = self.cursor.read_u32()? as usize;
        let offset = self.cursor.offset();
        let data = self.cursor.read_bytes(length)?;
        let padding = (4 - length % 4) % 4;
        self.cursor.skip(padding.min(self.cursor.remaining()))?;
        Ok(Subsection { kind, offset, data })
    }
}

impl<'data> Iterator for Subsections<'data>
{
    type Item = Result<Subsection<'data>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        while !self.done && !self.cursor.is_empty() {
            match self.read() {
                Ok(sub) if sub.kind & subsection::IGNORE != 0 => continue,
                Ok(sub) => return Some(Ok(sub)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Read a numeric leaf, returning the value as two's complement.
pub(crate) fn read_numeric(cursor: &mut BinaryCursor<'_>) -> Result<u64>
{
    let kind = cursor.read_u16()?;
    if kind < leaf::LF_CHAR {
        return Ok(u64::from(kind));
    }
    Ok(match kind {
        leaf::LF_CHAR => i64::from(cursor.read_i8()?) as u64,
        leaf::LF_SHORT => i64::from(cursor.read_i16()?) as u64,
        leaf::LF_USHORT => u64::from(cursor.read_u16()?),
        leaf::LF_LONG => i64::from(cursor.read_i32()?) as u64,
        leaf::LF_ULONG => u64::from(cursor.read_u32()?),
        leaf::LF_QUADWORD => cursor.read_i64()? as u64,
        leaf::LF_UQUADWORD => cursor.read_u64()?,
        other => return Err(SymError::Unsupported(format!("numeric leaf 0x{other:04x}"))),
    })
}

/// Read a NUL-terminated name.
pub(crate) fn read_name(cursor: &mut BinaryCursor<'_>) -> Result<String>
{
    let bytes = cursor.read_cstr()?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_numeric_leaves()
    {
        let bytes = [0x34, 0x12, 0x00, 0x80, 0xff, 0x03, 0x80, 0xfe, 0xff, 0xff, 0xff];
        let mut cursor = BinaryCursor::new(&bytes);
        assert_eq!(read_numeric(&mut cursor).unwrap(), 0x1234);
        assert_eq!(read_numeric(&mut cursor).unwrap() as i64, -1);
        assert_eq!(read_numeric(&mut cursor).unwrap() as i64, -2);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_subsections_skip_ignored_and_padding()
    {
        let mut bytes = CV_SIGNATURE_C13.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(subsection::IGNORE | subsection::LINES).to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 0, 0]);
        bytes.extend_from_slice(&subsection::STRING_TABLE.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"ab\0\0");
        let subs: Vec<_> = Subsections::new(&bytes).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].kind, subsection::STRING_TABLE);
        assert_eq!(subs[0].data, b"ab\0");
        assert_eq!(subs[0].offset, 24);
    }

    #[test]
    fn test_bad_signature()
    {
        assert!(matches!(
            Subsections::new(&[2, 0, 0, 0]),
            Err(SymError::Unsupported(_))
        ));
    }
}
