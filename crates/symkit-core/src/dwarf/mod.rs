//! # DWARF
//!
//! From-scratch DWARF 2–5 decoder. Nothing here materializes the debug-info
//! tree: entries are addressed by their `.debug_info` offset ([`Tag`]) and
//! their attributes are decoded on demand by replaying the unit's abbreviation
//! declaration in lockstep with the entry bytes.
//!
//! ## Layout
//!
//! - [`abbrev`]: `.debug_abbrev` event stream and per-unit index
//! - [`attr`]: form reading and attribute class inference
//! - [`unit`]: unit headers and per-unit index tables
//! - [`tag`]: entry locators and tree traversal
//! - [`ty`]: type inference
//! - [`expr`]: location-expression VM
//! - [`line`]: line-number program interpreter
//! - [`ranges`] / [`loclists`]: address range and location lists
//! - [`symbols`]: procedures, globals and locals
//! - [`backend`]: the [`DebugInfo`](crate::backend::DebugInfo) implementation

pub mod abbrev;
pub mod attr;
pub mod backend;
pub mod expr;
pub mod line;
pub mod loclists;
pub mod ranges;
pub mod symbols;
pub mod tag;
pub mod ty;
pub mod unit;

pub use attr::{AttrClass, Attribute, AttributeValue};
pub use backend::DwarfBackend;
pub use tag::Tag;
pub use unit::{AddrTable, CompileUnit, DwarfUnits, UnitRef};

use crate::cursor::Format;
use crate::image::SectionProvider;
use crate::unwind::CfiSection;

/// Encoding parameters shared by a unit and everything it points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encoding
{
    pub address_size: u8,
    pub format: Format,
    pub version: u16,
}

impl Default for Encoding
{
    fn default() -> Self
    {
        Self {
            address_size: 8,
            format: Format::Dwarf32,
            version: 4,
        }
    }
}

/// The DWARF sections of one image
///
/// Missing sections are empty slices. Call-frame sections also carry the
/// virtual address they are mapped at, needed for `pcrel` pointer encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DwarfSections<'data>
{
    pub debug_info: &'data [u8],
    pub debug_abbrev: &'data [u8],
    pub debug_str: &'data [u8],
    pub debug_line_str: &'data [u8],
    pub debug_str_offsets: &'data [u8],
    pub debug_line: &'data [u8],
    pub debug_addr: &'data [u8],
    pub debug_ranges: &'data [u8],
    pub debug_rnglists: &'data [u8],
    pub debug_loc: &'data [u8],
    pub debug_loclists: &'data [u8],
    pub debug_frame: &'data [u8],
    pub eh_frame: &'data [u8],
    pub eh_frame_address: u64,
    pub text_address: u64,
}

impl<'data> DwarfSections<'data>
{
    /// Collect the DWARF sections exposed by `provider`.
    pub fn load(provider: &dyn SectionProvider<'data>) -> Self
    {
        let bytes = |name: &str| provider.section(name).map_or(&[][..], |section| section.data);
        Self {
            debug_info: bytes(".debug_info"),
            debug_abbrev: bytes(".debug_abbrev"),
            debug_str: bytes(".debug_str"),
            debug_line_str: bytes(".debug_line_str"),
            debug_str_offsets: bytes(".debug_str_offsets"),
            debug_line: bytes(".debug_line"),
            debug_addr: bytes(".debug_addr"),
            debug_ranges: bytes(".debug_ranges"),
            debug_rnglists: bytes(".debug_rnglists"),
            debug_loc: bytes(".debug_loc"),
            debug_loclists: bytes(".debug_loclists"),
            debug_frame: bytes(".debug_frame"),
            eh_frame: bytes(".eh_frame"),
            eh_frame_address: provider.section(".eh_frame").map_or(0, |section| section.address),
            text_address: provider.section(".text").map_or(0, |section| section.address),
        }
    }

    /// Call-frame section to unwind with: `.eh_frame` when present (it also
    /// covers code without debug info), else `.debug_frame`.
    pub fn cfi_section(&self, address_size: u8) -> Option<CfiSection<'data>>
    {
        if !self.eh_frame.is_empty() {
            let text_base = (self.text_address != 0).then_some(self.text_address);
            let section = CfiSection::eh_frame(self.eh_frame, self.eh_frame_address, address_size);
            return Some(section.with_bases(text_base, None));
        }
        (!self.debug_frame.is_empty()).then(|| CfiSection::debug_frame(self.debug_frame, address_size))
    }

    /// Whether there is anything to build a symbol backend from.
    pub fn has_debug_info(&self) -> bool
    {
        !self.debug_info.is_empty() && !self.debug_abbrev.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::SectionMap;
    use crate::unwind::CfiKind;

    #[test]
    fn test_cfi_section_prefers_eh_frame()
    {
        let eh_frame = [0u8; 4];
        let debug_frame = [0u8; 4];
        let map = SectionMap::new()
            .with_section(".eh_frame", 0x2000, &eh_frame)
            .with_section(".debug_frame", 0, &debug_frame)
            .with_section(".text", 0x1000, &[0xc3]);
        let section = DwarfSections::load(&map).cfi_section(8).unwrap();
        assert_eq!(section.kind, CfiKind::EhFrame);
        assert_eq!(section.address, 0x2000);
        assert_eq!(section.text_base, Some(0x1000));

        let map = SectionMap::new().with_section(".debug_frame", 0, &debug_frame);
        let sections = DwarfSections::load(&map);
        assert!(!sections.has_debug_info());
        let section = sections.cfi_section(4).unwrap();
        assert_eq!(section.kind, CfiKind::DebugFrame);
        assert_eq!(section.address_size, 4);

        assert!(DwarfSections::default().cfi_section(8).is_none());
    }
}
