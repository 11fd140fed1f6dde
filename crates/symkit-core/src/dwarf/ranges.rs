//! Address ranges of entries: `low_pc`/`high_pc` pairs, `.debug_ranges`
//! (DWARF 2–4) and `.debug_rnglists` (DWARF 5).

use gimli::constants::{self, DwRle};
use smallvec::SmallVec;

use super::attr::AttributeValue;
use super::tag::Tag;
use super::unit::UnitRef;
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::AddrRange;

pub type Ranges = SmallVec<[AddrRange; 1]>;

fn max_address(address_size: u8) -> u64
{
    match address_size {
        8 => u64::MAX,
        size => (1u64 << (u32::from(size) * 8)) - 1,
    }
}

fn section_cursor<'data>(unit: &UnitRef<'_, 'data>, section: &'data [u8], offset: u64) -> Result<BinaryCursor<'data>>
{
    let start = usize::try_from(offset).map_err(|_| SymError::malformed("range list offset"))?;
    if start > section.len() {
        return Err(SymError::malformed(format!("range list offset 0x{offset:x} past the section")));
    }
    let encoding = unit.encoding();
    Ok(BinaryCursor::with_range(section, start, section.len())
        .with_address_size(encoding.address_size)
        .with_format(encoding.format))
}

/// Read a `.debug_ranges` list.
fn read_debug_ranges(unit: &UnitRef<'_, '_>, offset: u64, out: &mut Ranges) -> Result<()>
{
    let mut cursor = section_cursor(unit, unit.sections.debug_ranges, offset)?;
    let max = max_address(unit.encoding().address_size);
    let mut base = unit.unit.base_address;
    loop {
        let begin = cursor.read_address()?;
        let end = cursor.read_address()?;
        match (begin, end) {
            (0, 0) => return Ok(()),
            (begin, end) if begin == max => base = end,
            (begin, end) => out.push(AddrRange::new(base.wrapping_add(begin), base.wrapping_add(end))),
        }
    }
}

/// Read a `.debug_rnglists` list.
fn read_rnglist(unit: &UnitRef<'_, '_>, offset: u64, out: &mut Ranges) -> Result<()>
{
    let mut cursor = section_cursor(unit, unit.sections.debug_rnglists, offset)?;
    let addrs = unit.addr_table();
    let mut base = unit.unit.base_address;
    loop {
        let kind = DwRle(cursor.read_u8()?);
        let range = match kind {
            constants::DW_RLE_end_of_list => return Ok(()),
            constants::DW_RLE_base_addressx => {
                base = addrs.get(cursor.read_uleb128()?)?;
                continue;
            }
            constants::DW_RLE_base_address => {
                base = cursor.read_address()?;
                continue;
            }
            constants::DW_RLE_startx_endx => {
                let begin = addrs.get(cursor.read_uleb128()?)?;
                let end = addrs.get(cursor.read_uleb128()?)?;
                AddrRange::new(begin, end)
            }
            constants::DW_RLE_startx_length => {
                let begin = addrs.get(cursor.read_uleb128()?)?;
                let length = cursor.read_uleb128()?;
                AddrRange::new(begin, begin.wrapping_add(length))
            }
            constants::DW_RLE_offset_pair => {
                let begin = cursor.read_uleb128()?;
                let end = cursor.read_uleb128()?;
                AddrRange::new(base.wrapping_add(begin), base.wrapping_add(end))
            }
            constants::DW_RLE_start_end => {
                let begin = cursor.read_address()?;
                let end = cursor.read_address()?;
                AddrRange::new(begin, end)
            }
            constants::DW_RLE_start_length => {
                let begin = cursor.read_address()?;
                let length = cursor.read_uleb128()?;
                AddrRange::new(begin, begin.wrapping_add(length))
            }
            other => return Err(SymError::malformed(format!("range list entry {other}"))),
        };
        out.push(range);
    }
}

/// Ranges listed at `offset`, in the section the unit's version implies.
pub fn read_ranges(unit: &UnitRef<'_, '_>, offset: u64) -> Result<Ranges>
{
    let mut ranges = Ranges::new();
    if unit.encoding().version >= 5 {
        read_rnglist(unit, offset, &mut ranges)?;
    } else {
        read_debug_ranges(unit, offset, &mut ranges)?;
    }
    ranges.retain(|range| !range.is_empty());
    Ok(ranges)
}

/// Code ranges of `tag`, from `low_pc`/`high_pc` or `DW_AT_ranges`.
///
/// Empty for entries with no code (declarations, abstract instances).
pub fn tag_ranges(unit: &UnitRef<'_, '_>, tag: &Tag) -> Result<Ranges>
{
    let mut low = None;
    let mut high = None;
    let mut list = None;
    for attr in unit.attrs(tag) {
        let attr = attr?;
        match (attr.name, attr.value) {
            (constants::DW_AT_low_pc, AttributeValue::Address(address)) => low = Some(address),
            (constants::DW_AT_high_pc, value) => high = Some(value),
            (constants::DW_AT_ranges, AttributeValue::SectionPtr { offset, .. }) => list = Some(offset),
            _ => {}
        }
    }

    if let Some(offset) = list {
        return read_ranges(unit, offset);
    }
    let mut ranges = Ranges::new();
    if let (Some(low), Some(high)) = (low, high) {
        let high = match high {
            AttributeValue::Address(address) => address,
            AttributeValue::Const { lo, .. } => low.wrapping_add(lo),
            _ => return Err(SymError::malformed("high_pc of unexpected class")),
        };
        if high > low {
            ranges.push(AddrRange::new(low, high));
        }
    }
    Ok(ranges)
}

/// Smallest range covering every piece.
pub fn hull(ranges: &[AddrRange]) -> Option<AddrRange>
{
    let lo = ranges.iter().map(|range| range.lo).min()?;
    let hi = ranges.iter().map(|range| range.hi).max()?;
    Some(AddrRange::new(lo, hi))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_max_address()
    {
        assert_eq!(max_address(4), 0xffff_ffff);
        assert_eq!(max_address(8), u64::MAX);
    }

    #[test]
    fn test_hull()
    {
        let ranges = [AddrRange::new(0x30, 0x40), AddrRange::new(0x10, 0x20)];
        assert_eq!(hull(&ranges), Some(AddrRange::new(0x10, 0x40)));
        assert_eq!(hull(&[]), None);
    }
}
