//! Location lists: `.debug_loc` (DWARF 2–4) and `.debug_loclists` (DWARF 5).
//!
//! Lists are decoded eagerly into `(range, expression)` pairs; which entry
//! applies is decided at decode time from the current program counter.

use gimli::constants::{self, DwLle};

use super::unit::UnitRef;
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::AddrRange;

/// One entry of a location list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocListEntry<'data>
{
    pub range: AddrRange,
    pub ops: &'data [u8],
}

impl LocListEntry<'_>
{
    /// `DW_LLE_default_location` entries cover every address.
    pub fn is_default(&self) -> bool
    {
        self.range == AddrRange::new(0, u64::MAX)
    }
}

fn read_expr<'data>(cursor: &mut BinaryCursor<'data>, length: u64) -> Result<&'data [u8]>
{
    let length = usize::try_from(length).map_err(|_| SymError::malformed("location expression length"))?;
    cursor.read_bytes(length)
}

fn read_debug_loc<'data>(unit: &UnitRef<'_, 'data>, cursor: &mut BinaryCursor<'data>) -> Result<Vec<LocListEntry<'data>>>
{
    let max = match unit.encoding().address_size {
        8 => u64::MAX,
        size => (1u64 << (u32::from(size) * 8)) - 1,
    };
    let mut base = unit.unit.base_address;
    let mut entries = Vec::new();
    loop {
        let begin = cursor.read_address()?;
        let end = cursor.read_address()?;
        if begin == 0 && end == 0 {
            return Ok(entries);
        }
        if begin == max {
            base = end;
            continue;
        }
        let length = u64::from(cursor.read_u16()?);
        let ops = read_expr(cursor, length)?;
        entries.push(LocListEntry {
            range: AddrRange::new(base.wrapping_add(begin), base.wrapping_add(end)),
            ops,
        });
    }
}

fn read_debug_loclists<'data>(
    unit: &UnitRef<'_, 'data>,
    cursor: &mut BinaryCursor<'data>,
) -> Result<Vec<LocListEntry<'data>>>
{
    let addrs = unit.addr_table();
    let mut base = unit.unit.base_address;
    let mut entries = Vec::new();
    loop {
        let kind = DwLle(cursor.read_u8()?);
        let range = match kind {
            constants::DW_LLE_end_of_list => return Ok(entries),
            constants::DW_LLE_base_addressx => {
                base = addrs.get(cursor.read_uleb128()?)?;
                continue;
            }
            constants::DW_LLE_base_address => {
                base = cursor.read_address()?;
                continue;
            }
            constants::DW_LLE_startx_endx => {
                let begin = addrs.get(cursor.read_uleb128()?)?;
                let end = addrs.get(cursor.read_uleb128()?)?;
                AddrRange::new(begin, end)
            }
            constants::DW_LLE_startx_length => {
                let begin = addrs.get(cursor.read_uleb128()?)?;
                let length = cursor.read_uleb128()?;
                AddrRange::new(begin, begin.wrapping_add(length))
            }
            constants::DW_LLE_offset_pair => {
                let begin = cursor.read_uleb128()?;
                let end = cursor.read_uleb128()?;
                AddrRange::new(base.wrapping_add(begin), base.wrapping_add(end))
            }
            constants::DW_LLE_default_location => AddrRange::new(0, u64::MAX),
            constants::DW_LLE_start_end => {
                let begin = cursor.read_address()?;
                let end = cursor.read_address()?;
                AddrRange::new(begin, end)
            }
            constants::DW_LLE_start_length => {
                let begin = cursor.read_address()?;
                let length = cursor.read_uleb128()?;
                AddrRange::new(begin, begin.wrapping_add(length))
            }
            other => return Err(SymError::Unsupported(format!("location list entry {other}"))),
        };
        let length = cursor.read_uleb128()?;
        let ops = read_expr(cursor, length)?;
        entries.push(LocListEntry { range, ops });
    }
}

/// Decode the location list at `offset`.
pub fn read_loclist<'data>(unit: &UnitRef<'_, 'data>, offset: u64) -> Result<Vec<LocListEntry<'data>>>
{
    let version = unit.encoding().version;
    let section = if version >= 5 {
        unit.sections.debug_loclists
    } else {
        unit.sections.debug_loc
    };
    let start = usize::try_from(offset)
        .ok()
        .filter(|&start| start <= section.len())
        .ok_or_else(|| SymError::malformed(format!("location list offset 0x{offset:x} past the section")))?;
    let encoding = unit.encoding();
    let mut cursor = BinaryCursor::with_range(section, start, section.len())
        .with_address_size(encoding.address_size)
        .with_format(encoding.format);
    if version >= 5 {
        read_debug_loclists(unit, &mut cursor)
    } else {
        read_debug_loc(unit, &mut cursor)
    }
}
