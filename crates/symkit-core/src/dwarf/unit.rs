//! # Compile Units
//!
//! Header parsing for DWARF 2–5 units and the per-unit context every attribute
//! and entry decode runs against.
//!
//! A [`CompileUnit`] owns its abbreviation index, built once when the unit is
//! opened, plus the handful of root attributes other decoders need: base
//! address, line-program offset and the DWARF 5 table bases used by indexed
//! forms (`strx*`, `addrx*`, `loclistx`, `rnglistx`).

use gimli::constants::{self, DwUt};
use tracing::{debug, warn};

use super::abbrev::AbbrevTable;
use super::attr::{AttributeValue, FormValue};
use super::{DwarfSections, Encoding};
use crate::cursor::{cstr_at, BinaryCursor, Format};
use crate::error::{Result, SymError};

/// Fixed part of a unit, as read from `.debug_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader
{
    /// Offset of the unit's length field
    pub offset: u64,
    pub encoding: Encoding,
    pub unit_type: DwUt,
    pub abbrev_offset: u64,
    /// Offset of the first entry
    pub entries_offset: usize,
    /// One past the unit's last byte
    pub end: usize,
}

impl UnitHeader
{
    /// Whether `offset` lies inside this unit's entries.
    pub fn contains(&self, offset: u64) -> bool
    {
        (self.entries_offset as u64..self.end as u64).contains(&offset)
    }

    /// Type units are reached by signature, never walked as compile units.
    pub fn is_type_unit(&self) -> bool
    {
        matches!(self.unit_type, constants::DW_UT_type | constants::DW_UT_split_type)
    }
}

fn parse_header_body(cursor: &mut BinaryCursor<'_>, offset: u64, end: usize) -> Result<UnitHeader>
{
    let version = cursor.read_u16()?;
    let (unit_type, address_size, abbrev_offset) = match version {
        2..=4 => {
            let abbrev_offset = cursor.read_offset()?;
            let address_size = cursor.read_u8()?;
            (constants::DW_UT_compile, address_size, abbrev_offset)
        }
        5 => {
            let unit_type = DwUt(cursor.read_u8()?);
            let address_size = cursor.read_u8()?;
            let abbrev_offset = cursor.read_offset()?;
            match unit_type {
                constants::DW_UT_skeleton | constants::DW_UT_split_compile => {
                    cursor.read_u64()?;
                }
                constants::DW_UT_type | constants::DW_UT_split_type => {
                    cursor.read_u64()?;
                    cursor.read_offset()?;
                }
                constants::DW_UT_compile | constants::DW_UT_partial => {}
                other => return Err(SymError::malformed(format!("unit type {other}"))),
            }
            (unit_type, address_size, abbrev_offset)
        }
        other => return Err(SymError::Unsupported(format!("DWARF version {other}"))),
    };
    if !matches!(address_size, 2 | 4 | 8) {
        return Err(SymError::malformed(format!("address size {address_size}")));
    }
    Ok(UnitHeader {
        offset,
        encoding: Encoding {
            address_size,
            format: cursor.format(),
            version,
        },
        unit_type,
        abbrev_offset,
        entries_offset: cursor.offset(),
        end,
    })
}

/// Iterator over the unit headers of `.debug_info`
///
/// A unit whose header is corrupt is reported once and skipped; iteration only
/// stops early when a unit length itself cannot be read.
pub struct UnitHeaders<'data>
{
    cursor: BinaryCursor<'data>,
    done: bool,
}

impl<'data> UnitHeaders<'data>
{
    pub fn new(debug_info: &'data [u8]) -> Self
    {
        Self {
            cursor: BinaryCursor::new(debug_info),
            done: false,
        }
    }
}

impl Iterator for UnitHeaders<'_>
{
    type Item = Result<UnitHeader>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.done || self.cursor.is_empty() {
            return None;
        }
        let offset = self.cursor.offset();
        let length = match self.cursor.read_initial_length() {
            Ok(length) => length,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        let end = usize::try_from(length)
            .ok()
            .and_then(|length| self.cursor.offset().checked_add(length))
            .filter(|&end| end <= self.cursor.limit());
        let Some(end) = end else {
            self.done = true;
            return Some(Err(SymError::malformed(format!("unit at 0x{offset:x} overruns .debug_info"))));
        };

        let mut body = BinaryCursor::with_range(self.cursor.data(), self.cursor.offset(), end)
            .with_format(self.cursor.format());
        let header = parse_header_body(&mut body, offset as u64, end);
        if self.cursor.seek(end).is_err() {
            self.done = true;
        }
        // Each unit declares its own format.
        self.cursor.set_format(Format::Dwarf32);
        Some(header)
    }
}

/// `.debug_addr` slice of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTable<'data>
{
    data: &'data [u8],
    base: u64,
    address_size: u8,
}

impl<'data> AddrTable<'data>
{
    pub fn new(data: &'data [u8], base: u64, address_size: u8) -> Self
    {
        Self {
            data,
            base,
            address_size,
        }
    }

    /// Address at `index`.
    pub fn get(&self, index: u64) -> Result<u64>
    {
        let offset = index
            .checked_mul(u64::from(self.address_size))
            .and_then(|delta| self.base.checked_add(delta))
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| SymError::malformed("address index"))?;
        let mut cursor = BinaryCursor::with_range(self.data, offset, self.data.len());
        cursor.read_sized(self.address_size)
    }
}

/// An opened compile unit
#[derive(Debug, Clone)]
pub struct CompileUnit<'data>
{
    pub header: UnitHeader,
    pub abbrevs: AbbrevTable,
    pub name: Option<&'data [u8]>,
    pub comp_dir: Option<&'data [u8]>,
    pub producer: Option<&'data [u8]>,
    pub language: Option<u16>,
    /// `DW_AT_low_pc` of the root entry; base for range and location lists
    pub base_address: u64,
    /// `DW_AT_stmt_list`
    pub line_offset: Option<u64>,
    pub addr_base: u64,
    pub str_offsets_base: u64,
    pub loclists_base: u64,
    pub rnglists_base: u64,
}

impl<'data> CompileUnit<'data>
{
    /// Index the unit's abbreviations and read its root attributes.
    pub fn open(sections: &DwarfSections<'data>, header: UnitHeader) -> Result<Self>
    {
        let abbrev_offset =
            usize::try_from(header.abbrev_offset).map_err(|_| SymError::malformed("abbreviation offset"))?;
        let abbrevs = AbbrevTable::parse(sections.debug_abbrev, abbrev_offset)?;
        let mut unit = Self {
            header,
            abbrevs,
            name: None,
            comp_dir: None,
            producer: None,
            language: None,
            base_address: 0,
            line_offset: None,
            addr_base: 0,
            str_offsets_base: 0,
            loclists_base: 0,
            rnglists_base: 0,
        };

        // Table bases first: the remaining root attributes may be indexed.
        let root = UnitRef::new(sections, &unit).root()?;
        let mut bases = (0, 0, 0, 0);
        for raw in UnitRef::new(sections, &unit).raw_attrs(&root) {
            let (name, _, value) = raw?;
            let (FormValue::SecOffset(offset) | FormValue::Data(offset)) = value else {
                continue;
            };
            match name {
                constants::DW_AT_addr_base | constants::DW_AT_GNU_addr_base => bases.0 = offset,
                constants::DW_AT_str_offsets_base => bases.1 = offset,
                constants::DW_AT_loclists_base => bases.2 = offset,
                constants::DW_AT_rnglists_base => bases.3 = offset,
                _ => {}
            }
        }
        (unit.addr_base, unit.str_offsets_base, unit.loclists_base, unit.rnglists_base) = bases;

        let mut name = None;
        let mut comp_dir = None;
        let mut producer = None;
        let mut language = None;
        let mut base_address = 0;
        let mut line_offset = None;
        for attr in UnitRef::new(sections, &unit).attrs(&root) {
            let attr = match attr {
                Ok(attr) => attr,
                Err(err) => {
                    warn!(unit = header.offset, %err, "skipping undecodable root attribute");
                    continue;
                }
            };
            match (attr.name, attr.value) {
                (constants::DW_AT_name, AttributeValue::String(value)) => name = Some(value),
                (constants::DW_AT_comp_dir, AttributeValue::String(value)) => comp_dir = Some(value),
                (constants::DW_AT_producer, AttributeValue::String(value)) => producer = Some(value),
                (constants::DW_AT_language, value) => language = value.as_u64().and_then(|v| u16::try_from(v).ok()),
                (constants::DW_AT_low_pc, AttributeValue::Address(value)) => base_address = value,
                (constants::DW_AT_stmt_list, AttributeValue::SectionPtr { offset, .. }) => line_offset = Some(offset),
                _ => {}
            }
        }
        unit.name = name;
        unit.comp_dir = comp_dir;
        unit.producer = producer;
        unit.language = language;
        unit.base_address = base_address;
        unit.line_offset = line_offset;
        debug!(
            unit = header.offset,
            version = header.encoding.version,
            name = %String::from_utf8_lossy(name.unwrap_or_default()),
            "opened compile unit"
        );
        Ok(unit)
    }

    pub fn encoding(&self) -> Encoding
    {
        self.header.encoding
    }

    /// `.debug_info` offset of the root entry.
    pub fn root_offset(&self) -> u64
    {
        self.header.entries_offset as u64
    }
}

/// Open every compile and partial unit in `sections`.
///
/// Units that fail to open are logged and left out, so one corrupt unit does
/// not hide the rest.
pub fn open_units<'data>(sections: &DwarfSections<'data>) -> Vec<CompileUnit<'data>>
{
    let mut units = Vec::new();
    for header in UnitHeaders::new(sections.debug_info) {
        let header = match header {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "skipping unit with a corrupt header");
                continue;
            }
        };
        if header.is_type_unit() {
            debug!(unit = header.offset, "skipping type unit");
            continue;
        }
        match CompileUnit::open(sections, header) {
            Ok(unit) => units.push(unit),
            Err(err) => warn!(unit = header.offset, %err, "skipping unit"),
        }
    }
    units
}

/// Every opened unit of an image, searchable by `.debug_info` offset
#[derive(Debug, Clone, Default)]
pub struct DwarfUnits<'data>
{
    pub sections: DwarfSections<'data>,
    units: Vec<CompileUnit<'data>>,
}

impl<'data> DwarfUnits<'data>
{
    pub fn new(sections: DwarfSections<'data>) -> Self
    {
        let mut units = open_units(&sections);
        units.sort_by_key(|unit| unit.header.offset);
        Self { sections, units }
    }

    pub fn len(&self) -> usize
    {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.units.is_empty()
    }

    /// Unit at position `index` in section order.
    pub fn get(&self, index: usize) -> Option<UnitRef<'_, 'data>>
    {
        self.units.get(index).map(|unit| UnitRef::new(&self.sections, unit))
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = UnitRef<'_, 'data>> + '_
    {
        self.units.iter().map(|unit| UnitRef::new(&self.sections, unit))
    }

    /// Unit whose entries contain `offset`.
    pub fn unit_for(&self, offset: u64) -> Result<UnitRef<'_, 'data>>
    {
        let index = self
            .units
            .partition_point(|unit| unit.header.offset <= offset)
            .checked_sub(1)
            .filter(|&index| self.units[index].header.contains(offset))
            .ok_or_else(|| SymError::malformed(format!("no unit contains .debug_info offset 0x{offset:x}")))?;
        Ok(UnitRef::new(&self.sections, &self.units[index]))
    }
}

/// A unit plus the sections it indexes into
#[derive(Debug, Clone, Copy)]
pub struct UnitRef<'a, 'data>
{
    pub sections: &'a DwarfSections<'data>,
    pub unit: &'a CompileUnit<'data>,
}

impl<'a, 'data> UnitRef<'a, 'data>
{
    pub fn new(sections: &'a DwarfSections<'data>, unit: &'a CompileUnit<'data>) -> Self
    {
        Self { sections, unit }
    }

    pub fn encoding(&self) -> Encoding
    {
        self.unit.header.encoding
    }

    pub fn addr_table(&self) -> AddrTable<'data>
    {
        AddrTable::new(self.sections.debug_addr, self.unit.addr_base, self.encoding().address_size)
    }

    fn offset_entry(&self, section: &'data [u8], base: u64, index: u64) -> Result<u64>
    {
        let size = u64::from(self.encoding().format.offset_size());
        let offset = index
            .checked_mul(size)
            .and_then(|delta| base.checked_add(delta))
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| SymError::malformed("offset table index"))?;
        let mut cursor =
            BinaryCursor::with_range(section, offset, section.len()).with_format(self.encoding().format);
        cursor.read_offset()
    }

    /// String for a `strx*` index, through `.debug_str_offsets`.
    pub fn string_at_index(&self, index: u64) -> Result<&'data [u8]>
    {
        let offset = self.offset_entry(self.sections.debug_str_offsets, self.unit.str_offsets_base, index)?;
        cstr_at(self.sections.debug_str, offset)
    }

    /// `.debug_loclists` offset for a `loclistx` index.
    pub fn loclist_offset(&self, index: u64) -> Result<u64>
    {
        let base = self.unit.loclists_base;
        Ok(base + self.offset_entry(self.sections.debug_loclists, base, index)?)
    }

    /// `.debug_rnglists` offset for a `rnglistx` index.
    pub fn rnglist_offset(&self, index: u64) -> Result<u64>
    {
        let base = self.unit.rnglists_base;
        Ok(base + self.offset_entry(self.sections.debug_rnglists, base, index)?)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_v4_header()
    {
        // length 7 (header only), version 4, abbrev offset 0x20, address size 8
        let bytes = [0x07, 0, 0, 0, 0x04, 0x00, 0x20, 0, 0, 0, 0x08];
        let headers: Vec<_> = UnitHeaders::new(&bytes).collect::<Result<_>>().unwrap();
        assert_eq!(headers.len(), 1);
        let header = headers[0];
        assert_eq!(header.encoding.version, 4);
        assert_eq!(header.encoding.address_size, 8);
        assert_eq!(header.abbrev_offset, 0x20);
        assert_eq!(header.entries_offset, 11);
        assert_eq!(header.end, 11);
    }

    #[test]
    fn test_v5_header_and_skip_bad_unit()
    {
        let mut bytes = vec![0x08, 0, 0, 0, 0x05, 0x00, 0x01, 0x04, 0x10, 0, 0, 0];
        // version 9 unit: reported, then skipped
        bytes.extend_from_slice(&[0x03, 0, 0, 0, 0x09, 0x00, 0x00]);
        let headers: Vec<_> = UnitHeaders::new(&bytes).collect();
        assert_eq!(headers.len(), 2);
        let first = headers[0].as_ref().unwrap();
        assert_eq!(first.unit_type, constants::DW_UT_compile);
        assert_eq!(first.encoding.address_size, 4);
        assert_eq!(first.abbrev_offset, 0x10);
        assert!(matches!(headers[1], Err(SymError::Unsupported(_))));
    }

    #[test]
    fn test_overlong_unit_stops_iteration()
    {
        let bytes = [0xff, 0, 0, 0, 0x04, 0x00];
        let headers: Vec<_> = UnitHeaders::new(&bytes).collect();
        assert_eq!(headers.len(), 1);
        assert!(headers[0].is_err());
    }

    #[test]
    fn test_addr_table_lookup()
    {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&0x1000u64.to_le_bytes());
        data.extend_from_slice(&0x2000u64.to_le_bytes());
        let table = AddrTable::new(&data, 8, 8);
        assert_eq!(table.get(0).unwrap(), 0x1000);
        assert_eq!(table.get(1).unwrap(), 0x2000);
        assert!(table.get(2).is_err());
    }
}
