//! Abbreviation tables (`.debug_abbrev`).
//!
//! The table is replayed as a flat event stream ([`AbbrevEvents`]) and, once per
//! compile unit, folded into an [`AbbrevTable`]: a sorted `code → entry` index
//! that the entry decoder binary-searches for every DIE. Attribute
//! specifications are not materialized; an entry only records where its
//! `(name, form)` list starts so the attribute decoder can walk it in lockstep
//! with `.debug_info`.

use gimli::constants::{self, DwAt, DwForm, DwTag};

use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};

/// One step of the abbreviation stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbbrevEvent
{
    /// A declaration starts at this `.debug_abbrev` offset
    TagBegin
    {
        offset: usize,
    },
    TagInfo
    {
        code: u64,
        tag: DwTag,
        has_children: bool,
    },
    AttribInfo
    {
        name: DwAt,
        form: DwForm,
        /// Value stored in the table for `DW_FORM_implicit_const`
        implicit_const: Option<i64>,
    },
    /// The `(0, 0)` terminator of a declaration
    TagEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase
{
    Begin,
    Info,
    Attribs,
    Done,
}

/// Event iterator over one abbreviation table
///
/// Stops after the table's terminating zero code, at the end of the section,
/// or at the first decoding error (which is yielded once).
pub struct AbbrevEvents<'data>
{
    cursor: BinaryCursor<'data>,
    phase: Phase,
    code: u64,
}

impl<'data> AbbrevEvents<'data>
{
    pub fn new(debug_abbrev: &'data [u8], offset: usize) -> Self
    {
        Self {
            cursor: BinaryCursor::with_range(debug_abbrev, offset, debug_abbrev.len()),
            phase: Phase::Begin,
            code: 0,
        }
    }

    fn step(&mut self) -> Result<Option<AbbrevEvent>>
    {
        match self.phase {
            Phase::Done => Ok(None),
            Phase::Begin => {
                if self.cursor.is_empty() {
                    self.phase = Phase::Done;
                    return Ok(None);
                }
                let offset = self.cursor.offset();
                let code = self.cursor.read_uleb128()?;
                if code == 0 {
                    self.phase = Phase::Done;
                    return Ok(None);
                }
                self.code = code;
                self.phase = Phase::Info;
                Ok(Some(AbbrevEvent::TagBegin { offset }))
            }
            Phase::Info => {
                let code = self.code;
                let tag = self.cursor.read_uleb128()?;
                let tag = u16::try_from(tag).map_err(|_| SymError::malformed("abbreviation tag"))?;
                let has_children = self.cursor.read_u8()? == constants::DW_CHILDREN_yes.0;
                self.phase = Phase::Attribs;
                Ok(Some(AbbrevEvent::TagInfo {
                    code,
                    tag: DwTag(tag),
                    has_children,
                }))
            }
            Phase::Attribs => {
                let (name, form, implicit_const) = read_attr_spec(&mut self.cursor)?;
                if name.0 == 0 && form.0 == 0 {
                    self.phase = Phase::Begin;
                    return Ok(Some(AbbrevEvent::TagEnd));
                }
                Ok(Some(AbbrevEvent::AttribInfo {
                    name,
                    form,
                    implicit_const,
                }))
            }
        }
    }
}

impl Iterator for AbbrevEvents<'_>
{
    type Item = Result<AbbrevEvent>;

    fn next(&mut self) -> Option<Self::Item>
    {
        match self.step() {
            Ok(event) => event.map(Ok),
            Err(err) => {
                self.phase = Phase::Done;
                Some(Err(err))
            }
        }
    }
}

/// Read one `(name, form [, implicit const])` specification.
pub(crate) fn read_attr_spec(cursor: &mut BinaryCursor<'_>) -> Result<(DwAt, DwForm, Option<i64>)>
{
    let name = cursor.read_uleb128()?;
    let form = cursor.read_uleb128()?;
    let name = u16::try_from(name).map_err(|_| SymError::malformed("attribute name"))?;
    let form = u16::try_from(form).map_err(|_| SymError::malformed("attribute form"))?;
    let form = DwForm(form);
    let implicit_const = if form == constants::DW_FORM_implicit_const {
        Some(cursor.read_sleb128()?)
    } else {
        None
    };
    Ok((DwAt(name), form, implicit_const))
}

/// One declaration in an [`AbbrevTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbbrevEntry
{
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    /// `.debug_abbrev` offset of the declaration
    pub offset: usize,
    /// `.debug_abbrev` offset of the first attribute specification
    pub attrs_offset: usize,
}

/// Sorted `code → declaration` index for one compile unit
#[derive(Debug, Clone, Default)]
pub struct AbbrevTable
{
    entries: Vec<AbbrevEntry>,
}

impl AbbrevTable
{
    /// Replay the table at `offset` and index it.
    pub fn parse(debug_abbrev: &[u8], offset: usize) -> Result<Self>
    {
        let mut entries = Vec::new();
        let mut events = AbbrevEvents::new(debug_abbrev, offset);
        let mut begin = offset;
        while let Some(event) = events.next().transpose()? {
            match event {
                AbbrevEvent::TagBegin { offset } => begin = offset,
                AbbrevEvent::TagInfo {
                    code,
                    tag,
                    has_children,
                } => entries.push(AbbrevEntry {
                    code,
                    tag,
                    has_children,
                    offset: begin,
                    attrs_offset: events.cursor.offset(),
                }),
                AbbrevEvent::AttribInfo { .. } | AbbrevEvent::TagEnd => {}
            }
        }

        // Producers almost always emit codes in order; sort anyway.
        entries.sort_by_key(|entry| entry.code);
        if entries.windows(2).any(|pair| pair[0].code == pair[1].code) {
            return Err(SymError::malformed(format!("duplicate abbreviation code at 0x{offset:x}")));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, code: u64) -> Option<&AbbrevEntry>
    {
        self.entries
            .binary_search_by_key(&code, |entry| entry.code)
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    // code 1: compile_unit, children, name/strp + language/data2
    // code 2: base_type, no children, byte_size/implicit_const(-4)
    fn table() -> Vec<u8>
    {
        vec![
            0x01, 0x11, 0x01, 0x03, 0x0e, 0x13, 0x05, 0x00, 0x00, //
            0x02, 0x24, 0x00, 0x0b, 0x21, 0x7c, 0x00, 0x00, //
            0x00,
        ]
    }

    #[test]
    fn test_event_stream_order()
    {
        let bytes = table();
        let events: Vec<_> = AbbrevEvents::new(&bytes, 0).collect::<Result<_>>().unwrap();
        assert_eq!(events.len(), 9);
        assert_eq!(events[0], AbbrevEvent::TagBegin { offset: 0 });
        assert_eq!(
            events[1],
            AbbrevEvent::TagInfo {
                code: 1,
                tag: constants::DW_TAG_compile_unit,
                has_children: true
            }
        );
        assert_eq!(
            events[2],
            AbbrevEvent::AttribInfo {
                name: constants::DW_AT_name,
                form: constants::DW_FORM_strp,
                implicit_const: None
            }
        );
        assert_eq!(events[4], AbbrevEvent::TagEnd);
        assert_eq!(
            events[7],
            AbbrevEvent::AttribInfo {
                name: constants::DW_AT_byte_size,
                form: constants::DW_FORM_implicit_const,
                implicit_const: Some(-4)
            }
        );
        assert_eq!(events[8], AbbrevEvent::TagEnd);
    }

    #[test]
    fn test_table_lookup()
    {
        let bytes = table();
        let table = AbbrevTable::parse(&bytes, 0).unwrap();
        assert_eq!(table.len(), 2);
        let cu = table.get(1).unwrap();
        assert_eq!(cu.tag, constants::DW_TAG_compile_unit);
        assert_eq!(cu.attrs_offset, 3);
        let base = table.get(2).unwrap();
        assert!(!base.has_children);
        assert_eq!(base.offset, 9);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_truncated_table_fails()
    {
        let bytes = [0x01, 0x11, 0x01, 0x03];
        assert!(AbbrevTable::parse(&bytes, 0).is_err());
    }

    #[test]
    fn test_duplicate_codes_rejected()
    {
        let bytes = [0x01, 0x24, 0x00, 0x00, 0x00, 0x01, 0x24, 0x00, 0x00, 0x00, 0x00];
        assert!(AbbrevTable::parse(&bytes, 0).is_err());
    }
}
