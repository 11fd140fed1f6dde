//! CodeView line blocks (`DEBUG_S_LINES`) and the file tables they refer to.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{subsection, Subsection};
use crate::cursor::{cstr_at, BinaryCursor};
use crate::error::{Result, SymError};
use crate::line_table::{FileId, LineTableBuilder};

/// `CV_LINES_HAVE_COLUMNS`
const LINES_HAVE_COLUMNS: u16 = 0x1;

/// Line numbers the compiler uses for hidden code
const HIDDEN_LINES: [u32; 2] = [0x00fe_efee, 0x00f0_0f00];

/// File checksum and string tables of one `.debug$S`
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTables<'data>
{
    checksums: &'data [u8],
    strings: &'data [u8],
}

impl<'data> FileTables<'data>
{
    pub fn new(subsections: &[Subsection<'data>]) -> Self
    {
        let mut tables = Self::default();
        for sub in subsections {
            match sub.kind {
                subsection::FILE_CHECKSUMS => tables.checksums = sub.data,
                subsection::STRING_TABLE => tables.strings = sub.data,
                _ => {}
            }
        }
        tables
    }

    /// Name of the file whose checksum entry starts at `checksum_offset`.
    pub fn file_name(&self, checksum_offset: u32) -> Result<String>
    {
        let mut cursor = BinaryCursor::with_range(self.checksums, checksum_offset as usize, self.checksums.len());
        let name_offset = cursor.read_u32()?;
        let name = cstr_at(self.strings, u64::from(name_offset))?;
        Ok(String::from_utf8_lossy(name).into_owned())
    }
}

/// Header of one `DEBUG_S_LINES` subsection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContributionHeader
{
    offset: u32,
    segment: u16,
    flags: u16,
    size: u32,
}

/// Append the rows of every line subsection to `builder`.
///
/// `segment_base` maps a 1-based segment to its link-time address. A block
/// that cannot be decoded is skipped with a warning; the rows already
/// appended stay.
pub fn build_lines<'data>(
    subsections: &[Subsection<'data>],
    tables: &FileTables<'data>,
    segment_base: impl Fn(u16) -> Option<u64>,
    builder: &mut LineTableBuilder,
) -> Result<()>
{
    let mut files: HashMap<u32, FileId> = HashMap::new();
    let mut first_error = None;
    for sub in subsections.iter().filter(|sub| sub.kind == subsection::LINES) {
        if let Err(err) = contribution(sub.data, tables, &segment_base, &mut files, builder) {
            warn!(offset = sub.offset, %err, "skipping line block");
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) if builder.row_count() == 0 => Err(err),
        _ => Ok(()),
    }
}

fn contribution(
    data: &[u8],
    tables: &FileTables<'_>,
    segment_base: &impl Fn(u16) -> Option<u64>,
    files: &mut HashMap<u32, FileId>,
    builder: &mut LineTableBuilder,
) -> Result<()>
{
    let mut cursor = BinaryCursor::new(data);
    let header = ContributionHeader {
        offset: cursor.read_u32()?,
        segment: cursor.read_u16()?,
        flags: cursor.read_u16()?,
        size: cursor.read_u32()?,
    };
    let base = segment_base(header.segment)
        .ok_or_else(|| SymError::malformed(format!("line block in unknown segment {}", header.segment)))?
        .wrapping_add(u64::from(header.offset));
    let has_columns = header.flags & LINES_HAVE_COLUMNS != 0;

    while !cursor.is_empty() {
        let checksum_offset = cursor.read_u32()?;
        let count = cursor.read_u32()? as usize;
        let block_size = cursor.read_u32()? as usize;
        let mut block = cursor.sub_cursor(block_size.saturating_sub(12))?;

        let file = match files.get(&checksum_offset) {
            Some(&file) => file,
            None => {
                let name = tables.file_name(checksum_offset).unwrap_or_else(|err| {
                    debug!(checksum_offset, %err, "unnamed source file");
                    format!("<file 0x{checksum_offset:x}>")
                });
                let file = builder.add_file(name);
                files.insert(checksum_offset, file);
                file
            }
        };

        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = block.read_u32()?;
            let bits = block.read_u32()?;
            rows.push((offset, bits & 0x00ff_ffff));
        }
        let mut columns = vec![0u32; count];
        if has_columns {
            for column in &mut columns {
                *column = u32::from(block.read_u16()?);
                block.read_u16()?;
            }
        }

        for ((offset, line), column) in rows.into_iter().zip(columns) {
            if HIDDEN_LINES.contains(&line) {
                continue;
            }
            builder.push_row(base.wrapping_add(u64::from(offset)), line, column, file);
        }
    }
    builder.push_end_sequence(base.wrapping_add(u64::from(header.size)));
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::line_table::LineTable;

    fn lines_subsection(columns: bool) -> Vec<u8>
    {
        let mut data = Vec::new();
        data.extend_from_slice(&0x10u32.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&u16::from(columns).to_le_bytes());
        data.extend_from_slice(&0x20u32.to_le_bytes());

        let rows: [(u32, u32); 3] = [(0, 7), (8, 0x00fe_efee), (0x10, 9)];
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        let size = 12 + rows.len() * 8 + if columns { rows.len() * 4 } else { 0 };
        data.extend_from_slice(&(size as u32).to_le_bytes());
        for (offset, line) in rows {
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(&(line | 0x8000_0000).to_le_bytes());
        }
        if columns {
            for column in [3u16, 0, 5] {
                data.extend_from_slice(&column.to_le_bytes());
                data.extend_from_slice(&0u16.to_le_bytes());
            }
        }
        data
    }

    fn build(columns: bool) -> LineTable
    {
        let lines = lines_subsection(columns);
        let checksums = [1u8, 0, 0, 0, 0, 0, 0, 0];
        let strings = b"\0main.cpp\0";
        let subs = [
            Subsection {
                kind: subsection::LINES,
                offset: 0,
                data: &lines,
            },
            Subsection {
                kind: subsection::FILE_CHECKSUMS,
                offset: 0,
                data: &checksums,
            },
            Subsection {
                kind: subsection::STRING_TABLE,
                offset: 0,
                data: strings,
            },
        ];
        let tables = FileTables::new(&subs);
        let mut builder = LineTable::builder();
        build_lines(&subs, &tables, |segment| (segment == 1).then_some(0x1000), &mut builder).unwrap();
        builder.finish()
    }

    #[test]
    fn test_line_block_rows()
    {
        let table = build(false);
        let rows: Vec<_> = table.iter().map(|e| (e.address, e.line, e.end_sequence)).collect();
        assert_eq!(rows, vec![(0x1010, 7, false), (0x1020, 9, false), (0x1030, 0, true)]);
        assert_eq!(table.files(), ["main.cpp".to_string()]);
    }

    #[test]
    fn test_line_block_columns()
    {
        let table = build(true);
        let hit = table.lookup(0x1024).unwrap();
        assert_eq!((hit.line, hit.column, hit.span), (9, 5, 0x10));
    }
}
