//! # Line Table
//!
//! Per-module address → (file, line, column) index.
//!
//! A [`LineTable`] is built once from the rows a backend produces (DWARF line
//! programs, CodeView line blocks) and is immutable afterwards. Storage is two
//! parallel arrays: `(address, record id)` pairs sorted by address, and the
//! `(line, column, file)` records they point to, plus a file-name table.
//!
//! Rows that end a sequence are kept as terminators: they close the span of the
//! row before them and an address that resolves to a terminator has no line.

use std::fmt;

/// Index into a line table's file-name table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl fmt::Display for FileId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "file#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineRecord
{
    line: u32,
    column: u32,
    file: FileId,
    end_sequence: bool,
}

/// One row of a line table, as produced by iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry
{
    pub address: u64,
    pub line: u32,
    pub column: u32,
    pub file: FileId,
    /// This row terminates a sequence; it carries no source position.
    pub end_sequence: bool,
}

/// Result of an address query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineHit
{
    /// Address of the row that covers the query
    pub address: u64,
    pub line: u32,
    pub column: u32,
    pub file: FileId,
    /// Bytes until the next row, zero for the last row
    pub span: u64,
}

/// Immutable, address-sorted line table
#[derive(Debug, Clone, Default)]
pub struct LineTable
{
    addresses: Vec<(u64, u32)>,
    records: Vec<LineRecord>,
    files: Vec<String>,
}

impl LineTable
{
    pub fn builder() -> LineTableBuilder
    {
        LineTableBuilder::default()
    }

    pub fn len(&self) -> usize
    {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.addresses.is_empty()
    }

    /// File name for `id`.
    pub fn file_name(&self, id: FileId) -> Option<&str>
    {
        self.files.get(id.0 as usize).map(String::as_str)
    }

    pub fn files(&self) -> &[String]
    {
        &self.files
    }

    /// Row at position `index` in address order.
    pub fn entry(&self, index: usize) -> Option<LineEntry>
    {
        let (address, id) = *self.addresses.get(index)?;
        let record = self.records[id as usize];
        Some(LineEntry {
            address,
            line: record.line,
            column: record.column,
            file: record.file,
            end_sequence: record.end_sequence,
        })
    }

    /// Rows in address order, terminators included.
    pub fn iter(&self) -> impl Iterator<Item = LineEntry> + '_
    {
        (0..self.addresses.len()).filter_map(|index| self.entry(index))
    }

    /// Find the row covering `address`.
    ///
    /// Returns the last row whose address is `<= address`, with a span equal to
    /// the distance to the following row (zero when it is the last row).
    /// Addresses before the first row, or covered by a sequence terminator,
    /// have no line.
    pub fn lookup(&self, address: u64) -> Option<LineHit>
    {
        let index = self.addresses.partition_point(|&(a, _)| a <= address).checked_sub(1)?;
        let entry = self.entry(index)?;
        if entry.end_sequence {
            return None;
        }
        let span = self
            .addresses
            .get(index + 1)
            .map_or(0, |&(next, _)| next - entry.address);
        Some(LineHit {
            address: entry.address,
            line: entry.line,
            column: entry.column,
            file: entry.file,
            span,
        })
    }
}

/// Accumulates rows and files, then sorts them into a [`LineTable`]
#[derive(Debug, Clone, Default)]
pub struct LineTableBuilder
{
    rows: Vec<(u64, LineRecord)>,
    files: Vec<String>,
}

impl LineTableBuilder
{
    /// Register a file name, returning its id. Names are not deduplicated.
    pub fn add_file(&mut self, name: impl Into<String>) -> FileId
    {
        self.files.push(name.into());
        FileId((self.files.len() - 1) as u32)
    }

    pub fn push_row(&mut self, address: u64, line: u32, column: u32, file: FileId)
    {
        self.rows.push((
            address,
            LineRecord {
                line,
                column,
                file,
                end_sequence: false,
            },
        ));
    }

    /// Close the current sequence at `address`.
    pub fn push_end_sequence(&mut self, address: u64)
    {
        self.rows.push((
            address,
            LineRecord {
                line: 0,
                column: 0,
                file: FileId(0),
                end_sequence: true,
            },
        ));
    }

    pub fn row_count(&self) -> usize
    {
        self.rows.len()
    }

    /// Sort and freeze.
    ///
    /// The sort is stable and places a terminator before a regular row at the
    /// same address, so a sequence that starts where the previous one ended
    /// wins the lookup.
    pub fn finish(mut self) -> LineTable
    {
        self.rows.sort_by_key(|(address, record)| (*address, !record.end_sequence));
        let mut addresses = Vec::with_capacity(self.rows.len());
        let mut records = Vec::with_capacity(self.rows.len());
        for (index, (address, record)) in self.rows.into_iter().enumerate() {
            addresses.push((address, index as u32));
            records.push(record);
        }
        LineTable {
            addresses,
            records,
            files: self.files,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sample() -> LineTable
    {
        let mut builder = LineTable::builder();
        let file = builder.add_file("main.c");
        builder.push_row(0x1010, 12, 5, file);
        builder.push_row(0x1000, 10, 1, file);
        builder.push_end_sequence(0x1020);
        builder.push_row(0x1020, 30, 0, file);
        builder.finish()
    }

    #[test]
    fn test_rows_are_sorted()
    {
        let table = sample();
        let addresses: Vec<_> = table.iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x1010, 0x1020, 0x1020]);
        assert!(table.entry(2).unwrap().end_sequence);
    }

    #[test]
    fn test_lookup_between_rows()
    {
        let table = sample();
        let hit = table.lookup(0x1008).unwrap();
        assert_eq!((hit.address, hit.line, hit.column, hit.span), (0x1000, 10, 1, 0x10));
        assert_eq!(table.file_name(hit.file), Some("main.c"));
    }

    #[test]
    fn test_lookup_last_row_has_zero_span()
    {
        let table = sample();
        let hit = table.lookup(0x2000).unwrap();
        assert_eq!(hit.line, 30);
        assert_eq!(hit.span, 0);
    }

    #[test]
    fn test_lookup_before_first_row()
    {
        assert_eq!(sample().lookup(0x0fff), None);
    }

    #[test]
    fn test_terminator_covers_gap()
    {
        let mut builder = LineTable::builder();
        let file = builder.add_file("a.c");
        builder.push_row(0x100, 1, 0, file);
        builder.push_end_sequence(0x110);
        builder.push_row(0x200, 2, 0, file);
        let table = builder.finish();
        assert_eq!(table.lookup(0x150), None);
        assert_eq!(table.lookup(0x10f).unwrap().line, 1);
    }
}
