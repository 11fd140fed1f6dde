//! # Line Number Programs
//!
//! Interpreter for `.debug_line` (DWARF 2–5).
//!
//! [`LineProgram`] is a state machine over the registers defined by the
//! standard; it yields one [`LineOp::Row`] whenever the program emits a row and
//! one [`LineOp::DefineFile`] for each `DW_LNE_define_file`. After
//! `end_sequence` every register returns to its initial value, since sequences
//! share no state.
//!
//! [`build_line_table`] replays a unit's program into a
//! [`LineTableBuilder`], mapping program file indices to table file ids.

use gimli::constants::{self, DwForm, DwLnct, DwLne, DwLns};
use tracing::{debug, trace};

use super::attr::{read_form, FormContext, FormValue};
use super::unit::UnitRef;
use super::Encoding;
use crate::cursor::{cstr_at, BinaryCursor};
use crate::error::{Result, SymError};
use crate::line_table::{FileId, LineTableBuilder};

/// One file-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry<'data>
{
    pub name: &'data [u8],
    pub dir_index: u64,
}

/// Parsed `.debug_line` program header
#[derive(Debug, Clone)]
pub struct LineProgramHeader<'data>
{
    pub offset: usize,
    pub encoding: Encoding,
    pub min_inst_len: u8,
    pub max_ops_per_inst: u8,
    pub default_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    /// Operand counts of standard opcodes `1..opcode_base`
    pub standard_opcode_lengths: &'data [u8],
    pub include_dirs: Vec<&'data [u8]>,
    pub files: Vec<FileEntry<'data>>,
    program_start: usize,
    program_end: usize,
}

fn read_path<'data>(unit: &UnitRef<'_, 'data>, value: FormValue<'data>) -> Result<&'data [u8]>
{
    match value {
        FormValue::InlineStr(bytes) => Ok(bytes),
        FormValue::LineStrOffset(offset) => cstr_at(unit.sections.debug_line_str, offset),
        FormValue::StrOffset(offset) => cstr_at(unit.sections.debug_str, offset),
        FormValue::StrIndex(index) => unit.string_at_index(index),
        other => Err(SymError::malformed(format!("line table path encoded as {other:?}"))),
    }
}

/// Read a DWARF 5 entry-format-described table.
fn read_entry_table<'data>(
    cursor: &mut BinaryCursor<'data>,
    unit: &UnitRef<'_, 'data>,
    context: FormContext,
) -> Result<Vec<FileEntry<'data>>>
{
    let format_count = cursor.read_u8()?;
    let mut formats = Vec::with_capacity(usize::from(format_count));
    for _ in 0..format_count {
        let content = cursor.read_uleb128()?;
        let form = cursor.read_uleb128()?;
        let form = u16::try_from(form).map_err(|_| SymError::malformed("line table entry form"))?;
        formats.push((DwLnct(content as u16), DwForm(form)));
    }
    let count = cursor.read_uleb128()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let mut entry = FileEntry {
            name: &[],
            dir_index: 0,
        };
        for &(content, form) in &formats {
            let value = read_form(cursor, form, None, context)?;
            match content {
                constants::DW_LNCT_path => entry.name = read_path(unit, value)?,
                constants::DW_LNCT_directory_index => {
                    if let FormValue::Data(index) = value {
                        entry.dir_index = index;
                    }
                }
                _ => {}
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

impl<'data> LineProgramHeader<'data>
{
    /// Parse the header of the program at `offset` in `.debug_line`.
    pub fn parse(unit: &UnitRef<'_, 'data>, offset: u64) -> Result<Self>
    {
        let data = unit.sections.debug_line;
        let start = usize::try_from(offset).map_err(|_| SymError::malformed("line program offset"))?;
        let mut cursor = BinaryCursor::with_range(data, start, data.len())
            .with_address_size(unit.encoding().address_size);
        let length = cursor.read_initial_length()?;
        let end = usize::try_from(length)
            .ok()
            .and_then(|length| cursor.offset().checked_add(length))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| SymError::malformed("line program overruns .debug_line"))?;
        let mut cursor = BinaryCursor::with_range(data, cursor.offset(), end)
            .with_address_size(unit.encoding().address_size)
            .with_format(cursor.format());

        let version = cursor.read_u16()?;
        if !(2..=5).contains(&version) {
            return Err(SymError::Unsupported(format!("line program version {version}")));
        }
        let mut address_size = unit.encoding().address_size;
        if version >= 5 {
            address_size = cursor.read_u8()?;
            let _segment_selector_size = cursor.read_u8()?;
            cursor.set_address_size(address_size);
        }
        let header_length = cursor.read_offset()?;
        let program_start = usize::try_from(header_length)
            .ok()
            .and_then(|length| cursor.offset().checked_add(length))
            .filter(|&start| start <= end)
            .ok_or_else(|| SymError::malformed("line program header length"))?;

        let min_inst_len = cursor.read_u8()?;
        let max_ops_per_inst = if version >= 4 { cursor.read_u8()? } else { 1 };
        let default_is_stmt = cursor.read_u8()? != 0;
        let line_base = cursor.read_i8()?;
        let line_range = cursor.read_u8()?;
        let opcode_base = cursor.read_u8()?;
        if line_range == 0 {
            return Err(SymError::malformed("line_range of zero"));
        }
        if opcode_base == 0 {
            return Err(SymError::malformed("opcode_base of zero"));
        }
        let standard_opcode_lengths = cursor.read_bytes(usize::from(opcode_base - 1))?;

        let encoding = Encoding {
            address_size,
            format: cursor.format(),
            version,
        };
        let context = FormContext {
            version,
            unit_offset: 0,
        };

        let mut include_dirs = Vec::new();
        let mut files = Vec::new();
        if version >= 5 {
            include_dirs = read_entry_table(&mut cursor, unit, context)?
                .into_iter()
                .map(|entry| entry.name)
                .collect();
            files = read_entry_table(&mut cursor, unit, context)?;
        } else {
            // Index 0 is the compilation directory / primary source file.
            include_dirs.push(unit.unit.comp_dir.unwrap_or_default());
            loop {
                let dir = cursor.read_cstr()?;
                if dir.is_empty() {
                    break;
                }
                include_dirs.push(dir);
            }
            files.push(FileEntry {
                name: unit.unit.name.unwrap_or_default(),
                dir_index: 0,
            });
            loop {
                let name = cursor.read_cstr()?;
                if name.is_empty() {
                    break;
                }
                let dir_index = cursor.read_uleb128()?;
                let _mtime = cursor.read_uleb128()?;
                let _length = cursor.read_uleb128()?;
                files.push(FileEntry { name, dir_index });
            }
        }

        Ok(Self {
            offset: start,
            encoding,
            min_inst_len,
            max_ops_per_inst: max_ops_per_inst.max(1),
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            standard_opcode_lengths,
            include_dirs,
            files,
            program_start,
            program_end: end,
        })
    }

    /// Full path of `file`, joined with its include directory.
    pub fn file_path(&self, file: &FileEntry<'_>) -> String
    {
        let name = String::from_utf8_lossy(file.name);
        let dir = usize::try_from(file.dir_index)
            .ok()
            .and_then(|index| self.include_dirs.get(index))
            .filter(|dir| !dir.is_empty());
        let is_absolute = name.starts_with('/') || name.as_bytes().get(1) == Some(&b':');
        match dir {
            Some(dir) if !is_absolute => {
                let dir = String::from_utf8_lossy(dir);
                format!("{}/{}", dir.trim_end_matches('/'), name)
            }
            _ => name.into_owned(),
        }
    }
}

/// State-machine registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow
{
    pub address: u64,
    pub op_index: u64,
    pub file: u64,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    pub isa: u64,
    pub discriminator: u64,
}

impl LineRow
{
    fn initial(header: &LineProgramHeader<'_>) -> Self
    {
        Self {
            address: 0,
            op_index: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: header.default_is_stmt,
            basic_block: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            isa: 0,
            discriminator: 0,
        }
    }
}

/// What one step of the program produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOp<'data>
{
    Row(LineRow),
    DefineFile(FileEntry<'data>),
}

/// Line-number program interpreter
pub struct LineProgram<'h, 'data>
{
    header: &'h LineProgramHeader<'data>,
    cursor: BinaryCursor<'data>,
    state: LineRow,
    done: bool,
}

impl<'h, 'data> LineProgram<'h, 'data>
{
    pub fn new(header: &'h LineProgramHeader<'data>, data: &'data [u8]) -> Self
    {
        Self {
            header,
            cursor: BinaryCursor::with_range(data, header.program_start, header.program_end)
                .with_address_size(header.encoding.address_size)
                .with_format(header.encoding.format),
            state: LineRow::initial(header),
            done: false,
        }
    }

    fn advance(&mut self, operation_advance: u64)
    {
        let header = self.header;
        let max_ops = u64::from(header.max_ops_per_inst);
        // Address arithmetic wraps like the target's; corrupt operands must not trap.
        let op_index = self.state.op_index.wrapping_add(operation_advance);
        self.state.address = self
            .state
            .address
            .wrapping_add(u64::from(header.min_inst_len).wrapping_mul(op_index / max_ops));
        self.state.op_index = op_index % max_ops;
    }

    fn emit(&mut self) -> LineRow
    {
        let row = self.state;
        self.state.basic_block = false;
        self.state.prologue_end = false;
        self.state.epilogue_begin = false;
        self.state.discriminator = 0;
        row
    }

    fn step(&mut self) -> Result<Option<LineOp<'data>>>
    {
        let header = self.header;
        while !self.cursor.is_empty() {
            let opcode = self.cursor.read_u8()?;
            if opcode >= header.opcode_base {
                let adjusted = opcode - header.opcode_base;
                let line_delta = i64::from(header.line_base) + i64::from(adjusted % header.line_range);
                self.advance(u64::from(adjusted / header.line_range));
                self.state.line = self.state.line.saturating_add_signed(line_delta);
                return Ok(Some(LineOp::Row(self.emit())));
            }

            match DwLns(opcode) {
                constants::DW_LNS_copy => return Ok(Some(LineOp::Row(self.emit()))),
                constants::DW_LNS_advance_pc => {
                    let advance = self.cursor.read_uleb128()?;
                    self.advance(advance);
                }
                constants::DW_LNS_advance_line => {
                    let delta = self.cursor.read_sleb128()?;
                    self.state.line = self.state.line.saturating_add_signed(delta);
                }
                constants::DW_LNS_set_file => self.state.file = self.cursor.read_uleb128()?,
                constants::DW_LNS_set_column => self.state.column = self.cursor.read_uleb128()?,
                constants::DW_LNS_negate_stmt => self.state.is_stmt = !self.state.is_stmt,
                constants::DW_LNS_set_basic_block => self.state.basic_block = true,
                constants::DW_LNS_const_add_pc => {
                    let adjusted = 255 - header.opcode_base;
                    self.advance(u64::from(adjusted / header.line_range));
                }
                constants::DW_LNS_fixed_advance_pc => {
                    let delta = self.cursor.read_u16()?;
                    self.state.address = self.state.address.wrapping_add(u64::from(delta));
                    self.state.op_index = 0;
                }
                constants::DW_LNS_set_prologue_end => self.state.prologue_end = true,
                constants::DW_LNS_set_epilogue_begin => self.state.epilogue_begin = true,
                constants::DW_LNS_set_isa => self.state.isa = self.cursor.read_uleb128()?,
                DwLns(0) => {
                    if let Some(op) = self.extended()? {
                        return Ok(Some(op));
                    }
                }
                DwLns(other) => {
                    let operands = header.standard_opcode_lengths[usize::from(other) - 1];
                    trace!(opcode = other, operands, "skipping unknown standard opcode");
                    for _ in 0..operands {
                        self.cursor.read_uleb128()?;
                    }
                }
            }
        }
        Ok(None)
    }

    fn extended(&mut self) -> Result<Option<LineOp<'data>>>
    {
        let length = self.cursor.read_uleb128()?;
        let length = usize::try_from(length).map_err(|_| SymError::malformed("extended opcode length"))?;
        if length == 0 {
            return Ok(None);
        }
        let start = self.cursor.offset();
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.cursor.limit())
            .ok_or_else(|| SymError::malformed("extended opcode overruns the program"))?;
        let mut body = self.cursor.sub_cursor(length)?;
        let opcode = DwLne(body.read_u8()?);
        let op = match opcode {
            constants::DW_LNE_end_sequence => {
                self.state.end_sequence = true;
                let row = self.state;
                self.state = LineRow::initial(self.header);
                Some(LineOp::Row(row))
            }
            constants::DW_LNE_set_address => {
                let size = u8::try_from(length - 1).map_err(|_| SymError::malformed("set_address operand"))?;
                self.state.address = body.read_sized(size)?;
                self.state.op_index = 0;
                None
            }
            constants::DW_LNE_define_file => {
                let name = body.read_cstr()?;
                let dir_index = body.read_uleb128()?;
                Some(LineOp::DefineFile(FileEntry { name, dir_index }))
            }
            constants::DW_LNE_set_discriminator => {
                self.state.discriminator = body.read_uleb128()?;
                None
            }
            other => {
                debug!(opcode = other.0, length, "skipping unknown extended opcode");
                None
            }
        };
        debug_assert_eq!(self.cursor.offset(), end);
        Ok(op)
    }
}

impl<'data> Iterator for LineProgram<'_, 'data>
{
    type Item = Result<LineOp<'data>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(op)) => Some(Ok(op)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn is_tombstone(address: u64, address_size: u8) -> bool
{
    let max = match address_size {
        8 => u64::MAX,
        4 => u64::from(u32::MAX),
        2 => u64::from(u16::MAX),
        _ => return false,
    };
    address == max || address == max - 1
}

/// Move one completed sequence into `builder`, unless it starts at a tombstone.
fn push_sequence(
    header: &LineProgramHeader<'_>,
    file_ids: &[FileId],
    builder: &mut LineTableBuilder,
    sequence: &mut Vec<LineRow>,
    end: u64,
)
{
    let dead = sequence
        .first()
        .is_some_and(|first| is_tombstone(first.address, header.encoding.address_size));
    if !dead && !sequence.is_empty() {
        for row in sequence.drain(..) {
            let file = usize::try_from(row.file)
                .ok()
                .and_then(|index| file_ids.get(index))
                .copied()
                .unwrap_or(FileId(0));
            let (Ok(line), Ok(column)) = (u32::try_from(row.line), u32::try_from(row.column)) else {
                debug!(address = row.address, line = row.line, "dropping row with out-of-range line");
                continue;
            };
            builder.push_row(row.address, line, column, file);
        }
        builder.push_end_sequence(end);
    }
    sequence.clear();
}

/// Replay `unit`'s line program into `builder`.
///
/// Returns the number of rows added. Sequences that start at a tombstone
/// address (code discarded by the linker) are dropped. A decoding error keeps
/// the rows of every sequence completed before it.
pub fn build_line_table(unit: &UnitRef<'_, '_>, builder: &mut LineTableBuilder) -> Result<usize>
{
    let Some(offset) = unit.unit.line_offset else {
        return Ok(0);
    };
    let header = LineProgramHeader::parse(unit, offset)?;
    let mut file_ids: Vec<FileId> = header
        .files
        .iter()
        .map(|file| builder.add_file(header.file_path(file)))
        .collect();
    let before = builder.row_count();

    let mut sequence: Vec<LineRow> = Vec::new();
    let mut result = Ok(());
    for op in LineProgram::new(&header, unit.sections.debug_line) {
        let op = match op {
            Ok(op) => op,
            Err(err) => {
                result = Err(err);
                break;
            }
        };
        match op {
            LineOp::DefineFile(file) => file_ids.push(builder.add_file(header.file_path(&file))),
            LineOp::Row(row) if !row.end_sequence => sequence.push(row),
            LineOp::Row(end) => push_sequence(&header, &file_ids, builder, &mut sequence, end.address),
        }
    }
    let added = builder.row_count() - before;
    result.map(|()| added)
}
