//! # Call Frame Information
//!
//! Parser for `.eh_frame` / `.debug_frame` entries and the rule-table VM that
//! replays CIE and FDE programs up to a target instruction.
//!
//! ## Flow
//!
//! 1. Find the FDE covering `ip` ([`FdeIndex`], wrapped with its section in
//!    [`CfiUnwinder`], or [`CfiSection::find_fde`] for a one-off scan).
//! 2. [`unwind_row`]: run the CIE's initial instructions, then the FDE's,
//!    stopping as soon as the location would pass `ip`.
//! 3. [`apply_row`]: compute the CFA and every register's caller value from
//!    the row, then commit them together.

use std::fmt;

use gimli::constants::{self, DwCfa, DwEhPe};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::PendingWrites;
use crate::access::{memory_error, register_error, MemoryAccess, RegisterAccess};
use crate::config::UnwindLimits;
use crate::cursor::{BinaryCursor, Format};
use crate::dwarf::expr::{evaluate_with_stack, EvalContext, ExprResult};
use crate::dwarf::Encoding;
use crate::error::{Result, SymError};
use crate::types::{Arch, RegisterId};

/// Which section flavour the bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfiKind
{
    EhFrame,
    DebugFrame,
}

/// Call-frame section bytes plus the bases pointer encodings refer to
#[derive(Debug, Clone, Copy)]
pub struct CfiSection<'data>
{
    pub kind: CfiKind,
    pub data: &'data [u8],
    /// Link-time address of the section's first byte (`pcrel` base)
    pub address: u64,
    /// Base for `DW_EH_PE_datarel` (usually the `.got` address)
    pub data_base: Option<u64>,
    /// Base for `DW_EH_PE_textrel`
    pub text_base: Option<u64>,
    pub address_size: u8,
}

impl<'data> CfiSection<'data>
{
    pub fn eh_frame(data: &'data [u8], address: u64, address_size: u8) -> Self
    {
        Self {
            kind: CfiKind::EhFrame,
            data,
            address,
            data_base: None,
            text_base: None,
            address_size,
        }
    }

    pub fn debug_frame(data: &'data [u8], address_size: u8) -> Self
    {
        Self {
            kind: CfiKind::DebugFrame,
            data,
            address: 0,
            data_base: None,
            text_base: None,
            address_size,
        }
    }

    #[must_use]
    pub fn with_bases(mut self, text_base: Option<u64>, data_base: Option<u64>) -> Self
    {
        self.text_base = text_base;
        self.data_base = data_base;
        self
    }
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie<'data>
{
    pub offset: usize,
    pub format: Format,
    pub version: u8,
    pub augmentation: &'data [u8],
    pub address_size: u8,
    pub code_align: u64,
    pub data_align: i64,
    pub return_register: RegisterId,
    /// `z`: FDEs carry an augmentation data block
    pub has_augmentation_data: bool,
    pub fde_encoding: DwEhPe,
    pub lsda_encoding: DwEhPe,
    pub personality: Option<u64>,
    /// `S`: frames of this CIE are signal handlers
    pub signal_frame: bool,
    pub instructions: &'data [u8],
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde<'data>
{
    pub offset: usize,
    pub cie: Cie<'data>,
    /// First covered address (stored space)
    pub start: u64,
    /// One past the last covered address
    pub end: u64,
    pub lsda: Option<u64>,
    pub instructions: &'data [u8],
}

impl Fde<'_>
{
    pub fn contains(&self, address: u64) -> bool
    {
        self.start <= address && address < self.end
    }
}

/// A parsed section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfiEntry<'data>
{
    Cie(Cie<'data>),
    Fde(Fde<'data>),
}

struct EntryHeader<'data>
{
    offset: usize,
    /// Cursor over the entry body, starting at the CIE id / CIE pointer
    body: BinaryCursor<'data>,
    end: usize,
    id_offset: usize,
    id: u64,
    is_cie: bool,
}

fn read_pointer(cursor: &mut BinaryCursor<'_>, encoding: DwEhPe, section: &CfiSection<'_>) -> Result<Option<u64>>
{
    if encoding == constants::DW_EH_PE_omit {
        return Ok(None);
    }
    if encoding.0 & constants::DW_EH_PE_indirect.0 != 0 {
        return Err(SymError::Unsupported("indirect pointer encoding".into()));
    }
    let field_address = section.address.wrapping_add(cursor.offset() as u64);
    let value = read_encoded_value(cursor, encoding, section.address_size)?;
    let base = match DwEhPe(encoding.0 & 0x70) {
        constants::DW_EH_PE_absptr => 0,
        constants::DW_EH_PE_pcrel => field_address,
        constants::DW_EH_PE_textrel => section
            .text_base
            .ok_or_else(|| SymError::Unsupported("textrel pointer without a text base".into()))?,
        constants::DW_EH_PE_datarel => section
            .data_base
            .ok_or_else(|| SymError::Unsupported("datarel pointer without a data base".into()))?,
        other => return Err(SymError::Unsupported(format!("pointer application {other}"))),
    };
    Ok(Some(base.wrapping_add(value)))
}

/// Read the value part of a `DW_EH_PE_*` encoding, ignoring its application.
fn read_encoded_value(cursor: &mut BinaryCursor<'_>, encoding: DwEhPe, address_size: u8) -> Result<u64>
{
    Ok(match DwEhPe(encoding.0 & 0x0f) {
        constants::DW_EH_PE_absptr => cursor.read_sized(address_size)?,
        constants::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
        constants::DW_EH_PE_udata2 => u64::from(cursor.read_u16()?),
        constants::DW_EH_PE_udata4 => u64::from(cursor.read_u32()?),
        constants::DW_EH_PE_udata8 => cursor.read_u64()?,
        constants::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
        constants::DW_EH_PE_sdata2 => i64::from(cursor.read_i16()?) as u64,
        constants::DW_EH_PE_sdata4 => i64::from(cursor.read_i32()?) as u64,
        constants::DW_EH_PE_sdata8 => cursor.read_i64()? as u64,
        other => return Err(SymError::malformed(format!("pointer encoding {other}"))),
    })
}

fn register_operand(cursor: &mut BinaryCursor<'_>) -> Result<RegisterId>
{
    u16::try_from(cursor.read_uleb128()?)
        .map(RegisterId)
        .map_err(|_| SymError::malformed("CFI register number"))
}

impl<'data> CfiSection<'data>
{
    fn cursor_at(&self, offset: usize) -> Result<BinaryCursor<'data>>
    {
        if offset > self.data.len() {
            return Err(SymError::malformed(format!("CFI offset 0x{offset:x} past the section")));
        }
        Ok(BinaryCursor::with_range(self.data, offset, self.data.len()).with_address_size(self.address_size))
    }

    /// Entry header at `offset`; `None` at a terminator or the section end.
    fn header(&self, offset: usize) -> Result<Option<EntryHeader<'data>>>
    {
        if offset >= self.data.len() {
            return Ok(None);
        }
        let mut cursor = self.cursor_at(offset)?;
        let length = cursor.read_initial_length()?;
        if length == 0 {
            return Ok(None);
        }
        let format = cursor.format();
        let body_start = cursor.offset();
        let end = usize::try_from(length)
            .ok()
            .and_then(|length| body_start.checked_add(length))
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| SymError::malformed(format!("CFI entry 0x{offset:x} overruns the section")))?;
        let mut body = BinaryCursor::with_range(self.data, body_start, end)
            .with_address_size(self.address_size)
            .with_format(format);
        let id_offset = body.offset();
        let (id, is_cie) = match (self.kind, format) {
            (CfiKind::EhFrame, _) => {
                let id = u64::from(body.read_u32()?);
                (id, id == 0)
            }
            (CfiKind::DebugFrame, Format::Dwarf32) => {
                let id = u64::from(body.read_u32()?);
                (id, id == 0xffff_ffff)
            }
            (CfiKind::DebugFrame, Format::Dwarf64) => {
                let id = body.read_u64()?;
                (id, id == u64::MAX)
            }
        };
        Ok(Some(EntryHeader {
            offset,
            body,
            end,
            id_offset,
            id,
            is_cie,
        }))
    }

    /// Parse the CIE at `offset`.
    pub fn cie_at(&self, offset: usize) -> Result<Cie<'data>>
    {
        let header = self
            .header(offset)?
            .ok_or_else(|| SymError::malformed(format!("no CIE at 0x{offset:x}")))?;
        if !header.is_cie {
            return Err(SymError::malformed(format!("entry at 0x{offset:x} is not a CIE")));
        }
        self.parse_cie(header)
    }

    fn parse_cie(&self, header: EntryHeader<'data>) -> Result<Cie<'data>>
    {
        let mut cursor = header.body;
        let version = cursor.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(SymError::Unsupported(format!("CIE version {version}")));
        }
        let augmentation = cursor.read_cstr()?;

        let mut address_size = self.address_size;
        if augmentation.starts_with(b"eh") {
            cursor.read_sized(self.address_size)?;
        }
        if self.kind == CfiKind::DebugFrame && version >= 4 {
            address_size = cursor.read_u8()?;
            let segment_size = cursor.read_u8()?;
            if segment_size != 0 {
                return Err(SymError::Unsupported("segmented CFI addresses".into()));
            }
        }
        let code_align = cursor.read_uleb128()?;
        let data_align = cursor.read_sleb128()?;
        let return_register = if version == 1 {
            RegisterId(u16::from(cursor.read_u8()?))
        } else {
            register_operand(&mut cursor)?
        };

        let mut cie = Cie {
            offset: header.offset,
            format: cursor.format(),
            version,
            augmentation,
            address_size,
            code_align,
            data_align,
            return_register,
            has_augmentation_data: false,
            fde_encoding: constants::DW_EH_PE_absptr,
            lsda_encoding: constants::DW_EH_PE_omit,
            personality: None,
            signal_frame: false,
            instructions: &[],
        };

        if let Some(rest) = augmentation.strip_prefix(b"z") {
            cie.has_augmentation_data = true;
            let length = usize::try_from(cursor.read_uleb128()?)
                .map_err(|_| SymError::malformed("CIE augmentation length"))?;
            let mut data = cursor.sub_cursor(length)?;
            let section = CfiSection {
                address_size,
                ..*self
            };
            for &letter in rest {
                match letter {
                    b'L' => cie.lsda_encoding = DwEhPe(data.read_u8()?),
                    b'R' => cie.fde_encoding = DwEhPe(data.read_u8()?),
                    b'P' => {
                        let encoding = DwEhPe(data.read_u8()?);
                        cie.personality = read_pointer(&mut data, encoding, &section)?;
                    }
                    b'S' => cie.signal_frame = true,
                    // Remaining letters are described by the length we skip past.
                    _ => break,
                }
            }
        } else if !augmentation.is_empty() && augmentation != b"eh" {
            return Err(SymError::Unsupported(format!(
                "CIE augmentation {:?}",
                String::from_utf8_lossy(augmentation)
            )));
        }

        let rest = cursor.remaining();
        cie.instructions = cursor.read_bytes(rest)?;
        Ok(cie)
    }

    fn parse_fde(&self, header: EntryHeader<'data>) -> Result<Fde<'data>>
    {
        let cie_offset = match self.kind {
            CfiKind::EhFrame => (header.id_offset as u64).checked_sub(header.id),
            CfiKind::DebugFrame => Some(header.id),
        }
        .and_then(|offset| usize::try_from(offset).ok())
        .ok_or_else(|| SymError::malformed(format!("FDE 0x{:x} has a bad CIE pointer", header.offset)))?;
        let cie = self.cie_at(cie_offset)?;

        let section = CfiSection {
            address_size: cie.address_size,
            ..*self
        };
        let mut cursor = header.body;
        cursor.set_address_size(cie.address_size);
        let (start, length) = match self.kind {
            CfiKind::EhFrame => {
                let start = read_pointer(&mut cursor, cie.fde_encoding, &section)?
                    .ok_or_else(|| SymError::malformed("FDE start address omitted"))?;
                let length = read_encoded_value(&mut cursor, cie.fde_encoding, cie.address_size)?;
                (start, length)
            }
            CfiKind::DebugFrame => (cursor.read_address()?, cursor.read_address()?),
        };

        let mut lsda = None;
        if cie.has_augmentation_data {
            let length = usize::try_from(cursor.read_uleb128()?)
                .map_err(|_| SymError::malformed("FDE augmentation length"))?;
            let mut data = cursor.sub_cursor(length)?;
            if cie.lsda_encoding != constants::DW_EH_PE_omit {
                lsda = read_pointer(&mut data, cie.lsda_encoding, &section)?;
            }
        }

        let rest = cursor.remaining();
        let instructions = cursor.read_bytes(rest)?;
        Ok(Fde {
            offset: header.offset,
            cie,
            start,
            end: start.wrapping_add(length),
            lsda,
            instructions,
        })
    }

    /// Parse the FDE at `offset`.
    pub fn fde_at(&self, offset: usize) -> Result<Fde<'data>>
    {
        let header = self
            .header(offset)?
            .ok_or_else(|| SymError::malformed(format!("no FDE at 0x{offset:x}")))?;
        if header.is_cie {
            return Err(SymError::malformed(format!("entry at 0x{offset:x} is a CIE")));
        }
        self.parse_fde(header)
    }

    /// Iterate every entry of the section.
    pub fn entries(&self) -> Entries<'_, 'data>
    {
        Entries {
            section: self,
            offset: 0,
            done: false,
        }
    }

    /// FDE covering `address`, by linear scan.
    pub fn find_fde(&self, address: u64) -> Result<Option<Fde<'data>>>
    {
        for entry in self.entries() {
            match entry {
                Ok(CfiEntry::Fde(fde)) if fde.contains(address) => return Ok(Some(fde)),
                Ok(_) => {}
                Err(err) => debug!(%err, "skipping CFI entry"),
            }
        }
        Ok(None)
    }
}

/// Iterator over the entries of a call-frame section
///
/// A corrupt entry is reported once and skipped when its length is readable;
/// an unreadable length ends the iteration.
pub struct Entries<'s, 'data>
{
    section: &'s CfiSection<'data>,
    offset: usize,
    done: bool,
}

impl<'data> Iterator for Entries<'_, 'data>
{
    type Item = Result<CfiEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.done {
            return None;
        }
        let header = match self.section.header(self.offset) {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        self.offset = header.end;
        Some(if header.is_cie {
            self.section.parse_cie(header).map(CfiEntry::Cie)
        } else {
            self.section.parse_fde(header).map(CfiEntry::Fde)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdeSpan
{
    start: u64,
    end: u64,
    offset: usize,
}

/// Sorted `(start, end, offset)` index of a section's FDEs
#[derive(Debug, Clone, Default)]
pub struct FdeIndex
{
    spans: Vec<FdeSpan>,
}

impl FdeIndex
{
    /// Scan `section` once. Entries that fail to parse are left out.
    pub fn build(section: &CfiSection<'_>) -> Self
    {
        let mut spans = Vec::new();
        for entry in section.entries() {
            match entry {
                Ok(CfiEntry::Fde(fde)) if fde.start < fde.end => spans.push(FdeSpan {
                    start: fde.start,
                    end: fde.end,
                    offset: fde.offset,
                }),
                Ok(_) => {}
                Err(err) => warn!(%err, "CFI entry left out of the index"),
            }
        }
        spans.sort_by_key(|span| (span.start, span.end));
        debug!(fdes = spans.len(), "built FDE index");
        Self { spans }
    }

    pub fn len(&self) -> usize
    {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.spans.is_empty()
    }

    /// Section offset of the FDE covering `address`.
    pub fn lookup(&self, address: u64) -> Option<usize>
    {
        let index = self.spans.partition_point(|span| span.start <= address);
        self.spans[..index]
            .iter()
            .rev()
            .take_while(|span| span.start <= address)
            .find(|span| address < span.end)
            .map(|span| span.offset)
    }

    /// FDE covering `address`, parsed from `section`.
    pub fn find<'data>(&self, section: &CfiSection<'data>, address: u64) -> Result<Option<Fde<'data>>>
    {
        self.lookup(address)
            .map(|offset| section.fde_at(offset))
            .transpose()
    }
}

/// How to recover one register of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRule<'data>
{
    /// The caller's value cannot be recovered
    Undefined,
    /// The register was not modified
    SameValue,
    /// Saved at `CFA + offset`
    Offset(i64),
    /// The caller's value is `CFA + offset`
    ValOffset(i64),
    /// Saved in another register
    Register(RegisterId),
    /// Saved at the address the expression computes (CFA pushed first)
    Expression(&'data [u8]),
    /// The caller's value is what the expression computes
    ValExpression(&'data [u8]),
}

/// How to compute the CFA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule<'data>
{
    RegisterOffset
    {
        register: RegisterId,
        offset: i64,
    },
    Expression(&'data [u8]),
}

impl fmt::Display for CfaRule<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            CfaRule::RegisterOffset { register, offset } => write!(f, "{register}{offset:+}"),
            CfaRule::Expression(ops) => write!(f, "expr({} bytes)", ops.len()),
        }
    }
}

/// Rule table in effect at one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow<'data>
{
    /// First address the row applies to
    pub start: u64,
    /// One past the last address the row applies to
    pub end: u64,
    pub cfa: CfaRule<'data>,
    rules: SmallVec<[(RegisterId, RegisterRule<'data>); 16]>,
    /// `DW_CFA_GNU_args_size`
    pub args_size: u64,
}

impl<'data> UnwindRow<'data>
{
    fn new(start: u64) -> Self
    {
        Self {
            start,
            end: u64::MAX,
            cfa: CfaRule::RegisterOffset {
                register: RegisterId(0),
                offset: 0,
            },
            rules: SmallVec::new(),
            args_size: 0,
        }
    }

    /// Rule for `reg`, `None` when the programs never mention it.
    pub fn rule(&self, reg: RegisterId) -> Option<RegisterRule<'data>>
    {
        self.rules.iter().find(|(r, _)| *r == reg).map(|(_, rule)| *rule)
    }

    /// Every explicit rule, in the order registers were first mentioned.
    pub fn rules(&self) -> impl Iterator<Item = (RegisterId, RegisterRule<'data>)> + '_
    {
        self.rules.iter().copied()
    }

    fn set_rule(&mut self, reg: RegisterId, rule: RegisterRule<'data>)
    {
        match self.rules.iter_mut().find(|(r, _)| *r == reg) {
            Some(slot) => slot.1 = rule,
            None => self.rules.push((reg, rule)),
        }
    }

    fn clear_rule(&mut self, reg: RegisterId)
    {
        self.rules.retain(|(r, _)| *r != reg);
    }
}

/// Snapshot kept by `DW_CFA_remember_state`
type RememberedState<'data> = (CfaRule<'data>, SmallVec<[(RegisterId, RegisterRule<'data>); 16]>);

struct CfiVm<'a, 'data>
{
    section: CfiSection<'data>,
    cie: &'a Cie<'data>,
    row: UnwindRow<'data>,
    /// Rules established by the CIE, for `DW_CFA_restore`
    initial: Option<UnwindRow<'data>>,
    stack: Vec<RememberedState<'data>>,
    loc: u64,
    target: u64,
    limits: &'a UnwindLimits,
}

enum Step
{
    Continue,
    /// The next instruction would move past the target address
    Stop(u64),
}

impl<'data> CfiVm<'_, 'data>
{
    fn advance(&mut self, delta: u64) -> Result<Step>
    {
        let next = delta
            .checked_mul(self.cie.code_align)
            .and_then(|delta| self.loc.checked_add(delta))
            .ok_or_else(|| SymError::malformed("CFI location overflow"))?;
        self.move_to(next)
    }

    fn move_to(&mut self, next: u64) -> Result<Step>
    {
        if next < self.loc {
            return Err(SymError::malformed("CFI location moved backwards"));
        }
        if next > self.target {
            return Ok(Step::Stop(next));
        }
        self.loc = next;
        self.row.start = next;
        Ok(Step::Continue)
    }

    fn factored(&self, value: u64) -> i64
    {
        (value as i64).wrapping_mul(self.cie.data_align)
    }

    fn factored_signed(&self, value: i64) -> i64
    {
        value.wrapping_mul(self.cie.data_align)
    }

    fn restore(&mut self, reg: RegisterId) -> Result<()>
    {
        let initial = self
            .initial
            .as_ref()
            .ok_or_else(|| SymError::malformed("DW_CFA_restore in a CIE"))?;
        match initial.rule(reg) {
            Some(rule) => self.row.set_rule(reg, rule),
            None => self.row.clear_rule(reg),
        }
        Ok(())
    }

    fn set_cfa_register(&mut self, register: RegisterId) -> Result<()>
    {
        match &mut self.row.cfa {
            CfaRule::RegisterOffset { register: reg, .. } => {
                *reg = register;
                Ok(())
            }
            CfaRule::Expression(_) => Err(SymError::malformed("DW_CFA_def_cfa_register after an expression CFA")),
        }
    }

    fn set_cfa_offset(&mut self, offset: i64) -> Result<()>
    {
        match &mut self.row.cfa {
            CfaRule::RegisterOffset { offset: off, .. } => {
                *off = offset;
                Ok(())
            }
            CfaRule::Expression(_) => Err(SymError::malformed("DW_CFA_def_cfa_offset after an expression CFA")),
        }
    }

    fn block(cursor: &mut BinaryCursor<'data>) -> Result<&'data [u8]>
    {
        let length = usize::try_from(cursor.read_uleb128()?).map_err(|_| SymError::malformed("CFI block length"))?;
        cursor.read_bytes(length)
    }

    /// Run `program`; returns the address the next row would start at, when
    /// execution stopped before the end.
    #[allow(clippy::too_many_lines)]
    fn run(&mut self, program: &'data [u8]) -> Result<Option<u64>>
    {
        let mut cursor = BinaryCursor::new(program)
            .with_address_size(self.cie.address_size)
            .with_format(self.cie.format);
        while !cursor.is_empty() {
            let byte = cursor.read_u8()?;
            let low = u64::from(byte & 0x3f);
            let step = match byte & 0xc0 {
                0x40 => self.advance(low)?,
                0x80 => {
                    let offset = self.factored(cursor.read_uleb128()?);
                    self.row.set_rule(RegisterId(low as u16), RegisterRule::Offset(offset));
                    Step::Continue
                }
                0xc0 => {
                    self.restore(RegisterId(low as u16))?;
                    Step::Continue
                }
                _ => self.extended(DwCfa(byte), &mut cursor)?,
            };
            if let Step::Stop(next) = step {
                return Ok(Some(next));
            }
        }
        Ok(None)
    }

    fn extended(&mut self, op: DwCfa, cursor: &mut BinaryCursor<'data>) -> Result<Step>
    {
        trace!(op = %op, loc = self.loc, "cfa");
        match op {
            constants::DW_CFA_nop => {}
            constants::DW_CFA_set_loc => {
                let encoding = match self.section.kind {
                    CfiKind::EhFrame => self.cie.fde_encoding,
                    CfiKind::DebugFrame => constants::DW_EH_PE_absptr,
                };
                if encoding.0 & 0x70 != 0 {
                    return Err(SymError::Unsupported("relative DW_CFA_set_loc operand".into()));
                }
                let next = read_encoded_value(cursor, encoding, self.cie.address_size)?;
                return self.move_to(next);
            }
            constants::DW_CFA_advance_loc1 => return self.advance(u64::from(cursor.read_u8()?)),
            constants::DW_CFA_advance_loc2 => return self.advance(u64::from(cursor.read_u16()?)),
            constants::DW_CFA_advance_loc4 => return self.advance(u64::from(cursor.read_u32()?)),
            constants::DW_CFA_offset_extended => {
                let reg = register_operand(cursor)?;
                let offset = self.factored(cursor.read_uleb128()?);
                self.row.set_rule(reg, RegisterRule::Offset(offset));
            }
            constants::DW_CFA_offset_extended_sf => {
                let reg = register_operand(cursor)?;
                let offset = self.factored_signed(cursor.read_sleb128()?);
                self.row.set_rule(reg, RegisterRule::Offset(offset));
            }
            constants::DW_CFA_GNU_negative_offset_extended => {
                let reg = register_operand(cursor)?;
                let offset = self.factored(cursor.read_uleb128()?);
                self.row.set_rule(reg, RegisterRule::Offset(offset.wrapping_neg()));
            }
            constants::DW_CFA_val_offset => {
                let reg = register_operand(cursor)?;
                let offset = self.factored(cursor.read_uleb128()?);
                self.row.set_rule(reg, RegisterRule::ValOffset(offset));
            }
            constants::DW_CFA_val_offset_sf => {
                let reg = register_operand(cursor)?;
                let offset = self.factored_signed(cursor.read_sleb128()?);
                self.row.set_rule(reg, RegisterRule::ValOffset(offset));
            }
            constants::DW_CFA_restore_extended => {
                let reg = register_operand(cursor)?;
                self.restore(reg)?;
            }
            constants::DW_CFA_undefined => {
                let reg = register_operand(cursor)?;
                self.row.set_rule(reg, RegisterRule::Undefined);
            }
            constants::DW_CFA_same_value => {
                let reg = register_operand(cursor)?;
                self.row.set_rule(reg, RegisterRule::SameValue);
            }
            constants::DW_CFA_register => {
                let reg = register_operand(cursor)?;
                let other = register_operand(cursor)?;
                self.row.set_rule(reg, RegisterRule::Register(other));
            }
            constants::DW_CFA_remember_state => {
                if self.stack.len() >= self.limits.remember_depth {
                    return Err(SymError::malformed("DW_CFA_remember_state nested too deep"));
                }
                self.stack.push((self.row.cfa, self.row.rules.clone()));
            }
            constants::DW_CFA_restore_state => {
                let (cfa, rules) = self
                    .stack
                    .pop()
                    .ok_or_else(|| SymError::malformed("DW_CFA_restore_state with an empty stack"))?;
                self.row.cfa = cfa;
                self.row.rules = rules;
            }
            constants::DW_CFA_def_cfa => {
                let register = register_operand(cursor)?;
                let offset = cursor.read_uleb128()? as i64;
                self.row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            constants::DW_CFA_def_cfa_sf => {
                let register = register_operand(cursor)?;
                let offset = self.factored_signed(cursor.read_sleb128()?);
                self.row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            constants::DW_CFA_def_cfa_register => {
                let register = register_operand(cursor)?;
                self.set_cfa_register(register)?;
            }
            constants::DW_CFA_def_cfa_offset => {
                let offset = cursor.read_uleb128()? as i64;
                self.set_cfa_offset(offset)?;
            }
            constants::DW_CFA_def_cfa_offset_sf => {
                let offset = self.factored_signed(cursor.read_sleb128()?);
                self.set_cfa_offset(offset)?;
            }
            constants::DW_CFA_def_cfa_expression => {
                self.row.cfa = CfaRule::Expression(Self::block(cursor)?);
            }
            constants::DW_CFA_expression => {
                let reg = register_operand(cursor)?;
                let ops = Self::block(cursor)?;
                self.row.set_rule(reg, RegisterRule::Expression(ops));
            }
            constants::DW_CFA_val_expression => {
                let reg = register_operand(cursor)?;
                let ops = Self::block(cursor)?;
                self.row.set_rule(reg, RegisterRule::ValExpression(ops));
            }
            constants::DW_CFA_GNU_args_size => {
                self.row.args_size = cursor.read_uleb128()?;
            }
            _ => return Err(SymError::Unsupported(format!("CFI opcode {op}"))),
        }
        Ok(Step::Continue)
    }
}

/// Rule table in effect at `address` (stored space) inside `fde`.
pub fn unwind_row<'data>(
    section: &CfiSection<'data>,
    fde: &Fde<'data>,
    address: u64,
    limits: &UnwindLimits,
) -> Result<UnwindRow<'data>>
{
    if !fde.contains(address) {
        return Err(SymError::InvalidUsage(format!(
            "address 0x{address:x} outside FDE [0x{:x}, 0x{:x})",
            fde.start, fde.end
        )));
    }
    let mut vm = CfiVm {
        section: *section,
        cie: &fde.cie,
        row: UnwindRow::new(fde.start),
        initial: None,
        stack: Vec::new(),
        loc: fde.start,
        // CIE programs describe the state at the FDE's first address only.
        target: fde.start,
        limits,
    };
    vm.run(fde.cie.instructions)?;
    vm.initial = Some(vm.row.clone());
    vm.stack.clear();
    vm.loc = fde.start;
    vm.row.start = fde.start;
    vm.target = address;

    let next = vm.run(fde.instructions)?;
    let mut row = vm.row;
    row.end = next.unwrap_or(fde.end).min(fde.end);
    Ok(row)
}

fn expr_context<'a, 'data>(
    arch: Arch,
    cie: &Cie<'_>,
    regs: &'a dyn RegisterAccess,
    mem: &'a dyn MemoryAccess,
    limits: &UnwindLimits,
) -> EvalContext<'a, 'data>
{
    let encoding = Encoding {
        address_size: arch.pointer_size(),
        format: cie.format,
        version: 4,
    };
    let mut ctx = EvalContext::new(arch, encoding, regs, mem);
    ctx.step_limit = limits.expr_steps;
    ctx
}

/// Compute the CFA described by `row` against the current registers.
pub fn compute_cfa(
    row: &UnwindRow<'_>,
    cie: &Cie<'_>,
    arch: Arch,
    regs: &dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<u64>
{
    match row.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = regs
                .read_register(arch, register)
                .map_err(|err| register_error(register, err))?;
            Ok(base.wrapping_add_signed(offset))
        }
        CfaRule::Expression(ops) => {
            let ctx = expr_context(arch, cie, regs, mem, limits);
            match evaluate_with_stack(ops, &ctx, &[])? {
                ExprResult::Address(cfa) | ExprResult::Value(cfa) => Ok(cfa),
                other => Err(SymError::malformed(format!("CFA expression produced {other:?}"))),
            }
        }
    }
}

/// Apply `row` to the register file.
///
/// The CFA and every caller register are computed first; nothing is written
/// unless all of them succeed. Returns `false`, leaving the registers alone,
/// when the return address is undefined (outermost frame).
pub fn apply_row(
    row: &UnwindRow<'_>,
    cie: &Cie<'_>,
    arch: Arch,
    regs: &mut dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<bool>
{
    if matches!(row.rule(cie.return_register), Some(RegisterRule::Undefined)) {
        debug!(ra = %cie.return_register, "return address undefined; outermost frame");
        return Ok(false);
    }

    let pending = {
        let regs: &dyn RegisterAccess = regs;
        let cfa = compute_cfa(row, cie, arch, regs, mem, limits)?;
        let size = arch.pointer_size();
        let load = |address: u64| {
            mem.read_sized(address, size)
                .map_err(|err| memory_error(address, err))
        };

        let mut pending = PendingWrites::default();
        for (reg, rule) in row.rules() {
            let value = match rule {
                RegisterRule::SameValue => continue,
                RegisterRule::Undefined => None,
                RegisterRule::Offset(offset) => Some(load(cfa.wrapping_add_signed(offset))?),
                RegisterRule::ValOffset(offset) => Some(cfa.wrapping_add_signed(offset)),
                RegisterRule::Register(other) => Some(
                    regs.read_register(arch, other)
                        .map_err(|err| register_error(other, err))?,
                ),
                RegisterRule::Expression(ops) | RegisterRule::ValExpression(ops) => {
                    let ctx = expr_context(arch, cie, regs, mem, limits);
                    let result = match evaluate_with_stack(ops, &ctx, &[cfa])? {
                        ExprResult::Address(value) | ExprResult::Value(value) => value,
                        other => return Err(SymError::malformed(format!("register rule produced {other:?}"))),
                    };
                    if matches!(rule, RegisterRule::Expression(_)) {
                        Some(load(result)?)
                    } else {
                        Some(result)
                    }
                }
            };
            pending.set(reg, value);
        }

        let return_address = pending.read(arch, regs, cie.return_register)?;
        pending.set(arch.stack_pointer(), Some(cfa));
        pending.set(arch.program_counter(), Some(return_address));
        trace!(cfa, return_address, "applied CFI row");
        pending
    };

    pending.commit(arch, regs)?;
    Ok(true)
}

/// Unwind one frame with the FDE covering the current program counter,
/// found by a linear scan. Used for one-off byte slices; a section that is
/// unwound repeatedly belongs in a [`CfiUnwinder`].
pub(crate) fn unwind_frame(
    section: &CfiSection<'_>,
    arch: Arch,
    load_bias: u64,
    regs: &mut dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<bool>
{
    unwind_with(section, |stored| section.find_fde(stored), arch, load_bias, regs, mem, limits)
}

fn unwind_with<'data>(
    section: &CfiSection<'data>,
    find: impl FnOnce(u64) -> Result<Option<Fde<'data>>>,
    arch: Arch,
    load_bias: u64,
    regs: &mut dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<bool>
{
    let pc_reg = arch.program_counter();
    let pc = regs.read_register(arch, pc_reg).map_err(|err| register_error(pc_reg, err))?;
    let stored = pc.wrapping_sub(load_bias);
    let fde = find(stored)?.ok_or_else(|| SymError::malformed(format!("no FDE covers 0x{pc:x}")))?;
    let row = unwind_row(section, &fde, stored, limits)?;
    apply_row(&row, &fde.cie, arch, regs, mem, limits)
}

/// A call-frame section indexed once for repeated unwinding
#[derive(Debug, Clone)]
pub struct CfiUnwinder<'data>
{
    section: CfiSection<'data>,
    index: FdeIndex,
}

impl<'data> CfiUnwinder<'data>
{
    pub fn new(section: CfiSection<'data>) -> Self
    {
        let index = FdeIndex::build(&section);
        Self { section, index }
    }

    pub fn section(&self) -> &CfiSection<'data>
    {
        &self.section
    }

    pub fn index(&self) -> &FdeIndex
    {
        &self.index
    }

    /// FDE covering the link-time address `address`.
    pub fn find(&self, address: u64) -> Result<Option<Fde<'data>>>
    {
        self.index.find(&self.section, address)
    }

    /// Unwind one frame; `load_bias` is subtracted from the program counter
    /// before the lookup.
    pub fn unwind_frame(
        &self,
        arch: Arch,
        load_bias: u64,
        regs: &mut dyn RegisterAccess,
        mem: &dyn MemoryAccess,
        limits: &UnwindLimits,
    ) -> Result<bool>
    {
        unwind_with(&self.section, |stored| self.find(stored), arch, load_bias, regs, mem, limits)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::access::MemoryImage;
    use crate::types::{x86_64, RegisterFile};

    /// `.debug_frame` CIE (x86-64, CFA = rsp+8, ra at cfa-8) plus one FDE for
    /// `[0x1000, 0x1020)`: `push rbp` at +1, `mov rbp, rsp` at +4.
    fn debug_frame() -> Vec<u8>
    {
        let mut out = Vec::new();
        let cie_body: Vec<u8> = [
            &0xffff_ffffu32.to_le_bytes()[..],
            &[1, 0, 1, 0x78, 16],
            // def_cfa rsp+8; offset r16 1 (cfa-8)
            &[0x0c, 7, 8, 0x90, 1],
        ]
        .concat();
        out.extend_from_slice(&(cie_body.len() as u32).to_le_bytes());
        out.extend_from_slice(&cie_body);

        let mut fde_body = Vec::new();
        fde_body.extend_from_slice(&0u32.to_le_bytes());
        fde_body.extend_from_slice(&0x1000u64.to_le_bytes());
        fde_body.extend_from_slice(&0x20u64.to_le_bytes());
        // advance 1; def_cfa_offset 16; offset r6 2 (cfa-16); advance 3; def_cfa_register r6
        fde_body.extend_from_slice(&[0x41, 0x0e, 16, 0x86, 2, 0x43, 0x0d, 6]);
        out.extend_from_slice(&(fde_body.len() as u32).to_le_bytes());
        out.extend_from_slice(&fde_body);
        out
    }

    #[test]
    fn test_parse_debug_frame_entries()
    {
        let bytes = debug_frame();
        let section = CfiSection::debug_frame(&bytes, 8);
        let entries: Vec<_> = section.entries().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        let CfiEntry::Fde(fde) = &entries[1] else {
            panic!("expected an FDE");
        };
        assert_eq!((fde.start, fde.end), (0x1000, 0x1020));
        assert_eq!(fde.cie.data_align, -8);
        assert_eq!(fde.cie.return_register, x86_64::RIP);
    }

    #[test]
    fn test_rows_follow_the_prologue()
    {
        let bytes = debug_frame();
        let section = CfiSection::debug_frame(&bytes, 8);
        let fde = section.find_fde(0x1000).unwrap().unwrap();
        let limits = UnwindLimits::default();

        let entry = unwind_row(&section, &fde, 0x1000, &limits).unwrap();
        assert_eq!(
            entry.cfa,
            CfaRule::RegisterOffset {
                register: x86_64::RSP,
                offset: 8
            }
        );
        assert_eq!(entry.end, 0x1001);
        assert_eq!(entry.rule(x86_64::RBP), None);

        let pushed = unwind_row(&section, &fde, 0x1002, &limits).unwrap();
        assert_eq!((pushed.start, pushed.end), (0x1001, 0x1004));
        assert_eq!(pushed.rule(x86_64::RBP), Some(RegisterRule::Offset(-16)));

        let framed = unwind_row(&section, &fde, 0x1010, &limits).unwrap();
        assert_eq!(
            framed.cfa,
            CfaRule::RegisterOffset {
                register: x86_64::RBP,
                offset: 16
            }
        );
        assert_eq!(framed.end, 0x1020);
    }

    #[test]
    fn test_apply_restores_caller()
    {
        let bytes = debug_frame();
        let section = CfiSection::debug_frame(&bytes, 8);
        let limits = UnwindLimits::default();

        // Past the prologue: CFA = rbp + 16, ra at CFA - 8, saved rbp at CFA - 16.
        let cfa = 0x8000u64;
        let mut mem = MemoryImage::new();
        mem.map(cfa - 16, vec![0; 16]);
        mem.write_u64(cfa - 16, 0xcafe);
        mem.write_u64(cfa - 8, 0x4242);
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, 0x1010)
            .with(x86_64::RSP, cfa - 64)
            .with(x86_64::RBP, cfa - 16);

        assert!(unwind_frame(&section, Arch::X86_64, 0, &mut regs, &mem, &limits).unwrap());
        assert_eq!(regs.get(x86_64::RSP), Some(cfa));
        assert_eq!(regs.get(x86_64::RIP), Some(0x4242));
        assert_eq!(regs.get(x86_64::RBP), Some(0xcafe));
    }

    #[test]
    fn test_failed_apply_leaves_registers_untouched()
    {
        let bytes = debug_frame();
        let section = CfiSection::debug_frame(&bytes, 8);
        let limits = UnwindLimits::default();
        let mem = MemoryImage::new();
        let before = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, 0x1010)
            .with(x86_64::RSP, 0x7000)
            .with(x86_64::RBP, 0x7ff0);
        let mut regs = before.clone();
        assert!(unwind_frame(&section, Arch::X86_64, 0, &mut regs, &mem, &limits).is_err());
        assert_eq!(regs, before);
    }

    #[test]
    fn test_remember_state_is_bounded()
    {
        let cie = Cie {
            offset: 0,
            format: Format::Dwarf32,
            version: 1,
            augmentation: b"",
            address_size: 8,
            code_align: 1,
            data_align: -8,
            return_register: x86_64::RIP,
            has_augmentation_data: false,
            fde_encoding: constants::DW_EH_PE_absptr,
            lsda_encoding: constants::DW_EH_PE_omit,
            personality: None,
            signal_frame: false,
            instructions: &[0x0c, 7, 8],
        };
        let program = [0x0a; 17];
        let fde = Fde {
            offset: 0,
            cie,
            start: 0,
            end: 0x10,
            lsda: None,
            instructions: &program,
        };
        let section = CfiSection::debug_frame(&[], 8);
        let limits = UnwindLimits::default();
        assert!(unwind_row(&section, &fde, 0, &limits).is_err());

        let fde = Fde {
            instructions: &program[..16],
            ..fde
        };
        assert!(unwind_row(&section, &fde, 0, &limits).is_ok());
    }

    #[test]
    fn test_read_pointer_encodings()
    {
        let section = CfiSection::eh_frame(&[], 0x2000, 8);
        let bytes = [0xf0, 0xff, 0xff, 0xff];
        let mut cursor = BinaryCursor::new(&bytes);
        // pcrel | sdata4: field at section offset 0
        let value = read_pointer(&mut cursor, DwEhPe(0x1b), &section).unwrap();
        assert_eq!(value, Some(0x2000 - 16));

        let mut cursor = BinaryCursor::new(&bytes);
        assert!(matches!(
            read_pointer(&mut cursor, DwEhPe(0x9b), &section),
            Err(SymError::Unsupported(_))
        ));
        let mut cursor = BinaryCursor::new(&bytes);
        assert_eq!(read_pointer(&mut cursor, constants::DW_EH_PE_omit, &section).unwrap(), None);
    }

    #[test]
    fn test_fde_index_matches_linear_scan()
    {
        let bytes = debug_frame();
        let section = CfiSection::debug_frame(&bytes, 8);
        let index = FdeIndex::build(&section);
        assert_eq!(index.len(), 1);
        for address in [0xfff, 0x1000, 0x101f, 0x1020] {
            let indexed = index.find(&section, address).unwrap().map(|fde| fde.offset);
            let scanned = section.find_fde(address).unwrap().map(|fde| fde.offset);
            assert_eq!(indexed, scanned, "address 0x{address:x}");
        }
    }

    #[test]
    fn test_indexed_unwinder_applies_load_bias()
    {
        let bytes = debug_frame();
        let unwinder = CfiUnwinder::new(CfiSection::debug_frame(&bytes, 8));
        let limits = UnwindLimits::default();
        let bias = 0x7f00_0000_0000u64;
        assert_eq!(unwinder.index().len(), 1);
        assert!(unwinder.find(0x1010).unwrap().is_some());
        assert!(unwinder.find(bias + 0x1010).unwrap().is_none());

        let cfa = 0x8000u64;
        let mut mem = MemoryImage::new();
        mem.map(cfa - 16, vec![0; 16]);
        mem.write_u64(cfa - 16, 0xcafe);
        mem.write_u64(cfa - 8, bias + 0x4242);
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, bias + 0x1010)
            .with(x86_64::RSP, cfa - 64)
            .with(x86_64::RBP, cfa - 16);

        assert!(unwinder.unwind_frame(Arch::X86_64, bias, &mut regs, &mem, &limits).unwrap());
        assert_eq!(regs.get(x86_64::RSP), Some(cfa));
        assert_eq!(regs.get(x86_64::RIP), Some(bias + 0x4242));
        assert_eq!(regs.get(x86_64::RBP), Some(0xcafe));

        // Outside every FDE once the bias is removed.
        let mut regs = RegisterFile::new(Arch::X86_64).with(x86_64::RIP, 0x1010);
        assert!(unwinder.unwind_frame(Arch::X86_64, bias, &mut regs, &mem, &limits).is_err());
    }
}
