//! CodeView symbol records (`DEBUG_S_SYMBOLS`).
//!
//! Records are `u16 length, u16 kind, body`. Procedures and blocks open a
//! scope closed by `S_END`; `S_PROC_ID_END` and `S_INLINESITE_END` close their
//! own openers. A procedure's locator is the offset of its record within
//! `.debug$S`, which is where [`proc_locals`] resumes the walk.

use smallvec::smallvec;
use tracing::{debug, trace};

use super::{read_name, subsection, Subsection};
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::location::EncodedLocation;
use crate::types::{AddrRange, Arch, ModuleId, Proc, RegisterId, TypeRef, Var, VarKind};

/// Symbol kinds this decoder understands
pub mod kind
{
    pub const S_END: u16 = 0x0006;
    pub const S_OBJNAME: u16 = 0x1101;
    pub const S_THUNK32: u16 = 0x1102;
    pub const S_BLOCK32: u16 = 0x1103;
    pub const S_REGISTER: u16 = 0x1106;
    pub const S_BPREL32: u16 = 0x110b;
    pub const S_LDATA32: u16 = 0x110c;
    pub const S_GDATA32: u16 = 0x110d;
    pub const S_LPROC32: u16 = 0x110f;
    pub const S_GPROC32: u16 = 0x1110;
    pub const S_REGREL32: u16 = 0x1111;
    pub const S_COMPILE2: u16 = 0x1116;
    pub const S_SEPCODE: u16 = 0x1132;
    pub const S_COMPILE3: u16 = 0x113c;
    pub const S_LPROC32_ID: u16 = 0x1146;
    pub const S_GPROC32_ID: u16 = 0x1147;
    pub const S_INLINESITE: u16 = 0x114d;
    pub const S_INLINESITE_END: u16 = 0x114e;
    pub const S_PROC_ID_END: u16 = 0x114f;
}

fn is_proc(kind: u16) -> bool
{
    matches!(
        kind,
        kind::S_LPROC32 | kind::S_GPROC32 | kind::S_LPROC32_ID | kind::S_GPROC32_ID
    )
}

fn opens_scope(kind: u16) -> bool
{
    is_proc(kind) || matches!(kind, kind::S_BLOCK32 | kind::S_THUNK32 | kind::S_SEPCODE | kind::S_INLINESITE)
}

fn closes_scope(kind: u16) -> bool
{
    matches!(kind, kind::S_END | kind::S_PROC_ID_END | kind::S_INLINESITE_END)
}

/// One symbol record
#[derive(Debug, Clone)]
pub struct SymbolRecord<'data>
{
    pub kind: u16,
    /// Offset of the record's length field within `.debug$S`
    pub offset: usize,
    pub body: BinaryCursor<'data>,
}

/// Iterator over the records of one symbols subsection
pub struct SymbolRecords<'data>
{
    cursor: BinaryCursor<'data>,
    base: usize,
    done: bool,
}

impl<'data> SymbolRecords<'data>
{
    pub fn new(sub: &Subsection<'data>) -> Self
    {
        Self {
            cursor: BinaryCursor::new(sub.data),
            base: sub.offset,
            done: false,
        }
    }

    /// Records starting at `offset` within `.debug$S`.
    fn starting_at(sub: &Subsection<'data>, offset: usize) -> Result<Self>
    {
        let mut records = Self::new(sub);
        let local = offset
            .checked_sub(sub.offset)
            .ok_or_else(|| SymError::InvalidUsage(format!("symbol offset 0x{offset:x}")))?;
        records.cursor.seek(local)?;
        Ok(records)
    }

    fn read(&mut self) -> Result<SymbolRecord<'data>>
    {
        let offset = self.base + self.cursor.offset();
        let length = usize::from(self.cursor.read_u16()?);
        if length < 2 {
            return Err(SymError::malformed(format!("symbol record at 0x{offset:x} has length {length}")));
        }
        let mut body = self.cursor.sub_cursor(length)?;
        let kind = body.read_u16()?;
        Ok(SymbolRecord { kind, offset, body })
    }
}

impl<'data> Iterator for SymbolRecords<'data>
{
    type Item = Result<SymbolRecord<'data>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.done || self.cursor.remaining() < 4 {
            return None;
        }
        let record = self.read();
        self.done = record.is_err();
        Some(record)
    }
}

/// Fixed part of `PROCSYM32`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcRecord
{
    len: u32,
    debug_start: u32,
    debug_end: u32,
    ty: u32,
    offset: u32,
    segment: u16,
    name: String,
}

impl ProcRecord
{
    fn parse(body: &mut BinaryCursor<'_>) -> Result<Self>
    {
        let _parent = body.read_u32()?;
        let _end = body.read_u32()?;
        let _next = body.read_u32()?;
        let len = body.read_u32()?;
        let debug_start = body.read_u32()?;
        let debug_end = body.read_u32()?;
        let ty = body.read_u32()?;
        let offset = body.read_u32()?;
        let segment = body.read_u16()?;
        let _flags = body.read_u8()?;
        let name = read_name(body)?;
        Ok(Self {
            len,
            debug_start,
            debug_end,
            ty,
            offset,
            segment,
            name,
        })
    }
}

/// Link-time address of `segment:offset`. Segments are 1-based.
pub fn segment_address(segments: &[u64], segment: u16, offset: u32) -> Option<u64>
{
    let base = segments.get(usize::from(segment).checked_sub(1)?)?;
    Some(base.wrapping_add(u64::from(offset)))
}

fn type_ref(index: u32) -> Option<TypeRef>
{
    (index != 0).then_some(TypeRef(u64::from(index)))
}

fn symbol_subsections<'a, 'data>(subsections: &'a [Subsection<'data>]) -> impl Iterator<Item = &'a Subsection<'data>> + 'a
{
    subsections.iter().filter(|sub| sub.kind == subsection::SYMBOLS)
}

/// Object name and source language announced by the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileInfo
{
    pub object: Option<String>,
    pub language: Option<u16>,
}

pub fn compile_info(subsections: &[Subsection<'_>]) -> CompileInfo
{
    let mut info = CompileInfo::default();
    for record in symbol_subsections(subsections).flat_map(SymbolRecords::new) {
        let Ok(mut record) = record else {
            break;
        };
        match record.kind {
            kind::S_OBJNAME => {
                if record.body.skip(4).is_ok() {
                    info.object = read_name(&mut record.body).ok();
                }
            }
            kind::S_COMPILE2 | kind::S_COMPILE3 => {
                info.language = record.body.read_u32().ok().map(|flags| (flags & 0xff) as u16);
            }
            _ => {}
        }
        if info.object.is_some() && info.language.is_some() {
            break;
        }
    }
    info
}

/// Every procedure record, in stream order.
pub fn collect_procs<'data>(subsections: &[Subsection<'data>], segments: &[u64], module: ModuleId) -> Result<Vec<Proc<'data>>>
{
    let mut procs = Vec::new();
    for sub in symbol_subsections(subsections) {
        for record in SymbolRecords::new(sub) {
            let mut record = record?;
            if !is_proc(record.kind) {
                continue;
            }
            let proc = ProcRecord::parse(&mut record.body)?;
            let Some(lo) = segment_address(segments, proc.segment, proc.offset) else {
                debug!(name = %proc.name, segment = proc.segment, "procedure in unknown segment");
                continue;
            };
            let range = AddrRange::new(lo, lo.wrapping_add(u64::from(proc.len)));
            let debug_range = if proc.debug_end > proc.debug_start {
                AddrRange::new(
                    lo.wrapping_add(u64::from(proc.debug_start)),
                    lo.wrapping_add(u64::from(proc.debug_end)),
                )
            } else {
                range
            };
            procs.push(Proc {
                name: proc.name,
                module,
                range,
                debug_range,
                pieces: smallvec![range],
                ty: type_ref(proc.ty),
                frame_base: EncodedLocation::Null,
                locator: record.offset as u64,
            });
        }
    }
    debug!(procs = procs.len(), "collected CodeView procedures");
    Ok(procs)
}

/// Data symbols outside of any procedure.
pub fn collect_globals<'data>(subsections: &[Subsection<'data>], segments: &[u64]) -> Result<Vec<Var<'data>>>
{
    let mut globals = Vec::new();
    for sub in symbol_subsections(subsections) {
        let mut depth = 0usize;
        for record in SymbolRecords::new(sub) {
            let mut record = record?;
            if opens_scope(record.kind) {
                depth += 1;
                continue;
            }
            if closes_scope(record.kind) {
                depth = depth.saturating_sub(1);
                continue;
            }
            if depth != 0 || !matches!(record.kind, kind::S_GDATA32 | kind::S_LDATA32) {
                continue;
            }
            let body = &mut record.body;
            let ty = body.read_u32()?;
            let offset = body.read_u32()?;
            let segment = body.read_u16()?;
            let name = read_name(body)?;
            let Some(address) = segment_address(segments, segment, offset) else {
                trace!(%name, segment, "data symbol in unknown segment");
                continue;
            };
            globals.push(Var {
                name,
                kind: VarKind::Global,
                ty: type_ref(ty),
                location: EncodedLocation::Rva(address),
            });
        }
    }
    Ok(globals)
}

fn codeview_register(arch: Arch, number: u16) -> Result<RegisterId>
{
    RegisterId::from_codeview(arch, number)
        .ok_or_else(|| SymError::Unsupported(format!("CodeView register {number} on {arch:?}")))
}

/// Variables declared in the procedure whose record starts at `locator`.
///
/// Variables of inlined call sites belong to the inlinee and are skipped.
pub fn proc_locals<'data>(subsections: &[Subsection<'data>], locator: u64, arch: Arch) -> Result<Vec<Var<'data>>>
{
    let offset = usize::try_from(locator).map_err(|_| SymError::InvalidUsage(format!("locator 0x{locator:x}")))?;
    let sub = symbol_subsections(subsections)
        .find(|sub| (sub.offset..sub.offset + sub.data.len()).contains(&offset))
        .ok_or_else(|| SymError::InvalidUsage(format!("no symbol record at 0x{locator:x}")))?;
    let mut records = SymbolRecords::starting_at(sub, offset)?;
    match records.next() {
        Some(Ok(record)) if is_proc(record.kind) => {}
        Some(Err(err)) => return Err(err),
        _ => return Err(SymError::InvalidUsage(format!("no procedure record at 0x{locator:x}"))),
    }

    let mut locals = Vec::new();
    let mut depth = 1usize;
    let mut inline_depth = 0usize;
    for record in records {
        let mut record = record?;
        if opens_scope(record.kind) {
            depth += 1;
            if record.kind == kind::S_INLINESITE {
                inline_depth += 1;
            }
            continue;
        }
        if closes_scope(record.kind) {
            if record.kind == kind::S_INLINESITE_END {
                inline_depth = inline_depth.saturating_sub(1);
            }
            depth -= 1;
            if depth == 0 {
                break;
            }
            continue;
        }
        if inline_depth > 0 {
            continue;
        }
        let body = &mut record.body;
        let (ty, location, name) = match record.kind {
            kind::S_REGREL32 => {
                let offset = body.read_i32()?;
                let ty = body.read_u32()?;
                let reg = codeview_register(arch, body.read_u16()?)?;
                (ty, EncodedLocation::RegisterRelative { reg, offset: i64::from(offset) }, read_name(body)?)
            }
            kind::S_BPREL32 => {
                let offset = body.read_i32()?;
                let ty = body.read_u32()?;
                let reg = arch.frame_pointer();
                (ty, EncodedLocation::RegisterRelative { reg, offset: i64::from(offset) }, read_name(body)?)
            }
            kind::S_REGISTER => {
                let ty = body.read_u32()?;
                let reg = codeview_register(arch, body.read_u16()?)?;
                (ty, EncodedLocation::Register(reg), read_name(body)?)
            }
            // Function-scope statics (`S_LDATA32`) are not locals.
            _ => continue,
        };
        locals.push(Var {
            name,
            kind: VarKind::Local,
            ty: type_ref(ty),
            location,
        });
    }
    Ok(locals)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::x86_64;

    fn record(kind: u16, body: &[u8]) -> Vec<u8>
    {
        let mut payload = kind.to_le_bytes().to_vec();
        payload.extend_from_slice(body);
        while (payload.len() + 2) % 4 != 0 {
            payload.push(0);
        }
        let mut bytes = (payload.len() as u16).to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        bytes
    }

    fn proc_body(offset: u32, len: u32, name: &str) -> Vec<u8>
    {
        let mut body = Vec::new();
        for value in [0u32, 0, 0, len, 4, len - 1, 0x1001, offset] {
            body.extend_from_slice(&value.to_le_bytes());
        }
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(0);
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body
    }

    fn regrel(offset: i32, reg: u16, name: &str) -> Vec<u8>
    {
        let mut body = offset.to_le_bytes().to_vec();
        body.extend_from_slice(&0x74u32.to_le_bytes());
        body.extend_from_slice(&reg.to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body
    }

    fn data(offset: u32, name: &str) -> Vec<u8>
    {
        let mut body = 0x74u32.to_le_bytes().to_vec();
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body
    }

    /// Symbols subsection placed at offset 8 of `.debug$S`
    fn symbols() -> Vec<u8>
    {
        let mut objname = 0u32.to_le_bytes().to_vec();
        objname.extend_from_slice(b"main.obj\0");
        let mut register = 0x74u32.to_le_bytes().to_vec();
        register.extend_from_slice(&329u16.to_le_bytes());
        register.extend_from_slice(b"count\0");

        let mut bytes = Vec::new();
        bytes.extend(record(kind::S_OBJNAME, &objname));
        bytes.extend(record(kind::S_COMPILE3, &1u32.to_le_bytes()));
        bytes.extend(record(kind::S_GDATA32, &data(0x40, "counter")));
        bytes.extend(record(kind::S_GPROC32, &proc_body(0x10, 0x30, "main")));
        bytes.extend(record(kind::S_REGREL32, &regrel(8, 335, "argc")));
        bytes.extend(record(kind::S_REGISTER, &register));
        bytes.extend(record(kind::S_LDATA32, &data(0x48, "calls")));
        bytes.extend(record(kind::S_INLINESITE, &[0u8; 12]));
        bytes.extend(record(kind::S_REGREL32, &regrel(16, 335, "inlined")));
        bytes.extend(record(kind::S_INLINESITE_END, &[]));
        bytes.extend(record(kind::S_END, &[]));
        bytes
    }

    fn subsections(bytes: &[u8]) -> [Subsection<'_>; 1]
    {
        [Subsection {
            kind: subsection::SYMBOLS,
            offset: 8,
            data: bytes,
        }]
    }

    const SEGMENTS: [u64; 2] = [0x1000, 0x3000];

    #[test]
    fn test_compile_info()
    {
        let bytes = symbols();
        let info = compile_info(&subsections(&bytes));
        assert_eq!(info.object.as_deref(), Some("main.obj"));
        assert_eq!(info.language, Some(1));
    }

    #[test]
    fn test_procs_use_segment_base()
    {
        let bytes = symbols();
        let procs = collect_procs(&subsections(&bytes), &SEGMENTS, ModuleId(0)).unwrap();
        assert_eq!(procs.len(), 1);
        let main = &procs[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.range, AddrRange::new(0x1010, 0x1040));
        assert_eq!(main.debug_range, AddrRange::new(0x1014, 0x103f));
        assert_eq!(main.ty, Some(TypeRef(0x1001)));
    }

    #[test]
    fn test_globals_skip_function_statics()
    {
        let bytes = symbols();
        let globals = collect_globals(&subsections(&bytes), &SEGMENTS).unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].name, "counter");
        assert_eq!(globals[0].location, EncodedLocation::Rva(0x3040));
    }

    #[test]
    fn test_locals_of_procedure()
    {
        let bytes = symbols();
        let subs = subsections(&bytes);
        let procs = collect_procs(&subs, &SEGMENTS, ModuleId(0)).unwrap();
        let locals = proc_locals(&subs, procs[0].locator, Arch::X86_64).unwrap();
        let names: Vec<_> = locals.iter().map(|var| var.name.as_str()).collect();
        assert_eq!(names, ["argc", "count"]);
        assert_eq!(
            locals[0].location,
            EncodedLocation::RegisterRelative {
                reg: x86_64::RSP,
                offset: 8
            }
        );
        assert_eq!(locals[1].location, EncodedLocation::Register(x86_64::RBX));
    }

    #[test]
    fn test_locals_reject_non_procedure_locator()
    {
        let bytes = symbols();
        let result = proc_locals(&subsections(&bytes), 8, Arch::X86_64);
        assert!(matches!(result, Err(SymError::InvalidUsage(_))));
    }
}
