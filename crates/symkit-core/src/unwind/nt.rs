//! # Windows x64 Unwinding
//!
//! `.pdata` holds sorted `RUNTIME_FUNCTION` records; each points at an
//! `UNWIND_INFO` block describing the prologue as a list of unwind codes.
//! Unwinding replays the codes in reverse, undoing only the prologue
//! instructions that already ran.
//!
//! ## Epilogues
//!
//! Unwind codes do not describe epilogues. When the instruction pointer is
//! past the prologue, the code bytes at the instruction pointer are matched
//! against the only epilogue shapes the ABI allows:
//!
//! ```text
//! [add rsp, imm | lea rsp, [frame + disp]]
//! pop r64 ...
//! ret | rep ret | jmp rel (leaving the function) | jmp [rip + disp]
//! ```
//!
//! A match is simulated instruction by instruction instead of using the codes.

use std::fmt;

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::PendingWrites;
use crate::access::{memory_error, register_error, MemoryAccess, RegisterAccess};
use crate::config::UnwindLimits;
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::{x86_64, Arch, RegisterId};

const RUNTIME_FUNCTION_SIZE: usize = 12;

const UNW_FLAG_EHANDLER: u8 = 0x1;
const UNW_FLAG_UHANDLER: u8 = 0x2;
const UNW_FLAG_CHAININFO: u8 = 0x4;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
/// `UWOP_SAVE_XMM` in version 1, `UWOP_EPILOG` in version 2
const UWOP_SAVE_XMM_OR_EPILOG: u8 = 6;
const UWOP_SAVE_XMM_FAR: u8 = 7;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

/// One `.pdata` record (all fields are image-relative)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction
{
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

impl RuntimeFunction
{
    fn read(cursor: &mut BinaryCursor<'_>) -> Result<Self>
    {
        Ok(Self {
            begin: cursor.read_u32()?,
            end: cursor.read_u32()?,
            unwind_info: cursor.read_u32()?,
        })
    }

    fn read_from(mem: &dyn MemoryAccess, address: u64) -> Result<Self>
    {
        let mut bytes = [0u8; RUNTIME_FUNCTION_SIZE];
        mem.read_memory(address, &mut bytes)
            .map_err(|err| memory_error(address, err))?;
        Self::read(&mut BinaryCursor::new(&bytes))
    }

    pub fn contains(&self, rva: u32) -> bool
    {
        self.begin <= rva && rva < self.end
    }

    /// Whether `unwind_info` names another `RUNTIME_FUNCTION` rather than an
    /// `UNWIND_INFO` block.
    pub fn is_indirect(&self) -> bool
    {
        self.unwind_info & 1 != 0
    }

    /// Every record of a `.pdata` section, in file order.
    pub fn all(pdata: &[u8]) -> impl Iterator<Item = RuntimeFunction> + '_
    {
        pdata.chunks_exact(RUNTIME_FUNCTION_SIZE).filter_map(|chunk| {
            let mut cursor = BinaryCursor::new(chunk);
            Self::read(&mut cursor).ok()
        })
    }

    /// Binary search `pdata` for the record covering `rva`.
    pub fn lookup(pdata: &[u8], rva: u32) -> Result<Option<RuntimeFunction>>
    {
        let count = pdata.len() / RUNTIME_FUNCTION_SIZE;
        let at = |index: usize| {
            let start = index * RUNTIME_FUNCTION_SIZE;
            Self::read(&mut BinaryCursor::with_range(pdata, start, start + RUNTIME_FUNCTION_SIZE))
        };
        let (mut lo, mut hi) = (0, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = at(mid)?;
            if rva < entry.begin {
                hi = mid;
            } else if rva >= entry.end {
                lo = mid + 1;
            } else {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

impl fmt::Display for RuntimeFunction
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "[0x{:08x}, 0x{:08x}) -> 0x{:08x}", self.begin, self.end, self.unwind_info)
    }
}

/// Decoded unwind operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp
{
    /// `push r64` (NT register number)
    PushNonvol(u8),
    /// `sub rsp, size`
    Alloc(u32),
    /// `lea frame, [rsp + 16 * frame_offset]`
    SetFpreg,
    /// `mov [rsp + offset], r64`
    SaveNonvol
    {
        reg: u8,
        offset: u32,
    },
    /// `movaps [rsp + offset], xmm`
    SaveXmm
    {
        reg: u8,
        offset: u32,
    },
    /// Version 2 epilogue descriptor
    Epilog,
    /// Hardware interrupt frame, optionally with an error code
    PushMachframe
    {
        error_code: bool,
    },
}

/// One unwind code: the prologue offset just past its instruction, and what
/// the instruction did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode
{
    pub prolog_offset: u8,
    pub op: UnwindOp,
}

/// Decoded `UNWIND_INFO` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo
{
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    /// NT number of the frame register, if the function uses one
    pub frame_register: Option<u8>,
    /// Scaled by 16
    pub frame_offset: u8,
    /// In array order (reverse prologue order)
    pub codes: Vec<UnwindCode>,
    /// Exception or termination handler RVA
    pub handler: Option<u32>,
    /// Parent record for chained unwind info
    pub chained: Option<RuntimeFunction>,
}

impl UnwindInfo
{
    /// Parse a complete `UNWIND_INFO` block.
    pub fn parse(bytes: &[u8]) -> Result<Self>
    {
        let mut cursor = BinaryCursor::new(bytes);
        let header = cursor.read_u8()?;
        let version = header & 0x7;
        let flags = header >> 3;
        if !matches!(version, 1 | 2) {
            return Err(SymError::Unsupported(format!("UNWIND_INFO version {version}")));
        }
        let prolog_size = cursor.read_u8()?;
        let count = usize::from(cursor.read_u8()?);
        let frame = cursor.read_u8()?;
        let frame_register = Some(frame & 0xf).filter(|&reg| reg != 0);
        let frame_offset = frame >> 4;

        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(cursor.read_u16()?);
        }
        let codes = decode_codes(&slots, version)?;

        if count % 2 == 1 {
            cursor.skip(2)?;
        }
        let mut handler = None;
        let mut chained = None;
        if flags & UNW_FLAG_CHAININFO != 0 {
            chained = Some(RuntimeFunction::read(&mut cursor)?);
        } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
            handler = Some(cursor.read_u32()?);
        }

        Ok(Self {
            version,
            flags,
            prolog_size,
            frame_register,
            frame_offset,
            codes,
            handler,
            chained,
        })
    }

    /// Read the block at `address` through `mem`.
    pub fn read(mem: &dyn MemoryAccess, address: u64) -> Result<Self>
    {
        let mut header = [0u8; 4];
        mem.read_memory(address, &mut header)
            .map_err(|err| memory_error(address, err))?;
        let count = usize::from(header[2]);
        let flags = header[0] >> 3;
        let mut size = 4 + 2 * (count + count % 2);
        if flags & UNW_FLAG_CHAININFO != 0 {
            size += RUNTIME_FUNCTION_SIZE;
        } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
            size += 4;
        }
        let mut bytes = vec![0u8; size];
        mem.read_memory(address, &mut bytes)
            .map_err(|err| memory_error(address, err))?;
        Self::parse(&bytes)
    }

    /// Whether a `UWOP_SET_FPREG` at or before `prolog_offset` has run.
    fn frame_established(&self, prolog_offset: u32) -> bool
    {
        self.frame_register.is_some()
            && self
                .codes
                .iter()
                .any(|code| code.op == UnwindOp::SetFpreg && u32::from(code.prolog_offset) <= prolog_offset)
    }
}

fn decode_codes(slots: &[u16], version: u8) -> Result<Vec<UnwindCode>>
{
    let mut codes = Vec::new();
    let mut index = 0;
    let operand = |index: usize| {
        slots
            .get(index)
            .copied()
            .map(u32::from)
            .ok_or_else(|| SymError::malformed("unwind code operand past the code array"))
    };
    while index < slots.len() {
        let slot = slots[index];
        let prolog_offset = (slot & 0xff) as u8;
        let op = ((slot >> 8) & 0xf) as u8;
        let info = (slot >> 12) as u8;
        let (decoded, used) = match op {
            UWOP_PUSH_NONVOL => (UnwindOp::PushNonvol(info), 1),
            UWOP_ALLOC_LARGE if info == 0 => (UnwindOp::Alloc(operand(index + 1)? * 8), 2),
            UWOP_ALLOC_LARGE if info == 1 => {
                let size = operand(index + 1)? | (operand(index + 2)? << 16);
                (UnwindOp::Alloc(size), 3)
            }
            UWOP_ALLOC_LARGE => return Err(SymError::malformed(format!("UWOP_ALLOC_LARGE info {info}"))),
            UWOP_ALLOC_SMALL => (UnwindOp::Alloc(u32::from(info) * 8 + 8), 1),
            UWOP_SET_FPREG => (UnwindOp::SetFpreg, 1),
            UWOP_SAVE_NONVOL => (
                UnwindOp::SaveNonvol {
                    reg: info,
                    offset: operand(index + 1)? * 8,
                },
                2,
            ),
            UWOP_SAVE_NONVOL_FAR => (
                UnwindOp::SaveNonvol {
                    reg: info,
                    offset: operand(index + 1)? | (operand(index + 2)? << 16),
                },
                3,
            ),
            UWOP_SAVE_XMM_OR_EPILOG if version == 2 => (UnwindOp::Epilog, 2),
            UWOP_SAVE_XMM_OR_EPILOG => (
                UnwindOp::SaveXmm {
                    reg: info,
                    offset: operand(index + 1)? * 8,
                },
                2,
            ),
            UWOP_SAVE_XMM_FAR if version == 1 => (
                UnwindOp::SaveXmm {
                    reg: info,
                    offset: operand(index + 1)? | (operand(index + 2)? << 16),
                },
                3,
            ),
            UWOP_SAVE_XMM128 => (
                UnwindOp::SaveXmm {
                    reg: info,
                    offset: operand(index + 1)? * 16,
                },
                2,
            ),
            UWOP_SAVE_XMM128_FAR => (
                UnwindOp::SaveXmm {
                    reg: info,
                    offset: operand(index + 1)? | (operand(index + 2)? << 16),
                },
                3,
            ),
            UWOP_PUSH_MACHFRAME => (UnwindOp::PushMachframe { error_code: info == 1 }, 1),
            _ => return Err(SymError::malformed(format!("unwind opcode {op} (version {version})"))),
        };
        codes.push(UnwindCode {
            prolog_offset,
            op: decoded,
        });
        index += used;
    }
    Ok(codes)
}

fn nt_register(number: u8) -> Result<RegisterId>
{
    RegisterId::from_nt(number).ok_or_else(|| SymError::malformed(format!("NT register {number}")))
}

/// Register state while replaying one frame
struct Frame<'a>
{
    regs: &'a dyn RegisterAccess,
    mem: &'a dyn MemoryAccess,
    pending: PendingWrites,
    rsp: u64,
}

impl Frame<'_>
{
    fn load(&self, address: u64) -> Result<u64>
    {
        self.mem
            .read_u64(address)
            .map_err(|err| memory_error(address, err))
    }

    fn register(&self, reg: RegisterId) -> Result<u64>
    {
        self.pending.read(Arch::X86_64, self.regs, reg)
    }

    fn pop(&mut self, reg: RegisterId) -> Result<()>
    {
        let value = self.load(self.rsp)?;
        trace!(%reg, value, rsp = self.rsp, "pop");
        self.pending.set(reg, Some(value));
        self.rsp = self.rsp.wrapping_add(8);
        Ok(())
    }

    /// Pop the return address; the frame is finished.
    fn ret(&mut self) -> Result<()>
    {
        self.pop(x86_64::RIP)
    }

    fn finish(mut self) -> PendingWrites
    {
        self.pending.set(x86_64::RSP, Some(self.rsp));
        self.pending
    }
}

/// Epilogue instructions recognised at the instruction pointer
#[derive(Debug, Clone, PartialEq, Eq)]
enum EpilogStep
{
    AddRsp(u32),
    LeaRsp
    {
        base: u8,
        displacement: i32,
    },
    Pop(u8),
}

fn le_i32(bytes: &[u8]) -> Option<i32>
{
    bytes.get(..4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode an epilogue starting at `code[0]` (rva `rva` inside `function`).
fn match_epilogue(code: &[u8], rva: u32, function: &RuntimeFunction, max_instructions: usize) -> Option<Vec<EpilogStep>>
{
    let mut steps = Vec::new();
    let mut pos = 0usize;

    match code {
        [0x48, 0x83, 0xc4, imm, ..] => {
            steps.push(EpilogStep::AddRsp(i32::from(*imm as i8) as u32));
            pos = 4;
        }
        [0x48, 0x81, 0xc4, rest @ ..] => {
            steps.push(EpilogStep::AddRsp(le_i32(rest)? as u32));
            pos = 7;
        }
        [rex @ (0x48 | 0x49), 0x8d, modrm, rest @ ..] if (modrm >> 3) & 7 == 4 && modrm & 7 != 4 => {
            let base = (modrm & 7) + if *rex == 0x49 { 8 } else { 0 };
            let (displacement, length) = match modrm >> 6 {
                1 => (i32::from(*rest.first()? as i8), 4),
                2 => (le_i32(rest)?, 7),
                _ => return None,
            };
            steps.push(EpilogStep::LeaRsp { base, displacement });
            pos = length;
        }
        _ => {}
    }

    loop {
        if steps.len() > max_instructions {
            return None;
        }
        match code.get(pos..)? {
            [reg @ 0x58..=0x5f, ..] => {
                steps.push(EpilogStep::Pop(reg - 0x58));
                pos += 1;
            }
            [0x41, reg @ 0x58..=0x5f, ..] => {
                steps.push(EpilogStep::Pop(reg - 0x58 + 8));
                pos += 2;
            }
            // ret, rep ret, jmp [rip+disp32] with or without REX.W
            [0xc3, ..] | [0xf3, 0xc3, ..] | [0xff, 0x25, ..] | [0x48, 0xff, 0x25, ..] => return Some(steps),
            [0xe9, rest @ ..] => {
                let next = i64::from(rva) + pos as i64 + 5;
                let target = next + i64::from(le_i32(rest)?);
                return leaves(function, target).then_some(steps);
            }
            [0xeb, rel, ..] => {
                let target = i64::from(rva) + pos as i64 + 2 + i64::from(*rel as i8);
                return leaves(function, target).then_some(steps);
            }
            _ => return None,
        }
    }
}

fn leaves(function: &RuntimeFunction, target: i64) -> bool
{
    target < i64::from(function.begin) || target >= i64::from(function.end)
}

fn read_code(mem: &dyn MemoryAccess, address: u64) -> Option<SmallVec<[u8; 64]>>
{
    // Code may end close to the edge of mapped memory.
    [64usize, 32, 16, 8, 4, 2, 1].into_iter().find_map(|size| {
        let mut buf = SmallVec::from_elem(0u8, size);
        mem.read_memory(address, &mut buf).ok().map(|()| buf)
    })
}

fn simulate_epilogue(frame: &mut Frame<'_>, steps: &[EpilogStep]) -> Result<()>
{
    for step in steps {
        match *step {
            EpilogStep::AddRsp(size) => frame.rsp = frame.rsp.wrapping_add(u64::from(size)),
            EpilogStep::LeaRsp { base, displacement } => {
                let base = frame.register(nt_register(base)?)?;
                frame.rsp = base.wrapping_add_signed(i64::from(displacement));
            }
            EpilogStep::Pop(reg) => frame.pop(nt_register(reg)?)?,
        }
    }
    frame.ret()
}

/// Replay `info`'s codes; `prolog_offset` is `None` once the prologue has
/// completed. Returns `true` when a machine frame supplied the return address.
fn apply_codes(frame: &mut Frame<'_>, info: &UnwindInfo, prolog_offset: Option<u32>) -> Result<bool>
{
    let executed = |code: &UnwindCode| prolog_offset.is_none_or(|offset| u32::from(code.prolog_offset) <= offset);

    let mut base = frame.rsp;
    if let Some(number) = info.frame_register {
        if info.frame_established(prolog_offset.unwrap_or(u32::MAX)) {
            let value = frame.register(nt_register(number)?)?;
            base = value.wrapping_sub(16 * u64::from(info.frame_offset));
        }
    }

    for code in info.codes.iter().filter(|code| executed(code)) {
        trace!(?code, rsp = frame.rsp, "unwind code");
        match code.op {
            UnwindOp::PushNonvol(reg) => frame.pop(nt_register(reg)?)?,
            UnwindOp::Alloc(size) => frame.rsp = frame.rsp.wrapping_add(u64::from(size)),
            UnwindOp::SetFpreg => frame.rsp = base,
            UnwindOp::SaveNonvol { reg, offset } => {
                let value = frame.load(base.wrapping_add(u64::from(offset)))?;
                frame.pending.set(nt_register(reg)?, Some(value));
            }
            UnwindOp::SaveXmm { .. } | UnwindOp::Epilog => {}
            UnwindOp::PushMachframe { error_code } => {
                if error_code {
                    frame.rsp = frame.rsp.wrapping_add(8);
                }
                let rip = frame.load(frame.rsp)?;
                let rsp = frame.load(frame.rsp.wrapping_add(24))?;
                frame.pending.set(x86_64::RIP, Some(rip));
                frame.rsp = rsp;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Resolve an indirect record to the one that owns an `UNWIND_INFO`.
fn resolve_function(mem: &dyn MemoryAccess, image_base: u64, mut function: RuntimeFunction, limits: &UnwindLimits) -> Result<RuntimeFunction>
{
    for _ in 0..limits.nt_chain_depth {
        if !function.is_indirect() {
            return Ok(function);
        }
        let address = image_base.wrapping_add(u64::from(function.unwind_info & !1));
        function = RuntimeFunction::read_from(mem, address)?;
    }
    Err(SymError::malformed("indirect RUNTIME_FUNCTION chain too long"))
}

/// Unwind one x86-64 frame using `.pdata`.
pub(crate) fn unwind_frame(
    pdata: &[u8],
    image_base: u64,
    regs: &mut dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<bool>
{
    let pending = {
        let regs: &dyn RegisterAccess = regs;
        let read = |reg: RegisterId| {
            regs.read_register(Arch::X86_64, reg)
                .map_err(|err| register_error(reg, err))
        };
        let rip = read(x86_64::RIP)?;
        let rsp = read(x86_64::RSP)?;
        let rva = u32::try_from(rip.wrapping_sub(image_base))
            .map_err(|_| SymError::InvalidUsage(format!("0x{rip:x} is outside the image")))?;

        let mut frame = Frame {
            regs,
            mem,
            pending: PendingWrites::default(),
            rsp,
        };

        match RuntimeFunction::lookup(pdata, rva)? {
            None => {
                debug!(rva = format_args!("0x{rva:x}"), "no RUNTIME_FUNCTION; leaf frame");
                frame.ret()?;
            }
            Some(function) => {
                let function = resolve_function(mem, image_base, function, limits)?;
                let info = UnwindInfo::read(mem, image_base.wrapping_add(u64::from(function.unwind_info)))?;
                let offset = rva.wrapping_sub(function.begin);
                let in_prologue = offset < u32::from(info.prolog_size);

                let epilogue = if in_prologue {
                    None
                } else {
                    read_code(mem, rip)
                        .and_then(|code| match_epilogue(&code, rva, &function, limits.epilogue_instructions))
                };

                if let Some(steps) = epilogue {
                    debug!(steps = steps.len(), "inside epilogue");
                    simulate_epilogue(&mut frame, &steps)?;
                } else if !unwind_records(&mut frame, mem, image_base, info, in_prologue.then_some(offset), limits)? {
                    frame.ret()?;
                }
            }
        }
        frame.finish()
    };

    pending.commit(Arch::X86_64, regs)?;
    Ok(true)
}

/// Apply `info` and every record chained behind it.
fn unwind_records(
    frame: &mut Frame<'_>,
    mem: &dyn MemoryAccess,
    image_base: u64,
    mut info: UnwindInfo,
    mut prolog_offset: Option<u32>,
    limits: &UnwindLimits,
) -> Result<bool>
{
    for _ in 0..=limits.nt_chain_depth {
        if apply_codes(frame, &info, prolog_offset)? {
            return Ok(true);
        }
        let Some(parent) = info.chained else {
            return Ok(false);
        };
        let parent = resolve_function(mem, image_base, parent, limits)?;
        info = UnwindInfo::read(mem, image_base.wrapping_add(u64::from(parent.unwind_info)))?;
        // A chained parent's prologue always ran to completion.
        prolog_offset = None;
    }
    Err(SymError::malformed("chained UNWIND_INFO too deep"))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::access::MemoryImage;
    use crate::types::RegisterFile;

    const IMAGE: u64 = 0x1_4000_0000;

    fn pdata(functions: &[RuntimeFunction]) -> Vec<u8>
    {
        functions
            .iter()
            .flat_map(|f| [f.begin, f.end, f.unwind_info])
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    /// `push rbx; sub rsp, 32` with the function at rva 0x1000.
    fn scenario() -> (Vec<u8>, MemoryImage)
    {
        let function = RuntimeFunction {
            begin: 0x1000,
            end: 0x1100,
            unwind_info: 0x3000,
        };
        let mut info = vec![1, 5, 2, 0];
        // ALLOC_SMALL info 3 @5, PUSH_NONVOL rbx (3) @1
        info.extend_from_slice(&[5, 0x32, 1, 0x30]);
        let mut mem = MemoryImage::new();
        mem.map(IMAGE + 0x3000, info);
        (pdata(&[function]), mem)
    }

    #[test]
    fn test_unwind_info_parse()
    {
        let info = UnwindInfo::parse(&[0x09, 4, 2, 0x35, 4, 0x03, 1, 0x50, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.flags, UNW_FLAG_EHANDLER);
        assert_eq!(info.frame_register, Some(5));
        assert_eq!(info.frame_offset, 3);
        assert_eq!(info.codes[0].op, UnwindOp::SetFpreg);
        assert_eq!(info.codes[1].op, UnwindOp::PushNonvol(5));
        assert_eq!(info.handler, Some(0x1234_5678));
    }

    #[test]
    fn test_decode_large_alloc_and_far_save()
    {
        let codes = decode_codes(&[0x0110, 0x0020, 0x1108, 0x0010, 0x0002, 0x3404, 0x0003], 1).unwrap();
        assert_eq!(codes[0].op, UnwindOp::Alloc(0x100));
        assert_eq!(codes[1].op, UnwindOp::Alloc(0x2_0010));
        assert_eq!(codes[2].op, UnwindOp::SaveNonvol { reg: 3, offset: 24 });
        assert!(decode_codes(&[0x0110], 1).is_err());
        assert!(decode_codes(&[0x0700], 2).is_err());
    }

    #[test]
    fn test_unwind_after_prologue()
    {
        let (pdata, mut mem) = scenario();
        let top = 0x9000u64;
        mem.map(top - 48, vec![0; 48]);
        mem.write_u64(top - 16, 0xbbbb);
        mem.write_u64(top - 8, IMAGE + 0x5555);
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, IMAGE + 0x1040)
            .with(x86_64::RSP, top - 48)
            .with(x86_64::RBX, 1);

        assert!(unwind_frame(&pdata, IMAGE, &mut regs, &mem, &UnwindLimits::default()).unwrap());
        assert_eq!(regs.get(x86_64::RBX), Some(0xbbbb));
        assert_eq!(regs.get(x86_64::RIP), Some(IMAGE + 0x5555));
        assert_eq!(regs.get(x86_64::RSP), Some(top));
    }

    #[test]
    fn test_unwind_inside_prologue()
    {
        let (pdata, mut mem) = scenario();
        let top = 0x9000u64;
        mem.map(top - 16, vec![0; 16]);
        mem.write_u64(top - 16, 0xbbbb);
        mem.write_u64(top - 8, IMAGE + 0x5555);
        // After `push rbx`, before `sub rsp`.
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, IMAGE + 0x1001)
            .with(x86_64::RSP, top - 16);

        assert!(unwind_frame(&pdata, IMAGE, &mut regs, &mem, &UnwindLimits::default()).unwrap());
        assert_eq!(regs.get(x86_64::RBX), Some(0xbbbb));
        assert_eq!(regs.get(x86_64::RSP), Some(top));
    }

    #[test]
    fn test_unwind_in_epilogue()
    {
        let (pdata, mut mem) = scenario();
        let top = 0x9000u64;
        mem.map(top - 16, vec![0; 16]);
        mem.write_u64(top - 16, 0xbbbb);
        mem.write_u64(top - 8, IMAGE + 0x5555);
        // pop rbx; ret
        mem.map(IMAGE + 0x10f0, vec![0x5b, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc]);
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, IMAGE + 0x10f0)
            .with(x86_64::RSP, top - 16);

        assert!(unwind_frame(&pdata, IMAGE, &mut regs, &mem, &UnwindLimits::default()).unwrap());
        assert_eq!(regs.get(x86_64::RBX), Some(0xbbbb));
        assert_eq!(regs.get(x86_64::RIP), Some(IMAGE + 0x5555));
        assert_eq!(regs.get(x86_64::RSP), Some(top));
    }

    #[test]
    fn test_leaf_function()
    {
        let mut mem = MemoryImage::new();
        mem.map(0x8000, vec![0; 8]);
        mem.write_u64(0x8000, IMAGE + 0x2222);
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, IMAGE + 0x7000)
            .with(x86_64::RSP, 0x8000);
        assert!(unwind_frame(&[], IMAGE, &mut regs, &mem, &UnwindLimits::default()).unwrap());
        assert_eq!(regs.get(x86_64::RIP), Some(IMAGE + 0x2222));
        assert_eq!(regs.get(x86_64::RSP), Some(0x8008));
    }

    #[test]
    fn test_epilogue_shapes()
    {
        let function = RuntimeFunction {
            begin: 0x1000,
            end: 0x1100,
            unwind_info: 0,
        };
        let add_pop_ret = [0x48, 0x83, 0xc4, 0x20, 0x41, 0x5e, 0x5b, 0xc3];
        assert_eq!(
            match_epilogue(&add_pop_ret, 0x1080, &function, 32),
            Some(vec![EpilogStep::AddRsp(0x20), EpilogStep::Pop(14), EpilogStep::Pop(3)])
        );
        // jmp rel8 back into the function is ordinary control flow
        assert_eq!(match_epilogue(&[0x5b, 0xeb, 0x80], 0x1080, &function, 32), None);
        // jmp rel32 out of the function is a tail call
        assert!(match_epilogue(&[0x5b, 0xe9, 0x00, 0x10, 0x00, 0x00], 0x1080, &function, 32).is_some());
        assert_eq!(match_epilogue(&[0x90, 0xc3], 0x1080, &function, 32), None);
        assert_eq!(match_epilogue(&[0x5b, 0x5b, 0x5b, 0xc3], 0x1080, &function, 2), None);
    }

    #[test]
    fn test_indirect_tail_call_epilogue()
    {
        let function = RuntimeFunction {
            begin: 0x1000,
            end: 0x1100,
            unwind_info: 0,
        };
        let plain = [0x5b, 0xff, 0x25, 0x10, 0x20, 0x00, 0x00];
        let rex_w = [0x5b, 0x48, 0xff, 0x25, 0x10, 0x20, 0x00, 0x00];
        assert_eq!(match_epilogue(&plain, 0x1080, &function, 32), Some(vec![EpilogStep::Pop(3)]));
        assert_eq!(match_epilogue(&rex_w, 0x1080, &function, 32), Some(vec![EpilogStep::Pop(3)]));
        // jmp qword [rax] is not a tail call through the import table
        assert_eq!(match_epilogue(&[0x5b, 0x48, 0xff, 0x20], 0x1080, &function, 32), None);
    }

    #[test]
    fn test_epilogue_at_end_of_mapping()
    {
        let (pdata, mut mem) = scenario();
        let top = 0x9000u64;
        mem.map(top - 16, vec![0; 16]);
        mem.write_u64(top - 16, 0xbbbb);
        mem.write_u64(top - 8, IMAGE + 0x5555);
        // pop rbx; ret as the last two mapped bytes
        mem.map(IMAGE + 0x10fe, vec![0x5b, 0xc3]);
        assert_eq!(read_code(&mem, IMAGE + 0x10fe).as_deref(), Some(&[0x5b, 0xc3][..]));

        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, IMAGE + 0x10fe)
            .with(x86_64::RSP, top - 16);
        assert!(unwind_frame(&pdata, IMAGE, &mut regs, &mem, &UnwindLimits::default()).unwrap());
        assert_eq!(regs.get(x86_64::RBX), Some(0xbbbb));
        assert_eq!(regs.get(x86_64::RIP), Some(IMAGE + 0x5555));
        assert_eq!(regs.get(x86_64::RSP), Some(top));
    }

    #[test]
    fn test_lookup_binary_search()
    {
        let table = pdata(&[
            RuntimeFunction {
                begin: 0x1000,
                end: 0x1010,
                unwind_info: 1,
            },
            RuntimeFunction {
                begin: 0x1020,
                end: 0x1080,
                unwind_info: 2,
            },
        ]);
        assert_eq!(RuntimeFunction::lookup(&table, 0x1030).unwrap().unwrap().unwind_info, 2);
        assert_eq!(RuntimeFunction::lookup(&table, 0x1010).unwrap(), None);
        assert_eq!(RuntimeFunction::all(&table).count(), 2);
    }
}
