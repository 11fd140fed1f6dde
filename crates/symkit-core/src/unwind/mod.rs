//! # Virtual Unwinding
//!
//! Recovers the caller's registers from the callee's, one frame at a time,
//! without touching a live process:
//!
//! - [`cfi`]: DWARF Call Frame Information (`.eh_frame`, `.debug_frame`)
//! - [`nt`]: Windows x64 unwind codes (`.pdata` + `UNWIND_INFO`)
//!
//! Both engines read registers and memory through the caller's capabilities
//! and compute every new register value before writing any of them back, so
//! a failed step leaves the register file exactly as it was.

pub mod cfi;
pub mod nt;

use smallvec::SmallVec;
use tracing::debug;

use crate::access::{register_error, MemoryAccess, RegisterAccess};
use crate::config::UnwindLimits;
use crate::error::{Result, SymError};
use crate::types::{Arch, RegisterId};

pub use cfi::{CfaRule, CfiKind, CfiSection, CfiUnwinder, FdeIndex, RegisterRule, UnwindRow};
pub use nt::{RuntimeFunction, UnwindInfo};

/// Which unwind metadata `virtual_unwind_frame` interprets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindSource
{
    /// `.eh_frame` bytes, linked at `section_address`
    EhFrame
    {
        section_address: u64,
    },
    /// `.debug_frame` bytes
    DebugFrame,
    /// `.pdata` bytes; `UNWIND_INFO` records and code are read from memory
    Pdata,
}

/// Register writes computed by an unwinder, applied all at once
#[derive(Debug, Default)]
pub(crate) struct PendingWrites
{
    writes: SmallVec<[(RegisterId, Option<u64>); 24]>,
}

impl PendingWrites
{
    /// Record a write, replacing an earlier one to the same register.
    pub(crate) fn set(&mut self, reg: RegisterId, value: Option<u64>)
    {
        match self.writes.iter_mut().find(|(existing, _)| *existing == reg) {
            Some(slot) => slot.1 = value,
            None => self.writes.push((reg, value)),
        }
    }

    /// Pending value of `reg`, falling back to the live register file.
    pub(crate) fn read(&self, arch: Arch, regs: &dyn RegisterAccess, reg: RegisterId) -> Result<u64>
    {
        match self.writes.iter().find(|(existing, _)| *existing == reg) {
            Some((_, Some(value))) => Ok(*value),
            Some((_, None)) => Err(SymError::RegisterUnavailable(reg)),
            None => regs.read_register(arch, reg).map_err(|err| register_error(reg, err)),
        }
    }

    pub(crate) fn commit(self, arch: Arch, regs: &mut dyn RegisterAccess) -> Result<()>
    {
        for (reg, value) in self.writes {
            regs.write_register(arch, reg, value)
                .map_err(|err| register_error(reg, err))?;
        }
        Ok(())
    }
}

/// Unwind one frame.
///
/// `image_base` is added to every address stored in the unwind metadata: the
/// load bias for CFI, the image base for `.pdata` RVAs. On success the
/// register file holds the caller's state and `true` is returned; `false`
/// means the metadata marks this frame as the outermost one and the registers
/// were left untouched.
pub fn virtual_unwind_frame(
    arch: Arch,
    source: UnwindSource,
    bytes: &[u8],
    image_base: u64,
    regs: &mut dyn RegisterAccess,
    mem: &dyn MemoryAccess,
    limits: &UnwindLimits,
) -> Result<bool>
{
    let pc_reg = arch.program_counter();
    let pc = regs.read_register(arch, pc_reg).map_err(|err| register_error(pc_reg, err))?;
    debug!(%arch, pc = format_args!("0x{pc:x}"), ?source, "unwinding frame");

    match source {
        UnwindSource::EhFrame { section_address } => {
            let section = CfiSection::eh_frame(bytes, section_address, arch.pointer_size());
            cfi::unwind_frame(&section, arch, image_base, regs, mem, limits)
        }
        UnwindSource::DebugFrame => {
            let section = CfiSection::debug_frame(bytes, arch.pointer_size());
            cfi::unwind_frame(&section, arch, image_base, regs, mem, limits)
        }
        UnwindSource::Pdata => {
            if arch != Arch::X86_64 {
                return Err(SymError::Unsupported(format!(".pdata unwinding on {arch}")));
            }
            nt::unwind_frame(bytes, image_base, regs, mem, limits)
        }
    }
}
