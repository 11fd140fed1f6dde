//! Architectures, register numbering and register snapshots.
//!
//! Registers are identified by their **DWARF register number** for the target
//! architecture. DWARF expressions and CFI already speak that numbering; the
//! Windows unwinder and the CodeView backend translate their own numbering
//! through [`RegisterId::from_nt`] and [`RegisterId::from_codeview`].

use std::fmt;

use smallvec::SmallVec;

use crate::access::{AccessError, RegisterAccess};

/// Target CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch
{
    /// 32-bit x86 (i386)
    X86,
    /// 64-bit x86 (AMD64)
    X86_64,
    /// 64-bit ARM (AArch64)
    Arm64,
}

impl Arch
{
    /// Size of a pointer in bytes.
    pub const fn pointer_size(self) -> u8
    {
        match self {
            Arch::X86 => 4,
            Arch::X86_64 | Arch::Arm64 => 8,
        }
    }

    /// DWARF number of the stack pointer.
    pub const fn stack_pointer(self) -> RegisterId
    {
        match self {
            Arch::X86 => x86::ESP,
            Arch::X86_64 => x86_64::RSP,
            Arch::Arm64 => arm64::SP,
        }
    }

    /// DWARF number of the frame pointer.
    pub const fn frame_pointer(self) -> RegisterId
    {
        match self {
            Arch::X86 => x86::EBP,
            Arch::X86_64 => x86_64::RBP,
            Arch::Arm64 => arm64::FP,
        }
    }

    /// DWARF column holding the return address.
    ///
    /// On x86 this is the pseudo-register for the instruction pointer; on
    /// ARM64 it is the link register.
    pub const fn return_address(self) -> RegisterId
    {
        match self {
            Arch::X86 => x86::EIP,
            Arch::X86_64 => x86_64::RIP,
            Arch::Arm64 => arm64::LR,
        }
    }

    /// DWARF number of the program counter.
    pub const fn program_counter(self) -> RegisterId
    {
        match self {
            Arch::X86 => x86::EIP,
            Arch::X86_64 => x86_64::RIP,
            Arch::Arm64 => arm64::PC,
        }
    }

    /// Human-readable name, as accepted by the command line.
    pub const fn name(self) -> &'static str
    {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// DWARF register number
///
/// ## Example
///
/// ```rust
/// use symkit_core::types::{x86_64, RegisterId};
///
/// assert_eq!(RegisterId::from_nt(4), Some(x86_64::RSP));
/// assert_eq!(x86_64::RBP, RegisterId(6));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterId(pub u16);

impl RegisterId
{
    /// Translate a Windows x64 unwind-code register number (`RAX`=0, `RCX`=1,
    /// `RDX`=2, `RBX`=3, `RSP`=4, `RBP`=5, `RSI`=6, `RDI`=7, `R8`..`R15`).
    pub const fn from_nt(number: u8) -> Option<Self>
    {
        let dwarf = match number {
            0 => 0,
            1 => 2,
            2 => 1,
            3 => 3,
            4 => 7,
            5 => 6,
            6 => 4,
            7 => 5,
            8..=15 => number as u16,
            _ => return None,
        };
        Some(RegisterId(dwarf))
    }

    /// Translate a CodeView `CV_REG_*` / `CV_AMD64_*` / `CV_ARM64_*` number.
    pub const fn from_codeview(arch: Arch, number: u16) -> Option<Self>
    {
        match arch {
            Arch::X86_64 => match number {
                328 => Some(x86_64::RAX),
                329 => Some(x86_64::RBX),
                330 => Some(x86_64::RCX),
                331 => Some(x86_64::RDX),
                332 => Some(x86_64::RSI),
                333 => Some(x86_64::RDI),
                334 => Some(x86_64::RBP),
                335 => Some(x86_64::RSP),
                336..=343 => Some(RegisterId(number - 336 + 8)),
                33 => Some(x86_64::RIP),
                _ => None,
            },
            Arch::X86 => match number {
                17..=24 => Some(RegisterId(number - 17)),
                33 => Some(x86::EIP),
                _ => None,
            },
            Arch::Arm64 => match number {
                50..=80 => Some(RegisterId(number - 50)),
                81 => Some(arm64::SP),
                82 => Some(arm64::PC),
                _ => None,
            },
        }
    }
}

impl fmt::Display for RegisterId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "r{}", self.0)
    }
}

/// x86-64 DWARF register numbers (System V psABI numbering)
pub mod x86_64
{
    use super::RegisterId;

    pub const RAX: RegisterId = RegisterId(0);
    pub const RDX: RegisterId = RegisterId(1);
    pub const RCX: RegisterId = RegisterId(2);
    pub const RBX: RegisterId = RegisterId(3);
    pub const RSI: RegisterId = RegisterId(4);
    pub const RDI: RegisterId = RegisterId(5);
    pub const RBP: RegisterId = RegisterId(6);
    pub const RSP: RegisterId = RegisterId(7);
    pub const R8: RegisterId = RegisterId(8);
    pub const R9: RegisterId = RegisterId(9);
    pub const R10: RegisterId = RegisterId(10);
    pub const R11: RegisterId = RegisterId(11);
    pub const R12: RegisterId = RegisterId(12);
    pub const R13: RegisterId = RegisterId(13);
    pub const R14: RegisterId = RegisterId(14);
    pub const R15: RegisterId = RegisterId(15);
    /// Return-address column; doubles as `RIP` in register snapshots.
    pub const RIP: RegisterId = RegisterId(16);
}

/// i386 DWARF register numbers
pub mod x86
{
    use super::RegisterId;

    pub const EAX: RegisterId = RegisterId(0);
    pub const ECX: RegisterId = RegisterId(1);
    pub const EDX: RegisterId = RegisterId(2);
    pub const EBX: RegisterId = RegisterId(3);
    pub const ESP: RegisterId = RegisterId(4);
    pub const EBP: RegisterId = RegisterId(5);
    pub const ESI: RegisterId = RegisterId(6);
    pub const EDI: RegisterId = RegisterId(7);
    pub const EIP: RegisterId = RegisterId(8);
}

/// AArch64 DWARF register numbers
pub mod arm64
{
    use super::RegisterId;

    /// General-purpose register `Xn` (0-30).
    pub const fn x(n: u16) -> RegisterId
    {
        RegisterId(n)
    }

    pub const FP: RegisterId = RegisterId(29);
    pub const LR: RegisterId = RegisterId(30);
    pub const SP: RegisterId = RegisterId(31);
    pub const PC: RegisterId = RegisterId(32);
}

/// Number of register slots tracked by a [`RegisterFile`].
///
/// Covers the integer registers of every supported architecture plus the
/// x86-64 return-address column.
pub const REGISTER_SLOTS: usize = 33;

/// Snapshot of a thread's integer registers
///
/// A register file is the simplest implementation of [`RegisterAccess`]:
/// tests, the command line and embedders that already captured a thread
/// context can hand one directly to the location VM or to the unwinders.
/// Registers that were never set read as unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile
{
    arch: Arch,
    values: SmallVec<[Option<u64>; REGISTER_SLOTS]>,
}

impl RegisterFile
{
    /// Create an empty snapshot for `arch`.
    pub fn new(arch: Arch) -> Self
    {
        Self {
            arch,
            values: SmallVec::from_elem(None, REGISTER_SLOTS),
        }
    }

    /// Architecture this snapshot belongs to.
    pub fn arch(&self) -> Arch
    {
        self.arch
    }

    /// Read a register, `None` when unset or out of range.
    pub fn get(&self, reg: RegisterId) -> Option<u64>
    {
        self.values.get(usize::from(reg.0)).copied().flatten()
    }

    /// Set a register. Out-of-range numbers are ignored.
    pub fn set(&mut self, reg: RegisterId, value: u64)
    {
        if let Some(slot) = self.values.get_mut(usize::from(reg.0)) {
            *slot = Some(value);
        }
    }

    /// Mark a register as unavailable.
    pub fn clear(&mut self, reg: RegisterId)
    {
        if let Some(slot) = self.values.get_mut(usize::from(reg.0)) {
            *slot = None;
        }
    }

    /// Builder-style [`RegisterFile::set`].
    #[must_use]
    pub fn with(mut self, reg: RegisterId, value: u64) -> Self
    {
        self.set(reg, value);
        self
    }

    /// Stack pointer value, if known.
    pub fn sp(&self) -> Option<u64>
    {
        self.get(self.arch.stack_pointer())
    }

    /// Program counter value, if known.
    pub fn pc(&self) -> Option<u64>
    {
        self.get(self.arch.program_counter())
    }

    /// Iterate over the registers that currently hold a value.
    pub fn iter(&self) -> impl Iterator<Item = (RegisterId, u64)> + '_
    {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.map(|v| (RegisterId(index as u16), v)))
    }
}

impl RegisterAccess for RegisterFile
{
    fn read_register(&self, arch: Arch, reg: RegisterId) -> Result<u64, AccessError>
    {
        if arch != self.arch {
            return Err(AccessError::Failed);
        }
        self.get(reg).ok_or(AccessError::Failed)
    }

    fn write_register(&mut self, arch: Arch, reg: RegisterId, value: Option<u64>) -> Result<(), AccessError>
    {
        if arch != self.arch || usize::from(reg.0) >= REGISTER_SLOTS {
            return Err(AccessError::Failed);
        }
        match value {
            Some(value) => self.set(reg, value),
            None => self.clear(reg),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_nt_register_mapping()
    {
        assert_eq!(RegisterId::from_nt(0), Some(x86_64::RAX));
        assert_eq!(RegisterId::from_nt(1), Some(x86_64::RCX));
        assert_eq!(RegisterId::from_nt(3), Some(x86_64::RBX));
        assert_eq!(RegisterId::from_nt(4), Some(x86_64::RSP));
        assert_eq!(RegisterId::from_nt(5), Some(x86_64::RBP));
        assert_eq!(RegisterId::from_nt(7), Some(x86_64::RDI));
        assert_eq!(RegisterId::from_nt(12), Some(x86_64::R12));
        assert_eq!(RegisterId::from_nt(16), None);
    }

    #[test]
    fn test_codeview_register_mapping()
    {
        assert_eq!(RegisterId::from_codeview(Arch::X86_64, 334), Some(x86_64::RBP));
        assert_eq!(RegisterId::from_codeview(Arch::X86_64, 335), Some(x86_64::RSP));
        assert_eq!(RegisterId::from_codeview(Arch::X86_64, 343), Some(x86_64::R15));
        assert_eq!(RegisterId::from_codeview(Arch::X86, 22), Some(x86::EBP));
        assert_eq!(RegisterId::from_codeview(Arch::Arm64, 79), Some(arm64::FP));
        assert_eq!(RegisterId::from_codeview(Arch::X86_64, 1), None);
    }

    #[test]
    fn test_register_file_access()
    {
        let mut regs = RegisterFile::new(Arch::X86_64).with(x86_64::RSP, 0x7ff0);
        assert_eq!(regs.read_register(Arch::X86_64, x86_64::RSP), Ok(0x7ff0));
        assert_eq!(regs.read_register(Arch::X86_64, x86_64::RAX), Err(AccessError::Failed));
        assert_eq!(regs.read_register(Arch::Arm64, x86_64::RSP), Err(AccessError::Failed));

        regs.write_register(Arch::X86_64, x86_64::RAX, Some(5)).unwrap();
        assert_eq!(regs.get(x86_64::RAX), Some(5));
        regs.write_register(Arch::X86_64, x86_64::RAX, None).unwrap();
        assert_eq!(regs.get(x86_64::RAX), None);
        assert!(regs.write_register(Arch::X86_64, RegisterId(200), Some(1)).is_err());
    }

    #[test]
    fn test_register_file_covers_every_slot()
    {
        let mut regs = RegisterFile::new(Arch::Arm64);
        for slot in 0..REGISTER_SLOTS as u16 {
            regs.set(RegisterId(slot), u64::from(slot) * 8);
        }
        assert_eq!(regs.get(arm64::SP), Some(u64::from(arm64::SP.0) * 8));
        assert_eq!(regs.get(RegisterId(REGISTER_SLOTS as u16 - 1)), Some((REGISTER_SLOTS as u64 - 1) * 8));
        assert_eq!(regs.get(RegisterId(REGISTER_SLOTS as u16)), None);

        let copy = regs.clone();
        assert_eq!(copy, regs);
        regs.clear(arm64::LR);
        assert_ne!(copy, regs);
    }

    #[test]
    fn test_arch_special_registers()
    {
        assert_eq!(Arch::X86_64.return_address(), x86_64::RIP);
        assert_eq!(Arch::Arm64.return_address(), arm64::LR);
        assert_eq!(Arch::X86.stack_pointer(), x86::ESP);
        assert_eq!(Arch::X86.pointer_size(), 4);
    }
}
