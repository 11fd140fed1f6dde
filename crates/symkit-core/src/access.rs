//! # Register and Memory Capabilities
//!
//! The location VM and both unwinders never touch a live process. Every
//! register and memory access goes through these traits, which the caller
//! implements on top of whatever debuggee transport it has (a ptrace session,
//! a minidump, a remote stub, a captured context).
//!
//! Each access has three outcomes: success, [`AccessError::Failed`] ("no such
//! data") and [`AccessError::Retry`] ("not available yet"). The second and
//! third surface as [`SymError::MemoryReadFailed`] /
//! [`SymError::RegisterUnavailable`] and [`SymError::Maybe`] respectively, so
//! an asynchronous caller can choose to re-issue the request.

use std::collections::BTreeMap;

use crate::error::SymError;
use crate::types::{Arch, RegisterId};

/// Failure reported by a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessError
{
    /// The data does not exist or cannot be read
    Failed,
    /// The data is not available yet; retry later
    Retry,
}

/// Register read/write capability
pub trait RegisterAccess
{
    /// Read a register by DWARF number.
    fn read_register(&self, arch: Arch, reg: RegisterId) -> Result<u64, AccessError>;

    /// Write a register by DWARF number. `None` marks the register undefined.
    ///
    /// Read-only implementations may keep the default, which refuses writes.
    fn write_register(&mut self, _arch: Arch, _reg: RegisterId, _value: Option<u64>) -> Result<(), AccessError>
    {
        Err(AccessError::Failed)
    }
}

/// Memory read capability
///
/// Values are little-endian, matching every supported target.
pub trait MemoryAccess
{
    /// Fill `buf` with the bytes at `address`.
    ///
    /// Implementations must either fill the whole buffer or fail.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError>;

    /// Read a little-endian value of `size` bytes (1 to 8), zero-extended.
    fn read_sized(&self, address: u64, size: u8) -> Result<u64, AccessError>
    {
        let mut buf = [0u8; 8];
        let len = usize::from(size.min(8));
        self.read_memory(address, &mut buf[..len])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a 64-bit value from the given address.
    fn read_u64(&self, address: u64) -> Result<u64, AccessError>
    {
        self.read_sized(address, 8)
    }
}

/// Translate a register read failure into a [`SymError`].
pub(crate) fn register_error(reg: RegisterId, error: AccessError) -> SymError
{
    match error {
        AccessError::Failed => SymError::RegisterUnavailable(reg),
        AccessError::Retry => SymError::Maybe(format!("register {reg}")),
    }
}

/// Translate a memory read failure into a [`SymError`].
pub(crate) fn memory_error(address: u64, error: AccessError) -> SymError
{
    match error {
        AccessError::Failed => SymError::MemoryReadFailed(address),
        AccessError::Retry => SymError::Maybe(format!("memory at 0x{address:x}")),
    }
}

/// Memory capability that has no readable bytes at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemory;

impl MemoryAccess for NoMemory
{
    fn read_memory(&self, _address: u64, _buf: &mut [u8]) -> Result<(), AccessError>
    {
        Err(AccessError::Failed)
    }
}

/// Scripted memory made of disjoint byte regions
///
/// Useful for replaying a captured stack, for minidump-style snapshots, and
/// for tests. Reads that straddle two regions or fall outside every region
/// fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage
{
    regions: BTreeMap<u64, Vec<u8>>,
}

impl MemoryImage
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Map `bytes` at `base`, replacing any region that starts at the same address.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>)
    {
        self.regions.insert(base, bytes);
    }

    /// Write a little-endian `u64` into an already mapped region.
    ///
    /// Returns `false` if the target bytes are not mapped.
    pub fn write_u64(&mut self, address: u64, value: u64) -> bool
    {
        let Some((base, bytes)) = self.regions.range_mut(..=address).next_back() else {
            return false;
        };
        let Ok(start) = usize::try_from(address - *base) else {
            return false;
        };
        match bytes.get_mut(start..start + 8) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

impl MemoryAccess for MemoryImage
{
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError>
    {
        let (base, bytes) = self.regions.range(..=address).next_back().ok_or(AccessError::Failed)?;
        let start = usize::try_from(address - base).map_err(|_| AccessError::Failed)?;
        let end = start.checked_add(buf.len()).ok_or(AccessError::Failed)?;
        let source = bytes.get(start..end).ok_or(AccessError::Failed)?;
        buf.copy_from_slice(source);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_memory_image_reads_within_region()
    {
        let mut mem = MemoryImage::new();
        mem.map(0x1000, (0u8..32).collect());
        assert_eq!(mem.read_sized(0x1000, 1), Ok(0));
        assert_eq!(mem.read_sized(0x1001, 2), Ok(0x0201));
        assert_eq!(mem.read_u64(0x1008), Ok(u64::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15])));
    }

    #[test]
    fn test_memory_image_rejects_out_of_bounds()
    {
        let mut mem = MemoryImage::new();
        mem.map(0x1000, vec![0; 16]);
        assert_eq!(mem.read_u64(0x0ff8), Err(AccessError::Failed));
        assert_eq!(mem.read_u64(0x100c), Err(AccessError::Failed));
        assert_eq!(mem.read_u64(0x2000), Err(AccessError::Failed));
    }

    #[test]
    fn test_memory_image_write()
    {
        let mut mem = MemoryImage::new();
        mem.map(0x1000, vec![0; 16]);
        assert!(mem.write_u64(0x1008, 0xdead_beef));
        assert_eq!(mem.read_u64(0x1008), Ok(0xdead_beef));
        assert!(!mem.write_u64(0x100c, 1));
    }

    #[test]
    fn test_error_translation()
    {
        assert!(memory_error(0x10, AccessError::Retry).is_retryable());
        assert_eq!(memory_error(0x10, AccessError::Failed), SymError::MemoryReadFailed(0x10));
        assert_eq!(
            register_error(RegisterId(7), AccessError::Failed),
            SymError::RegisterUnavailable(RegisterId(7))
        );
    }
}
