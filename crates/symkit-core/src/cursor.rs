//! # Binary Cursor
//!
//! Bounded little-endian reader shared by every decoder in the crate.
//!
//! A [`BinaryCursor`] is a non-owning view over caller-provided bytes with a
//! current `offset` and a hard `limit`. Every primitive checks the bound first:
//! an operation that would cross `limit` fails with
//! [`SymError::MalformedData`], leaves the offset where it was, and sets a
//! sticky error flag. The offset therefore never exceeds the limit and no
//! slice handed out ever reaches past it.
//!
//! The cursor also carries the two encoding parameters DWARF readers need:
//! the target address size and the 32/64-bit offset format.

use crate::error::{Result, SymError};

/// DWARF offset format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format
{
    /// 32-bit offsets (initial length below `0xffff_fff0`)
    #[default]
    Dwarf32,
    /// 64-bit offsets (initial length escape `0xffff_ffff`)
    Dwarf64,
}

impl Format
{
    /// Size of a section offset in bytes.
    pub const fn offset_size(self) -> u8
    {
        match self {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 8,
        }
    }
}

/// Bounded byte-stream reader
#[derive(Debug, Clone)]
pub struct BinaryCursor<'data>
{
    data: &'data [u8],
    offset: usize,
    limit: usize,
    address_size: u8,
    format: Format,
    error: bool,
}

impl<'data> BinaryCursor<'data>
{
    /// Cursor over the whole of `data`, 8-byte addresses, 32-bit offsets.
    pub fn new(data: &'data [u8]) -> Self
    {
        Self {
            data,
            offset: 0,
            limit: data.len(),
            address_size: 8,
            format: Format::Dwarf32,
            error: false,
        }
    }

    /// Cursor over `data[start..end]`, with offsets still relative to `data`.
    ///
    /// The range is clamped to the slice, so a corrupt `end` yields a short
    /// cursor rather than a panic.
    pub fn with_range(data: &'data [u8], start: usize, end: usize) -> Self
    {
        let limit = end.min(data.len());
        Self {
            data,
            offset: start.min(limit),
            limit,
            address_size: 8,
            format: Format::Dwarf32,
            error: start > limit,
        }
    }

    #[must_use]
    pub fn with_address_size(mut self, address_size: u8) -> Self
    {
        self.address_size = address_size;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self
    {
        self.format = format;
        self
    }

    pub fn set_address_size(&mut self, address_size: u8)
    {
        self.address_size = address_size;
    }

    pub fn set_format(&mut self, format: Format)
    {
        self.format = format;
    }

    pub fn address_size(&self) -> u8
    {
        self.address_size
    }

    pub fn format(&self) -> Format
    {
        self.format
    }

    /// Current position, relative to the start of the underlying slice.
    pub fn offset(&self) -> usize
    {
        self.offset
    }

    pub fn limit(&self) -> usize
    {
        self.limit
    }

    pub fn remaining(&self) -> usize
    {
        self.limit - self.offset
    }

    pub fn is_empty(&self) -> bool
    {
        self.offset >= self.limit
    }

    /// Whether any operation on this cursor has failed.
    pub fn has_error(&self) -> bool
    {
        self.error
    }

    /// The underlying slice (not just the bounded window).
    pub fn data(&self) -> &'data [u8]
    {
        self.data
    }

    fn fail<T>(&mut self, context: &str) -> Result<T>
    {
        self.error = true;
        Err(SymError::malformed(format!("{context} at offset 0x{:x}", self.offset)))
    }

    /// Move to an absolute offset within `[0, limit]`.
    pub fn seek(&mut self, offset: usize) -> Result<()>
    {
        if offset > self.limit {
            return self.fail("seek past limit");
        }
        self.offset = offset;
        Ok(())
    }

    /// Advance by `count` bytes.
    pub fn skip(&mut self, count: usize) -> Result<()>
    {
        if count > self.remaining() {
            return self.fail("skip past limit");
        }
        self.offset += count;
        Ok(())
    }

    /// Move by a signed displacement, staying within `[0, limit]`.
    pub fn skip_signed(&mut self, delta: i64) -> Result<()>
    {
        let target = i64::try_from(self.offset).ok().and_then(|offset| offset.checked_add(delta));
        match target.and_then(|target| usize::try_from(target).ok()) {
            Some(target) if target <= self.limit => {
                self.offset = target;
                Ok(())
            }
            _ => self.fail("relative skip out of range"),
        }
    }

    /// Borrow the next `count` bytes and advance past them.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'data [u8]>
    {
        if count > self.remaining() {
            return self.fail("read past limit");
        }
        let bytes = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(bytes)
    }

    /// Split off a cursor over the next `count` bytes and advance past them.
    ///
    /// The child shares this cursor's address size and format.
    pub fn sub_cursor(&mut self, count: usize) -> Result<BinaryCursor<'data>>
    {
        if count > self.remaining() {
            return self.fail("sub-range past limit");
        }
        let child = BinaryCursor {
            data: self.data,
            offset: self.offset,
            limit: self.offset + count,
            address_size: self.address_size,
            format: self.format,
            error: false,
        };
        self.offset += count;
        Ok(child)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]>
    {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn peek_u8(&self) -> Option<u8>
    {
        if self.offset < self.limit {
            Some(self.data[self.offset])
        } else {
            None
        }
    }

    pub fn read_u8(&mut self) -> Result<u8>
    {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8>
    {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16>
    {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16>
    {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u24(&mut self) -> Result<u32>
    {
        let [a, b, c] = self.read_array()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32(&mut self) -> Result<u32>
    {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32>
    {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64>
    {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64>
    {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read an unsigned little-endian value of 1, 2, 4 or 8 bytes.
    pub fn read_sized(&mut self, size: u8) -> Result<u64>
    {
        match size {
            1 => self.read_u8().map(u64::from),
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => self.fail("unsupported value size"),
        }
    }

    /// Read a target address using the cursor's address size.
    pub fn read_address(&mut self) -> Result<u64>
    {
        self.read_sized(self.address_size)
    }

    /// Read a section offset using the cursor's format.
    pub fn read_offset(&mut self) -> Result<u64>
    {
        match self.format {
            Format::Dwarf32 => self.read_u32().map(u64::from),
            Format::Dwarf64 => self.read_u64(),
        }
    }

    /// Read a DWARF initial length, switching the cursor's format to match.
    ///
    /// Returns the unit length in bytes (not counting the length field).
    pub fn read_initial_length(&mut self) -> Result<u64>
    {
        let start = self.offset;
        let length = self.read_u32()?;
        match length {
            0xffff_ffff => match self.read_u64() {
                Ok(length) => {
                    self.format = Format::Dwarf64;
                    Ok(length)
                }
                Err(err) => {
                    self.offset = start;
                    Err(err)
                }
            },
            0xffff_fff0..=0xffff_fffe => {
                self.offset = start;
                self.fail("reserved initial length")
            }
            _ => {
                self.format = Format::Dwarf32;
                Ok(u64::from(length))
            }
        }
    }

    /// Read an unsigned LEB128 value.
    ///
    /// Seven payload bits are accumulated per byte until a byte with the
    /// continuation bit clear. Payload bits that do not fit in 64 bits are an
    /// error; redundant zero padding is accepted.
    pub fn read_uleb128(&mut self) -> Result<u64>
    {
        let start = self.offset;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.peek_u8() else {
                self.offset = start;
                return self.fail("truncated uleb128");
            };
            self.offset += 1;
            let payload = u64::from(byte & 0x7f);
            if shift < 64 {
                if shift == 63 && payload > 1 {
                    self.offset = start;
                    return self.fail("uleb128 overflow");
                }
                result |= payload << shift;
            } else if payload != 0 {
                self.offset = start;
                return self.fail("uleb128 overflow");
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Read a signed LEB128 value.
    ///
    /// Like [`BinaryCursor::read_uleb128`], then sign-extends from bit 6 of the
    /// final byte when fewer than 64 bits were accumulated.
    pub fn read_sleb128(&mut self) -> Result<i64>
    {
        let start = self.offset;
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.peek_u8() else {
                self.offset = start;
                return self.fail("truncated sleb128");
            };
            self.offset += 1;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read a NUL-terminated byte string, consuming the terminator.
    ///
    /// The returned slice does not include the terminator.
    pub fn read_cstr(&mut self) -> Result<&'data [u8]>
    {
        let window = &self.data[self.offset..self.limit];
        match window.iter().position(|&b| b == 0) {
            Some(len) => {
                let bytes = &window[..len];
                self.offset += len + 1;
                Ok(bytes)
            }
            None => self.fail("unterminated string"),
        }
    }

    /// Align the offset up to a multiple of `align` (a power of two),
    /// measured from the start of the underlying slice.
    pub fn align(&mut self, align: usize) -> Result<()>
    {
        let aligned = self.offset.next_multiple_of(align.max(1));
        self.seek(aligned)
    }
}

/// Read a NUL-terminated string at `offset` in a string section.
pub fn cstr_at(data: &[u8], offset: u64) -> Result<&[u8]>
{
    let start = usize::try_from(offset).map_err(|_| SymError::malformed("string offset"))?;
    BinaryCursor::with_range(data, start, data.len()).read_cstr()
}
