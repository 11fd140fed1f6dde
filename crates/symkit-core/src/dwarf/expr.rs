//! # DWARF Expression VM
//!
//! Bounded-stack interpreter for DWARF location expressions, shared by
//! variable locations, frame bases and CFI `expression` rules.
//!
//! ## Terminal forms
//!
//! - `DW_OP_stack_value` ends evaluation with a synthetic value.
//! - `DW_OP_regN` / `DW_OP_regx` name a register as the location.
//! - `DW_OP_implicit_value` carries the value bytes inline.
//! - Falling off the end with a non-empty stack yields a memory address.
//!
//! ## Failure modes
//!
//! Division or modulo by zero, stack underflow, stack overflow (more than
//! [`STACK_CAPACITY`] entries), branches outside the expression and runaway
//! loops (more than the step budget) are all hard errors. Register and memory
//! reads go through the caller's capabilities; a "retry later" answer from
//! either becomes [`SymError::Maybe`].

use gimli::constants::{self, DwOp};
use smallvec::SmallVec;
use tracing::trace;

use super::unit::AddrTable;
use super::Encoding;
use crate::access::{memory_error, register_error, MemoryAccess, RegisterAccess};
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::{Arch, RegisterId};

/// Maximum number of entries on the evaluation stack.
pub const STACK_CAPACITY: usize = 128;

/// Default number of operations one evaluation may execute.
pub const DEFAULT_STEP_LIMIT: usize = 10_000;

/// Outcome of evaluating an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprResult<'data>
{
    /// The object lives in memory at this address
    Address(u64),
    /// The object has no storage; this is its value
    Value(u64),
    /// The object lives in this register
    Register(RegisterId),
    /// The object's bytes are embedded in the expression
    Implicit(&'data [u8]),
    /// The expression was empty: the object has been optimized out
    Empty,
}

/// Inputs available to an expression besides its bytecode
pub struct EvalContext<'a, 'data>
{
    pub arch: Arch,
    pub encoding: Encoding,
    pub regs: &'a dyn RegisterAccess,
    pub mem: &'a dyn MemoryAccess,
    /// Value used by `DW_OP_fbreg`
    pub frame_base: Option<u64>,
    /// Value pushed by `DW_OP_call_frame_cfa`
    pub cfa: Option<u64>,
    /// Value pushed by `DW_OP_push_object_address`
    pub object_address: Option<u64>,
    /// Added to every `DW_OP_addr` / `DW_OP_addrx` operand
    pub address_bias: u64,
    /// Resolves `DW_OP_addrx` and `DW_OP_constx`
    pub addr_table: Option<AddrTable<'data>>,
    pub step_limit: usize,
}

impl<'a, 'data> EvalContext<'a, 'data>
{
    pub fn new(arch: Arch, encoding: Encoding, regs: &'a dyn RegisterAccess, mem: &'a dyn MemoryAccess) -> Self
    {
        Self {
            arch,
            encoding,
            regs,
            mem,
            frame_base: None,
            cfa: None,
            object_address: None,
            address_bias: 0,
            addr_table: None,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

struct Stack
{
    values: SmallVec<[u64; 16]>,
}

impl Stack
{
    fn push(&mut self, value: u64) -> Result<()>
    {
        if self.values.len() >= STACK_CAPACITY {
            return Err(SymError::malformed("expression stack overflow"));
        }
        self.values.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<u64>
    {
        self.values.pop().ok_or_else(|| SymError::malformed("expression stack underflow"))
    }

    fn pop_signed(&mut self) -> Result<i64>
    {
        self.pop().map(|value| value as i64)
    }

    /// Entry `depth` places below the top (0 is the top).
    fn peek(&self, depth: usize) -> Result<u64>
    {
        self.values
            .len()
            .checked_sub(depth + 1)
            .map(|index| self.values[index])
            .ok_or_else(|| SymError::malformed("expression stack underflow"))
    }

    fn len(&self) -> usize
    {
        self.values.len()
    }
}

fn in_range(op: DwOp, first: DwOp, last: DwOp) -> Option<u16>
{
    (first.0..=last.0).contains(&op.0).then(|| u16::from(op.0 - first.0))
}

/// Evaluate `ops` with an empty initial stack.
pub fn evaluate<'data>(ops: &'data [u8], ctx: &EvalContext<'_, 'data>) -> Result<ExprResult<'data>>
{
    evaluate_with_stack(ops, ctx, &[])
}

/// Evaluate `ops` after pushing `initial` (bottom first).
///
/// CFI `DW_CFA_expression` rules start with the CFA on the stack.
#[allow(clippy::too_many_lines)]
pub fn evaluate_with_stack<'data>(
    ops: &'data [u8],
    ctx: &EvalContext<'_, 'data>,
    initial: &[u64],
) -> Result<ExprResult<'data>>
{
    let mut cursor = BinaryCursor::new(ops)
        .with_address_size(ctx.encoding.address_size)
        .with_format(ctx.encoding.format);
    let mut stack = Stack {
        values: SmallVec::new(),
    };
    for &value in initial {
        stack.push(value)?;
    }
    let mut steps = 0usize;

    while !cursor.is_empty() {
        steps += 1;
        if steps > ctx.step_limit {
            return Err(SymError::malformed("expression step limit exceeded"));
        }

        let op = DwOp(cursor.read_u8()?);
        trace!(op = %op, depth = stack.len(), "eval");

        if let Some(value) = in_range(op, constants::DW_OP_lit0, constants::DW_OP_lit31) {
            stack.push(u64::from(value))?;
            continue;
        }
        if let Some(reg) = in_range(op, constants::DW_OP_reg0, constants::DW_OP_reg31) {
            return finish_register(&cursor, RegisterId(reg));
        }
        if let Some(reg) = in_range(op, constants::DW_OP_breg0, constants::DW_OP_breg31) {
            let offset = cursor.read_sleb128()?;
            let value = read_register(ctx, RegisterId(reg))?;
            stack.push(value.wrapping_add_signed(offset))?;
            continue;
        }

        match op {
            constants::DW_OP_nop => {}
            constants::DW_OP_addr => {
                let address = cursor.read_address()?;
                stack.push(address.wrapping_add(ctx.address_bias))?;
            }
            constants::DW_OP_addrx | constants::DW_OP_GNU_addr_index => {
                let index = cursor.read_uleb128()?;
                let address = lookup_addr(ctx, index)?;
                stack.push(address.wrapping_add(ctx.address_bias))?;
            }
            constants::DW_OP_constx | constants::DW_OP_GNU_const_index => {
                let index = cursor.read_uleb128()?;
                stack.push(lookup_addr(ctx, index)?)?;
            }
            constants::DW_OP_const1u => stack.push(u64::from(cursor.read_u8()?))?,
            constants::DW_OP_const1s => stack.push(i64::from(cursor.read_i8()?) as u64)?,
            constants::DW_OP_const2u => stack.push(u64::from(cursor.read_u16()?))?,
            constants::DW_OP_const2s => stack.push(i64::from(cursor.read_i16()?) as u64)?,
            constants::DW_OP_const4u => stack.push(u64::from(cursor.read_u32()?))?,
            constants::DW_OP_const4s => stack.push(i64::from(cursor.read_i32()?) as u64)?,
            constants::DW_OP_const8u => stack.push(cursor.read_u64()?)?,
            constants::DW_OP_const8s => stack.push(cursor.read_i64()? as u64)?,
            constants::DW_OP_constu => stack.push(cursor.read_uleb128()?)?,
            constants::DW_OP_consts => stack.push(cursor.read_sleb128()? as u64)?,

            constants::DW_OP_fbreg => {
                let offset = cursor.read_sleb128()?;
                let base = ctx
                    .frame_base
                    .ok_or_else(|| SymError::Unsupported("DW_OP_fbreg without a frame base".into()))?;
                stack.push(base.wrapping_add_signed(offset))?;
            }
            constants::DW_OP_bregx => {
                let reg = register_operand(&mut cursor)?;
                let offset = cursor.read_sleb128()?;
                let value = read_register(ctx, reg)?;
                stack.push(value.wrapping_add_signed(offset))?;
            }
            constants::DW_OP_regx => {
                let reg = register_operand(&mut cursor)?;
                return finish_register(&cursor, reg);
            }

            constants::DW_OP_dup => stack.push(stack.peek(0)?)?,
            constants::DW_OP_drop => {
                stack.pop()?;
            }
            constants::DW_OP_over => stack.push(stack.peek(1)?)?,
            constants::DW_OP_pick => {
                let index = cursor.read_u8()?;
                stack.push(stack.peek(usize::from(index))?)?;
            }
            constants::DW_OP_swap => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                stack.push(a)?;
                stack.push(b)?;
            }
            constants::DW_OP_rot => {
                let a = stack.pop()?;
                let b = stack.pop()?;
                let c = stack.pop()?;
                stack.push(a)?;
                stack.push(c)?;
                stack.push(b)?;
            }

            constants::DW_OP_deref => {
                let address = stack.pop()?;
                stack.push(read_memory(ctx, address, ctx.encoding.address_size)?)?;
            }
            constants::DW_OP_deref_size => {
                let size = cursor.read_u8()?;
                if size == 0 || size > ctx.encoding.address_size {
                    return Err(SymError::malformed("DW_OP_deref_size larger than an address"));
                }
                let address = stack.pop()?;
                stack.push(read_memory(ctx, address, size)?)?;
            }

            constants::DW_OP_abs => {
                let value = stack.pop_signed()?;
                stack.push(value.unsigned_abs())?;
            }
            constants::DW_OP_neg => {
                let value = stack.pop_signed()?;
                stack.push(value.wrapping_neg() as u64)?;
            }
            constants::DW_OP_not => {
                let value = stack.pop()?;
                stack.push(!value)?;
            }
            constants::DW_OP_plus_uconst => {
                let addend = cursor.read_uleb128()?;
                let value = stack.pop()?;
                stack.push(value.wrapping_add(addend))?;
            }
            constants::DW_OP_and
            | constants::DW_OP_or
            | constants::DW_OP_xor
            | constants::DW_OP_plus
            | constants::DW_OP_minus
            | constants::DW_OP_mul
            | constants::DW_OP_div
            | constants::DW_OP_mod
            | constants::DW_OP_shl
            | constants::DW_OP_shr
            | constants::DW_OP_shra
            | constants::DW_OP_eq
            | constants::DW_OP_ne
            | constants::DW_OP_lt
            | constants::DW_OP_le
            | constants::DW_OP_gt
            | constants::DW_OP_ge => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(binary_op(op, lhs, rhs)?)?;
            }

            constants::DW_OP_skip => {
                let delta = cursor.read_i16()?;
                branch(&mut cursor, delta)?;
            }
            constants::DW_OP_bra => {
                let delta = cursor.read_i16()?;
                if stack.pop()? != 0 {
                    branch(&mut cursor, delta)?;
                }
            }

            constants::DW_OP_call_frame_cfa => {
                let cfa = ctx
                    .cfa
                    .ok_or_else(|| SymError::Unsupported("DW_OP_call_frame_cfa without a CFA".into()))?;
                stack.push(cfa)?;
            }
            constants::DW_OP_push_object_address => {
                let address = ctx
                    .object_address
                    .ok_or_else(|| SymError::Unsupported("DW_OP_push_object_address without an object".into()))?;
                stack.push(address)?;
            }

            constants::DW_OP_implicit_value => {
                let len = usize::try_from(cursor.read_uleb128()?)
                    .map_err(|_| SymError::malformed("DW_OP_implicit_value length"))?;
                let bytes = cursor.read_bytes(len)?;
                return Ok(ExprResult::Implicit(bytes));
            }
            constants::DW_OP_stack_value => {
                return Ok(ExprResult::Value(stack.pop()?));
            }

            _ => return Err(SymError::Unsupported(format!("expression opcode {op}"))),
        }
    }

    if stack.len() == 0 {
        Ok(ExprResult::Empty)
    } else {
        Ok(ExprResult::Address(stack.pop()?))
    }
}

fn binary_op(op: DwOp, lhs: u64, rhs: u64) -> Result<u64>
{
    let (slhs, srhs) = (lhs as i64, rhs as i64);
    let flag = |value: bool| u64::from(value);
    let value = match op {
        constants::DW_OP_and => lhs & rhs,
        constants::DW_OP_or => lhs | rhs,
        constants::DW_OP_xor => lhs ^ rhs,
        constants::DW_OP_plus => lhs.wrapping_add(rhs),
        constants::DW_OP_minus => lhs.wrapping_sub(rhs),
        constants::DW_OP_mul => lhs.wrapping_mul(rhs),
        constants::DW_OP_div => {
            if srhs == 0 {
                return Err(SymError::malformed("division by zero in expression"));
            }
            slhs.wrapping_div(srhs) as u64
        }
        constants::DW_OP_mod => {
            if rhs == 0 {
                return Err(SymError::malformed("modulo by zero in expression"));
            }
            lhs % rhs
        }
        constants::DW_OP_shl => lhs.checked_shl(rhs.min(64) as u32).unwrap_or(0),
        constants::DW_OP_shr => lhs.checked_shr(rhs.min(64) as u32).unwrap_or(0),
        constants::DW_OP_shra => slhs.checked_shr(rhs.min(64) as u32).unwrap_or(slhs >> 63) as u64,
        constants::DW_OP_eq => flag(slhs == srhs),
        constants::DW_OP_ne => flag(slhs != srhs),
        constants::DW_OP_lt => flag(slhs < srhs),
        constants::DW_OP_le => flag(slhs <= srhs),
        constants::DW_OP_gt => flag(slhs > srhs),
        constants::DW_OP_ge => flag(slhs >= srhs),
        _ => return Err(SymError::Unsupported(format!("binary opcode {op}"))),
    };
    Ok(value)
}

fn branch(cursor: &mut BinaryCursor<'_>, delta: i16) -> Result<()>
{
    cursor
        .skip_signed(i64::from(delta))
        .map_err(|_| SymError::malformed("expression branch out of range"))
}

fn register_operand(cursor: &mut BinaryCursor<'_>) -> Result<RegisterId>
{
    let reg = cursor.read_uleb128()?;
    u16::try_from(reg)
        .map(RegisterId)
        .map_err(|_| SymError::malformed("register number out of range"))
}

// Register locations are only meaningful as the whole expression.
fn finish_register<'data>(cursor: &BinaryCursor<'data>, reg: RegisterId) -> Result<ExprResult<'data>>
{
    match cursor.peek_u8().map(DwOp) {
        None => Ok(ExprResult::Register(reg)),
        Some(constants::DW_OP_piece | constants::DW_OP_bit_piece) => {
            Err(SymError::Unsupported("composite location (DW_OP_piece)".into()))
        }
        Some(_) => Err(SymError::malformed("register location followed by more operations")),
    }
}

fn read_register(ctx: &EvalContext<'_, '_>, reg: RegisterId) -> Result<u64>
{
    ctx.regs
        .read_register(ctx.arch, reg)
        .map_err(|err| register_error(reg, err))
}

fn read_memory(ctx: &EvalContext<'_, '_>, address: u64, size: u8) -> Result<u64>
{
    ctx.mem
        .read_sized(address, size)
        .map_err(|err| memory_error(address, err))
}

fn lookup_addr(ctx: &EvalContext<'_, '_>, index: u64) -> Result<u64>
{
    ctx.addr_table
        .as_ref()
        .ok_or_else(|| SymError::malformed("DW_OP_addrx without .debug_addr"))?
        .get(index)
}
