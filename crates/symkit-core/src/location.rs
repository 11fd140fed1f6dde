//! # Encoded Locations
//!
//! Where a variable or frame base lives, as recorded by the debug format.
//! Locations stay encoded until a caller supplies register and memory
//! capabilities; [`decode`] then evaluates them for one program counter.

use tracing::trace;

use crate::access::{register_error, MemoryAccess, RegisterAccess};
use crate::dwarf::expr::{self, EvalContext, ExprResult, DEFAULT_STEP_LIMIT};
use crate::dwarf::loclists::LocListEntry;
use crate::dwarf::{AddrTable, Encoding};
use crate::error::{Result, SymError};
use crate::types::{Arch, Rebase, RegisterId};

/// Frame bases may themselves be location lists whose expressions use
/// `DW_OP_fbreg`; nesting deeper than this is rejected.
const MAX_FRAME_BASE_DEPTH: usize = 4;

/// A DWARF expression plus everything needed to evaluate it later
#[derive(Debug, Clone, PartialEq)]
pub struct ExprLocation<'data>
{
    pub ops: &'data [u8],
    pub encoding: Encoding,
    /// Frame base of the enclosing procedure, used by `DW_OP_fbreg`
    pub frame_base: Option<Box<EncodedLocation<'data>>>,
    /// Object address for `DW_OP_push_object_address` (member locations)
    pub object_address: Option<u64>,
    pub addr_table: Option<AddrTable<'data>>,
    /// Load bias added to `DW_OP_addr` operands
    pub address_bias: u64,
}

impl<'data> ExprLocation<'data>
{
    pub fn new(ops: &'data [u8], encoding: Encoding) -> Self
    {
        Self {
            ops,
            encoding,
            frame_base: None,
            object_address: None,
            addr_table: None,
            address_bias: 0,
        }
    }

    fn with_ops(&self, ops: &'data [u8]) -> Self
    {
        Self { ops, ..self.clone() }
    }
}

/// A location as stored in the debug information
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EncodedLocation<'data>
{
    /// No location: optimized out or never materialized
    #[default]
    Null,
    /// Static storage at a fixed address
    Rva(u64),
    /// DWARF expression
    Expr(ExprLocation<'data>),
    /// DWARF location list; the entry covering the pc is evaluated
    LocList
    {
        entries: Vec<LocListEntry<'data>>,
        template: ExprLocation<'data>,
    },
    /// CodeView register-relative storage (`S_REGREL32`, `S_BPREL32`)
    RegisterRelative
    {
        reg: RegisterId,
        offset: i64,
    },
    /// CodeView enregistered variable (`S_REGISTER`)
    Register(RegisterId),
}

impl EncodedLocation<'_>
{
    pub fn is_null(&self) -> bool
    {
        matches!(self, EncodedLocation::Null)
    }
}

impl Rebase for ExprLocation<'_>
{
    fn rebase(mut self, load_bias: u64) -> Self
    {
        self.address_bias = self.address_bias.wrapping_add(load_bias);
        self.frame_base = self.frame_base.map(|base| Box::new(base.rebase(load_bias)));
        self
    }
}

impl Rebase for EncodedLocation<'_>
{
    fn rebase(self, load_bias: u64) -> Self
    {
        match self {
            EncodedLocation::Rva(address) => EncodedLocation::Rva(address.wrapping_add(load_bias)),
            EncodedLocation::Expr(expr) => EncodedLocation::Expr(expr.rebase(load_bias)),
            EncodedLocation::LocList { entries, template } => EncodedLocation::LocList {
                entries: entries
                    .into_iter()
                    .map(|entry| LocListEntry {
                        range: if entry.is_default() {
                            entry.range
                        } else {
                            entry.range.rebase(load_bias)
                        },
                        ops: entry.ops,
                    })
                    .collect(),
                template: template.rebase(load_bias),
            },
            other => other,
        }
    }
}

/// A decoded location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location<'data>
{
    /// The variable has no storage at this pc
    Null,
    /// The variable lives in memory
    Address(u64),
    /// The variable lives in a register
    Register(RegisterId),
    /// The variable's value is known but it has no storage
    Value(u64),
    /// The variable's bytes are embedded in the debug information
    Implicit(&'data [u8]),
}

/// Runtime state needed to decode a location
pub struct LocationContext<'a>
{
    pub arch: Arch,
    /// Program counter, in the rebased space
    pub pc: u64,
    pub regs: &'a dyn RegisterAccess,
    pub mem: &'a dyn MemoryAccess,
    /// Canonical frame address of the current frame, when known
    pub cfa: Option<u64>,
    pub step_limit: usize,
}

impl<'a> LocationContext<'a>
{
    pub fn new(arch: Arch, pc: u64, regs: &'a dyn RegisterAccess, mem: &'a dyn MemoryAccess) -> Self
    {
        Self {
            arch,
            pc,
            regs,
            mem,
            cfa: None,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

/// Decode `encoded` at the context's program counter.
pub fn decode<'data>(encoded: &EncodedLocation<'data>, ctx: &LocationContext<'_>) -> Result<Location<'data>>
{
    decode_at_depth(encoded, ctx, 0)
}

fn decode_at_depth<'data>(
    encoded: &EncodedLocation<'data>,
    ctx: &LocationContext<'_>,
    depth: usize,
) -> Result<Location<'data>>
{
    match encoded {
        EncodedLocation::Null => Ok(Location::Null),
        EncodedLocation::Rva(address) => Ok(Location::Address(*address)),
        EncodedLocation::Register(reg) => Ok(Location::Register(*reg)),
        EncodedLocation::RegisterRelative { reg, offset } => {
            let base = ctx
                .regs
                .read_register(ctx.arch, *reg)
                .map_err(|err| register_error(*reg, err))?;
            Ok(Location::Address(base.wrapping_add_signed(*offset)))
        }
        EncodedLocation::Expr(expr) => evaluate_expr(expr, ctx, depth),
        EncodedLocation::LocList { entries, template } => {
            let Some(entry) = select_entry(entries, ctx.pc) else {
                trace!(pc = ctx.pc, "no location list entry covers pc");
                return Ok(Location::Null);
            };
            evaluate_expr(&template.with_ops(entry.ops), ctx, depth)
        }
    }
}

fn select_entry<'e, 'data>(entries: &'e [LocListEntry<'data>], pc: u64) -> Option<&'e LocListEntry<'data>>
{
    entries
        .iter()
        .find(|entry| !entry.is_default() && entry.range.contains(pc))
        .or_else(|| entries.iter().find(|entry| entry.is_default()))
}

fn evaluate_expr<'data>(expr: &ExprLocation<'data>, ctx: &LocationContext<'_>, depth: usize) -> Result<Location<'data>>
{
    // An unavailable frame base only matters to `DW_OP_fbreg`, which then
    // reports it; a retryable failure is surfaced right away.
    let frame_base = match &expr.frame_base {
        Some(base) => match frame_base_value(base, ctx, depth + 1) {
            Ok(value) => Some(value),
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                trace!(%err, "frame base unavailable");
                None
            }
        },
        None => None,
    };

    let mut eval = EvalContext::new(ctx.arch, expr.encoding, ctx.regs, ctx.mem);
    eval.frame_base = frame_base;
    eval.cfa = ctx.cfa;
    eval.object_address = expr.object_address;
    eval.address_bias = expr.address_bias;
    eval.addr_table = expr.addr_table;
    eval.step_limit = ctx.step_limit;

    Ok(match expr::evaluate(expr.ops, &eval)? {
        ExprResult::Address(address) => Location::Address(address),
        ExprResult::Value(value) => Location::Value(value),
        ExprResult::Register(reg) => Location::Register(reg),
        ExprResult::Implicit(bytes) => Location::Implicit(bytes),
        ExprResult::Empty => Location::Null,
    })
}

fn frame_base_value(base: &EncodedLocation<'_>, ctx: &LocationContext<'_>, depth: usize) -> Result<u64>
{
    if depth > MAX_FRAME_BASE_DEPTH {
        return Err(SymError::malformed("frame base nesting too deep"));
    }
    match decode_at_depth(base, ctx, depth)? {
        Location::Address(address) | Location::Value(address) => Ok(address),
        Location::Register(reg) => ctx
            .regs
            .read_register(ctx.arch, reg)
            .map_err(|err| register_error(reg, err)),
        Location::Null => Err(SymError::Unsupported("frame base unavailable at this pc".into())),
        Location::Implicit(_) => Err(SymError::Unsupported("implicit frame base".into())),
    }
}
