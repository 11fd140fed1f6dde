//! Load and unwind tunables.

use crate::arena::DEFAULT_POOL_LIMIT;
use crate::backend::BackendKind;
use crate::dwarf::expr::DEFAULT_STEP_LIMIT;

/// Options for [`SymbolSession::load_debug_info`](crate::session::SymbolSession::load_debug_info)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions
{
    /// Use this backend instead of trying PDB, DWARF and symbol tables in turn
    pub prefer: Option<BackendKind>,
    /// Build every module's procedure and line index during the load instead
    /// of on first use
    pub eager_indices: bool,
    /// Capacity of each per-module pool
    pub pool_limit: usize,
    /// Maximum breadth-first depth when resolving a type graph
    pub max_type_depth: usize,
}

impl Default for LoadOptions
{
    fn default() -> Self
    {
        Self {
            prefer: None,
            eager_indices: false,
            pool_limit: DEFAULT_POOL_LIMIT,
            max_type_depth: 64,
        }
    }
}

/// Bounds applied while unwinding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindLimits
{
    /// `DW_CFA_remember_state` nesting
    pub remember_depth: usize,
    /// Chained `UNWIND_INFO` records followed
    pub nt_chain_depth: usize,
    /// Instructions decoded by the epilogue peephole
    pub epilogue_instructions: usize,
    /// Operations per CFI expression
    pub expr_steps: usize,
}

impl Default for UnwindLimits
{
    fn default() -> Self
    {
        Self {
            remember_depth: 16,
            nt_chain_depth: 32,
            epilogue_instructions: 32,
            expr_steps: DEFAULT_STEP_LIMIT,
        }
    }
}
