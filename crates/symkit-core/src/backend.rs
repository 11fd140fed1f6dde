//! # Backends
//!
//! Each debug format implements [`DebugInfo`]. The session selects one
//! implementation at load time and talks to it only through this trait, so
//! format checks never leak into the query paths.
//!
//! Backends work exclusively in the stored address space; the session rebases
//! everything they return.

use std::fmt;

use tracing::debug;

use crate::arena::{Id, Pool};
use crate::error::{Result, SymError};
use crate::line_table::LineTable;
use crate::range_map::{RangeEntry, RangeMap};
use crate::types::{Arch, Member, Module, ModuleId, Proc, Type, TypeRef, Var};

/// Which debug format a backend decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind
{
    Pdb,
    Dwarf,
    ElfSymtab,
    Null,
}

impl fmt::Display for BackendKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            BackendKind::Pdb => "pdb",
            BackendKind::Dwarf => "dwarf",
            BackendKind::ElfSymtab => "elf-symtab",
            BackendKind::Null => "null",
        })
    }
}

/// Fallible iterator returned by backends
pub type BoxIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Procedure pool, range map and line table of one module
#[derive(Debug, Default)]
pub struct ModuleIndex<'data>
{
    procs: Pool<Proc<'data>>,
    ranges: RangeMap<Id<Proc<'data>>>,
    lines: LineTable,
}

impl<'data> ModuleIndex<'data>
{
    /// Index `procs` and attach `lines`.
    ///
    /// On pool exhaustion the partially built pool is rolled back and the
    /// error is returned.
    pub fn build(procs: Vec<Proc<'data>>, lines: LineTable, pool_limit: usize) -> Result<Self>
    {
        let mut pool = Pool::with_limit(pool_limit);
        let mark = pool.begin_frame();
        let mut entries = Vec::with_capacity(procs.len());
        for proc in procs {
            let pieces = proc.pieces.clone();
            let id = match pool.push(proc) {
                Ok(id) => id,
                Err(err) => {
                    pool.end_frame(mark);
                    return Err(err);
                }
            };
            entries.extend(pieces.iter().map(|piece| RangeEntry {
                lo: piece.lo,
                hi: piece.hi,
                value: id,
            }));
        }
        let ranges = RangeMap::new(entries);
        debug!(procs = pool.len(), ranges = ranges.len(), lines = lines.len(), "built module index");
        Ok(Self {
            procs: pool,
            ranges,
            lines,
        })
    }

    pub fn procs(&self) -> &[Proc<'data>]
    {
        self.procs.as_slice()
    }

    pub fn ranges(&self) -> &RangeMap<Id<Proc<'data>>>
    {
        &self.ranges
    }

    pub fn lines(&self) -> &LineTable
    {
        &self.lines
    }

    pub fn proc(&self, id: Id<Proc<'data>>) -> Option<&Proc<'data>>
    {
        self.procs.get(id)
    }

    /// Procedure whose code covers the stored address `address`.
    pub fn proc_at(&self, address: u64) -> Option<&Proc<'data>>
    {
        self.ranges.lookup(address).and_then(|id| self.procs.get(id))
    }
}

/// Capability set shared by every debug format
pub trait DebugInfo<'data>
{
    fn kind(&self) -> BackendKind;

    fn arch(&self) -> Arch;

    fn modules(&self) -> &[Module];

    /// Procedure and line index of `module`, built on first use.
    fn module_index(&self, module: ModuleId) -> Result<&ModuleIndex<'data>>;

    /// Variables with static storage in `module`.
    fn globals(&self, module: ModuleId) -> Result<Vec<Var<'data>>>;

    /// Parameters and locals of `proc`.
    ///
    /// `proc` is the backend's own record (stored addresses).
    fn locals(&self, proc: &Proc<'data>) -> Result<Vec<Var<'data>>>;

    /// Named types defined in `module`.
    fn types(&self, module: ModuleId) -> Result<Vec<TypeRef>>;

    /// Resolve one level of `reference`.
    fn resolve_type(&self, reference: TypeRef) -> Result<Type>;

    /// Members of the aggregate, enum or procedure type `reference`.
    fn members<'s>(&'s self, reference: TypeRef) -> Result<BoxIter<'s, Member>>;
}

/// Backend with no modules, selected when nothing could be loaded
#[derive(Debug, Clone, Copy)]
pub struct NullBackend
{
    pub arch: Arch,
}

impl<'data> DebugInfo<'data> for NullBackend
{
    fn kind(&self) -> BackendKind
    {
        BackendKind::Null
    }

    fn arch(&self) -> Arch
    {
        self.arch
    }

    fn modules(&self) -> &[Module]
    {
        &[]
    }

    fn module_index(&self, module: ModuleId) -> Result<&ModuleIndex<'data>>
    {
        Err(unknown_module(module))
    }

    fn globals(&self, module: ModuleId) -> Result<Vec<Var<'data>>>
    {
        Err(unknown_module(module))
    }

    fn locals(&self, _proc: &Proc<'data>) -> Result<Vec<Var<'data>>>
    {
        Ok(Vec::new())
    }

    fn types(&self, module: ModuleId) -> Result<Vec<TypeRef>>
    {
        Err(unknown_module(module))
    }

    fn resolve_type(&self, reference: TypeRef) -> Result<Type>
    {
        Err(SymError::InvalidUsage(format!(
            "type 0x{:x} without debug info",
            reference.0
        )))
    }

    fn members<'s>(&'s self, _reference: TypeRef) -> Result<BoxIter<'s, Member>>
    {
        Ok(Box::new(std::iter::empty()))
    }
}

/// Error for a module id the backend never reported.
pub(crate) fn unknown_module(module: ModuleId) -> SymError
{
    SymError::InvalidUsage(format!("unknown {module}"))
}
