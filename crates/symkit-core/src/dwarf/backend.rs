//! DWARF implementation of [`DebugInfo`]: one module per compile unit.

use once_cell::unsync::OnceCell;
use tracing::{debug, warn};

use super::line::build_line_table;
use super::symbols::{proc_locals, unit_globals, unit_procs, unit_types};
use super::ty::{infer_type, MemberIter};
use super::unit::{DwarfUnits, UnitRef};
use super::DwarfSections;
use crate::backend::{unknown_module, BackendKind, BoxIter, DebugInfo, ModuleIndex};
use crate::config::LoadOptions;
use crate::error::{Result, SymError};
use crate::line_table::LineTable;
use crate::types::{Arch, Member, Module, ModuleId, Proc, Type, TypeRef, Var};

/// DWARF backend
pub struct DwarfBackend<'data>
{
    units: DwarfUnits<'data>,
    modules: Vec<Module>,
    indices: Vec<OnceCell<ModuleIndex<'data>>>,
    arch: Arch,
    options: LoadOptions,
}

fn lossy(bytes: Option<&[u8]>) -> Option<String>
{
    bytes.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

impl<'data> DwarfBackend<'data>
{
    /// Open every unit in `sections`.
    ///
    /// Fails with [`SymError::NoDebugInfo`] when no unit could be opened.
    pub fn new(sections: DwarfSections<'data>, arch: Arch, options: LoadOptions) -> Result<Self>
    {
        let units = DwarfUnits::new(sections);
        if units.is_empty() {
            return Err(SymError::NoDebugInfo);
        }
        let modules: Vec<Module> = units
            .iter()
            .enumerate()
            .map(|(index, unit)| Module {
                id: ModuleId(index as u32),
                name: lossy(unit.unit.name).unwrap_or_else(|| format!("<unit 0x{:x}>", unit.unit.header.offset)),
                comp_dir: lossy(unit.unit.comp_dir),
                producer: lossy(unit.unit.producer),
                language: unit.unit.language,
            })
            .collect();
        debug!(modules = modules.len(), "loaded DWARF");

        let backend = Self {
            indices: modules.iter().map(|_| OnceCell::new()).collect(),
            units,
            modules,
            arch,
            options,
        };
        if options.eager_indices {
            for module in &backend.modules {
                if let Err(err) = backend.module_index(module.id) {
                    warn!(module = %module.id, %err, "failed to index module");
                }
            }
        }
        Ok(backend)
    }

    pub fn units(&self) -> &DwarfUnits<'data>
    {
        &self.units
    }

    fn unit(&self, module: ModuleId) -> Result<UnitRef<'_, 'data>>
    {
        self.units
            .get(module.0 as usize)
            .ok_or_else(|| unknown_module(module))
    }

    fn build_index(&self, module: ModuleId) -> Result<ModuleIndex<'data>>
    {
        let unit = self.unit(module)?;
        let procs = unit_procs(&self.units, &unit, module)?;

        let mut builder = LineTable::builder();
        if let Err(err) = build_line_table(&unit, &mut builder) {
            // Rows from the sequences decoded before the failure are kept.
            warn!(%module, %err, "line program decoding stopped early");
        }
        ModuleIndex::build(procs, builder.finish(), self.options.pool_limit)
    }
}

impl<'data> DebugInfo<'data> for DwarfBackend<'data>
{
    fn kind(&self) -> BackendKind
    {
        BackendKind::Dwarf
    }

    fn arch(&self) -> Arch
    {
        self.arch
    }

    fn modules(&self) -> &[Module]
    {
        &self.modules
    }

    fn module_index(&self, module: ModuleId) -> Result<&ModuleIndex<'data>>
    {
        let cell = self
            .indices
            .get(module.0 as usize)
            .ok_or_else(|| unknown_module(module))?;
        cell.get_or_try_init(|| self.build_index(module))
    }

    fn globals(&self, module: ModuleId) -> Result<Vec<Var<'data>>>
    {
        let unit = self.unit(module)?;
        unit_globals(&self.units, &unit)
    }

    fn locals(&self, proc: &Proc<'data>) -> Result<Vec<Var<'data>>>
    {
        proc_locals(&self.units, proc.locator)
    }

    fn types(&self, module: ModuleId) -> Result<Vec<TypeRef>>
    {
        unit_types(&self.unit(module)?)
    }

    fn resolve_type(&self, reference: TypeRef) -> Result<Type>
    {
        infer_type(&self.units, reference)
    }

    fn members<'s>(&'s self, reference: TypeRef) -> Result<BoxIter<'s, Member>>
    {
        Ok(Box::new(MemberIter::new(&self.units, reference)?))
    }
}
