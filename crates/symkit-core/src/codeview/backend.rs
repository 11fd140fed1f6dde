//! CodeView implementation of [`DebugInfo`]: the whole `.debug$S` stream is
//! one module.

use once_cell::unsync::OnceCell;
use tracing::{debug, warn};

use super::lines::{build_lines, FileTables};
use super::symbols::{collect_globals, collect_procs, compile_info, proc_locals, segment_address};
use super::types::TypeStream;
use super::{subsection, CodeViewSections, Subsection, Subsections};
use crate::backend::{unknown_module, BackendKind, BoxIter, DebugInfo, ModuleIndex};
use crate::config::LoadOptions;
use crate::error::{Result, SymError};
use crate::line_table::LineTable;
use crate::types::{Arch, Member, Module, ModuleId, Proc, Type, TypeRef, Var};

const MODULE: ModuleId = ModuleId(0);

/// PDB backend over extracted CodeView streams
pub struct PdbBackend<'data>
{
    subsections: Vec<Subsection<'data>>,
    tables: FileTables<'data>,
    types: TypeStream<'data>,
    /// Link-time address of each 1-based segment, by `segment - 1`
    segments: Vec<u64>,
    modules: Vec<Module>,
    index: OnceCell<ModuleIndex<'data>>,
    arch: Arch,
    options: LoadOptions,
}

impl<'data> PdbBackend<'data>
{
    /// Decode the subsection directory and index the type stream.
    ///
    /// Fails with [`SymError::NoDebugInfo`] when `.debug$S` holds neither
    /// symbols nor line blocks.
    pub fn new(sections: CodeViewSections<'data>, segments: Vec<u64>, arch: Arch, options: LoadOptions) -> Result<Self>
    {
        let subsections = Subsections::new(sections.symbols)?.collect::<Result<Vec<_>>>()?;
        if !subsections
            .iter()
            .any(|sub| matches!(sub.kind, subsection::SYMBOLS | subsection::LINES))
        {
            return Err(SymError::NoDebugInfo);
        }
        let types = TypeStream::new(sections.types, arch.pointer_size())?;
        let info = compile_info(&subsections);
        let module = Module {
            id: MODULE,
            name: info.object.unwrap_or_else(|| "<codeview>".to_string()),
            comp_dir: None,
            producer: None,
            language: info.language,
        };
        debug!(subsections = subsections.len(), types = types.len(), segments = segments.len(), "loaded CodeView");

        let backend = Self {
            tables: FileTables::new(&subsections),
            subsections,
            types,
            segments,
            modules: vec![module],
            index: OnceCell::new(),
            arch,
            options,
        };
        if options.eager_indices {
            if let Err(err) = backend.module_index(MODULE) {
                warn!(%err, "failed to index CodeView module");
            }
        }
        Ok(backend)
    }

    fn check_module(module: ModuleId) -> Result<()>
    {
        if module == MODULE {
            Ok(())
        } else {
            Err(unknown_module(module))
        }
    }

    fn build_index(&self) -> Result<ModuleIndex<'data>>
    {
        let procs = collect_procs(&self.subsections, &self.segments, MODULE)?;
        let mut builder = LineTable::builder();
        let segment_base = |segment| segment_address(&self.segments, segment, 0);
        if let Err(err) = build_lines(&self.subsections, &self.tables, segment_base, &mut builder) {
            warn!(%err, "no CodeView line blocks could be decoded");
        }
        ModuleIndex::build(procs, builder.finish(), self.options.pool_limit)
    }
}

impl<'data> DebugInfo<'data> for PdbBackend<'data>
{
    fn kind(&self) -> BackendKind
    {
        BackendKind::Pdb
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
        Self::check_module(module)?;
        self.index.get_or_try_init(|| self.build_index())
    }

    fn globals(&self, module: ModuleId) -> Result<Vec<Var<'data>>>
    {
        Self::check_module(module)?;
        collect_globals(&self.subsections, &self.segments)
    }

    fn locals(&self, proc: &Proc<'data>) -> Result<Vec<Var<'data>>>
    {
        proc_locals(&self.subsections, proc.locator, self.arch)
    }

    fn types(&self, module: ModuleId) -> Result<Vec<TypeRef>>
    {
        Self::check_module(module)?;
        Ok(self.types.named_types())
    }

    fn resolve_type(&self, reference: TypeRef) -> Result<Type>
    {
        self.types.resolve(reference)
    }

    fn members<'s>(&'s self, reference: TypeRef) -> Result<BoxIter<'s, Member>>
    {
        Ok(Box::new(self.types.members(reference)?))
    }
}
