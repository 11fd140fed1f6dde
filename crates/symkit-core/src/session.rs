//! # Symbol Session
//!
//! The facade callers talk to. A session owns one backend, chosen once by
//! [`SymbolSession::load_debug_info`], and a load bias.
//!
//! ## Address spaces
//!
//! Backends store link-time addresses. Everything a session returns is
//! rebased (`stored + load_bias`) and every address passed in is un-rebased
//! before it reaches a backend, so no decoder ever sees the load bias.

use tracing::{debug, info, warn};

use crate::access::{MemoryAccess, RegisterAccess};
use crate::backend::{BackendKind, DebugInfo, ModuleIndex, NullBackend};
use crate::codeview::{CodeViewSections, PdbBackend};
use crate::config::{LoadOptions, UnwindLimits};
use crate::dwarf::{DwarfBackend, DwarfSections};
use crate::elf::{ElfSymtabBackend, SymbolTable};
use crate::error::{Result, Status, SymError};
use crate::image::{ProviderChain, SectionProvider};
use crate::line_table::{FileId, LineEntry, LineHit};
use crate::location::{self, EncodedLocation, Location, LocationContext};
use crate::type_graph::TypeGraph;
use crate::types::{AddrRange, Arch, Member, Module, ModuleId, Proc, Rebase, TypeRef, Var};
use crate::unwind::{self, CfiUnwinder, UnwindSource};

/// Backend search order when none is preferred
const SEARCH_ORDER: [BackendKind; 3] = [BackendKind::Pdb, BackendKind::Dwarf, BackendKind::ElfSymtab];

/// Outcome of [`SymbolSession::decode_location`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationResult<'data>
{
    Location(Location<'data>),
    /// A register or memory read asked to be retried later
    Maybe,
    Fail(SymError),
}

impl LocationResult<'_>
{
    pub fn status(&self) -> Status
    {
        match self {
            LocationResult::Location(_) => Status::Ok,
            LocationResult::Maybe => Status::Maybe,
            LocationResult::Fail(err) => Status::from(err),
        }
    }
}

impl<'data> From<Result<Location<'data>>> for LocationResult<'data>
{
    fn from(result: Result<Location<'data>>) -> Self
    {
        match result {
            Ok(location) => LocationResult::Location(location),
            Err(err) if err.is_retryable() => LocationResult::Maybe,
            Err(err) => LocationResult::Fail(err),
        }
    }
}

/// Debug information of one loaded image
pub struct SymbolSession<'data>
{
    load_bias: u64,
    backend: Box<dyn DebugInfo<'data> + 'data>,
    options: LoadOptions,
    limits: UnwindLimits,
    /// `.eh_frame` / `.debug_frame` of the image, indexed at load
    cfi: Option<CfiUnwinder<'data>>,
}

impl<'data> SymbolSession<'data>
{
    /// Session with no debug information yet.
    pub fn init(load_bias: u64) -> Self
    {
        Self {
            load_bias,
            backend: Box::new(NullBackend { arch: Arch::X86_64 }),
            options: LoadOptions::default(),
            limits: UnwindLimits::default(),
            cfi: None,
        }
    }

    #[must_use]
    pub fn with_unwind_limits(mut self, limits: UnwindLimits) -> Self
    {
        self.limits = limits;
        self
    }

    pub fn load_bias(&self) -> u64
    {
        self.load_bias
    }

    pub fn backend_kind(&self) -> BackendKind
    {
        self.backend.kind()
    }

    pub fn arch(&self) -> Arch
    {
        self.backend.arch()
    }

    pub fn unwind_limits(&self) -> &UnwindLimits
    {
        &self.limits
    }

    /// Select a backend for `providers`, searched in order as one image.
    ///
    /// Without a preference, PDB is tried first, then DWARF, then the ELF
    /// symbol table. A backend that is absent or fails to open is skipped.
    /// When none opens, the session falls back to an empty backend and the
    /// last failure (or [`SymError::NoDebugInfo`]) is returned.
    pub fn load_debug_info(&mut self, providers: &[&dyn SectionProvider<'data>], options: LoadOptions) -> Result<()>
    {
        let chain = ProviderChain::new(providers);
        let arch = chain.arch().unwrap_or_else(|| {
            debug!("image does not name its architecture, assuming x86-64");
            Arch::X86_64
        });
        self.options = options;
        // Call-frame info is used whichever symbol backend wins, or none.
        self.cfi = DwarfSections::load(&chain)
            .cfi_section(arch.pointer_size())
            .map(CfiUnwinder::new);

        let order = match options.prefer {
            Some(kind) => vec![kind],
            None => SEARCH_ORDER.to_vec(),
        };
        let mut last_error = None;
        for kind in order {
            match open_backend(kind, &chain, arch, options) {
                Ok(backend) => {
                    info!(backend = %kind, %arch, modules = backend.modules().len(), "loaded debug info");
                    self.backend = backend;
                    return Ok(());
                }
                Err(SymError::NoDebugInfo) => debug!(backend = %kind, "not present"),
                Err(err) => {
                    warn!(backend = %kind, %err, "backend failed to load");
                    last_error = Some(err);
                }
            }
        }
        self.backend = Box::new(NullBackend { arch });
        Err(last_error.unwrap_or(SymError::NoDebugInfo))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> + '_
    {
        self.backend.modules().iter()
    }

    /// Rows of `module`'s line table in address order.
    pub fn lines(&self, module: ModuleId) -> Result<impl Iterator<Item = LineEntry> + '_>
    {
        let bias = self.load_bias;
        let index = self.backend.module_index(module)?;
        Ok(index.lines().iter().map(move |entry| entry.rebase(bias)))
    }

    /// Name of `file` in `module`'s line table.
    pub fn file_name(&self, module: ModuleId, file: FileId) -> Result<Option<&str>>
    {
        Ok(self.backend.module_index(module)?.lines().file_name(file))
    }

    pub fn procs(&self, module: ModuleId) -> Result<impl Iterator<Item = Proc<'data>> + '_>
    {
        let bias = self.load_bias;
        let index = self.backend.module_index(module)?;
        Ok(index.procs().iter().map(move |proc| proc.clone().rebase(bias)))
    }

    /// Code ranges of `module`, sorted by start address.
    pub fn ranges(&self, module: ModuleId) -> Result<impl Iterator<Item = AddrRange> + '_>
    {
        let bias = self.load_bias;
        let index = self.backend.module_index(module)?;
        Ok(index
            .ranges()
            .iter()
            .map(move |entry| AddrRange::new(entry.lo, entry.hi).rebase(bias)))
    }

    pub fn members(&self, reference: TypeRef) -> Result<impl Iterator<Item = Result<Member>> + '_>
    {
        Ok(self.backend.members(reference)?.fuse())
    }

    pub fn globals(&self, module: ModuleId) -> Result<impl Iterator<Item = Var<'data>>>
    {
        let bias = self.load_bias;
        let globals = self.backend.globals(module)?;
        Ok(globals.into_iter().map(move |var| var.rebase(bias)))
    }

    /// Parameters and locals of `proc`, as returned by [`SymbolSession::procs`].
    pub fn locals(&self, proc: &Proc<'data>) -> Result<impl Iterator<Item = Var<'data>>>
    {
        let bias = self.load_bias;
        let stored = proc.clone().rebase(bias.wrapping_neg());
        let locals = self.backend.locals(&stored)?;
        Ok(locals.into_iter().map(move |var| var.rebase(bias)))
    }

    pub fn types(&self, module: ModuleId) -> Result<impl Iterator<Item = TypeRef>>
    {
        Ok(self.backend.types(module)?.into_iter())
    }

    /// Procedure covering the load address `va`.
    pub fn proc_at(&self, va: u64) -> Result<Option<Proc<'data>>>
    {
        let stored = va.wrapping_sub(self.load_bias);
        for module in self.backend.modules() {
            let Some(index) = self.usable_index(module.id)? else {
                continue;
            };
            if let Some(proc) = index.proc_at(stored) {
                return Ok(Some(proc.clone().rebase(self.load_bias)));
            }
        }
        Ok(None)
    }

    /// Line row covering the load address `va`, with the module it came from.
    pub fn line_at(&self, va: u64) -> Result<Option<(ModuleId, LineHit)>>
    {
        let stored = va.wrapping_sub(self.load_bias);
        for module in self.backend.modules() {
            let Some(index) = self.usable_index(module.id)? else {
                continue;
            };
            if let Some(hit) = index.lines().lookup(stored) {
                return Ok(Some((module.id, hit.rebase(self.load_bias))));
            }
        }
        Ok(None)
    }

    /// Index of `module`, or `None` when its debug info is unusable. Pool
    /// exhaustion is still reported.
    fn usable_index(&self, module: ModuleId) -> Result<Option<&ModuleIndex<'data>>>
    {
        match self.backend.module_index(module) {
            Ok(index) => Ok(Some(index)),
            Err(err @ SymError::ResourceExhausted(_)) => Err(err),
            Err(err) => {
                debug!(%module, %err, "skipping module");
                Ok(None)
            }
        }
    }

    /// Resolve `reference` and everything it reaches.
    pub fn resolve_type(&self, reference: TypeRef) -> Result<TypeGraph>
    {
        TypeGraph::resolve(
            self.backend.as_ref(),
            reference,
            self.options.max_type_depth,
            self.options.pool_limit,
        )
    }

    /// Decode a location returned by this session at the load address `pc`.
    pub fn decode_location(
        &self,
        encoded: &EncodedLocation<'data>,
        pc: u64,
        regs: &dyn RegisterAccess,
        mem: &dyn MemoryAccess,
    ) -> LocationResult<'data>
    {
        let mut ctx = LocationContext::new(self.arch(), pc, regs, mem);
        ctx.step_limit = self.limits.expr_steps;
        location::decode(encoded, &ctx).into()
    }

    /// Whether the loaded image carried call-frame information.
    pub fn has_call_frame_info(&self) -> bool
    {
        self.cfi.is_some()
    }

    /// Unwind one frame with the image's own call-frame information, indexed
    /// when it was loaded. The program counter in `regs` is a load address.
    ///
    /// ## Errors
    ///
    /// [`SymError::NoDebugInfo`] when the image had neither `.eh_frame` nor
    /// `.debug_frame`; otherwise as [`SymbolSession::virtual_unwind_frame`].
    pub fn unwind_frame(&self, regs: &mut dyn RegisterAccess, mem: &dyn MemoryAccess) -> Result<bool>
    {
        let cfi = self.cfi.as_ref().ok_or(SymError::NoDebugInfo)?;
        cfi.unwind_frame(self.arch(), self.load_bias, regs, mem, &self.limits)
    }

    /// Unwind one frame with this session's architecture and limits.
    pub fn virtual_unwind_frame(
        &self,
        source: UnwindSource,
        bytes: &[u8],
        image_base: u64,
        regs: &mut dyn RegisterAccess,
        mem: &dyn MemoryAccess,
    ) -> Result<bool>
    {
        unwind::virtual_unwind_frame(self.arch(), source, bytes, image_base, regs, mem, &self.limits)
    }
}

fn open_backend<'data>(
    kind: BackendKind,
    provider: &dyn SectionProvider<'data>,
    arch: Arch,
    options: LoadOptions,
) -> Result<Box<dyn DebugInfo<'data> + 'data>>
{
    match kind {
        BackendKind::Pdb => {
            let sections = CodeViewSections::load(provider).ok_or(SymError::NoDebugInfo)?;
            let segments: Vec<u64> = (1..=u16::MAX)
                .map_while(|segment| provider.segment_address(segment))
                .collect();
            Ok(Box::new(PdbBackend::new(sections, segments, arch, options)?))
        }
        BackendKind::Dwarf => {
            let sections = DwarfSections::load(provider);
            if !sections.has_debug_info() {
                return Err(SymError::NoDebugInfo);
            }
            Ok(Box::new(DwarfBackend::new(sections, arch, options)?))
        }
        BackendKind::ElfSymtab => {
            let table = SymbolTable::load(provider).ok_or(SymError::NoDebugInfo)?;
            Ok(Box::new(ElfSymtabBackend::new(table, arch, options)?))
        }
        BackendKind::Null => Ok(Box::new(NullBackend { arch })),
    }
}

#[cfg(test)]
mod tests
{
    use object::elf;

    use super::*;
    use crate::access::MemoryImage;
    use crate::image::SectionMap;
    use crate::types::RegisterFile;

    const STRINGS: &[u8] = b"\0start\0table\0";

    fn symtab() -> Vec<u8>
    {
        let mut bytes = vec![0u8; 24];
        for (name, kind, value, size) in [(1u32, elf::STT_FUNC, 0x1000u64, 0x40u64), (7, elf::STT_OBJECT, 0x3000, 16)] {
            bytes.extend_from_slice(&name.to_le_bytes());
            bytes.push(kind);
            bytes.push(0);
            bytes.extend_from_slice(&1u16.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_session_rebases_symbol_table()
    {
        let symbols = symtab();
        let map = SectionMap::new()
            .with_section(".symtab", 0, &symbols)
            .with_section(".strtab", 0, STRINGS)
            .with_arch(Arch::X86_64);
        let mut session = SymbolSession::init(0x7000_0000);
        session.load_debug_info(&[&map], LoadOptions::default()).unwrap();
        assert_eq!(session.backend_kind(), BackendKind::ElfSymtab);

        let proc = session.proc_at(0x7000_1010).unwrap().unwrap();
        assert_eq!(proc.name, "start");
        assert_eq!(proc.range, AddrRange::new(0x7000_1000, 0x7000_1040));
        assert!(session.proc_at(0x1010).unwrap().is_none());

        let ranges: Vec<_> = session.ranges(ModuleId(0)).unwrap().collect();
        assert_eq!(ranges, vec![AddrRange::new(0x7000_1000, 0x7000_1040)]);

        let global = session.globals(ModuleId(0)).unwrap().next().unwrap();
        let regs = RegisterFile::new(Arch::X86_64);
        let mem = MemoryImage::new();
        assert_eq!(
            session.decode_location(&global.location, 0x7000_1010, &regs, &mem),
            LocationResult::Location(Location::Address(0x7000_3000))
        );
    }

    #[test]
    fn test_session_without_debug_info()
    {
        let map = SectionMap::new().with_section(".text", 0x1000, &[0xc3]);
        let mut session = SymbolSession::init(0);
        assert_eq!(
            session.load_debug_info(&[&map], LoadOptions::default()),
            Err(SymError::NoDebugInfo)
        );
        assert_eq!(session.backend_kind(), BackendKind::Null);
        assert_eq!(session.modules().count(), 0);
        assert!(session.proc_at(0x1000).unwrap().is_none());
    }

    #[test]
    fn test_session_preferred_backend()
    {
        let symbols = symtab();
        let map = SectionMap::new()
            .with_section(".symtab", 0, &symbols)
            .with_section(".strtab", 0, STRINGS);
        let mut session = SymbolSession::init(0);
        let options = LoadOptions {
            prefer: Some(BackendKind::Dwarf),
            ..LoadOptions::default()
        };
        assert!(session.load_debug_info(&[&map], options).is_err());
        assert_eq!(session.backend_kind(), BackendKind::Null);
    }

    #[test]
    fn test_location_result_maps_retry()
    {
        let maybe: LocationResult<'_> = Err(SymError::Maybe("page not resident".into())).into();
        assert_eq!(maybe, LocationResult::Maybe);
        assert_eq!(maybe.status(), Status::Maybe);
        let fail: LocationResult<'_> = Err(SymError::MemoryReadFailed(0x10)).into();
        assert_eq!(fail.status(), Status::MemoryReadFailed);
    }
}
