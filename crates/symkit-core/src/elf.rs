//! # ELF Symbol Tables
//!
//! Last-resort backend for images without DWARF or CodeView: function symbols
//! become procedures and data objects become globals. There are no lines,
//! locals or types.

use object::elf;
use smallvec::smallvec;
use tracing::debug;

use crate::backend::{unknown_module, BackendKind, BoxIter, DebugInfo, ModuleIndex};
use crate::config::LoadOptions;
use crate::cursor::{cstr_at, BinaryCursor};
use crate::error::{Result, SymError};
use crate::image::SectionProvider;
use crate::line_table::LineTable;
use crate::location::EncodedLocation;
use crate::types::{AddrRange, Arch, Member, Module, ModuleId, Proc, Type, TypeRef, Var, VarKind};

const MODULE: ModuleId = ModuleId(0);

/// Symbol and string table bytes
#[derive(Debug, Clone, Copy)]
pub struct SymbolTable<'data>
{
    /// `.symtab` or `.dynsym`
    pub name: &'static str,
    pub symbols: &'data [u8],
    pub strings: &'data [u8],
}

impl<'data> SymbolTable<'data>
{
    /// `.symtab`, or `.dynsym` for stripped images.
    pub fn load(provider: &dyn SectionProvider<'data>) -> Option<Self>
    {
        [(".symtab", ".strtab"), (".dynsym", ".dynstr")]
            .into_iter()
            .find_map(|(symbols, strings)| {
                let table = provider.section(symbols).filter(|section| !section.data.is_empty())?;
                Some(Self {
                    name: symbols,
                    symbols: table.data,
                    strings: provider.section(strings).map_or(&[][..], |section| section.data),
                })
            })
    }
}

/// One decoded `ElfN_Sym`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSymbol
{
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: u8,
    pub section: u16,
}

impl ElfSymbol
{
    fn is_defined(&self) -> bool
    {
        self.section != elf::SHN_UNDEF
    }
}

/// Decode every entry of `table`. ELF32 layout is used for 4-byte pointers.
pub fn parse_symbols(table: &SymbolTable<'_>, pointer_size: u8) -> Result<Vec<ElfSymbol>>
{
    let entry_size = if pointer_size == 8 { 24 } else { 16 };
    if table.symbols.len() % entry_size != 0 {
        debug!(
            table = table.name,
            trailing = table.symbols.len() % entry_size,
            "symbol table has a partial entry"
        );
    }
    let mut cursor = BinaryCursor::new(table.symbols);
    let mut symbols = Vec::with_capacity(table.symbols.len() / entry_size);
    while cursor.remaining() >= entry_size {
        let name_offset = cursor.read_u32()?;
        let (info, section, value, size) = if pointer_size == 8 {
            let info = cursor.read_u8()?;
            let _other = cursor.read_u8()?;
            let section = cursor.read_u16()?;
            (info, section, cursor.read_u64()?, cursor.read_u64()?)
        } else {
            let value = u64::from(cursor.read_u32()?);
            let size = u64::from(cursor.read_u32()?);
            let info = cursor.read_u8()?;
            let _other = cursor.read_u8()?;
            (info, cursor.read_u16()?, value, size)
        };
        let name = match cstr_at(table.strings, u64::from(name_offset)) {
            Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Err(_) => String::new(),
        };
        symbols.push(ElfSymbol {
            name,
            value,
            size,
            kind: info & 0xf,
            section,
        });
    }
    Ok(symbols)
}

/// Symbol-table backend: one module covering the whole image
pub struct ElfSymtabBackend<'data>
{
    modules: Vec<Module>,
    index: ModuleIndex<'data>,
    globals: Vec<Var<'data>>,
    arch: Arch,
}

impl<'data> ElfSymtabBackend<'data>
{
    /// Fails with [`SymError::NoDebugInfo`] when the table defines neither
    /// functions nor objects.
    pub fn new(table: SymbolTable<'data>, arch: Arch, options: LoadOptions) -> Result<Self>
    {
        let symbols = parse_symbols(&table, arch.pointer_size())?;

        let mut procs: Vec<Proc<'data>> = symbols
            .iter()
            .enumerate()
            .filter(|(_, symbol)| symbol.kind == elf::STT_FUNC && symbol.size != 0 && symbol.is_defined())
            .map(|(index, symbol)| {
                let range = AddrRange::new(symbol.value, symbol.value.wrapping_add(symbol.size));
                Proc {
                    name: symbol.name.clone(),
                    module: MODULE,
                    range,
                    debug_range: range,
                    pieces: smallvec![range],
                    ty: None,
                    frame_base: EncodedLocation::Null,
                    locator: index as u64,
                }
            })
            .collect();
        // Aliases share one range; keep the first name.
        procs.sort_by_key(|proc| (proc.range.lo, proc.range.hi));
        procs.dedup_by_key(|proc| (proc.range.lo, proc.range.hi));

        let globals: Vec<Var<'data>> = symbols
            .iter()
            .filter(|symbol| symbol.kind == elf::STT_OBJECT && symbol.is_defined())
            .map(|symbol| Var {
                name: symbol.name.clone(),
                kind: VarKind::Global,
                ty: None,
                location: EncodedLocation::Rva(symbol.value),
            })
            .collect();

        if procs.is_empty() && globals.is_empty() {
            return Err(SymError::NoDebugInfo);
        }
        debug!(table = table.name, procs = procs.len(), globals = globals.len(), "loaded ELF symbols");

        Ok(Self {
            modules: vec![Module {
                id: MODULE,
                name: table.name.to_string(),
                comp_dir: None,
                producer: None,
                language: None,
            }],
            index: ModuleIndex::build(procs, LineTable::default(), options.pool_limit)?,
            globals,
            arch,
        })
    }

    fn check_module(module: ModuleId) -> Result<()>
    {
        if module == MODULE {
            Ok(())
        } else {
            Err(unknown_module(module))
        }
    }
}

impl<'data> DebugInfo<'data> for ElfSymtabBackend<'data>
{
    fn kind(&self) -> BackendKind
    {
        BackendKind::ElfSymtab
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
        Ok(&self.index)
    }

    fn globals(&self, module: ModuleId) -> Result<Vec<Var<'data>>>
    {
        Self::check_module(module)?;
        Ok(self.globals.clone())
    }

    fn locals(&self, _proc: &Proc<'data>) -> Result<Vec<Var<'data>>>
    {
        Ok(Vec::new())
    }

    fn types(&self, module: ModuleId) -> Result<Vec<TypeRef>>
    {
        Self::check_module(module)?;
        Ok(Vec::new())
    }

    fn resolve_type(&self, reference: TypeRef) -> Result<Type>
    {
        Err(SymError::InvalidUsage(format!("symbol tables carry no type 0x{:x}", reference.0)))
    }

    fn members<'s>(&'s self, _reference: TypeRef) -> Result<BoxIter<'s, Member>>
    {
        Ok(Box::new(std::iter::empty()))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::SectionMap;

    const STRINGS: &[u8] = b"\0main\0counter\0main_alias\0puts\0empty\0";

    fn sym64(name: u32, kind: u8, section: u16, value: u64, size: u64) -> Vec<u8>
    {
        let mut bytes = name.to_le_bytes().to_vec();
        bytes.push(kind | (elf::STB_GLOBAL << 4));
        bytes.push(0);
        bytes.extend_from_slice(&section.to_le_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes
    }

    fn symtab64() -> Vec<u8>
    {
        let mut bytes = vec![0u8; 24];
        bytes.extend(sym64(1, elf::STT_FUNC, 1, 0x1000, 0x20));
        bytes.extend(sym64(6, elf::STT_OBJECT, 2, 0x4000, 8));
        bytes.extend(sym64(14, elf::STT_FUNC, 1, 0x1000, 0x20));
        bytes.extend(sym64(25, elf::STT_FUNC, elf::SHN_UNDEF, 0, 0));
        bytes.extend(sym64(30, elf::STT_FUNC, 1, 0x1020, 0));
        bytes
    }

    #[test]
    fn test_symtab_procs_and_globals()
    {
        let symbols = symtab64();
        let map = SectionMap::new()
            .with_section(".symtab", 0, &symbols)
            .with_section(".strtab", 0, STRINGS);
        let table = SymbolTable::load(&map).unwrap();
        let backend = ElfSymtabBackend::new(table, Arch::X86_64, LoadOptions::default()).unwrap();

        let index = backend.module_index(ModuleId(0)).unwrap();
        assert_eq!(index.procs().len(), 1);
        assert_eq!(index.proc_at(0x101f).unwrap().name, "main");
        assert!(index.proc_at(0x1020).is_none());

        let globals = backend.globals(ModuleId(0)).unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].name, "counter");
        assert_eq!(globals[0].location, EncodedLocation::Rva(0x4000));
        assert!(backend.module_index(ModuleId(1)).is_err());
    }

    #[test]
    fn test_symtab_falls_back_to_dynsym()
    {
        let symbols = symtab64();
        let map = SectionMap::new()
            .with_section(".dynsym", 0, &symbols)
            .with_section(".dynstr", 0, STRINGS);
        let table = SymbolTable::load(&map).unwrap();
        assert_eq!(table.name, ".dynsym");
        assert!(SymbolTable::load(&SectionMap::new()).is_none());
    }

    #[test]
    fn test_symtab_elf32_layout()
    {
        let mut bytes = vec![0u8; 16];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0x0804_9000u32.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.push(elf::STT_FUNC);
        bytes.push(0);
        bytes.extend_from_slice(&3u16.to_le_bytes());
        let table = SymbolTable {
            name: ".symtab",
            symbols: &bytes,
            strings: STRINGS,
        };
        let symbols = parse_symbols(&table, 4).unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[1].name, "main");
        assert_eq!(symbols[1].value, 0x0804_9000);
        assert_eq!(symbols[1].size, 0x40);
        assert_eq!(symbols[1].section, 3);
    }

    #[test]
    fn test_symtab_without_definitions()
    {
        let bytes = vec![0u8; 24];
        let table = SymbolTable {
            name: ".symtab",
            symbols: &bytes,
            strings: STRINGS,
        };
        assert!(matches!(
            ElfSymtabBackend::new(table, Arch::X86_64, LoadOptions::default()),
            Err(SymError::NoDebugInfo)
        ));
    }
}
