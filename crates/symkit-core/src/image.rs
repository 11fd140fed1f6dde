//! # Section Providers
//!
//! The library never parses container headers itself. Backends see an image
//! as a set of named byte ranges plus a load base, supplied through
//! [`SectionProvider`].
//!
//! - [`SectionMap`]: explicit `(name, address, bytes)` triples
//! - [`ObjectImage`]: sections pulled out of an ELF, Mach-O or PE/COFF file by
//!   the `object` crate
//! - [`ProviderChain`]: several providers searched in order (a stripped
//!   binary plus its separate debug file)

use std::borrow::Cow;

use object::{Object, ObjectSection, ObjectSymbol};
use tracing::debug;

use crate::error::{Result, SymError};
use crate::types::Arch;

/// One named byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'data>
{
    pub name: &'data str,
    /// Link-time virtual address of the first byte (0 for non-allocated sections)
    pub address: u64,
    pub data: &'data [u8],
}

/// Source of section bytes
pub trait SectionProvider<'data>
{
    /// Section called `name`, using ELF spelling (`.debug_info`, `.eh_frame`).
    fn section(&self, name: &str) -> Option<Section<'data>>;

    /// Preferred load address of the image, when the container records one.
    fn load_base(&self) -> u64
    {
        0
    }

    /// Target architecture, when known.
    fn arch(&self) -> Option<Arch>
    {
        None
    }

    /// Link-time address of the 1-based section number `segment`, as used by
    /// CodeView `segment:offset` pairs.
    fn segment_address(&self, _segment: u16) -> Option<u64>
    {
        None
    }
}

/// In-memory provider built from explicit sections
#[derive(Debug, Clone, Default)]
pub struct SectionMap<'data>
{
    sections: Vec<Section<'data>>,
    load_base: u64,
    arch: Option<Arch>,
}

impl<'data> SectionMap<'data>
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a section at link-time address `address`, replacing one with the same name.
    #[must_use]
    pub fn with_section(mut self, name: &'data str, address: u64, data: &'data [u8]) -> Self
    {
        self.insert(name, address, data);
        self
    }

    pub fn insert(&mut self, name: &'data str, address: u64, data: &'data [u8])
    {
        self.sections.retain(|section| section.name != name);
        self.sections.push(Section { name, address, data });
    }

    #[must_use]
    pub fn with_arch(mut self, arch: Arch) -> Self
    {
        self.arch = Some(arch);
        self
    }

    #[must_use]
    pub fn with_load_base(mut self, load_base: u64) -> Self
    {
        self.load_base = load_base;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section<'data>> + '_
    {
        self.sections.iter()
    }
}

impl<'data> SectionProvider<'data> for SectionMap<'data>
{
    fn section(&self, name: &str) -> Option<Section<'data>>
    {
        self.sections.iter().find(|section| section.name == name).copied()
    }

    fn load_base(&self) -> u64
    {
        self.load_base
    }

    fn arch(&self) -> Option<Arch>
    {
        self.arch
    }

    fn segment_address(&self, segment: u16) -> Option<u64>
    {
        let index = usize::from(segment).checked_sub(1)?;
        self.sections.get(index).map(|section| section.address)
    }
}

/// Providers searched in order; the first one that has a section wins
pub struct ProviderChain<'a, 'data>
{
    providers: &'a [&'a dyn SectionProvider<'data>],
}

impl<'a, 'data> ProviderChain<'a, 'data>
{
    pub fn new(providers: &'a [&'a dyn SectionProvider<'data>]) -> Self
    {
        Self { providers }
    }
}

impl<'data> SectionProvider<'data> for ProviderChain<'_, 'data>
{
    fn section(&self, name: &str) -> Option<Section<'data>>
    {
        self.providers.iter().find_map(|provider| provider.section(name))
    }

    fn load_base(&self) -> u64
    {
        self.providers.first().map_or(0, |provider| provider.load_base())
    }

    fn arch(&self) -> Option<Arch>
    {
        self.providers.iter().find_map(|provider| provider.arch())
    }

    fn segment_address(&self, segment: u16) -> Option<u64>
    {
        self.providers.iter().find_map(|provider| provider.segment_address(segment))
    }
}

struct OwnedSection<'data>
{
    name: String,
    address: u64,
    data: Cow<'data, [u8]>,
}

/// Sections of an object file parsed by the `object` crate
///
/// Compressed sections (`SHF_COMPRESSED`, `.zdebug_*`) are inflated once at
/// parse time; everything else borrows the file bytes. Mach-O `__debug_*`
/// and `__eh_frame` names are exposed under their ELF spelling.
pub struct ObjectImage<'data>
{
    sections: Vec<OwnedSection<'data>>,
    arch: Option<Arch>,
    load_base: u64,
    /// Function symbol count, for diagnostics
    symbols: usize,
}

fn elf_spelling(name: &str) -> Cow<'_, str>
{
    if let Some(rest) = name.strip_prefix("__") {
        return Cow::Owned(format!(".{rest}"));
    }
    if let Some(rest) = name.strip_prefix(".zdebug_") {
        return Cow::Owned(format!(".debug_{rest}"));
    }
    Cow::Borrowed(name)
}

fn arch_of(architecture: object::Architecture) -> Option<Arch>
{
    match architecture {
        object::Architecture::X86_64 => Some(Arch::X86_64),
        object::Architecture::I386 => Some(Arch::X86),
        object::Architecture::Aarch64 => Some(Arch::Arm64),
        _ => None,
    }
}

impl<'data> ObjectImage<'data>
{
    /// Parse `data` as an object file.
    pub fn parse(data: &'data [u8]) -> Result<Self>
    {
        let file = object::File::parse(data)
            .map_err(|err| SymError::malformed(format!("object file: {err}")))?;
        if !file.is_little_endian() {
            return Err(SymError::Unsupported("big-endian images".into()));
        }

        let mut sections = Vec::new();
        for section in file.sections() {
            let name = section.name().unwrap_or_default();
            // Unreadable sections stay as empty placeholders so section
            // numbers keep matching the container's.
            let data = section.uncompressed_data().unwrap_or_else(|err| {
                debug!(name, %err, "section data unreadable");
                Cow::Borrowed(&[])
            });
            sections.push(OwnedSection {
                name: elf_spelling(name).into_owned(),
                address: section.address(),
                data,
            });
        }

        let symbols = file
            .symbols()
            .filter(|symbol| symbol.kind() == object::SymbolKind::Text)
            .count();
        debug!(sections = sections.len(), symbols, "parsed object image");

        Ok(Self {
            sections,
            arch: arch_of(file.architecture()),
            load_base: file.relative_address_base(),
            symbols,
        })
    }

    /// Borrowing view usable as a [`SectionProvider`].
    pub fn section_map(&self) -> SectionMap<'_>
    {
        let mut map = SectionMap::new().with_load_base(self.load_base);
        map.arch = self.arch;
        // Pushed directly: duplicate names must not shift section numbers.
        map.sections.extend(self.sections.iter().map(|section| Section {
            name: &section.name,
            address: section.address,
            data: &section.data,
        }));
        map
    }

    pub fn arch(&self) -> Option<Arch>
    {
        self.arch
    }

    pub fn load_base(&self) -> u64
    {
        self.load_base
    }

    pub fn symbol_count(&self) -> usize
    {
        self.symbols
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_section_map_lookup_and_replace()
    {
        let map = SectionMap::new()
            .with_section(".text", 0x1000, &[0x90])
            .with_section(".text", 0x2000, &[0xc3])
            .with_arch(Arch::X86_64);
        let text = map.section(".text").unwrap();
        assert_eq!(text.address, 0x2000);
        assert_eq!(text.data, &[0xc3]);
        assert!(map.section(".data").is_none());
        assert_eq!(map.arch(), Some(Arch::X86_64));
        assert_eq!(map.segment_address(1), Some(0x2000));
        assert_eq!(map.segment_address(0), None);
    }

    #[test]
    fn test_provider_chain_prefers_first()
    {
        let binary = SectionMap::new().with_section(".eh_frame", 0x10, &[1]).with_load_base(0x40_0000);
        let debug = SectionMap::new()
            .with_section(".eh_frame", 0x20, &[2])
            .with_section(".debug_info", 0, &[3])
            .with_arch(Arch::Arm64);
        let providers: [&dyn SectionProvider<'_>; 2] = [&binary, &debug];
        let chain = ProviderChain::new(&providers);
        assert_eq!(chain.section(".eh_frame").unwrap().data, &[1]);
        assert_eq!(chain.section(".debug_info").unwrap().data, &[3]);
        assert_eq!(chain.load_base(), 0x40_0000);
        assert_eq!(chain.arch(), Some(Arch::Arm64));
    }

    #[test]
    fn test_elf_spelling()
    {
        assert_eq!(elf_spelling("__debug_info"), ".debug_info");
        assert_eq!(elf_spelling(".zdebug_line"), ".debug_line");
        assert_eq!(elf_spelling(".symtab"), ".symtab");
    }

    #[test]
    fn test_object_image_rejects_garbage()
    {
        assert!(ObjectImage::parse(b"not an object").is_err());
    }
}
