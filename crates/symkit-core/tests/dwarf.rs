//! Tests for DWARF symbol, line and type resolution through a session

use symkit_core::image::SectionMap;
use symkit_core::type_graph::TypeGraph;
use symkit_core::types::{MemberKind, TypeKind};
use symkit_core::{Arch, BackendKind, LoadOptions, ModuleId, SymbolSession, TypeRef};

const BIAS: u64 = 0x5500_0000;

/// compile_unit, subprogram, pointer_type, structure_type, member
const ABBREV: &[u8] = &[
    0x01, 0x11, 0x01, 0x03, 0x08, 0x10, 0x17, 0x11, 0x01, 0x00, 0x00, //
    0x02, 0x2e, 0x00, 0x03, 0x08, 0x11, 0x01, 0x12, 0x06, 0x00, 0x00, //
    0x03, 0x0f, 0x00, 0x0b, 0x0b, 0x49, 0x13, 0x00, 0x00, //
    0x04, 0x13, 0x01, 0x03, 0x08, 0x0b, 0x0b, 0x00, 0x00, //
    0x05, 0x0d, 0x00, 0x03, 0x08, 0x49, 0x13, 0x38, 0x0b, 0x00, 0x00, //
    0x00,
];

/// A DWARF 4 unit under construction; offsets are unit-relative.
struct Unit
{
    bytes: Vec<u8>,
}

impl Unit
{
    fn new() -> Self
    {
        let mut bytes = vec![0; 4];
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(8);
        Self { bytes }
    }

    fn offset(&self) -> u32
    {
        self.bytes.len() as u32
    }

    fn code(&mut self, code: u8) -> &mut Self
    {
        self.bytes.push(code);
        self
    }

    fn string(&mut self, value: &str) -> &mut Self
    {
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self
    }

    fn u8(&mut self, value: u8) -> &mut Self
    {
        self.bytes.push(value);
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self
    {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self
    {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn patch_u32(&mut self, at: u32, value: u32)
    {
        let at = at as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn finish(mut self) -> Vec<u8>
    {
        let length = (self.bytes.len() - 4) as u32;
        self.patch_u32(0, length);
        self.bytes
    }
}

/// Compile unit holding one procedure `[lo, lo + len)`.
fn unit_with_proc(file: &str, line_offset: u32, proc: &str, lo: u64, len: u32) -> Unit
{
    let mut unit = Unit::new();
    unit.code(1).string(file).u32(line_offset).u64(lo);
    unit.code(2).string(proc).u64(lo).u32(len);
    unit
}

/// DWARF 4 line program for one file: two rows `lines` at `lo` and
/// `lo + step`, ending at `end`.
fn line_program(file: &str, lo: u64, lines: (u32, u32), step: u8, end: u64) -> Vec<u8>
{
    let mut header = vec![1, 1, 1, (-5i8) as u8, 14, 13];
    header.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
    header.push(0);
    header.extend_from_slice(file.as_bytes());
    header.extend_from_slice(&[0, 0, 0, 0, 0]);

    let mut program = vec![0x00, 0x09, 0x02];
    program.extend_from_slice(&lo.to_le_bytes());
    program.extend_from_slice(&[0x03, (lines.0 - 1) as u8, 0x01]);
    program.extend_from_slice(&[0x02, step, 0x03, (lines.1 - lines.0) as u8, 0x01]);
    program.extend_from_slice(&[0x02, (end - lo - u64::from(step)) as u8]);
    program.extend_from_slice(&[0x00, 0x01, 0x01]);

    let mut out = Vec::new();
    let length = 2 + 4 + header.len() + program.len();
    out.extend_from_slice(&(length as u32).to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend(header);
    out.extend(program);
    out
}

struct Image
{
    info: Vec<u8>,
    line: Vec<u8>,
    /// Section offset of the `struct node *` entry
    pointer: u64,
}

/// `alpha` in `a.c` at `[0x1000, 0x1020)` and `beta` in `b.c` at
/// `[0x2000, 0x2040)`. The first unit also declares
/// `struct node { struct node *next; }`.
fn two_unit_image() -> Image
{
    let first_line = line_program("a.c", 0x1000, (10, 12), 0x10, 0x1020);
    let second_line = line_program("b.c", 0x2000, (20, 25), 0x18, 0x2040);

    let mut first = unit_with_proc("a.c", 0, "alpha", 0x1000, 0x20);
    let pointer = first.offset();
    first.code(3).u8(8).u32(0);
    let node = first.offset();
    first.code(4).string("node").u8(8);
    first.code(5).string("next").u32(pointer).u8(0);
    first.u8(0);
    first.u8(0);
    first.patch_u32(pointer + 2, node);
    let mut info = first.finish();

    let mut second = unit_with_proc("b.c", first_line.len() as u32, "beta", 0x2000, 0x40);
    second.u8(0);
    info.extend(second.finish());

    let mut line = first_line;
    line.extend(second_line);
    Image {
        info,
        line,
        pointer: u64::from(pointer),
    }
}

fn sections(image: &Image) -> SectionMap<'_>
{
    SectionMap::new()
        .with_arch(Arch::X86_64)
        .with_section(".debug_info", 0, &image.info)
        .with_section(".debug_abbrev", 0, ABBREV)
        .with_section(".debug_line", 0, &image.line)
}

#[test]
fn test_two_units_are_recovered()
{
    let image = two_unit_image();
    let map = sections(&image);
    let mut session = SymbolSession::init(BIAS);
    session.load_debug_info(&[&map], LoadOptions::default()).unwrap();
    assert_eq!(session.backend_kind(), BackendKind::Dwarf);

    let names: Vec<_> = session.modules().map(|module| module.name.clone()).collect();
    assert_eq!(names, ["a.c", "b.c"]);

    let alpha: Vec<_> = session.procs(ModuleId(0)).unwrap().collect();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].name, "alpha");
    assert_eq!((alpha[0].range.lo, alpha[0].range.hi), (BIAS + 0x1000, BIAS + 0x1020));

    let beta: Vec<_> = session.procs(ModuleId(1)).unwrap().collect();
    assert_eq!(beta[0].name, "beta");
    assert_eq!((beta[0].range.lo, beta[0].range.hi), (BIAS + 0x2000, BIAS + 0x2040));
}

#[test]
fn test_address_queries_are_rebased()
{
    let image = two_unit_image();
    let map = sections(&image);
    let mut session = SymbolSession::init(BIAS);
    session.load_debug_info(&[&map], LoadOptions::default()).unwrap();

    assert_eq!(session.proc_at(BIAS + 0x101f).unwrap().unwrap().name, "alpha");
    assert_eq!(session.proc_at(BIAS + 0x2000).unwrap().unwrap().name, "beta");
    assert!(session.proc_at(BIAS + 0x1020).unwrap().is_none());
    assert!(session.proc_at(0x1000).unwrap().is_none());

    let (module, hit) = session.line_at(BIAS + 0x1008).unwrap().unwrap();
    assert_eq!(module, ModuleId(0));
    assert_eq!((hit.address, hit.line, hit.span), (BIAS + 0x1000, 10, 0x10));
    assert_eq!(session.file_name(module, hit.file).unwrap(), Some("a.c"));

    let (_, hit) = session.line_at(BIAS + 0x1010).unwrap().unwrap();
    assert_eq!(hit.line, 12);

    let (module, hit) = session.line_at(BIAS + 0x2020).unwrap().unwrap();
    assert_eq!(module, ModuleId(1));
    assert_eq!((hit.address, hit.line), (BIAS + 0x2018, 25));
    assert_eq!(session.file_name(module, hit.file).unwrap(), Some("b.c"));

    // Sequence terminator
    assert!(session.line_at(BIAS + 0x2040).unwrap().is_none());
}

#[test]
fn test_line_rows_are_sorted()
{
    let image = two_unit_image();
    let map = sections(&image);
    let mut session = SymbolSession::init(BIAS);
    session.load_debug_info(&[&map], LoadOptions::default()).unwrap();

    let rows: Vec<_> = session.lines(ModuleId(1)).unwrap().collect();
    let addresses: Vec<_> = rows.iter().map(|row| row.address).collect();
    assert_eq!(addresses, [BIAS + 0x2000, BIAS + 0x2018, BIAS + 0x2040]);
    assert!(rows[2].end_sequence);
}

#[test]
fn test_self_referential_type_terminates()
{
    let image = two_unit_image();
    let map = sections(&image);
    let mut session = SymbolSession::init(BIAS);
    session.load_debug_info(&[&map], LoadOptions::default()).unwrap();

    let graph = session.resolve_type(TypeRef(image.pointer)).unwrap();
    assert_eq!(graph.len(), 2);
    assert!(!graph.is_truncated());

    let pointer = graph.root_node().unwrap();
    assert_eq!(pointer.ty.kind, TypeKind::Pointer);
    assert_eq!(pointer.ty.size, 8);

    let node = graph.node(pointer.next.unwrap()).unwrap();
    assert_eq!(node.ty.kind, TypeKind::Struct);
    assert_eq!(node.ty.name.as_deref(), Some("node"));
    assert_eq!(node.members.len(), 1);
    assert_eq!(node.members[0].member.name.as_deref(), Some("next"));
    assert_eq!(node.members[0].member.kind, MemberKind::Data { offset: 0 });
    assert_eq!(node.members[0].ty, Some(graph.root()));
}

#[test]
fn test_type_listing_names_the_struct()
{
    let image = two_unit_image();
    let map = sections(&image);
    let mut session = SymbolSession::init(BIAS);
    session.load_debug_info(&[&map], LoadOptions::default()).unwrap();

    let named: Vec<_> = session
        .types(ModuleId(0))
        .unwrap()
        .filter_map(|reference| {
            let graph: TypeGraph = session.resolve_type(reference).ok()?;
            graph.root_node()?.ty.name.clone()
        })
        .collect();
    assert!(named.iter().any(|name| name == "node"));
    assert_eq!(session.types(ModuleId(1)).unwrap().count(), 0);
}

#[test]
fn test_missing_sections_fall_back_to_null_backend()
{
    let mut session = SymbolSession::init(0);
    let empty = SectionMap::new();
    assert!(session.load_debug_info(&[&empty], LoadOptions::default()).is_err());
    assert_eq!(session.backend_kind(), BackendKind::Null);
    assert_eq!(session.modules().count(), 0);
    assert!(session.proc_at(0x1000).unwrap().is_none());
}
