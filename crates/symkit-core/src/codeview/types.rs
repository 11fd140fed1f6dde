//! CodeView type records (`.debug$T`).
//!
//! Type indices below `0x1000` are built-in primitives encoded in the index
//! itself; larger indices name records in stream order. Forward-declared
//! aggregates are resolved to their definition through a name index built on
//! first use.

use std::collections::{HashMap, VecDeque};

use once_cell::unsync::OnceCell;
use tracing::debug;

use super::{read_name, read_numeric, skip_signature};
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::{Access, Member, MemberKind, Modifiers, Type, TypeKind, TypePayload, TypeRef};

/// Index of the first record in the stream
pub const FIRST_TYPE_INDEX: u32 = 0x1000;

const MAX_MODIFIER_CHAIN: usize = 64;
const MAX_FIELD_LIST_CHAIN: usize = 256;

mod lf
{
    pub const MODIFIER: u16 = 0x1001;
    pub const POINTER: u16 = 0x1002;
    pub const PROCEDURE: u16 = 0x1008;
    pub const MFUNCTION: u16 = 0x1009;
    pub const ARGLIST: u16 = 0x1201;
    pub const FIELDLIST: u16 = 0x1203;
    pub const BITFIELD: u16 = 0x1205;
    pub const METHODLIST: u16 = 0x1206;
    pub const BCLASS: u16 = 0x1400;
    pub const VBCLASS: u16 = 0x1401;
    pub const IVBCLASS: u16 = 0x1402;
    pub const INDEX: u16 = 0x1404;
    pub const VFUNCTAB: u16 = 0x1409;
    pub const ENUMERATE: u16 = 0x1502;
    pub const ARRAY: u16 = 0x1503;
    pub const CLASS: u16 = 0x1504;
    pub const STRUCTURE: u16 = 0x1505;
    pub const UNION: u16 = 0x1506;
    pub const ENUM: u16 = 0x1507;
    pub const MEMBER: u16 = 0x150d;
    pub const STMEMBER: u16 = 0x150e;
    pub const METHOD: u16 = 0x150f;
    pub const NESTTYPE: u16 = 0x1510;
    pub const ONEMETHOD: u16 = 0x1511;
}

/// `CV_prop_t::fwdref`
const PROP_FWDREF: u16 = 0x80;
/// `CV_prop_t::hasuniquename`
const PROP_UNIQUE_NAME: u16 = 0x200;

/// One type record
struct Record<'data>
{
    leaf: u16,
    body: BinaryCursor<'data>,
}

/// Common header of `LF_CLASS`, `LF_STRUCTURE`, `LF_UNION` and `LF_ENUM`
struct Udt<'data>
{
    kind: TypeKind,
    property: u16,
    field_list: u32,
    /// Underlying type of an enum
    underlying: Option<u32>,
    size: u64,
    name: &'data [u8],
    unique_name: Option<&'data [u8]>,
}

impl<'data> Udt<'data>
{
    fn parse(leaf: u16, body: &mut BinaryCursor<'data>) -> Result<Self>
    {
        let _count = body.read_u16()?;
        let property = body.read_u16()?;
        let (kind, field_list, underlying, size) = match leaf {
            lf::CLASS | lf::STRUCTURE => {
                let field_list = body.read_u32()?;
                let _derived = body.read_u32()?;
                let _vshape = body.read_u32()?;
                let kind = if leaf == lf::CLASS {
                    TypeKind::Class
                } else {
                    TypeKind::Struct
                };
                (kind, field_list, None, read_numeric(body)?)
            }
            lf::UNION => {
                let field_list = body.read_u32()?;
                (TypeKind::Union, field_list, None, read_numeric(body)?)
            }
            lf::ENUM => {
                let underlying = body.read_u32()?;
                let field_list = body.read_u32()?;
                (TypeKind::Enum, field_list, Some(underlying), 0)
            }
            other => return Err(SymError::malformed(format!("leaf 0x{other:04x} is not an aggregate"))),
        };
        let name = body.read_cstr()?;
        let unique_name = if property & PROP_UNIQUE_NAME != 0 {
            Some(body.read_cstr()?)
        } else {
            None
        };
        Ok(Self {
            kind,
            property,
            field_list,
            underlying,
            size,
            name,
            unique_name,
        })
    }

    fn is_forward(&self) -> bool
    {
        self.property & PROP_FWDREF != 0
    }

    fn key(&self) -> &'data [u8]
    {
        self.unique_name.unwrap_or(self.name)
    }
}

/// Map a CodeView access attribute to [`Access`].
fn access(attr: u16) -> Access
{
    match attr & 3 {
        1 => Access::Private,
        2 => Access::Protected,
        3 => Access::Public,
        _ => Access::None,
    }
}

/// `CV_fldattr_t::mprop`
fn method_property(attr: u16) -> u16
{
    (attr >> 2) & 7
}

fn introduces_virtual(attr: u16) -> bool
{
    matches!(method_property(attr), 4 | 6)
}

fn is_virtual(attr: u16) -> bool
{
    matches!(method_property(attr), 1 | 4 | 5 | 6)
}

/// Primitive encoded directly in a type index below `0x1000`.
fn simple_type(index: u32, pointer_size: u8) -> Result<Type>
{
    let origin = TypeRef(u64::from(index));
    let mode = (index >> 8) & 0xf;
    let base = index & 0xff;
    if mode != 0 {
        let size = match mode {
            1 => 2,
            2 | 4 => 4,
            3 | 5 => 6,
            6 => 8,
            _ => u64::from(pointer_size),
        };
        let mut ty = Type::primitive(TypeKind::Pointer, size, origin);
        ty.next = Some(TypeRef(u64::from(base)));
        return Ok(ty);
    }
    let (kind, size) = match base {
        0x00 | 0x03 => (TypeKind::Void, 0),
        0x08 | 0x12 | 0x74 => (TypeKind::Int32, 4),
        0x10 | 0x68 => (TypeKind::Int8, 1),
        0x11 | 0x72 => (TypeKind::Int16, 2),
        0x13 | 0x76 => (TypeKind::Int64, 8),
        0x14 | 0x78 => (TypeKind::Int128, 16),
        0x20 | 0x69 => (TypeKind::UInt8, 1),
        0x21 | 0x73 => (TypeKind::UInt16, 2),
        0x22 | 0x75 => (TypeKind::UInt32, 4),
        0x23 | 0x77 => (TypeKind::UInt64, 8),
        0x24 | 0x79 => (TypeKind::UInt128, 16),
        0x30 => (TypeKind::Bool, 1),
        0x31 => (TypeKind::Bool, 2),
        0x32 => (TypeKind::Bool, 4),
        0x33 => (TypeKind::Bool, 8),
        0x40 => (TypeKind::Float32, 4),
        0x41 => (TypeKind::Float64, 8),
        0x42 => (TypeKind::Float80, 10),
        0x43 => (TypeKind::Float128, 16),
        0x70 | 0x7c => (TypeKind::Char8, 1),
        0x71 | 0x7a => (TypeKind::Char16, 2),
        0x7b => (TypeKind::Char32, 4),
        other => return Err(SymError::Unsupported(format!("simple type 0x{other:02x}"))),
    };
    let mut ty = Type::primitive(kind, size, origin);
    if matches!(base, 0x10 | 0x20) {
        ty.modifiers = Modifiers::CHAR;
    }
    Ok(ty)
}

/// Indexed `.debug$T` stream
pub struct TypeStream<'data>
{
    data: &'data [u8],
    /// Offset of each record's length field, by `index - FIRST_TYPE_INDEX`
    offsets: Vec<usize>,
    pointer_size: u8,
    definitions: OnceCell<HashMap<&'data [u8], u32>>,
}

impl<'data> TypeStream<'data>
{
    /// Index every record of `data`. A truncated tail is dropped.
    pub fn new(data: &'data [u8], pointer_size: u8) -> Result<Self>
    {
        let mut cursor = BinaryCursor::new(data);
        cursor.seek(skip_signature(data, ".debug$T")?)?;
        let mut offsets = Vec::new();
        while cursor.remaining() >= 4 {
            let offset = cursor.offset();
            let length = usize::from(cursor.read_u16()?);
            if length < 2 || cursor.skip(length).is_err() {
                debug!(offset, "truncated type record");
                break;
            }
            offsets.push(offset);
        }
        debug!(records = offsets.len(), "indexed CodeView types");
        Ok(Self {
            data,
            offsets,
            pointer_size,
            definitions: OnceCell::new(),
        })
    }

    pub fn len(&self) -> usize
    {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.offsets.is_empty()
    }

    fn record(&self, index: u32) -> Result<Record<'data>>
    {
        let offset = index
            .checked_sub(FIRST_TYPE_INDEX)
            .and_then(|slot| self.offsets.get(slot as usize))
            .copied()
            .ok_or_else(|| SymError::malformed(format!("type index 0x{index:x} out of range")))?;
        let mut cursor = BinaryCursor::new(self.data);
        cursor.seek(offset)?;
        let length = usize::from(cursor.read_u16()?);
        let mut body = cursor.sub_cursor(length)?;
        let leaf = body.read_u16()?;
        Ok(Record { leaf, body })
    }

    fn index_of(reference: TypeRef) -> Result<u32>
    {
        u32::try_from(reference.0).map_err(|_| SymError::InvalidUsage(format!("type reference 0x{:x}", reference.0)))
    }

    fn definitions(&self) -> &HashMap<&'data [u8], u32>
    {
        self.definitions.get_or_init(|| {
            let mut map = HashMap::new();
            for slot in 0..self.offsets.len() {
                let index = FIRST_TYPE_INDEX + slot as u32;
                let Ok(mut record) = self.record(index) else {
                    continue;
                };
                if !matches!(record.leaf, lf::CLASS | lf::STRUCTURE | lf::UNION | lf::ENUM) {
                    continue;
                }
                if let Ok(udt) = Udt::parse(record.leaf, &mut record.body) {
                    if !udt.is_forward() {
                        map.entry(udt.key()).or_insert(index);
                    }
                }
            }
            map
        })
    }

    /// Definition of a forward-declared aggregate, or `index` itself.
    fn definition_of(&self, index: u32, udt: &Udt<'data>) -> u32
    {
        if !udt.is_forward() {
            return index;
        }
        self.definitions().get(udt.key()).copied().unwrap_or(index)
    }

    /// Named aggregate and enum definitions, in stream order.
    pub fn named_types(&self) -> Vec<TypeRef>
    {
        (0..self.offsets.len())
            .filter_map(|slot| {
                let index = FIRST_TYPE_INDEX + slot as u32;
                let mut record = self.record(index).ok()?;
                if !matches!(record.leaf, lf::CLASS | lf::STRUCTURE | lf::UNION | lf::ENUM) {
                    return None;
                }
                let udt = Udt::parse(record.leaf, &mut record.body).ok()?;
                (!udt.is_forward() && !udt.name.is_empty()).then_some(TypeRef(u64::from(index)))
            })
            .collect()
    }

    /// Resolve `reference` one level deep.
    pub fn resolve(&self, reference: TypeRef) -> Result<Type>
    {
        let mut modifiers = Modifiers::NONE;
        let mut index = Self::index_of(reference)?;
        for _ in 0..MAX_MODIFIER_CHAIN {
            if index < FIRST_TYPE_INDEX {
                let mut ty = simple_type(index, self.pointer_size)?;
                ty.modifiers.insert(modifiers);
                ty.origin = reference;
                return Ok(ty);
            }
            let mut record = self.record(index)?;
            match record.leaf {
                lf::MODIFIER => {
                    let inner = record.body.read_u32()?;
                    let attr = record.body.read_u16()?;
                    modifiers.insert(modifier_bits(attr));
                    index = inner;
                }
                lf::POINTER => {
                    let pointee = record.body.read_u32()?;
                    let attr = record.body.read_u32()?;
                    match (attr >> 5) & 7 {
                        1 => {
                            modifiers.insert(Modifiers::REFERENCE);
                            index = pointee;
                        }
                        4 => {
                            modifiers.insert(Modifiers::RVALUE_REFERENCE);
                            index = pointee;
                        }
                        _ => {
                            let mut ty = self.pointer(reference, pointee, attr, &mut record.body)?;
                            ty.modifiers.insert(modifiers);
                            return Ok(ty);
                        }
                    }
                }
                _ => {
                    let mut ty = self.classify(reference, index, record)?;
                    ty.modifiers.insert(modifiers);
                    return Ok(ty);
                }
            }
        }
        Err(SymError::malformed(format!("modifier chain at 0x{:x} does not terminate", reference.0)))
    }

    fn pointer(&self, origin: TypeRef, pointee: u32, attr: u32, body: &mut BinaryCursor<'data>) -> Result<Type>
    {
        let size = match u64::from((attr >> 13) & 0x3f) {
            0 => u64::from(self.pointer_size),
            size => size,
        };
        let mut ty = Type::primitive(TypeKind::Pointer, size, origin);
        ty.next = Some(TypeRef(u64::from(pointee)));
        ty.modifiers = modifier_bits((attr >> 9) as u16 & 0x7);
        if attr & (1 << 12) != 0 {
            ty.modifiers.insert(Modifiers::RESTRICT);
        }
        if matches!((attr >> 5) & 7, 2 | 3) {
            ty.kind = TypeKind::PtrToMember;
            let class = body.read_u32()?;
            ty.payload = TypePayload::Owner {
                class: TypeRef(u64::from(class)),
            };
        }
        Ok(ty)
    }

    /// Byte size of `index`, following modifiers and bitfields.
    fn size_of(&self, index: u32) -> u64
    {
        self.resolve(TypeRef(u64::from(index))).map_or(0, |ty| ty.size)
    }

    fn classify(&self, origin: TypeRef, index: u32, mut record: Record<'data>) -> Result<Type>
    {
        let body = &mut record.body;
        let mut ty = Type::primitive(TypeKind::Void, 0, origin);
        match record.leaf {
            lf::CLASS | lf::STRUCTURE | lf::UNION | lf::ENUM => {
                let udt = Udt::parse(record.leaf, body)?;
                let definition = self.definition_of(index, &udt);
                if definition != index {
                    let mut ty = self.resolve(TypeRef(u64::from(definition)))?;
                    ty.origin = TypeRef(u64::from(definition));
                    return Ok(ty);
                }
                ty.kind = udt.kind;
                ty.name = Some(String::from_utf8_lossy(udt.name).into_owned());
                ty.size = udt.size;
                if let Some(underlying) = udt.underlying {
                    ty.next = Some(TypeRef(u64::from(underlying)));
                    ty.size = self.size_of(underlying);
                }
            }
            lf::ARRAY => {
                let element = body.read_u32()?;
                let _index_type = body.read_u32()?;
                ty.kind = TypeKind::Array;
                ty.size = read_numeric(body)?;
                let name = read_name(body)?;
                ty.name = (!name.is_empty()).then_some(name);
                ty.next = Some(TypeRef(u64::from(element)));
                let element_size = self.size_of(element);
                let count = if element_size == 0 {
                    0
                } else {
                    ty.size / element_size
                };
                ty.payload = TypePayload::Array { count };
            }
            lf::PROCEDURE => {
                let ret = body.read_u32()?;
                let _call = body.read_u8()?;
                let _attr = body.read_u8()?;
                let param_count = body.read_u16()?;
                let params = body.read_u32()?;
                ty.kind = TypeKind::Proc;
                ty.next = Some(TypeRef(u64::from(ret)));
                ty.payload = TypePayload::Proc {
                    params: TypeRef(u64::from(params)),
                    param_count: u32::from(param_count),
                };
            }
            lf::MFUNCTION => {
                let ret = body.read_u32()?;
                let class = body.read_u32()?;
                ty.kind = TypeKind::Method;
                ty.next = Some(TypeRef(u64::from(ret)));
                ty.payload = TypePayload::Owner {
                    class: TypeRef(u64::from(class)),
                };
            }
            lf::BITFIELD => {
                let underlying = body.read_u32()?;
                let bit_size = body.read_u8()?;
                let bit_offset = body.read_u8()?;
                ty.kind = TypeKind::Bitfield;
                ty.next = Some(TypeRef(u64::from(underlying)));
                ty.size = self.size_of(underlying);
                ty.payload = TypePayload::Bitfield {
                    bit_offset: u32::from(bit_offset),
                    bit_size: u32::from(bit_size),
                };
            }
            other => return Err(SymError::Unsupported(format!("type record 0x{other:04x}"))),
        }
        Ok(ty)
    }

    /// Members of an aggregate, enum, procedure or argument list.
    pub fn members(&self, reference: TypeRef) -> Result<TypeMembers<'_, 'data>>
    {
        let index = Self::index_of(reference)?;
        let mut record = self.record(index)?;
        let source = match record.leaf {
            lf::CLASS | lf::STRUCTURE | lf::UNION | lf::ENUM => {
                let udt = Udt::parse(record.leaf, &mut record.body)?;
                let definition = self.definition_of(index, &udt);
                if definition != index {
                    return self.members(TypeRef(u64::from(definition)));
                }
                if udt.field_list == 0 {
                    Source::Done
                } else {
                    self.field_list(udt.field_list)?
                }
            }
            lf::PROCEDURE => {
                record.body.skip(8)?;
                self.arguments(record.body.read_u32()?)?
            }
            lf::MFUNCTION => {
                record.body.skip(16)?;
                self.arguments(record.body.read_u32()?)?
            }
            lf::ARGLIST => Source::Arguments {
                body: record.body,
                remaining: 0,
                started: false,
            },
            other => return Err(SymError::InvalidUsage(format!("type record 0x{other:04x} has no members"))),
        };
        Ok(TypeMembers {
            stream: self,
            source,
            pending: VecDeque::new(),
            chained: 0,
        })
    }

    fn field_list(&self, index: u32) -> Result<Source<'data>>
    {
        let record = self.record(index)?;
        if record.leaf != lf::FIELDLIST {
            return Err(SymError::malformed(format!("type 0x{index:x} is not a field list")));
        }
        Ok(Source::Fields(record.body))
    }

    fn arguments(&self, index: u32) -> Result<Source<'data>>
    {
        if index == 0 {
            return Ok(Source::Done);
        }
        let record = self.record(index)?;
        if record.leaf != lf::ARGLIST {
            return Err(SymError::malformed(format!("type 0x{index:x} is not an argument list")));
        }
        Ok(Source::Arguments {
            body: record.body,
            remaining: 0,
            started: false,
        })
    }

    /// Overloads listed by an `LF_METHODLIST` record.
    fn method_list(&self, index: u32, name: &str, out: &mut VecDeque<Member>) -> Result<()>
    {
        let mut record = self.record(index)?;
        if record.leaf != lf::METHODLIST {
            return Err(SymError::malformed(format!("type 0x{index:x} is not a method list")));
        }
        let body = &mut record.body;
        while !body.is_empty() {
            let attr = body.read_u16()?;
            let _pad = body.read_u16()?;
            let ty = body.read_u32()?;
            let vtable_offset = if introduces_virtual(attr) {
                Some(u64::from(body.read_u32()?))
            } else {
                None
            };
            out.push_back(Member {
                name: Some(name.to_string()),
                ty: Some(TypeRef(u64::from(ty))),
                access: access(attr),
                kind: MemberKind::Method {
                    vtable_offset,
                    is_virtual: is_virtual(attr),
                },
            });
        }
        Ok(())
    }
}

fn modifier_bits(attr: u16) -> Modifiers
{
    let mut modifiers = Modifiers::NONE;
    if attr & 0x1 != 0 {
        modifiers.insert(Modifiers::CONST);
    }
    if attr & 0x2 != 0 {
        modifiers.insert(Modifiers::VOLATILE);
    }
    if attr & 0x4 != 0 {
        modifiers.insert(Modifiers::UNALIGNED);
    }
    modifiers
}

enum Source<'data>
{
    Fields(BinaryCursor<'data>),
    Arguments
    {
        body: BinaryCursor<'data>,
        remaining: u32,
        started: bool,
    },
    Done,
}

/// Lazy iterator over the members of a CodeView type
pub struct TypeMembers<'s, 'data>
{
    stream: &'s TypeStream<'data>,
    source: Source<'data>,
    /// Overloads expanded from an `LF_METHOD` entry
    pending: VecDeque<Member>,
    chained: usize,
}

impl<'data> TypeMembers<'_, 'data>
{
    fn next_argument(body: &mut BinaryCursor<'data>, remaining: &mut u32, started: &mut bool) -> Result<Option<Member>>
    {
        if !*started {
            *remaining = body.read_u32()?;
            *started = true;
        }
        if *remaining == 0 {
            return Ok(None);
        }
        *remaining -= 1;
        let ty = body.read_u32()?;
        Ok(Some(Member {
            name: None,
            ty: Some(TypeRef(u64::from(ty))),
            access: Access::None,
            kind: MemberKind::Parameter,
        }))
    }

    /// Decode field-list entries until one yields a member.
    fn next_field(&mut self) -> Result<Option<Member>>
    {
        loop {
            let Source::Fields(body) = &mut self.source else {
                return Ok(None);
            };
            skip_padding(body)?;
            if body.is_empty() {
                return Ok(None);
            }
            let leaf = body.read_u16()?;
            let member = match leaf {
                lf::MEMBER => {
                    let attr = body.read_u16()?;
                    let ty = body.read_u32()?;
                    let offset = read_numeric(body)?;
                    let name = read_name(body)?;
                    Some(self.data_member(attr, ty, offset, name))
                }
                lf::STMEMBER => {
                    let attr = body.read_u16()?;
                    let ty = body.read_u32()?;
                    let name = read_name(body)?;
                    Some(Member {
                        name: Some(name),
                        ty: Some(TypeRef(u64::from(ty))),
                        access: access(attr),
                        kind: MemberKind::StaticData,
                    })
                }
                lf::ENUMERATE => {
                    let attr = body.read_u16()?;
                    let value = read_numeric(body)?;
                    let name = read_name(body)?;
                    Some(Member {
                        name: Some(name),
                        ty: None,
                        access: access(attr),
                        kind: MemberKind::EnumValue { value },
                    })
                }
                lf::BCLASS => {
                    let attr = body.read_u16()?;
                    let ty = body.read_u32()?;
                    let offset = read_numeric(body)?;
                    Some(Member {
                        name: None,
                        ty: Some(TypeRef(u64::from(ty))),
                        access: access(attr),
                        kind: MemberKind::BaseClass { offset },
                    })
                }
                lf::VBCLASS | lf::IVBCLASS => {
                    let attr = body.read_u16()?;
                    let ty = body.read_u32()?;
                    let _vbptr = body.read_u32()?;
                    let _vbptr_offset = read_numeric(body)?;
                    let vbase_offset = read_numeric(body)?;
                    Some(Member {
                        name: None,
                        ty: Some(TypeRef(u64::from(ty))),
                        access: access(attr),
                        kind: MemberKind::VirtualBase { vbase_offset },
                    })
                }
                lf::ONEMETHOD => {
                    let attr = body.read_u16()?;
                    let ty = body.read_u32()?;
                    let vtable_offset = if introduces_virtual(attr) {
                        Some(u64::from(body.read_u32()?))
                    } else {
                        None
                    };
                    let name = read_name(body)?;
                    Some(Member {
                        name: Some(name),
                        ty: Some(TypeRef(u64::from(ty))),
                        access: access(attr),
                        kind: MemberKind::Method {
                            vtable_offset,
                            is_virtual: is_virtual(attr),
                        },
                    })
                }
                lf::METHOD => {
                    let _count = body.read_u16()?;
                    let list = body.read_u32()?;
                    let name = read_name(body)?;
                    self.stream.method_list(list, &name, &mut self.pending)?;
                    self.pending.pop_front()
                }
                lf::NESTTYPE => {
                    body.skip(6)?;
                    body.read_cstr()?;
                    None
                }
                lf::VFUNCTAB => {
                    body.skip(6)?;
                    None
                }
                lf::INDEX => {
                    body.skip(2)?;
                    let continuation = body.read_u32()?;
                    self.chained += 1;
                    if self.chained > MAX_FIELD_LIST_CHAIN {
                        return Err(SymError::malformed("field list continuation chain too long"));
                    }
                    self.source = self.stream.field_list(continuation)?;
                    None
                }
                other => return Err(SymError::Unsupported(format!("field leaf 0x{other:04x}"))),
            };
            if member.is_some() {
                return Ok(member);
            }
        }
    }

    fn data_member(&self, attr: u16, ty: u32, offset: u64, name: String) -> Member
    {
        let bitfield = (ty >= FIRST_TYPE_INDEX)
            .then(|| self.stream.resolve(TypeRef(u64::from(ty))).ok())
            .flatten()
            .filter(|resolved| resolved.kind == TypeKind::Bitfield);
        let (ty, kind) = match bitfield {
            Some(Type {
                next,
                payload: TypePayload::Bitfield { bit_offset, bit_size },
                ..
            }) => (
                next,
                MemberKind::Bitfield {
                    offset,
                    bit_offset,
                    bit_size,
                },
            ),
            _ => (Some(TypeRef(u64::from(ty))), MemberKind::Data { offset }),
        };
        Member {
            name: Some(name),
            ty,
            access: access(attr),
            kind,
        }
    }
}

/// Skip `LF_PAD*` bytes between field-list entries.
fn skip_padding(body: &mut BinaryCursor<'_>) -> Result<()>
{
    if let Some(byte) = body.peek_u8() {
        if byte >= 0xf0 {
            let count = usize::from(byte & 0x0f).max(1);
            body.skip(count.min(body.remaining()))?;
        }
    }
    Ok(())
}

impl Iterator for TypeMembers<'_, '_>
{
    type Item = Result<Member>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if let Some(member) = self.pending.pop_front() {
            return Some(Ok(member));
        }
        let result = match &mut self.source {
            Source::Done => return None,
            Source::Arguments {
                body,
                remaining,
                started,
            } => Self::next_argument(body, remaining, started),
            Source::Fields(_) => self.next_field(),
        };
        match result {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => {
                self.source = Source::Done;
                None
            }
            Err(err) => {
                self.source = Source::Done;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    /// Minimal `.debug$T` builder: records get consecutive indices from 0x1000.
    struct Types
    {
        bytes: Vec<u8>,
    }

    impl Types
    {
        fn new() -> Self
        {
            Self {
                bytes: 4u32.to_le_bytes().to_vec(),
            }
        }

        fn record(&mut self, leaf: u16, body: &[u8]) -> &mut Self
        {
            let mut payload = leaf.to_le_bytes().to_vec();
            payload.extend_from_slice(body);
            while (payload.len() + 2) % 4 != 0 {
                payload.push(0xf0 | (4 - (payload.len() + 2) % 4) as u8);
            }
            self.bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            self.bytes.extend_from_slice(&payload);
            self
        }
    }

    fn le32(value: u32) -> [u8; 4]
    {
        value.to_le_bytes()
    }

    /// 0x1000: field list { int value; Node* next }, 0x1001: struct Node,
    /// 0x1002: Node*, 0x1003: forward decl of Node
    fn node_types() -> Vec<u8>
    {
        let mut fields = Vec::new();
        fields.extend_from_slice(&lf::MEMBER.to_le_bytes());
        fields.extend_from_slice(&3u16.to_le_bytes());
        fields.extend_from_slice(&le32(0x74));
        fields.extend_from_slice(&0u16.to_le_bytes());
        fields.extend_from_slice(b"value\0");
        fields.extend_from_slice(&[0xf2, 0xf1]);
        fields.extend_from_slice(&lf::MEMBER.to_le_bytes());
        fields.extend_from_slice(&3u16.to_le_bytes());
        fields.extend_from_slice(&le32(0x1002));
        fields.extend_from_slice(&8u16.to_le_bytes());
        fields.extend_from_slice(b"next\0");

        let udt = |property: u16, field: u32, size: u16| {
            let mut body = Vec::new();
            body.extend_from_slice(&2u16.to_le_bytes());
            body.extend_from_slice(&property.to_le_bytes());
            body.extend_from_slice(&le32(field));
            body.extend_from_slice(&le32(0));
            body.extend_from_slice(&le32(0));
            body.extend_from_slice(&size.to_le_bytes());
            body.extend_from_slice(b"Node\0");
            body
        };

        let mut pointer = le32(0x1003).to_vec();
        pointer.extend_from_slice(&le32(0x0c | (8 << 13)));

        let mut types = Types::new();
        types
            .record(lf::FIELDLIST, &fields)
            .record(lf::STRUCTURE, &udt(0, 0x1000, 16))
            .record(lf::POINTER, &pointer)
            .record(lf::STRUCTURE, &udt(PROP_FWDREF, 0, 0));
        types.bytes
    }

    #[test]
    fn test_simple_types()
    {
        assert_eq!(simple_type(0x74, 8).unwrap().kind, TypeKind::Int32);
        assert_eq!(simple_type(0x41, 8).unwrap().size, 8);
        let pointer = simple_type(0x0670, 8).unwrap();
        assert_eq!(pointer.kind, TypeKind::Pointer);
        assert_eq!(pointer.next, Some(TypeRef(0x70)));
        assert!(simple_type(0x10, 8).unwrap().modifiers.contains(Modifiers::CHAR));
    }

    #[test]
    fn test_forward_reference_resolves_to_definition()
    {
        let bytes = node_types();
        let stream = TypeStream::new(&bytes, 8).unwrap();
        assert_eq!(stream.len(), 4);

        let pointer = stream.resolve(TypeRef(0x1002)).unwrap();
        assert_eq!(pointer.kind, TypeKind::Pointer);
        assert_eq!(pointer.size, 8);
        let node = stream.resolve(pointer.next.unwrap()).unwrap();
        assert_eq!(node.kind, TypeKind::Struct);
        assert_eq!(node.origin, TypeRef(0x1001));
        assert_eq!(node.size, 16);
        assert_eq!(stream.named_types(), vec![TypeRef(0x1001)]);
    }

    #[test]
    fn test_struct_members()
    {
        let bytes = node_types();
        let stream = TypeStream::new(&bytes, 8).unwrap();
        let members: Vec<_> = stream.members(TypeRef(0x1003)).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name.as_deref(), Some("value"));
        assert_eq!(members[0].kind, MemberKind::Data { offset: 0 });
        assert_eq!(members[0].access, Access::Public);
        assert_eq!(members[1].ty, Some(TypeRef(0x1002)));
        assert_eq!(members[1].kind, MemberKind::Data { offset: 8 });
    }

    #[test]
    fn test_modifier_and_procedure()
    {
        let mut modifier = le32(0x74).to_vec();
        modifier.extend_from_slice(&1u16.to_le_bytes());
        let mut args = le32(2).to_vec();
        args.extend_from_slice(&le32(0x1000));
        args.extend_from_slice(&le32(0x40));
        let mut procedure = le32(0x03).to_vec();
        procedure.extend_from_slice(&[0, 0]);
        procedure.extend_from_slice(&2u16.to_le_bytes());
        procedure.extend_from_slice(&le32(0x1001));

        let mut types = Types::new();
        types
            .record(lf::MODIFIER, &modifier)
            .record(lf::ARGLIST, &args)
            .record(lf::PROCEDURE, &procedure);
        let stream = TypeStream::new(&types.bytes, 8).unwrap();

        let constant = stream.resolve(TypeRef(0x1000)).unwrap();
        assert_eq!(constant.kind, TypeKind::Int32);
        assert!(constant.modifiers.contains(Modifiers::CONST));

        let proc = stream.resolve(TypeRef(0x1002)).unwrap();
        assert_eq!(proc.kind, TypeKind::Proc);
        assert_eq!(
            proc.payload,
            TypePayload::Proc {
                params: TypeRef(0x1001),
                param_count: 2
            }
        );
        let params: Vec<_> = stream.members(TypeRef(0x1002)).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].ty, Some(TypeRef(0x40)));
        assert_eq!(params[0].kind, MemberKind::Parameter);
    }
}
