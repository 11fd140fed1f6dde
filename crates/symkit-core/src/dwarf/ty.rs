//! # Type Inference
//!
//! Classifies the entry a [`TypeRef`] points at into the unified [`Type`]
//! model, one level at a time.
//!
//! ## Modifiers
//!
//! Wrapper entries (`const`, `volatile`, `atomic`, `restrict`, `shared`,
//! `packed`, `immutable`, lvalue and rvalue references) are folded into a
//! [`Modifiers`] bitset before the unwrapped entry is classified.
//!
//! ## Cycles
//!
//! Only the referenced type's identity is recorded in `next`; it is never
//! followed. Members of aggregates come from a separate lazy [`MemberIter`],
//! so a struct holding a pointer to itself costs one entry decode per level
//! the caller actually asks for.

use gimli::constants::{self, DwAccess, DwAte, DwOp, DwTag, DwVirtuality};

use super::attr::AttributeValue;
use super::tag::{Children, Tag};
use super::unit::{DwarfUnits, UnitRef};
use crate::cursor::BinaryCursor;
use crate::error::{Result, SymError};
use crate::types::{Access, Member, MemberKind, Modifiers, Type, TypeKind, TypePayload, TypeRef};

/// Longest modifier chain followed before giving up.
const MAX_MODIFIER_CHAIN: usize = 64;

/// Deepest array element nesting used to compute an array's size.
const MAX_SIZE_DEPTH: usize = 16;

fn modifier_for(tag: DwTag) -> Option<Modifiers>
{
    let modifier = match tag {
        constants::DW_TAG_const_type => Modifiers::CONST,
        constants::DW_TAG_volatile_type => Modifiers::VOLATILE,
        constants::DW_TAG_atomic_type => Modifiers::ATOMIC,
        constants::DW_TAG_restrict_type => Modifiers::RESTRICT,
        constants::DW_TAG_shared_type => Modifiers::SHARED,
        constants::DW_TAG_packed_type => Modifiers::PACKED,
        constants::DW_TAG_immutable_type => Modifiers::IMMUTABLE,
        constants::DW_TAG_reference_type => Modifiers::REFERENCE,
        constants::DW_TAG_rvalue_reference_type => Modifiers::RVALUE_REFERENCE,
        _ => return None,
    };
    Some(modifier)
}

fn type_ref(value: Option<AttributeValue<'_>>) -> Option<TypeRef>
{
    value.and_then(|value| value.as_reference()).map(TypeRef)
}

/// Value of a size or bound attribute when it is a compile-time constant.
/// Expression and reference forms describe runtime values and give `None`.
fn constant_bound(value: Option<AttributeValue<'_>>) -> Option<u64>
{
    match value? {
        AttributeValue::Const { lo, .. } => Some(lo),
        _ => None,
    }
}

fn lossy(bytes: Option<&[u8]>) -> Option<String>
{
    bytes.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn base_kind(encoding: DwAte, size: u64) -> Result<(TypeKind, Modifiers)>
{
    let by_width = |signed: bool| -> Result<TypeKind> {
        let kind = match (signed, size) {
            (true, 1) => TypeKind::Int8,
            (true, 2) => TypeKind::Int16,
            (true, 4) => TypeKind::Int32,
            (true, 8) => TypeKind::Int64,
            (true, 16) => TypeKind::Int128,
            (false, 1) => TypeKind::UInt8,
            (false, 2) => TypeKind::UInt16,
            (false, 4) => TypeKind::UInt32,
            (false, 8) => TypeKind::UInt64,
            (false, 16) => TypeKind::UInt128,
            _ => return Err(SymError::Unsupported(format!("{size}-byte integer"))),
        };
        Ok(kind)
    };
    let classified = match encoding {
        constants::DW_ATE_boolean => (TypeKind::Bool, Modifiers::NONE),
        constants::DW_ATE_signed => (by_width(true)?, Modifiers::NONE),
        constants::DW_ATE_unsigned | constants::DW_ATE_address => (by_width(false)?, Modifiers::NONE),
        constants::DW_ATE_signed_char => (by_width(true)?, Modifiers::CHAR),
        constants::DW_ATE_unsigned_char => (by_width(false)?, Modifiers::CHAR),
        constants::DW_ATE_UTF => match size {
            1 => (TypeKind::Char8, Modifiers::NONE),
            2 => (TypeKind::Char16, Modifiers::NONE),
            4 => (TypeKind::Char32, Modifiers::NONE),
            _ => return Err(SymError::Unsupported(format!("{size}-byte character"))),
        },
        constants::DW_ATE_float => match size {
            4 => (TypeKind::Float32, Modifiers::NONE),
            8 => (TypeKind::Float64, Modifiers::NONE),
            10 | 12 => (TypeKind::Float80, Modifiers::NONE),
            16 => (TypeKind::Float128, Modifiers::NONE),
            _ => return Err(SymError::Unsupported(format!("{size}-byte float"))),
        },
        other => return Err(SymError::Unsupported(format!("base type encoding {other}"))),
    };
    Ok(classified)
}

/// Number of elements one `DW_TAG_subrange_type` / `DW_TAG_enumeration_type`
/// dimension contributes. Zero when the bound is unknown.
fn dimension_count(unit: &UnitRef<'_, '_>, dim: &Tag) -> Result<u64>
{
    if let Some(count) = constant_bound(unit.attr(dim, constants::DW_AT_count)?) {
        return Ok(count);
    }
    let Some(upper) = unit.attr(dim, constants::DW_AT_upper_bound)? else {
        return Ok(0);
    };
    let AttributeValue::Const { lo: upper, .. } = upper else {
        // Runtime bounds (VLAs) are expressions or references.
        return Ok(0);
    };
    let lower = unit
        .attr(dim, constants::DW_AT_lower_bound)?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Ok((upper as i64).wrapping_sub(lower).wrapping_add(1).max(0) as u64)
}

/// Resolve `reference` to a [`Type`].
pub fn infer_type(units: &DwarfUnits<'_>, reference: TypeRef) -> Result<Type>
{
    infer_at_depth(units, reference, 0)
}

fn infer_at_depth(units: &DwarfUnits<'_>, reference: TypeRef, depth: usize) -> Result<Type>
{
    let mut modifiers = Modifiers::NONE;
    let mut current = reference.0;
    for _ in 0..MAX_MODIFIER_CHAIN {
        let unit = units.unit_for(current)?;
        let tag = unit.tag_at(current)?;
        let Some(modifier) = modifier_for(tag.tag) else {
            let mut ty = classify(units, &unit, &tag, reference, depth)?;
            ty.modifiers.insert(modifiers);
            return Ok(ty);
        };
        modifiers.insert(modifier);
        match type_ref(unit.attr(&tag, constants::DW_AT_type)?) {
            Some(next) => current = next.0,
            None => {
                // `const void`
                let mut ty = Type::primitive(TypeKind::Void, 0, reference);
                ty.modifiers = modifiers;
                return Ok(ty);
            }
        }
    }
    Err(SymError::malformed(format!("modifier chain at {:#x} does not terminate", reference.0)))
}

fn classify(units: &DwarfUnits<'_>, unit: &UnitRef<'_, '_>, tag: &Tag, origin: TypeRef, depth: usize) -> Result<Type>
{
    let name = lossy(unit.name(tag)?);
    let byte_size = constant_bound(unit.attr(tag, constants::DW_AT_byte_size)?);
    let next = type_ref(unit.attr(tag, constants::DW_AT_type)?);
    let pointer_size = u64::from(unit.encoding().address_size);

    let mut ty = Type {
        kind: TypeKind::Void,
        modifiers: Modifiers::NONE,
        size: byte_size.unwrap_or(0),
        name,
        next,
        payload: TypePayload::None,
        origin,
    };

    match tag.tag {
        constants::DW_TAG_base_type => {
            let encoding = unit
                .attr(tag, constants::DW_AT_encoding)?
                .and_then(|v| v.as_u64())
                .ok_or_else(|| SymError::malformed("base type without encoding"))?;
            let size = byte_size.unwrap_or(0);
            if size == 0 {
                ty.kind = TypeKind::Void;
            } else {
                (ty.kind, ty.modifiers) = base_kind(DwAte(encoding as u8), size)?;
            }
            ty.next = None;
        }
        constants::DW_TAG_unspecified_type => ty.kind = TypeKind::Void,
        constants::DW_TAG_pointer_type => {
            ty.kind = TypeKind::Pointer;
            ty.size = byte_size.unwrap_or(pointer_size);
        }
        constants::DW_TAG_ptr_to_member_type => {
            ty.kind = TypeKind::PtrToMember;
            ty.size = byte_size.unwrap_or(pointer_size);
            if let Some(class) = type_ref(unit.attr(tag, constants::DW_AT_containing_type)?) {
                ty.payload = TypePayload::Owner { class };
            }
        }
        constants::DW_TAG_typedef => {
            ty.kind = TypeKind::Typedef;
            if byte_size.is_none() {
                ty.size = next.map_or(Ok(0), |next| type_size(units, next, depth + 1))?;
            }
        }
        constants::DW_TAG_structure_type => ty.kind = TypeKind::Struct,
        constants::DW_TAG_class_type => ty.kind = TypeKind::Class,
        constants::DW_TAG_union_type => ty.kind = TypeKind::Union,
        constants::DW_TAG_enumeration_type => ty.kind = TypeKind::Enum,
        constants::DW_TAG_array_type => {
            ty.kind = TypeKind::Array;
            let mut count = 1u64;
            let mut dimensions = 0usize;
            for dim in unit.children(tag)? {
                let dim = dim?;
                if matches!(
                    dim.tag,
                    constants::DW_TAG_subrange_type | constants::DW_TAG_enumeration_type
                ) {
                    count = count.saturating_mul(dimension_count(unit, &dim)?);
                    dimensions += 1;
                }
            }
            if dimensions == 0 {
                count = 0;
            }
            ty.payload = TypePayload::Array { count };
            if byte_size.is_none() {
                let element = next.map_or(Ok(0), |next| type_size(units, next, depth + 1))?;
                ty.size = element.saturating_mul(count);
            }
        }
        constants::DW_TAG_subroutine_type | constants::DW_TAG_subprogram => {
            let object_pointer = unit.attr(tag, constants::DW_AT_object_pointer)?.is_some();
            ty.kind = if object_pointer {
                TypeKind::Method
            } else {
                TypeKind::Proc
            };
            let mut param_count = 0u32;
            for child in unit.children(tag)? {
                if child?.tag == constants::DW_TAG_formal_parameter {
                    param_count += 1;
                }
            }
            ty.payload = TypePayload::Proc {
                params: origin_of(tag),
                param_count,
            };
            if object_pointer {
                if let Some(class) = type_ref(unit.attr(tag, constants::DW_AT_containing_type)?) {
                    ty.payload = TypePayload::Owner { class };
                }
            }
        }
        other => return Err(SymError::Unsupported(format!("type entry {other}"))),
    }
    Ok(ty)
}

fn origin_of(tag: &Tag) -> TypeRef
{
    TypeRef(tag.offset)
}

/// Byte size of `reference`, following typedefs, modifiers and arrays.
fn type_size(units: &DwarfUnits<'_>, reference: TypeRef, depth: usize) -> Result<u64>
{
    if depth > MAX_SIZE_DEPTH {
        return Ok(0);
    }
    let ty = infer_at_depth(units, reference, depth)?;
    match (ty.kind, ty.size, ty.next) {
        (_, size, _) if size != 0 => Ok(size),
        (TypeKind::Typedef, _, Some(next)) => type_size(units, next, depth + 1),
        _ => Ok(0),
    }
}

/// Constant operand of a `DW_OP_plus_uconst` / `DW_OP_constu` style
/// member-location expression.
fn constant_offset(ops: &[u8]) -> Option<u64>
{
    let mut cursor = BinaryCursor::new(ops);
    let mut offset = None;
    while !cursor.is_empty() {
        let op = DwOp(cursor.read_u8().ok()?);
        match op {
            constants::DW_OP_plus_uconst | constants::DW_OP_constu => offset = Some(cursor.read_uleb128().ok()?),
            constants::DW_OP_consts => offset = Some(cursor.read_sleb128().ok()? as u64),
            constants::DW_OP_plus | constants::DW_OP_minus | constants::DW_OP_dup | constants::DW_OP_deref => {}
            _ if (constants::DW_OP_lit0.0..=constants::DW_OP_lit31.0).contains(&op.0) => {
                offset = Some(u64::from(op.0 - constants::DW_OP_lit0.0));
            }
            _ => return None,
        }
    }
    offset
}

fn member_offset(value: Option<AttributeValue<'_>>) -> u64
{
    match value {
        Some(AttributeValue::Const { lo, .. }) => lo,
        Some(value) => value.as_expr().and_then(constant_offset).unwrap_or(0),
        None => 0,
    }
}

/// Lazy iterator over the members of an aggregate, enum or procedure type
pub struct MemberIter<'a, 'data>
{
    unit: UnitRef<'a, 'data>,
    children: Children<'a, 'data>,
    default_access: Access,
}

impl<'a, 'data> MemberIter<'a, 'data>
{
    /// Members of the type entry `reference`.
    pub fn new(units: &'a DwarfUnits<'data>, reference: TypeRef) -> Result<Self>
    {
        let unit = units.unit_for(reference.0)?;
        let tag = unit.tag_at(reference.0)?;
        let default_access = match tag.tag {
            constants::DW_TAG_class_type => Access::Private,
            constants::DW_TAG_structure_type | constants::DW_TAG_union_type => Access::Public,
            _ => Access::None,
        };
        Ok(Self {
            unit,
            children: unit.children(&tag)?,
            default_access,
        })
    }

    fn member(&self, child: &Tag) -> Result<Option<Member>>
    {
        let unit = &self.unit;
        let kind = match child.tag {
            constants::DW_TAG_member => {
                let is_static = unit
                    .attr(child, constants::DW_AT_declaration)?
                    .is_some_and(|v| v.as_flag())
                    || unit.attr(child, constants::DW_AT_external)?.is_some_and(|v| v.as_flag());
                if is_static {
                    MemberKind::StaticData
                } else {
                    self.data_member(child)?
                }
            }
            constants::DW_TAG_variable => MemberKind::StaticData,
            constants::DW_TAG_inheritance => {
                let offset = member_offset(unit.attr(child, constants::DW_AT_data_member_location)?);
                let virtuality = unit.attr(child, constants::DW_AT_virtuality)?.and_then(|v| v.as_u64());
                if virtuality.is_some_and(|v| v != u64::from(constants::DW_VIRTUALITY_none.0)) {
                    MemberKind::VirtualBase { vbase_offset: offset }
                } else {
                    MemberKind::BaseClass { offset }
                }
            }
            constants::DW_TAG_enumerator => {
                let value = unit
                    .attr(child, constants::DW_AT_const_value)?
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                MemberKind::EnumValue { value }
            }
            constants::DW_TAG_subprogram => {
                let virtuality = unit
                    .attr(child, constants::DW_AT_virtuality)?
                    .and_then(|v| v.as_u64())
                    .map(|v| DwVirtuality(v as u8));
                let vtable_offset = unit
                    .attr(child, constants::DW_AT_vtable_elem_location)?
                    .and_then(|v| v.as_expr().and_then(constant_offset));
                MemberKind::Method {
                    vtable_offset,
                    is_virtual: virtuality.is_some_and(|v| v != constants::DW_VIRTUALITY_none),
                }
            }
            constants::DW_TAG_formal_parameter => MemberKind::Parameter,
            _ => return Ok(None),
        };

        let ty = if child.tag == constants::DW_TAG_subprogram {
            Some(origin_of(child))
        } else {
            type_ref(unit.attr(child, constants::DW_AT_type)?)
        };
        let access = match unit
            .attr(child, constants::DW_AT_accessibility)?
            .and_then(|v| v.as_u64())
            .map(|v| DwAccess(v as u8))
        {
            Some(constants::DW_ACCESS_public) => Access::Public,
            Some(constants::DW_ACCESS_protected) => Access::Protected,
            Some(constants::DW_ACCESS_private) => Access::Private,
            _ => self.default_access,
        };
        Ok(Some(Member {
            name: lossy(unit.name(child)?),
            ty,
            access,
            kind,
        }))
    }

    fn data_member(&self, child: &Tag) -> Result<MemberKind>
    {
        let unit = &self.unit;
        let offset = member_offset(unit.attr(child, constants::DW_AT_data_member_location)?);
        let Some(bit_size) = constant_bound(unit.attr(child, constants::DW_AT_bit_size)?) else {
            return Ok(MemberKind::Data { offset });
        };
        if let Some(bits) = unit.attr(child, constants::DW_AT_data_bit_offset)?.and_then(|v| v.as_u64()) {
            return Ok(MemberKind::Bitfield {
                offset: bits / 8,
                bit_offset: (bits % 8) as u32,
                bit_size: bit_size as u32,
            });
        }
        // DWARF 2/3 count `bit_offset` from the most significant bit of the
        // storage unit.
        let storage = constant_bound(unit.attr(child, constants::DW_AT_byte_size)?);
        let msb_offset = unit.attr(child, constants::DW_AT_bit_offset)?.and_then(|v| v.as_u64());
        let bit_offset = match (storage, msb_offset) {
            (Some(storage), Some(msb)) => (storage * 8).saturating_sub(msb + bit_size),
            _ => 0,
        };
        Ok(MemberKind::Bitfield {
            offset,
            bit_offset: bit_offset as u32,
            bit_size: bit_size as u32,
        })
    }
}

impl Iterator for MemberIter<'_, '_>
{
    type Item = Result<Member>;

    fn next(&mut self) -> Option<Self::Item>
    {
        loop {
            let child = match self.children.next()? {
                Ok(child) => child,
                Err(err) => return Some(Err(err)),
            };
            match self.member(&child) {
                Ok(Some(member)) => return Some(Ok(member)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_base_type_widths()
    {
        assert_eq!(base_kind(constants::DW_ATE_signed, 4).unwrap().0, TypeKind::Int32);
        assert_eq!(base_kind(constants::DW_ATE_unsigned, 8).unwrap().0, TypeKind::UInt64);
        assert_eq!(
            base_kind(constants::DW_ATE_signed_char, 1).unwrap(),
            (TypeKind::Int8, Modifiers::CHAR)
        );
        assert_eq!(base_kind(constants::DW_ATE_float, 10).unwrap().0, TypeKind::Float80);
        assert_eq!(base_kind(constants::DW_ATE_UTF, 2).unwrap().0, TypeKind::Char16);
        assert!(base_kind(constants::DW_ATE_signed, 3).is_err());
    }

    #[test]
    fn test_constant_member_offsets()
    {
        assert_eq!(constant_offset(&[constants::DW_OP_plus_uconst.0, 0x10]), Some(0x10));
        assert_eq!(constant_offset(&[constants::DW_OP_lit8.0]), Some(8));
        assert_eq!(constant_offset(&[constants::DW_OP_reg0.0]), None);
        assert_eq!(member_offset(Some(AttributeValue::Const { lo: 24, hi: 0 })), 24);
        assert_eq!(member_offset(None), 0);
    }

    /// `int vla[n]` (bound is an expression) and `int fixed[10]`.
    fn array_unit() -> (Vec<u8>, Vec<u8>)
    {
        use constants::*;
        let abbrev = vec![
            1, DW_TAG_compile_unit.0 as u8, 1, 0, 0,
            2, DW_TAG_base_type.0 as u8, 0,
            DW_AT_byte_size.0 as u8, DW_FORM_data1.0 as u8,
            DW_AT_encoding.0 as u8, DW_FORM_data1.0 as u8, 0, 0,
            3, DW_TAG_array_type.0 as u8, 1, DW_AT_type.0 as u8, DW_FORM_ref4.0 as u8, 0, 0,
            4, DW_TAG_subrange_type.0 as u8, 0, DW_AT_upper_bound.0 as u8, DW_FORM_exprloc.0 as u8, 0, 0,
            5, DW_TAG_subrange_type.0 as u8, 0, DW_AT_upper_bound.0 as u8, DW_FORM_data1.0 as u8, 0, 0,
            0,
        ];
        let mut info = vec![0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 8];
        info.push(1);
        // @12: int
        info.extend_from_slice(&[2, 4, DW_ATE_signed.0]);
        // @15: int[fbreg -24]
        info.push(3);
        info.extend_from_slice(&12u32.to_le_bytes());
        info.extend_from_slice(&[4, 2, DW_OP_fbreg.0, 0x68, 0]);
        // @25: int[10]
        info.push(3);
        info.extend_from_slice(&12u32.to_le_bytes());
        info.extend_from_slice(&[5, 9, 0]);
        info.push(0);
        let length = (info.len() - 4) as u32;
        info[..4].copy_from_slice(&length.to_le_bytes());
        (abbrev, info)
    }

    #[test]
    fn test_runtime_array_bound_counts_zero()
    {
        let (abbrev, info) = array_unit();
        let units = DwarfUnits::new(crate::dwarf::DwarfSections {
            debug_info: &info,
            debug_abbrev: &abbrev,
            ..Default::default()
        });
        assert_eq!(units.len(), 1);

        let vla = infer_type(&units, TypeRef(15)).unwrap();
        assert_eq!(vla.kind, TypeKind::Array);
        assert_eq!(vla.payload, TypePayload::Array { count: 0 });
        assert_eq!(vla.size, 0);
        assert_eq!(vla.next, Some(TypeRef(12)));

        let fixed = infer_type(&units, TypeRef(25)).unwrap();
        assert_eq!(fixed.payload, TypePayload::Array { count: 10 });
        assert_eq!(fixed.size, 40);
    }

    #[test]
    fn test_modifier_tags()
    {
        assert_eq!(modifier_for(constants::DW_TAG_const_type), Some(Modifiers::CONST));
        assert_eq!(modifier_for(constants::DW_TAG_rvalue_reference_type), Some(Modifiers::RVALUE_REFERENCE));
        assert_eq!(modifier_for(constants::DW_TAG_pointer_type), None);
    }
}
