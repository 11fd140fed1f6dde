//! Procedures, globals, locals and type entries of a DWARF unit.

use gimli::constants::{self, DwTag};
use tracing::debug;

use super::attr::{AttrClass, AttributeValue};
use super::loclists::read_loclist;
use super::ranges::{hull, tag_ranges};
use super::tag::Tag;
use super::unit::{DwarfUnits, UnitRef};
use crate::error::Result;
use crate::location::{EncodedLocation, ExprLocation};
use crate::types::{ModuleId, Proc, TypeRef, Var, VarKind};

/// Bound on `specification` / `abstract_origin` chains.
const MAX_ORIGIN_CHAIN: usize = 8;

/// Turn a location-class attribute into an [`EncodedLocation`].
pub fn encode_location<'data>(
    unit: &UnitRef<'_, 'data>,
    value: &AttributeValue<'data>,
    frame_base: Option<&EncodedLocation<'data>>,
) -> Result<EncodedLocation<'data>>
{
    let template = |ops| {
        let mut expr = ExprLocation::new(ops, unit.encoding());
        expr.frame_base = frame_base.filter(|base| !base.is_null()).cloned().map(Box::new);
        expr.addr_table = Some(unit.addr_table());
        expr
    };
    if let Some(ops) = value.as_expr() {
        return Ok(EncodedLocation::Expr(template(ops)));
    }
    match *value {
        AttributeValue::SectionPtr { class, offset }
            if class.intersects(AttrClass::LOCLIST.union(AttrClass::LOCLISTPTR)) =>
        {
            Ok(EncodedLocation::LocList {
                entries: read_loclist(unit, offset)?,
                template: template(&[]),
            })
        }
        _ => Ok(EncodedLocation::Null),
    }
}

/// Attribute `name` of `tag`, or of the entry its `specification` /
/// `abstract_origin` chain leads to.
fn inherited_attr<'data>(
    units: &DwarfUnits<'data>,
    unit: &UnitRef<'_, 'data>,
    tag: &Tag,
    name: constants::DwAt,
) -> Result<Option<AttributeValue<'data>>>
{
    if let Some(value) = unit.attr(tag, name)? {
        return Ok(Some(value));
    }
    let mut next = origin(unit, tag)?;
    for _ in 0..MAX_ORIGIN_CHAIN {
        let Some(offset) = next else {
            return Ok(None);
        };
        let owner = units.unit_for(offset)?;
        let origin_tag = owner.tag_at(offset)?;
        if let Some(value) = owner.attr(&origin_tag, name)? {
            return Ok(Some(value));
        }
        next = origin(&owner, &origin_tag)?;
    }
    debug!(offset = tag.offset, "origin chain too long");
    Ok(None)
}

fn origin(unit: &UnitRef<'_, '_>, tag: &Tag) -> Result<Option<u64>>
{
    for name in [constants::DW_AT_specification, constants::DW_AT_abstract_origin] {
        if let Some(offset) = unit.attr(tag, name)?.and_then(|value| value.as_reference()) {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

fn lossy(bytes: &[u8]) -> String
{
    String::from_utf8_lossy(bytes).into_owned()
}

/// Display name of `tag`: its own or inherited `DW_AT_name`, falling back to
/// the linkage name.
pub fn entry_name(units: &DwarfUnits<'_>, unit: &UnitRef<'_, '_>, tag: &Tag) -> Result<Option<String>>
{
    for name in [
        constants::DW_AT_name,
        constants::DW_AT_linkage_name,
        constants::DW_AT_MIPS_linkage_name,
    ] {
        if let Some(value) = inherited_attr(units, unit, tag, name)?.and_then(|value| value.as_str()) {
            return Ok(Some(lossy(value)));
        }
    }
    Ok(None)
}

fn type_of(units: &DwarfUnits<'_>, unit: &UnitRef<'_, '_>, tag: &Tag) -> Result<Option<TypeRef>>
{
    Ok(inherited_attr(units, unit, tag, constants::DW_AT_type)?
        .and_then(|value| value.as_reference())
        .map(TypeRef))
}

fn is_declaration(unit: &UnitRef<'_, '_>, tag: &Tag) -> Result<bool>
{
    Ok(unit
        .attr(tag, constants::DW_AT_declaration)?
        .is_some_and(|value| value.as_flag()))
}

/// Every procedure with code in `unit`, in `.debug_info` order.
///
/// An entry that fails to decode is logged and skipped; the rest of the unit
/// is still reported.
pub fn unit_procs<'data>(units: &DwarfUnits<'data>, unit: &UnitRef<'_, 'data>, module: ModuleId) -> Result<Vec<Proc<'data>>>
{
    let mut procs = Vec::new();
    let root = unit.root()?;
    unit.walk(&root, &mut |tag, _| {
        if tag.tag != constants::DW_TAG_subprogram {
            return Ok(!is_type_or_data(tag.tag));
        }
        match proc_for(units, unit, tag, module) {
            Ok(Some(proc)) => procs.push(proc),
            Ok(None) => {}
            Err(err) => debug!(offset = tag.offset, %err, "skipping procedure"),
        }
        // Nested procedures (GNU C nested functions, local classes).
        Ok(true)
    })?;
    Ok(procs)
}

fn is_type_or_data(tag: DwTag) -> bool
{
    matches!(
        tag,
        constants::DW_TAG_variable
            | constants::DW_TAG_formal_parameter
            | constants::DW_TAG_enumeration_type
            | constants::DW_TAG_array_type
            | constants::DW_TAG_subroutine_type
    )
}

fn proc_for<'data>(
    units: &DwarfUnits<'data>,
    unit: &UnitRef<'_, 'data>,
    tag: &Tag,
    module: ModuleId,
) -> Result<Option<Proc<'data>>>
{
    if is_declaration(unit, tag)? {
        return Ok(None);
    }
    let pieces = tag_ranges(unit, tag)?;
    let Some(range) = hull(&pieces) else {
        return Ok(None);
    };
    let frame_base = match unit.attr(tag, constants::DW_AT_frame_base)? {
        Some(value) => encode_location(unit, &value, None)?,
        None => EncodedLocation::Null,
    };
    let name = entry_name(units, unit, tag)?.unwrap_or_else(|| format!("sub_{:x}", range.lo));
    Ok(Some(Proc {
        name,
        module,
        range,
        debug_range: range,
        pieces,
        ty: Some(TypeRef(tag.offset)),
        frame_base,
        locator: tag.offset,
    }))
}

/// Variables with static storage, at unit or namespace scope.
pub fn unit_globals<'data>(units: &DwarfUnits<'data>, unit: &UnitRef<'_, 'data>) -> Result<Vec<Var<'data>>>
{
    let mut globals = Vec::new();
    let root = unit.root()?;
    unit.walk(&root, &mut |tag, _| {
        match tag.tag {
            constants::DW_TAG_namespace | constants::DW_TAG_module => return Ok(true),
            constants::DW_TAG_variable => {}
            _ => return Ok(false),
        }
        let Some(location) = unit.attr(tag, constants::DW_AT_location)? else {
            return Ok(false);
        };
        let location = encode_location(unit, &location, None)?;
        if location.is_null() {
            return Ok(false);
        }
        globals.push(Var {
            name: entry_name(units, unit, tag)?.unwrap_or_default(),
            kind: VarKind::Global,
            ty: type_of(units, unit, tag)?,
            location,
        });
        Ok(false)
    })?;
    Ok(globals)
}

/// Parameters and local variables of the procedure entry at `locator`,
/// including those of nested lexical blocks.
pub fn proc_locals<'data>(units: &DwarfUnits<'data>, locator: u64) -> Result<Vec<Var<'data>>>
{
    let unit = units.unit_for(locator)?;
    let proc = unit.tag_at(locator)?;
    let frame_base = match unit.attr(&proc, constants::DW_AT_frame_base)? {
        Some(value) => encode_location(&unit, &value, None)?,
        None => EncodedLocation::Null,
    };

    let mut locals = Vec::new();
    unit.walk(&proc, &mut |tag, _| {
        let kind = match tag.tag {
            constants::DW_TAG_lexical_block => return Ok(true),
            constants::DW_TAG_formal_parameter => VarKind::Parameter,
            constants::DW_TAG_variable => VarKind::Local,
            _ => return Ok(false),
        };
        let location = match unit.attr(tag, constants::DW_AT_location)? {
            Some(value) => encode_location(&unit, &value, Some(&frame_base))?,
            None => EncodedLocation::Null,
        };
        locals.push(Var {
            name: entry_name(units, &unit, tag)?.unwrap_or_default(),
            kind,
            ty: type_of(units, &unit, tag)?,
            location,
        });
        Ok(false)
    })?;
    Ok(locals)
}

fn is_named_type(tag: DwTag) -> bool
{
    matches!(
        tag,
        constants::DW_TAG_base_type
            | constants::DW_TAG_unspecified_type
            | constants::DW_TAG_structure_type
            | constants::DW_TAG_class_type
            | constants::DW_TAG_union_type
            | constants::DW_TAG_enumeration_type
            | constants::DW_TAG_typedef
    )
}

/// Named type definitions of `unit`, including those nested in namespaces
/// and aggregates.
pub fn unit_types(unit: &UnitRef<'_, '_>) -> Result<Vec<TypeRef>>
{
    let mut types = Vec::new();
    let root = unit.root()?;
    unit.walk(&root, &mut |tag, _| {
        if tag.tag == constants::DW_TAG_namespace || tag.tag == constants::DW_TAG_module {
            return Ok(true);
        }
        if !is_named_type(tag.tag) {
            return Ok(false);
        }
        if !is_declaration(unit, tag)? && unit.name(tag)?.is_some() {
            types.push(TypeRef(tag.offset));
        }
        Ok(matches!(
            tag.tag,
            constants::DW_TAG_structure_type | constants::DW_TAG_class_type | constants::DW_TAG_union_type
        ))
    })?;
    Ok(types)
}
