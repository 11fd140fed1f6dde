//! # Attribute Decoding
//!
//! Attributes are decoded in two steps:
//!
//! 1. [`read_form`] consumes the form-specific bytes from `.debug_info` and
//!    produces a raw [`FormValue`].
//! 2. [`select_class`] intersects the attribute's permitted classes with the
//!    form's possible classes and picks the lowest common one; the raw value is
//!    then resolved into an [`AttributeValue`] of that class, following string,
//!    address and list index tables as needed.
//!
//! Every `(attribute, form)` pair therefore maps to exactly one class. Pairs
//! with no common class, and standard attributes or forms this decoder does not
//! know, are hard failures. Vendor attributes (`DW_AT_lo_user..=DW_AT_hi_user`)
//! that are not in the table are skipped.

use std::fmt;

use gimli::constants::{self, DwAt, DwForm};

use super::unit::UnitRef;
use crate::cursor::{cstr_at, BinaryCursor};
use crate::error::{Result, SymError};

/// DWARF attribute class bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrClass(pub u16);

impl AttrClass
{
    pub const ADDRESS: Self = AttrClass(1 << 0);
    pub const BLOCK: Self = AttrClass(1 << 1);
    pub const CONST: Self = AttrClass(1 << 2);
    pub const EXPRLOC: Self = AttrClass(1 << 3);
    pub const FLAG: Self = AttrClass(1 << 4);
    pub const LINEPTR: Self = AttrClass(1 << 5);
    pub const LOCLIST: Self = AttrClass(1 << 6);
    pub const LOCLISTPTR: Self = AttrClass(1 << 7);
    pub const MACPTR: Self = AttrClass(1 << 8);
    pub const RNGLISTPTR: Self = AttrClass(1 << 9);
    pub const RNGLIST: Self = AttrClass(1 << 10);
    pub const REFERENCE: Self = AttrClass(1 << 11);
    pub const STRING: Self = AttrClass(1 << 12);
    pub const STROFFSETSPTR: Self = AttrClass(1 << 13);
    pub const ADDRPTR: Self = AttrClass(1 << 14);
    /// Known attribute whose value is ignored
    pub const UNDEFINED: Self = AttrClass(1 << 15);

    const NONE: Self = AttrClass(0);

    #[must_use]
    pub const fn union(self, other: Self) -> Self
    {
        AttrClass(self.0 | other.0)
    }

    pub const fn intersects(self, other: Self) -> bool
    {
        self.0 & other.0 != 0
    }

    /// Lowest set bit, if any.
    pub const fn lowest(self) -> Option<Self>
    {
        if self.0 == 0 {
            None
        } else {
            Some(AttrClass(self.0 & self.0.wrapping_neg()))
        }
    }
}

impl fmt::Display for AttrClass
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match *self {
            AttrClass::ADDRESS => "address",
            AttrClass::BLOCK => "block",
            AttrClass::CONST => "constant",
            AttrClass::EXPRLOC => "exprloc",
            AttrClass::FLAG => "flag",
            AttrClass::LINEPTR => "lineptr",
            AttrClass::LOCLIST => "loclist",
            AttrClass::LOCLISTPTR => "loclistptr",
            AttrClass::MACPTR => "macptr",
            AttrClass::RNGLISTPTR => "rnglistptr",
            AttrClass::RNGLIST => "rnglist",
            AttrClass::REFERENCE => "reference",
            AttrClass::STRING => "string",
            AttrClass::STROFFSETSPTR => "stroffsetsptr",
            AttrClass::ADDRPTR => "addrptr",
            AttrClass::UNDEFINED => "undefined",
            _ => return write!(f, "classes({:#06x})", self.0),
        };
        f.write_str(name)
    }
}

const LOCATION: AttrClass = AttrClass::EXPRLOC.union(AttrClass::BLOCK).union(AttrClass::LOCLISTPTR);
const BOUND: AttrClass = AttrClass::BLOCK
    .union(AttrClass::CONST)
    .union(AttrClass::EXPRLOC)
    .union(AttrClass::REFERENCE);

/// Classes an attribute may take. Empty for unknown standard attributes.
#[allow(clippy::too_many_lines)]
pub fn attribute_classes(name: DwAt) -> AttrClass
{
    use constants::*;
    match name {
        DW_AT_sibling => AttrClass::REFERENCE,
        DW_AT_location => LOCATION,
        DW_AT_name => AttrClass::STRING,
        DW_AT_ordering => AttrClass::CONST,
        DW_AT_byte_size | DW_AT_bit_offset | DW_AT_bit_size => BOUND,
        DW_AT_stmt_list => AttrClass::LINEPTR,
        DW_AT_low_pc => AttrClass::ADDRESS,
        DW_AT_high_pc => AttrClass::ADDRESS.union(AttrClass::CONST),
        DW_AT_language => AttrClass::CONST,
        DW_AT_discr => AttrClass::REFERENCE,
        DW_AT_discr_value => AttrClass::CONST,
        DW_AT_visibility => AttrClass::CONST,
        DW_AT_import => AttrClass::REFERENCE,
        DW_AT_string_length => LOCATION,
        DW_AT_common_reference => AttrClass::REFERENCE,
        DW_AT_comp_dir => AttrClass::STRING,
        DW_AT_const_value => AttrClass::BLOCK.union(AttrClass::CONST).union(AttrClass::STRING),
        DW_AT_containing_type => AttrClass::REFERENCE,
        DW_AT_default_value => AttrClass::REFERENCE.union(AttrClass::CONST).union(AttrClass::FLAG),
        DW_AT_inline => AttrClass::CONST,
        DW_AT_is_optional => AttrClass::FLAG,
        DW_AT_lower_bound => BOUND,
        DW_AT_producer => AttrClass::STRING,
        DW_AT_prototyped => AttrClass::FLAG,
        DW_AT_return_addr => LOCATION,
        DW_AT_start_scope => AttrClass::CONST.union(AttrClass::RNGLISTPTR),
        DW_AT_bit_stride | DW_AT_byte_stride => BOUND,
        DW_AT_upper_bound | DW_AT_count => BOUND,
        DW_AT_abstract_origin => AttrClass::REFERENCE,
        DW_AT_accessibility => AttrClass::CONST,
        DW_AT_address_class => AttrClass::CONST,
        DW_AT_artificial => AttrClass::FLAG,
        DW_AT_base_types => AttrClass::REFERENCE,
        DW_AT_calling_convention => AttrClass::CONST,
        DW_AT_data_member_location => AttrClass::BLOCK.union(AttrClass::CONST).union(AttrClass::EXPRLOC).union(AttrClass::LOCLISTPTR),
        DW_AT_decl_column | DW_AT_decl_file | DW_AT_decl_line => AttrClass::CONST,
        DW_AT_declaration => AttrClass::FLAG,
        DW_AT_discr_list => AttrClass::BLOCK,
        DW_AT_encoding => AttrClass::CONST,
        DW_AT_external => AttrClass::FLAG,
        DW_AT_frame_base => LOCATION,
        DW_AT_friend => AttrClass::REFERENCE,
        DW_AT_identifier_case => AttrClass::CONST,
        DW_AT_macro_info => AttrClass::MACPTR,
        DW_AT_namelist_item => AttrClass::REFERENCE.union(AttrClass::BLOCK),
        DW_AT_priority => AttrClass::REFERENCE,
        DW_AT_segment => LOCATION,
        DW_AT_specification => AttrClass::REFERENCE,
        DW_AT_static_link => LOCATION,
        DW_AT_type => AttrClass::REFERENCE,
        DW_AT_use_location => LOCATION,
        DW_AT_variable_parameter => AttrClass::FLAG,
        DW_AT_virtuality => AttrClass::CONST,
        DW_AT_vtable_elem_location => LOCATION,
        DW_AT_allocated | DW_AT_associated => BOUND,
        DW_AT_data_location => AttrClass::BLOCK.union(AttrClass::EXPRLOC),
        DW_AT_entry_pc => AttrClass::ADDRESS.union(AttrClass::CONST),
        DW_AT_use_UTF8 => AttrClass::FLAG,
        DW_AT_extension => AttrClass::REFERENCE,
        DW_AT_ranges => AttrClass::RNGLISTPTR,
        DW_AT_trampoline => AttrClass::ADDRESS
            .union(AttrClass::FLAG)
            .union(AttrClass::REFERENCE)
            .union(AttrClass::STRING),
        DW_AT_call_column | DW_AT_call_file | DW_AT_call_line => AttrClass::CONST,
        DW_AT_description => AttrClass::STRING,
        DW_AT_binary_scale | DW_AT_decimal_scale | DW_AT_decimal_sign | DW_AT_digit_count => AttrClass::CONST,
        DW_AT_small => AttrClass::REFERENCE,
        DW_AT_picture_string => AttrClass::STRING,
        DW_AT_mutable | DW_AT_threads_scaled | DW_AT_explicit => AttrClass::FLAG,
        DW_AT_object_pointer => AttrClass::REFERENCE,
        DW_AT_endianity => AttrClass::CONST,
        DW_AT_elemental | DW_AT_pure | DW_AT_recursive => AttrClass::FLAG,
        DW_AT_signature => AttrClass::REFERENCE,
        DW_AT_main_subprogram => AttrClass::FLAG,
        DW_AT_data_bit_offset => AttrClass::CONST,
        DW_AT_const_expr | DW_AT_enum_class => AttrClass::FLAG,
        DW_AT_linkage_name | DW_AT_MIPS_linkage_name => AttrClass::STRING,
        DW_AT_string_length_bit_size | DW_AT_string_length_byte_size => AttrClass::CONST,
        DW_AT_rank => AttrClass::CONST.union(AttrClass::EXPRLOC),
        DW_AT_str_offsets_base => AttrClass::STROFFSETSPTR,
        DW_AT_addr_base | DW_AT_GNU_addr_base => AttrClass::ADDRPTR,
        DW_AT_rnglists_base => AttrClass::RNGLISTPTR,
        DW_AT_dwo_name | DW_AT_GNU_dwo_name => AttrClass::STRING,
        DW_AT_reference | DW_AT_rvalue_reference => AttrClass::FLAG,
        DW_AT_macros | DW_AT_GNU_macros => AttrClass::MACPTR,
        DW_AT_call_all_calls | DW_AT_call_all_source_calls | DW_AT_call_all_tail_calls => AttrClass::FLAG,
        DW_AT_call_return_pc | DW_AT_call_pc => AttrClass::ADDRESS,
        DW_AT_call_value | DW_AT_call_origin | DW_AT_call_target | DW_AT_call_target_clobbered => {
            AttrClass::EXPRLOC.union(AttrClass::REFERENCE)
        }
        DW_AT_call_data_location | DW_AT_call_data_value => AttrClass::EXPRLOC,
        DW_AT_call_parameter => AttrClass::REFERENCE,
        DW_AT_call_tail_call | DW_AT_noreturn | DW_AT_export_symbols | DW_AT_deleted => AttrClass::FLAG,
        DW_AT_alignment | DW_AT_defaulted => AttrClass::CONST,
        DW_AT_loclists_base => AttrClass::LOCLISTPTR,
        // 0x75: DW_AT_dwo_id from DWARF 5 drafts, emitted by older toolchains
        DwAt(0x75) | DW_AT_GNU_dwo_id => AttrClass::CONST,
        DW_AT_GNU_vector
        | DW_AT_GNU_tail_call
        | DW_AT_GNU_all_tail_call_sites
        | DW_AT_GNU_all_call_sites
        | DW_AT_GNU_all_source_call_sites
        | DW_AT_GNU_pubnames => AttrClass::FLAG,
        DW_AT_GNU_call_site_value
        | DW_AT_GNU_call_site_data_value
        | DW_AT_GNU_call_site_target
        | DW_AT_GNU_call_site_target_clobbered => AttrClass::EXPRLOC,
        DW_AT_GNU_discriminator => AttrClass::CONST,
        _ if (DW_AT_lo_user.0..=DW_AT_hi_user.0).contains(&name.0) => AttrClass::UNDEFINED,
        _ => AttrClass::NONE,
    }
}

const DATA: AttrClass = AttrClass::CONST
    .union(AttrClass::LINEPTR)
    .union(AttrClass::LOCLISTPTR)
    .union(AttrClass::MACPTR)
    .union(AttrClass::RNGLISTPTR);
const SECTION_OFFSET: AttrClass = AttrClass::LINEPTR
    .union(AttrClass::LOCLISTPTR)
    .union(AttrClass::MACPTR)
    .union(AttrClass::RNGLISTPTR)
    .union(AttrClass::STROFFSETSPTR)
    .union(AttrClass::ADDRPTR);

/// Classes a form can encode. Empty for unknown forms and `DW_FORM_indirect`.
pub fn form_classes(form: DwForm) -> AttrClass
{
    use constants::*;
    match form {
        DW_FORM_addr | DW_FORM_addrx | DW_FORM_addrx1 | DW_FORM_addrx2 | DW_FORM_addrx3 | DW_FORM_addrx4
        | DW_FORM_GNU_addr_index => AttrClass::ADDRESS,
        DW_FORM_block1 | DW_FORM_block2 | DW_FORM_block4 | DW_FORM_block => AttrClass::BLOCK,
        DW_FORM_data4 | DW_FORM_data8 => DATA,
        DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data16 | DW_FORM_sdata | DW_FORM_udata | DW_FORM_implicit_const => {
            AttrClass::CONST
        }
        DW_FORM_exprloc => AttrClass::EXPRLOC,
        DW_FORM_flag | DW_FORM_flag_present => AttrClass::FLAG,
        DW_FORM_sec_offset => SECTION_OFFSET,
        DW_FORM_loclistx => AttrClass::LOCLISTPTR,
        DW_FORM_rnglistx => AttrClass::RNGLISTPTR,
        DW_FORM_ref1
        | DW_FORM_ref2
        | DW_FORM_ref4
        | DW_FORM_ref8
        | DW_FORM_ref_udata
        | DW_FORM_ref_addr
        | DW_FORM_ref_sig8
        | DW_FORM_ref_sup4
        | DW_FORM_ref_sup8
        | DW_FORM_GNU_ref_alt => AttrClass::REFERENCE,
        DW_FORM_string
        | DW_FORM_strp
        | DW_FORM_line_strp
        | DW_FORM_strp_sup
        | DW_FORM_GNU_strp_alt
        | DW_FORM_strx
        | DW_FORM_strx1
        | DW_FORM_strx2
        | DW_FORM_strx3
        | DW_FORM_strx4
        | DW_FORM_GNU_str_index => AttrClass::STRING,
        _ => AttrClass::NONE,
    }
}

/// Pick the class for an `(attribute, form)` pair.
///
/// Returns `Ok(None)` for attributes whose value is deliberately ignored.
///
/// ## Errors
///
/// [`SymError::MalformedData`] when either side is unknown or the two share no
/// class.
pub fn select_class(name: DwAt, form: DwForm) -> Result<Option<AttrClass>>
{
    let attr_classes = attribute_classes(name);
    if attr_classes == AttrClass::UNDEFINED {
        return Ok(None);
    }
    let form_classes = form_classes(form);
    if attr_classes == AttrClass::NONE || form_classes == AttrClass::NONE {
        return Err(SymError::malformed(format!("reserved attribute/form pair {name}/{form}")));
    }
    match AttrClass(attr_classes.0 & form_classes.0).lowest() {
        Some(class) => Ok(Some(class)),
        None => Err(SymError::malformed(format!("form {form} cannot encode attribute {name}"))),
    }
}

/// Raw, unresolved attribute bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormValue<'data>
{
    Addr(u64),
    AddrIndex(u64),
    Block(&'data [u8]),
    Expr(&'data [u8]),
    Data(u64),
    Data16(u64, u64),
    SData(i64),
    Flag(bool),
    /// Absolute `.debug_info` offset
    InfoRef(u64),
    /// Type-unit signature or supplementary-file reference
    ExternalRef(u64),
    InlineStr(&'data [u8]),
    StrOffset(u64),
    LineStrOffset(u64),
    SupStrOffset(u64),
    StrIndex(u64),
    SecOffset(u64),
    LocListIndex(u64),
    RngListIndex(u64),
}

/// Encoding facts needed to size and interpret forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormContext
{
    pub version: u16,
    /// `.debug_info` offset of the unit header, base of unit-relative references
    pub unit_offset: u64,
}

fn read_len_prefixed<'data>(cursor: &mut BinaryCursor<'data>, len: u64) -> Result<&'data [u8]>
{
    let len = usize::try_from(len).map_err(|_| SymError::malformed("block length"))?;
    cursor.read_bytes(len)
}

/// Read one attribute value in `form` from `cursor`.
///
/// The cursor's address size and format must match the unit.
pub fn read_form<'data>(
    cursor: &mut BinaryCursor<'data>,
    form: DwForm,
    implicit_const: Option<i64>,
    ctx: FormContext,
) -> Result<FormValue<'data>>
{
    use constants::*;
    let mut form = form;
    // Nested indirection is legal but pointless; bound it anyway.
    for _ in 0..4 {
        if form != DW_FORM_indirect {
            break;
        }
        let next = cursor.read_uleb128()?;
        form = DwForm(u16::try_from(next).map_err(|_| SymError::malformed("indirect form"))?);
    }

    let value = match form {
        DW_FORM_addr => FormValue::Addr(cursor.read_address()?),
        DW_FORM_addrx | DW_FORM_GNU_addr_index => FormValue::AddrIndex(cursor.read_uleb128()?),
        DW_FORM_addrx1 => FormValue::AddrIndex(u64::from(cursor.read_u8()?)),
        DW_FORM_addrx2 => FormValue::AddrIndex(u64::from(cursor.read_u16()?)),
        DW_FORM_addrx3 => FormValue::AddrIndex(u64::from(cursor.read_u24()?)),
        DW_FORM_addrx4 => FormValue::AddrIndex(u64::from(cursor.read_u32()?)),

        DW_FORM_block1 => {
            let len = u64::from(cursor.read_u8()?);
            FormValue::Block(read_len_prefixed(cursor, len)?)
        }
        DW_FORM_block2 => {
            let len = u64::from(cursor.read_u16()?);
            FormValue::Block(read_len_prefixed(cursor, len)?)
        }
        DW_FORM_block4 => {
            let len = u64::from(cursor.read_u32()?);
            FormValue::Block(read_len_prefixed(cursor, len)?)
        }
        DW_FORM_block => {
            let len = cursor.read_uleb128()?;
            FormValue::Block(read_len_prefixed(cursor, len)?)
        }
        DW_FORM_exprloc => {
            let len = cursor.read_uleb128()?;
            FormValue::Expr(read_len_prefixed(cursor, len)?)
        }

        DW_FORM_data1 => FormValue::Data(u64::from(cursor.read_u8()?)),
        DW_FORM_data2 => FormValue::Data(u64::from(cursor.read_u16()?)),
        DW_FORM_data4 => FormValue::Data(u64::from(cursor.read_u32()?)),
        DW_FORM_data8 => FormValue::Data(cursor.read_u64()?),
        DW_FORM_data16 => {
            let lo = cursor.read_u64()?;
            let hi = cursor.read_u64()?;
            FormValue::Data16(lo, hi)
        }
        DW_FORM_sdata => FormValue::SData(cursor.read_sleb128()?),
        DW_FORM_udata => FormValue::Data(cursor.read_uleb128()?),
        DW_FORM_implicit_const => {
            FormValue::SData(implicit_const.ok_or_else(|| SymError::malformed("implicit_const without value"))?)
        }

        DW_FORM_flag => FormValue::Flag(cursor.read_u8()? != 0),
        DW_FORM_flag_present => FormValue::Flag(true),

        DW_FORM_ref1 => FormValue::InfoRef(ctx.unit_offset + u64::from(cursor.read_u8()?)),
        DW_FORM_ref2 => FormValue::InfoRef(ctx.unit_offset + u64::from(cursor.read_u16()?)),
        DW_FORM_ref4 => FormValue::InfoRef(ctx.unit_offset + u64::from(cursor.read_u32()?)),
        DW_FORM_ref8 => FormValue::InfoRef(ctx.unit_offset.wrapping_add(cursor.read_u64()?)),
        DW_FORM_ref_udata => FormValue::InfoRef(ctx.unit_offset.wrapping_add(cursor.read_uleb128()?)),
        DW_FORM_ref_addr => {
            if ctx.version <= 2 {
                FormValue::InfoRef(cursor.read_address()?)
            } else {
                FormValue::InfoRef(cursor.read_offset()?)
            }
        }
        DW_FORM_ref_sig8 => FormValue::ExternalRef(cursor.read_u64()?),
        DW_FORM_ref_sup4 => FormValue::ExternalRef(u64::from(cursor.read_u32()?)),
        DW_FORM_ref_sup8 => FormValue::ExternalRef(cursor.read_u64()?),
        DW_FORM_GNU_ref_alt => FormValue::ExternalRef(cursor.read_offset()?),

        DW_FORM_string => FormValue::InlineStr(cursor.read_cstr()?),
        DW_FORM_strp => FormValue::StrOffset(cursor.read_offset()?),
        DW_FORM_line_strp => FormValue::LineStrOffset(cursor.read_offset()?),
        DW_FORM_strp_sup | DW_FORM_GNU_strp_alt => FormValue::SupStrOffset(cursor.read_offset()?),
        DW_FORM_strx | DW_FORM_GNU_str_index => FormValue::StrIndex(cursor.read_uleb128()?),
        DW_FORM_strx1 => FormValue::StrIndex(u64::from(cursor.read_u8()?)),
        DW_FORM_strx2 => FormValue::StrIndex(u64::from(cursor.read_u16()?)),
        DW_FORM_strx3 => FormValue::StrIndex(u64::from(cursor.read_u24()?)),
        DW_FORM_strx4 => FormValue::StrIndex(u64::from(cursor.read_u32()?)),

        DW_FORM_sec_offset => FormValue::SecOffset(cursor.read_offset()?),
        DW_FORM_loclistx => FormValue::LocListIndex(cursor.read_uleb128()?),
        DW_FORM_rnglistx => FormValue::RngListIndex(cursor.read_uleb128()?),

        _ => return Err(SymError::malformed(format!("unknown form {form}"))),
    };
    Ok(value)
}

/// A decoded attribute value, tagged by class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeValue<'data>
{
    Address(u64),
    Block(&'data [u8]),
    /// 128-bit constant, low and high halves (sign-extended for `sdata`)
    Const
    {
        lo: u64,
        hi: u64,
    },
    Expr(&'data [u8]),
    Flag(bool),
    /// Absolute `.debug_info` offset of the referenced entry
    Reference(u64),
    /// Reference into a type unit or supplementary file, not followed
    External(u64),
    String(&'data [u8]),
    /// Offset into the section implied by `class`
    SectionPtr
    {
        class: AttrClass,
        offset: u64,
    },
}

impl<'data> AttributeValue<'data>
{
    pub fn as_u64(&self) -> Option<u64>
    {
        match *self {
            AttributeValue::Const { lo, .. } => Some(lo),
            AttributeValue::Address(value)
            | AttributeValue::Reference(value)
            | AttributeValue::SectionPtr { offset: value, .. } => Some(value),
            AttributeValue::Flag(flag) => Some(u64::from(flag)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64>
    {
        match *self {
            AttributeValue::Const { lo, .. } => Some(lo as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'data [u8]>
    {
        match *self {
            AttributeValue::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> bool
    {
        matches!(*self, AttributeValue::Flag(true))
    }

    pub fn as_reference(&self) -> Option<u64>
    {
        match *self {
            AttributeValue::Reference(offset) => Some(offset),
            _ => None,
        }
    }

    /// Expression bytes, from either an `exprloc` or a legacy block form.
    pub fn as_expr(&self) -> Option<&'data [u8]>
    {
        match *self {
            AttributeValue::Expr(ops) | AttributeValue::Block(ops) => Some(ops),
            _ => None,
        }
    }
}

/// A decoded attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'data>
{
    pub name: DwAt,
    pub form: DwForm,
    pub value: AttributeValue<'data>,
}

fn sign_extended(value: i64) -> AttributeValue<'static>
{
    AttributeValue::Const {
        lo: value as u64,
        hi: if value < 0 { u64::MAX } else { 0 },
    }
}

/// Resolve a raw value into `class`, following index tables through `unit`.
pub fn resolve_value<'data>(
    class: AttrClass,
    raw: FormValue<'data>,
    unit: &UnitRef<'_, 'data>,
) -> Result<AttributeValue<'data>>
{
    let mismatch = || SymError::malformed(format!("form value {raw:?} does not fit class {class}"));
    let value = match class {
        AttrClass::ADDRESS => match raw {
            FormValue::Addr(address) => AttributeValue::Address(address),
            FormValue::AddrIndex(index) => AttributeValue::Address(unit.addr_table().get(index)?),
            _ => return Err(mismatch()),
        },
        AttrClass::BLOCK => match raw {
            FormValue::Block(bytes) => AttributeValue::Block(bytes),
            _ => return Err(mismatch()),
        },
        AttrClass::EXPRLOC => match raw {
            FormValue::Expr(bytes) => AttributeValue::Expr(bytes),
            _ => return Err(mismatch()),
        },
        AttrClass::CONST => match raw {
            FormValue::Data(value) => AttributeValue::Const { lo: value, hi: 0 },
            FormValue::Data16(lo, hi) => AttributeValue::Const { lo, hi },
            FormValue::SData(value) => sign_extended(value),
            _ => return Err(mismatch()),
        },
        AttrClass::FLAG => match raw {
            FormValue::Flag(flag) => AttributeValue::Flag(flag),
            _ => return Err(mismatch()),
        },
        AttrClass::REFERENCE => match raw {
            FormValue::InfoRef(offset) => AttributeValue::Reference(offset),
            FormValue::ExternalRef(signature) => AttributeValue::External(signature),
            _ => return Err(mismatch()),
        },
        AttrClass::STRING => {
            let sections = unit.sections;
            match raw {
                FormValue::InlineStr(bytes) => AttributeValue::String(bytes),
                FormValue::StrOffset(offset) => AttributeValue::String(cstr_at(sections.debug_str, offset)?),
                FormValue::LineStrOffset(offset) => {
                    AttributeValue::String(cstr_at(sections.debug_line_str, offset)?)
                }
                FormValue::StrIndex(index) => AttributeValue::String(unit.string_at_index(index)?),
                FormValue::SupStrOffset(_) => {
                    return Err(SymError::Unsupported("strings in a supplementary object file".into()));
                }
                _ => return Err(mismatch()),
            }
        }
        AttrClass::LOCLISTPTR | AttrClass::LOCLIST => match raw {
            FormValue::SecOffset(offset) | FormValue::Data(offset) => AttributeValue::SectionPtr { class, offset },
            FormValue::LocListIndex(index) => AttributeValue::SectionPtr {
                class,
                offset: unit.loclist_offset(index)?,
            },
            _ => return Err(mismatch()),
        },
        AttrClass::RNGLISTPTR | AttrClass::RNGLIST => match raw {
            FormValue::SecOffset(offset) | FormValue::Data(offset) => AttributeValue::SectionPtr { class, offset },
            FormValue::RngListIndex(index) => AttributeValue::SectionPtr {
                class,
                offset: unit.rnglist_offset(index)?,
            },
            _ => return Err(mismatch()),
        },
        AttrClass::LINEPTR | AttrClass::MACPTR | AttrClass::STROFFSETSPTR | AttrClass::ADDRPTR => match raw {
            FormValue::SecOffset(offset) | FormValue::Data(offset) => AttributeValue::SectionPtr { class, offset },
            _ => return Err(mismatch()),
        },
        _ => return Err(mismatch()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::cursor::Format;

    #[test]
    fn test_class_selection_is_deterministic()
    {
        use constants::*;
        assert_eq!(select_class(DW_AT_name, DW_FORM_strp).unwrap(), Some(AttrClass::STRING));
        assert_eq!(select_class(DW_AT_high_pc, DW_FORM_data4).unwrap(), Some(AttrClass::CONST));
        assert_eq!(select_class(DW_AT_high_pc, DW_FORM_addr).unwrap(), Some(AttrClass::ADDRESS));
        assert_eq!(select_class(DW_AT_location, DW_FORM_exprloc).unwrap(), Some(AttrClass::EXPRLOC));
        assert_eq!(select_class(DW_AT_location, DW_FORM_sec_offset).unwrap(), Some(AttrClass::LOCLISTPTR));
        assert_eq!(select_class(DW_AT_location, DW_FORM_data4).unwrap(), Some(AttrClass::LOCLISTPTR));
        assert_eq!(select_class(DW_AT_location, DW_FORM_block1).unwrap(), Some(AttrClass::BLOCK));
        assert_eq!(
            select_class(DW_AT_data_member_location, DW_FORM_data1).unwrap(),
            Some(AttrClass::CONST)
        );
        assert_eq!(select_class(DW_AT_stmt_list, DW_FORM_data4).unwrap(), Some(AttrClass::LINEPTR));
        assert_eq!(select_class(DW_AT_ranges, DW_FORM_rnglistx).unwrap(), Some(AttrClass::RNGLISTPTR));
        assert_eq!(select_class(DW_AT_type, DW_FORM_ref4).unwrap(), Some(AttrClass::REFERENCE));
    }

    #[test]
    fn test_reserved_pairs_fail()
    {
        use constants::*;
        assert!(select_class(DW_AT_name, DW_FORM_data4).is_err());
        assert!(select_class(DW_AT_type, DW_FORM_string).is_err());
        assert!(select_class(DwAt(0x7fff), DW_FORM_data1).is_err());
        assert!(select_class(DW_AT_name, DwForm(0x7f)).is_err());
    }

    #[test]
    fn test_vendor_attribute_ignored()
    {
        assert_eq!(select_class(DwAt(0x3e00), constants::DW_FORM_data1).unwrap(), None);
    }

    #[test]
    fn test_runtime_bounds_take_expressions()
    {
        use constants::*;
        for name in [DW_AT_upper_bound, DW_AT_lower_bound, DW_AT_count, DW_AT_byte_size, DW_AT_bit_stride] {
            assert_eq!(select_class(name, DW_FORM_exprloc).unwrap(), Some(AttrClass::EXPRLOC), "{name}");
        }
        assert_eq!(select_class(DW_AT_upper_bound, DW_FORM_data1).unwrap(), Some(AttrClass::CONST));
        assert_eq!(select_class(DW_AT_count, DW_FORM_ref4).unwrap(), Some(AttrClass::REFERENCE));
    }

    #[test]
    fn test_dwo_id_is_a_constant()
    {
        use constants::*;
        assert_eq!(select_class(DwAt(0x75), DW_FORM_data8).unwrap(), Some(AttrClass::CONST));
        assert_eq!(select_class(DW_AT_GNU_dwo_id, DW_FORM_data8).unwrap(), Some(AttrClass::CONST));
        // Attributes after it in the table still get their own classes.
        assert_eq!(select_class(DW_AT_GNU_discriminator, DW_FORM_data1).unwrap(), Some(AttrClass::CONST));
        assert_eq!(select_class(DW_AT_GNU_pubnames, DW_FORM_flag_present).unwrap(), Some(AttrClass::FLAG));
    }

    fn ctx() -> FormContext
    {
        FormContext {
            version: 4,
            unit_offset: 0x100,
        }
    }

    #[test]
    fn test_read_form_widths()
    {
        use constants::*;
        let bytes = [
            0x05, // data1
            0x34, 0x12, // data2
            0x7f, // sdata -1
            0x03, 0xaa, 0xbb, 0xcc, // block1
            0x10, // ref1 -> unit + 0x10
            0x20, 0, 0, 0, // ref_addr (v4: offset size)
            b'h', b'i', 0, // string
        ];
        let mut cursor = BinaryCursor::new(&bytes).with_format(Format::Dwarf32);
        assert_eq!(read_form(&mut cursor, DW_FORM_data1, None, ctx()).unwrap(), FormValue::Data(5));
        assert_eq!(read_form(&mut cursor, DW_FORM_data2, None, ctx()).unwrap(), FormValue::Data(0x1234));
        assert_eq!(read_form(&mut cursor, DW_FORM_sdata, None, ctx()).unwrap(), FormValue::SData(-1));
        assert_eq!(
            read_form(&mut cursor, DW_FORM_block1, None, ctx()).unwrap(),
            FormValue::Block(&[0xaa, 0xbb, 0xcc])
        );
        assert_eq!(read_form(&mut cursor, DW_FORM_ref1, None, ctx()).unwrap(), FormValue::InfoRef(0x110));
        assert_eq!(read_form(&mut cursor, DW_FORM_ref_addr, None, ctx()).unwrap(), FormValue::InfoRef(0x20));
        assert_eq!(
            read_form(&mut cursor, DW_FORM_string, None, ctx()).unwrap(),
            FormValue::InlineStr(b"hi")
        );
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_read_form_indirect_and_implicit()
    {
        use constants::*;
        let bytes = [0x0b, 0x2a];
        let mut cursor = BinaryCursor::new(&bytes);
        assert_eq!(read_form(&mut cursor, DW_FORM_indirect, None, ctx()).unwrap(), FormValue::Data(0x2a));
        assert_eq!(
            read_form(&mut cursor, DW_FORM_implicit_const, Some(-3), ctx()).unwrap(),
            FormValue::SData(-3)
        );
        assert!(read_form(&mut cursor, DW_FORM_implicit_const, None, ctx()).is_err());
    }

    #[test]
    fn test_truncated_block_fails()
    {
        let bytes = [0x05, 0x01];
        let mut cursor = BinaryCursor::new(&bytes);
        assert!(read_form(&mut cursor, constants::DW_FORM_block1, None, ctx()).is_err());
    }

    #[test]
    fn test_lowest_class_bit()
    {
        assert_eq!(AttrClass(0b0110).lowest(), Some(AttrClass(0b0010)));
        assert_eq!(AttrClass(0).lowest(), None);
    }
}
