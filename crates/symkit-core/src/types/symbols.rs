//! Backend-neutral symbol model.
//!
//! Every backend (DWARF, CodeView, ELF symbol tables) reports modules,
//! procedures, variables, members and types using these records. Addresses
//! stored in them are in the *stored* space until the facade rebases them.

use std::fmt;

use smallvec::SmallVec;

use crate::line_table::{LineEntry, LineHit};
use crate::location::EncodedLocation;

/// Index of a module within the loaded debug info
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "module#{}", self.0)
    }
}

/// Opaque backend reference to a type
///
/// For DWARF this is the `.debug_info` offset of the type's entry; for
/// CodeView it is the type index. References are only meaningful to the
/// backend that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeRef(pub u64);

/// Half-open address interval `[lo, hi)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AddrRange
{
    pub lo: u64,
    pub hi: u64,
}

impl AddrRange
{
    pub const fn new(lo: u64, hi: u64) -> Self
    {
        Self { lo, hi }
    }

    pub const fn len(&self) -> u64
    {
        self.hi.saturating_sub(self.lo)
    }

    pub const fn is_empty(&self) -> bool
    {
        self.hi <= self.lo
    }

    pub const fn contains(&self, address: u64) -> bool
    {
        self.lo <= address && address < self.hi
    }
}

impl fmt::Display for AddrRange
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "[0x{:x}, 0x{:x})", self.lo, self.hi)
    }
}

/// One compile unit, PDB module or symbol-table partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module
{
    pub id: ModuleId,
    pub name: String,
    pub comp_dir: Option<String>,
    pub producer: Option<String>,
    /// Raw language code (`DW_LANG_*` or `CV_CFL_*`), when known
    pub language: Option<u16>,
}

/// A procedure (function) with a code range
#[derive(Debug, Clone, PartialEq)]
pub struct Proc<'data>
{
    pub name: String,
    pub module: ModuleId,
    /// Full virtual-address extent of the procedure
    pub range: AddrRange,
    /// Narrower range excluding prologue and epilogue, when the format records it
    pub debug_range: AddrRange,
    /// Every contiguous piece of the code, for procedures split across ranges
    pub pieces: SmallVec<[AddrRange; 1]>,
    pub ty: Option<TypeRef>,
    /// Frame base for DWARF, `Null` when the format has none
    pub frame_base: EncodedLocation<'data>,
    /// Backend locator used to enumerate locals (DIE or symbol offset)
    pub locator: u64,
}

/// Kind of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind
{
    Global,
    Local,
    Parameter,
}

/// A global, local or parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Var<'data>
{
    pub name: String,
    pub kind: VarKind,
    pub ty: Option<TypeRef>,
    pub location: EncodedLocation<'data>,
}

/// Member visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access
{
    #[default]
    None,
    Public,
    Protected,
    Private,
}

/// Kind-specific payload of a [`Member`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind
{
    /// Field at a byte offset from the start of the object
    Data
    {
        offset: u64,
    },
    /// Bit-field: `bit_size` bits starting `bit_offset` bits past `offset`
    Bitfield
    {
        offset: u64,
        bit_offset: u32,
        bit_size: u32,
    },
    /// Static member; storage lives elsewhere
    StaticData,
    /// Enumerator and its value (two's complement for negative values)
    EnumValue
    {
        value: u64,
    },
    /// Member function, with its vtable slot when virtual
    Method
    {
        vtable_offset: Option<u64>,
        is_virtual: bool,
    },
    /// Non-virtual base class at a byte offset
    BaseClass
    {
        offset: u64,
    },
    /// Virtual base class, located through the vbase table
    VirtualBase
    {
        vbase_offset: u64,
    },
    /// Formal parameter of a procedure type
    Parameter,
}

/// A member of a struct, class, union, enum or procedure type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member
{
    pub name: Option<String>,
    pub ty: Option<TypeRef>,
    pub access: Access,
    pub kind: MemberKind,
}

/// Type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind
{
    Void,
    Bool,
    Char8,
    Char16,
    Char32,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Float32,
    Float64,
    Float80,
    Float128,
    Struct,
    Class,
    Union,
    Enum,
    Pointer,
    PtrToMember,
    Array,
    Proc,
    Method,
    Typedef,
    Bitfield,
}

impl TypeKind
{
    /// Whether values of this kind have members reachable through `members()`.
    pub const fn has_members(self) -> bool
    {
        matches!(
            self,
            TypeKind::Struct | TypeKind::Class | TypeKind::Union | TypeKind::Enum | TypeKind::Proc | TypeKind::Method
        )
    }

    /// Whether this kind is a scalar primitive.
    pub const fn is_primitive(self) -> bool
    {
        matches!(
            self,
            TypeKind::Void
                | TypeKind::Bool
                | TypeKind::Char8
                | TypeKind::Char16
                | TypeKind::Char32
                | TypeKind::Int8
                | TypeKind::Int16
                | TypeKind::Int32
                | TypeKind::Int64
                | TypeKind::Int128
                | TypeKind::UInt8
                | TypeKind::UInt16
                | TypeKind::UInt32
                | TypeKind::UInt64
                | TypeKind::UInt128
                | TypeKind::Float32
                | TypeKind::Float64
                | TypeKind::Float80
                | TypeKind::Float128
        )
    }
}

/// Type qualifier bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifiers(u16);

impl Modifiers
{
    pub const NONE: Self = Modifiers(0);
    pub const CONST: Self = Modifiers(1 << 0);
    pub const VOLATILE: Self = Modifiers(1 << 1);
    pub const ATOMIC: Self = Modifiers(1 << 2);
    pub const RESTRICT: Self = Modifiers(1 << 3);
    pub const PACKED: Self = Modifiers(1 << 4);
    pub const SHARED: Self = Modifiers(1 << 5);
    pub const IMMUTABLE: Self = Modifiers(1 << 6);
    pub const REFERENCE: Self = Modifiers(1 << 7);
    pub const RVALUE_REFERENCE: Self = Modifiers(1 << 8);
    /// The base type is a character type (`signed char`, `unsigned char`)
    pub const CHAR: Self = Modifiers(1 << 9);
    pub const UNALIGNED: Self = Modifiers(1 << 10);

    pub const fn bits(self) -> u16
    {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool
    {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self)
    {
        self.0 |= other.0;
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self
    {
        Modifiers(self.0 | other.0)
    }
}

impl fmt::Display for Modifiers
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        const NAMES: [(Modifiers, &str); 11] = [
            (Modifiers::CONST, "const"),
            (Modifiers::VOLATILE, "volatile"),
            (Modifiers::ATOMIC, "atomic"),
            (Modifiers::RESTRICT, "restrict"),
            (Modifiers::PACKED, "packed"),
            (Modifiers::SHARED, "shared"),
            (Modifiers::IMMUTABLE, "immutable"),
            (Modifiers::REFERENCE, "&"),
            (Modifiers::RVALUE_REFERENCE, "&&"),
            (Modifiers::CHAR, "char"),
            (Modifiers::UNALIGNED, "unaligned"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Kind-specific payload of a [`Type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypePayload
{
    None,
    /// Total element count across every dimension
    Array
    {
        count: u64,
    },
    /// Locator of the procedure's parameter list (iterate it with `members()`)
    Proc
    {
        params: TypeRef,
        param_count: u32,
    },
    Bitfield
    {
        bit_offset: u32,
        bit_size: u32,
    },
    /// Containing class of a method or pointer-to-member
    Owner
    {
        class: TypeRef,
    },
}

/// A type, resolved one level deep
///
/// `next` points at the referenced type (pointee, element, return type,
/// typedef target, enum underlying type) and is never followed eagerly, so
/// cyclic type graphs are representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type
{
    pub kind: TypeKind,
    pub modifiers: Modifiers,
    pub size: u64,
    pub name: Option<String>,
    pub next: Option<TypeRef>,
    pub payload: TypePayload,
    /// The reference this type was resolved from
    pub origin: TypeRef,
}

impl Type
{
    /// Primitive type with no name, modifiers or successor.
    pub fn primitive(kind: TypeKind, size: u64, origin: TypeRef) -> Self
    {
        Self {
            kind,
            modifiers: Modifiers::NONE,
            size,
            name: None,
            next: None,
            payload: TypePayload::None,
            origin,
        }
    }
}

/// Moves stored addresses into the load-address space
pub trait Rebase
{
    #[must_use]
    fn rebase(self, load_bias: u64) -> Self;
}

impl Rebase for AddrRange
{
    fn rebase(self, load_bias: u64) -> Self
    {
        AddrRange::new(self.lo.wrapping_add(load_bias), self.hi.wrapping_add(load_bias))
    }
}

impl Rebase for Proc<'_>
{
    fn rebase(mut self, load_bias: u64) -> Self
    {
        self.range = self.range.rebase(load_bias);
        self.debug_range = self.debug_range.rebase(load_bias);
        for piece in &mut self.pieces {
            *piece = piece.rebase(load_bias);
        }
        self.frame_base = self.frame_base.rebase(load_bias);
        self
    }
}

impl Rebase for Var<'_>
{
    fn rebase(mut self, load_bias: u64) -> Self
    {
        self.location = self.location.rebase(load_bias);
        self
    }
}

impl Rebase for LineEntry
{
    fn rebase(mut self, load_bias: u64) -> Self
    {
        self.address = self.address.wrapping_add(load_bias);
        self
    }
}

impl Rebase for LineHit
{
    fn rebase(mut self, load_bias: u64) -> Self
    {
        self.address = self.address.wrapping_add(load_bias);
        self
    }
}
