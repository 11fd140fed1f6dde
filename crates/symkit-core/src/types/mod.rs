//! Value types shared by every module: registers and the backend-neutral
//! symbol model.

pub mod registers;
pub mod symbols;

pub use registers::{arm64, x86, x86_64, Arch, RegisterFile, RegisterId, REGISTER_SLOTS};
pub use symbols::{
    Access, AddrRange, Member, MemberKind, Modifiers, Module, ModuleId, Proc, Rebase, Type, TypeKind, TypePayload,
    TypeRef, Var, VarKind,
};
