//! # symkit-core
//!
//! Debug-information resolution and virtual stack unwinding.
//!
//! Given the sections of a loaded image, this crate resolves addresses to
//! procedures, source lines, types and variables, and recovers caller frames
//! from unwind metadata. It provides:
//! - A from-scratch DWARF 2–5 decoder (abbreviations, attributes, types, line
//!   programs, location expressions)
//! - CodeView symbol, line and type records for PDB-style debug info
//! - ELF symbol tables as a last resort
//! - DWARF CFI and Windows x64 unwind-code interpreters
//!
//! ## Boundaries
//!
//! The crate performs no I/O. Section bytes arrive through
//! [`image::SectionProvider`]; registers and memory of the debuggee are read
//! through the [`access`] capabilities, which can answer "retry later"
//! separately from "failed".
//!
//! ## Entry point
//!
//! [`SymbolSession`] picks one backend per image and rebases every address
//! it hands out by the image's load bias.

pub mod access;
pub mod arena;
pub mod backend;
pub mod codeview;
pub mod config;
pub mod cursor;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod image;
pub mod line_table;
pub mod location;
pub mod range_map;
pub mod session;
pub mod type_graph;
pub mod types;
pub mod unwind;

pub use access::{AccessError, MemoryAccess, MemoryImage, RegisterAccess};
pub use backend::{BackendKind, DebugInfo};
pub use config::{LoadOptions, UnwindLimits};
// Re-export commonly used types
pub use error::{Result, Status, SymError};
pub use image::{ObjectImage, Section, SectionMap, SectionProvider};
pub use location::{EncodedLocation, Location};
pub use session::{LocationResult, SymbolSession};
pub use type_graph::{TypeGraph, TypeId};
pub use types::{AddrRange, Arch, Module, ModuleId, Proc, RegisterFile, RegisterId, Type, TypeKind, TypeRef, Var};
pub use unwind::{virtual_unwind_frame, UnwindSource};
