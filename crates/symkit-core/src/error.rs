//! # Error Types
//!
//! Error handling for debug-info decoding and virtual unwinding.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages. Internally every decoder propagates a [`SymError`];
//! at the public facade those errors collapse into the small caller-facing
//! [`Status`] set.

use thiserror::Error;

use crate::types::RegisterId;

/// Main error type for decoding and unwinding operations
///
/// ## Error Categories
///
/// 1. **Corruption**: `MalformedData` (truncated or inconsistent encodings)
/// 2. **Coverage**: `Unsupported` (valid input we do not implement)
/// 3. **Resources**: `ResourceExhausted` (arena limits, sticky)
/// 4. **Capabilities**: `Maybe`, `MemoryReadFailed`, `RegisterUnavailable`
/// 5. **Usage**: `InvalidUsage`, `NoDebugInfo`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymError
{
    /// The input bytes are corrupt or truncated
    ///
    /// `context` names the structure being decoded when the failure happened,
    /// e.g. `"uleb128"` or `"CIE augmentation"`.
    #[error("Malformed data: {context}")]
    MalformedData
    {
        /// What was being decoded
        context: String,
    },

    /// A well-formed construct that this library does not implement
    ///
    /// Kept distinct from `MalformedData` so callers can tell "corrupt" from
    /// "not yet supported" (for example `DW_OP_piece` or indirect pointer
    /// encodings in `.eh_frame`).
    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    /// An arena or pool reached its configured capacity
    ///
    /// Pools keep a sticky exhausted flag, so once this is reported every
    /// later allocation from the same pool fails as well.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A register or memory read cannot be satisfied yet
    ///
    /// The capability answered "retry later". The caller may re-issue the
    /// whole request once the debuggee data becomes available.
    #[error("Data not yet available: {0}")]
    Maybe(String),

    /// Reading target memory failed permanently
    #[error("Failed to read memory at 0x{0:016x}")]
    MemoryReadFailed(u64),

    /// A register required by an expression or unwind rule has no value
    #[error("Register {0} is unavailable")]
    RegisterUnavailable(RegisterId),

    /// The API was used out of order
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// No backend could be selected for the supplied images
    #[error("No debug information loaded")]
    NoDebugInfo,
}

impl SymError
{
    /// Shorthand for [`SymError::MalformedData`].
    pub fn malformed(context: impl Into<String>) -> Self
    {
        SymError::MalformedData {
            context: context.into(),
        }
    }

    /// Returns `true` when re-issuing the same request may succeed.
    pub fn is_retryable(&self) -> bool
    {
        matches!(self, SymError::Maybe(_))
    }
}

/// Caller-facing result of a top-level operation
///
/// Every backend-specific failure is translated into one of these values at
/// the facade boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status
{
    Ok,
    Invalid,
    OutOfMemory,
    MemoryReadFailed,
    Maybe,
}

impl From<&SymError> for Status
{
    fn from(error: &SymError) -> Self
    {
        match error {
            SymError::ResourceExhausted(_) => Status::OutOfMemory,
            SymError::Maybe(_) => Status::Maybe,
            SymError::MemoryReadFailed(_) => Status::MemoryReadFailed,
            SymError::MalformedData { .. }
            | SymError::Unsupported(_)
            | SymError::RegisterUnavailable(_)
            | SymError::InvalidUsage(_)
            | SymError::NoDebugInfo => Status::Invalid,
        }
    }
}

impl<T> From<&Result<T>> for Status
{
    fn from(result: &Result<T>) -> Self
    {
        match result {
            Ok(_) => Status::Ok,
            Err(err) => Status::from(err),
        }
    }
}

/// Type alias for `Result<T, SymError>`
pub type Result<T> = std::result::Result<T, SymError>;
