use thiserror::Error;

use crate::slot::EntryPointSlot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A slot name or index outside the fixed enumeration, or a handler that
    /// does not match the slot's operation.
    #[error("invalid slot: {0}")]
    InvalidSlot(String),

    #[error("malformed request (size {size}, align {align}): {reason}")]
    MalformedRequest {
        size: usize,
        align: usize,
        reason: &'static str,
    },

    /// Only produced for throwing requests. Reporting requests get `Ok(None)`.
    #[error("{slot} could not obtain {size} bytes aligned to {align}")]
    AllocationFailure {
        slot: EntryPointSlot,
        size: usize,
        align: usize,
    },
}

impl ResolveError {
    /// Programmer errors. A host should abort rather than retry on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ResolveError::InvalidSlot(_) | ResolveError::MalformedRequest { .. }
        )
    }
}
