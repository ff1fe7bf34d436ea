//! Request descriptors and the classification that maps them to slots.

use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::mem;

use crate::error::ResolveError;
use crate::slot::{AlignmentClass, EntryPointSlot, FailureMode, ObjectKind, Operation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub kind: ObjectKind,
    pub size: usize,
    pub align: usize,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

/// Whether the caller kept the byte size of the original allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeHint {
    #[default]
    Sized,
    Unsized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub kind: ObjectKind,
    pub size: usize,
    pub align: usize,
    #[serde(default)]
    pub sized: SizeHint,
}

impl AllocationRequest {
    pub const fn new(kind: ObjectKind, size: usize, align: usize) -> Self {
        Self {
            kind,
            size,
            align,
            failure_mode: FailureMode::Throwing,
        }
    }

    pub const fn scalar<T>() -> Self {
        Self::new(ObjectKind::Scalar, mem::size_of::<T>(), mem::align_of::<T>())
    }

    /// An array of `len` elements of `T`. Overflowing sizes are kept as
    /// `usize::MAX` so that classification rejects them.
    pub const fn array<T>(len: usize) -> Self {
        let size = match mem::size_of::<T>().checked_mul(len) {
            Some(size) => size,
            None => usize::MAX,
        };
        Self::new(ObjectKind::Array, size, mem::align_of::<T>())
    }

    pub const fn from_layout(layout: Layout, kind: ObjectKind) -> Self {
        Self::new(kind, layout.size(), layout.align())
    }

    pub const fn reporting(mut self) -> Self {
        self.failure_mode = FailureMode::Reporting;
        self
    }

    pub const fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn layout(&self) -> Result<Layout, ResolveError> {
        layout_of(self.size, self.align)
    }

    /// The release matching this allocation, with the size retained.
    pub const fn release(&self) -> ReleaseRequest {
        ReleaseRequest {
            kind: self.kind,
            size: self.size,
            align: self.align,
            sized: SizeHint::Sized,
        }
    }
}

impl ReleaseRequest {
    pub const fn new(kind: ObjectKind, size: usize, align: usize) -> Self {
        Self {
            kind,
            size,
            align,
            sized: SizeHint::Sized,
        }
    }

    pub const fn without_size(mut self) -> Self {
        self.sized = SizeHint::Unsized;
        self
    }

    pub fn layout(&self) -> Result<Layout, ResolveError> {
        layout_of(self.size, self.align)
    }
}

fn layout_of(size: usize, align: usize) -> Result<Layout, ResolveError> {
    if align == 0 {
        return Err(ResolveError::MalformedRequest {
            size,
            align,
            reason: "alignment is zero",
        });
    }
    if !align.is_power_of_two() {
        return Err(ResolveError::MalformedRequest {
            size,
            align,
            reason: "alignment is not a power of two",
        });
    }
    Layout::from_size_align(size, align).map_err(|_| ResolveError::MalformedRequest {
        size,
        align,
        reason: "size overflows isize::MAX when rounded to the alignment",
    })
}

pub fn classify_allocate(request: &AllocationRequest) -> Result<EntryPointSlot, ResolveError> {
    let layout = request.layout()?;
    Ok(EntryPointSlot::new(
        Operation::Allocate,
        request.kind,
        AlignmentClass::of(layout.align()),
        request.failure_mode,
    ))
}

/// Ordinary release ignores failure mode and always lands on the throwing
/// (non-nothrow) release slot of its kind and alignment.
pub fn classify_release(request: &ReleaseRequest) -> Result<EntryPointSlot, ResolveError> {
    let layout = request.layout()?;
    Ok(EntryPointSlot::new(
        Operation::Release,
        request.kind,
        AlignmentClass::of(layout.align()),
        FailureMode::Throwing,
    ))
}

/// Release of memory whose object never finished construction. It goes to
/// the release slot matching the original allocation's failure mode.
pub fn classify_unwind(request: &AllocationRequest) -> Result<EntryPointSlot, ResolveError> {
    let layout = request.layout()?;
    Ok(EntryPointSlot::new(
        Operation::Release,
        request.kind,
        AlignmentClass::of(layout.align()),
        request.failure_mode,
    ))
}
