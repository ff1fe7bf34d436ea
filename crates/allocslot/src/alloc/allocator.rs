// Counting-allocator structure adapted from https://github.com/fornwall/allocation-counter
//
// Licensed under either of:
// - Apache License, Version 2.0.
// - MIT/X Consortium License
//
// Modifications:
// - Every call is classified and dispatched through an override table
// - Counts are kept per entry-point slot instead of per measured function

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use super::shared::{counting_suspended, UncountedGuard};
use crate::counters::CounterRegistry;
use crate::engine::ResolutionEngine;
use crate::provider::SystemProvider;
use crate::request::{AllocationRequest, ReleaseRequest};
use crate::slot::ObjectKind;
use crate::table::OverrideTable;

static DEFAULT_TABLE: OverrideTable = OverrideTable::new();

/// Increments made while counting is suspended land here and are never read.
static DISCARDED: CounterRegistry = CounterRegistry::new();

/// Global allocator that sends every Rust heap allocation through an
/// [`OverrideTable`].
///
/// Rust allocations carry no array/scalar distinction and report failure with
/// a null pointer, so they classify as scalar, reporting requests. Releases
/// always know their layout and use the sized form. Until
/// [`HostedAllocator::install`] runs, every slot behaves as its default.
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: allocslot::HostedAllocator = allocslot::HostedAllocator::new();
/// ```
///
/// Nothing on this path logs: a subscriber that allocates would re-enter the
/// allocator.
pub struct HostedAllocator {
    table: OnceLock<OverrideTable>,
    counters: CounterRegistry,
}

impl Default for HostedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostedAllocator {
    pub const fn new() -> Self {
        Self {
            table: OnceLock::new(),
            counters: CounterRegistry::new(),
        }
    }

    /// Installs the process-wide table. Succeeds once. Later calls hand the
    /// rejected table back.
    pub fn install(&self, table: OverrideTable) -> Result<(), OverrideTable> {
        self.table.set(table)
    }

    pub fn table(&self) -> &OverrideTable {
        self.table.get().unwrap_or(&DEFAULT_TABLE)
    }

    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }

    /// Suspends counting on the current thread until the guard drops.
    pub fn uncounted(&self) -> UncountedGuard {
        UncountedGuard::new()
    }

    #[inline]
    fn engine(&self) -> ResolutionEngine<'_, SystemProvider> {
        let counters = if counting_suspended() {
            &DISCARDED
        } else {
            &self.counters
        };
        ResolutionEngine::new(self.table(), counters, SystemProvider)
    }
}

unsafe impl GlobalAlloc for HostedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let request = AllocationRequest::from_layout(layout, ObjectKind::Scalar).reporting();
        match self.engine().invoke_allocate(&request) {
            Ok((_, Some(ptr))) => ptr.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let request = ReleaseRequest::new(ObjectKind::Scalar, layout.size(), layout.align());
        // SAFETY: the caller passes a pointer from `alloc` with the same layout,
        // and `alloc` dispatched it through the same table and provider.
        // Only malformed layouts fail, and a `Layout` is never malformed.
        let released = unsafe { self.engine().invoke_release(ptr, &request) };
        debug_assert!(released.is_ok());
    }
}
