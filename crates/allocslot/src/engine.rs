//! Resolution engine: picks the entry point a request runs through and
//! invokes it.
//!
//! Resolution happens in three steps:
//!
//! 1. the request is classified to its primary [`EntryPointSlot`];
//! 2. [`fallback_chain`] yields the ordered candidates for that slot, which
//!    are the user override and then the slot's own default implementation;
//! 3. the first populated candidate is invoked and counted against the slot.
//!
//! The chain never names a second slot. Extended-alignment requests therefore
//! never land on a default-alignment slot, and array requests never land on a
//! scalar slot, whatever else the [`OverrideTable`] contains.

use serde::{Deserialize, Serialize};
use std::ptr::NonNull;

use crate::counters::CounterRegistry;
use crate::error::ResolveError;
use crate::provider::RawMemoryProvider;
use crate::request::{
    classify_allocate, classify_release, classify_unwind, AllocationRequest, ReleaseRequest,
    SizeHint,
};
use crate::slot::{AlignmentClass, EntryPointSlot, FailureMode, DEFAULT_ALIGNMENT};
use crate::table::{
    passthrough_allocate, passthrough_release, AllocateCall, Handler, OverrideTable, ReleaseCall,
    ReleaseForm, SlotEntry,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "sized-deallocation")] {
        /// Whether releases that kept their size use the sized form.
        pub const SIZED_DEALLOCATION: bool = true;
    } else {
        /// Whether releases that kept their size use the sized form.
        pub const SIZED_DEALLOCATION: bool = false;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerSource {
    User,
    Default,
}

/// One entry in a fallback chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub slot: EntryPointSlot,
    pub source: HandlerSource,
}

/// The ordered candidates tried for `slot`: the user override first, then the
/// slot's own default. Both candidates belong to `slot`.
pub fn fallback_chain(slot: EntryPointSlot) -> [Candidate; 2] {
    [
        Candidate {
            slot,
            source: HandlerSource::User,
        },
        Candidate {
            slot,
            source: HandlerSource::Default,
        },
    ]
}

/// Release signature chosen for a request. The choice is fixed per build.
pub fn release_form(request: &ReleaseRequest) -> ReleaseForm {
    match request.sized {
        SizeHint::Sized if SIZED_DEALLOCATION => ReleaseForm::Sized(request.size),
        _ => ReleaseForm::Unsized,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub slot: EntryPointSlot,
    pub source: HandlerSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<ReleaseForm>,
}

/// Resolves requests against a borrowed [`OverrideTable`] and records every
/// invocation in a borrowed [`CounterRegistry`].
pub struct ResolutionEngine<'a, P> {
    table: &'a OverrideTable,
    counters: &'a CounterRegistry,
    provider: P,
}

impl<'a, P: RawMemoryProvider> ResolutionEngine<'a, P> {
    pub fn new(table: &'a OverrideTable, counters: &'a CounterRegistry, provider: P) -> Self {
        Self {
            table,
            counters,
            provider,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn counters(&self) -> &CounterRegistry {
        self.counters
    }

    fn select(&self, slot: EntryPointSlot) -> (HandlerSource, Option<Handler>) {
        for candidate in fallback_chain(slot) {
            match (candidate.source, self.table.entry(candidate.slot)) {
                (HandlerSource::User, SlotEntry::User(handler)) => {
                    return (HandlerSource::User, Some(handler))
                }
                (HandlerSource::User, SlotEntry::Default) => continue,
                (HandlerSource::Default, _) => break,
            }
        }
        (HandlerSource::Default, None)
    }

    fn resolution(&self, slot: EntryPointSlot, form: Option<ReleaseForm>) -> Resolution {
        let (source, _) = self.select(slot);
        Resolution { slot, source, form }
    }

    /// Where `request` would go. Nothing is invoked or counted.
    pub fn resolve_allocate(&self, request: &AllocationRequest) -> Result<Resolution, ResolveError> {
        Ok(self.resolution(classify_allocate(request)?, None))
    }

    /// Where `request` would go. Nothing is invoked or counted.
    pub fn resolve_release(&self, request: &ReleaseRequest) -> Result<Resolution, ResolveError> {
        Ok(self.resolution(classify_release(request)?, Some(release_form(request))))
    }

    /// Where the release of a partly constructed `request` would go.
    pub fn resolve_unwind(&self, request: &AllocationRequest) -> Result<Resolution, ResolveError> {
        Ok(self.resolution(
            classify_unwind(request)?,
            Some(release_form(&request.release())),
        ))
    }

    /// Resolves, invokes and counts an allocation.
    ///
    /// A provider failure on a throwing request is returned as
    /// [`ResolveError::AllocationFailure`]. On a reporting request it is
    /// `Ok(None)`. Either way the slot was invoked and is counted.
    pub fn resolve_and_invoke_allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<Option<NonNull<u8>>, ResolveError> {
        let (resolution, ptr) = self.invoke_allocate(request)?;
        tracing::trace!(
            slot = %resolution.slot,
            source = ?resolution.source,
            size = request.size,
            align = request.align,
            ok = ptr.is_some(),
            "allocate"
        );
        match (ptr, request.failure_mode) {
            (Some(ptr), _) => Ok(Some(ptr)),
            (None, FailureMode::Reporting) => Ok(None),
            (None, FailureMode::Throwing) => Err(ResolveError::AllocationFailure {
                slot: resolution.slot,
                size: request.size,
                align: request.align,
            }),
        }
    }

    /// Resolves, invokes and counts a release.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation through this engine's
    /// provider for a request with the same kind, size and alignment, and
    /// must not be used afterwards.
    pub unsafe fn resolve_and_invoke_release(
        &self,
        ptr: NonNull<u8>,
        request: &ReleaseRequest,
    ) -> Result<Resolution, ResolveError> {
        let resolution = unsafe { self.invoke_release(ptr, request)? };
        tracing::trace!(
            slot = %resolution.slot,
            source = ?resolution.source,
            form = ?resolution.form,
            "release"
        );
        Ok(resolution)
    }

    /// Releases memory whose object never finished construction. A reporting
    /// allocation is released through the matching nothrow release slot.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::resolve_and_invoke_release`], with `request`
    /// being the allocation request that produced `ptr`.
    pub unsafe fn release_after_failed_construction(
        &self,
        ptr: NonNull<u8>,
        request: &AllocationRequest,
    ) -> Result<Resolution, ResolveError> {
        let slot = classify_unwind(request)?;
        let layout = request.layout()?;
        let form = release_form(&request.release());
        let resolution = unsafe { self.dispatch_release(slot, ptr, layout, form) };
        tracing::trace!(
            slot = %resolution.slot,
            source = ?resolution.source,
            "release after failed construction"
        );
        Ok(resolution)
    }

    /// Non-logging allocation path, shared with the hosted allocator.
    pub(crate) fn invoke_allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<(Resolution, Option<NonNull<u8>>), ResolveError> {
        let slot = classify_allocate(request)?;
        let layout = request.layout()?;
        let (source, handler) = self.select(slot);
        debug_assert!(
            layout.align() <= DEFAULT_ALIGNMENT || slot.alignment() == AlignmentClass::Extended
        );

        let call = AllocateCall { slot, layout };
        self.counters.increment(slot);
        let ptr = match handler {
            Some(Handler::Allocate(func)) => func(&self.provider, &call),
            // The table refuses mismatched handlers at install time.
            Some(Handler::Release(_)) => None,
            None => passthrough_allocate(&self.provider, &call),
        };

        Ok((
            Resolution {
                slot,
                source,
                form: None,
            },
            ptr,
        ))
    }

    /// Non-logging release path, shared with the hosted allocator.
    ///
    /// # Safety
    ///
    /// See [`Self::resolve_and_invoke_release`].
    pub(crate) unsafe fn invoke_release(
        &self,
        ptr: NonNull<u8>,
        request: &ReleaseRequest,
    ) -> Result<Resolution, ResolveError> {
        let slot = classify_release(request)?;
        let layout = request.layout()?;
        Ok(unsafe { self.dispatch_release(slot, ptr, layout, release_form(request)) })
    }

    unsafe fn dispatch_release(
        &self,
        slot: EntryPointSlot,
        ptr: NonNull<u8>,
        layout: std::alloc::Layout,
        form: ReleaseForm,
    ) -> Resolution {
        let (source, handler) = self.select(slot);
        let call = ReleaseCall {
            slot,
            ptr,
            layout,
            form,
        };
        self.counters.increment(slot);
        match handler {
            Some(Handler::Release(func)) => unsafe { func(&self.provider, &call) },
            Some(Handler::Allocate(_)) => {}
            None => unsafe { passthrough_release(&self.provider, &call) },
        }

        Resolution {
            slot,
            source,
            form: Some(form),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BudgetProvider, ProviderCall, RecordingProvider, SystemProvider};
    use crate::slot::{ObjectKind, Operation};
    use std::alloc::Layout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(align(64))]
    struct Wide([u8; 64]);

    fn refuse(_: &dyn RawMemoryProvider, _: &AllocateCall) -> Option<NonNull<u8>> {
        None
    }

    #[test]
    fn chain_stays_within_the_slot() {
        for slot in EntryPointSlot::ALL {
            let chain = fallback_chain(slot);
            assert!(chain.iter().all(|c| c.slot == slot));
            assert_eq!(chain[0].source, HandlerSource::User);
            assert_eq!(chain[1].source, HandlerSource::Default);
        }
    }

    #[test]
    fn default_slots_resolve_to_default_source() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let resolution = engine
            .resolve_allocate(&AllocationRequest::array::<Wide>(2))
            .unwrap();
        assert_eq!(resolution.slot, EntryPointSlot::AllocArrayAligned);
        assert_eq!(resolution.source, HandlerSource::Default);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn user_override_is_preferred() {
        let mut table = OverrideTable::new();
        table
            .install(
                EntryPointSlot::AllocScalar,
                Handler::passthrough(Operation::Allocate),
            )
            .unwrap();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::scalar::<u64>();
        let resolution = engine.resolve_allocate(&request).unwrap();
        assert_eq!(resolution.source, HandlerSource::User);

        let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
        unsafe {
            engine
                .resolve_and_invoke_release(ptr, &request.release())
                .unwrap();
        }
        assert_eq!(counters.read(EntryPointSlot::AllocScalar), 1);
        assert_eq!(counters.read(EntryPointSlot::ReleaseScalar), 1);
        assert_eq!(counters.total(), 2);
    }

    #[test]
    fn scalar_override_does_not_capture_array_release() {
        let mut table = OverrideTable::new();
        table
            .install(
                EntryPointSlot::ReleaseScalar,
                Handler::passthrough(Operation::Release),
            )
            .unwrap();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::array::<u32>(8);
        let resolution = engine.resolve_release(&request.release()).unwrap();
        assert_eq!(resolution.slot, EntryPointSlot::ReleaseArray);
        assert_eq!(resolution.source, HandlerSource::Default);
    }

    #[test]
    fn extended_default_passes_requested_alignment_to_provider() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let provider = RecordingProvider::new(SystemProvider);
        let engine = ResolutionEngine::new(&table, &counters, &provider);

        let request = AllocationRequest::array::<Wide>(2);
        let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        unsafe {
            engine
                .resolve_and_invoke_release(ptr, &request.release())
                .unwrap();
        }

        let layout = Layout::from_size_align(128, 64).unwrap();
        assert_eq!(
            provider.calls(),
            vec![ProviderCall::Allocate(layout), ProviderCall::Release(layout)]
        );
    }

    #[test]
    fn throwing_failure_is_an_error() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, BudgetProvider::new(SystemProvider, 8));

        let request = AllocationRequest::array::<u64>(4);
        let err = engine.resolve_and_invoke_allocate(&request).unwrap_err();
        assert_eq!(
            err,
            ResolveError::AllocationFailure {
                slot: EntryPointSlot::AllocArray,
                size: 32,
                align: 8,
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(counters.read(EntryPointSlot::AllocArray), 1);
    }

    #[test]
    fn reporting_failure_is_a_sentinel() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, BudgetProvider::new(SystemProvider, 8));

        let request = AllocationRequest::array::<u64>(4).reporting();
        assert_eq!(engine.resolve_and_invoke_allocate(&request), Ok(None));
        assert_eq!(counters.read(EntryPointSlot::AllocArrayNothrow), 1);
    }

    #[test]
    fn user_override_failure_follows_failure_mode() {
        let mut table = OverrideTable::new();
        table
            .install(EntryPointSlot::AllocScalarNothrow, refuse as crate::AllocateFn)
            .unwrap();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::scalar::<u8>().reporting();
        assert_eq!(engine.resolve_and_invoke_allocate(&request), Ok(None));
    }

    #[test]
    fn throwing_user_override_failure_is_an_error() {
        let mut table = OverrideTable::new();
        table
            .install(EntryPointSlot::AllocArrayAligned, refuse as crate::AllocateFn)
            .unwrap();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::array::<Wide>(3);
        assert_eq!(
            engine.resolve_and_invoke_allocate(&request),
            Err(ResolveError::AllocationFailure {
                slot: EntryPointSlot::AllocArrayAligned,
                size: 192,
                align: 64,
            })
        );
        assert_eq!(counters.read(EntryPointSlot::AllocArrayAligned), 1);
        assert_eq!(counters.total(), 1);
    }

    #[test]
    fn malformed_request_touches_nothing() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::new(ObjectKind::Array, 16, 0);
        assert!(matches!(
            engine.resolve_and_invoke_allocate(&request),
            Err(ResolveError::MalformedRequest { .. })
        ));
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn unwind_goes_to_nothrow_release() {
        let table = OverrideTable::new();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::scalar::<Wide>().reporting();
        let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
        let resolution = unsafe { engine.release_after_failed_construction(ptr, &request).unwrap() };

        assert_eq!(resolution.slot, EntryPointSlot::ReleaseScalarAlignedNothrow);
        assert_eq!(counters.read(EntryPointSlot::ReleaseScalarAligned), 0);
        assert_eq!(counters.read(EntryPointSlot::ReleaseScalarAlignedNothrow), 1);
    }

    static SEEN_SIZE: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe fn record_form(provider: &dyn RawMemoryProvider, call: &ReleaseCall) {
        let size = match call.form {
            ReleaseForm::Sized(size) => size,
            ReleaseForm::Unsized => 0,
        };
        SEEN_SIZE.store(size, Ordering::SeqCst);
        unsafe { provider.release(call.ptr, call.layout) }
    }

    #[test]
    fn release_form_follows_size_hint() {
        let mut table = OverrideTable::new();
        table
            .install(EntryPointSlot::ReleaseArray, record_form as crate::ReleaseFn)
            .unwrap();
        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

        let request = AllocationRequest::array::<u16>(12);
        let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
        let resolution = unsafe {
            engine
                .resolve_and_invoke_release(ptr, &request.release())
                .unwrap()
        };
        if SIZED_DEALLOCATION {
            assert_eq!(resolution.form, Some(ReleaseForm::Sized(24)));
            assert_eq!(SEEN_SIZE.load(Ordering::SeqCst), 24);
        } else {
            assert_eq!(resolution.form, Some(ReleaseForm::Unsized));
        }

        let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
        let resolution = unsafe {
            engine
                .resolve_and_invoke_release(ptr, &request.release().without_size())
                .unwrap()
        };
        assert_eq!(resolution.form, Some(ReleaseForm::Unsized));
        assert_eq!(SEEN_SIZE.load(Ordering::SeqCst), 0);
    }
}
