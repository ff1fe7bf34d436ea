//! Raw memory providers: the `allocate`/`release` primitive that default slot
//! implementations delegate to.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::slot::DEFAULT_ALIGNMENT;

/// Source of raw memory.
///
/// # Safety
///
/// `allocate` must return memory valid for `layout.size()` bytes and aligned
/// to at least `layout.align()`. `release` must accept any pointer previously
/// returned by `allocate` on the same provider with the same layout.
pub unsafe trait RawMemoryProvider {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from [`RawMemoryProvider::allocate`] on this provider
    /// with the same `layout`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

unsafe impl<P: RawMemoryProvider + ?Sized> RawMemoryProvider for &P {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).release(ptr, layout) }
    }
}

/// The platform allocator. Zero-sized requests get one byte and every request
/// is aligned to at least [`DEFAULT_ALIGNMENT`], so any pairing of default and
/// user handlers releases with the layout it allocated with.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProvider;

impl SystemProvider {
    #[inline]
    fn normalize(layout: Layout) -> Option<Layout> {
        Layout::from_size_align(layout.size().max(1), layout.align().max(DEFAULT_ALIGNMENT)).ok()
    }
}

unsafe impl RawMemoryProvider for SystemProvider {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let layout = Self::normalize(layout)?;
        // SAFETY: normalized layouts are never zero-sized.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // Normalization succeeded when this pointer was allocated.
        if let Some(layout) = Self::normalize(layout) {
            unsafe { System.dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Wraps a provider and refuses allocations once `budget` bytes are live.
#[derive(Debug)]
pub struct BudgetProvider<P> {
    inner: P,
    budget: usize,
    live: Cell<usize>,
}

impl<P: RawMemoryProvider> BudgetProvider<P> {
    pub fn new(inner: P, budget: usize) -> Self {
        Self {
            inner,
            budget,
            live: Cell::new(0),
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live.get()
    }
}

unsafe impl<P: RawMemoryProvider> RawMemoryProvider for BudgetProvider<P> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let live = self.live.get().checked_add(layout.size())?;
        if live > self.budget {
            return None;
        }
        let ptr = self.inner.allocate(layout)?;
        self.live.set(live);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.set(self.live.get().saturating_sub(layout.size()));
        unsafe { self.inner.release(ptr, layout) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderCall {
    Allocate(Layout),
    Release(Layout),
}

/// Wraps a provider and records every layout it is asked for.
#[derive(Debug, Default)]
pub struct RecordingProvider<P> {
    inner: P,
    calls: RefCell<Vec<ProviderCall>>,
}

impl<P: RawMemoryProvider> RecordingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

unsafe impl<P: RawMemoryProvider> RawMemoryProvider for RecordingProvider<P> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.calls.borrow_mut().push(ProviderCall::Allocate(layout));
        self.inner.allocate(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.calls.borrow_mut().push(ProviderCall::Release(layout));
        unsafe { self.inner.release(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_provider_honours_extended_alignment() {
        let layout = Layout::from_size_align(24, 256).unwrap();
        let ptr = SystemProvider.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
        unsafe { SystemProvider.release(ptr, layout) };
    }

    #[test]
    fn system_provider_accepts_zero_sized_layouts() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        let ptr = SystemProvider.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % DEFAULT_ALIGNMENT, 0);
        unsafe { SystemProvider.release(ptr, layout) };
    }

    #[test]
    fn budget_provider_refuses_past_budget() {
        let provider = BudgetProvider::new(SystemProvider, 64);
        let layout = Layout::from_size_align(48, 8).unwrap();

        let first = provider.allocate(layout).unwrap();
        assert_eq!(provider.live_bytes(), 48);
        assert!(provider.allocate(layout).is_none());

        unsafe { provider.release(first, layout) };
        assert_eq!(provider.live_bytes(), 0);
        let again = provider.allocate(layout).unwrap();
        unsafe { provider.release(again, layout) };
    }

    #[test]
    fn recording_provider_keeps_call_order() {
        let provider = RecordingProvider::new(SystemProvider);
        let layout = Layout::from_size_align(16, 64).unwrap();
        let ptr = provider.allocate(layout).unwrap();
        unsafe { provider.release(ptr, layout) };

        assert_eq!(
            provider.calls(),
            vec![ProviderCall::Allocate(layout), ProviderCall::Release(layout)]
        );
    }
}
