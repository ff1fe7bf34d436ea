use std::cell::Cell;

thread_local! {
    static SUSPENDED: Cell<u32> = const { Cell::new(0) };
}

/// Allocations on this thread are not counted while a guard is alive. They
/// still go through the installed override table.
pub struct UncountedGuard {
    _private: (),
}

impl UncountedGuard {
    #[inline]
    pub fn new() -> Self {
        let _ = SUSPENDED.try_with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Default for UncountedGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UncountedGuard {
    #[inline]
    fn drop(&mut self) {
        let _ = SUSPENDED.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[inline]
pub(crate) fn counting_suspended() -> bool {
    SUSPENDED.try_with(|depth| depth.get() > 0).unwrap_or(true)
}
