use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

use crate::error::ResolveError;
use crate::provider::RawMemoryProvider;
use crate::slot::{EntryPointSlot, Operation, SLOT_COUNT};

/// Arguments handed to an allocation handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocateCall {
    pub slot: EntryPointSlot,
    pub layout: Layout,
}

/// Which release signature was used for a release call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "form", content = "size")]
pub enum ReleaseForm {
    Unsized,
    Sized(usize),
}

/// Arguments handed to a release handler. `layout` is always the layout of the
/// original request, whatever `form` says, because the provider needs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseCall {
    pub slot: EntryPointSlot,
    pub ptr: NonNull<u8>,
    pub layout: Layout,
    pub form: ReleaseForm,
}

pub type AllocateFn = fn(&dyn RawMemoryProvider, &AllocateCall) -> Option<NonNull<u8>>;

/// # Safety
///
/// Handlers receive a pointer that the matching allocation returned and must
/// release it exactly once.
pub type ReleaseFn = unsafe fn(&dyn RawMemoryProvider, &ReleaseCall);

#[derive(Clone, Copy)]
pub enum Handler {
    Allocate(AllocateFn),
    Release(ReleaseFn),
}

impl Handler {
    pub const fn operation(&self) -> Operation {
        match self {
            Handler::Allocate(_) => Operation::Allocate,
            Handler::Release(_) => Operation::Release,
        }
    }

    /// A user handler that forwards straight to the provider. Installing it
    /// changes which source serves the slot without changing what the slot
    /// does.
    pub const fn passthrough(operation: Operation) -> Self {
        match operation {
            Operation::Allocate => Handler::Allocate(passthrough_allocate),
            Operation::Release => Handler::Release(passthrough_release),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Allocate(func) => write!(f, "Allocate({:p})", *func as *const ()),
            Handler::Release(func) => write!(f, "Release({:p})", *func as *const ()),
        }
    }
}

impl From<AllocateFn> for Handler {
    fn from(func: AllocateFn) -> Self {
        Handler::Allocate(func)
    }
}

impl From<ReleaseFn> for Handler {
    fn from(func: ReleaseFn) -> Self {
        Handler::Release(func)
    }
}

pub fn passthrough_allocate(
    provider: &dyn RawMemoryProvider,
    call: &AllocateCall,
) -> Option<NonNull<u8>> {
    provider.allocate(call.layout)
}

/// # Safety
///
/// See [`ReleaseFn`].
pub unsafe fn passthrough_release(provider: &dyn RawMemoryProvider, call: &ReleaseCall) {
    unsafe { provider.release(call.ptr, call.layout) }
}

/// A slot paired with the user function that replaces it. The
/// [`replace`](crate::replace) attribute generates these as constants.
#[derive(Clone, Copy, Debug)]
pub struct Replacement {
    pub slot: EntryPointSlot,
    pub handler: Handler,
}

impl Replacement {
    pub const fn new(slot: EntryPointSlot, handler: Handler) -> Self {
        Self { slot, handler }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum SlotEntry {
    #[default]
    Default,
    User(Handler),
}

/// Which function occupies each slot.
///
/// Every slot starts as [`SlotEntry::Default`]. Installation needs `&mut self`
/// and resolution borrows the table shared, so a table cannot change while an
/// engine is reading it.
#[derive(Clone, Debug)]
pub struct OverrideTable {
    entries: [SlotEntry; SLOT_COUNT],
}

impl Default for OverrideTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideTable {
    pub const fn new() -> Self {
        Self {
            entries: [SlotEntry::Default; SLOT_COUNT],
        }
    }

    pub fn install(
        &mut self,
        slot: EntryPointSlot,
        handler: impl Into<Handler>,
    ) -> Result<(), ResolveError> {
        let handler = handler.into();
        if handler.operation() != slot.operation() {
            return Err(ResolveError::InvalidSlot(format!(
                "{slot} is a {} slot, handler is a {} handler",
                slot.operation(),
                handler.operation()
            )));
        }

        if let SlotEntry::User(_) = self.entries[slot.index()] {
            tracing::warn!(%slot, "replacing an already installed override");
        }
        self.entries[slot.index()] = SlotEntry::User(handler);
        tracing::debug!(%slot, "override installed");
        Ok(())
    }

    pub fn install_named(
        &mut self,
        name: &str,
        handler: impl Into<Handler>,
    ) -> Result<(), ResolveError> {
        let slot: EntryPointSlot = name.parse()?;
        self.install(slot, handler)
    }

    pub fn install_replacement(&mut self, replacement: &Replacement) -> Result<(), ResolveError> {
        self.install(replacement.slot, replacement.handler)
    }

    /// Resets `slot` to its default implementation.
    pub fn clear(&mut self, slot: EntryPointSlot) {
        self.entries[slot.index()] = SlotEntry::Default;
        tracing::debug!(%slot, "override cleared");
    }

    #[inline]
    pub fn entry(&self, slot: EntryPointSlot) -> SlotEntry {
        self.entries[slot.index()]
    }

    pub fn is_replaced(&self, slot: EntryPointSlot) -> bool {
        matches!(self.entry(slot), SlotEntry::User(_))
    }

    pub fn replaced(&self) -> impl Iterator<Item = EntryPointSlot> + '_ {
        EntryPointSlot::ALL
            .into_iter()
            .filter(|slot| self.is_replaced(*slot))
    }
}
