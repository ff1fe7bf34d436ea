//! Replaceable allocation entry points.
//!
//! Every allocation and release request is classified into one of sixteen
//! [`EntryPointSlot`]s by operation, object kind, alignment class and failure
//! mode. An [`OverrideTable`] may replace any slot with a user function, and a
//! [`ResolutionEngine`] picks and invokes the function serving each request
//! while counting invocations per slot.
//!
//! ```rust
//! use allocslot::{
//!     AllocationRequest, CounterRegistry, EntryPointSlot, Handler, Operation, OverrideTable,
//!     ResolutionEngine, SystemProvider,
//! };
//!
//! let mut table = OverrideTable::new();
//! table
//!     .install(EntryPointSlot::ReleaseArray, Handler::passthrough(Operation::Release))
//!     .unwrap();
//!
//! let counters = CounterRegistry::new();
//! let engine = ResolutionEngine::new(&table, &counters, SystemProvider);
//!
//! let request = AllocationRequest::array::<u32>(4);
//! let ptr = engine.resolve_and_invoke_allocate(&request).unwrap().unwrap();
//! unsafe { engine.resolve_and_invoke_release(ptr, &request.release()).unwrap() };
//!
//! assert_eq!(counters.read(EntryPointSlot::AllocArray), 1);
//! assert_eq!(counters.read(EntryPointSlot::ReleaseArray), 1);
//! ```

pub mod alloc;
pub mod counters;
pub mod engine;
pub mod error;
pub mod output;
pub mod provider;
pub mod request;
pub mod scenario;
pub mod slot;
pub mod table;

pub use allocslot_macros::replace;

pub use alloc::allocator::HostedAllocator;
pub use alloc::shared::UncountedGuard;
pub use counters::{CounterRegistry, CounterSnapshot};
pub use engine::{
    fallback_chain, release_form, Candidate, HandlerSource, Resolution, ResolutionEngine,
    SIZED_DEALLOCATION,
};
pub use error::ResolveError;
pub use output::{Format, Reporter};
pub use provider::{BudgetProvider, ProviderCall, RawMemoryProvider, RecordingProvider, SystemProvider};
pub use request::{
    classify_allocate, classify_release, classify_unwind, AllocationRequest, ReleaseRequest,
    SizeHint,
};
pub use scenario::{
    Expectation, Mismatch, Scenario, ScenarioDriver, ScenarioError, ScenarioReport, Step,
    StepOutcome,
};
pub use slot::{
    AlignmentClass, EntryPointSlot, FailureMode, ObjectKind, Operation, DEFAULT_ALIGNMENT,
    SLOT_COUNT,
};
pub use table::{
    passthrough_allocate, passthrough_release, AllocateCall, AllocateFn, Handler, OverrideTable,
    ReleaseCall, ReleaseFn, ReleaseForm, Replacement, SlotEntry,
};
