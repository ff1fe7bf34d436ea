//! Replaces the two ordinary scalar release entry points and shows which
//! requests reach them.
//!
//! ```text
//! cargo run --example replace_release
//! RUST_LOG=trace cargo run --example replace_release
//! ```

use allocslot::{
    replace, AllocationRequest, CounterRegistry, OverrideTable, RawMemoryProvider, ReleaseCall,
    ReleaseForm, ResolutionEngine, SystemProvider, DEFAULT_ALIGNMENT,
};
use std::error::Error;
use tracing_subscriber::EnvFilter;

#[replace(ReleaseScalar)]
unsafe fn logged_release(provider: &dyn RawMemoryProvider, call: &ReleaseCall) {
    match call.form {
        ReleaseForm::Sized(size) => println!("  user release_scalar, {size} bytes"),
        ReleaseForm::Unsized => println!("  user release_scalar, size unknown"),
    }
    unsafe { provider.release(call.ptr, call.layout) }
}

#[replace(ReleaseScalarAligned)]
unsafe fn logged_aligned_release(provider: &dyn RawMemoryProvider, call: &ReleaseCall) {
    println!("  user release_scalar_aligned, align {}", call.layout.align());
    unsafe { provider.release(call.ptr, call.layout) }
}

#[repr(align(64))]
struct CacheLine([u8; 64]);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut table = OverrideTable::new();
    table.install_replacement(&LOGGED_RELEASE)?;
    table.install_replacement(&LOGGED_ALIGNED_RELEASE)?;

    let counters = CounterRegistry::new();
    let engine = ResolutionEngine::new(&table, &counters, SystemProvider);

    let requests = [
        ("u64", AllocationRequest::scalar::<u64>()),
        ("CacheLine", AllocationRequest::scalar::<CacheLine>()),
        ("[u64; 4]", AllocationRequest::array::<u64>(4)),
    ];

    for (label, request) in requests {
        println!("{label} (align {}, default {DEFAULT_ALIGNMENT})", request.align);
        let Some(ptr) = engine.resolve_and_invoke_allocate(&request)? else {
            continue;
        };
        let resolution = unsafe { engine.resolve_and_invoke_release(ptr, &request.release())? };
        println!("  -> {} ({:?})", resolution.slot, resolution.source);
    }

    println!();
    for (slot, count) in counters.nonzero() {
        println!("{slot}: {count}");
    }
    Ok(())
}
