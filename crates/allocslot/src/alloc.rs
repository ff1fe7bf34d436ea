pub mod allocator;
pub mod shared;
