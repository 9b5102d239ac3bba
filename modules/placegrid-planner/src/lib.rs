pub mod cache;
pub mod dedup;
pub mod geo;
pub mod pipeline;
pub mod queue;
pub mod requests;
pub mod scheduling;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
