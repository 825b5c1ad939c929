//! Concrete provider implementations.

pub mod batch;
pub mod mock;
pub mod realtime;

pub use batch::{BatchProvider, MIN_BATCH_SAMPLES};
pub use mock::MockProvider;
pub use realtime::RealtimeProvider;
