//! The output side of the pipeline and its lifecycle owner: record
//! buffering, the flush coordinator, and the [`TurboCharger`] that drives
//! ingest through hydration into storage.

pub mod buffer;
pub mod coordinator;
pub mod orchestrator;

pub use buffer::RecordBuffer;
pub use coordinator::{BatchSink, BufferCoordinator};
pub use orchestrator::{TurboCharger, TurboStats};
