//! Storage tiers for flushed batches: the durable segment store, the
//! streaming sink, the segment archive, the fan-out writer over them, and
//! the rotation manager that moves segments through their lifecycle.

pub mod archive;
pub mod durable;
pub mod fanout;
pub mod rotation;
pub mod segment;
pub mod stream;

pub use archive::{ArchiveReceipt, SegmentArchive};
pub use durable::{DurableSink, DurableWriter, RetiredSegment, SharedDurableWriter};
pub use fanout::{BatchWriteReport, FailedBatch, FailureLedger, SinkOutcome, SinkPolicy, StorageFanout};
pub use rotation::{plan_recovery, ArchiveSummary, RecoveryAction, RotationManager};
pub use segment::{SegmentId, SegmentMarker, SegmentState, SegmentStore, StoredRecord};
#[cfg(feature = "stream-redis")]
pub use stream::RedisStream;
pub use stream::{MemoryStream, StreamEntry, StreamSink};
