//! Pipeline data model: raw firehose events, reference keys, enriched
//! records and flush batches.

pub mod batch;
pub mod enriched;
pub mod event;
pub mod jetstream;

pub use batch::{Batch, BatchId};
pub use enriched::{EnrichedRecord, HydrationStatus, MissingReference, ProcessingMetrics};
pub use event::{EventKind, ObjectType, Payload, RawEvent, ReferenceKey};
pub use jetstream::{extract_references, raw_event_from_frame, JetstreamMessage};
