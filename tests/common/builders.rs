//! Event and configuration builders shared by the integration suites.

use chrono::Utc;
use firehose_turbo::models::{Batch, BatchId, EnrichedRecord, EventKind, RawEvent};
use firehose_turbo::TurboConfig;
use serde_json::json;
use std::ops::Range;
use std::path::Path;

/// Jetstream commit frame for a post, optionally replying to `reply_to`
/// and mentioning `mentions`.
pub fn post_event(cursor: u64, did: &str, reply_to: Option<&str>, mentions: &[&str]) -> RawEvent {
    let mut record = json!({
        "$type": "app.bsky.feed.post",
        "text": format!("post {cursor}"),
        "createdAt": "2024-09-09T19:46:02.102Z",
    });
    if let Some(parent) = reply_to {
        record["reply"] = json!({
            "parent": { "uri": parent, "cid": "bafyparent" },
            "root": { "uri": parent, "cid": "bafyparent" },
        });
    }
    if !mentions.is_empty() {
        let features: Vec<_> = mentions
            .iter()
            .map(|did| json!({ "$type": "app.bsky.richtext.facet#mention", "did": did }))
            .collect();
        record["facets"] = json!([{ "index": { "byteStart": 0, "byteEnd": 4 }, "features": features }]);
    }

    let frame = json!({
        "did": did,
        "time_us": cursor,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vutsw2b",
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": format!("rkey{cursor}"),
            "record": record,
            "cid": "bafyreidc6sydkkbchcyg62v77wbhzvb2mvytlmsychqgwf2xojjtirmzj4",
        },
    });
    RawEvent::new(cursor, EventKind::Create, did, frame.to_string())
}

/// Delete frame: carries no record and hydrates nothing.
pub fn delete_event(cursor: u64, did: &str) -> RawEvent {
    let frame = json!({
        "did": did,
        "time_us": cursor,
        "kind": "commit",
        "commit": {
            "operation": "delete",
            "collection": "app.bsky.feed.post",
            "rkey": format!("rkey{cursor}"),
        },
    });
    RawEvent::new(cursor, EventKind::Delete, did, frame.to_string())
}

/// Batch of skipped post records, one per cursor
pub fn batch_of(cursors: Range<u64>, sequence: u64) -> Batch {
    Batch {
        id: BatchId::new(),
        sequence,
        records: cursors
            .map(|cursor| EnrichedRecord::skipped(post_event(cursor, "did:plc:batch", None, &[])))
            .collect(),
        opened_at: Utc::now(),
        sealed_at: Utc::now(),
    }
}

/// Configuration tuned for fast tests, with all storage under `dir`.
pub fn test_config(dir: &Path) -> TurboConfig {
    let mut config = TurboConfig::default();
    config.stats_interval_seconds = 3_600;

    config.hydration.batch_timeout_ms = 5;
    config.hydration.retry_base_delay_ms = 1;
    config.hydration.retry_max_delay_ms = 4;
    config.hydration.fetch_timeout_ms = 1_000;
    config.hydration.hydration_workers = 8;

    config.buffer.max_batch_records = 5;
    config.buffer.max_batch_age_ms = 50;
    config.buffer.backpressure_queue_bound = 16;

    config.storage.data_dir = dir.join("segments");
    config.storage.archive_dir = Some(dir.join("archive"));
    config.storage.stream_max_len = None;
    config.storage.durable_write_timeout_ms = 1_000;
    config.storage.stream_write_timeout_ms = 500;
    config.storage.rotation_check_interval_ms = 50;
    config.storage.archive_retry_base_delay_ms = 10;
    config.storage.archive_retry_max_delay_ms = 50;
    config
}
