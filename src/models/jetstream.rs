//! Jetstream message envelope and reference extraction.
//!
//! Commit messages look like:
//!
//! ```json
//! {"did": "did:plc:...", "time_us": 1725911162329308, "kind": "commit",
//!  "commit": {"operation": "create", "collection": "app.bsky.feed.post",
//!             "rkey": "3l3qo2vuowo2b", "record": {...}, "cid": "bafy..."}}
//! ```

use super::event::{EventKind, RawEvent, ReferenceKey};
use crate::error::{Result, TurboError};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JetstreamMessage {
    pub did: String,
    #[serde(default)]
    pub time_us: Option<u64>,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<CommitData>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitData {
    #[serde(default)]
    pub rev: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub rkey: Option<String>,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub cid: Option<String>,
}

impl JetstreamMessage {
    /// `at://<did>/<collection>/<rkey>` of the committed record
    pub fn at_uri(&self) -> Option<String> {
        let commit = self.commit.as_ref()?;
        match (&commit.collection, &commit.rkey) {
            (Some(collection), Some(rkey)) => Some(format!("at://{}/{}/{}", self.did, collection, rkey)),
            _ => None,
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        self.commit.as_ref()?.operation.parse().ok()
    }

    /// Every reference this message needs hydrated, first-seen order,
    /// without duplicates. Deletes and non-commit messages have none.
    pub fn references(&self) -> Vec<ReferenceKey> {
        let Some(commit) = &self.commit else {
            return Vec::new();
        };
        if commit.operation == "delete" {
            return Vec::new();
        }

        let mut keys = Vec::new();
        if is_did(&self.did) {
            keys.push(ReferenceKey::actor(&self.did));
        }

        if let Some(record) = &commit.record {
            for path in [
                &["reply", "parent", "uri"][..],
                &["reply", "root", "uri"][..],
                &["embed", "record", "uri"][..],
                &["embed", "record", "record", "uri"][..],
            ] {
                if let Some(uri) = lookup_str(record, path) {
                    if uri.starts_with("at://") {
                        keys.push(ReferenceKey::post(uri));
                    }
                }
            }

            if let Some(facets) = record.get("facets").and_then(|f| f.as_array()) {
                let mentioned = facets
                    .iter()
                    .filter_map(|facet| facet.get("features").and_then(|f| f.as_array()))
                    .flatten()
                    .filter_map(|feature| feature.get("did").and_then(|d| d.as_str()))
                    .filter(|did| is_did(did));
                keys.extend(mentioned.map(ReferenceKey::actor));
            }
        }

        let mut seen = HashSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        keys
    }
}

fn is_did(value: &str) -> bool {
    value.starts_with("did:plc:") || value.starts_with("did:web:")
}

fn lookup_str<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, segment| current.get(segment))?
        .as_str()
}

/// Reference keys for a raw event. Payloads that are not Jetstream JSON
/// hydrate nothing.
pub fn extract_references(event: &RawEvent) -> Vec<ReferenceKey> {
    if !event.kind.carries_record() {
        return Vec::new();
    }
    serde_json::from_slice::<JetstreamMessage>(&event.payload)
        .map(|message| message.references())
        .unwrap_or_default()
}

/// Build a [`RawEvent`] from one Jetstream JSON frame. `fallback_cursor` is
/// used when the frame has no `time_us`.
pub fn raw_event_from_frame(frame: impl Into<Bytes>, fallback_cursor: u64) -> Result<RawEvent> {
    let payload = frame.into();
    let message: JetstreamMessage = serde_json::from_slice(&payload)
        .map_err(|e| TurboError::Ingest(format!("malformed jetstream frame: {e}")))?;
    // identity and account events are passed through as updates
    let kind = message.event_kind().unwrap_or(EventKind::Update);
    Ok(RawEvent {
        cursor: message.time_us.unwrap_or(fallback_cursor),
        kind,
        subject: message.did,
        payload,
        received_at: Utc::now(),
    })
}
