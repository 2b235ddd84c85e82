use super::event::{Payload, RawEvent, ReferenceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of hydrating one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationStatus {
    /// Every reference resolved
    Complete,
    /// At least one reference failed after retries
    Partial,
    /// The event carried no references
    Skipped,
}

impl HydrationStatus {
    pub fn from_counts(required: usize, missing: usize) -> Self {
        match (required, missing) {
            (0, _) => Self::Skipped,
            (_, 0) => Self::Complete,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for HydrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for HydrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid hydration status: {s}")),
        }
    }
}

/// A reference that could not be resolved, with the final error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingReference {
    pub key: ReferenceKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub hydration_time_ms: u64,
    pub cache_hits: u32,
    pub cache_misses: u32,
}

/// A raw event with whatever references resolved. Partial records are
/// still emitted and list what is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub event: RawEvent,
    pub status: HydrationStatus,
    pub resolved: BTreeMap<ReferenceKey, Payload>,
    pub missing: Vec<MissingReference>,
    pub metrics: ProcessingMetrics,
    pub processed_at: DateTime<Utc>,
}

impl EnrichedRecord {
    /// Pass-through record for events with nothing to hydrate
    pub fn skipped(event: RawEvent) -> Self {
        Self {
            event,
            status: HydrationStatus::Skipped,
            resolved: BTreeMap::new(),
            missing: Vec::new(),
            metrics: ProcessingMetrics::default(),
            processed_at: Utc::now(),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.event.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.status == HydrationStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::EventKind;
    use std::sync::Arc;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(HydrationStatus::from_counts(0, 0), HydrationStatus::Skipped);
        assert_eq!(HydrationStatus::from_counts(3, 0), HydrationStatus::Complete);
        assert_eq!(HydrationStatus::from_counts(3, 1), HydrationStatus::Partial);
        assert_eq!(HydrationStatus::from_counts(3, 3), HydrationStatus::Partial);
    }

    #[test]
    fn test_record_serializes_with_string_keys() {
        let event = RawEvent::new(1, EventKind::Create, "did:plc:a", "{}");
        let mut record = EnrichedRecord::skipped(event);
        record.status = HydrationStatus::Partial;
        record
            .resolved
            .insert(ReferenceKey::actor("did:plc:a"), Arc::new(serde_json::json!({"handle": "a"})));
        record.missing.push(MissingReference {
            key: ReferenceKey::post("at://x"),
            reason: "not found".into(),
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["resolved"]["actor:did:plc:a"]["handle"], "a");
        assert_eq!(json["missing"][0]["key"], "post:at://x");

        let back: EnrichedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
