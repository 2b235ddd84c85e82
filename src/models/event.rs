use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A resolved external object, shared between the cache and every record
/// that references it.
pub type Payload = Arc<serde_json::Value>;

/// Firehose operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    /// Deletes carry no record body and therefore nothing to hydrate
    pub fn carries_record(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("Invalid event kind: {s}")),
        }
    }
}

/// Immutable event as received from the ingest collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Monotonic per shard
    pub cursor: u64,
    pub kind: EventKind,
    /// Repository DID the event was authored under
    pub subject: String,
    /// UTF-8 JSON text of the firehose message
    #[serde(with = "payload_text")]
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(cursor: u64, kind: EventKind, subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            cursor,
            kind,
            subject: subject.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

mod payload_text {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Bytes::from(text))
    }
}

/// Kind of external object a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// Profile, identified by DID
    Actor,
    /// Post, identified by AT-URI
    Post,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Actor => write!(f, "actor"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Cache and single-flight key: `"<type>:<id>"`, e.g. `post:123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferenceKey {
    pub object_type: ObjectType,
    pub id: String,
}

impl ReferenceKey {
    pub fn new(object_type: ObjectType, id: impl Into<String>) -> Self {
        Self {
            object_type,
            id: id.into(),
        }
    }

    pub fn actor(did: impl Into<String>) -> Self {
        Self::new(ObjectType::Actor, did)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(ObjectType::Post, uri)
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

impl std::str::FromStr for ReferenceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ids may themselves contain ':' (DIDs, AT-URIs), so split once
        let (object_type, id) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid reference key: {s}"))?;
        if id.is_empty() {
            return Err(format!("Invalid reference key: {s}"));
        }
        let object_type = match object_type {
            "actor" => ObjectType::Actor,
            "post" => ObjectType::Post,
            other => return Err(format!("Invalid object type: {other}")),
        };
        Ok(Self::new(object_type, id))
    }
}

impl TryFrom<String> for ReferenceKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReferenceKey> for String {
    fn from(key: ReferenceKey) -> Self {
        key.to_string()
    }
}
