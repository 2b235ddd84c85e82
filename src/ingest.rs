//! # Ingest Boundary
//!
//! The firehose transport lives outside this crate. It is consumed through
//! [`EventSource`], and [`ShardSpec`] decides which events belong to this
//! instance when the stream is statically partitioned across processes.

use crate::error::{Result, TurboError};
use crate::models::RawEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Pull-based source of raw events.
///
/// `next` must be cancel-safe: the pipeline races it against shutdown and
/// halt signals, and a cancelled call must not lose an event.
#[async_trait]
pub trait EventSource: Send {
    /// `Ok(None)` ends the stream; `Err` is a transport error the caller
    /// may retry.
    async fn next(&mut self) -> Result<Option<RawEvent>>;
}

/// Adapter for transports that push events into a channel
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<RawEvent>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Result<RawEvent>>) -> Self {
        Self { rx }
    }

    /// A bounded channel and the source reading from it
    pub fn channel(bound: usize) -> (mpsc::Sender<Result<RawEvent>>, Self) {
        let (tx, rx) = mpsc::channel(bound.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<RawEvent>> {
        // mpsc::Receiver::recv is cancel-safe
        self.rx.recv().await.transpose()
    }
}

/// Static partition of the global stream: this instance owns events whose
/// subject hashes to `shard` modulo `modulo`. `modulo == 0` owns everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardSpec {
    pub modulo: u32,
    pub shard: u32,
}

impl ShardSpec {
    pub fn new(modulo: u32, shard: u32) -> Self {
        Self { modulo, shard }
    }

    pub fn unsharded() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.modulo > 0 && self.shard >= self.modulo {
            return Err(TurboError::Configuration(format!(
                "shard {} out of range for modulo {}",
                self.shard, self.modulo
            )));
        }
        Ok(())
    }

    pub fn shard_of(subject: &str, modulo: u32) -> u32 {
        if modulo == 0 {
            return 0;
        }
        crc32fast::hash(subject.as_bytes()) % modulo
    }

    pub fn accepts(&self, subject: &str) -> bool {
        self.modulo == 0 || Self::shard_of(subject, self.modulo) == self.shard
    }
}
