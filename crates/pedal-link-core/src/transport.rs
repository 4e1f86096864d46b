//! Byte-channel abstraction shared by the serial and BLE links.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Ble => f.write_str("ble"),
        }
    }
}

/// What a transport delivers from the device side, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    Data(Bytes),
    /// The device went away (unplug, link drop).
    Closed,
    Failed(String),
}

pub type ChunkTx = mpsc::UnboundedSender<ChunkEvent>;
pub type ChunkRx = mpsc::UnboundedReceiver<ChunkEvent>;

pub fn chunk_channel() -> (ChunkTx, ChunkRx) {
    mpsc::unbounded_channel()
}

/// Write half of an open link.
#[async_trait::async_trait]
pub trait LinkSink: Send + Sync {
    /// Completes once the underlying write has finished. Must be a silent
    /// no-op after [`LinkSink::close`].
    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Stops chunk delivery, then releases the device handle. Idempotent.
    async fn close(&self) -> Result<(), LinkError>;
}

/// An open session: the write half plus the stream of inbound chunks.
pub struct Link {
    pub sink: Box<dyn LinkSink>,
    pub chunks: ChunkRx,
}

/// Trait for any device link the console can open.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Suspends through device selection and pairing.
    async fn open(&self) -> Result<Link, LinkError>;
}
