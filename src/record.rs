//! Durable event-log format.
//!
//! A log is a sequence of frames `[len:u32 LE][crc32:u32 LE][bincode payload]`.
//! The first frame is a [`FileHeader`]; every decoded message follows as an
//! [`EventRecord`] in decode order.
use std::io::{self, Read, Write};

use anyhow::{Context, Result, bail};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::book::OrderBookSnapshot;
use crate::protocol::{
    Envelope, OrderBookEntry, OrderBookSnapshotHeader, OrderExecution, OrderUpdate,
};

pub const FORMAT_VERSION: u16 = 1;

/// Frames above this size are treated as corruption.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    /// Capture file the events were decoded from.
    pub source: String,
    pub link_type: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    OrderUpdate(OrderUpdate),
    OrderExecution(OrderExecution),
    /// Levels best first on both sides.
    OrderBookSnapshot {
        header: OrderBookSnapshotHeader,
        bids: Vec<OrderBookEntry>,
        asks: Vec<OrderBookEntry>,
    },
}

impl EventKind {
    pub fn snapshot(snapshot: &OrderBookSnapshot) -> Self {
        EventKind::OrderBookSnapshot {
            header: snapshot.header,
            bids: snapshot.bids().copied().collect(),
            asks: snapshot.asks().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic position in the log.
    pub seq: u64,
    pub envelope: Envelope,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(FileHeader),
    Event(EventRecord),
}

pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> Result<()> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = u32::try_from(payload.len()).context("frame too large")?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Next frame, or `None` at a clean end of input. A checksum mismatch or a
/// frame cut short is an error.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<RecordFrame>> {
    let mut word = [0u8; 4];
    match r.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(word);
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds {MAX_FRAME_LEN}");
    }
    r.read_exact(&mut word).context("truncated frame header")?;
    let crc_on_file = u32::from_le_bytes(word);

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).context("truncated frame payload")?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        bail!("CRC mismatch: file={crc_on_file:#x}, calc={crc_calc:#x}");
    }
    let frame = bincode::deserialize(&payload).context("bincode decode")?;
    Ok(Some(frame))
}
