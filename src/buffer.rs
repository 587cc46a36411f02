//! Background buffering of capture records.
//!
//! [`CaptureBuffer`] owns the [`CaptureFile`]. Once started, a producer thread
//! reads fixed-size chunks, splits each chunk into whole packet records and
//! publishes one [`PacketBatch`] per chunk on a FIFO channel. A record that does
//! not fit the rest of the chunk is left unconsumed and re-read at the start of
//! the next chunk, so batches never split a record.
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, error, info, warn};

use crate::error::CaptureError;
use crate::pcap::{CaptureFile, GlobalHeader, RECORD_HEADER_LEN};

/// How long a push into a full bounded queue waits before re-checking the stop signal.
const PUSH_RETRY: Duration = Duration::from_millis(50);

/// Cooperative cancellation shared between the producer, the consumer and
/// whoever wants to end the run early (e.g. a Ctrl+C handler).
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordSlot {
    timestamp_ns: u64,
    original_len: u32,
    range: Range<usize>,
}

/// One captured packet borrowed from its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// 1-based position of the packet in the capture file.
    pub number: u64,
    pub timestamp_ns: u64,
    pub original_len: u32,
    pub data: &'a [u8],
}

/// Packets buffered from one chunk, in capture order, sharing a single byte arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBatch {
    start_packet_number: u64,
    arena: Vec<u8>,
    slots: Vec<RecordSlot>,
}

impl PacketBatch {
    pub fn new(start_packet_number: u64) -> Self {
        Self {
            start_packet_number,
            ..Self::default()
        }
    }

    fn with_capacity(start_packet_number: u64, bytes: usize) -> Self {
        Self {
            start_packet_number,
            arena: Vec::with_capacity(bytes),
            slots: Vec::new(),
        }
    }

    pub fn push(&mut self, timestamp_ns: u64, original_len: u32, data: &[u8]) {
        let start = self.arena.len();
        self.arena.extend_from_slice(data);
        self.slots.push(RecordSlot {
            timestamp_ns,
            original_len,
            range: start..self.arena.len(),
        });
    }

    pub fn start_packet_number(&self) -> u64 {
        self.start_packet_number
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.arena.len()
    }

    pub fn get(&self, index: usize) -> Option<Packet<'_>> {
        let slot = self.slots.get(index)?;
        Some(Packet {
            number: self.start_packet_number + index as u64,
            timestamp_ns: slot.timestamp_ns,
            original_len: slot.original_len,
            data: &self.arena[slot.range.clone()],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Packet<'_>> + '_ {
        (0..self.slots.len()).filter_map(move |i| self.get(i))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub chunks: u64,
    pub batches: u64,
    pub packets: u64,
    pub bytes_consumed: u64,
    /// Bytes of a partial record left at end of file.
    pub truncated_tail_bytes: u64,
    pub stopped_early: bool,
}

pub struct CaptureBuffer {
    file: Option<CaptureFile>,
    header: GlobalHeader,
    chunk_size: usize,
    tx: Option<Sender<PacketBatch>>,
    rx: Receiver<PacketBatch>,
    running: Arc<AtomicBool>,
    stop: StopSignal,
    producer: Option<JoinHandle<Result<BufferStats, CaptureError>>>,
}

impl CaptureBuffer {
    /// `queue_capacity = None` keeps the queue unbounded; with `Some(n)` the
    /// producer waits while `n` batches are pending.
    pub fn new(file: CaptureFile, chunk_size: usize, queue_capacity: Option<usize>) -> Self {
        let (tx, rx) = match queue_capacity {
            Some(n) => bounded(n.max(1)),
            None => unbounded(),
        };
        Self {
            header: *file.header(),
            file: Some(file),
            chunk_size: chunk_size.max(RECORD_HEADER_LEN),
            tx: Some(tx),
            rx,
            running: Arc::new(AtomicBool::new(false)),
            stop: StopSignal::new(),
            producer: None,
        }
    }

    pub fn header(&self) -> &GlobalHeader {
        &self.header
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Spawn the producer thread.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        let (Some(file), Some(tx)) = (self.file.take(), self.tx.take()) else {
            return Err(CaptureError::AlreadyStarted);
        };
        let chunk_size = self.chunk_size;
        let running = Arc::clone(&self.running);
        let stop = self.stop.clone();

        self.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("capture-producer".into())
            .spawn(move || {
                info!(chunk_size, "start buffering");
                let result = produce(file, chunk_size, &tx, &stop);
                if let Err(e) = &result {
                    error!(error = %e, "capture buffering aborted");
                }
                running.store(false, Ordering::Release);
                result
            });
        match spawned {
            Ok(handle) => {
                self.producer = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// `true` from [`start`](Self::start) until the producer has pushed its
    /// last batch (end of file, stop request or fatal error).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Oldest ready batch, without waiting.
    pub fn next_batch(&self) -> Option<PacketBatch> {
        self.rx.try_recv().ok()
    }

    /// Oldest batch, waiting for the producer. `None` once the producer is
    /// done and the queue is drained.
    pub fn wait_batch(&self) -> Option<PacketBatch> {
        self.rx.recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Ask the producer to leave its loop before the next chunk read. The file
    /// is closed when the producer thread returns.
    pub fn stop(&self) {
        info!("stop buffering");
        self.stop.stop();
    }

    /// Wait for the producer and surface its outcome. Buffers that were never
    /// started report empty stats.
    pub fn join(&mut self) -> Result<BufferStats, CaptureError> {
        match self.producer.take() {
            Some(handle) => handle.join().map_err(|_| CaptureError::ProducerPanicked)?,
            None => Ok(BufferStats::default()),
        }
    }
}

impl Drop for CaptureBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.producer.take() {
            self.stop.stop();
            // Unblock a producer parked on a full queue.
            while self.rx.try_recv().is_ok() {}
            let _ = handle.join();
        }
    }
}

fn produce(
    mut file: CaptureFile,
    chunk_size: usize,
    tx: &Sender<PacketBatch>,
    stop: &StopSignal,
) -> Result<BufferStats, CaptureError> {
    let header = *file.header();
    let file_size = file.size();
    let mut chunk = vec![0u8; chunk_size];
    let mut packet_number = 1u64;
    let mut stats = BufferStats::default();

    while file.remaining() > 0 {
        if stop.is_stopped() {
            stats.stopped_early = true;
            break;
        }
        let remaining = file.remaining();
        let want = remaining.min(chunk_size as u64) as usize;
        let window = &mut chunk[..want];
        file.read_chunk(window)?;
        stats.chunks += 1;

        let mut batch = PacketBatch::with_capacity(packet_number, want);
        let mut local = 0usize;
        while let Some(record) = header.record_header(&window[local..]) {
            let start = local + RECORD_HEADER_LEN;
            let end = start + record.captured_len as usize;
            if end > want {
                break;
            }
            batch.push(
                record.timestamp_ns(header.resolution),
                record.original_len,
                &window[start..end],
            );
            local = end;
            packet_number += 1;
        }

        if local == 0 {
            // Not even one record fit.
            if (want as u64) < remaining {
                let captured_len = header
                    .record_header(window)
                    .map(|r| r.captured_len)
                    .unwrap_or_default();
                return Err(CaptureError::RecordTooLarge {
                    offset: file.offset(),
                    captured_len,
                    chunk_size,
                });
            }
            warn!(
                offset = file.offset(),
                bytes = remaining,
                "partial record at end of capture file, ignoring it"
            );
            stats.truncated_tail_bytes = remaining;
            break;
        }

        // Resume at the first record that was not consumed.
        file.consume(local as u64);
        stats.bytes_consumed += local as u64;
        stats.packets += batch.len() as u64;
        stats.batches += 1;

        debug!(
            start_packet = batch.start_packet_number(),
            packets = batch.len(),
            bytes = local,
            "buffered batch"
        );
        let processed_pct = (10_000.0 * file.offset() as f64 / file_size as f64).round() / 100.0;
        info!(processed_pct, "capture file progress");

        if !push(tx, batch, stop) {
            stats.stopped_early = true;
            break;
        }
    }

    Ok(stats)
}

/// Hand a batch to the consumer; `false` if the run was stopped or the
/// consumer went away while waiting for room.
fn push(tx: &Sender<PacketBatch>, mut batch: PacketBatch, stop: &StopSignal) -> bool {
    loop {
        match tx.send_timeout(batch, PUSH_RETRY) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(b)) => {
                if stop.is_stopped() {
                    return false;
                }
                batch = b;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn write_capture(path: &Path, packets: &[Vec<u8>]) {
        let mut f = File::create(path).unwrap();
        let mut h = [0u8; 24];
        h[0..4].copy_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        h[4..6].copy_from_slice(&2u16.to_le_bytes());
        h[6..8].copy_from_slice(&4u16.to_le_bytes());
        h[20..24].copy_from_slice(&1u32.to_le_bytes());
        f.write_all(&h).unwrap();
        for (i, p) in packets.iter().enumerate() {
            f.write_all(&(i as u32).to_le_bytes()).unwrap();
            f.write_all(&7u32.to_le_bytes()).unwrap();
            f.write_all(&(p.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&(p.len() as u32 + 4).to_le_bytes()).unwrap();
            f.write_all(p).unwrap();
        }
    }

    fn drain(buffer: &CaptureBuffer) -> Vec<PacketBatch> {
        let mut out = Vec::new();
        while let Some(b) = buffer.wait_batch() {
            out.push(b);
        }
        out
    }

    #[test]
    fn batch_arena_keeps_record_boundaries() {
        let mut b = PacketBatch::new(5);
        b.push(1, 3, &[1, 2, 3]);
        b.push(2, 0, &[]);
        b.push(3, 9, &[4]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.byte_len(), 4);
        let got: Vec<_> = b.iter().map(|p| (p.number, p.data.to_vec())).collect();
        assert_eq!(got, vec![(5, vec![1, 2, 3]), (6, vec![]), (7, vec![4])]);
        assert!(b.get(3).is_none());
    }

    #[test]
    fn records_are_never_split_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pcap");
        let packets: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 20]).collect();
        write_capture(&path, &packets);

        // 36 bytes per record; 80-byte chunks hold two records each.
        let mut buffer = CaptureBuffer::new(CaptureFile::open(&path).unwrap(), 80, None);
        buffer.start().unwrap();
        let batches = drain(&buffer);
        let stats = buffer.join().unwrap();

        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 2));
        let starts: Vec<u64> = batches.iter().map(|b| b.start_packet_number()).collect();
        assert_eq!(starts, vec![1, 3, 5, 7, 9]);
        let flat: Vec<Vec<u8>> = batches.iter().flat_map(|b| b.iter().map(|p| p.data.to_vec())).collect();
        assert_eq!(flat, packets);
        assert_eq!(stats.packets, 10);
        assert_eq!(stats.bytes_consumed, 360);
        assert!(!buffer.is_running());

        let first = batches[0].get(0).unwrap();
        assert_eq!(first.timestamp_ns, 7_000);
        assert_eq!(first.original_len, 24);
    }

    #[test]
    fn oversized_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pcap");
        write_capture(&path, &[vec![0; 100], vec![1; 10]]);

        let mut buffer = CaptureBuffer::new(CaptureFile::open(&path).unwrap(), 64, None);
        buffer.start().unwrap();
        assert!(drain(&buffer).is_empty());
        let err = buffer.join().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::RecordTooLarge { offset: 24, captured_len: 100, chunk_size: 64 }
        ));
        assert!(!buffer.is_running());
    }

    #[test]
    fn partial_tail_record_ends_buffering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.pcap");
        write_capture(&path, &[vec![9; 8]]);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0u8; 10]).unwrap();
        drop(f);

        let mut buffer = CaptureBuffer::new(CaptureFile::open(&path).unwrap(), 1024, None);
        buffer.start().unwrap();
        let batches = drain(&buffer);
        let stats = buffer.join().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(stats.truncated_tail_bytes, 10);
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.pcap");
        write_capture(&path, &[vec![1; 4]]);
        let mut buffer = CaptureBuffer::new(CaptureFile::open(&path).unwrap(), 1024, None);
        buffer.start().unwrap();
        assert!(matches!(buffer.start(), Err(CaptureError::AlreadyStarted)));
        drain(&buffer);
        buffer.join().unwrap();
    }

    #[test]
    fn stop_before_start_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stopped.pcap");
        write_capture(&path, &[vec![1; 4], vec![2; 4]]);
        let mut buffer = CaptureBuffer::new(CaptureFile::open(&path).unwrap(), 1024, Some(1));
        buffer.stop();
        buffer.start().unwrap();
        assert!(drain(&buffer).is_empty());
        let stats = buffer.join().unwrap();
        assert!(stats.stopped_early);
        assert_eq!(stats.chunks, 0);
    }
}
