//! Output collaborators fed by the decoder: CSV files, the framed event log
//! and the live order books.
//!
//! Sink callbacks cannot fail, so file sinks keep the first error they hit,
//! stop writing, and report it from `finish`. File sinks write under a
//! `.partial` name and only move their files into place in `finish`; a sink
//! dropped unfinished (a failed run) deletes what it wrote.
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::book::{Books, OrderBookSnapshot};
use crate::decoder::MessageSink;
use crate::protocol::{Envelope, OrderExecution, OrderUpdate, normalize_price};
use crate::record::{EventKind, EventRecord, FORMAT_VERSION, FileHeader, RecordFrame, write_frame};

pub const ORDER_UPDATES_CSV: &str = "order_updates.csv";
pub const ORDER_EXECUTIONS_CSV: &str = "order_executions.csv";
pub const ORDER_BOOK_SNAPSHOTS_CSV: &str = "order_book_snapshots.csv";

const WRITE_BUFFER: usize = 1 << 20;
const EVENT_QUEUE: usize = 8192;

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create {path:?}"))?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER, file))
}

/// Name a file is written under until its sink is finished.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn discard(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => debug!(path = %partial.display(), "discarded unfinished output"),
        Err(e) => warn!(path = %partial.display(), error = %e, "cannot remove unfinished output"),
    }
}

/// One output file, written under its staging name.
struct StagedFile {
    path: PathBuf,
    partial: PathBuf,
    w: BufWriter<File>,
}

impl StagedFile {
    fn create(path: PathBuf) -> Result<Self> {
        let partial = staging_path(&path);
        let w = create(&partial)?;
        Ok(Self { path, partial, w })
    }

    fn commit(self) -> Result<()> {
        let Self { path, partial, mut w } = self;
        w.flush().with_context(|| format!("flush {partial:?}"))?;
        drop(w);
        fs::rename(&partial, &path).with_context(|| format!("rename {partial:?} to {path:?}"))
    }

    fn discard(self) {
        let Self { partial, w, .. } = self;
        drop(w);
        discard(&partial);
    }
}

struct CsvFiles {
    updates: StagedFile,
    executions: StagedFile,
    snapshots: StagedFile,
}

impl CsvFiles {
    fn commit(self) -> Result<()> {
        self.updates.commit()?;
        self.executions.commit()?;
        self.snapshots.commit()
    }

    fn discard(self) {
        self.updates.discard();
        self.executions.discard();
        self.snapshots.discard();
    }
}

/// RFC 3339 rendering of a nanosecond Unix timestamp; the raw number when it
/// is out of range.
pub fn format_sending_time(unix_ns: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(unix_ns))
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix_ns.to_string())
}

fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Three CSV files, one per message kind; snapshots are written one row per
/// level, bids first.
pub struct CsvSink {
    files: Option<CsvFiles>,
    rows: u64,
    error: Option<anyhow::Error>,
}

impl CsvSink {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let files = CsvFiles {
            updates: StagedFile::create(dir.join(ORDER_UPDATES_CSV))?,
            executions: StagedFile::create(dir.join(ORDER_EXECUTIONS_CSV))?,
            snapshots: StagedFile::create(dir.join(ORDER_BOOK_SNAPSHOTS_CSV))?,
        };
        let mut sink = Self {
            files: Some(files),
            rows: 0,
            error: None,
        };
        if let Some(files) = sink.files.as_mut() {
            writeln!(
                files.updates.w,
                "sequence_number,sending_time,security_id,rpt_seq,order_id,action,side,price,volume,md_flags_set,md_flags_set2"
            )?;
            writeln!(
                files.executions.w,
                "sequence_number,sending_time,security_id,rpt_seq,order_id,action,side,price,remaining_quantity,trade_price,trade_volume,trader_id"
            )?;
            writeln!(
                files.snapshots.w,
                "sequence_number,sending_time,security_id,rpt_seq,last_msg_seq_num_processed,side,level,order_id,price,volume,trade_id"
            )?;
        }
        Ok(sink)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush all files and move them into place; returns the rows written or
    /// the first write error, in which case nothing is kept.
    pub fn finish(mut self) -> Result<u64> {
        let Some(files) = self.files.take() else {
            return Ok(self.rows);
        };
        if let Some(e) = self.error.take() {
            files.discard();
            return Err(e);
        }
        files.commit()?;
        Ok(self.rows)
    }

    fn record(&mut self, written: std::io::Result<()>) {
        match written {
            Ok(()) => self.rows += 1,
            Err(e) => {
                self.error.get_or_insert_with(|| anyhow!(e).context("write CSV row"));
            }
        }
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Some(files) = self.files.take() {
            warn!(rows = self.rows, "CSV outputs not finished, discarding");
            files.discard();
        }
    }
}

impl MessageSink for CsvSink {
    fn on_order_update(&mut self, envelope: &Envelope, u: &OrderUpdate) {
        if self.error.is_some() {
            return;
        }
        let Some(files) = self.files.as_mut() else { return };
        let written = writeln!(
            files.updates.w,
            "{},{},{},{},{},{},{},{},{},{},{}",
            envelope.sequence_number,
            format_sending_time(envelope.sending_time),
            u.security_id,
            u.rpt_seq,
            u.order_id,
            u.action,
            u.side,
            u.price(),
            u.order_volume,
            u.md_flags_set,
            u.md_flags_set2
        );
        self.record(written);
    }

    fn on_order_execution(&mut self, envelope: &Envelope, e: &OrderExecution) {
        if self.error.is_some() {
            return;
        }
        let Some(files) = self.files.as_mut() else { return };
        let written = writeln!(
            files.executions.w,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            envelope.sequence_number,
            format_sending_time(envelope.sending_time),
            e.security_id,
            e.rpt_seq,
            e.order_id,
            e.action,
            e.side,
            e.price(),
            e.remaining_quantity,
            e.trade_price(),
            e.trade_volume,
            e.trader_id
        );
        self.record(written);
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        let sending_time = format_sending_time(envelope.sending_time);
        let h = &snapshot.header;
        let levels = snapshot
            .bids()
            .enumerate()
            .chain(snapshot.asks().enumerate());
        for (level, entry) in levels {
            if self.error.is_some() {
                return;
            }
            let Some(files) = self.files.as_mut() else { return };
            let written = writeln!(
                files.snapshots.w,
                "{},{},{},{},{},{},{},{},{},{},{}",
                envelope.sequence_number,
                sending_time,
                h.security_id,
                h.rpt_seq,
                h.last_msg_seq_num_processed,
                entry.side,
                level,
                entry.order_id,
                normalize_price(entry.order_price),
                entry.order_volume,
                entry.trade_id
            );
            self.record(written);
        }
    }
}

/// Framed event log written by a dedicated thread.
pub struct EventLogSink {
    path: PathBuf,
    /// Staging file; `None` once the log was finished.
    partial: Option<PathBuf>,
    tx: Option<Sender<RecordFrame>>,
    writer: Option<JoinHandle<Result<u64>>>,
    seq: u64,
}

impl EventLogSink {
    /// Create the log and write its header frame.
    pub fn create(path: impl Into<PathBuf>, source: &Path, link_type: u32) -> Result<Self> {
        let path = path.into();
        let partial = staging_path(&path);
        let w = create(&partial)?;
        let (tx, rx) = bounded::<RecordFrame>(EVENT_QUEUE);
        let writer = thread::Builder::new()
            .name("event-log-writer".into())
            .spawn(move || writer_thread(w, rx))
            .context("spawn event log writer")?;

        let header = RecordFrame::Header(FileHeader {
            version: FORMAT_VERSION,
            created_unix_ns: now_unix_ns(),
            source: source.display().to_string(),
            link_type,
        });
        tx.send(header).ok();
        info!(path = %path.display(), "writing event log");
        Ok(Self {
            path,
            partial: Some(partial),
            tx: Some(tx),
            writer: Some(writer),
            seq: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn push(&mut self, envelope: &Envelope, kind: EventKind) {
        let Some(tx) = &self.tx else { return };
        let event = RecordFrame::Event(EventRecord {
            seq: self.seq,
            envelope: *envelope,
            kind,
        });
        // A failed send means the writer already stopped; its error surfaces in `finish`.
        if tx.send(event).is_ok() {
            self.seq += 1;
        } else {
            self.tx = None;
        }
    }

    /// Close the log and move it into place; returns the number of events
    /// written. On a writer error the log is discarded.
    pub fn finish(mut self) -> Result<u64> {
        let closed = self.close();
        let Some(partial) = self.partial.take() else {
            return closed;
        };
        match closed {
            Ok(events) => {
                fs::rename(&partial, &self.path)
                    .with_context(|| format!("rename {partial:?} to {:?}", self.path))?;
                Ok(events)
            }
            Err(e) => {
                discard(&partial);
                Err(e)
            }
        }
    }

    fn close(&mut self) -> Result<u64> {
        drop(self.tx.take());
        match self.writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("event log writer panicked"))?,
            None => Ok(0),
        }
    }
}

impl Drop for EventLogSink {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(partial) = self.partial.take() {
            warn!(
                path = %self.path.display(),
                events = self.seq,
                "event log not finished, discarding"
            );
            discard(&partial);
        }
    }
}

impl MessageSink for EventLogSink {
    fn on_order_update(&mut self, envelope: &Envelope, update: &OrderUpdate) {
        self.push(envelope, EventKind::OrderUpdate(*update));
    }

    fn on_order_execution(&mut self, envelope: &Envelope, execution: &OrderExecution) {
        self.push(envelope, EventKind::OrderExecution(*execution));
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        self.push(envelope, EventKind::snapshot(snapshot));
    }
}

fn writer_thread(mut w: BufWriter<File>, rx: Receiver<RecordFrame>) -> Result<u64> {
    let mut events = 0u64;
    for frame in rx {
        if matches!(frame, RecordFrame::Event(_)) {
            events += 1;
        }
        write_frame(&mut w, &frame)?;
    }
    w.flush()?;
    debug!(events, "event log closed");
    Ok(events)
}

/// Keeps the live per-security books current.
#[derive(Debug, Default)]
pub struct BookSink {
    books: Books,
}

impl BookSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn books(&self) -> &Books {
        &self.books
    }

    pub fn into_books(self) -> Books {
        self.books
    }
}

impl MessageSink for BookSink {
    fn on_order_update(&mut self, _envelope: &Envelope, update: &OrderUpdate) {
        self.books.apply_update(update);
    }

    fn on_order_execution(&mut self, _envelope: &Envelope, execution: &OrderExecution) {
        self.books.apply_execution(execution);
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        self.books.apply_snapshot(envelope, snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ProtocolDecoder;
    use crate::record::read_frame;
    use std::io::BufReader;

    const ORDER_EXECUTION_1398: &[u8] = include_bytes!("../tests/fixtures/order_execution_1398.bin");

    #[test]
    fn sending_time_is_rfc3339() {
        assert_eq!(format_sending_time(0), "1970-01-01T00:00:00Z");
        assert_eq!(
            format_sending_time(1_696_917_600_000_449_184),
            "2023-10-10T06:00:00.000449184Z"
        );
    }

    #[test]
    fn csv_rows_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = ProtocolDecoder::new(CsvSink::create(dir.path()).unwrap());
        decoder.decode_message(ORDER_EXECUTION_1398).unwrap();
        let (sink, _) = decoder.into_parts();
        assert_eq!(sink.finish().unwrap(), 17);

        let updates = fs::read_to_string(dir.path().join(ORDER_UPDATES_CSV)).unwrap();
        let lines: Vec<&str> = updates.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("5374,2023-10-10T06:00:00.000449184Z,2448082,558,1892948862244474279,new,bid,99150,400,"));

        let executions = fs::read_to_string(dir.path().join(ORDER_EXECUTIONS_CSV)).unwrap();
        assert_eq!(executions.lines().count(), 17);
        let snapshots = fs::read_to_string(dir.path().join(ORDER_BOOK_SNAPSHOTS_CSV)).unwrap();
        assert_eq!(snapshots.lines().count(), 1);
    }

    #[test]
    fn unfinished_sinks_discard_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = ProtocolDecoder::new((
            CsvSink::create(dir.path()).unwrap(),
            EventLogSink::create(dir.path().join("events.bin"), Path::new("feed.pcap"), 1).unwrap(),
        ));
        decoder.decode_message(ORDER_EXECUTION_1398).unwrap();
        assert_eq!(decoder.sink().0.rows(), 17);
        drop(decoder);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn event_log_holds_header_then_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let sink = EventLogSink::create(&path, Path::new("feed.pcap"), 1).unwrap();
        let mut decoder = ProtocolDecoder::new(sink);
        decoder.decode_message(ORDER_EXECUTION_1398).unwrap();
        let (sink, _) = decoder.into_parts();
        assert_eq!(sink.finish().unwrap(), 17);

        let mut r = BufReader::new(File::open(&path).unwrap());
        match read_frame(&mut r).unwrap() {
            Some(RecordFrame::Header(h)) => {
                assert_eq!(h.version, FORMAT_VERSION);
                assert_eq!(h.source, "feed.pcap");
            }
            other => panic!("expected header, got {other:?}"),
        }
        let mut seqs = Vec::new();
        while let Some(frame) = read_frame(&mut r).unwrap() {
            let RecordFrame::Event(ev) = frame else { panic!("second header") };
            assert_eq!(ev.envelope.sequence_number, 5374);
            seqs.push(ev.seq);
        }
        assert_eq!(seqs, (0..17).collect::<Vec<u64>>());
    }

    #[test]
    fn book_sink_follows_fixture() {
        let mut decoder = ProtocolDecoder::new(BookSink::new());
        decoder.decode_message(ORDER_EXECUTION_1398).unwrap();
        let books = decoder.sink().books();
        assert_eq!(books.len(), 1);
        let book = books.get(2448082).unwrap();
        // The new bid of 400 is partially filled down to 381; the resting
        // offers it traded against were never seen, so the ask side stays empty.
        let bid = book.best_bid().unwrap();
        assert_eq!(bid.price, 9915000000);
        assert_eq!(bid.volume, 381);
        assert_eq!(book.order_count(), 1);
        assert!(book.best_ask().is_none());
    }
}
