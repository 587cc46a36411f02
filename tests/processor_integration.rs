mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use market_data_pcap::book::OrderBookSnapshot;
use market_data_pcap::config::{PollMode, ProcessorConfig};
use market_data_pcap::decoder::{MessageHandlers, MessageSink};
use market_data_pcap::error::CaptureError;
use market_data_pcap::processor::PcapProcessor;
use market_data_pcap::protocol::{Envelope, OrderExecution, OrderUpdate, Side, UpdateAction};
use market_data_pcap::sink::BookSink;

use common::*;

#[derive(Default)]
struct Recorder {
    sequence_numbers: Vec<u32>,
    updates: Vec<OrderUpdate>,
    executions: Vec<OrderExecution>,
    snapshots: Vec<OrderBookSnapshot>,
}

impl MessageSink for Recorder {
    fn on_order_update(&mut self, envelope: &Envelope, update: &OrderUpdate) {
        self.sequence_numbers.push(envelope.sequence_number);
        self.updates.push(*update);
    }
    fn on_order_execution(&mut self, envelope: &Envelope, execution: &OrderExecution) {
        self.sequence_numbers.push(envelope.sequence_number);
        self.executions.push(*execution);
    }
    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        self.sequence_numbers.push(envelope.sequence_number);
        self.snapshots.push(snapshot.clone());
    }
}

/// Fixture datagrams interleaved with traffic the pipeline must skip.
fn mixed_capture() -> Vec<Vec<u8>> {
    vec![
        udp(ORDER_UPDATE_86),
        packet(IP_PROTO_TCP, b"not a datagram"),
        udp(ORDER_EXECUTION_1398),
        vec![0u8; 9],
        udp(&ORDER_UPDATE_86[..40]),
        udp(ORDER_UPDATE_86),
    ]
}

fn run_with(config: ProcessorConfig) -> (Recorder, market_data_pcap::processor::RunSummary) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feed.pcap");
    write_pcap(&path, &mixed_capture());
    let processor = PcapProcessor::open(&path, config).unwrap();
    assert_eq!(processor.header().link_type, 1);
    let report = processor.run(Recorder::default()).unwrap();
    (report.sink, report.summary)
}

fn assert_mixed_capture(sink: &Recorder, summary: &market_data_pcap::processor::RunSummary) {
    assert_eq!(summary.capture.packets, 6);
    assert_eq!(summary.pipeline.processed, 6);
    assert_eq!(summary.pipeline.forwarded, 4);
    assert_eq!(summary.pipeline.skipped_transport, 1);
    assert_eq!(summary.pipeline.skipped_malformed, 1);
    assert_eq!(summary.decoder.datagrams, 4);
    assert_eq!(summary.decoder.decode_errors, 1);

    assert_eq!(sink.updates.len(), 3);
    assert_eq!(sink.executions.len(), 16);
    assert!(sink.snapshots.is_empty());

    // Capture order is kept across batches.
    let mut expected = vec![4091];
    expected.extend([5374; 17]);
    expected.push(4091);
    assert_eq!(sink.sequence_numbers, expected);

    let first = &sink.executions[0];
    assert_eq!(first.order_id, 1892948862244474279);
    assert_eq!(first.order_price, 9915000000);
    assert_eq!(first.remaining_quantity, 399);
    assert_eq!(first.trade_price, 9882800000);
    assert_eq!(first.trade_volume, 1);
    assert_eq!(first.security_id, 2448082);
    assert_eq!(first.side, Side::Bid);
    assert_eq!(sink.updates[1].action, UpdateAction::New);
}

#[test]
fn sleeping_consumer_decodes_in_capture_order() {
    let config = ProcessorConfig::default()
        .with_chunk_size(1600)
        .with_poll(PollMode::Sleep(Duration::from_micros(200)));
    let (sink, summary) = run_with(config);
    assert_mixed_capture(&sink, &summary);
    assert!(summary.capture.batches > 1);
}

#[test]
fn blocking_consumer_with_bounded_queue() {
    let config = ProcessorConfig::default()
        .with_chunk_size(1600)
        .with_queue_capacity(Some(1))
        .with_poll(PollMode::Blocking);
    let (sink, summary) = run_with(config);
    assert_mixed_capture(&sink, &summary);
}

#[test]
fn single_chunk_holds_whole_file() {
    let (sink, summary) = run_with(ProcessorConfig::default());
    assert_mixed_capture(&sink, &summary);
    assert_eq!(summary.capture.batches, 1);
    assert_eq!(summary.capture.chunks, 1);
}

#[test]
fn handlers_receive_snapshots_from_capture() {
    let body = snapshot_message(
        2448082,
        12,
        &[
            (1, 9_915_000_000, 5, b'0'),
            (2, 9_916_000_000, 2, b'1'),
            (3, i64::MAX, 1, b'0'),
            (4, 0, 0, b'J'),
        ],
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.pcap");
    write_pcap(
        &path,
        &[udp(&datagram(1, Envelope::LAST_FRAGMENT, &body)), udp(ORDER_UPDATE_86)],
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_snapshots = Arc::clone(&seen);
    let handlers = MessageHandlers::new().with_order_book_snapshot(move |s| {
        seen_snapshots
            .lock()
            .unwrap()
            .push((s.header.security_id, s.len()))
    });
    let report = PcapProcessor::open(&path, ProcessorConfig::default())
        .unwrap()
        .run(handlers)
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(2448082, 2)]);
    assert_eq!(report.summary.decoder.order_book_snapshots, 1);
    assert_eq!(report.summary.decoder.order_updates, 1);
}

#[test]
fn book_sink_tracks_snapshot_then_incrementals() {
    let body = snapshot_message(2448082, 12, &[(77, 9_882_800_000, 3, b'1')]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.pcap");
    write_pcap(
        &path,
        &[udp(&datagram(1, Envelope::LAST_FRAGMENT, &body)), udp(ORDER_EXECUTION_1398)],
    );
    let report = PcapProcessor::open(&path, ProcessorConfig::default())
        .unwrap()
        .run(BookSink::new())
        .unwrap();
    let books = report.sink.into_books();
    let book = books.get(2448082).unwrap();
    assert_eq!(book.best_bid().map(|l| (l.price, l.volume)), Some((9_915_000_000, 381)));
    assert_eq!(book.best_ask().map(|l| (l.price, l.volume)), Some((9_882_800_000, 3)));
}

#[test]
fn zero_length_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.pcap");
    std::fs::File::create(&path).unwrap();
    let err = PcapProcessor::open(&path, ProcessorConfig::default()).err().unwrap();
    assert!(matches!(err, CaptureError::ZeroLength(p) if p == path));
}

#[test]
fn missing_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = PcapProcessor::open(dir.path().join("nope.pcap"), ProcessorConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, CaptureError::Open { .. }));
}

#[test]
fn record_larger_than_chunk_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.pcap");
    write_pcap(&path, &[udp(ORDER_UPDATE_86), udp(ORDER_EXECUTION_1398)]);
    let processor =
        PcapProcessor::open(&path, ProcessorConfig::default().with_chunk_size(512)).unwrap();
    let err = processor.run(Recorder::default()).err().unwrap();
    assert!(matches!(
        err,
        CaptureError::RecordTooLarge { captured_len: 1440, chunk_size: 512, .. }
    ));
}

#[test]
fn stop_before_run_decodes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feed.pcap");
    write_pcap(&path, &mixed_capture());
    let processor = PcapProcessor::open(&path, ProcessorConfig::default()).unwrap();
    processor.stop_signal().stop();
    let report = processor.run(Recorder::default()).unwrap();
    assert!(report.summary.capture.stopped_early);
    assert_eq!(report.summary.capture.packets, 0);
    assert!(report.sink.updates.is_empty());
}
