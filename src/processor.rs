//! End-to-end run over one capture file.
//!
//! The producer thread of [`CaptureBuffer`] reads and batches records while a
//! consumer thread drains batches in capture order, strips packet headers and
//! decodes every datagram into the caller's [`MessageSink`].
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Level, debug, enabled, info, trace, warn};

use crate::buffer::{BufferStats, CaptureBuffer, PacketBatch, StopSignal};
use crate::config::{PollMode, ProcessorConfig};
use crate::decoder::{DecoderStats, MessageSink, ProtocolDecoder};
use crate::error::CaptureError;
use crate::logging::hex_dump;
use crate::pcap::{CaptureFile, GlobalHeader};
use crate::pipeline::{PacketPipeline, PipelineStats};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub capture: BufferStats,
    pub pipeline: PipelineStats,
    pub decoder: DecoderStats,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "packets: {} ({} batches, {} bytes)",
            self.capture.packets, self.capture.batches, self.capture.bytes_consumed
        )?;
        writeln!(
            f,
            "datagrams: {} forwarded, {} skipped (transport {}, malformed {})",
            self.pipeline.forwarded,
            self.pipeline.skipped(),
            self.pipeline.skipped_transport,
            self.pipeline.skipped_malformed
        )?;
        writeln!(
            f,
            "messages: {} order updates, {} executions, {} snapshots ({} entries)",
            self.decoder.order_updates,
            self.decoder.order_executions,
            self.decoder.order_book_snapshots,
            self.decoder.snapshot_entries
        )?;
        write!(
            f,
            "unknown templates: {}, decode errors: {}, elapsed: {:.3?}",
            self.decoder.unknown_templates, self.decoder.decode_errors, self.elapsed
        )
    }
}

/// Sink handed back after the run, with the run's statistics.
#[derive(Debug)]
pub struct RunReport<S> {
    pub sink: S,
    pub summary: RunSummary,
}

pub struct PcapProcessor {
    buffer: CaptureBuffer,
    config: ProcessorConfig,
}

impl PcapProcessor {
    /// Open and validate the capture file. Nothing is read past the global
    /// header until [`run`](Self::run).
    pub fn open(path: impl AsRef<Path>, config: ProcessorConfig) -> Result<Self, CaptureError> {
        let file = CaptureFile::open(path)?;
        let buffer = CaptureBuffer::new(file, config.chunk_size, config.queue_capacity);
        Ok(Self { buffer, config })
    }

    pub fn header(&self) -> &GlobalHeader {
        self.buffer.header()
    }

    /// Signal that ends the run early; batches already queued are still decoded.
    pub fn stop_signal(&self) -> StopSignal {
        self.buffer.stop_signal()
    }

    /// Process the whole file. A fatal capture error fails the run and drops
    /// the sink, so file sinks discard whatever they had written.
    pub fn run<S>(mut self, sink: S) -> Result<RunReport<S>, CaptureError>
    where
        S: MessageSink + Send,
    {
        let started = Instant::now();
        self.buffer.start()?;

        let buffer = &self.buffer;
        let poll = self.config.poll;
        let consumed = thread::scope(|scope| {
            let consumer = thread::Builder::new()
                .name("capture-consumer".into())
                .spawn_scoped(scope, move || consume(buffer, poll, sink));
            match consumer {
                Ok(handle) => handle.join().map_err(|_| CaptureError::ConsumerPanicked),
                Err(e) => Err(CaptureError::from(e)),
            }
        });
        if consumed.is_err() {
            self.buffer.stop();
        }
        let capture = self.buffer.join();

        let (sink, pipeline, decoder) = consumed?;
        let summary = RunSummary {
            capture: capture?,
            pipeline,
            decoder,
            elapsed: started.elapsed(),
        };
        info!(
            packets = summary.capture.packets,
            datagrams = summary.pipeline.forwarded,
            messages = summary.decoder.messages(),
            decode_errors = summary.decoder.decode_errors,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "finished capture file"
        );
        Ok(RunReport { sink, summary })
    }
}

fn consume<S: MessageSink>(
    buffer: &CaptureBuffer,
    poll: PollMode,
    sink: S,
) -> (S, PipelineStats, DecoderStats) {
    let mut decoder = ProtocolDecoder::new(sink);
    let mut pipeline = PacketPipeline::new(|payload: &[u8]| {
        if let Err(error) = decoder.decode_message(payload) {
            warn!(
                %error,
                sequence_number = decoder.envelope().sequence_number,
                "dropping undecodable datagram"
            );
        }
    });

    match poll {
        PollMode::Blocking => {
            while let Some(batch) = buffer.wait_batch() {
                feed(&mut pipeline, &batch);
            }
        }
        PollMode::Sleep(interval) => loop {
            if let Some(batch) = buffer.next_batch() {
                feed(&mut pipeline, &batch);
                continue;
            }
            if !buffer.is_running() {
                // Batches pushed right before the producer finished.
                while let Some(batch) = buffer.next_batch() {
                    feed(&mut pipeline, &batch);
                }
                break;
            }
            thread::sleep(interval);
        },
    }

    let (_, pipeline_stats) = pipeline.into_parts();
    let (sink, decoder_stats) = decoder.into_parts();
    (sink, pipeline_stats, decoder_stats)
}

fn feed<H: FnMut(&[u8])>(pipeline: &mut PacketPipeline<H>, batch: &PacketBatch) {
    debug!(
        start_packet = batch.start_packet_number(),
        packets = batch.len(),
        "processing batch"
    );
    if enabled!(Level::TRACE) {
        if let Some(first) = batch.get(0) {
            trace!(packet = first.number, "first packet of batch\n{}", hex_dump(first.data));
        }
    }
    for packet in batch.iter() {
        pipeline.process_packet(packet.data);
    }
}
