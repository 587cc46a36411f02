//! Datagram decoder for the market-data protocol.
//!
//! [`ProtocolDecoder::decode_message`] walks one UDP payload: the envelope,
//! the optional incremental header, then every message frame up to the
//! envelope's declared size. Each recognized message is decoded in full and
//! handed to a [`MessageSink`], whether or not the sink cares about it.
use tracing::trace;

use crate::book::OrderBookSnapshot;
use crate::error::DecodeError;
use crate::protocol::{
    Envelope, GroupSize, IncrementalHeader, MessageFrame, MessageKind, OrderBookEntry,
    OrderBookSnapshotHeader, OrderExecution, OrderUpdate,
};

/// Receiver of decoded messages. Every method defaults to doing nothing.
pub trait MessageSink {
    fn on_order_update(&mut self, _envelope: &Envelope, _update: &OrderUpdate) {}

    fn on_order_execution(&mut self, _envelope: &Envelope, _execution: &OrderExecution) {}

    fn on_order_book_snapshot(&mut self, _envelope: &Envelope, _snapshot: &OrderBookSnapshot) {}
}

impl MessageSink for () {}

impl<S: MessageSink + ?Sized> MessageSink for &mut S {
    fn on_order_update(&mut self, envelope: &Envelope, update: &OrderUpdate) {
        (**self).on_order_update(envelope, update);
    }

    fn on_order_execution(&mut self, envelope: &Envelope, execution: &OrderExecution) {
        (**self).on_order_execution(envelope, execution);
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        (**self).on_order_book_snapshot(envelope, snapshot);
    }
}

impl<S: MessageSink> MessageSink for Option<S> {
    fn on_order_update(&mut self, envelope: &Envelope, update: &OrderUpdate) {
        if let Some(sink) = self {
            sink.on_order_update(envelope, update);
        }
    }

    fn on_order_execution(&mut self, envelope: &Envelope, execution: &OrderExecution) {
        if let Some(sink) = self {
            sink.on_order_execution(envelope, execution);
        }
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        if let Some(sink) = self {
            sink.on_order_book_snapshot(envelope, snapshot);
        }
    }
}

/// Fan-out: both sinks see every message, `A` first.
impl<A: MessageSink, B: MessageSink> MessageSink for (A, B) {
    fn on_order_update(&mut self, envelope: &Envelope, update: &OrderUpdate) {
        self.0.on_order_update(envelope, update);
        self.1.on_order_update(envelope, update);
    }

    fn on_order_execution(&mut self, envelope: &Envelope, execution: &OrderExecution) {
        self.0.on_order_execution(envelope, execution);
        self.1.on_order_execution(envelope, execution);
    }

    fn on_order_book_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        self.0.on_order_book_snapshot(envelope, snapshot);
        self.1.on_order_book_snapshot(envelope, snapshot);
    }
}

type Handler<T> = Box<dyn FnMut(&T) + Send>;

/// Optional per-kind callbacks. A kind without a callback is still decoded.
#[derive(Default)]
pub struct MessageHandlers {
    order_update: Option<Handler<OrderUpdate>>,
    order_execution: Option<Handler<OrderExecution>>,
    order_book_snapshot: Option<Handler<OrderBookSnapshot>>,
}

impl MessageHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order_update(mut self, f: impl FnMut(&OrderUpdate) + Send + 'static) -> Self {
        self.order_update = Some(Box::new(f));
        self
    }

    pub fn with_order_execution(mut self, f: impl FnMut(&OrderExecution) + Send + 'static) -> Self {
        self.order_execution = Some(Box::new(f));
        self
    }

    pub fn with_order_book_snapshot(
        mut self,
        f: impl FnMut(&OrderBookSnapshot) + Send + 'static,
    ) -> Self {
        self.order_book_snapshot = Some(Box::new(f));
        self
    }
}

impl MessageSink for MessageHandlers {
    fn on_order_update(&mut self, _envelope: &Envelope, update: &OrderUpdate) {
        if let Some(f) = self.order_update.as_mut() {
            f(update);
        }
    }

    fn on_order_execution(&mut self, _envelope: &Envelope, execution: &OrderExecution) {
        if let Some(f) = self.order_execution.as_mut() {
            f(execution);
        }
    }

    fn on_order_book_snapshot(&mut self, _envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        if let Some(f) = self.order_book_snapshot.as_mut() {
            f(snapshot);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub datagrams: u64,
    pub order_updates: u64,
    pub order_executions: u64,
    pub order_book_snapshots: u64,
    /// Snapshot entries kept after null/empty-book filtering.
    pub snapshot_entries: u64,
    pub unknown_templates: u64,
    pub decode_errors: u64,
}

impl DecoderStats {
    pub fn messages(&self) -> u64 {
        self.order_updates + self.order_executions + self.order_book_snapshots
    }
}

/// Stateful decoder. Headers of the most recent datagram stay readable until
/// the next call. Not meant to be shared across threads.
pub struct ProtocolDecoder<S> {
    sink: S,
    envelope: Envelope,
    incremental: Option<IncrementalHeader>,
    last_frame: Option<MessageFrame>,
    stats: DecoderStats,
}

impl<S: MessageSink> ProtocolDecoder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            envelope: Envelope::default(),
            incremental: None,
            last_frame: None,
            stats: DecoderStats::default(),
        }
    }

    /// Decode one datagram payload and return the number of messages
    /// dispatched. An unknown template id ends the datagram without error.
    /// On error, messages before the faulty one have already been dispatched.
    pub fn decode_message(&mut self, payload: &[u8]) -> Result<usize, DecodeError> {
        self.stats.datagrams += 1;
        let result = self.decode_payload(payload);
        if result.is_err() {
            self.stats.decode_errors += 1;
        }
        result
    }

    fn decode_payload(&mut self, payload: &[u8]) -> Result<usize, DecodeError> {
        self.incremental = None;
        self.last_frame = None;

        self.envelope = Envelope::decode(payload, 0)?;
        let mut offset = Envelope::SIZE;
        if self.envelope.is_incremental() {
            self.incremental = Some(IncrementalHeader::decode(payload, offset)?);
            offset += IncrementalHeader::SIZE;
        }

        let end = usize::from(self.envelope.message_size);
        let mut dispatched = 0;
        while offset < end {
            let frame = MessageFrame::decode(payload, offset)?;
            self.last_frame = Some(frame);
            offset += MessageFrame::SIZE;

            let Some(kind) = MessageKind::from_template_id(frame.template_id) else {
                self.stats.unknown_templates += 1;
                trace!(
                    sequence_number = self.envelope.sequence_number,
                    template_id = frame.template_id,
                    offset,
                    "unknown template, skipping rest of datagram"
                );
                break;
            };

            offset = match kind {
                MessageKind::OrderUpdate => {
                    expect_block_length(&frame, OrderUpdate::SIZE)?;
                    let update = OrderUpdate::decode(payload, offset)?;
                    self.stats.order_updates += 1;
                    self.sink.on_order_update(&self.envelope, &update);
                    offset + OrderUpdate::SIZE
                }
                MessageKind::OrderExecution => {
                    expect_block_length(&frame, OrderExecution::SIZE)?;
                    let execution = OrderExecution::decode(payload, offset)?;
                    self.stats.order_executions += 1;
                    self.sink.on_order_execution(&self.envelope, &execution);
                    offset + OrderExecution::SIZE
                }
                MessageKind::OrderBookSnapshot => self.decode_snapshot(payload, offset, &frame)?,
            };
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Root block, group descriptor, then `num_in_group` entries of
    /// `block_size` bytes each. Returns the offset past the last entry.
    fn decode_snapshot(
        &mut self,
        payload: &[u8],
        offset: usize,
        frame: &MessageFrame,
    ) -> Result<usize, DecodeError> {
        let root_len = usize::from(frame.block_length);
        if root_len < OrderBookSnapshotHeader::SIZE {
            return Err(DecodeError::BlockLengthMismatch {
                template_id: frame.template_id,
                declared: frame.block_length,
                expected: OrderBookSnapshotHeader::SIZE,
            });
        }
        let header = OrderBookSnapshotHeader::decode(payload, offset)?;
        let group = GroupSize::decode(payload, offset + root_len)?;
        let block_size = usize::from(group.block_size);
        if block_size < OrderBookEntry::SIZE {
            return Err(DecodeError::GroupBlockTooSmall {
                block_size: group.block_size,
                min: OrderBookEntry::SIZE,
            });
        }

        let mut offset = offset + root_len + GroupSize::SIZE;
        let mut snapshot = OrderBookSnapshot::new(header);
        for _ in 0..group.num_in_group {
            if payload.len().saturating_sub(offset) < block_size {
                return Err(DecodeError::Truncated {
                    what: "order book entry",
                    offset,
                    needed: block_size,
                    available: payload.len().saturating_sub(offset),
                });
            }
            let entry = OrderBookEntry::decode(payload, offset)?;
            if snapshot.insert(entry) {
                self.stats.snapshot_entries += 1;
            }
            offset += block_size;
        }

        self.stats.order_book_snapshots += 1;
        self.sink.on_order_book_snapshot(&self.envelope, &snapshot);
        Ok(offset)
    }

    /// Envelope of the most recent datagram.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn incremental_header(&self) -> Option<&IncrementalHeader> {
        self.incremental.as_ref()
    }

    /// Frame of the last message seen in the most recent datagram.
    pub fn last_frame(&self) -> Option<&MessageFrame> {
        self.last_frame.as_ref()
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_parts(self) -> (S, DecoderStats) {
        (self.sink, self.stats)
    }
}

fn expect_block_length(frame: &MessageFrame, expected: usize) -> Result<(), DecodeError> {
    if usize::from(frame.block_length) == expected {
        Ok(())
    } else {
        Err(DecodeError::BlockLengthMismatch {
            template_id: frame.template_id,
            declared: frame.block_length,
            expected,
        })
    }
}
