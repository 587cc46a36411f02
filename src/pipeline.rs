//! Per-packet header stripping in front of a datagram handler.
use tracing::trace;

use crate::frame::{self, FrameSkip};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed: u64,
    pub forwarded: u64,
    pub skipped_transport: u64,
    pub skipped_malformed: u64,
}

impl PipelineStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_transport + self.skipped_malformed
    }
}

/// Feeds the UDP payload of every supported packet to `handler`.
pub struct PacketPipeline<H> {
    handler: H,
    stats: PipelineStats,
}

impl<H> PacketPipeline<H>
where
    H: FnMut(&[u8]),
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            stats: PipelineStats::default(),
        }
    }

    /// Returns `true` when the handler was invoked.
    pub fn process_packet(&mut self, packet: &[u8]) -> bool {
        self.stats.processed += 1;
        match frame::datagram_payload(packet) {
            Ok(payload) => {
                (self.handler)(payload);
                self.stats.forwarded += 1;
                true
            }
            Err(skip @ FrameSkip::UnsupportedTransport(_)) => {
                self.stats.skipped_transport += 1;
                trace!(packet = self.stats.processed, ?skip, "skipping packet");
                false
            }
            Err(skip) => {
                self.stats.skipped_malformed += 1;
                trace!(packet = self.stats.processed, ?skip, "skipping packet");
                false
            }
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn into_parts(self) -> (H, PipelineStats) {
        (self.handler, self.stats)
    }
}
