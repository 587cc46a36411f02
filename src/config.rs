//! Runtime knobs for the capture pipeline.
use std::time::Duration;

/// Default read chunk: 16 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default sleep between empty polls of the batch queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1000);

/// How the consumer waits for the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Drain the queue, then sleep for the interval when it is empty.
    Sleep(Duration),
    /// Block on the queue until a batch arrives or the producer is done.
    Blocking,
}

impl Default for PollMode {
    fn default() -> Self {
        PollMode::Sleep(DEFAULT_POLL_INTERVAL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Bytes read from disk per producer iteration. Must hold the largest record.
    pub chunk_size: usize,
    /// `None` keeps the queue unbounded.
    pub queue_capacity: Option<usize>,
    pub poll: PollMode,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: None,
            poll: PollMode::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity.map(|c| c.max(1));
        self
    }

    pub fn with_poll(mut self, poll: PollMode) -> Self {
        self.poll = poll;
        self
    }
}
