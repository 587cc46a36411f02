//! Error taxonomy for capture buffering and datagram decoding.
//!
//! [`CaptureError`] is fatal for a run: the capture file cannot be read any
//! further. [`DecodeError`] is scoped to a single datagram payload and never
//! aborts the surrounding batch.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot analyze a file of size zero: {0:?}")]
    ZeroLength(PathBuf),

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("unrecognized capture file magic number {0:#010x}")]
    BadMagic(u32),

    #[error(
        "record at offset {offset} declares {captured_len} captured bytes, which does not fit a {chunk_size}-byte read chunk"
    )]
    RecordTooLarge {
        offset: u64,
        captured_len: u32,
        chunk_size: usize,
    },

    #[error("capture buffering was already started")]
    AlreadyStarted,

    #[error("capture producer thread panicked")]
    ProducerPanicked,

    #[error("capture consumer thread panicked")]
    ConsumerPanicked,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{what} needs {needed} bytes at offset {offset}, payload has {available}")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("template {template_id} declares block length {declared}, expected {expected}")]
    BlockLengthMismatch {
        template_id: u16,
        declared: u16,
        expected: usize,
    },

    #[error("repeating group block size {block_size} is smaller than an entry ({min} bytes)")]
    GroupBlockTooSmall { block_size: u16, min: usize },
}
