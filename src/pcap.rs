//! Capture file layout: one global header, then `[record header][captured bytes]`
//! repeated until end of file.
//!
//! The global header's magic number tells the byte order of every header
//! field in the file and whether record timestamps carry microseconds or
//! nanoseconds. [`CaptureFile`] reads the global header exactly once on open
//! and then hands out raw chunks at a read offset that only moves forward.
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::CaptureError;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampResolution {
    Micros,
    Nanos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeader {
    pub magic_number: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub this_zone: i32,
    pub sig_figs: u32,
    pub snap_len: u32,
    pub link_type: u32,
    pub byte_order: ByteOrder,
    pub resolution: TimestampResolution,
}

impl GlobalHeader {
    pub fn parse(raw: &[u8; GLOBAL_HEADER_LEN]) -> Result<Self, CaptureError> {
        let word = |at: usize| [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];
        let half = |at: usize| [raw[at], raw[at + 1]];

        let magic = u32::from_le_bytes(word(0));
        let (byte_order, resolution) = match magic {
            MAGIC_MICROS => (ByteOrder::Little, TimestampResolution::Micros),
            MAGIC_NANOS => (ByteOrder::Little, TimestampResolution::Nanos),
            m if m.swap_bytes() == MAGIC_MICROS => (ByteOrder::Big, TimestampResolution::Micros),
            m if m.swap_bytes() == MAGIC_NANOS => (ByteOrder::Big, TimestampResolution::Nanos),
            other => return Err(CaptureError::BadMagic(other)),
        };
        let o = byte_order;
        Ok(Self {
            magic_number: o.u32(word(0)),
            version_major: o.u16(half(4)),
            version_minor: o.u16(half(6)),
            this_zone: o.u32(word(8)) as i32,
            sig_figs: o.u32(word(12)),
            snap_len: o.u32(word(16)),
            link_type: o.u32(word(20)),
            byte_order,
            resolution,
        })
    }

    /// Parse the record header at the start of `bytes`; `None` when fewer than
    /// [`RECORD_HEADER_LEN`] bytes are available.
    pub fn record_header(&self, bytes: &[u8]) -> Option<RecordHeader> {
        let raw = bytes.get(..RECORD_HEADER_LEN)?;
        let word = |at: usize| self.byte_order.u32([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Some(RecordHeader {
            ts_sec: word(0),
            ts_frac: word(4),
            captured_len: word(8),
            original_len: word(12),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub ts_sec: u32,
    /// Microseconds or nanoseconds, depending on the file's resolution.
    pub ts_frac: u32,
    pub captured_len: u32,
    pub original_len: u32,
}

impl RecordHeader {
    pub fn timestamp_ns(&self, resolution: TimestampResolution) -> u64 {
        let frac = match resolution {
            TimestampResolution::Micros => u64::from(self.ts_frac) * 1_000,
            TimestampResolution::Nanos => u64::from(self.ts_frac),
        };
        u64::from(self.ts_sec) * 1_000_000_000 + frac
    }
}

/// Open capture file positioned after its global header.
#[derive(Debug)]
pub struct CaptureFile {
    file: File,
    path: PathBuf,
    size: u64,
    offset: u64,
    header: GlobalHeader,
}

impl CaptureFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|source| CaptureError::Open {
            path: path.clone(),
            source,
        })?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Err(CaptureError::ZeroLength(path));
        }

        let mut raw = [0u8; GLOBAL_HEADER_LEN];
        let got = read_full(&mut file, &mut raw)?;
        if got < GLOBAL_HEADER_LEN {
            return Err(CaptureError::ShortRead {
                offset: 0,
                expected: GLOBAL_HEADER_LEN,
                actual: got,
            });
        }
        let header = GlobalHeader::parse(&raw)?;
        info!(
            path = %path.display(),
            size,
            magic = %format!("{:#010x}", header.magic_number),
            version = %format!("{}.{}", header.version_major, header.version_minor),
            link_type = header.link_type,
            "opened capture file"
        );

        Ok(Self {
            file,
            path,
            size,
            offset: GLOBAL_HEADER_LEN as u64,
            header,
        })
    }

    pub fn header(&self) -> &GlobalHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the first byte not yet consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }

    /// Fill `buf` from the current offset without consuming it. Anything
    /// short of `buf.len()` bytes is a [`CaptureError::ShortRead`].
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        let got = read_full(&mut self.file, buf)?;
        if got < buf.len() {
            return Err(CaptureError::ShortRead {
                offset: self.offset,
                expected: buf.len(),
                actual: got,
            });
        }
        Ok(())
    }

    /// Mark `n` bytes after the offset as consumed.
    pub fn consume(&mut self, n: u64) {
        self.offset = (self.offset + n).min(self.size);
    }
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
