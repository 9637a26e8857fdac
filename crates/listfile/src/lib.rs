//! # List File -- append-only, block-framed record log
//!
//! A list file stores a sequence of variable-sized records inside fixed-size
//! blocks. Every frame carries a masked CRC32, large records are fragmented
//! across blocks, runs of small records are packed into a single array frame,
//! and frame payloads may be transparently compressed by a registered codec.
//! The header is self-describing: it fixes the block size and can carry an
//! arbitrary user metadata map.
//!
//! ## Binary layout
//!
//! ```text
//! [header: magic "LST1\0" | multiplier: u8 | ext: u8 | optional meta section]
//! [block of multiplier * 64 KiB][block]...
//!
//! frame = [masked_crc32: u32 LE][len: u32 LE][type: u8][payload...]
//! ```
//!
//! See [`format`] for the full wire format.
//!
//! ## Example
//!
//! ```rust,no_run
//! use listfile::{ListReader, ListWriter, WriterOptions};
//!
//! let mut w = ListWriter::open("records.lst", WriterOptions::default()).unwrap();
//! w.init().unwrap();
//! w.add_record(b"hello").unwrap();
//! w.flush().unwrap();
//! drop(w);
//!
//! let mut r = ListReader::open("records.lst", true, None).unwrap();
//! let mut scratch = Vec::new();
//! while let Some(record) = r.read_record(&mut scratch) {
//!     println!("{} bytes", record.len());
//! }
//! ```

pub mod compress;
pub mod format;
pub mod io;
mod reader;
mod writer;

use std::io as stdio;

use thiserror::Error;

pub use format::{MetaMap, PROTO_SET_KEY, PROTO_TYPE_KEY};
pub use reader::{CorruptionReporter, ListReader};
pub use writer::{ListWriter, WriterOptions};

/// Errors surfaced by list file operations.
///
/// Recoverable data corruption on the read path is *not* an error: the reader
/// reports it through its corruption callback and keeps going. This enum
/// covers the fatal cases -- I/O failures, an unusable header, API misuse, and
/// codec problems on the write path.
#[derive(Debug, Error)]
pub enum ListFileError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] stdio::Error),

    /// The file header is missing, malformed, or fails its checksum.
    #[error("bad header: {0}")]
    BadHeader(String),

    /// The API was used out of order (e.g. `add_record` before `init`).
    #[error("{0}")]
    Misuse(String),

    /// The configured compression method has no registered codec.
    #[error("no codec registered for {}", .0.name())]
    MissingCodec(compress::Method),

    /// A codec reported a failure.
    #[error("codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, ListFileError>;

#[cfg(test)]
mod tests;
