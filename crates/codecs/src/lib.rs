//! # Codecs -- built-in compression plug-ins
//!
//! Adapters binding real compression libraries to the list file's codec
//! registry: zlib (raw deflate, no stream header) via `flate2`, snappy via
//! `snap`, and lz4 block format via `lz4_flex`.
//!
//! The core `listfile` crate links none of these libraries; it only knows
//! method ids. Call [`register_builtin`] once at startup and every writer
//! and reader in the process can use all three.
//!
//! ## Example
//!
//! ```rust,no_run
//! use listfile::compress::Method;
//! use listfile::{ListWriter, WriterOptions};
//!
//! codecs::register_builtin();
//!
//! let opts = WriterOptions {
//!     compress_method: Some(Method::Lz4),
//!     ..Default::default()
//! };
//! let mut w = ListWriter::open("records.lst", opts).unwrap();
//! ```

use listfile::compress::{register, Codec, Method};
use listfile::{ListFileError, Result};

/// Registers the zlib, snappy, and lz4 codecs. Idempotent; call before
/// constructing any writer or reader that needs compression.
pub fn register_builtin() {
    register(
        Method::Zlib,
        Codec {
            bound: zlib_bound,
            compress: zlib_compress,
            uncompress: zlib_uncompress,
        },
    );
    register(
        Method::Snappy,
        Codec {
            bound: snappy_bound,
            compress: snappy_compress,
            uncompress: snappy_uncompress,
        },
    );
    register(
        Method::Lz4,
        Codec {
            bound: lz4_bound,
            compress: lz4_compress,
            uncompress: lz4_uncompress,
        },
    );
}

fn codec_err(e: impl std::fmt::Display) -> ListFileError {
    ListFileError::Codec(e.to_string())
}

// ---------------------------------------------------------------
// zlib (raw deflate -- no zlib wrapper, matching the on-disk format)
// ---------------------------------------------------------------

/// zlib's `compressBound` formula; generous enough for raw deflate too.
fn zlib_bound(src_len: usize) -> usize {
    src_len + (src_len >> 12) + (src_len >> 14) + (src_len >> 25) + 13
}

fn zlib_compress(level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    use flate2::{Compress, Compression, FlushCompress, Status};

    let mut c = Compress::new(Compression::new(u32::from(level.clamp(1, 9))), false);
    match c.compress(src, dst, FlushCompress::Finish).map_err(codec_err)? {
        Status::StreamEnd => Ok(c.total_out() as usize),
        _ => Err(ListFileError::Codec(
            "deflate did not finish: output buffer too small".into(),
        )),
    }
}

fn zlib_uncompress(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    use flate2::{Decompress, FlushDecompress, Status};

    let mut d = Decompress::new(false);
    match d
        .decompress(src, dst, FlushDecompress::Finish)
        .map_err(codec_err)?
    {
        Status::StreamEnd => Ok(d.total_out() as usize),
        _ => Err(ListFileError::Codec(
            "inflate did not finish: output exceeds buffer".into(),
        )),
    }
}

// ---------------------------------------------------------------
// snappy
// ---------------------------------------------------------------

fn snappy_bound(src_len: usize) -> usize {
    snap::raw::max_compress_len(src_len)
}

fn snappy_compress(_level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    snap::raw::Encoder::new().compress(src, dst).map_err(codec_err)
}

fn snappy_uncompress(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    snap::raw::Decoder::new().decompress(src, dst).map_err(codec_err)
}

// ---------------------------------------------------------------
// lz4 (block format, no size prefix)
// ---------------------------------------------------------------

fn lz4_bound(src_len: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(src_len)
}

fn lz4_compress(_level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    lz4_flex::block::compress_into(src, dst).map_err(codec_err)
}

fn lz4_uncompress(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    lz4_flex::block::decompress_into(src, dst).map_err(codec_err)
}
