//! List file writer: buffering, framing, fragmentation, array packing.

use std::mem;
use std::path::Path;

use tracing::{debug, error, warn};

use crate::compress::{self, Codec, Method};
use crate::format::{
    encode_file_header, encode_frame_header, encode_varint32, parse_file_header, put_varint32,
    varint32_len, FrameType, MetaMap, BLOCK_FACTOR, COMPRESSED_BIT, FRAME_HEADER_SIZE,
    MAX_BLOCK_MULTIPLIER, MAX_VARINT32_LEN,
};
use crate::io::{FileSink, FileSource, ReadonlyFile, Sink};
use crate::{ListFileError, Result};

/// Records at or below this size are packed into array frames instead of
/// being framed individually; one CRC then covers the whole batch.
const ARRAY_RECORD_MAX: usize = 4096;

/// Array accumulator is flushed before its serialized payload would exceed
/// `block_size / 2`.
const ARRAY_LIMIT_DIVISOR: usize = 2;

/// Payloads shorter than this are never worth compressing.
const COMPRESS_THRESHOLD: usize = 128;

/// Construction options for a [`ListWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Block size in units of 64 KiB. Must be in `1..=100`.
    pub block_size_multiplier: u8,
    /// Per-frame compression codec, or `None` to write uncompressed.
    pub compress_method: Option<Method>,
    /// Codec-specific level (zlib 1..=9; ignored by snappy and lz4).
    pub compress_level: u8,
    /// Append to an existing list file instead of starting a new one.
    /// Only honored by [`ListWriter::open`]; with a raw sink the caller is
    /// responsible for positioning.
    pub append: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size_multiplier: 1,
            compress_method: None,
            compress_level: 1,
            append: false,
        }
    }
}

/// Appends records to a list file through a [`Sink`].
///
/// Call sequence: optional [`add_meta`](Self::add_meta) calls, then
/// [`init`](Self::init) exactly once, then any number of
/// [`add_record`](Self::add_record) calls, then [`flush`](Self::flush) (also
/// run best-effort on drop). Records are buffered into an in-memory block of
/// exactly `block_size` bytes; a block reaches the sink only when it is
/// complete, so output length is always a whole number of blocks after the
/// header.
pub struct ListWriter<S: Sink> {
    sink: S,
    options: WriterOptions,
    block_size: usize,
    /// Bytes of the current block not yet handed to the sink.
    block_buf: Vec<u8>,
    /// Logical write position inside the current block. Exceeds
    /// `block_buf.len()` only when appending to a file whose tail block is
    /// partially on disk.
    block_pos: usize,
    blocks_emitted: u64,
    init_called: bool,
    meta: MetaMap,
    /// Pending small records: `MAX_VARINT32_LEN` reserved bytes (the item
    /// count is encoded there when the array is flushed) followed by
    /// `varint(len) || bytes` per item.
    array_store: Vec<u8>,
    array_records: u32,
    array_limit: usize,
    codec: Option<(Method, &'static Codec)>,
    compress_buf: Vec<u8>,
    records_added: u64,
    bytes_added: u64,
    compression_savings: u64,
}

impl ListWriter<FileSink> {
    /// Opens a list file at `path` for writing.
    ///
    /// With `options.append` set and a parseable header already on disk, the
    /// existing block size is inherited, the header is not rewritten, and
    /// writing resumes at the file's current position. If the file is absent
    /// or its header is unusable, the writer falls back to fresh-file mode
    /// and truncates.
    pub fn open<P: AsRef<Path>>(path: P, mut options: WriterOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut resume = None;
        if options.append {
            if let Ok(mut src) = FileSource::open(path) {
                match parse_file_header(&mut src) {
                    Ok(header) => {
                        options.block_size_multiplier = header.multiplier;
                        resume = Some((header.data_offset, src.size()));
                    }
                    Err(e) => debug!("append requested but header unusable, rewriting: {}", e),
                }
            }
        }
        options.append = resume.is_some();

        let sink = if options.append {
            FileSink::append_to(path)?
        } else {
            FileSink::create(path)?
        };
        let mut writer = Self::new(sink, options)?;
        if let Some((data_offset, file_size)) = resume {
            writer.block_pos = ((file_size - data_offset) % writer.block_size as u64) as usize;
        }
        Ok(writer)
    }
}

impl<S: Sink> ListWriter<S> {
    /// Creates a writer over an arbitrary sink.
    ///
    /// # Errors
    ///
    /// Returns [`ListFileError::Misuse`] for an out-of-range block size
    /// multiplier and [`ListFileError::MissingCodec`] when compression is
    /// requested but no codec is registered for the method.
    pub fn new(sink: S, options: WriterOptions) -> Result<Self> {
        if options.block_size_multiplier == 0
            || options.block_size_multiplier > MAX_BLOCK_MULTIPLIER
        {
            return Err(ListFileError::Misuse(format!(
                "block size multiplier {} out of range",
                options.block_size_multiplier
            )));
        }
        let codec = match options.compress_method {
            Some(method) => {
                let codec = compress::find(method).ok_or(ListFileError::MissingCodec(method))?;
                Some((method, codec))
            }
            None => None,
        };

        let block_size = options.block_size_multiplier as usize * BLOCK_FACTOR;
        Ok(Self {
            sink,
            blocks_emitted: u64::from(options.append),
            options,
            block_size,
            block_buf: Vec::with_capacity(block_size),
            block_pos: 0,
            init_called: false,
            meta: MetaMap::new(),
            array_store: vec![0u8; MAX_VARINT32_LEN],
            array_records: 0,
            array_limit: block_size / ARRAY_LIMIT_DIVISOR,
            codec,
            compress_buf: Vec::new(),
            records_added: 0,
            bytes_added: 0,
            compression_savings: 0,
        })
    }

    /// Adds a key/value pair to the header metadata. Only allowed before
    /// [`init`](Self::init).
    pub fn add_meta(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        if self.init_called {
            return Err(ListFileError::Misuse(
                "add_meta() is not allowed after init()".into(),
            ));
        }
        self.meta.insert(key.into(), value.into());
        Ok(())
    }

    /// Writes the file header. Must be called exactly once, before the first
    /// record; a second call fails.
    pub fn init(&mut self) -> Result<()> {
        if self.init_called {
            return Err(ListFileError::Misuse("init() already called".into()));
        }
        if !self.options.append {
            let header = encode_file_header(self.options.block_size_multiplier, &self.meta);
            self.sink.append(&header)?;
        }
        self.init_called = true;
        Ok(())
    }

    /// Appends one record.
    ///
    /// Small records accumulate into an array frame; a record that does not
    /// fit the current block is split into FIRST/MIDDLE*/LAST fragments, each
    /// filling its block to the boundary.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        if !self.init_called {
            return Err(ListFileError::Misuse("init() was not called".into()));
        }
        self.records_added += 1;

        if record.len() <= ARRAY_RECORD_MAX {
            let item_size = varint32_len(record.len() as u32) + record.len();
            let pending = self.array_store.len() - MAX_VARINT32_LEN;
            if pending + item_size + MAX_VARINT32_LEN > self.array_limit {
                self.flush_array()?;
            }
            put_varint32(&mut self.array_store, record.len() as u32);
            self.array_store.extend_from_slice(record);
            self.array_records += 1;
            return Ok(());
        }

        self.flush_array()?;
        self.emit_record(record)
    }

    /// Flushes the pending array and pads the current block out to the block
    /// boundary. Idempotent; also run on drop.
    pub fn flush(&mut self) -> Result<()> {
        if !self.init_called {
            return Ok(());
        }
        self.flush_array()?;
        // An empty file still gets one (all-padding) block so that readers
        // and appenders always find block-aligned data after the header.
        if self.block_pos > 0 || self.blocks_emitted == 0 {
            self.finish_block()?;
        }
        self.sink.flush()?;
        Ok(())
    }

    /// Flushes and consumes the writer, surfacing any final error that a
    /// plain drop would only log.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Records passed to [`add_record`](Self::add_record) so far.
    #[must_use]
    pub fn records_added(&self) -> u64 {
        self.records_added
    }

    /// Frame bytes (headers + payloads) emitted so far, excluding padding.
    #[must_use]
    pub fn bytes_added(&self) -> u64 {
        self.bytes_added
    }

    /// Payload bytes saved by compression so far.
    #[must_use]
    pub fn compression_savings(&self) -> u64 {
        self.compression_savings
    }

    /// Block size this writer was configured with.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    // ---- Internal helpers ----

    fn leftover(&self) -> usize {
        self.block_size - self.block_pos
    }

    /// Emits a non-array record as one FULL frame or a fragment chain.
    fn emit_record(&mut self, record: &[u8]) -> Result<()> {
        let mut rest = record;
        let mut fragmenting = false;
        loop {
            // Too little room even for a header plus one payload byte: the
            // tail is zero padding and the record starts in the next block.
            if self.leftover() <= FRAME_HEADER_SIZE {
                self.finish_block()?;
            }
            let avail = self.leftover() - FRAME_HEADER_SIZE;

            if !fragmenting {
                if rest.len() <= avail {
                    return self.emit_frame(FrameType::Full, rest);
                }
                fragmenting = true;
                self.emit_frame(FrameType::First, &rest[..avail])?;
                rest = &rest[avail..];
            } else if rest.len() > avail {
                self.emit_frame(FrameType::Middle, &rest[..avail])?;
                rest = &rest[avail..];
            } else {
                return self.emit_frame(FrameType::Last, rest);
            }
        }
    }

    /// Flushes the pending array accumulator as a single ARRAY frame.
    fn flush_array(&mut self) -> Result<()> {
        if self.array_records == 0 {
            return Ok(());
        }
        let mut store = mem::take(&mut self.array_store);
        let count = self.array_records;
        self.array_records = 0;

        // The item count is prepended into the reserved slot right before
        // the first item.
        let start = MAX_VARINT32_LEN - varint32_len(count);
        encode_varint32(&mut store[start..], count);

        // Array frames are never fragmented.
        if store.len() - start + FRAME_HEADER_SIZE > self.leftover() {
            self.finish_block()?;
        }
        let result = self.emit_frame(FrameType::Array, &store[start..]);

        store.truncate(MAX_VARINT32_LEN);
        self.array_store = store;
        result
    }

    /// Encodes one frame into the block buffer, compressing the payload when
    /// configured and profitable. The frame must fit the current block.
    fn emit_frame(&mut self, ty: FrameType, payload: &[u8]) -> Result<()> {
        debug_assert!(FRAME_HEADER_SIZE + payload.len() <= self.leftover());

        let mut type_byte = ty as u8;
        let mut out: &[u8] = payload;

        // Fragments are never compressed individually; a fragmented record
        // would otherwise tie its block layout to the codec's ratio.
        let compressible = matches!(ty, FrameType::Full | FrameType::Array);
        if compressible && payload.len() >= COMPRESS_THRESHOLD {
            if let Some((method, codec)) = self.codec {
                let bound = (codec.bound)(payload.len());
                if self.compress_buf.len() < bound + 1 {
                    self.compress_buf.resize(bound + 1, 0);
                }
                match (codec.compress)(
                    self.options.compress_level,
                    payload,
                    &mut self.compress_buf[1..bound + 1],
                ) {
                    Ok(compressed_len) if compressed_len + 1 < payload.len() => {
                        debug!(
                            "compressed {} byte payload to {:.3} of original",
                            payload.len(),
                            (compressed_len + 1) as f64 / payload.len() as f64
                        );
                        self.compress_buf[0] = method as u8;
                        type_byte |= COMPRESSED_BIT;
                        self.compression_savings += (payload.len() - (compressed_len + 1)) as u64;
                        out = &self.compress_buf[..compressed_len + 1];
                    }
                    Ok(_) => {} // not worth it, write uncompressed
                    Err(e) => warn!("{} compression failed, writing raw: {}", method.name(), e),
                }
            }
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        encode_frame_header(&mut header, type_byte, out);
        self.block_buf.extend_from_slice(&header);
        self.block_buf.extend_from_slice(out);
        let total = FRAME_HEADER_SIZE + out.len();
        self.block_pos += total;
        self.bytes_added += total as u64;

        if self.leftover() == 0 {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Zero-pads the current block to `block_size` and hands its buffered
    /// bytes to the sink.
    fn finish_block(&mut self) -> Result<()> {
        let padding = self.block_size - self.block_pos;
        self.block_buf.resize(self.block_buf.len() + padding, 0);
        self.sink.append(&self.block_buf)?;
        self.block_buf.clear();
        self.block_pos = 0;
        self.blocks_emitted += 1;
        Ok(())
    }
}

impl<S: Sink> Drop for ListWriter<S> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("list file flush on drop failed: {}", e);
        }
    }
}
