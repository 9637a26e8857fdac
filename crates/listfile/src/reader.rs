//! List file reader: block loading, frame decoding, defragmentation, array
//! unpacking, and corruption reporting.

use std::path::Path;

use tracing::{debug, warn};

use crate::compress::{self, Method};
use crate::format::{
    decode_frame_header, decode_varint32, frame_crc, parse_file_header, unmask_crc, FrameType,
    MetaMap, COMPRESSED_BIT, FRAME_HEADER_SIZE,
};
use crate::io::{FileSource, ReadonlyFile};
use crate::{ListFileError, Result};

/// Callback invoked with `(bytes_lost, reason)` for every recoverable
/// corruption event. Purely observational; the reader continues either way.
pub type CorruptionReporter = Box<dyn FnMut(usize, &str)>;

/// Where a decoded payload lives: the block buffer or the decompression
/// scratch buffer.
#[derive(Debug, Clone, Copy)]
enum PayloadSrc {
    Block,
    Scratch,
}

/// Progress through an ARRAY frame's packed items.
#[derive(Debug, Clone, Copy)]
struct ArrayCursor {
    remaining: u32,
    src: PayloadSrc,
    pos: usize,
    end: usize,
}

enum Physical {
    Frame {
        kind: u8,
        src: PayloadSrc,
        pos: usize,
        len: usize,
    },
    Bad,
    Eof,
}

/// Streams records back out of a list file.
///
/// Corruption is recoverable: a bad frame drops the remainder of its block,
/// notifies the [`CorruptionReporter`], and reading resumes at the next block
/// boundary. Only an unusable header or an I/O failure ends the stream early.
pub struct ListReader<F: ReadonlyFile> {
    file: F,
    checksum: bool,
    reporter: Option<CorruptionReporter>,
    header_done: bool,
    block_size: usize,
    /// Offset of the next block to load.
    file_offset: u64,
    eof: bool,
    /// Backing storage for the current block; valid bytes are
    /// `backing[buf_pos..buf_end]`.
    backing: Vec<u8>,
    buf_pos: usize,
    buf_end: usize,
    uncompress_buf: Vec<u8>,
    meta: MetaMap,
    array: Option<ArrayCursor>,
    read_header_bytes: u64,
    read_data_bytes: u64,
}

impl ListReader<FileSource> {
    /// Opens the list file at `path`.
    ///
    /// `checksum` enables per-frame CRC verification (the header CRC is
    /// always verified). `reporter` receives recoverable corruption events;
    /// without one they are only logged.
    pub fn open<P: AsRef<Path>>(
        path: P,
        checksum: bool,
        reporter: Option<CorruptionReporter>,
    ) -> Result<Self> {
        Ok(Self::new(FileSource::open(path)?, checksum, reporter))
    }
}

impl<F: ReadonlyFile> ListReader<F> {
    /// Creates a reader over any [`ReadonlyFile`]. Pass the file by value to
    /// transfer ownership, or `&mut file` to borrow it.
    pub fn new(file: F, checksum: bool, reporter: Option<CorruptionReporter>) -> Self {
        Self {
            file,
            checksum,
            reporter,
            header_done: false,
            block_size: 0,
            file_offset: 0,
            eof: false,
            backing: Vec::new(),
            buf_pos: 0,
            buf_end: 0,
            uncompress_buf: Vec::new(),
            meta: MetaMap::new(),
            array: None,
            read_header_bytes: 0,
            read_data_bytes: 0,
        }
    }

    /// Returns the header metadata map, parsing the header on first use.
    pub fn get_metadata(&mut self) -> Result<&MetaMap> {
        self.ensure_header()?;
        Ok(&self.meta)
    }

    /// Yields the next record, or `None` at end of file.
    ///
    /// `scratch` is backing storage for records that must be assembled from
    /// fragments; the returned slice may borrow from it or from the reader's
    /// internal buffers and is valid until the next call.
    pub fn read_record<'a>(&'a mut self, scratch: &'a mut Vec<u8>) -> Option<&'a [u8]> {
        if self.ensure_header().is_err() {
            return None;
        }
        scratch.clear();
        let mut in_fragmented = false;

        enum Out {
            Block(usize, usize),
            Scratch(usize, usize),
            Assembled,
        }

        let out = loop {
            // Drain a pending array item before decoding any new frame.
            if let Some(cursor) = self.array {
                let buf = match cursor.src {
                    PayloadSrc::Block => &self.backing[cursor.pos..cursor.end],
                    PayloadSrc::Scratch => &self.uncompress_buf[cursor.pos..cursor.end],
                };
                let item = decode_varint32(buf).and_then(|(len, consumed)| {
                    let start = cursor.pos + consumed;
                    let item_end = start.checked_add(len as usize)?;
                    (item_end <= cursor.end).then_some((start, len as usize, consumed))
                });
                match item {
                    None => {
                        self.array = None;
                        self.report(cursor.end - cursor.pos, "invalid array record");
                        continue;
                    }
                    Some((start, len, consumed)) => {
                        self.read_header_bytes += consumed as u64;
                        self.read_data_bytes += len as u64;
                        let next = ArrayCursor {
                            remaining: cursor.remaining - 1,
                            pos: start + len,
                            ..cursor
                        };
                        self.array = (next.remaining > 0).then_some(next);
                        break match cursor.src {
                            PayloadSrc::Block => Out::Block(start, len),
                            PayloadSrc::Scratch => Out::Scratch(start, len),
                        };
                    }
                }
            }

            match self.read_physical_record() {
                Physical::Eof => {
                    if in_fragmented {
                        self.report(scratch.len(), "partial record without end(3)");
                        scratch.clear();
                    }
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented = false;
                        scratch.clear();
                    }
                }
                Physical::Frame {
                    kind,
                    src,
                    pos,
                    len,
                } => match FrameType::from_nibble(kind) {
                    Some(FrameType::Full) => {
                        if in_fragmented {
                            self.report(scratch.len(), "partial record without end(1)");
                            scratch.clear();
                        }
                        self.read_data_bytes += len as u64;
                        break match src {
                            PayloadSrc::Block => Out::Block(pos, len),
                            PayloadSrc::Scratch => Out::Scratch(pos, len),
                        };
                    }
                    Some(FrameType::First) => {
                        if in_fragmented {
                            self.report(scratch.len(), "partial record without end(2)");
                        }
                        scratch.clear();
                        scratch.extend_from_slice(self.payload(src, pos, len));
                        in_fragmented = true;
                    }
                    Some(FrameType::Middle) => {
                        if !in_fragmented {
                            self.report(len, "missing start of fragmented record(1)");
                        } else {
                            scratch.extend_from_slice(self.payload(src, pos, len));
                        }
                    }
                    Some(FrameType::Last) => {
                        if !in_fragmented {
                            self.report(len, "missing start of fragmented record(2)");
                        } else {
                            scratch.extend_from_slice(self.payload(src, pos, len));
                            self.read_data_bytes += scratch.len() as u64;
                            break Out::Assembled;
                        }
                    }
                    Some(FrameType::Array) => {
                        if in_fragmented {
                            self.report(scratch.len(), "partial record without end(4)");
                            in_fragmented = false;
                            scratch.clear();
                        }
                        match decode_varint32(self.payload(src, pos, len)) {
                            Some((count, consumed)) if count > 0 => {
                                debug!("array frame with {} items", count);
                                self.read_header_bytes += consumed as u64;
                                self.array = Some(ArrayCursor {
                                    remaining: count,
                                    src,
                                    pos: pos + consumed,
                                    end: pos + len,
                                });
                            }
                            _ => self.report(len, "invalid array record"),
                        }
                    }
                    Some(FrameType::Zero) => {} // skippable filler
                    None => {
                        let lost = len + if in_fragmented { scratch.len() } else { 0 };
                        self.report(lost, &format!("unknown record type {}", kind));
                        in_fragmented = false;
                        scratch.clear();
                    }
                },
            }
        };

        Some(match out {
            Out::Block(pos, len) => &self.backing[pos..pos + len],
            Out::Scratch(pos, len) => &self.uncompress_buf[pos..pos + len],
            Out::Assembled => &scratch[..],
        })
    }

    /// Frame header + varint overhead consumed so far, in bytes.
    #[must_use]
    pub fn header_bytes(&self) -> u64 {
        self.read_header_bytes
    }

    /// Record payload bytes yielded so far.
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.read_data_bytes
    }

    // ---- Internal helpers ----

    fn ensure_header(&mut self) -> Result<()> {
        if self.header_done {
            return Ok(());
        }
        if self.eof {
            return Err(ListFileError::BadHeader("file is unreadable".into()));
        }
        match parse_file_header(&mut self.file) {
            Ok(header) => {
                self.block_size = header.block_size();
                self.file_offset = header.data_offset;
                self.read_header_bytes = header.data_offset;
                self.meta = header.meta;
                self.backing = vec![0u8; self.block_size];
                self.uncompress_buf = vec![0u8; self.block_size];
                self.header_done = true;
                Ok(())
            }
            Err(e) => {
                let size = self.file.size() as usize;
                self.report(size, &e.to_string());
                self.eof = true;
                Err(e)
            }
        }
    }

    fn payload(&self, src: PayloadSrc, pos: usize, len: usize) -> &[u8] {
        match src {
            PayloadSrc::Block => &self.backing[pos..pos + len],
            PayloadSrc::Scratch => &self.uncompress_buf[pos..pos + len],
        }
    }

    /// Decodes the next frame, loading blocks as needed. Returns the frame's
    /// kind nibble and the location of its (decompressed) payload.
    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buf_end - self.buf_pos < FRAME_HEADER_SIZE {
                if !self.eof {
                    let fsize = self.file.size();
                    let want = if fsize > self.file_offset {
                        (self.block_size as u64).min(fsize - self.file_offset) as usize
                    } else {
                        0
                    };
                    if want == 0 {
                        self.eof = true;
                        continue;
                    }
                    // Anything shorter than a frame header left over from the
                    // previous block is tail padding; the fresh read replaces it.
                    match self.file.read(self.file_offset, &mut self.backing[..want]) {
                        Ok(n) => {
                            self.buf_pos = 0;
                            self.buf_end = n;
                            self.file_offset += n as u64;
                            if n == 0 || self.file_offset >= fsize {
                                self.eof = true;
                            }
                            continue;
                        }
                        Err(e) => {
                            self.report(want, &format!("read error: {}", e));
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                } else if self.buf_pos == self.buf_end {
                    return Physical::Eof;
                } else {
                    let drop_size = self.buf_end - self.buf_pos;
                    self.buf_pos = self.buf_end;
                    self.report(drop_size, "truncated record at end of file");
                    return Physical::Eof;
                }
            }

            let remaining = self.buf_end - self.buf_pos;
            let (stored_crc, length, type_byte) =
                decode_frame_header(&self.backing[self.buf_pos..]);
            let length = length as usize;
            self.read_header_bytes += FRAME_HEADER_SIZE as u64;

            if length == 0 {
                if type_byte == FrameType::Zero as u8 {
                    // Intentional tail padding; the rest of the block is zeros.
                    self.buf_pos = self.buf_end;
                    continue;
                }
                self.buf_pos = self.buf_end;
                self.report(remaining, "bad record");
                return Physical::Bad;
            }

            if length + FRAME_HEADER_SIZE > remaining {
                // "length" itself may be corrupt; trusting it could resync on
                // bytes that merely look like a frame. Drop the whole block.
                self.buf_pos = self.buf_end;
                self.report(remaining, "bad record length or truncated record at eof");
                return Physical::Bad;
            }

            let payload_pos = self.buf_pos + FRAME_HEADER_SIZE;
            if self.checksum {
                let actual = frame_crc(
                    type_byte,
                    &self.backing[payload_pos..payload_pos + length],
                );
                if actual != unmask_crc(stored_crc) {
                    self.buf_pos = self.buf_end;
                    self.report(remaining, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            self.buf_pos += FRAME_HEADER_SIZE + length;

            if type_byte & COMPRESSED_BIT != 0 {
                match self.uncompress(payload_pos, length) {
                    Ok(out_len) => {
                        return Physical::Frame {
                            kind: type_byte & 0x0F,
                            src: PayloadSrc::Scratch,
                            pos: 0,
                            len: out_len,
                        }
                    }
                    Err(e) => {
                        debug!("uncompress error: {}", e);
                        self.buf_pos = self.buf_end;
                        self.report(remaining, "Uncompress failed");
                        return Physical::Bad;
                    }
                }
            }

            return Physical::Frame {
                kind: type_byte & 0x0F,
                src: PayloadSrc::Block,
                pos: payload_pos,
                len: length,
            };
        }
    }

    /// Decompresses `backing[payload_pos..][..length]` (method byte plus
    /// codec output) into the scratch buffer.
    fn uncompress(&mut self, payload_pos: usize, length: usize) -> Result<usize> {
        let payload = &self.backing[payload_pos..payload_pos + length];
        let method = Method::from_u8(payload[0]).ok_or_else(|| {
            ListFileError::Codec(format!("unknown compression method {}", payload[0]))
        })?;
        let codec = compress::find(method).ok_or(ListFileError::MissingCodec(method))?;
        (codec.uncompress)(&payload[1..], &mut self.uncompress_buf)
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        debug!("dropping {} bytes: {}", bytes, reason);
        if let Some(reporter) = self.reporter.as_mut() {
            reporter(bytes, reason);
        } else {
            warn!("list file corruption: {} ({} bytes dropped)", reason, bytes);
        }
    }
}
