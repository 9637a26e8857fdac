//! On-disk format shared by the writer and the reader.
//!
//! ## File layout
//!
//! ```text
//! [MAGIC: 5 bytes]["multiplier": u8]["ext": u8]
//! if ext == META_EXTENSION:
//!     [masked_crc32: u32 LE][meta_len: u32 LE][meta bytes...]
//! [block 0][block 1]...
//! ```
//!
//! Each block is exactly `multiplier * BLOCK_FACTOR` bytes and holds a
//! sequence of frames. A frame never straddles a block boundary; the tail of
//! a block that cannot hold another frame header is zero-filled.
//!
//! ## Frame layout
//!
//! ```text
//! [masked_crc32: u32 LE][payload_len: u32 LE][type: u8][payload bytes...]
//! ```
//!
//! The CRC covers `type || payload` and is stored masked (see [`mask_crc`])
//! so an all-zero region can never impersonate a valid frame. The low nibble
//! of the type byte is the [`FrameType`]; bit 7 ([`COMPRESSED_BIT`]) marks a
//! compressed payload whose first byte is the compression method id.
//!
//! ## Metadata layout
//!
//! ```text
//! varint(n_entries) then n_entries times:
//!     varint(key_len) key varint(val_len) val
//! ```

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::io::ReadonlyFile;
use crate::{ListFileError, Result};

/// Magic bytes at offset 0 of every list file.
pub const MAGIC: [u8; 5] = *b"LST1\0";

/// Size of the fixed header prefix: magic + multiplier byte + extension byte.
pub const FILE_HEADER_SIZE: usize = MAGIC.len() + 2;

/// Unit of the block size. Actual block size is `multiplier * BLOCK_FACTOR`.
pub const BLOCK_FACTOR: usize = 64 * 1024;

/// Largest accepted block size multiplier.
pub const MAX_BLOCK_MULTIPLIER: u8 = 100;

/// Bytes of CRC + payload length + type preceding every frame payload.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Extension byte value meaning "no metadata section".
pub const NO_EXTENSION: u8 = 0;
/// Extension byte value meaning "a CRC-framed metadata section follows".
pub const META_EXTENSION: u8 = 1;

/// High bit of the type byte: payload is `[method: u8][codec output...]`.
pub const COMPRESSED_BIT: u8 = 0x80;

/// Reserved metadata key holding a fully-qualified protobuf message name.
pub const PROTO_TYPE_KEY: &str = "proto_type";
/// Reserved metadata key holding a serialized `FileDescriptorSet`.
pub const PROTO_SET_KEY: &str = "proto_set";

/// Metadata map stored in the file header. Keys and values are raw bytes.
pub type MetaMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Frame type stored in the low nibble of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Tail padding (with length 0) or a skippable filler frame.
    Zero = 0,
    /// A whole record in one frame.
    Full = 1,
    /// First fragment of a record spanning blocks.
    First = 2,
    /// Interior fragment.
    Middle = 3,
    /// Final fragment.
    Last = 4,
    /// Packed sequence of small records.
    Array = 5,
}

impl FrameType {
    /// Decodes the low nibble of a type byte. Returns `None` for the unused
    /// nibble values 6..=15.
    pub fn from_nibble(v: u8) -> Option<Self> {
        match v & 0x0F {
            0 => Some(Self::Zero),
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            5 => Some(Self::Array),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------
// CRC masking
// ---------------------------------------------------------------

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a CRC before storage: rotate right by 15 bits, add a constant.
///
/// Stored CRCs are masked so that a region of zero bytes (block padding, a
/// hole from a crashed write) cannot read back as a frame with a valid
/// checksum. `unmask_crc(mask_crc(c)) == c` for all `c`.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// CRC over `type_byte || payload`, unmasked.
pub fn frame_crc(type_byte: u8, payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&[type_byte]);
    hasher.update(payload);
    hasher.finalize()
}

// ---------------------------------------------------------------
// Varint32 coding
// ---------------------------------------------------------------

/// Maximum encoded size of a u32 varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Number of bytes `encode_varint32` will produce for `value`.
pub fn varint32_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Appends the LEB128 encoding of `value` to `dst`.
pub fn put_varint32(dst: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Encodes `value` into the front of `dst`, returning the bytes written.
/// `dst` must be at least `varint32_len(value)` long.
pub fn encode_varint32(dst: &mut [u8], mut value: u32) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        dst[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    dst[i] = value as u8;
    i + 1
}

/// Decodes a u32 varint from the front of `src`.
///
/// Returns `(value, bytes_consumed)`, or `None` if `src` is truncated or the
/// encoding runs past 5 bytes / overflows 32 bits.
pub fn decode_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().enumerate().take(MAX_VARINT32_LEN) {
        let bits = (byte & 0x7f) as u32;
        value |= bits.checked_shl(7 * i as u32)?;
        if i == MAX_VARINT32_LEN - 1 && byte > 0x0f {
            return None; // bits beyond 32
        }
        if byte < 0x80 {
            return Some((value, i + 1));
        }
    }
    None
}

// ---------------------------------------------------------------
// Frame coder
// ---------------------------------------------------------------

/// Encodes a frame header for `type_byte` over `payload` into `dst`.
/// `dst` must be exactly `FRAME_HEADER_SIZE` bytes.
pub fn encode_frame_header(dst: &mut [u8], type_byte: u8, payload: &[u8]) {
    debug_assert_eq!(dst.len(), FRAME_HEADER_SIZE);
    LittleEndian::write_u32(&mut dst[0..4], mask_crc(frame_crc(type_byte, payload)));
    LittleEndian::write_u32(&mut dst[4..8], payload.len() as u32);
    dst[8] = type_byte;
}

/// Fields of a decoded frame header. `src` must hold at least
/// `FRAME_HEADER_SIZE` bytes.
pub fn decode_frame_header(src: &[u8]) -> (u32, u32, u8) {
    let masked_crc = LittleEndian::read_u32(&src[0..4]);
    let length = LittleEndian::read_u32(&src[4..8]);
    (masked_crc, length, src[8])
}

// ---------------------------------------------------------------
// Header coder
// ---------------------------------------------------------------

/// Serializes the file header (magic, multiplier, optional metadata section).
pub fn encode_file_header(multiplier: u8, meta: &MetaMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(FILE_HEADER_SIZE);
    out.extend_from_slice(&MAGIC);
    out.push(multiplier);
    out.push(if meta.is_empty() {
        NO_EXTENSION
    } else {
        META_EXTENSION
    });

    if !meta.is_empty() {
        let mut body = Vec::new();
        put_varint32(&mut body, meta.len() as u32);
        for (k, v) in meta {
            put_varint32(&mut body, k.len() as u32);
            body.extend_from_slice(k);
            put_varint32(&mut body, v.len() as u32);
            body.extend_from_slice(v);
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = mask_crc(hasher.finalize());

        let mut meta_header = [0u8; 8];
        LittleEndian::write_u32(&mut meta_header[0..4], crc);
        LittleEndian::write_u32(&mut meta_header[4..8], body.len() as u32);
        out.extend_from_slice(&meta_header);
        out.extend_from_slice(&body);
    }
    out
}

/// Result of parsing a file header.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    /// Block size multiplier from the header (1..=100).
    pub multiplier: u8,
    /// File offset of the first data block.
    pub data_offset: u64,
    /// Decoded metadata map (empty when the file has no metadata section).
    pub meta: MetaMap,
}

impl ParsedHeader {
    /// Block size implied by the multiplier.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.multiplier as usize * BLOCK_FACTOR
    }
}

/// Largest accepted metadata section (16 MiB). Prevents OOM on corrupt files.
const MAX_META_BYTES: usize = 16 * 1024 * 1024;

/// Reads and validates the file header from `file`.
///
/// The metadata CRC is always verified, independently of the reader's
/// checksum setting.
pub fn parse_file_header<F: ReadonlyFile>(file: &mut F) -> Result<ParsedHeader> {
    let mut prefix = [0u8; FILE_HEADER_SIZE];
    let n = file.read(0, &mut prefix)?;
    if n != FILE_HEADER_SIZE || prefix[..MAGIC.len()] != MAGIC {
        return Err(ListFileError::BadHeader("bad magic".into()));
    }

    let multiplier = prefix[MAGIC.len()];
    if multiplier == 0 || multiplier > MAX_BLOCK_MULTIPLIER {
        return Err(ListFileError::BadHeader(format!(
            "block multiplier {} out of range",
            multiplier
        )));
    }

    let mut offset = FILE_HEADER_SIZE as u64;
    let mut meta = MetaMap::new();

    if prefix[MAGIC.len() + 1] == META_EXTENSION {
        let mut meta_header = [0u8; 8];
        if file.read(offset, &mut meta_header)? != meta_header.len() {
            return Err(ListFileError::BadHeader("truncated meta header".into()));
        }
        offset += meta_header.len() as u64;

        let expected_crc = unmask_crc(LittleEndian::read_u32(&meta_header[0..4]));
        let length = LittleEndian::read_u32(&meta_header[4..8]) as usize;
        if length > MAX_META_BYTES {
            return Err(ListFileError::BadHeader(format!(
                "meta section of {} bytes exceeds maximum",
                length
            )));
        }

        let mut body = vec![0u8; length];
        if file.read(offset, &mut body)? != length {
            return Err(ListFileError::BadHeader("truncated meta section".into()));
        }
        offset += length as u64;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != expected_crc {
            return Err(ListFileError::BadHeader("meta checksum mismatch".into()));
        }

        meta = decode_meta(&body)?;
    }

    Ok(ParsedHeader {
        multiplier,
        data_offset: offset,
        meta,
    })
}

fn decode_meta(body: &[u8]) -> Result<MetaMap> {
    let bad = || ListFileError::BadHeader("bad meta encoding".into());

    let (count, mut pos) = decode_varint32(body).ok_or_else(bad)?;
    let mut meta = MetaMap::new();
    for _ in 0..count {
        let key = decode_meta_string(body, &mut pos).ok_or_else(bad)?;
        let val = decode_meta_string(body, &mut pos).ok_or_else(bad)?;
        meta.insert(key, val);
    }
    Ok(meta)
}

fn decode_meta_string(body: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let (len, consumed) = decode_varint32(&body[*pos..])?;
    *pos += consumed;
    let end = pos.checked_add(len as usize)?;
    if end > body.len() {
        return None;
    }
    let s = body[*pos..end].to_vec();
    *pos = end;
    Some(s)
}
