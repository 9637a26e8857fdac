use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use crate::format::{
    decode_frame_header, encode_frame_header, parse_file_header, BLOCK_FACTOR, FRAME_HEADER_SIZE,
};
use crate::{CorruptionReporter, ListReader, ListWriter, WriterOptions};

mod reader_tests;

// -------------------- Shared helpers --------------------

/// Writes `records` into an in-memory list file with the given options.
pub fn write_records(records: &[Vec<u8>], options: WriterOptions) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut w = ListWriter::new(&mut out, options).unwrap();
        w.init().unwrap();
        for r in records {
            w.add_record(r).unwrap();
        }
        w.flush().unwrap();
    }
    out
}

/// Reads every record out of an in-memory list file.
pub fn read_records(
    bytes: &[u8],
    checksum: bool,
    reporter: Option<CorruptionReporter>,
) -> Vec<Vec<u8>> {
    let mut reader = ListReader::new(Cursor::new(bytes.to_vec()), checksum, reporter);
    let mut scratch = Vec::new();
    let mut records = Vec::new();
    while let Some(r) = reader.read_record(&mut scratch) {
        records.push(r.to_vec());
    }
    records
}

/// A reporter that accumulates `(bytes_lost, reason)` events.
pub fn collecting_reporter() -> (Rc<RefCell<Vec<(usize, String)>>>, CorruptionReporter) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let reporter: CorruptionReporter =
        Box::new(move |bytes, reason| sink.borrow_mut().push((bytes, reason.to_string())));
    (events, reporter)
}

/// Walks every frame in a serialized list file, returning
/// `(type_byte, payload_len)` pairs in file order.
pub fn scan_frames(bytes: &[u8]) -> Vec<(u8, usize)> {
    let mut cursor = Cursor::new(bytes.to_vec());
    let header = parse_file_header(&mut cursor).unwrap();
    let block_size = header.block_size();

    let mut frames = Vec::new();
    let mut block_start = header.data_offset as usize;
    while block_start < bytes.len() {
        let block_end = (block_start + block_size).min(bytes.len());
        let mut pos = block_start;
        while block_end - pos >= FRAME_HEADER_SIZE {
            let (_, len, ty) = decode_frame_header(&bytes[pos..]);
            if len == 0 && ty == 0 {
                break; // tail padding
            }
            frames.push((ty, len as usize));
            pos += FRAME_HEADER_SIZE + len as usize;
        }
        block_start += block_size;
    }
    frames
}

/// Encodes a single frame (header + payload) with a valid CRC.
pub fn build_frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; FRAME_HEADER_SIZE];
    encode_frame_header(&mut out, type_byte, payload);
    out.extend_from_slice(payload);
    out
}

/// Assembles a handcrafted list file: a meta-less header followed by the
/// given frame sequences, each zero-padded out to one 64 KiB block.
pub fn build_file(blocks: &[Vec<u8>]) -> Vec<u8> {
    let mut out = crate::format::encode_file_header(1, &crate::MetaMap::new());
    for block in blocks {
        assert!(block.len() <= BLOCK_FACTOR);
        out.extend_from_slice(block);
        out.resize(out.len() + (BLOCK_FACTOR - block.len()), 0);
    }
    out
}
