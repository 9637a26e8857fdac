use std::io::Cursor;

use tempfile::tempdir;

use super::*;
use crate::format::{encode_file_header, FrameType, MetaMap};

fn default_opts() -> WriterOptions {
    WriterOptions::default()
}

// -------------------- Roundtrips --------------------

#[test]
fn single_small_record_roundtrip() {
    let bytes = write_records(&[b"hello".to_vec()], default_opts());
    let records = read_records(&bytes, true, None);
    assert_eq!(records, vec![b"hello".to_vec()]);
}

#[test]
fn mixed_sizes_roundtrip_in_order() {
    let mut originals = Vec::new();
    originals.push(Vec::new()); // empty record
    originals.push(vec![0x00, 0xFF, 0x80]); // binary
    for i in 0..300u32 {
        let len = (i as usize * 131) % 12_000; // small and large interleaved
        originals.push(vec![(i % 251) as u8; len]);
    }
    originals.push(vec![0x42; 200_000]); // spans multiple blocks

    let bytes = write_records(&originals, default_opts());
    let records = read_records(&bytes, true, None);
    assert_eq!(records.len(), originals.len());
    for (i, (got, want)) in records.iter().zip(&originals).enumerate() {
        assert_eq!(got, want, "record {}", i);
    }
}

#[test]
fn record_spanning_three_blocks_roundtrip() {
    let original = vec![0xAB; 150 * 1024];
    let bytes = write_records(&[original.clone()], default_opts());

    let (events, reporter) = collecting_reporter();
    let records = read_records(&bytes, true, Some(reporter));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], original);
    assert!(events.borrow().is_empty());
}

#[test]
fn thousand_tiny_records_use_few_frames() {
    let originals: Vec<Vec<u8>> = (0..1000u64).map(|i| i.to_le_bytes().to_vec()).collect();
    let bytes = write_records(&originals, default_opts());

    let records = read_records(&bytes, true, None);
    assert_eq!(records, originals);

    // The array form amortizes framing: far fewer frames than records.
    let frames = scan_frames(&bytes);
    assert!(
        frames.len() <= 1000 / 100,
        "{} frames for 1000 records",
        frames.len()
    );
    assert!(frames.iter().any(|&(ty, _)| ty == FrameType::Array as u8));
}

#[test]
fn array_and_full_forms_yield_identical_records() {
    let originals: Vec<Vec<u8>> = (0..20).map(|i| format!("item-{:02}", i).into_bytes()).collect();

    // Written normally, small records travel in an ARRAY frame.
    let packed = write_records(&originals, default_opts());

    // The same records as individual FULL frames, built by hand.
    let mut block = Vec::new();
    for r in &originals {
        block.extend_from_slice(&build_frame(FrameType::Full as u8, r));
    }
    let unpacked = build_file(&[block]);

    assert_eq!(
        read_records(&packed, true, None),
        read_records(&unpacked, true, None)
    );
}

#[test]
fn checksum_disabled_roundtrip() {
    let originals: Vec<Vec<u8>> = (0..50).map(|i| vec![i as u8; 100]).collect();
    let bytes = write_records(&originals, default_opts());
    assert_eq!(read_records(&bytes, false, None), originals);
}

#[test]
fn multiplier_two_roundtrip() {
    let opts = WriterOptions {
        block_size_multiplier: 2,
        ..default_opts()
    };
    let originals = vec![vec![0x11; 100_000], vec![0x22; 5], vec![0x33; 70_000]];
    let bytes = write_records(&originals, opts);

    assert_eq!(
        (bytes.len() - crate::format::FILE_HEADER_SIZE) % (2 * BLOCK_FACTOR),
        0
    );
    assert_eq!(read_records(&bytes, true, None), originals);
}

// -------------------- EOF behavior --------------------

#[test]
fn empty_written_file_has_no_records() {
    let bytes = write_records(&[], default_opts());
    let (events, reporter) = collecting_reporter();
    let records = read_records(&bytes, true, Some(reporter));
    assert!(records.is_empty());
    assert!(events.borrow().is_empty());
}

#[test]
fn header_only_file_has_no_records() {
    // A header with no data blocks at all is a valid, empty list file.
    let bytes = encode_file_header(1, &MetaMap::new());
    let (events, reporter) = collecting_reporter();
    let records = read_records(&bytes, true, Some(reporter));
    assert!(records.is_empty());
    assert!(events.borrow().is_empty());
}

#[test]
fn reader_keeps_returning_none_after_eof() {
    let bytes = write_records(&[b"only".to_vec()], default_opts());
    let mut reader = ListReader::new(Cursor::new(bytes), true, None);
    let mut scratch = Vec::new();
    assert!(reader.read_record(&mut scratch).is_some());
    assert!(reader.read_record(&mut scratch).is_none());
    assert!(reader.read_record(&mut scratch).is_none());
}

// -------------------- Metadata --------------------

#[test]
fn metadata_roundtrip() {
    let mut out = Vec::new();
    {
        let mut w = ListWriter::new(&mut out, default_opts()).unwrap();
        w.add_meta(crate::PROTO_TYPE_KEY, "x.Y").unwrap();
        w.add_meta(crate::PROTO_SET_KEY, vec![0x08, 0x96, 0x01]).unwrap();
        w.init().unwrap();
        w.add_record(b"payload").unwrap();
        w.flush().unwrap();
    }

    let mut reader = ListReader::new(Cursor::new(out), true, None);
    let meta = reader.get_metadata().unwrap();
    assert_eq!(
        meta.get(crate::PROTO_TYPE_KEY.as_bytes()),
        Some(&b"x.Y".to_vec())
    );
    assert_eq!(
        meta.get(crate::PROTO_SET_KEY.as_bytes()),
        Some(&vec![0x08, 0x96, 0x01])
    );

    let mut scratch = Vec::new();
    assert_eq!(reader.read_record(&mut scratch), Some(&b"payload"[..]));
}

#[test]
fn metadata_empty_when_absent() {
    let bytes = write_records(&[b"r".to_vec()], default_opts());
    let mut reader = ListReader::new(Cursor::new(bytes), true, None);
    assert!(reader.get_metadata().unwrap().is_empty());
}

// -------------------- Ownership --------------------

#[test]
fn reader_over_borrowed_file() {
    let bytes = write_records(&[b"borrowed".to_vec()], default_opts());
    let mut cursor = Cursor::new(bytes);
    {
        let mut reader = ListReader::new(&mut cursor, true, None);
        let mut scratch = Vec::new();
        assert_eq!(reader.read_record(&mut scratch), Some(&b"borrowed"[..]));
    }
    // The cursor is ours again once the reader is gone.
    assert!(cursor.get_ref().len() > 0);
}

// -------------------- On-disk files --------------------

#[test]
fn file_backed_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("records.lst");

    let originals: Vec<Vec<u8>> = (0..100).map(|i| vec![i as u8; 50 + i]).collect();
    {
        let mut w = ListWriter::open(&path, default_opts()).unwrap();
        w.init().unwrap();
        for r in &originals {
            w.add_record(r).unwrap();
        }
        w.close().unwrap();
    }

    let mut reader = ListReader::open(&path, true, None).unwrap();
    let mut scratch = Vec::new();
    let mut records = Vec::new();
    while let Some(r) = reader.read_record(&mut scratch) {
        records.push(r.to_vec());
    }
    assert_eq!(records, originals);
}

#[test]
fn append_continues_an_existing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("append.lst");

    {
        let mut w = ListWriter::open(&path, default_opts()).unwrap();
        w.add_meta("origin", "first-pass").unwrap();
        w.init().unwrap();
        w.add_record(b"one").unwrap();
        w.add_record(b"two").unwrap();
        w.close().unwrap();
    }
    {
        let opts = WriterOptions {
            append: true,
            // Ignored: the multiplier comes from the existing header.
            block_size_multiplier: 4,
            ..default_opts()
        };
        let mut w = ListWriter::open(&path, opts).unwrap();
        w.init().unwrap();
        assert_eq!(w.block_size(), BLOCK_FACTOR);
        w.add_record(b"three").unwrap();
        w.close().unwrap();
    }

    let mut reader = ListReader::open(&path, true, None).unwrap();
    assert_eq!(
        reader.get_metadata().unwrap().get(&b"origin"[..]),
        Some(&b"first-pass".to_vec())
    );
    let mut scratch = Vec::new();
    let mut records = Vec::new();
    while let Some(r) = reader.read_record(&mut scratch) {
        records.push(r.to_vec());
    }
    assert_eq!(
        records,
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn append_to_missing_file_starts_fresh() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.lst");

    let opts = WriterOptions {
        append: true,
        ..default_opts()
    };
    let mut w = ListWriter::open(&path, opts).unwrap();
    w.init().unwrap();
    w.add_record(b"first").unwrap();
    w.close().unwrap();

    let mut reader = ListReader::open(&path, true, None).unwrap();
    let mut scratch = Vec::new();
    assert_eq!(reader.read_record(&mut scratch), Some(&b"first"[..]));
}
