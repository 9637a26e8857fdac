//! Process-wide compression codec registry.
//!
//! The core links no compression library. Codecs are function triples
//! registered by id at startup (see the `codecs` crate for the built-in
//! zlib/snappy/lz4 plug-ins); the writer picks one per frame and stamps its
//! method id as the first payload byte, so the reader can locate the matching
//! uncompressor without any per-file negotiation.
//!
//! Registration must happen before the first lookup -- typically a single
//! `codecs::register_builtin()` call from `main`. The table is append-once:
//! after initialization it is read-only and lookups take no lock.

use std::sync::OnceLock;

use crate::Result;

/// Compression method ids as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    Zlib = 1,
    Snappy = 2,
    Lz4 = 3,
}

impl Method {
    /// Decodes a method byte read from a compressed payload.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Zlib),
            2 => Some(Self::Snappy),
            3 => Some(Self::Lz4),
            _ => None,
        }
    }

    /// Human-readable codec name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zlib => "zlib",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
        }
    }
}

/// Upper bound on compressed size for a source of the given length.
pub type BoundFn = fn(src_len: usize) -> usize;

/// Compresses `src` into `dst` (sized via [`BoundFn`]), returning the
/// compressed length.
pub type CompressFn = fn(level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize>;

/// Decompresses `src` into `dst`, returning the decompressed length. Fails
/// if the output does not fit in `dst`.
pub type UncompressFn = fn(src: &[u8], dst: &mut [u8]) -> Result<usize>;

/// A registered codec: the three entry points the core needs.
#[derive(Clone, Copy)]
pub struct Codec {
    pub bound: BoundFn,
    pub compress: CompressFn,
    pub uncompress: UncompressFn,
}

const NUM_METHODS: usize = 3;

fn slot(method: Method) -> &'static OnceLock<Codec> {
    static SLOTS: [OnceLock<Codec>; NUM_METHODS] =
        [OnceLock::new(), OnceLock::new(), OnceLock::new()];
    &SLOTS[method as usize - 1]
}

/// Registers `codec` under `method`.
///
/// Re-registering the identical triple is a no-op, so plug-in crates may call
/// their registration entry point more than once.
///
/// # Panics
///
/// Panics if a *different* triple is already registered under `method`; two
/// codecs competing for one id is a startup misconfiguration, not a runtime
/// condition.
pub fn register(method: Method, codec: Codec) {
    let existing = slot(method).get_or_init(|| codec);
    assert!(
        existing.bound == codec.bound
            && existing.compress == codec.compress
            && existing.uncompress == codec.uncompress,
        "codec {} already registered with a different implementation",
        method.name()
    );
}

/// Looks up the codec registered under `method`, if any.
///
/// A `None` on the write path is a configuration error; on the read path it
/// means the file uses a codec this process does not carry.
pub fn find(method: Method) -> Option<&'static Codec> {
    slot(method).get()
}
