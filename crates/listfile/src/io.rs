//! Byte-level file abstractions used by the writer and reader.
//!
//! The core never touches `std::fs` directly: the writer appends through a
//! [`Sink`] and the reader issues positioned reads through a [`ReadonlyFile`].
//! Both traits are implemented for in-memory buffers (tests) and for real
//! files. Ownership is decided by the type parameter at construction time:
//! pass a value to hand the file over, pass `&mut` to keep it.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Positioned, read-only access to a byte stream of known size.
pub trait ReadonlyFile {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    /// A short count is only returned at end of file.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total size of the underlying file in bytes.
    fn size(&self) -> u64;
}

/// Append-only byte sink.
pub trait Sink {
    /// Appends `bytes` in full.
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Pushes buffered bytes down to the underlying device.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: ReadonlyFile + ?Sized> ReadonlyFile for &mut T {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(offset, buf)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

impl<T: Sink + ?Sized> Sink for &mut T {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).append(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl Sink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl ReadonlyFile for Cursor<Vec<u8>> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.get_ref();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.get_ref().len() as u64
    }
}

/// A [`ReadonlyFile`] over a file on disk.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Opens `path` for positioned reads.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ReadonlyFile for FileSource {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut n = 0;
        while n < buf.len() {
            match self.file.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A [`Sink`] appending to a file on disk.
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Creates `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens `path` for appending, creating it if absent.
    pub fn append_to<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Forces written data to disk via `sync_all`.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Sink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
