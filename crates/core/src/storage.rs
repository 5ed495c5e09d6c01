//! ROM storage sources.
//!
//! [`RomStream`] is the narrow random-access interface the bank cache
//! streams from (an SD card file on the device). Any `Read + Seek` value can
//! be wrapped in a [`ReaderStream`].

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Random-access ROM storage.
pub trait RomStream: Send {
    /// Total size of the image in bytes.
    fn size(&self) -> u64;
    /// Position the stream at an absolute byte offset.
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of data.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// [`RomStream`] over any seekable reader.
pub struct ReaderStream<R> {
    inner: R,
    size: u64,
}

impl<R: Read + Seek + Send> ReaderStream<R> {
    /// Wrap a reader, measuring its length by seeking to the end.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(ReaderStream { inner, size })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl ReaderStream<BufReader<File>> {
    /// Open a ROM file from disk.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        ReaderStream::new(BufReader::new(file))
    }
}

impl<R: Read + Seek + Send> RomStream for ReaderStream<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Read until `buf` is full, the stream ends, or an error occurs.
///
/// Returns the number of bytes actually placed in `buf` along with the
/// error, if any, that stopped the read early.
pub fn read_fully(stream: &mut dyn RomStream, buf: &mut [u8]) -> (usize, Option<io::Error>) {
    let mut total = 0;
    while total < buf.len() {
        match stream.read_into(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return (total, Some(e)),
        }
    }
    (total, None)
}
