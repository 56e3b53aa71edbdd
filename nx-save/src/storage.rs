use parking_lot::Mutex;
use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Encapsulates a byte-addressable backing store with positional read support.
///
/// Every layer of a save container (the raw file, the remapped address space
/// and the duplex layers) is exposed through this trait. Each call specifies
/// its own offset, so concurrent reads from multiple threads do not share a
/// cursor.
pub trait Storage: Send + Sync {
    /// Reads bytes from the storage at the given offset into `buf`.
    ///
    /// Returns the number of bytes actually read. A short read indicates
    /// the end of the storage was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the storage ends before the
    /// buffer is filled.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut total = 0;

        while total < buf.len() {
            let n = self.read_at(offset + total as u64, &mut buf[total..])?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF in storage",
                ));
            }

            total += n;
        }

        Ok(())
    }

    /// Returns the total length of the storage in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the storage is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Storage + ?Sized> Storage for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<T: Storage + ?Sized> Storage for Box<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// Storage backed by a byte slice (e.g. a memory-mapped or fully read file).
///
/// Reads are pure slice indexing: no locks, no allocation, no state.
#[derive(Debug, Clone, Copy)]
pub struct SliceStorage<'a> {
    data: &'a [u8],
}

impl<'a> SliceStorage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl Storage for SliceStorage<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.len() as u64;

        if offset >= len {
            return Ok(0);
        }

        let start = offset as usize;
        let n = min(buf.len(), self.data.len() - start);

        buf[..n].copy_from_slice(&self.data[start..start + n]);

        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Storage backed by an open file, using the platform's positional reads.
///
/// No cursor is shared between readers, so a single `FileStorage` can serve
/// concurrent reads without a lock.
#[cfg(any(unix, windows))]
#[derive(Debug)]
pub struct FileStorage {
    file: std::fs::File,
    len: u64,
}

#[cfg(any(unix, windows))]
impl FileStorage {
    /// Opens the file at `path` for reading.
    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Self::new(std::fs::File::open(path)?)
    }

    /// Wraps an already opened file. The length is captured once.
    pub fn new(file: std::fs::File) -> io::Result<Self> {
        let len = file.metadata()?.len();

        Ok(Self { file, len })
    }
}

#[cfg(any(unix, windows))]
impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }

        let n = min(buf.len() as u64, self.len - offset) as usize;

        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(&self.file, &mut buf[..n], offset)
        }

        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(&self.file, &mut buf[..n], offset)
        }
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Storage over any `Read + Seek` source without positional reads.
///
/// The `seek` and the following `read` happen under one lock, so readers
/// sharing the source never observe each other's cursor.
#[derive(Debug)]
pub struct LockedReader<R> {
    inner: Mutex<R>,
    len: u64,
}

impl<R: Read + Seek + Send> LockedReader<R> {
    /// Wraps `inner`, measuring its length by seeking to the end.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(inner),
            len,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: Read + Seek + Send> Storage for LockedReader<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.len {
            return Ok(0);
        }

        let mut inner = self.inner.lock();

        inner.seek(SeekFrom::Start(offset))?;
        inner.read(buf)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Allocates a zeroed buffer of `len` bytes, or `None` if `len` cannot be
/// satisfied. Sizes come straight from the container header, so the
/// allocation must not abort the process.
pub(crate) fn try_alloc(len: u64) -> Option<Vec<u8>> {
    let len = usize::try_from(len).ok()?;
    let mut buf = Vec::new();

    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);

    Some(buf)
}
