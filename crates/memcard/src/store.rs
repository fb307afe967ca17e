//! Byte-addressable media behind a memory card.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// Value of erased flash.
pub const ERASED: u8 = 0xFF;

/// Flat storage addressed by the same byte offsets the card commands carry.
pub trait BackingStore {
    fn len(&self) -> usize;

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()>;

    /// Resets `len` bytes at `offset` to the erased value.
    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn out_of_range(offset: usize, len: usize, size: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("access of {len} bytes at {offset:#x} exceeds image size {size:#x}"),
    )
}

fn range(offset: usize, len: usize, size: usize) -> io::Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(out_of_range(offset, len, size)),
    }
}

/// Volatile image held in memory.
#[derive(Debug, Clone)]
pub struct MemStore {
    bytes: Vec<u8>,
}

impl MemStore {
    /// Blank (fully erased) image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![ERASED; size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl BackingStore for MemStore {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let range = range(offset, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        let range = range(offset, data.len(), self.bytes.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()> {
        let range = range(offset, len, self.bytes.len())?;
        self.bytes[range].fill(ERASED);
        Ok(())
    }
}

/// Card image backed by a file on the host.
///
/// The whole image is cached in memory and written back on [`flush`] once
/// something changed. Missing files start erased; short files are padded
/// with erased bytes.
///
/// [`flush`]: BackingStore::flush
pub struct ImageFile {
    path: PathBuf,
    image: MemStore,
    dirty: bool,
}

impl ImageFile {
    pub fn open(path: &Path, size: usize) -> io::Result<Self> {
        let mut bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };

        let dirty = bytes.len() < size;
        if dirty {
            debug!(
                "padding image {} from {} to {} bytes",
                path.display(),
                bytes.len(),
                size
            );
            bytes.resize(size, ERASED);
        }

        Ok(Self {
            path: path.to_owned(),
            image: MemStore::from_bytes(bytes),
            dirty,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl BackingStore for ImageFile {
    fn len(&self) -> usize {
        self.image.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.image.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.image.write(offset, data)?;
        self.dirty = true;
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()> {
        self.image.erase(offset, len)?;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            std::fs::write(&self.path, self.image.as_bytes())?;
            debug!("flushed {}", self.path.display());
            self.dirty = false;
        }
        Ok(())
    }
}
