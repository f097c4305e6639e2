//! Append-only object log
//!
//! Each object is stored as `[len: u32 BE][bytes]` and identified by the
//! offset of its length prefix.

use crate::error::{Result, VaultError};
use crate::location::{ext, Location};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bytes of the length prefix in front of every object.
pub const OBJECT_HEADER: u64 = 4;

/// Buffered writes are pushed to the file once this many bytes pile up.
const WRITE_BUFFER_LIMIT: usize = 64 * 1024;

pub trait ObjectFile: Send + Sync {
    /// Append an object, returning its offset.
    fn write(&self, bytes: &[u8]) -> Result<u64>;

    /// The object at `offset`.
    fn read(&self, offset: u64) -> Result<Vec<u8>>;

    /// Offset the next object will get.
    fn length(&self) -> u64;

    /// Drop everything from `len` on.
    fn truncate(&self, len: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Objects in `[start, end)`, in order, with their offsets.
    fn iter_range(&self, start: u64, end: u64) -> ObjectIter<'_>;

    /// Every object.
    fn iter(&self) -> ObjectIter<'_> {
        self.iter_range(0, self.length())
    }

    fn label(&self) -> &str;
}

fn too_large(len: usize) -> VaultError {
    VaultError::Config(format!("Object of {} bytes is too large", len))
}

fn encode_object(bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| too_large(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Walks objects one at a time through [`ObjectFile::read`].
pub struct ObjectIter<'a> {
    file: &'a dyn ObjectFile,
    position: u64,
    end: u64,
}

impl<'a> ObjectIter<'a> {
    pub fn new(file: &'a dyn ObjectFile, start: u64, end: u64) -> Self {
        ObjectIter {
            file,
            position: start,
            end,
        }
    }
}

impl Iterator for ObjectIter<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let offset = self.position;
        match self.file.read(offset) {
            Ok(bytes) => {
                self.position = offset + OBJECT_HEADER + bytes.len() as u64;
                Some(Ok((offset, bytes)))
            }
            Err(e) => {
                self.position = self.end;
                Some(Err(e))
            }
        }
    }
}

struct StorageInner {
    file: File,
    /// Bytes in the file
    file_len: u64,
    buffer: Vec<u8>,
    closed: bool,
}

impl StorageInner {
    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.seek(SeekFrom::Start(self.file_len))?;
            self.file.write_all(&self.buffer)?;
            self.file_len += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::Other,
                "Object file is closed",
            )));
        }
        Ok(())
    }
}

/// File-backed object log with an in-memory write buffer.
///
/// Reads of buffered objects flush the buffer first.
pub struct ObjectFileStorage {
    label: String,
    path: PathBuf,
    inner: Mutex<StorageInner>,
}

impl ObjectFileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ObjectFileStorage {
            label,
            path,
            inner: Mutex::new(StorageInner {
                file,
                file_len,
                buffer: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObjectFile for ObjectFileStorage {
    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let offset = inner.file_len + inner.buffer.len() as u64;
        encode_object(bytes, &mut inner.buffer)?;
        if inner.buffer.len() >= WRITE_BUFFER_LIMIT {
            inner.flush()?;
        }
        Ok(offset)
    }

    fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if offset >= inner.file_len {
            inner.flush()?;
        }
        if offset.saturating_add(OBJECT_HEADER) > inner.file_len {
            return Err(VaultError::InvalidOffset(offset));
        }

        let mut header = [0u8; OBJECT_HEADER as usize];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as u64;
        if offset + OBJECT_HEADER + len > inner.file_len {
            return Err(VaultError::corrupt(format!(
                "{}: object at {} claims {} bytes, file ends at {}",
                self.label, offset, len, inner.file_len
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        inner.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn length(&self) -> u64 {
        let inner = self.inner.lock();
        inner.file_len + inner.buffer.len() as u64
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.flush()?;
        if len < inner.file_len {
            tracing::debug!(file = %self.label, from = inner.file_len, to = len, "Truncating object file");
            inner.file.set_len(len)?;
            inner.file_len = len;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.flush()?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.flush()?;
        inner.file.sync_data()?;
        inner.closed = true;
        Ok(())
    }

    fn iter_range(&self, start: u64, end: u64) -> ObjectIter<'_> {
        ObjectIter::new(self, start, end)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ObjectFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectFileStorage")
            .field("path", &self.path)
            .field("length", &self.length())
            .finish()
    }
}

/// Object log held in memory.
pub struct ObjectFileMem {
    label: String,
    bytes: Mutex<Vec<u8>>,
}

impl ObjectFileMem {
    pub fn new(label: impl Into<String>) -> Self {
        ObjectFileMem {
            label: label.into(),
            bytes: Mutex::new(Vec::new()),
        }
    }
}

impl ObjectFile for ObjectFileMem {
    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let mut data = self.bytes.lock();
        let offset = data.len() as u64;
        encode_object(bytes, &mut data)?;
        Ok(offset)
    }

    fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let data = self.bytes.lock();
        let start = offset as usize;
        let header = data
            .get(start..start.saturating_add(OBJECT_HEADER as usize))
            .ok_or(VaultError::InvalidOffset(offset))?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let body = start + OBJECT_HEADER as usize;
        data.get(body..body.saturating_add(len))
            .map(|b| b.to_vec())
            .ok_or_else(|| VaultError::corrupt(format!("{}: object at {} runs past the end", self.label, offset)))
    }

    fn length(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut data = self.bytes.lock();
        if (len as usize) < data.len() {
            data.truncate(len as usize);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn iter_range(&self, start: u64, end: u64) -> ObjectIter<'_> {
        ObjectIter::new(self, start, end)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Open the object file `<name>.obj` in `location`.
pub fn open_object_file(location: &Location, name: &str) -> Result<Arc<dyn ObjectFile>> {
    match location.path(name, ext::OBJECTS) {
        Some(path) => Ok(Arc::new(ObjectFileStorage::open(path)?)),
        None => Ok(Arc::new(ObjectFileMem::new(format!("{}.{}", name, ext::OBJECTS)))),
    }
}
