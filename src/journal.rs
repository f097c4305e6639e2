//! Write-ahead journal
//!
//! Entry layout, all integers big-endian:
//!
//! ```text
//! [len: u32][crc32: u32][type: u8][component id: 16 bytes][payload]
//! ```
//!
//! `len` counts everything after the CRC, and the CRC covers those same
//! bytes. Entries are buffered in memory until [`Journal::sync`] or a
//! [`Journal::write_journal`] marker, which is the durable point of a commit.
//!
//! A crash can leave a partly written entry at the end of the file. Scanning
//! stops at the first entry that does not decode cleanly; everything before
//! it is trusted and everything from it on is treated as a torn tail.

use crate::error::{Result, VaultError};
use crate::location::{ext, Location, JOURNAL_NAME};
use crate::txn::ComponentId;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 8;
const BODY_FIXED_LEN: usize = 1 + ComponentId::LEN;

/// What a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JournalEntryType {
    Redo = 1,
    /// Decoded, but recovery does not act on it
    Undo = 2,
    Commit = 3,
    Abort = 4,
}

impl JournalEntryType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(JournalEntryType::Redo),
            2 => Some(JournalEntryType::Undo),
            3 => Some(JournalEntryType::Commit),
            4 => Some(JournalEntryType::Abort),
            _ => None,
        }
    }

    /// Commit and abort entries close a group and carry no component.
    pub fn is_marker(self) -> bool {
        matches!(self, JournalEntryType::Commit | JournalEntryType::Abort)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: JournalEntryType,
    pub component: ComponentId,
    pub payload: Vec<u8>,
}

impl JournalEntry {
    pub fn new(kind: JournalEntryType, component: ComponentId, payload: impl Into<Vec<u8>>) -> Self {
        JournalEntry {
            kind,
            component,
            payload: payload.into(),
        }
    }

    /// A commit or abort marker.
    pub fn marker(kind: JournalEntryType) -> Self {
        Self::new(kind, ComponentId::NIL, Vec::new())
    }

    /// Bytes this entry takes in the journal.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + BODY_FIXED_LEN + self.payload.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let body_len = BODY_FIXED_LEN + self.payload.len();
        let len = u32::try_from(body_len).map_err(|_| {
            VaultError::Config(format!("Journal payload too large: {} bytes", self.payload.len()))
        })?;

        let start = out.len();
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.push(self.kind as u8);
        out.extend_from_slice(self.component.as_bytes());
        out.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&out[start + HEADER_LEN..]);
        out[start + 4..start + HEADER_LEN].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Decode the entry at the front of `bytes`, returning it and the bytes
    /// consumed. The error names why the bytes are not a clean entry.
    pub fn decode(bytes: &[u8]) -> std::result::Result<(JournalEntry, usize), &'static str> {
        if bytes.len() < HEADER_LEN {
            return Err("truncated header");
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let crc = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if len < BODY_FIXED_LEN {
            return Err("bad length");
        }
        let end = HEADER_LEN
            .checked_add(len)
            .filter(|&end| end <= bytes.len())
            .ok_or("truncated body")?;

        let body = &bytes[HEADER_LEN..end];
        if crc32fast::hash(body) != crc {
            return Err("checksum mismatch");
        }
        let kind = JournalEntryType::from_u8(body[0]).ok_or("unknown entry type")?;
        let component = ComponentId::from_slice(&body[1..BODY_FIXED_LEN]).ok_or("bad component id")?;

        Ok((
            JournalEntry {
                kind,
                component,
                payload: body[BODY_FIXED_LEN..].to_vec(),
            },
            end,
        ))
    }
}

/// Result of reading a journal from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalScan {
    pub entries: Vec<JournalEntry>,
    /// Bytes covered by cleanly decoded entries
    pub valid_len: u64,
    /// Bytes in the journal, torn tail included
    pub total_len: u64,
}

impl JournalScan {
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.total_len
    }

    /// REDO entries of the transactions that reached COMMIT, in order.
    pub fn committed_redo(&self) -> Vec<&JournalEntry> {
        let mut committed = Vec::new();
        let mut group = Vec::new();
        for entry in &self.entries {
            match entry.kind {
                JournalEntryType::Redo => group.push(entry),
                JournalEntryType::Undo => {}
                JournalEntryType::Abort => group.clear(),
                JournalEntryType::Commit => committed.append(&mut group),
            }
        }
        committed
    }
}

enum Storage {
    File(File),
    Mem(Vec<u8>),
}

impl Storage {
    fn len(&self) -> Result<u64> {
        match self {
            Storage::File(file) => Ok(file.metadata()?.len()),
            Storage::Mem(bytes) => Ok(bytes.len() as u64),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Storage::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
            }
            Storage::Mem(bytes) => {
                bytes.truncate(offset as usize);
                bytes.extend_from_slice(data);
            }
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        match self {
            Storage::File(file) => {
                let mut out = Vec::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut out)?;
                Ok(out)
            }
            Storage::Mem(bytes) => Ok(bytes.clone()),
        }
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        match self {
            Storage::File(file) => file.set_len(len)?,
            Storage::Mem(bytes) => bytes.truncate(len as usize),
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Storage::File(file) = self {
            file.sync_data()?;
        }
        Ok(())
    }
}

struct JournalInner {
    storage: Storage,
    /// Bytes already handed to storage
    written: u64,
    buffer: Vec<u8>,
    /// Position recorded by `start_write`
    mark: Option<u64>,
    closed: bool,
}

impl JournalInner {
    fn position(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::Other,
                "Journal is closed",
            )));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.storage.write_at(self.written, &self.buffer)?;
            self.written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.written {
            self.buffer.truncate((len - self.written) as usize);
        } else {
            self.buffer.clear();
            self.storage.truncate(len)?;
            self.written = len;
        }
        Ok(())
    }
}

/// The write-ahead journal of a store.
pub struct Journal {
    path: Option<PathBuf>,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open or create a journal file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let storage = Storage::File(file);
        let written = storage.len()?;
        tracing::debug!(path = %path.display(), len = written, "Opened journal");
        Ok(Self::with_storage(Some(path), storage, written))
    }

    /// Journal held in memory.
    pub fn mem() -> Self {
        Self::with_storage(None, Storage::Mem(Vec::new()), 0)
    }

    /// The journal of `location`.
    pub fn open_in(location: &Location) -> Result<Self> {
        match location.path(JOURNAL_NAME, ext::JOURNAL) {
            Some(path) => Self::open(path),
            None => Ok(Self::mem()),
        }
    }

    fn with_storage(path: Option<PathBuf>, storage: Storage, written: u64) -> Self {
        Journal {
            path,
            inner: Mutex::new(JournalInner {
                storage,
                written,
                buffer: Vec::new(),
                mark: None,
                closed: false,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an entry. Buffered; not durable until the next sync.
    /// Returns the position the entry starts at.
    pub fn write(
        &self,
        kind: JournalEntryType,
        component: ComponentId,
        payload: &[u8],
    ) -> Result<u64> {
        self.write_entry(&JournalEntry::new(kind, component, payload))
    }

    pub fn write_entry(&self, entry: &JournalEntry) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let position = inner.position();
        entry.encode_into(&mut inner.buffer)?;
        tracing::trace!(
            kind = ?entry.kind,
            component = %entry.component,
            len = entry.payload.len(),
            position,
            "Journal write"
        );
        Ok(position)
    }

    /// Append a commit or abort marker and make everything so far durable.
    pub fn write_journal(&self, kind: JournalEntryType) -> Result<u64> {
        let position = self.write_entry(&JournalEntry::marker(kind))?;
        self.sync()?;
        Ok(position)
    }

    /// Remember the current position so `abort_write` can return to it.
    pub fn start_write(&self) {
        let mut inner = self.inner.lock();
        inner.mark = Some(inner.position());
    }

    pub fn commit_write(&self) {
        self.inner.lock().mark = None;
    }

    /// Drop everything written since `start_write`.
    pub fn abort_write(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mark) = inner.mark.take() {
            tracing::debug!(from = inner.position(), to = mark, "Journal abort_write");
            inner.truncate(mark)?;
        }
        Ok(())
    }

    /// Logical end of the journal, buffered entries included.
    pub fn position(&self) -> u64 {
        self.inner.lock().position()
    }

    pub fn is_empty(&self) -> bool {
        self.position() == 0
    }

    /// Read every clean entry from the start of the journal.
    pub fn scan(&self) -> Result<JournalScan> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.flush()?;
        let bytes = inner.storage.read_all()?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match JournalEntry::decode(&bytes[offset..]) {
                Ok((entry, used)) => {
                    entries.push(entry);
                    offset += used;
                }
                Err(reason) => {
                    tracing::info!(
                        offset,
                        tail = bytes.len() - offset,
                        reason,
                        "Journal ends with a torn entry; ignoring the tail"
                    );
                    break;
                }
            }
        }

        Ok(JournalScan {
            entries,
            valid_len: offset as u64,
            total_len: bytes.len() as u64,
        })
    }

    /// Clean entries, in order. A torn tail is dropped, never an error.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.scan()?.entries)
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.truncate(len)?;
        if inner.mark.map_or(false, |mark| mark > len) {
            inner.mark = None;
        }
        Ok(())
    }

    /// Empty the journal durably.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.truncate(0)?;
        inner.mark = None;
        inner.storage.sync()
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.flush()?;
        inner.storage.sync()
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.flush()?;
        inner.storage.sync()?;
        inner.closed = true;
        Ok(())
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("position", &self.position())
            .finish()
    }
}
