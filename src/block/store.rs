//! Backing stores for block managers
//!
//! A store knows how to move whole blocks between memory and its medium and
//! nothing else: allocation, caching and checkouts live in the block manager.

use super::BlockId;
use crate::error::{Result, VaultError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// What happened when a store's backing file was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The file is gone.
    Removed,
    /// The file was left in place (mapped file on a platform, or under a
    /// policy, where it cannot be removed yet).
    Deferred(PathBuf),
    /// Nothing to delete (memory store).
    NotApplicable,
}

/// Fixed-size block I/O over some medium.
pub trait BlockStore: Send {
    fn block_size(&self) -> usize;

    /// Read block `id` into `buf`. Blocks past the end of the medium read
    /// as zeros.
    fn read(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<()>;

    /// Number of blocks the medium currently holds.
    fn num_blocks(&self) -> Result<u64>;

    fn sync(&mut self) -> Result<()>;

    /// Shrink (or grow) the medium to `num_blocks` blocks.
    fn truncate(&mut self, num_blocks: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Close and delete the backing file.
    fn delete(&mut self) -> Result<DeleteOutcome>;

    /// Backing file, if any.
    fn path(&self) -> Option<&Path>;
}

fn check_len(block_size: usize, len: usize) -> Result<()> {
    if len != block_size {
        return Err(VaultError::Corrupt(format!(
            "Block data must be exactly {} bytes, got {}",
            block_size, len
        )));
    }
    Ok(())
}

/// Direct file I/O: every read and write is an explicit seek plus syscall.
pub struct DirectFile {
    file: Option<File>,
    path: PathBuf,
    block_size: usize,
}

impl DirectFile {
    /// Open or create a block file
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            // A torn final block from a crash mid-write. The block manager
            // treats it as allocated; its tail reads as zeros.
            tracing::warn!(
                path = %path.as_ref().display(),
                len,
                block_size,
                "Block file length is not a multiple of the block size"
            );
        }

        Ok(DirectFile {
            file: Some(file),
            path: path.as_ref().to_path_buf(),
            block_size,
        })
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "block file is closed",
            ))
        })
    }
}

impl BlockStore for DirectFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        check_len(self.block_size, buf.len())?;
        let offset = id * self.block_size as u64;
        let file = self.file()?;
        let len = file.metadata()?.len();

        buf.fill(0);
        if offset >= len {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let available = ((len - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..available])?;
        Ok(())
    }

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data.len())?;
        let offset = id * self.block_size as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn num_blocks(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or_else(|| {
            VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "block file is closed",
            ))
        })?;
        let len = file.metadata()?.len();
        Ok(len.div_ceil(self.block_size as u64))
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn truncate(&mut self, num_blocks: u64) -> Result<()> {
        let len = num_blocks * self.block_size as u64;
        self.file()?.set_len(len)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.file = None;
        Ok(())
    }

    fn delete(&mut self) -> Result<DeleteOutcome> {
        self.file = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(DeleteOutcome::Removed)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Blocks held in memory. Nothing survives the process.
pub struct MemStore {
    blocks: Vec<Option<Box<[u8]>>>,
    block_size: usize,
}

impl MemStore {
    pub fn new(block_size: usize) -> Self {
        MemStore {
            blocks: Vec::new(),
            block_size,
        }
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        check_len(self.block_size, buf.len())?;
        match self.blocks.get(id as usize) {
            Some(Some(data)) => buf.copy_from_slice(data),
            _ => buf.fill(0),
        }
        Ok(())
    }

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data.len())?;
        let idx = id as usize;
        if idx >= self.blocks.len() {
            self.blocks.resize(idx + 1, None);
        }
        self.blocks[idx] = Some(data.into());
        Ok(())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, num_blocks: u64) -> Result<()> {
        self.blocks.resize(num_blocks as usize, None);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self) -> Result<DeleteOutcome> {
        self.blocks.clear();
        Ok(DeleteOutcome::NotApplicable)
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_direct_write_and_read() {
        let temp = TempDir::new().unwrap();
        let mut store = DirectFile::open(temp.path().join("blocks.dat"), 128).unwrap();

        let mut data = vec![0u8; 128];
        data[0..5].copy_from_slice(b"Hello");
        store.write(3, &data).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 4);

        let mut buf = vec![0xAA; 128];
        store.read(3, &mut buf).unwrap();
        assert_eq!(&buf[0..5], b"Hello");

        // Hole before block 3 reads as zeros, and so does past-the-end
        store.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        store.read(100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_direct_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blocks.dat");
        {
            let mut store = DirectFile::open(&path, 64).unwrap();
            store.write(0, &[7u8; 64]).unwrap();
            store.close().unwrap();
        }
        let mut store = DirectFile::open(&path, 64).unwrap();
        let mut buf = vec![0u8; 64];
        store.read(0, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 64]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut store = MemStore::new(64);
        assert!(store.write(0, &[0u8; 63]).is_err());
    }

    #[test]
    fn test_direct_delete() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gone.dat");
        let mut store = DirectFile::open(&path, 64).unwrap();
        store.write(0, &[1u8; 64]).unwrap();
        assert_eq!(store.delete().unwrap(), DeleteOutcome::Removed);
        assert!(!path.exists());
    }

    #[test]
    fn test_mem_truncate() {
        let mut store = MemStore::new(64);
        store.write(5, &[1u8; 64]).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 6);
        store.truncate(2).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 2);
        let mut buf = vec![9u8; 64];
        store.read(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
