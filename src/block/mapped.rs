//! Memory-mapped block store
//!
//! The file is mapped in fixed-size segments. Growing the store extends the
//! file by whole segments and maps the new one; existing mappings are never
//! remapped, so slices handed out earlier in a call stay valid.

use super::store::{BlockStore, DeleteOutcome};
use super::BlockId;
use crate::config::MappedDeletePolicy;
use crate::error::{Result, VaultError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct MappedFile {
    file: Option<File>,
    path: PathBuf,
    block_size: usize,
    segment_size: usize,
    segments: Vec<MmapMut>,
    delete_policy: MappedDeletePolicy,
    /// File length changed since the last sync
    grown: bool,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        segment_size: usize,
        delete_policy: MappedDeletePolicy,
    ) -> Result<Self> {
        if segment_size < block_size || segment_size % block_size != 0 {
            return Err(VaultError::Config(format!(
                "Segment size {} must be a multiple of block size {}",
                segment_size, block_size
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut mapped = MappedFile {
            file: Some(file),
            path: path.as_ref().to_path_buf(),
            block_size,
            segment_size,
            segments: Vec::new(),
            delete_policy,
            grown: false,
        };

        // Map whatever is already there
        let len = mapped.file_len()?;
        let existing = len.div_ceil(segment_size as u64) as usize;
        mapped.ensure_segments(existing)?;
        Ok(mapped)
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "mapped file is closed",
            ))
        })
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn blocks_per_segment(&self) -> u64 {
        (self.segment_size / self.block_size) as u64
    }

    fn locate(&self, id: BlockId) -> (usize, usize) {
        let segment = (id / self.blocks_per_segment()) as usize;
        let offset = (id % self.blocks_per_segment()) as usize * self.block_size;
        (segment, offset)
    }

    fn ensure_segments(&mut self, count: usize) -> Result<()> {
        if self.segments.len() >= count {
            return Ok(());
        }

        let needed_len = count as u64 * self.segment_size as u64;
        if self.file_len()? < needed_len {
            self.file()?.set_len(needed_len)?;
            self.grown = true;
        }

        while self.segments.len() < count {
            let offset = self.segments.len() as u64 * self.segment_size as u64;
            // SAFETY: the mapping covers a region of a file this store owns
            // exclusively, and the file was just extended to cover it.
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(self.segment_size)
                    .map_mut(self.file()?)?
            };
            tracing::debug!(
                path = %self.path.display(),
                segment = self.segments.len(),
                "Mapped new segment"
            );
            self.segments.push(map);
        }
        Ok(())
    }

    /// Files left behind by deferred deletes are reported here, not hidden.
    pub fn delete_policy(&self) -> MappedDeletePolicy {
        self.delete_policy
    }
}

impl BlockStore for MappedFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(VaultError::Corrupt(format!(
                "Block buffer must be exactly {} bytes, got {}",
                self.block_size,
                buf.len()
            )));
        }
        let (segment, offset) = self.locate(id);
        match self.segments.get(segment) {
            Some(map) => buf.copy_from_slice(&map[offset..offset + self.block_size]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size {
            return Err(VaultError::Corrupt(format!(
                "Block data must be exactly {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }
        let (segment, offset) = self.locate(id);
        self.ensure_segments(segment + 1)?;
        self.segments[segment][offset..offset + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.segments.len() as u64 * self.blocks_per_segment())
    }

    fn sync(&mut self) -> Result<()> {
        for map in &self.segments {
            map.flush()?;
        }
        // Flushing the maps does not make a new file length durable
        if self.grown {
            self.file()?.sync_all()?;
            self.grown = false;
        }
        Ok(())
    }

    fn truncate(&mut self, num_blocks: u64) -> Result<()> {
        let keep = num_blocks.div_ceil(self.blocks_per_segment()) as usize;
        if keep < self.segments.len() {
            self.sync()?;
            self.segments.truncate(keep);
            let len = keep as u64 * self.segment_size as u64;
            self.file()?.set_len(len)?;
            self.file()?.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.segments.clear();
        self.file = None;
        Ok(())
    }

    fn delete(&mut self) -> Result<DeleteOutcome> {
        self.segments.clear();
        self.file = None;
        match self.delete_policy {
            MappedDeletePolicy::Remove => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
                Ok(DeleteOutcome::Removed)
            }
            MappedDeletePolicy::Defer => {
                tracing::info!(path = %self.path.display(), "Deferred delete of mapped file");
                Ok(DeleteOutcome::Deferred(self.path.clone()))
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mapped_grows_by_segment() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped.dat");
        let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 0);

        store.write(0, &[1u8; 64]).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 4);

        store.write(9, &[9u8; 64]).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 12);

        let mut buf = vec![0u8; 64];
        store.read(9, &mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 64]);
        store.read(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mapped_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped.dat");
        {
            let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
            store.write(2, &[42u8; 64]).unwrap();
            store.close().unwrap();
        }
        let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
        let mut buf = vec![0u8; 64];
        store.read(2, &mut buf).unwrap();
        assert_eq!(buf, vec![42u8; 64]);
    }

    #[test]
    fn test_growth_synced_without_close() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped.dat");
        {
            let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
            store.write(0, &[1u8; 64]).unwrap();
            store.sync().unwrap();
            assert!(!store.grown);

            // Three more segments, then sync and drop without closing
            store.write(13, &[13u8; 64]).unwrap();
            assert!(store.grown);
            store.sync().unwrap();
            assert!(!store.grown);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
        }

        let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
        assert_eq!(store.num_blocks().unwrap(), 16);
        let mut buf = vec![0u8; 64];
        store.read(13, &mut buf).unwrap();
        assert_eq!(buf, vec![13u8; 64]);
        store.read(0, &mut buf).unwrap();
        assert_eq!(buf, vec![1u8; 64]);
    }

    #[test]
    fn test_deferred_delete_reports_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped.dat");
        let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Defer).unwrap();
        store.write(0, &[1u8; 64]).unwrap();

        assert_eq!(store.delete().unwrap(), DeleteOutcome::Deferred(path.clone()));
        assert!(path.exists());
    }

    #[test]
    fn test_remove_delete() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapped.dat");
        let mut store = MappedFile::open(&path, 64, 256, MappedDeletePolicy::Remove).unwrap();
        store.write(0, &[1u8; 64]).unwrap();
        assert_eq!(store.delete().unwrap(), DeleteOutcome::Removed);
        assert!(!path.exists());
    }

    #[test]
    fn test_bad_segment_size() {
        let temp = TempDir::new().unwrap();
        let result = MappedFile::open(
            temp.path().join("x.dat"),
            64,
            100,
            MappedDeletePolicy::Remove,
        );
        assert!(matches!(result, Err(VaultError::Config(_))));
    }
}
