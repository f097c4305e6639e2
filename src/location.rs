//! Store root: where a store's files live

use crate::error::{Result, VaultError};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File extensions used inside a location.
pub mod ext {
    pub const NODES: &str = "idn";
    pub const RECORDS: &str = "dat";
    pub const TREE_STATE: &str = "bpt";
    pub const OBJECTS: &str = "obj";
    pub const OBJECTS_STATE: &str = "opos";
    pub const JOURNAL: &str = "jrnl";
    pub const BLOB: &str = "blob";
}

/// Journal file base name within a location.
pub const JOURNAL_NAME: &str = "journal";

/// A directory on disk, or nowhere at all.
///
/// Memory locations keep every structure in RAM and cannot survive a restart.
#[derive(Clone, PartialEq, Eq)]
pub enum Location {
    Dir(PathBuf),
    Mem,
}

impl Location {
    /// Open a directory location, creating the directory if needed.
    pub fn dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(VaultError::Config(format!(
                "Location is not a directory: {}",
                path.display()
            )));
        }
        Ok(Location::Dir(path))
    }

    pub fn mem() -> Self {
        Location::Mem
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Location::Mem)
    }

    /// Directory, if this is a disk location.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            Location::Dir(path) => Some(path),
            Location::Mem => None,
        }
    }

    /// Path of `<name>.<ext>` inside this location, `None` for memory.
    pub fn path(&self, name: &str, ext: &str) -> Option<PathBuf> {
        self.directory()
            .map(|dir| dir.join(format!("{}.{}", name, ext)))
    }

    /// Whether `<name>.<ext>` exists. Always false for memory.
    pub fn exists(&self, name: &str, ext: &str) -> bool {
        self.path(name, ext).map(|p| p.exists()).unwrap_or(false)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Dir(path) => write!(f, "Location({})", path.display()),
            Location::Mem => write!(f, "Location(mem)"),
        }
    }
}

/// Replace `path` with `bytes`: write aside, fsync, rename over.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
