use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

/// A read-write `MAP_SHARED` mapping of a whole file.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates `path` exclusively and maps `len` zeroed bytes of it.
    pub fn create_new(path: &Path, len: usize, mode: u32) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(mode)
            .open(path)
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => Error::AlreadyExists(path.display().to_string()),
                _ => Error::Io(err),
            })?;
        file.set_len(len as u64)?;
        // SAFETY: the file is sized to `len`. Other processes map it too, but
        // they only touch it through the atomics and lock the queue layers use.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Maps an existing file. An empty file is `Corrupt`; its creator may
    /// not have sized it yet.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
                _ => Error::Io(err),
            })?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("mapped file is empty"));
        }
        // SAFETY: the file is sized to `len`. Other processes map it too, but
        // they only touch it through the atomics and lock the queue layers use.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
