//! Named, host-local shared memory regions.
//!
//! A region is a file inside a namespace directory (by default `/dev/shm`, the
//! POSIX shared memory namespace on Linux) mapped with `memmap2`. The process
//! that creates a region owns it: [`SharedRegionMut`] unlinks the backing file
//! when closed or dropped, so the OS object is released on every exit path.
//! Consumers attach with [`SharedRegion`], which only ever unmaps.

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// Default namespace directory for region files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("invalid region name '{0}'")]
    InvalidName(String),

    #[error("region '{0}' must have a non-zero size")]
    Empty(String),

    #[error("failed to create region '{name}'")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach region '{name}'")]
    Attach {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to unlink region '{name}'")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Directory in which region names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    root: PathBuf,
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl ShmNamespace {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` to the backing file path, rejecting anything that could
    /// escape the namespace directory.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, RegionError> {
        let bad = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0');
        if bad {
            return Err(RegionError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.exists()).unwrap_or(false)
    }
}

/// Owning, read-write handle to a region.
pub struct SharedRegionMut {
    name: String,
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    linked: bool,
}

/// Read-only attachment to a region owned by another handle or process.
pub struct SharedRegion {
    name: String,
    _file: File,
    mmap: Mmap,
}

impl SharedRegionMut {
    /// Create the region `name` with `size_bytes` of zeroed memory and map it
    /// read-write. A stale file left behind by a crashed owner is replaced.
    pub fn create(ns: &ShmNamespace, name: &str, size_bytes: usize) -> Result<Self, RegionError> {
        if size_bytes == 0 {
            return Err(RegionError::Empty(name.to_string()));
        }
        let path = ns.path_of(name)?;
        let create_err = |source| RegionError::Create {
            name: name.to_string(),
            source,
        };

        if path.exists() {
            tracing::warn!(region = name, "replacing stale shared memory region");
            fs::remove_file(&path).map_err(create_err)?;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(create_err)?;
        file.set_len(size_bytes as u64).map_err(create_err)?;

        // SAFETY: the file was created exclusively above and only this handle
        // maps it writable.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(create_err)?;
        tracing::debug!(region = name, size_bytes, "created shared memory region");

        Ok(Self {
            name: name.to_string(),
            path,
            _file: file,
            mmap,
            linked: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return raw pointer to start of the mapped region
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Unmap and unlink the region, reporting unlink failures.
    pub fn close(mut self) -> Result<(), RegionError> {
        self.unlink()
    }

    fn unlink(&mut self) -> Result<(), RegionError> {
        if !self.linked {
            return Ok(());
        }
        self.linked = false;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(region = %self.name, "unlinked shared memory region");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RegionError::Unlink {
                name: self.name.clone(),
                source,
            }),
        }
    }
}

impl Drop for SharedRegionMut {
    fn drop(&mut self) {
        if let Err(e) = self.unlink() {
            tracing::error!(error = %e, "shared memory region left behind");
        }
    }
}

impl SharedRegion {
    /// Attach to an existing region read-only.
    pub fn open_ro(ns: &ShmNamespace, name: &str) -> Result<Self, RegionError> {
        let path = ns.path_of(name)?;
        let attach_err = |source| RegionError::Attach {
            name: name.to_string(),
            source,
        };
        let file = OpenOptions::new().read(true).open(&path).map_err(attach_err)?;
        if file.metadata().map_err(attach_err)?.len() == 0 {
            return Err(RegionError::Empty(name.to_string()));
        }

        // SAFETY: the mapping is read-only; concurrent writers are handled by
        // the seqlock protocols layered on top of the raw bytes.
        let mmap = unsafe { Mmap::map(&file) }.map_err(attach_err)?;

        Ok(Self {
            name: name.to_string(),
            _file: file,
            mmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Detach without touching the backing file.
    pub fn close(self) {}
}
