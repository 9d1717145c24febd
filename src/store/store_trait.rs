use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};

use super::Error;

/// A storage backend suitable for exposing over the network using Porter.
///
/// Every implementation is rooted at its own namespace: paths handed to a
/// store are always absolute *within that store*, never within the composed
/// namespace. The mount table is the only component that translates between
/// the two.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short static name for diagnostics ("mem", "local", "s3", ...).
    fn kind(&self) -> &'static str;

    /// Opens the file at `path` for reading.
    async fn open(&self, path: &Utf8Path) -> Result<Box<dyn File>, Error> {
        self.open_with(path, OpenFlags::READ).await
    }

    /// Opens the file at `path` using the `flags` provided. This is the
    /// primitive the FTP server drives for resumable transfers and the TFTP
    /// server drives for create-exclusive uploads.
    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error>;

    /// Creates (or truncates) the file at `path` and opens it for writing.
    async fn create(&self, path: &Utf8Path) -> Result<Box<dyn File>, Error> {
        self.open_with(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )
        .await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error>;

    /// Like [`Store::stat`] but without following a final symlink. The
    /// returned flag is `true` when the metadata really describes the link
    /// itself. Stores that cannot express this report
    /// [`Error::Unsupported`]; the mount table degrades to a plain `stat`
    /// rather than failing.
    async fn stat_link(&self, path: &Utf8Path) -> Result<(Metadata, bool), Error> {
        let _ = path;
        Err(Error::Unsupported("stat_link"))
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error>;

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), Error>;
    async fn remove(&self, path: &Utf8Path) -> Result<(), Error>;
    async fn remove_all(&self, path: &Utf8Path) -> Result<(), Error>;
    async fn mkdir(&self, path: &Utf8Path) -> Result<(), Error>;
    async fn mkdir_all(&self, path: &Utf8Path) -> Result<(), Error>;

    async fn set_times(
        &self,
        path: &Utf8Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Error>;
    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> Result<(), Error>;
    async fn set_owner(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<(), Error>;
}

/// An open file within a [`Store`].
///
/// I/O is positional: `read_at`/`write_at` carry their own offsets, so a
/// handle has no cursor to share between concurrent protocol operations and
/// a resumed FTP transfer is just a read starting past zero.
#[async_trait]
pub trait File: Send + Sync {
    /// The path this file was opened under. Handles returned by the mount
    /// table report the namespace path the client asked for, not the
    /// backend-relative one.
    fn path(&self) -> &Utf8Path;

    /// Reads up to `len` bytes starting at `offset`. Returns a shorter
    /// buffer near the end of the file and [`None`] at or past it.
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error>;

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error>;

    async fn metadata(&self) -> Result<Metadata, Error>;

    /// Flushes buffered writes to the backing store. Stores that buffer
    /// whole objects (S3) upload here.
    async fn sync(&mut self) -> Result<(), Error>;
}

// Trait-object `Debug` shims so `Result<Box<dyn File>, _>` and
// `Result<Arc<dyn Store>, _>` can use `.unwrap_err()` in tests. Test-only.
#[cfg(test)]
impl std::fmt::Debug for dyn File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn File").field("path", &self.path()).finish()
    }
}

#[cfg(test)]
impl std::fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Store").field("kind", &self.kind()).finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Copy, Clone)]
pub struct Metadata {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub mode: Option<u32>,
}

impl Metadata {
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
            mtime: None,
            mode: None,
        }
    }

    pub fn dir() -> Self {
        Self {
            kind: FileKind::Dir,
            size: 0,
            mtime: None,
            mode: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: Utf8PathBuf,
    pub metadata: Metadata,
}

/// The simplified lowest-common-denominator of file-opening modes that the
/// stores need to support.
#[repr(transparent)]
#[derive(Default, Copy, Clone, Eq, PartialEq)]
pub struct OpenFlags(u32);

bitflags! {
    impl OpenFlags: u32 {
        const READ = 0x00000001;
        const WRITE = 0x00000002;
        const APPEND = 0x00000004;
        const CREATE = 0x00000008;
        const TRUNCATE = 0x00000010;
        const EXCLUSIVE = 0x00000020;
    }
}

impl OpenFlags {
    pub fn writes(self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND | Self::CREATE | Self::TRUNCATE)
    }
}
