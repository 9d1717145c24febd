use std::{
    io::SeekFrom,
    os::unix::fs::PermissionsExt as _,
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_fs_ext::DirExtUtf8 as _;
use cap_primitives::fs::MetadataExt as _;
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use super::{
    absolute,
    error::IntoIoError as _,
    DirEntry,
    Error,
    File,
    FileKind,
    Metadata,
    OpenFlags,
    Store,
};

/// A store rooted at a host directory. All access goes through a
/// capability-mode [`Dir`] handle opened once at construction, so paths
/// cannot escape the root.
pub struct LocalDir {
    root_path: Utf8PathBuf,
    root_dir: Arc<Dir>,
}

impl LocalDir {
    pub fn new(root_path: impl Into<Utf8PathBuf>) -> Result<Self, Error> {
        let root_path = root_path.into();
        let root_dir = Arc::new(
            Dir::open_ambient_dir(root_path.as_path(), ambient_authority())
                .into_io_error("failed to open local root")?,
        );

        Ok(Self {
            root_path,
            root_dir,
        })
    }

    fn root(&self) -> Result<Dir, Error> {
        self.root_dir
            .try_clone()
            .into_io_error("failed to clone root directory handle")
    }
}

/// Store paths are absolute within the store; cap-std wants them relative
/// to the root handle.
fn rooted(path: &Utf8Path) -> Result<Utf8PathBuf, Error> {
    let path = absolute(path)?;
    match path.strip_prefix("/") {
        Ok(rel) if rel.as_str().is_empty() => Ok(Utf8PathBuf::from(".")),
        Ok(rel) => Ok(rel.to_owned()),
        Err(_) => Err(Error::InvalidPath(path.clone())),
    }
}

fn kind_of(file_type: cap_std::fs::FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

fn metadata_from(value: &cap_std::fs::Metadata) -> Metadata {
    Metadata {
        kind: kind_of(value.file_type()),
        size: value.len(),
        mtime: value.modified().ok().map(cap_std::time::SystemTime::into_std),
        mode: Some(value.mode()),
    }
}

fn open_options(flags: OpenFlags) -> cap_std::fs::OpenOptions {
    let mut opts = cap_std::fs::OpenOptions::new();

    if flags.contains(OpenFlags::READ) || !flags.writes() {
        opts.read(true);
    }
    if flags.contains(OpenFlags::WRITE) {
        opts.write(true);
    }
    if flags.contains(OpenFlags::APPEND) {
        opts.append(true);
    }
    if flags.contains(OpenFlags::CREATE) {
        opts.create(true);
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        opts.truncate(true);
    }
    if flags.contains(OpenFlags::EXCLUSIVE) {
        opts.create_new(true);
    }

    opts
}

async fn run_blocking<T: Send + 'static>(
    task: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Result<T, Error> {
    tokio::task::spawn_blocking(task)
        .await
        .unwrap_or_else(|e| {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }

            panic!("task failed: {e}");
        })
}

#[async_trait]
impl Store for LocalDir {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        let full = absolute(path)?;
        let rel = rooted(&full)?;
        let root = self.root()?;
        let opts = open_options(flags);

        let file = run_blocking(move || {
            root.open_with(&rel, &opts)
                .into_io_error(format!("couldn't open file {rel}"))
        })
        .await?;

        Ok(Box::new(LocalFile {
            file: tokio::fs::File::from_std(file.into_std()),
            path: full,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let metadata = if rel == "." {
                root.dir_metadata()
            } else {
                root.metadata(&rel)
            }
            .into_io_error(format!("failed to stat {rel}"))?;

            Ok(metadata_from(&metadata))
        })
        .await
    }

    async fn stat_link(&self, path: &Utf8Path) -> Result<(Metadata, bool), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let metadata = if rel == "." {
                root.dir_metadata()
            } else {
                root.symlink_metadata(&rel)
            }
            .into_io_error(format!("failed to stat link {rel}"))?;

            Ok((metadata_from(&metadata), true))
        })
        .await
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let dir = if rel == "." {
                root
            } else {
                root.open_dir(&rel)
                    .into_io_error(format!("couldn't open directory {rel}"))?
            };

            let mut entries = Vec::new();
            for entry in dir.entries().into_io_error("couldn't list directory")? {
                let entry = entry.into_io_error("couldn't get directory entry")?;
                let name = entry.file_name().into_io_error("couldn't get file name")?;
                let metadata = entry
                    .metadata()
                    .into_io_error("couldn't get entry metadata")?;

                entries.push(DirEntry {
                    name: Utf8PathBuf::from(name),
                    metadata: metadata_from(&metadata),
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            Ok(entries)
        })
        .await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), Error> {
        let from = rooted(from)?;
        let to = rooted(to)?;
        let root = self.root()?;

        run_blocking(move || {
            root.rename(&from, &root, &to)
                .into_io_error("failed to rename")
        })
        .await
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let metadata = root
                .symlink_metadata(&rel)
                .into_io_error(format!("failed to stat {rel}"))?;

            if metadata.is_dir() {
                root.remove_dir(&rel).into_io_error("failed to remove directory")
            } else {
                root.remove_file(&rel).into_io_error("failed to remove file")
            }
        })
        .await
    }

    async fn remove_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let metadata = match root.symlink_metadata(&rel) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err).into_io_error(format!("failed to stat {rel}")),
            };

            if metadata.is_dir() {
                root.remove_dir_all(&rel)
                    .into_io_error("failed to remove directory tree")
            } else {
                root.remove_file(&rel).into_io_error("failed to remove file")
            }
        })
        .await
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            root.create_dir(&rel)
                .into_io_error("failed to create directory")
        })
        .await
    }

    async fn mkdir_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            root.create_dir_all(&rel)
                .into_io_error("failed to create directories")
        })
        .await
    }

    async fn set_times(
        &self,
        path: &Utf8Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Error> {
        use cap_primitives::fs::SystemTimeSpec;

        fn convert(time: SystemTime) -> SystemTimeSpec {
            SystemTimeSpec::Absolute(cap_primitives::time::SystemTime::from_std(time))
        }

        let rel = rooted(path)?;
        let root = self.root()?;
        let atime = atime.map(convert);
        let mtime = mtime.map(convert);

        run_blocking(move || {
            root.set_times(&rel, atime, mtime)
                .into_io_error("failed to set times")
        })
        .await
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> Result<(), Error> {
        let rel = rooted(path)?;
        let root = self.root()?;

        run_blocking(move || {
            let perms =
                cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(mode));
            root.set_permissions(&rel, perms)
                .into_io_error("failed to set permissions")
        })
        .await
    }

    async fn set_owner(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<(), Error> {
        let rel = rooted(path)?;
        let host_path = self.root_path.join(&rel);

        run_blocking(move || {
            std::os::unix::fs::chown(&host_path, Some(uid), Some(gid))
                .into_io_error("failed to change owner")
        })
        .await
    }
}

struct LocalFile {
    file: tokio::fs::File,
    path: Utf8PathBuf,
}

#[async_trait]
impl File for LocalFile {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(len);

        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .into_io_error("failed to seek file")?;

        let bytes_read = (&mut self.file)
            .take(len as u64)
            .read_to_end(&mut buf)
            .await
            .into_io_error("failed to read file")?;

        if bytes_read == 0 && len != 0 {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .into_io_error("failed to seek file")?;
        self.file
            .write_all(data)
            .await
            .into_io_error("failed to write file")?;

        Ok(())
    }

    async fn metadata(&self) -> Result<Metadata, Error> {
        let metadata = self
            .file
            .metadata()
            .await
            .into_io_error("failed to get file metadata")?;

        let kind = if metadata.is_dir() {
            FileKind::Dir
        } else if metadata.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };

        Ok(Metadata {
            kind,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            mode: Some(metadata.permissions().mode()),
        })
    }

    async fn sync(&mut self) -> Result<(), Error> {
        self.file
            .sync_all()
            .await
            .into_io_error("failed to sync file")?;

        Ok(())
    }
}
