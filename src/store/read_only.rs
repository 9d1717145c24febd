use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use camino::Utf8Path;

use super::{DirEntry, Error, File, Metadata, OpenFlags, Store};

/// A decorator that rejects every mutation with [`Error::ReadOnly`].
///
/// Read-only enforcement is applied per store, before mounting; the mount
/// table never knows about it. This is how porter serves everything
/// read-only by default while still letting one writable store be mounted
/// next to read-only ones.
pub struct ReadOnly {
    inner: Arc<dyn Store>,
}

impl ReadOnly {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for ReadOnly {
    fn kind(&self) -> &'static str {
        "read-only"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        if flags.writes() {
            return Err(Error::ReadOnly);
        }

        self.inner.open_with(path, flags).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        self.inner.stat(path).await
    }

    async fn stat_link(&self, path: &Utf8Path) -> Result<(Metadata, bool), Error> {
        self.inner.stat_link(path).await
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        self.inner.read_dir(path).await
    }

    async fn rename(&self, _from: &Utf8Path, _to: &Utf8Path) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn remove(&self, _path: &Utf8Path) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn remove_all(&self, _path: &Utf8Path) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn mkdir(&self, _path: &Utf8Path) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn mkdir_all(&self, _path: &Utf8Path) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn set_times(
        &self,
        _path: &Utf8Path,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn set_mode(&self, _path: &Utf8Path, _mode: u32) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn set_owner(&self, _path: &Utf8Path, _uid: u32, _gid: u32) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::{super::MemStore, *};

    #[tokio::test]
    async fn reads_pass_and_writes_fail() {
        let mem = Arc::new(MemStore::new());
        mem.write_file("/f", b"data").unwrap();
        let store = ReadOnly::new(mem);

        assert!(store.open(Utf8Path::new("/f")).await.is_ok());
        assert!(store.stat(Utf8Path::new("/f")).await.is_ok());

        assert!(matches!(
            store.create(Utf8Path::new("/g")).await.unwrap_err(),
            Error::ReadOnly
        ));
        assert!(matches!(
            store.remove(Utf8Path::new("/f")).await.unwrap_err(),
            Error::ReadOnly
        ));
        assert!(matches!(
            store.mkdir(Utf8Path::new("/d")).await.unwrap_err(),
            Error::ReadOnly
        ));
    }
}
