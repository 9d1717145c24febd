use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{event, Level};

use super::{DirEntry, Error, File, Metadata, OpenFlags, Store};

/// A decorator that logs every operation and its outcome at DEBUG level.
/// Enabled per store with `--debug`; the stores themselves never log.
pub struct Traced {
    inner: Arc<dyn Store>,
}

impl Traced {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }

    fn outcome<T>(&self, op: &'static str, path: &Utf8Path, result: &Result<T, Error>) {
        match result {
            Ok(_) => event!(Level::DEBUG, store = self.inner.kind(), op, %path, "ok"),
            Err(err) => {
                event!(Level::DEBUG, store = self.inner.kind(), op, %path, %err, "failed");
            }
        }
    }
}

#[async_trait]
impl Store for Traced {
    fn kind(&self) -> &'static str {
        "traced"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        let result = self.inner.open_with(path, flags).await;
        match &result {
            Ok(_) => {
                event!(
                    Level::DEBUG,
                    store = self.inner.kind(),
                    op = "open",
                    %path,
                    writes = flags.writes(),
                    "ok"
                );
            }
            Err(err) => {
                event!(
                    Level::DEBUG,
                    store = self.inner.kind(),
                    op = "open",
                    %path,
                    writes = flags.writes(),
                    %err,
                    "failed"
                );
            }
        }

        result.map(|file| {
            let path = file.path().to_owned();
            Box::new(TracedFile { inner: file, path }) as Box<dyn File>
        })
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let result = self.inner.stat(path).await;
        self.outcome("stat", path, &result);
        result
    }

    async fn stat_link(&self, path: &Utf8Path) -> Result<(Metadata, bool), Error> {
        let result = self.inner.stat_link(path).await;
        self.outcome("stat_link", path, &result);
        result
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        let result = self.inner.read_dir(path).await;
        self.outcome("read_dir", path, &result);
        result
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), Error> {
        let result = self.inner.rename(from, to).await;
        match &result {
            Ok(()) => {
                event!(Level::DEBUG, store = self.inner.kind(), op = "rename", %from, %to, "ok");
            }
            Err(err) => {
                event!(
                    Level::DEBUG,
                    store = self.inner.kind(),
                    op = "rename",
                    %from,
                    %to,
                    %err,
                    "failed"
                );
            }
        }
        result
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), Error> {
        let result = self.inner.remove(path).await;
        self.outcome("remove", path, &result);
        result
    }

    async fn remove_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let result = self.inner.remove_all(path).await;
        self.outcome("remove_all", path, &result);
        result
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), Error> {
        let result = self.inner.mkdir(path).await;
        self.outcome("mkdir", path, &result);
        result
    }

    async fn mkdir_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let result = self.inner.mkdir_all(path).await;
        self.outcome("mkdir_all", path, &result);
        result
    }

    async fn set_times(
        &self,
        path: &Utf8Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Error> {
        let result = self.inner.set_times(path, atime, mtime).await;
        self.outcome("set_times", path, &result);
        result
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> Result<(), Error> {
        let result = self.inner.set_mode(path, mode).await;
        self.outcome("set_mode", path, &result);
        result
    }

    async fn set_owner(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<(), Error> {
        let result = self.inner.set_owner(path, uid, gid).await;
        self.outcome("set_owner", path, &result);
        result
    }
}

struct TracedFile {
    inner: Box<dyn File>,
    path: Utf8PathBuf,
}

#[async_trait]
impl File for TracedFile {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let result = self.inner.read_at(offset, len).await;
        match &result {
            Ok(Some(chunk)) => event!(
                Level::DEBUG,
                path = %self.path,
                offset,
                read = chunk.len(),
                "read"
            ),
            Ok(None) => event!(Level::DEBUG, path = %self.path, offset, "read eof"),
            Err(err) => event!(Level::DEBUG, path = %self.path, offset, %err, "read failed"),
        }
        result
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let result = self.inner.write_at(offset, data).await;
        match &result {
            Ok(()) => event!(
                Level::DEBUG,
                path = %self.path,
                offset,
                wrote = data.len(),
                "write"
            ),
            Err(err) => event!(Level::DEBUG, path = %self.path, offset, %err, "write failed"),
        }
        result
    }

    async fn metadata(&self) -> Result<Metadata, Error> {
        self.inner.metadata().await
    }

    async fn sync(&mut self) -> Result<(), Error> {
        let result = self.inner.sync().await;
        if let Err(err) = &result {
            event!(Level::DEBUG, path = %self.path, %err, "sync failed");
        }
        result
    }
}
