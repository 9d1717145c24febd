use std::{sync::Arc, time::SystemTime};

use ahash::{HashMap, HashSet};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;

use super::{absolute, DirEntry, Error, File, Metadata, OpenFlags, Store};

/// The overlay mount table: an ordered collection of path-prefix → backend
/// bindings composed into one namespace.
///
/// Several stores may be mounted at the same prefix; they form a stack and
/// the most recently mounted one shadows the rest until it is unmounted
/// again. Overlapping prefixes resolve to the longest match, so a mount at
/// `/a` wins over a mount at `/` for everything under `/a`.
///
/// The table is itself a [`Store`]: every operation resolves its path to
/// the active backend and delegates with the backend-relative remainder.
/// Paths that match no mount fall through to the base store, which is also
/// where mount-point directories are synthesized when a store is mounted at
/// a path that does not exist yet.
pub struct MountTable {
    base: Arc<dyn Store>,
    inner: RwLock<TableState>,
}

struct TableState {
    /// Mount stacks keyed by the exact normalized prefix. Every stack in
    /// the map is non-empty.
    stacks: HashMap<Utf8PathBuf, Vec<Arc<dyn Store>>>,
    /// The stack keys, longest first. Resolution scans this in order, so
    /// the first hit is the most specific one.
    prefixes: Vec<Utf8PathBuf>,
    /// Prefixes whose directory the table created on the base store at
    /// mount time. Removed again when the last mount at that prefix goes.
    synthetic: HashSet<Utf8PathBuf>,
}

impl MountTable {
    pub fn new(base: Arc<dyn Store>) -> Self {
        Self {
            base,
            inner: RwLock::new(TableState {
                stacks: HashMap::default(),
                prefixes: Vec::new(),
                synthetic: HashSet::default(),
            }),
        }
    }

    /// Binds `store` to `path`, shadowing any store already mounted there.
    ///
    /// If no directory exists at `path` on the base store, one is created
    /// recursively and remembered so the final unmount can take it back
    /// out. A base-store failure aborts the mount without touching table
    /// state.
    pub async fn mount(&self, store: Arc<dyn Store>, path: &Utf8Path) -> Result<(), Error> {
        let prefix = absolute(path)?;

        let dir_exists = match self.base.stat(&prefix).await {
            Ok(metadata) => metadata.is_dir(),
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        };
        if !dir_exists {
            self.base.mkdir_all(&prefix).await?;
        }

        let mut inner = self.inner.write();
        if !inner.stacks.contains_key(&prefix) {
            let at = inner
                .prefixes
                .partition_point(|p| p.as_str().len() > prefix.as_str().len());
            inner.prefixes.insert(at, prefix.clone());
        }
        if !dir_exists {
            inner.synthetic.insert(prefix.clone());
        }
        inner.stacks.entry(prefix).or_default().push(store);

        Ok(())
    }

    /// Unbinds the most recent store at `path`. When that empties the
    /// stack, the prefix leaves the table and a synthesized mount-point
    /// directory is deleted from the base store.
    ///
    /// The bookkeeping commits before the directory deletion: if the
    /// deletion fails the error is surfaced, but the prefix is already
    /// unmounted and will not resolve again.
    pub async fn unmount(&self, path: &Utf8Path) -> Result<(), Error> {
        let prefix = absolute(path)?;

        let cleanup = {
            let mut inner = self.inner.write();

            let Some(stack) = inner.stacks.get_mut(&prefix) else {
                return Err(Error::NotMounted(prefix));
            };
            stack.pop();
            if !stack.is_empty() {
                return Ok(());
            }

            inner.stacks.remove(&prefix);
            inner.prefixes.retain(|p| p != &prefix);
            inner.synthetic.remove(&prefix)
        };

        if cleanup {
            self.base.remove(&prefix).await?;
        }

        Ok(())
    }

    /// Resolves a namespace path to the active store for it and the
    /// backend-relative remainder. Falls through to the base store when no
    /// prefix matches. Deterministic and side-effect-free; this is the
    /// single routing authority for every delegated operation.
    pub fn resolve(&self, path: &Utf8Path) -> Result<(Utf8PathBuf, Arc<dyn Store>), Error> {
        let path = absolute(path)?;
        let inner = self.inner.read();

        for prefix in &inner.prefixes {
            let Some(stack) = inner.stacks.get(prefix) else {
                continue;
            };
            let Some(store) = stack.last() else {
                continue;
            };
            if path.as_str().starts_with(prefix.as_str()) {
                let remainder = &path.as_str()[prefix.as_str().len()..];
                let relative = absolute(Utf8Path::new(remainder))?;
                return Ok((relative, store.clone()));
            }
        }

        Ok((path, self.base.clone()))
    }

    #[cfg(test)]
    pub(crate) fn ordered_prefixes(&self) -> Vec<Utf8PathBuf> {
        self.inner.read().prefixes.clone()
    }
}

/// A file opened through the table. Reports the namespace path the client
/// asked for, not the backend-relative one the backend saw.
struct MountFile {
    inner: Box<dyn File>,
    path: Utf8PathBuf,
}

#[async_trait]
impl File for MountFile {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.inner.write_at(offset, data).await
    }

    async fn metadata(&self) -> Result<Metadata, Error> {
        self.inner.metadata().await
    }

    async fn sync(&mut self) -> Result<(), Error> {
        self.inner.sync().await
    }
}

#[async_trait]
impl Store for MountTable {
    fn kind(&self) -> &'static str {
        "mount"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        let full = absolute(path)?;
        let (relative, store) = self.resolve(&full)?;
        let inner = store.open_with(&relative, flags).await?;

        Ok(Box::new(MountFile { inner, path: full }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let (relative, store) = self.resolve(path)?;
        store.stat(&relative).await
    }

    async fn stat_link(&self, path: &Utf8Path) -> Result<(Metadata, bool), Error> {
        let (relative, store) = self.resolve(path)?;
        match store.stat_link(&relative).await {
            Err(err) if err.is_unsupported() => {
                let metadata = self.base.stat(&absolute(path)?).await?;
                Ok((metadata, false))
            }
            other => other,
        }
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        let (relative, store) = self.resolve(path)?;
        store.read_dir(&relative).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), Error> {
        let (from_relative, from_store) = self.resolve(from)?;
        let (to_relative, to_store) = self.resolve(to)?;

        if !Arc::ptr_eq(&from_store, &to_store) {
            return Err(Error::CrossStore {
                from: absolute(from)?,
                to: absolute(to)?,
            });
        }

        from_store.rename(&from_relative, &to_relative).await
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.remove(&relative).await
    }

    async fn remove_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.remove_all(&relative).await
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.mkdir(&relative).await
    }

    async fn mkdir_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.mkdir_all(&relative).await
    }

    async fn set_times(
        &self,
        path: &Utf8Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.set_times(&relative, atime, mtime).await
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.set_mode(&relative, mode).await
    }

    async fn set_owner(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<(), Error> {
        let (relative, store) = self.resolve(path)?;
        store.set_owner(&relative, uid, gid).await
    }
}

#[cfg(test)]
mod tests {
    use super::{super::MemStore, *};

    async fn read_string(store: &dyn Store, path: &str) -> Result<String, Error> {
        let mut file = store.open(Utf8Path::new(path)).await?;
        let mut out = Vec::new();
        let mut offset = 0u64;
        while let Some(chunk) = file.read_at(offset, 8192).await? {
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8(out).expect("fixture content is utf-8"))
    }

    fn mem_with(path: &str, content: &str) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        store.write_file(path, content.as_bytes()).unwrap();
        store
    }

    #[tokio::test]
    async fn stacked_mounts_shadow_and_revert() {
        let mem1 = mem_with("/a/file.txt", "/a/file.txt: memfs1");
        let mem2 = mem_with("/a/file.txt", "/a/file.txt: memfs2");

        let table = MountTable::new(Arc::new(MemStore::new()));
        assert!(read_string(&table, "/a/file.txt").await.is_err());

        table.mount(mem1, Utf8Path::new("/")).await.unwrap();
        assert_eq!(
            read_string(&table, "/a/file.txt").await.unwrap(),
            "/a/file.txt: memfs1"
        );

        table.mount(mem2, Utf8Path::new("/")).await.unwrap();
        assert_eq!(
            read_string(&table, "/a/file.txt").await.unwrap(),
            "/a/file.txt: memfs2"
        );

        table.unmount(Utf8Path::new("/")).await.unwrap();
        assert_eq!(
            read_string(&table, "/a/file.txt").await.unwrap(),
            "/a/file.txt: memfs1"
        );

        table.unmount(Utf8Path::new("/")).await.unwrap();
        assert!(read_string(&table, "/a/file.txt").await.is_err());

        let err = table.unmount(Utf8Path::new("/")).await.unwrap_err();
        assert!(matches!(err, Error::NotMounted(_)));
    }

    #[tokio::test]
    async fn overlapping_mounts_route_longest_prefix() {
        let mem1 = mem_with("/a/file.txt", "/a/file.txt: memfs1");
        let mem2 = mem_with("/a/file.txt", "/a/file.txt: memfs2");

        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem1.clone(), Utf8Path::new("/")).await.unwrap();
        table.mount(mem2.clone(), Utf8Path::new("/a")).await.unwrap();

        assert_eq!(
            read_string(&table, "/a/a/file.txt").await.unwrap(),
            "/a/file.txt: memfs2"
        );

        let (relative, store) = table.resolve(Utf8Path::new("/a/x")).unwrap();
        assert_eq!(relative, Utf8Path::new("/x"));
        assert!(Arc::ptr_eq(&store, &(mem2 as Arc<dyn Store>)));

        let (relative, store) = table.resolve(Utf8Path::new("/y")).unwrap();
        assert_eq!(relative, Utf8Path::new("/y"));
        assert!(Arc::ptr_eq(&store, &(mem1 as Arc<dyn Store>)));
    }

    #[tokio::test]
    async fn synthetic_mount_dir_created_and_removed() {
        let mem1 = mem_with("/file.txt", "/file.txt: memfs1");
        let table = MountTable::new(Arc::new(MemStore::new()));

        assert!(table.stat(Utf8Path::new("/sub")).await.is_err());

        table.mount(mem1, Utf8Path::new("/sub")).await.unwrap();
        let metadata = table.stat(Utf8Path::new("/sub")).await.unwrap();
        assert!(metadata.is_dir());

        table.unmount(Utf8Path::new("/sub")).await.unwrap();
        assert!(table.stat(Utf8Path::new("/sub")).await.is_err());
    }

    #[tokio::test]
    async fn preexisting_mount_dir_survives_unmount() {
        let base = Arc::new(MemStore::new());
        base.write_file("/a/keep", b"").unwrap();

        let mem1 = mem_with("/file.txt", "/file.txt: memfs1");
        let table = MountTable::new(base.clone());

        table.mount(mem1, Utf8Path::new("/a")).await.unwrap();
        table.unmount(Utf8Path::new("/a")).await.unwrap();

        let metadata = base.stat(Utf8Path::new("/a")).await.unwrap();
        assert!(metadata.is_dir());
    }

    #[tokio::test]
    async fn partial_unmount_keeps_synthetic_dir() {
        let base = Arc::new(MemStore::new());
        let table = MountTable::new(base.clone());

        table
            .mount(Arc::new(MemStore::new()), Utf8Path::new("/sub"))
            .await
            .unwrap();
        table
            .mount(Arc::new(MemStore::new()), Utf8Path::new("/sub"))
            .await
            .unwrap();

        table.unmount(Utf8Path::new("/sub")).await.unwrap();
        assert!(base.stat(Utf8Path::new("/sub")).await.unwrap().is_dir());

        table.unmount(Utf8Path::new("/sub")).await.unwrap();
        assert!(base.stat(Utf8Path::new("/sub")).await.is_err());
    }

    #[tokio::test]
    async fn overlapping_mount_points_both_stat_as_dirs() {
        let table = MountTable::new(Arc::new(MemStore::new()));

        table
            .mount(Arc::new(MemStore::new()), Utf8Path::new("/"))
            .await
            .unwrap();
        table
            .mount(Arc::new(MemStore::new()), Utf8Path::new("/a"))
            .await
            .unwrap();

        assert!(table.stat(Utf8Path::new("/a")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn prefixes_stay_sorted_longest_first() {
        let table = MountTable::new(Arc::new(MemStore::new()));

        for path in ["/bb", "/ccc", "/a"] {
            table
                .mount(Arc::new(MemStore::new()), Utf8Path::new(path))
                .await
                .unwrap();
        }

        assert_eq!(
            table.ordered_prefixes(),
            vec![
                Utf8PathBuf::from("/ccc"),
                Utf8PathBuf::from("/bb"),
                Utf8PathBuf::from("/a"),
            ]
        );
    }

    #[tokio::test]
    async fn rename_across_stores_is_rejected() {
        let mem1 = mem_with("/file.txt", "content");
        let mem2 = Arc::new(MemStore::new());

        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem1.clone(), Utf8Path::new("/one")).await.unwrap();
        table.mount(mem2, Utf8Path::new("/two")).await.unwrap();

        let err = table
            .rename(Utf8Path::new("/one/file.txt"), Utf8Path::new("/two/file.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossStore { .. }));

        table
            .rename(Utf8Path::new("/one/file.txt"), Utf8Path::new("/one/renamed.txt"))
            .await
            .unwrap();
        assert!(mem1.stat(Utf8Path::new("/renamed.txt")).await.is_ok());
        assert!(mem1.stat(Utf8Path::new("/file.txt")).await.is_err());
    }

    #[tokio::test]
    async fn handles_report_namespace_paths() {
        let mem1 = mem_with("/file.txt", "content");
        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem1, Utf8Path::new("/a")).await.unwrap();

        let file = table.open(Utf8Path::new("/a/file.txt")).await.unwrap();
        assert_eq!(file.path(), Utf8Path::new("/a/file.txt"));
    }

    #[tokio::test]
    async fn stat_link_falls_back_to_base_stat() {
        let base = Arc::new(MemStore::new());
        base.write_file("/g", b"on base").unwrap();

        let table = MountTable::new(base);
        let (metadata, link_aware) = table.stat_link(Utf8Path::new("/g")).await.unwrap();
        assert!(!link_aware);
        assert_eq!(metadata.size, 7);

        // A mounted store without stat_link support falls back to the base
        // store under the original path, which does not have the file.
        let mem1 = mem_with("/f", "on mount");
        table.mount(mem1, Utf8Path::new("/m")).await.unwrap();
        assert!(table.stat_link(Utf8Path::new("/m/f")).await.is_err());
    }

    #[tokio::test]
    async fn writes_through_the_facade_reach_the_active_mount() {
        let mem1 = Arc::new(MemStore::new());
        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem1.clone(), Utf8Path::new("/up")).await.unwrap();

        let mut file = table
            .create(Utf8Path::new("/up/new.txt"))
            .await
            .unwrap();
        file.write_at(0, b"uploaded").await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(read_string(mem1.as_ref(), "/new.txt").await.unwrap(), "uploaded");
    }
}
