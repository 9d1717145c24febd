use std::{
    io,
    sync::Arc,
    time::SystemTime,
};

use ahash::HashMap;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;

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

/// An in-memory store. Porter uses one as the root of the mount table when
/// no other root is configured, and the tests use it everywhere a scripted
/// backend is needed.
///
/// Cloning is cheap and clones share the same tree, so a fixture can keep
/// writing through its own handle after mounting a clone.
#[derive(Clone)]
pub struct MemStore {
    nodes: Arc<RwLock<HashMap<Utf8PathBuf, Node>>>,
}

enum Node {
    File {
        data: Vec<u8>,
        mtime: SystemTime,
        mode: u32,
    },
    Dir {
        mtime: SystemTime,
        mode: u32,
    },
}

impl Node {
    fn metadata(&self) -> Metadata {
        match self {
            Node::File { data, mtime, mode } => Metadata {
                kind: FileKind::File,
                size: data.len() as u64,
                mtime: Some(*mtime),
                mode: Some(*mode),
            },
            Node::Dir { mtime, mode } => Metadata {
                kind: FileKind::Dir,
                size: 0,
                mtime: Some(*mtime),
                mode: Some(*mode),
            },
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        let mut nodes = HashMap::default();
        nodes.insert(
            Utf8PathBuf::from("/"),
            Node::Dir {
                mtime: SystemTime::now(),
                mode: 0o777,
            },
        );

        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Writes `data` to `path`, creating parent directories as needed.
    /// Fixture helper; the serving path goes through [`Store::open_with`].
    pub fn write_file(&self, path: impl AsRef<Utf8Path>, data: &[u8]) -> Result<(), Error> {
        let path = absolute(path.as_ref())?;
        let mut nodes = self.nodes.write();

        ensure_parents(&mut nodes, &path)?;
        nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                mtime: SystemTime::now(),
                mode: 0o644,
            },
        );

        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_parents(
    nodes: &mut HashMap<Utf8PathBuf, Node>,
    path: &Utf8Path,
) -> Result<(), Error> {
    let mut missing = Vec::new();
    let mut cursor = path.parent();

    while let Some(dir) = cursor {
        match nodes.get(dir) {
            Some(Node::Dir { .. }) => break,
            Some(Node::File { .. }) => return Err(Error::NotADirectory(dir.to_owned())),
            None => missing.push(dir.to_owned()),
        }
        cursor = dir.parent();
    }

    for dir in missing {
        nodes.insert(
            dir,
            Node::Dir {
                mtime: SystemTime::now(),
                mode: 0o777,
            },
        );
    }

    Ok(())
}

#[async_trait]
impl Store for MemStore {
    fn kind(&self) -> &'static str {
        "mem"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        match nodes.get_mut(&path) {
            Some(Node::File { data, mtime, .. }) => {
                if flags.contains(OpenFlags::EXCLUSIVE) {
                    return Err(Error::AlreadyExists(path));
                }
                if flags.contains(OpenFlags::TRUNCATE) {
                    data.clear();
                    *mtime = SystemTime::now();
                }
            }
            Some(Node::Dir { .. }) => return Err(Error::NotAFile(path)),
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(Error::NotFound(path));
                }
                ensure_parents(&mut nodes, &path)?;
                nodes.insert(
                    path.clone(),
                    Node::File {
                        data: Vec::new(),
                        mtime: SystemTime::now(),
                        mode: 0o644,
                    },
                );
            }
        }

        Ok(Box::new(MemFile {
            nodes: self.nodes.clone(),
            path,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let path = absolute(path)?;
        let nodes = self.nodes.read();

        nodes
            .get(&path)
            .map(Node::metadata)
            .ok_or(Error::NotFound(path))
    }

    async fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        let path = absolute(path)?;
        let nodes = self.nodes.read();

        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(Error::NotADirectory(path)),
            None => return Err(Error::NotFound(path)),
        }

        let mut entries: Vec<DirEntry> = nodes
            .iter()
            .filter(|(child, _)| child.parent() == Some(path.as_path()))
            .map(|(child, node)| DirEntry {
                name: child.file_name().unwrap_or_default().into(),
                metadata: node.metadata(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(entries)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), Error> {
        let from = absolute(from)?;
        let to = absolute(to)?;
        let mut nodes = self.nodes.write();

        if !nodes.contains_key(&from) {
            return Err(Error::NotFound(from));
        }
        ensure_parents(&mut nodes, &to)?;

        let moved: Vec<(Utf8PathBuf, Utf8PathBuf)> = nodes
            .keys()
            .filter(|key| *key == &from || key.starts_with(&from))
            .map(|key| {
                let renamed = match key.strip_prefix(&from) {
                    Ok(suffix) if !suffix.as_str().is_empty() => to.join(suffix),
                    _ => to.clone(),
                };
                (key.clone(), renamed)
            })
            .collect();

        for (old, new) in moved {
            if let Some(node) = nodes.remove(&old) {
                nodes.insert(new, node);
            }
        }

        Ok(())
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        match nodes.get(&path) {
            None => return Err(Error::NotFound(path)),
            Some(Node::Dir { .. }) => {
                let occupied = nodes
                    .keys()
                    .any(|key| key.parent() == Some(path.as_path()));
                if occupied {
                    return Err(io::Error::from(io::ErrorKind::DirectoryNotEmpty))
                        .into_io_error(path.to_string());
                }
            }
            Some(Node::File { .. }) => {}
        }

        nodes.remove(&path);
        Ok(())
    }

    async fn remove_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        nodes.retain(|key, _| key != &path && !key.starts_with(&path));
        Ok(())
    }

    async fn mkdir(&self, path: &Utf8Path) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        if nodes.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }
        match path.parent().map(|parent| nodes.get(parent)) {
            Some(Some(Node::Dir { .. })) => {}
            Some(Some(Node::File { .. })) | Some(None) => {
                return Err(Error::NotADirectory(path.parent().unwrap().to_owned()));
            }
            None => {}
        }

        nodes.insert(
            path,
            Node::Dir {
                mtime: SystemTime::now(),
                mode: 0o777,
            },
        );
        Ok(())
    }

    async fn mkdir_all(&self, path: &Utf8Path) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        match nodes.get(&path) {
            Some(Node::Dir { .. }) => return Ok(()),
            Some(Node::File { .. }) => return Err(Error::NotADirectory(path)),
            None => {}
        }

        ensure_parents(&mut nodes, &path)?;
        nodes.insert(
            path,
            Node::Dir {
                mtime: SystemTime::now(),
                mode: 0o777,
            },
        );
        Ok(())
    }

    async fn set_times(
        &self,
        path: &Utf8Path,
        _atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        match nodes.get_mut(&path) {
            Some(Node::File { mtime: slot, .. } | Node::Dir { mtime: slot, .. }) => {
                if let Some(mtime) = mtime {
                    *slot = mtime;
                }
                Ok(())
            }
            None => Err(Error::NotFound(path)),
        }
    }

    async fn set_mode(&self, path: &Utf8Path, mode: u32) -> Result<(), Error> {
        let path = absolute(path)?;
        let mut nodes = self.nodes.write();

        match nodes.get_mut(&path) {
            Some(Node::File { mode: slot, .. } | Node::Dir { mode: slot, .. }) => {
                *slot = mode;
                Ok(())
            }
            None => Err(Error::NotFound(path)),
        }
    }

    async fn set_owner(&self, path: &Utf8Path, _uid: u32, _gid: u32) -> Result<(), Error> {
        let path = absolute(path)?;
        let nodes = self.nodes.read();

        // Ownership is not modeled in memory; existence is still checked so
        // callers observe the same not-found behavior as other stores.
        if nodes.contains_key(&path) {
            Ok(())
        } else {
            Err(Error::NotFound(path))
        }
    }
}

struct MemFile {
    nodes: Arc<RwLock<HashMap<Utf8PathBuf, Node>>>,
    path: Utf8PathBuf,
}

#[async_trait]
impl File for MemFile {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let nodes = self.nodes.read();

        let Some(Node::File { data, .. }) = nodes.get(&self.path) else {
            return Err(Error::NotFound(self.path.clone()));
        };

        let offset = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
            .into_io_error("read offset out of range")?;
        if offset >= data.len() && len != 0 {
            return Ok(None);
        }

        let end = data.len().min(offset + len);
        Ok(Some(data[offset..end].to_vec()))
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let mut nodes = self.nodes.write();

        let Some(Node::File { data, mtime, .. }) = nodes.get_mut(&self.path) else {
            return Err(Error::NotFound(self.path.clone()));
        };

        let offset = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
            .into_io_error("write offset out of range")?;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        *mtime = SystemTime::now();

        Ok(())
    }

    async fn metadata(&self) -> Result<Metadata, Error> {
        let nodes = self.nodes.read();

        nodes
            .get(&self.path)
            .map(Node::metadata)
            .ok_or(Error::NotFound(self.path.clone()))
    }

    async fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(file: &mut Box<dyn File>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        while let Some(chunk) = file.read_at(offset, 8192).await.unwrap() {
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let store = MemStore::new();
        store.write_file("/a/file.txt", b"contents").unwrap();

        let mut file = store.open(Utf8Path::new("/a/file.txt")).await.unwrap();
        assert_eq!(read_all(&mut file).await, b"contents");

        let meta = store.stat(Utf8Path::new("/a")).await.unwrap();
        assert!(meta.is_dir());
    }

    #[tokio::test]
    async fn read_past_eof_is_none() {
        let store = MemStore::new();
        store.write_file("/f", b"abc").unwrap();

        let mut file = store.open(Utf8Path::new("/f")).await.unwrap();
        assert_eq!(file.read_at(0, 2).await.unwrap().unwrap(), b"ab");
        assert_eq!(file.read_at(2, 8).await.unwrap().unwrap(), b"c");
        assert!(file.read_at(3, 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exclusive_create_refuses_existing() {
        let store = MemStore::new();
        store.write_file("/f", b"old").unwrap();

        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
        let err = store.open_with(Utf8Path::new("/f"), flags).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn remove_refuses_occupied_dir() {
        let store = MemStore::new();
        store.write_file("/d/f", b"x").unwrap();

        assert!(store.remove(Utf8Path::new("/d")).await.is_err());
        store.remove_all(Utf8Path::new("/d")).await.unwrap();
        assert!(store.stat(Utf8Path::new("/d")).await.is_err());
    }

    #[tokio::test]
    async fn rename_moves_subtree() {
        let store = MemStore::new();
        store.write_file("/d/f", b"x").unwrap();

        store
            .rename(Utf8Path::new("/d"), Utf8Path::new("/e"))
            .await
            .unwrap();
        assert!(store.stat(Utf8Path::new("/e/f")).await.is_ok());
        assert!(store.stat(Utf8Path::new("/d/f")).await.is_err());
    }

    #[tokio::test]
    async fn read_dir_lists_direct_children() {
        let store = MemStore::new();
        store.write_file("/d/a.txt", b"1").unwrap();
        store.write_file("/d/sub/b.txt", b"2").unwrap();

        let entries = store.read_dir(Utf8Path::new("/d")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "sub"]);
    }
}
