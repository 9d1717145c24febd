//! Porter composes several independent storage backends into one namespace
//! before anything is served over the network. The pieces:
//!
//! - [`Store`], the capability set every backend implements (open, stat,
//!   remove, rename, mkdir, attribute changes) over its own rooted
//!   namespace;
//! - backends: [`LocalDir`], [`S3Store`], [`HttpTree`], [`MemStore`];
//! - decorators: [`ReadOnly`] and [`Traced`], wrapped around a backend
//!   before it is mounted;
//! - [`MountTable`], which binds backends to path prefixes and is itself a
//!   [`Store`], so the composed namespace plugs in anywhere a single
//!   backend would.

use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use path_absolutize::Absolutize as _;

mod by_url;
mod error;
mod http_tree;
mod local_dir;
mod mem;
mod mount;
mod read_only;
mod s3;
mod store_trait;
mod traced;

pub use by_url::store_for_url;
pub use error::Error;
pub use http_tree::HttpTree;
pub use local_dir::LocalDir;
pub use mem::MemStore;
pub use mount::MountTable;
pub use read_only::ReadOnly;
pub use s3::S3Store;
pub use store_trait::*;
pub use traced::Traced;

/// Normalizes a path to its absolute, `/`-rooted form. Relative paths are
/// taken as relative to the root, `.`/`..` segments are resolved, and
/// trailing separators are dropped, so two spellings of the same location
/// always compare equal.
pub(crate) fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf, Error> {
    if path.as_str().is_empty() {
        return Ok(Utf8PathBuf::from("/"));
    }

    let normalized = Path::new(path.as_str())
        .absolutize_from("/")
        .map_err(|_| Error::InvalidPath(path.to_owned()))?;

    Utf8PathBuf::from_path_buf(normalized.into_owned())
        .map_err(|_| Error::InvalidPath(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_roots_and_cleans() {
        for (given, want) in [
            ("", "/"),
            ("/", "/"),
            ("a/b", "/a/b"),
            ("/a/b/", "/a/b"),
            ("/a/./b", "/a/b"),
            ("/a/../b", "/b"),
            ("../x", "/x"),
        ] {
            assert_eq!(absolute(Utf8Path::new(given)).unwrap(), Utf8Path::new(want));
        }
    }
}
