use std::sync::Arc;

use camino::Utf8PathBuf;
use url::Url;

use super::{Error, HttpTree, LocalDir, MemStore, S3Store, Store};

/// Builds a store from a URL, dispatching on the scheme:
///
/// - `file://<path>` — a [`LocalDir`] rooted at the path;
/// - `s3://<access>:<secret>@<endpoint>/<region>/<bucket>` — an [`S3Store`];
/// - `http://` / `https://` — a read-only [`HttpTree`];
/// - `mem://` — an empty [`MemStore`].
pub fn store_for_url(url: &Url) -> Result<Arc<dyn Store>, Error> {
    match url.scheme() {
        "file" => {
            // file://relative/dir parses with "relative" as the host; a
            // rooted file:///abs/path has no host at all.
            let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
            Ok(Arc::new(LocalDir::new(Utf8PathBuf::from(path))?))
        }
        "s3" => Ok(Arc::new(S3Store::from_url(url)?)),
        "http" | "https" => Ok(Arc::new(HttpTree::new(url.clone())?)),
        "mem" => Ok(Arc::new(MemStore::new())),
        _ => Err(Error::UnknownScheme(url.to_string())),
    }
}
