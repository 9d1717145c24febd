use std::time::SystemTime;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::DateTime;
use http::StatusCode;
use reqwest::Client;
use url::Url;

use super::{absolute, DirEntry, Error, File, FileKind, Metadata, OpenFlags, Store};

/// A read-only store backed by a remote HTTP tree. `stat` is a HEAD
/// request, reads are GETs with a `Range` header (with a local fallback
/// when the remote ignores ranges). Listings and every mutation are
/// unsupported, matching what a plain HTTP tree can express.
pub struct HttpTree {
    base: Url,
    client: Client,
}

impl HttpTree {
    pub fn new(base: Url) -> Result<Self, Error> {
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(base.to_string()));
        }

        Ok(Self {
            base,
            client: Client::new(),
        })
    }

    fn url_for(&self, path: &Utf8Path) -> Result<Url, Error> {
        let rel = absolute(path)?;
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            rel.as_str().trim_start_matches('/')
        );
        url.set_path(&joined);

        Ok(url)
    }

    async fn head(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let url = self.url_for(path)?;
        let response = self.client.head(url.clone()).send().await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(absolute(path)?)),
            status => {
                return Err(Error::RemoteStatus {
                    status,
                    url: url.to_string(),
                });
            }
        }

        let size = response.content_length().unwrap_or(0);
        let mtime = response
            .headers()
            .get(http::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(SystemTime::from);

        Ok(Metadata {
            kind: FileKind::File,
            size,
            mtime,
            mode: None,
        })
    }
}

#[async_trait]
impl Store for HttpTree {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn open_with(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Box<dyn File>, Error> {
        if flags.writes() {
            return Err(Error::ReadOnly);
        }

        let full = absolute(path)?;
        let metadata = self.head(&full).await?;

        Ok(Box::new(HttpFile {
            client: self.client.clone(),
            url: self.url_for(&full)?,
            path: full,
            metadata,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, Error> {
        let full = absolute(path)?;
        // The tree root is addressable but has no object behind it.
        if full == "/" {
            return Ok(Metadata::dir());
        }

        self.head(&full).await
    }

    async fn read_dir(&self, _path: &Utf8Path) -> Result<Vec<DirEntry>, Error> {
        Err(Error::Unsupported("read_dir"))
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

struct HttpFile {
    client: Client,
    url: Url,
    path: Utf8PathBuf,
    metadata: Metadata,
}

#[async_trait]
impl File for HttpFile {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Option<Vec<u8>>, Error> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        if offset >= self.metadata.size {
            return Ok(None);
        }

        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let response = self
            .client
            .get(self.url.clone())
            .header(http::header::RANGE, range)
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::OK => {
                // Remote ignored the range; slice the full body locally.
                let body = response.bytes().await?;
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(body.len());
                let end = body.len().min(start + len);
                if start == body.len() {
                    Ok(None)
                } else {
                    Ok(Some(body[start..end].to_vec()))
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(None),
            StatusCode::NOT_FOUND => Err(Error::NotFound(self.path.clone())),
            status => Err(Error::RemoteStatus {
                status,
                url: self.url.to_string(),
            }),
        }
    }

    async fn write_at(&mut self, _offset: u64, _data: &[u8]) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }

    async fn metadata(&self) -> Result<Metadata, Error> {
        Ok(self.metadata)
    }

    async fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, method, path},
        Mock,
        MockServer,
        ResponseTemplate,
    };

    use super::*;

    async fn tree(server: &MockServer) -> HttpTree {
        HttpTree::new(Url::parse(&server.uri()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn stat_reads_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"file contents".to_vec())
                    .insert_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;

        let store = tree(&server).await;
        let metadata = store.stat(Utf8Path::new("/file.txt")).await.unwrap();
        assert_eq!(metadata.kind, FileKind::File);
        assert_eq!(metadata.size, 13);
        assert!(metadata.mtime.is_some());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = tree(&server).await;
        let err = store.stat(Utf8Path::new("/missing.txt")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ranged_read_uses_partial_content() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"file contents".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.txt"))
            .and(header("range", "bytes=5-12"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"contents".to_vec()))
            .mount(&server)
            .await;

        let store = tree(&server).await;
        let mut file = store.open(Utf8Path::new("/file.txt")).await.unwrap();
        assert_eq!(file.read_at(5, 8).await.unwrap().unwrap(), b"contents");
        assert!(file.read_at(13, 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_body_fallback_slices_locally() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"file contents".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"file contents".to_vec()))
            .mount(&server)
            .await;

        let store = tree(&server).await;
        let mut file = store.open(Utf8Path::new("/file.txt")).await.unwrap();
        assert_eq!(file.read_at(0, 4).await.unwrap().unwrap(), b"file");
        assert_eq!(file.read_at(5, 64).await.unwrap().unwrap(), b"contents");
    }

    #[tokio::test]
    async fn writes_are_rejected() {
        let server = MockServer::start().await;
        let store = tree(&server).await;

        assert!(matches!(
            store.create(Utf8Path::new("/up.txt")).await.unwrap_err(),
            Error::ReadOnly
        ));
        assert!(matches!(
            store.remove(Utf8Path::new("/up.txt")).await.unwrap_err(),
            Error::ReadOnly
        ));
    }
}
