use std::{sync::Arc, time::SystemTime};

use axum::{
    body::Body,
    extract::State,
    http::{Method, Uri},
    response::{IntoResponse, Response},
    Router,
};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::net::TcpListener;
use tracing::{event, Level};

use crate::store::{DirEntry, Error as StoreError, Store};

#[serde_inline_default]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The address for the HTTP server to listen on.
    #[serde_inline_default("::".to_string())]
    pub address: String,

    /// The port for the HTTP server to listen on.
    #[serde_inline_default(80)]
    pub port: u16,

    #[serde_inline_default(true)]
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "::".to_string(),
            port: 80,
            enabled: true,
        }
    }
}

/// An HTTP file server over the namespace facade: GET/HEAD only, with a
/// generated index page for directories.
pub struct HttpServer {
    config: Config,
    store: Arc<dyn Store>,
}

impl HttpServer {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind((self.config.address.as_str(), self.config.port)).await?;
        event!(Level::INFO, addr = %listener.local_addr()?, "HTTP server listening");

        serve(listener, self.store.clone()).await
    }
}

pub(crate) async fn serve(listener: TcpListener, store: Arc<dyn Store>) -> anyhow::Result<()> {
    let app = Router::new().fallback(file_handler).with_state(store);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn file_handler(
    State(store): State<Arc<dyn Store>>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let Ok(path) = percent_encoding::percent_decode_str(uri.path()).decode_utf8() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let path = Utf8Path::new(path.as_ref());

    let metadata = match store.stat(path).await {
        Ok(metadata) => metadata,
        Err(err) => return error_response(&err),
    };

    if metadata.is_dir() {
        match store.read_dir(path).await {
            Ok(entries) => index_response(path, &entries),
            Err(err) => error_response(&err),
        }
    } else {
        match read_whole(store.as_ref(), path).await {
            Ok(body) => file_response(metadata.mtime, body),
            Err(err) => error_response(&err),
        }
    }
}

async fn read_whole(store: &dyn Store, path: &Utf8Path) -> Result<Vec<u8>, StoreError> {
    let mut file = store.open(path).await?;
    let mut body = Vec::new();
    let mut offset = 0u64;

    while let Some(chunk) = file.read_at(offset, 64 * 1024).await? {
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

fn error_response(err: &StoreError) -> Response {
    if err.is_not_found() {
        (StatusCode::NOT_FOUND, "404 not found\n").into_response()
    } else if matches!(
        err,
        StoreError::ReadOnly | StoreError::Unsupported(_)
    ) {
        (StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed\n").into_response()
    } else {
        event!(Level::WARN, %err, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "500 internal server error\n").into_response()
    }
}

fn file_response(mtime: Option<SystemTime>, body: Vec<u8>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");

    if let Some(mtime) = mtime {
        builder = builder.header(header::LAST_MODIFIED, http_date(mtime));
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn index_response(path: &Utf8Path, entries: &[DirEntry]) -> Response {
    let mut page = String::from("<!doctype html>\n<pre>\n");
    for entry in entries {
        let name = if entry.metadata.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name.to_string()
        };
        page.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            html_escape(&href(path, &name)),
            html_escape(&name)
        ));
    }
    page.push_str("</pre>\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(page))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

const HREF_ESCAPES: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?');

fn href(dir: &Utf8Path, name: &str) -> String {
    let base = dir.as_str().trim_end_matches('/');
    let encoded = percent_encoding::utf8_percent_encode(name, HREF_ESCAPES);
    format!("{base}/{encoded}")
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use crate::store::{MemStore, MountTable};

    use super::*;

    async fn serve_fixture() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let mem = Arc::new(MemStore::new());
        mem.write_file("/file.txt", b"file contents").unwrap();
        mem.write_file("/docs/guide.txt", b"guide").unwrap();

        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem, Utf8Path::new("/")).await.unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = serve(listener, Arc::new(table) as Arc<dyn Store>).await;
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn serves_files_and_404s() {
        let (addr, _handle) = serve_fixture().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/file.txt"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "file contents");

        let response = client
            .get(format!("http://{addr}/missing.txt"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_listing_links_entries() {
        let (addr, _handle) = serve_fixture().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/docs"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = response.text().await.unwrap();
        assert!(page.contains("guide.txt"));
        assert!(page.contains("href=\"/docs/guide.txt\""));
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let (addr, _handle) = serve_fixture().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{addr}/file.txt"))
            .body("data")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
