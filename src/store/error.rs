use std::io;

use camino::Utf8PathBuf;
use http::StatusCode;

#[derive(Debug, thiserror::Error, thiserror_ext::ContextInto)]
pub enum Error {
    #[error("{0} is not mounted")]
    NotMounted(Utf8PathBuf),
    #[error("rename from {from} to {to} crosses stores")]
    CrossStore { from: Utf8PathBuf, to: Utf8PathBuf },
    #[error("store is read-only")]
    ReadOnly,
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("file not found: {0}")]
    NotFound(Utf8PathBuf),
    #[error("not a directory: {0}")]
    NotADirectory(Utf8PathBuf),
    #[error("not a file: {0}")]
    NotAFile(Utf8PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(Utf8PathBuf),
    #[error("invalid path: {0}")]
    InvalidPath(Utf8PathBuf),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unknown scheme in url: {0}")]
    UnknownScheme(String),
    #[error("I/O error: {from}")]
    IoError { source: io::Error, from: String },
    #[error("http transport error")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} for {url}")]
    RemoteStatus { status: StatusCode, url: String },
}

impl Error {
    /// Reports whether this error means the path simply does not exist, so
    /// protocol layers can translate it (HTTP 404, FTP 550) without matching
    /// every variant themselves.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::IoError { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Error::RemoteStatus { status, .. } => *status == StatusCode::NOT_FOUND,
            Error::Transport(err) => err.status() == Some(reqwest::StatusCode::NOT_FOUND),
            _ => false,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }
}
