//! Protocol front-ends. Each server consumes the composed namespace as a
//! plain [`Store`](crate::store::Store) and translates store errors into
//! protocol-appropriate replies; none of them know about the mount table.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::store::Store;

mod ftp;
mod http;
mod tftp;

pub use ftp::{Config as FtpConfig, FtpServer};
pub use http::{Config as HttpConfig, HttpServer};
pub use tftp::{Config as TftpConfig, TftpServer};

/// Owns the serving side of porter: the facade plus the set of protocol
/// servers to run over it. `run` resolves when the first server stops,
/// which for these servers means the first failure.
pub struct Proxy {
    store: Arc<dyn Store>,
    ftp: Option<FtpConfig>,
    tftp: Option<TftpConfig>,
    http: Option<HttpConfig>,
}

impl Proxy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ftp: None,
            tftp: None,
            http: None,
        }
    }

    #[must_use]
    pub fn with_ftp(mut self, config: FtpConfig) -> Self {
        self.ftp = Some(config);
        self
    }

    #[must_use]
    pub fn with_tftp(mut self, config: TftpConfig) -> Self {
        self.tftp = Some(config);
        self
    }

    #[must_use]
    pub fn with_http(mut self, config: HttpConfig) -> Self {
        self.http = Some(config);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if let Some(config) = self.ftp {
            let server = FtpServer::new(config, self.store.clone());
            tasks.spawn(async move { server.run().await });
        }
        if let Some(config) = self.tftp {
            let server = TftpServer::new(config, self.store.clone());
            tasks.spawn(async move { server.run().await });
        }
        if let Some(config) = self.http {
            let server = HttpServer::new(config, self.store.clone());
            tasks.spawn(async move { server.run().await });
        }

        let Some(result) = tasks.join_next().await else {
            anyhow::bail!("nothing to serve: every server is disabled");
        };

        result?
    }
}
