#![forbid(unsafe_code)]

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{event, Level};
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use porter::{
    config::{self, Config, MountConfig},
    server::Proxy,
    store::{store_for_url, MemStore, MountTable, ReadOnly, Store, Traced},
};

/// porter serves files with ftp/tftp/http.
#[derive(Debug, Parser)]
#[command(name = "porter", version)]
struct Cli {
    /// Mounts as '<url> <path>' pairs, e.g. 'file:///srv/tftp /boot'.
    #[arg(value_name = "URL PATH")]
    mounts: Vec<String>,

    /// Path to the configuration file.
    #[arg(long, default_value = "porter.toml")]
    config: PathBuf,

    /// Log every store operation.
    #[arg(long)]
    debug: bool,

    /// Allow uploading and other mutations.
    #[arg(long)]
    writable: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    LogTracer::init()?;

    let env_filter = EnvFilter::builder()
        .with_env_var("PORTER_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    config.debug |= cli.debug;
    config.writable |= cli.writable;

    let mut mounts = config.mounts.clone();
    for arg in &cli.mounts {
        mounts.push(config::parse_mount_arg(arg)?);
    }
    if mounts.is_empty() {
        if let Ok(arg) = env::var("PORTER_S3_MOUNTS") {
            mounts.push(config::parse_mount_arg(&arg)?);
        }
    }
    if mounts.is_empty() {
        bail!("no mounts given via porter.toml, arguments, or PORTER_S3_MOUNTS='<url> <path>'");
    }

    let table = MountTable::new(Arc::new(MemStore::new()));
    for MountConfig { mut url, path } in mounts {
        if url.scheme() == "s3" && url.username().is_empty() {
            let Ok(credentials) = env::var("PORTER_S3_CREDENTIALS") else {
                bail!("missing PORTER_S3_CREDENTIALS=<access_key>:<secret>");
            };
            config::inject_s3_credentials(&mut url, &credentials)?;
        }

        let mut store = store_for_url(&url)?;
        if !config.writable {
            store = Arc::new(ReadOnly::new(store)) as Arc<dyn Store>;
        }
        if config.debug {
            store = Arc::new(Traced::new(store)) as Arc<dyn Store>;
        }

        event!(Level::INFO, url = %config::masked(&url), %path, "mounting");
        table.mount(store, &path).await?;
    }

    let mut proxy = Proxy::new(Arc::new(table) as Arc<dyn Store>);
    if config.ftp.enabled {
        proxy = proxy.with_ftp(config.ftp.clone());
    }
    if config.tftp.enabled {
        proxy = proxy.with_tftp(config.tftp.clone());
    }
    if config.http.enabled {
        proxy = proxy.with_http(config.http.clone());
    }

    proxy.run().await
}
