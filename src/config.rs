use std::path::Path;

use anyhow::{bail, Context as _, Result};
use camino::Utf8PathBuf;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::server::{FtpConfig, HttpConfig, TftpConfig};

/// One mount: a backend URL bound to a namespace path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountConfig {
    pub url: Url,
    pub path: Utf8PathBuf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ftp: FtpConfig,

    #[serde(default)]
    pub tftp: TftpConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Mounts applied at startup, in order; command-line mounts follow.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    /// Allow uploads and other mutations. Off by default: every store is
    /// wrapped read-only before mounting.
    #[serde(default)]
    pub writable: bool,

    /// Log every store operation at DEBUG.
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PORTER_").split("__"))
            .extract()?;

        Ok(config)
    }
}

/// Parses a command-line mount of the form `<url> <path>`.
pub fn parse_mount_arg(arg: &str) -> Result<MountConfig> {
    let Some((url, path)) = arg.split_once(' ') else {
        bail!("invalid mount, expected '<url> <path>', got '{arg}'");
    };

    let url = Url::parse(url).with_context(|| format!("invalid mount url '{url}'"))?;

    Ok(MountConfig {
        url,
        path: Utf8PathBuf::from(path.trim()),
    })
}

/// Fills in S3 credentials from `PORTER_S3_CREDENTIALS=<access_key>:<secret>`
/// when the mount URL carries none of its own.
pub fn inject_s3_credentials(url: &mut Url, credentials: &str) -> Result<()> {
    let Some((access_key, secret)) = credentials.split_once(':') else {
        bail!("invalid PORTER_S3_CREDENTIALS, expected '<access_key>:<secret>'");
    };

    if url
        .set_username(access_key)
        .and_then(|()| url.set_password(Some(secret)))
        .is_err()
    {
        bail!("cannot attach credentials to url '{url}'");
    }

    Ok(())
}

/// A copy of `url` with any credentials stripped, safe to log.
pub fn masked(url: &Url) -> Url {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config: Config = Figment::new().extract().unwrap();
        assert_eq!(config.ftp.port, 21);
        assert_eq!(config.tftp.port, 69);
        assert_eq!(config.http.port, 80);
        assert!(!config.writable);
        assert!(config.mounts.is_empty());
    }

    #[test]
    fn mount_args_parse_url_and_path() {
        let mount = parse_mount_arg("file:///srv/tftp /boot").unwrap();
        assert_eq!(mount.url.scheme(), "file");
        assert_eq!(mount.path, "/boot");

        assert!(parse_mount_arg("no-separator").is_err());
        assert!(parse_mount_arg("::not-a-url:: /x").is_err());
    }

    #[test]
    fn s3_credentials_attach_and_mask() {
        let mut url = Url::parse("s3://s3.example.com/region/bucket").unwrap();
        inject_s3_credentials(&mut url, "access:secret").unwrap();
        assert_eq!(url.username(), "access");
        assert_eq!(url.password(), Some("secret"));

        let masked = masked(&url);
        assert_eq!(masked.username(), "");
        assert_eq!(masked.password(), None);

        let mut url = Url::parse("s3://s3.example.com/region/bucket").unwrap();
        assert!(inject_s3_credentials(&mut url, "no-colon").is_err());
    }
}
