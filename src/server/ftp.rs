use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use path_absolutize::Absolutize as _;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
};
use tracing::{event, Level};

use crate::store::{DirEntry, Error as StoreError, FileKind, OpenFlags, Store};

#[serde_inline_default]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The address for the FTP server to listen on.
    #[serde_inline_default("::".to_string())]
    pub address: String,

    /// The port for the FTP control connection to listen on.
    #[serde_inline_default(21)]
    pub port: u16,

    #[serde_inline_default(true)]
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "::".to_string(),
            port: 21,
            enabled: true,
        }
    }
}

/// An FTP front-end over the namespace facade. Any credentials are
/// accepted, data connections are passive only (PASV/EPSV), and transfers
/// resume through REST offsets mapped onto the facade's positional I/O.
pub struct FtpServer {
    config: Config,
    store: Arc<dyn Store>,
}

impl FtpServer {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind((self.config.address.as_str(), self.config.port)).await?;
        event!(Level::INFO, addr = %listener.local_addr()?, "FTP server listening");

        serve(listener, self.store.clone()).await
    }
}

pub(crate) async fn serve(listener: TcpListener, store: Arc<dyn Store>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        event!(Level::INFO, %peer, "FTP client connected");

        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = FtpSession::handle(stream, store).await {
                event!(Level::WARN, %peer, %err, "FTP session ended with error");
            }
            event!(Level::DEBUG, %peer, "FTP client disconnected");
        });
    }
}

enum Flow {
    Continue,
    Quit,
}

struct FtpSession {
    store: Arc<dyn Store>,
    writer: OwnedWriteHalf,
    local_ip: IpAddr,
    cwd: Utf8PathBuf,
    restart_offset: u64,
    rename_from: Option<Utf8PathBuf>,
    data_listener: Option<TcpListener>,
}

impl FtpSession {
    async fn handle(stream: TcpStream, store: Arc<dyn Store>) -> anyhow::Result<()> {
        let local_ip = stream.local_addr()?.ip();
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut session = FtpSession {
            store,
            writer,
            local_ip,
            cwd: Utf8PathBuf::from("/"),
            restart_offset: 0,
            rename_from: None,
            data_listener: None,
        };

        session.reply(220, "porter ftp server").await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let (verb, arg) = parse_command(&line);
            match session.dispatch(&verb, &arg).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn reply(&mut self, code: u16, message: &str) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("{code} {message}\r\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn reply_raw(&mut self, message: &str) -> anyhow::Result<()> {
        self.writer.write_all(message.as_bytes()).await?;
        Ok(())
    }

    async fn reply_error(&mut self, err: &StoreError) -> anyhow::Result<()> {
        let (code, message) = match err {
            err if err.is_not_found() => (550, "file or directory not found".to_string()),
            StoreError::ReadOnly => (550, "store is read-only".to_string()),
            StoreError::CrossStore { .. } => {
                (550, "cannot rename across mounted stores".to_string())
            }
            StoreError::AlreadyExists(_) => (550, "already exists".to_string()),
            StoreError::Unsupported(_) => (502, "operation not supported".to_string()),
            err => (550, err.to_string()),
        };
        self.reply(code, &message).await
    }

    fn resolve(&self, arg: &str) -> Utf8PathBuf {
        resolve_path(&self.cwd, arg)
    }

    async fn dispatch(&mut self, verb: &str, arg: &str) -> anyhow::Result<Flow> {
        match verb {
            "USER" => self.reply(331, "any password will do").await?,
            "PASS" => self.reply(230, "logged in").await?,
            "SYST" => self.reply(215, "UNIX Type: L8").await?,
            "NOOP" => self.reply(200, "ok").await?,
            "TYPE" => self.reply(200, "type set").await?,
            "FEAT" => {
                self.reply_raw(
                    "211-Features:\r\n SIZE\r\n MDTM\r\n REST STREAM\r\n EPSV\r\n UTF8\r\n211 End\r\n",
                )
                .await?;
            }
            "PWD" => {
                let message = format!("\"{}\" is the current directory", self.cwd);
                self.reply(257, &message).await?;
            }
            "CWD" => self.cmd_cwd(arg).await?,
            "CDUP" => {
                self.cwd = self
                    .cwd
                    .parent()
                    .map_or_else(|| Utf8PathBuf::from("/"), Utf8Path::to_path_buf);
                self.reply(250, "directory changed").await?;
            }
            "PASV" => self.cmd_pasv().await?,
            "EPSV" => self.cmd_epsv().await?,
            "PORT" | "EPRT" => self.reply(502, "active mode not supported").await?,
            "LIST" => self.cmd_list(arg, true).await?,
            "NLST" => self.cmd_list(arg, false).await?,
            "SIZE" => self.cmd_size(arg).await?,
            "MDTM" => self.cmd_mdtm(arg).await?,
            "REST" => self.cmd_rest(arg).await?,
            "RETR" => self.cmd_retr(arg).await?,
            "STOR" => self.cmd_stor(arg, false).await?,
            "APPE" => self.cmd_stor(arg, true).await?,
            "DELE" => self.cmd_dele(arg).await?,
            "MKD" => self.cmd_mkd(arg).await?,
            "RMD" => self.cmd_rmd(arg).await?,
            "RNFR" => self.cmd_rnfr(arg).await?,
            "RNTO" => self.cmd_rnto(arg).await?,
            "QUIT" => {
                self.reply(221, "goodbye").await?;
                return Ok(Flow::Quit);
            }
            "" => {}
            _ => self.reply(502, "command not implemented").await?,
        }

        Ok(Flow::Continue)
    }

    async fn cmd_cwd(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.stat(&path).await {
            Ok(metadata) if metadata.is_dir() => {
                self.cwd = path;
                self.reply(250, "directory changed").await
            }
            Ok(_) => self.reply(550, "not a directory").await,
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_pasv(&mut self) -> anyhow::Result<()> {
        let IpAddr::V4(ip) = self.local_ip else {
            return self.reply(425, "use EPSV for this address family").await;
        };

        let listener = TcpListener::bind((self.local_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        self.data_listener = Some(listener);

        let [a, b, c, d] = ip.octets();
        let message = format!(
            "Entering Passive Mode ({a},{b},{c},{d},{},{})",
            port >> 8,
            port & 0xff
        );
        self.reply(227, &message).await
    }

    async fn cmd_epsv(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.local_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        self.data_listener = Some(listener);

        let message = format!("Entering Extended Passive Mode (|||{port}|)");
        self.reply(229, &message).await
    }

    async fn data_connection(&mut self) -> anyhow::Result<Option<TcpStream>> {
        let Some(listener) = self.data_listener.take() else {
            self.reply(425, "use PASV or EPSV first").await?;
            return Ok(None);
        };

        match tokio::time::timeout(Duration::from_secs(30), listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(Some(stream)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                self.reply(425, "data connection timed out").await?;
                Ok(None)
            }
        }
    }

    async fn cmd_list(&mut self, arg: &str, long: bool) -> anyhow::Result<()> {
        let path = if arg.is_empty() {
            self.cwd.clone()
        } else {
            self.resolve(arg)
        };

        let entries = match self.store.read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) => return self.reply_error(&err).await,
        };

        self.reply(150, "opening data connection").await?;
        let Some(mut data) = self.data_connection().await? else {
            return Ok(());
        };

        for entry in &entries {
            let line = if long {
                format!("{}\r\n", list_line(entry))
            } else {
                format!("{}\r\n", entry.name)
            };
            data.write_all(line.as_bytes()).await?;
        }
        data.shutdown().await?;

        self.reply(226, "transfer complete").await
    }

    async fn cmd_size(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.stat(&path).await {
            Ok(metadata) if metadata.is_dir() => self.reply(550, "not a plain file").await,
            Ok(metadata) => {
                let size = metadata.size.to_string();
                self.reply(213, &size).await
            }
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_mdtm(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.stat(&path).await {
            Ok(metadata) => {
                let mtime = metadata.mtime.unwrap_or(SystemTime::UNIX_EPOCH);
                let stamp = DateTime::<Utc>::from(mtime).format("%Y%m%d%H%M%S").to_string();
                self.reply(213, &stamp).await
            }
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_rest(&mut self, arg: &str) -> anyhow::Result<()> {
        match arg.parse::<u64>() {
            Ok(offset) => {
                self.restart_offset = offset;
                let message = format!("restarting at {offset}");
                self.reply(350, &message).await
            }
            Err(_) => self.reply(501, "bad restart offset").await,
        }
    }

    async fn cmd_retr(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        let mut offset = std::mem::take(&mut self.restart_offset);

        let mut file = match self.store.open(&path).await {
            Ok(file) => file,
            Err(err) => return self.reply_error(&err).await,
        };

        self.reply(150, "opening data connection").await?;
        let Some(mut data) = self.data_connection().await? else {
            return Ok(());
        };

        loop {
            match file.read_at(offset, 32 * 1024).await {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        break;
                    }
                    data.write_all(&chunk).await?;
                    offset += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(err) => {
                    event!(Level::WARN, %path, %err, "FTP download failed");
                    return self.reply(451, "transfer aborted").await;
                }
            }
        }
        data.shutdown().await?;

        self.reply(226, "transfer complete").await
    }

    async fn cmd_stor(&mut self, arg: &str, append: bool) -> anyhow::Result<()> {
        let path = self.resolve(arg);

        let mut offset = if append {
            match self.store.stat(&path).await {
                Ok(metadata) => metadata.size,
                Err(err) if err.is_not_found() => 0,
                Err(err) => return self.reply_error(&err).await,
            }
        } else {
            std::mem::take(&mut self.restart_offset)
        };

        let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
        if !append && offset == 0 {
            flags |= OpenFlags::TRUNCATE;
        }

        let mut file = match self.store.open_with(&path, flags).await {
            Ok(file) => file,
            Err(err) => return self.reply_error(&err).await,
        };

        self.reply(150, "opening data connection").await?;
        let Some(mut data) = self.data_connection().await? else {
            return Ok(());
        };

        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let read = data.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            if let Err(err) = file.write_at(offset, &buf[..read]).await {
                event!(Level::WARN, %path, %err, "FTP upload failed");
                return self.reply(451, "transfer aborted").await;
            }
            offset += read as u64;
        }

        if let Err(err) = file.sync().await {
            return self.reply_error(&err).await;
        }

        self.reply(226, "transfer complete").await
    }

    async fn cmd_dele(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.remove(&path).await {
            Ok(()) => self.reply(250, "deleted").await,
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_mkd(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.mkdir(&path).await {
            Ok(()) => {
                let message = format!("\"{path}\" created");
                self.reply(257, &message).await
            }
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_rmd(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.remove(&path).await {
            Ok(()) => self.reply(250, "removed").await,
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_rnfr(&mut self, arg: &str) -> anyhow::Result<()> {
        let path = self.resolve(arg);
        match self.store.stat(&path).await {
            Ok(_) => {
                self.rename_from = Some(path);
                self.reply(350, "ready for destination").await
            }
            Err(err) => self.reply_error(&err).await,
        }
    }

    async fn cmd_rnto(&mut self, arg: &str) -> anyhow::Result<()> {
        let Some(from) = self.rename_from.take() else {
            return self.reply(503, "RNFR required first").await;
        };

        let to = self.resolve(arg);
        match self.store.rename(&from, &to).await {
            Ok(()) => self.reply(250, "renamed").await,
            Err(err) => self.reply_error(&err).await,
        }
    }
}

fn parse_command(line: &str) -> (String, String) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim().to_string()),
        None => (line.to_ascii_uppercase(), String::new()),
    }
}

fn resolve_path(cwd: &Utf8Path, arg: &str) -> Utf8PathBuf {
    let arg = if arg.is_empty() { "." } else { arg };

    std::path::Path::new(arg)
        .absolutize_from(cwd.as_std_path())
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path.into_owned()).ok())
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn list_line(entry: &DirEntry) -> String {
    let kind = match entry.metadata.kind {
        FileKind::Dir => 'd',
        FileKind::Symlink => 'l',
        FileKind::File => '-',
    };

    let mode = entry.metadata.mode.unwrap_or(if kind == 'd' { 0o755 } else { 0o644 });
    let mut perms = String::new();
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    let mtime = entry.metadata.mtime.unwrap_or(SystemTime::UNIX_EPOCH);
    let stamp = DateTime::<Utc>::from(mtime).format("%b %e %H:%M");

    format!(
        "{kind}{perms} 1 porter porter {:>12} {stamp} {}",
        entry.metadata.size, entry.name
    )
}

#[cfg(test)]
mod tests {
    use crate::store::{MemStore, Metadata, MountTable};

    use super::*;

    #[test]
    fn commands_parse_into_verb_and_argument() {
        assert_eq!(
            parse_command("RETR file.txt\r\n"),
            ("RETR".to_string(), "file.txt".to_string())
        );
        assert_eq!(
            parse_command("stor my file.txt\r\n"),
            ("STOR".to_string(), "my file.txt".to_string())
        );
        assert_eq!(parse_command("QUIT\r\n"), ("QUIT".to_string(), String::new()));
    }

    #[test]
    fn paths_resolve_against_the_working_directory() {
        let cwd = Utf8Path::new("/docs");
        assert_eq!(resolve_path(cwd, "a.txt"), Utf8Path::new("/docs/a.txt"));
        assert_eq!(resolve_path(cwd, "/top.txt"), Utf8Path::new("/top.txt"));
        assert_eq!(resolve_path(cwd, ".."), Utf8Path::new("/"));
        assert_eq!(resolve_path(cwd, "../other/b"), Utf8Path::new("/other/b"));
    }

    #[test]
    fn list_lines_look_like_ls() {
        let entry = DirEntry {
            name: Utf8PathBuf::from("file.txt"),
            metadata: Metadata {
                mode: Some(0o644),
                ..Metadata::file(1234)
            },
        };
        let line = list_line(&entry);
        assert!(line.starts_with("-rw-r--r-- 1 porter porter"));
        assert!(line.ends_with("file.txt"));

        let dir = DirEntry {
            name: Utf8PathBuf::from("sub"),
            metadata: Metadata::dir(),
        };
        assert!(list_line(&dir).starts_with('d'));
    }

    async fn read_reply(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn login_stat_and_retrieve_over_loopback() {
        let mem = Arc::new(MemStore::new());
        mem.write_file("/file.txt", b"file contents").unwrap();

        let table = MountTable::new(Arc::new(MemStore::new()));
        table.mount(mem, Utf8Path::new("/")).await.unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve(listener, Arc::new(table) as Arc<dyn Store>).await;
        });

        let control = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = control.into_split();
        let mut reader = BufReader::new(read_half);

        assert!(read_reply(&mut reader).await.starts_with("220"));

        write_half.write_all(b"USER anonymous\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("331"));
        write_half.write_all(b"PASS guest\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("230"));

        write_half.write_all(b"SIZE /file.txt\r\n").await.unwrap();
        let size_reply = read_reply(&mut reader).await;
        assert!(size_reply.starts_with("213"), "got {size_reply}");
        assert!(size_reply.contains("13"));

        write_half.write_all(b"EPSV\r\n").await.unwrap();
        let epsv_reply = read_reply(&mut reader).await;
        assert!(epsv_reply.starts_with("229"), "got {epsv_reply}");
        let port: u16 = epsv_reply
            .split('|')
            .nth(3)
            .unwrap()
            .parse()
            .unwrap();

        write_half.write_all(b"RETR /file.txt\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("150"));

        let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut body = Vec::new();
        data.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"file contents");

        assert!(read_reply(&mut reader).await.starts_with("226"));

        write_half.write_all(b"QUIT\r\n").await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("221"));
    }

    #[tokio::test]
    async fn uploads_are_refused_on_read_only_stores() {
        use crate::store::ReadOnly;

        let mem = Arc::new(MemStore::new());
        mem.write_file("/file.txt", b"data").unwrap();

        let table = MountTable::new(Arc::new(MemStore::new()));
        table
            .mount(
                Arc::new(ReadOnly::new(mem)) as Arc<dyn Store>,
                Utf8Path::new("/"),
            )
            .await
            .unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve(listener, Arc::new(table) as Arc<dyn Store>).await;
        });

        let control = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = control.into_split();
        let mut reader = BufReader::new(read_half);
        assert!(read_reply(&mut reader).await.starts_with("220"));

        write_half.write_all(b"STOR /up.txt\r\n").await.unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply.starts_with("550"), "got {reply}");
    }
}
