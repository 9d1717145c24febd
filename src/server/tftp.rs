use std::{net::SocketAddr, sync::Arc, time::Duration};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::net::UdpSocket;
use tracing::{event, Level};

use crate::store::{Error as StoreError, OpenFlags, Store};

#[serde_inline_default]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The address for the TFTP server to listen on.
    #[serde_inline_default("::".to_string())]
    pub address: String,

    /// The port for the TFTP server to listen on.
    #[serde_inline_default(69)]
    pub port: u16,

    #[serde_inline_default(true)]
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "::".to_string(),
            port: 69,
            enabled: true,
        }
    }
}

const BLOCK_SIZE: usize = 512;
const MAX_PACKET: usize = 4 + BLOCK_SIZE;
const RETRIES: usize = 5;
const TIMEOUT: Duration = Duration::from_secs(3);

/// A TFTP (RFC 1350) server over the namespace facade. Downloads stream the
/// file in lock-step 512-byte blocks; uploads are create-exclusive, so an
/// existing file is never overwritten over TFTP.
pub struct TftpServer {
    config: Config,
    store: Arc<dyn Store>,
}

impl TftpServer {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let socket =
            UdpSocket::bind((self.config.address.as_str(), self.config.port)).await?;
        event!(Level::INFO, addr = %socket.local_addr()?, "TFTP server listening");

        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let Some(packet) = Packet::parse(&buf[..len]) else {
                continue;
            };

            let store = self.store.clone();
            let bind_addr = self.config.address.clone();
            match packet {
                Packet::ReadRequest { filename, mode } => {
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_read(store, &bind_addr, peer, &filename, &mode).await
                        {
                            event!(Level::WARN, %peer, %filename, %err, "TFTP read failed");
                        }
                    });
                }
                Packet::WriteRequest { filename, mode } => {
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_write(store, &bind_addr, peer, &filename, &mode).await
                        {
                            event!(Level::WARN, %peer, %filename, %err, "TFTP write failed");
                        }
                    });
                }
                // DATA/ACK/ERROR outside a transfer have no meaning here.
                _ => {}
            }
        }
    }
}

async fn transfer_socket(bind_addr: &str, peer: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind((bind_addr, 0)).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

async fn serve_read(
    store: Arc<dyn Store>,
    bind_addr: &str,
    peer: SocketAddr,
    filename: &str,
    mode: &str,
) -> anyhow::Result<()> {
    let socket = transfer_socket(bind_addr, peer).await?;

    if !mode.eq_ignore_ascii_case("octet") {
        send_final_error(&socket, 0, "only octet mode is supported").await;
        return Ok(());
    }

    let mut file = match store.open(Utf8Path::new(filename)).await {
        Ok(file) => file,
        Err(err) => {
            send_final_error(&socket, error_code(&err), &err.to_string()).await;
            return Ok(());
        }
    };

    event!(Level::DEBUG, %peer, filename, "TFTP download started");

    let mut block: u16 = 1;
    loop {
        let offset = u64::from(block - 1) * BLOCK_SIZE as u64;
        let chunk = match file.read_at(offset, BLOCK_SIZE).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => Vec::new(),
            Err(err) => {
                send_final_error(&socket, error_code(&err), &err.to_string()).await;
                return Ok(());
            }
        };

        let data = Packet::Data {
            block,
            data: chunk.clone(),
        };
        send_until_acked(&socket, &data, block).await?;

        if chunk.len() < BLOCK_SIZE {
            break;
        }
        block = block.wrapping_add(1);
    }

    event!(Level::DEBUG, %peer, filename, "TFTP download finished");
    Ok(())
}

async fn serve_write(
    store: Arc<dyn Store>,
    bind_addr: &str,
    peer: SocketAddr,
    filename: &str,
    mode: &str,
) -> anyhow::Result<()> {
    let socket = transfer_socket(bind_addr, peer).await?;

    if !mode.eq_ignore_ascii_case("octet") {
        send_final_error(&socket, 0, "only octet mode is supported").await;
        return Ok(());
    }

    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
    let mut file = match store.open_with(Utf8Path::new(filename), flags).await {
        Ok(file) => file,
        Err(err) => {
            send_final_error(&socket, error_code(&err), &err.to_string()).await;
            return Ok(());
        }
    };

    event!(Level::DEBUG, %peer, filename, "TFTP upload started");

    let mut expected: u16 = 1;
    socket.send(&Packet::Ack { block: 0 }.encode()).await?;

    let mut buf = [0u8; MAX_PACKET];
    loop {
        let received = tokio::time::timeout(TIMEOUT, socket.recv(&mut buf)).await;
        let len = match received {
            Ok(len) => len?,
            Err(_) => anyhow::bail!("timed out waiting for data block {expected}"),
        };

        match Packet::parse(&buf[..len]) {
            Some(Packet::Data { block, data }) if block == expected => {
                let offset = u64::from(block - 1) * BLOCK_SIZE as u64;
                if let Err(err) = file.write_at(offset, &data).await {
                    send_final_error(&socket, error_code(&err), &err.to_string()).await;
                    return Ok(());
                }
                socket.send(&Packet::Ack { block }.encode()).await?;

                if data.len() < BLOCK_SIZE {
                    break;
                }
                expected = expected.wrapping_add(1);
            }
            // A retransmitted block we already wrote: ack it again.
            Some(Packet::Data { block, .. }) if block < expected => {
                socket.send(&Packet::Ack { block }.encode()).await?;
            }
            Some(Packet::Error { code, message }) => {
                anyhow::bail!("client aborted transfer: {code} {message}");
            }
            _ => {}
        }
    }

    if let Err(err) = file.sync().await {
        send_final_error(&socket, error_code(&err), &err.to_string()).await;
        return Ok(());
    }

    event!(Level::DEBUG, %peer, filename, "TFTP upload finished");
    Ok(())
}

async fn send_until_acked(
    socket: &UdpSocket,
    packet: &Packet,
    block: u16,
) -> anyhow::Result<()> {
    let encoded = packet.encode();
    let mut buf = [0u8; MAX_PACKET];

    for _ in 0..RETRIES {
        socket.send(&encoded).await?;

        let received = tokio::time::timeout(TIMEOUT, socket.recv(&mut buf)).await;
        let len = match received {
            Ok(len) => len?,
            Err(_) => continue,
        };

        match Packet::parse(&buf[..len]) {
            Some(Packet::Ack { block: acked }) if acked == block => return Ok(()),
            Some(Packet::Error { code, message }) => {
                anyhow::bail!("client aborted transfer: {code} {message}");
            }
            _ => {}
        }
    }

    anyhow::bail!("no ack for block {block} after {RETRIES} attempts")
}

async fn send_final_error(socket: &UdpSocket, code: u16, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.to_string(),
    };
    // Best effort: the transfer is over either way.
    let _ = socket.send(&packet.encode()).await;
}

fn error_code(err: &StoreError) -> u16 {
    if err.is_not_found() {
        1
    } else if matches!(err, StoreError::AlreadyExists(_)) {
        6
    } else if matches!(err, StoreError::ReadOnly) {
        2
    } else {
        0
    }
}

/// The five RFC 1350 packet types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    pub(crate) fn parse(buf: &[u8]) -> Option<Packet> {
        if buf.len() < 4 {
            return None;
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);

        match opcode {
            1 | 2 => {
                let mut strings = buf[2..].split(|byte| *byte == 0);
                let filename = String::from_utf8(strings.next()?.to_vec()).ok()?;
                let mode = String::from_utf8(strings.next()?.to_vec()).ok()?;
                if filename.is_empty() || mode.is_empty() {
                    return None;
                }

                if opcode == 1 {
                    Some(Packet::ReadRequest { filename, mode })
                } else {
                    Some(Packet::WriteRequest { filename, mode })
                }
            }
            3 => Some(Packet::Data {
                block: u16::from_be_bytes([buf[2], buf[3]]),
                data: buf[4..].to_vec(),
            }),
            4 => Some(Packet::Ack {
                block: u16::from_be_bytes([buf[2], buf[3]]),
            }),
            5 => {
                let message = buf[4..].split(|byte| *byte == 0).next()?;
                Some(Packet::Error {
                    code: u16::from_be_bytes([buf[2], buf[3]]),
                    message: String::from_utf8(message.to_vec()).ok()?,
                })
            }
            _ => None,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::ReadRequest { filename, mode } => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
                out.extend_from_slice(mode.as_bytes());
                out.push(0);
            }
            Packet::WriteRequest { filename, mode } => {
                out.extend_from_slice(&2u16.to_be_bytes());
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
                out.extend_from_slice(mode.as_bytes());
                out.push(0);
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&3u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&5u16.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out.push(0);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemStore;

    use super::*;

    #[test]
    fn request_packets_roundtrip() {
        let rrq = Packet::ReadRequest {
            filename: "boot/pxelinux.0".to_string(),
            mode: "octet".to_string(),
        };
        assert_eq!(Packet::parse(&rrq.encode()).unwrap(), rrq);

        let wrq = Packet::WriteRequest {
            filename: "upload.bin".to_string(),
            mode: "octet".to_string(),
        };
        assert_eq!(Packet::parse(&wrq.encode()).unwrap(), wrq);
    }

    #[test]
    fn data_ack_error_roundtrip() {
        let data = Packet::Data {
            block: 7,
            data: vec![1, 2, 3],
        };
        assert_eq!(Packet::parse(&data.encode()).unwrap(), data);

        let ack = Packet::Ack { block: 7 };
        assert_eq!(Packet::parse(&ack.encode()).unwrap(), ack);

        let error = Packet::Error {
            code: 1,
            message: "File not found".to_string(),
        };
        assert_eq!(Packet::parse(&error.encode()).unwrap(), error);
    }

    #[test]
    fn truncated_packets_are_rejected() {
        assert!(Packet::parse(&[]).is_none());
        assert!(Packet::parse(&[0, 1]).is_none());
        assert!(Packet::parse(&[0, 9, 0, 0]).is_none());
        // RRQ missing the mode terminator.
        assert!(Packet::parse(b"\x00\x01file").is_none());
    }

    #[tokio::test]
    async fn download_over_loopback() {
        let store = Arc::new(MemStore::new());
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        store.write_file("/image.bin", &payload).unwrap();

        // Bind the server socket manually so the test knows the port.
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            if let Some(Packet::ReadRequest { filename, mode }) = Packet::parse(&buf[..len]) {
                serve_read(store, "127.0.0.1", peer, &filename, &mode)
                    .await
                    .unwrap();
            }
        });

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let rrq = Packet::ReadRequest {
            filename: "/image.bin".to_string(),
            mode: "octet".to_string(),
        };
        client.send_to(&rrq.encode(), server_addr).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (len, from) = client.recv_from(&mut buf).await.unwrap();
            match Packet::parse(&buf[..len]) {
                Some(Packet::Data { block, data }) => {
                    let done = data.len() < BLOCK_SIZE;
                    received.extend_from_slice(&data);
                    client
                        .send_to(&Packet::Ack { block }.encode(), from)
                        .await
                        .unwrap();
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }

        assert_eq!(received, payload);
    }
}
