use crate::config::TransferConfig;
use crate::processor::{PacketProcessor, Receiver, Sender};
use crate::tftp::{ErrorCode, Packet, TftpSocket};
use crate::transfer::{send_error_packet, Transfer, TransferError};
use std::error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

/// A problem with the server the client was pointed at. Raised before any packet is sent.
#[derive(Debug, PartialEq)]
pub enum TargetError {
    UnknownHost(String),
    InvalidPort(String),
}

impl error::Error for TargetError {}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownHost(host) => write!(f, "Host {host} is unknown"),
            Self::InvalidPort(port) => write!(f, "Port value {port} is invalid"),
        }
    }
}

pub fn parse_port(port: &str) -> Result<u16, TargetError> {
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(TargetError::InvalidPort(port.to_string())),
    }
}

/// Resolves `host` and `port` into the address requests are sent to. IPv4 results are
/// preferred when a name has both kinds.
pub async fn resolve_target(host: &str, port: &str) -> Result<SocketAddr, TargetError> {
    let port = parse_port(port)?;
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| TargetError::UnknownHost(host.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TargetError::UnknownHost(host.to_string()))
}

/// TFTP client. Performs one transfer at a time against a single server.
pub struct Client {
    server: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(server: SocketAddr, config: TransferConfig) -> Client {
        Client { server, config }
    }

    /// Every transfer gets a fresh ephemeral port, which is the client's transfer ID.
    fn bind_socket(&self) -> Result<TftpSocket, TransferError> {
        let ip = match self.server.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Ok(TftpSocket::bind(SocketAddr::new(ip, 0))?)
    }

    /// Download `remote` from the server into the file at `local`, creating or truncating it.
    ///
    /// Returns the number of bytes received.
    pub async fn fetch(&self, remote: &str, local: &Path) -> Result<u64, TransferError> {
        log::info!("Fetching {remote} from {} into {}", self.server, local.display());
        let sock = self.bind_socket()?;

        let file = match File::create(local).await {
            Ok(f) => f,
            Err(e) => {
                send_error_packet(
                    &sock,
                    self.server,
                    ErrorCode::FileNotFound,
                    format!("Can't write to: {}", local.display()),
                )
                .await;
                return Err(TransferError::LocalIo(e));
            }
        };

        self.receive(sock, remote, file).await
    }

    /// Download `remote` from the server into `sink`.
    pub async fn fetch_to<W: AsyncWrite + Unpin>(
        &self,
        remote: &str,
        sink: W,
    ) -> Result<u64, TransferError> {
        let sock = self.bind_socket()?;
        self.receive(sock, remote, sink).await
    }

    /// Upload the file at `local` to the server as `remote`.
    ///
    /// Returns the number of bytes sent.
    pub async fn store(&self, local: &Path, remote: &str) -> Result<u64, TransferError> {
        log::info!("Storing {} on {} as {remote}", local.display(), self.server);
        let sock = self.bind_socket()?;

        let file = match File::open(local).await {
            Ok(f) => f,
            Err(e) => {
                send_error_packet(
                    &sock,
                    self.server,
                    ErrorCode::FileNotFound,
                    format!("File {} cannot be found", local.display()),
                )
                .await;
                return Err(TransferError::LocalIo(e));
            }
        };

        self.send(sock, file, remote).await
    }

    /// Upload everything `source` yields to the server as `remote`.
    pub async fn store_from<R: AsyncRead + Unpin>(
        &self,
        source: R,
        remote: &str,
    ) -> Result<u64, TransferError> {
        let sock = self.bind_socket()?;
        self.send(sock, source, remote).await
    }

    async fn receive<W: AsyncWrite + Unpin>(
        &self,
        sock: TftpSocket,
        remote: &str,
        sink: W,
    ) -> Result<u64, TransferError> {
        let mut receiver = Receiver::new(sink, 0);
        let mut transfer = Transfer::new(sock, self.server, self.config);
        transfer
            .run(Packet::read_request(remote), &mut receiver)
            .await?;

        let bytes = receiver.bytes_transferred();
        log::info!("Received {bytes} bytes of {remote} from {}", transfer.peer());
        Ok(bytes)
    }

    async fn send<R: AsyncRead + Unpin>(
        &self,
        sock: TftpSocket,
        source: R,
        remote: &str,
    ) -> Result<u64, TransferError> {
        // The write request itself is acked as block 0.
        let mut sender = Sender::new(source, 0);
        let mut transfer = Transfer::new(sock, self.server, self.config);
        transfer
            .run(Packet::write_request(remote), &mut sender)
            .await?;

        let bytes = sender.bytes_transferred();
        log::info!("Sent {bytes} bytes as {remote} to {}", transfer.peer());
        Ok(bytes)
    }
}
