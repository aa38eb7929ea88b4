// This module contains the server-side request handler.
//
// The listener creates one ServerRequestHandler per ReadReq or WriteReq it receives and hands it
// to its own task. A handler works in two stages:
//
// 1. `new` binds a fresh UDP endpoint for the transfer, checks that the request can be served
//    (mode, path, permissions) and opens the file. Any refusal is reported to the requester
//    with an Error packet sent from that new endpoint.
// 2. `handle` runs the transfer to completion. A read request is served by a Sender that pushes
//    Data blocks and waits on Acks; a write request by a Receiver that acks Data blocks as it
//    writes them.
//
// A handler owns its socket, file and transfer state outright. Nothing is shared with the
// listener or with other handlers, so a failure here ends this transfer and nothing else.

use crate::config::{ServerConfig, TransferConfig};
use crate::processor::{PacketProcessor, Receiver, Sender};
use crate::tftp::{self, ErrorCode, Packet, TftpSocket};
use crate::transfer::{send_error_packet, Transfer, TransferError};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io;

/// How many random ports to try from the configured range before giving up.
const PORT_BIND_ATTEMPTS: usize = 32;

/// The work a handler was set up to do.
enum Direction {
    /// Serving a read request. `first` is the first Data block, already read from the file.
    Read { sender: Sender<File>, first: Packet },

    /// Serving a write request.
    Write { receiver: Receiver<File> },
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket private to this transfer.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The file named in the request.
    filename: String,

    config: TransferConfig,

    direction: Direction,
}

/// Binds the endpoint for one transfer, on a random port from `port_range` if one is
/// configured, else on whatever port the OS hands out.
fn bind_transfer_socket(
    ip: IpAddr,
    port_range: Option<&RangeInclusive<u16>>,
) -> Result<TftpSocket, ServerConnectionError> {
    let Some(range) = port_range else {
        return TftpSocket::bind(SocketAddr::new(ip, 0))
            .map_err(|e| ServerConnectionError::Internal(format!("Couldn't bind socket: {e}")));
    };

    let mut rng = rand::thread_rng();
    for _ in 0..PORT_BIND_ATTEMPTS {
        let port = rng.gen_range(range.clone());
        match TftpSocket::bind(SocketAddr::new(ip, port)) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind socket on port {port}: {e}"),
        }
    }
    Err(ServerConnectionError::Internal(format!(
        "No free port in {}-{} after {PORT_BIND_ATTEMPTS} attempts",
        range.start(),
        range.end()
    )))
}

/// Maps a requested filename onto a path below `root`.
///
/// A leading `/` is tolerated and stripped. Anything that could step outside `root` (`..`, a
/// drive prefix) yields `None`, as does a name with no file component at all.
pub fn resolve_path(root: &Path, filename: &str) -> Option<PathBuf> {
    let relative = Path::new(filename.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    let mut has_name = false;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                has_name = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    has_name.then_some(resolved)
}

/// Error code reported for a file that could not be opened. Only an existing file refused by
/// `create_new` is told apart; every other failure is reported as a missing file.
fn open_error_code(e: &io::Error) -> ErrorCode {
    match ErrorCode::from(e.kind()) {
        ErrorCode::FileExists => ErrorCode::FileExists,
        _ => ErrorCode::FileNotFound,
    }
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        initial_request: Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let sock = bind_transfer_socket(config.ip, config.port_range.as_ref())?;
        if let Ok(local) = sock.local_addr() {
            log::debug!("Bound {local} to serve {initial_request} from {src}");
        }

        let (filename, mode, is_read) = match initial_request {
            Packet::ReadReq { filename, mode } => (filename, mode, true),
            Packet::WriteReq { filename, mode } => (filename, mode, false),
            other => {
                send_error_packet(
                    &sock,
                    src,
                    ErrorCode::IllegalOperation,
                    "Only read and write requests can start a transfer".to_string(),
                )
                .await;
                return Err(ServerConnectionError::BadRequest(format!(
                    "{other} cannot start a transfer"
                )));
            }
        };

        if !mode.eq_ignore_ascii_case(tftp::OCTET_MODE) {
            send_error_packet(
                &sock,
                src,
                ErrorCode::Undefined,
                format!("Only octet mode is supported, got: {mode}"),
            )
            .await;
            return Err(ServerConnectionError::BadRequest(format!(
                "Peer requested {mode} mode, which is unsupported"
            )));
        }

        let Some(path) = resolve_path(&config.root, &filename) else {
            send_error_packet(
                &sock,
                src,
                ErrorCode::AccessViolation,
                format!("Access denied: {filename}"),
            )
            .await;
            return Err(ServerConnectionError::BadRequest(format!(
                "Path '{filename}' leaves the server root"
            )));
        };

        let direction = if is_read {
            Self::open_for_reading(&sock, src, &path, &filename).await?
        } else {
            if config.read_only {
                send_error_packet(
                    &sock,
                    src,
                    ErrorCode::AccessViolation,
                    "Server is read-only".to_string(),
                )
                .await;
                return Err(ServerConnectionError::BadRequest(format!(
                    "Write of '{filename}' refused, server is read-only"
                )));
            }
            Self::open_for_writing(&sock, src, &path, &filename, config.overwrite).await?
        };

        Ok(ServerRequestHandler {
            sock,
            dst: src,
            filename,
            config: config.transfer,
            direction,
        })
    }

    async fn open_for_reading(
        sock: &TftpSocket,
        src: SocketAddr,
        path: &Path,
        filename: &str,
    ) -> Result<Direction, ServerConnectionError> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) => {
                send_error_packet(
                    sock,
                    src,
                    open_error_code(&e),
                    format!("Unable to read file: {filename}"),
                )
                .await;
                return Err(e.into());
            }
        };

        let mut sender = Sender::new(file, 0);
        match sender.next_packet().await {
            Ok(Some(first)) => Ok(Direction::Read { sender, first }),
            Ok(None) => Err(ServerConnectionError::Internal(
                "Sender finished before the first block".to_string(),
            )),
            Err(e) => {
                send_error_packet(
                    sock,
                    src,
                    ErrorCode::Undefined,
                    format!("Failed to read from file: {e}"),
                )
                .await;
                Err(e.into())
            }
        }
    }

    async fn open_for_writing(
        sock: &TftpSocket,
        src: SocketAddr,
        path: &Path,
        filename: &str,
        overwrite: bool,
    ) -> Result<Direction, ServerConnectionError> {
        log::info!("Writing to {}", path.display());
        let opened = if overwrite {
            File::create(path).await
        } else {
            OpenOptions::new().write(true).create_new(true).open(path).await
        };

        match opened {
            Ok(f) => Ok(Direction::Write {
                receiver: Receiver::new(f, 0),
            }),
            Err(e) => {
                send_error_packet(
                    sock,
                    src,
                    open_error_code(&e),
                    format!("Unable to write to file: {filename}"),
                )
                .await;
                Err(e.into())
            }
        }
    }

    /// Does the work of sending and receiving data over the connection until the transfer ends.
    /// Returns the number of payload bytes moved.
    pub async fn handle(self) -> Result<u64, TransferError> {
        let ServerRequestHandler {
            sock,
            dst,
            filename,
            config,
            direction,
        } = self;
        let mut transfer = Transfer::bound_to(sock, dst, config);

        let result = match direction {
            Direction::Read { mut sender, first } => transfer
                .run(first, &mut sender)
                .await
                .map(|_| sender.bytes_transferred()),
            Direction::Write { mut receiver } => transfer
                .run(Packet::Ack { block: 0 }, &mut receiver)
                .await
                .map(|_| receiver.bytes_transferred()),
        };

        match &result {
            Ok(bytes) => log::info!("Transfer of '{filename}' with {dst} done, {bytes} bytes"),
            Err(e) => log::warn!("Transfer of '{filename}' with {dst} failed: {e}"),
        }
        result
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::File(e) => write!(f, "File IO error: {e}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}
