use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};

/// Largest payload a Data packet may carry. A shorter payload marks the final block.
pub const DATA_BUFFER_SIZE: usize = 512;

/// The only transfer mode this implementation speaks.
pub const OCTET_MODE: &str = "octet";

/// Room for the largest legal packet plus slack, so that oversized datagrams are noticed
/// instead of being silently truncated into something that looks valid.
const RECV_BUFFER_SIZE: usize = 2048;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    MalformedPacket(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::MalformedPacket(e) => write!(f, "Malformed packet: {e}"),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

fn malformed<T>(msg: impl Into<String>) -> TftpResult<T> {
    Err(SocketError::MalformedPacket(msg.into()))
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "illegal TFTP operation",
            ErrorCode::UnknownTransferId => "unknown transfer ID",
            ErrorCode::FileExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
        };
        write!(f, "{description} ({})", u16::from(*self))
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file the client wants to read.
        filename: String,

        /// The transfer mode, as sent on the wire. Validating it is up to the receiver.
        mode: String,
    },

    /// A write request packet
    WriteReq { filename: String, mode: String },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { filename, mode } => write!(f, "RRQ '{filename}' ({mode})"),
            Packet::WriteReq { filename, mode } => write!(f, "WRQ '{filename}' ({mode})"),
            Packet::Data { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Packet::Ack { block } => write!(f, "ACK #{block}"),
            Packet::Error { code, message } => write!(f, "ERROR {code}: '{message}'"),
        }
    }
}

/// The opcode carried in the first two bytes of every packet.
#[derive(Debug, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl From<&OpCode> for u16 {
    fn from(op: &OpCode) -> Self {
        match op {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads a NUL-terminated string from the start of `buf`.
///
/// Returns the string together with whatever follows the terminator. A buffer with no NUL byte
/// is malformed: the terminator is a delimiter, not optional padding.
fn string_from_buffer(buf: &[u8]) -> TftpResult<(String, &[u8])> {
    match buf.iter().position(|&c| c == 0x00) {
        Some(end) => Ok((String::from_utf8_lossy(&buf[..end]).into_owned(), &buf[end + 1..])),
        None => malformed("string is not terminated with a null byte"),
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => malformed(format!("unknown opcode: {rawcode}")),
    }
}

fn parse_filename_and_mode(buf: &[u8]) -> TftpResult<(String, String)> {
    let (filename, rest) = string_from_buffer(buf)?;
    let (mode, rest) = string_from_buffer(rest)?;
    if !rest.is_empty() {
        // Option extensions land here; they are not negotiated, so the request is served as
        // a plain one.
        log::debug!("Ignoring {} trailing bytes after request mode", rest.len());
    }
    Ok((filename, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { filename, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { filename, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    let payload = &buf[4..];
    if payload.len() > DATA_BUFFER_SIZE {
        return malformed(format!(
            "data payload of {} bytes exceeds {DATA_BUFFER_SIZE}",
            payload.len()
        ));
    }
    Ok(Packet::Data { block, data: payload.to_vec() })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..])?;
    Ok(Packet::Error { code, message })
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Writes `s` followed by exactly one NUL. Anything from an embedded NUL onwards is dropped,
/// since the receiver could never see past it.
fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let end = bytes.iter().position(|&c| c == 0x00).unwrap_or(bytes.len());
    buf.extend_from_slice(&bytes[..end]);
    buf.push(0x00);
}

impl Packet {
    /// Builds an octet-mode read request.
    pub fn read_request(filename: &str) -> Packet {
        Packet::ReadReq { filename: filename.to_string(), mode: OCTET_MODE.to_string() }
    }

    /// Builds an octet-mode write request.
    pub fn write_request(filename: &str) -> Packet {
        Packet::WriteReq { filename: filename.to_string(), mode: OCTET_MODE.to_string() }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error { code, message: message.into() }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// True for a Data packet that ends its transfer.
    pub fn is_final_data(&self) -> bool {
        matches!(self, Packet::Data { data, .. } if data.len() < DATA_BUFFER_SIZE)
    }

    /// Serializes the packet into its wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + DATA_BUFFER_SIZE);
        write_u16(&mut buf, (&self.op_code()).into());
        match self {
            Packet::ReadReq { filename, mode } | Packet::WriteReq { filename, mode } => {
                write_string(&mut buf, filename);
                write_string(&mut buf, mode);
            }
            Packet::Data { block, data } => {
                write_u16(&mut buf, *block);
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => write_u16(&mut buf, *block),
            Packet::Error { code, message } => {
                write_u16(&mut buf, (*code).into());
                write_string(&mut buf, message);
            }
        }
        buf
    }

    /// Parses a packet out of `buf`. The returned packet owns copies of everything it needs, so
    /// the caller may reuse the buffer straight away.
    pub fn decode(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return malformed(format!("packet too short: {} bytes", buf.len()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        log::trace!("TX {dst}: {packet}");
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }

    /// Waits for the next datagram without a time limit.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Self::decode_from(&buf[..total_written], src)
    }

    /// Waits for the next datagram until `deadline` passes.
    pub async fn recv_until(&self, deadline: Instant) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = timeout_at(deadline, self.sock.recv_from(&mut buf)).await??;
        Self::decode_from(&buf[..total_written], src)
    }

    fn decode_from(buf: &[u8], src: SocketAddr) -> TftpResult<(Packet, SocketAddr)> {
        let packet = Packet::decode(buf).map_err(|e| match e {
            SocketError::MalformedPacket(msg) => {
                SocketError::MalformedPacket(format!("{msg} (from {src})"))
            }
            e => e,
        })?;
        log::trace!("RX {src}: {packet}");
        Ok((packet, src))
    }
}
