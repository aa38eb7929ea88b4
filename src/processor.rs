// The processors hold the per-direction half of a transfer: which block is in flight, how much
// of the byte source or sink has been consumed, and how an incoming packet changes that. They
// never touch the network. The transfer loop sends whatever they ask for and feeds them the
// packets that arrive from the bound peer.

use crate::tftp::{self, ErrorCode, Packet};
use crate::transfer::TransferError;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Represents an action that the caller of a PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should ignore the packet and keep waiting on the current deadline.
    RetryRecv,

    /// Caller should send the packet, which completes the transfer.
    TerminateWithPacket(tftp::Packet),

    /// The transfer completed and there is nothing left to send.
    CloseConnection,

    /// The transfer failed. `notify` is sent to the peer as a courtesy, if present.
    Abort {
        notify: Option<tftp::Packet>,
        error: TransferError,
    },
}

/// An entity that can process packets and produce a response.
#[allow(async_fn_in_trait)]
pub trait PacketProcessor {
    /// Given an incoming packet, processes it and describes the action the caller should take.
    async fn process_packet(&mut self, packet: Packet) -> ResultAction;

    /// Payload bytes moved so far.
    fn bytes_transferred(&self) -> u64;
}

fn peer_error(code: ErrorCode, message: String) -> ResultAction {
    log::warn!("Peer sent error {code}: '{message}'");
    ResultAction::Abort {
        notify: None,
        error: TransferError::Protocol { code, message },
    }
}

fn local_failure(e: io::Error, what: &str) -> ResultAction {
    let code = match e.kind() {
        io::ErrorKind::StorageFull => ErrorCode::DiskFull,
        _ => ErrorCode::Undefined,
    };
    log::error!("Failed to {what} file: {e}");
    ResultAction::Abort {
        notify: Some(Packet::error(code, format!("Failed to {what} file: {e}"))),
        error: TransferError::LocalIo(e),
    }
}

/// The sending half: pushes Data blocks read from `source` and waits for each to be acked.
#[derive(Debug)]
pub struct Sender<R> {
    source: R,
    curr_block: u16,
    previous_len: usize,
    bytes: u64,
}

impl<R: AsyncRead + Unpin> Sender<R> {
    /// `block` is the number the peer will ack for the packet that opens the transfer: 0 when
    /// that packet is a write request. Data blocks continue from `block + 1`.
    pub fn new(source: R, block: u16) -> Sender<R> {
        Sender {
            source,
            curr_block: block,
            previous_len: tftp::DATA_BUFFER_SIZE,
            bytes: 0,
        }
    }

    /// Reads the next block from the source. Returns `None` once the block that ended the
    /// transfer has already been sent.
    ///
    /// A source whose length is a multiple of the block size yields one trailing empty block,
    /// so the receiver can tell where the file ends.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, io::Error> {
        if self.previous_len < tftp::DATA_BUFFER_SIZE {
            return Ok(None);
        }

        let data = read_block(&mut self.source).await?;
        self.curr_block = self.curr_block.wrapping_add(1);
        self.previous_len = data.len();
        self.bytes += data.len() as u64;
        Ok(Some(Packet::Data {
            block: self.curr_block,
            data,
        }))
    }

    async fn process_ack(&mut self, block: u16) -> ResultAction {
        if block != self.curr_block {
            // Duplicates and stale acks leave the state untouched.
            log::debug!("Ignoring ack for block {block}, waiting on {}", self.curr_block);
            return ResultAction::RetryRecv;
        }

        match self.next_packet().await {
            Ok(Some(packet)) => ResultAction::SendPacketAndAwait(packet),
            Ok(None) => ResultAction::CloseConnection,
            Err(e) => local_failure(e, "read from"),
        }
    }
}

impl<R: AsyncRead + Unpin> PacketProcessor for Sender<R> {
    async fn process_packet(&mut self, packet: Packet) -> ResultAction {
        match packet {
            Packet::Ack { block } => self.process_ack(block).await,
            Packet::Error { code, message } => peer_error(code, message),
            other => {
                log::debug!("Expected an Ack packet, ignoring {other}");
                ResultAction::RetryRecv
            }
        }
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes
    }
}

/// Fills `buf` up to one block. A single read may return less than asked for without the
/// source being exhausted, so keep reading into the remainder until the block is full or the
/// source reports end of file.
async fn read_block<R: AsyncRead + Unpin>(source: &mut R) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    while cursor < buf.len() {
        match source.read(&mut buf[cursor..]).await? {
            0 => break,
            n => cursor += n,
        }
    }

    buf.truncate(cursor);
    Ok(buf)
}

/// The receiving half: writes in-order Data blocks into `sink` and produces the acks.
#[derive(Debug)]
pub struct Receiver<W> {
    sink: W,
    curr_block: u16,
    bytes: u64,
}

impl<W: AsyncWrite + Unpin> Receiver<W> {
    /// `block` is the last block considered acknowledged; 0 before any data has arrived.
    pub fn new(sink: W, block: u16) -> Receiver<W> {
        Receiver {
            sink,
            curr_block: block,
            bytes: 0,
        }
    }

    async fn process_data(&mut self, packet: Packet) -> ResultAction {
        let last = packet.is_final_data();
        let Packet::Data { block, data } = packet else {
            return ResultAction::RetryRecv;
        };

        let expected = self.curr_block.wrapping_add(1);
        if block != expected {
            // Neither written nor acked: only the next block in sequence moves the transfer on.
            log::debug!("Ignoring data for block {block}, expecting {expected}");
            return ResultAction::RetryRecv;
        }

        if let Err(e) = self.sink.write_all(&data).await {
            return local_failure(e, "write to");
        }
        self.curr_block = expected;
        self.bytes += data.len() as u64;

        let ack = Packet::Ack {
            block: self.curr_block,
        };
        if last {
            if let Err(e) = self.sink.flush().await {
                return local_failure(e, "flush");
            }
            ResultAction::TerminateWithPacket(ack)
        } else {
            ResultAction::SendPacketAndAwait(ack)
        }
    }
}

impl<W: AsyncWrite + Unpin> PacketProcessor for Receiver<W> {
    async fn process_packet(&mut self, packet: Packet) -> ResultAction {
        match packet {
            data @ Packet::Data { .. } => self.process_data(data).await,
            Packet::Error { code, message } => peer_error(code, message),
            other => {
                log::debug!("Expected a Data packet, ignoring {other}");
                ResultAction::RetryRecv
            }
        }
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes
    }
}
