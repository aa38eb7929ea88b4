// A Transfer drives one file movement over a private UDP endpoint. The loop is the same for
// both directions:
//
// 1. Send the current packet to the peer and start a deadline.
// 2. Wait for a datagram. Anything that is not from the peer, cannot be parsed, or that the
//    processor chooses to ignore is dropped and the wait continues on the same deadline.
// 3. When the deadline passes, resend the same packet. Once the retry budget is spent the
//    transfer is abandoned.
// 4. Otherwise the processor says what to send next, or that the transfer is over.
//
// The first reply fixes the peer's endpoint (the transfer ID). Until then any source is taken,
// since the server answers from a fresh port and, when bound to a wildcard address, possibly
// from a different address than the one the request went to.

use crate::config::TransferConfig;
use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Why a transfer ended without completing.
#[derive(Debug)]
pub enum TransferError {
    /// The peer sent an Error packet.
    Protocol { code: ErrorCode, message: String },

    /// The peer stopped answering and every retransmission went unanswered.
    RetryExhausted { retries: u32 },

    /// Reading the byte source or writing the byte sink failed.
    LocalIo(io::Error),

    /// The transfer's own socket failed.
    Socket(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol { code, message } => {
                write!(f, "Peer reported error {code}: '{message}'")
            }
            Self::RetryExhausted { retries } => {
                write!(f, "Peer unreachable: no reply after {retries} retransmissions")
            }
            Self::LocalIo(e) => write!(f, "Local file IO error: {e}"),
            Self::Socket(e) => write!(f, "Socket IO error: {e}"),
        }
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::IO(e) => TransferError::Socket(e),
            other => TransferError::Socket(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

/// Receive errors that some platforms report on an unconnected UDP socket after an ICMP
/// port-unreachable. They say nothing about the transfer itself.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

pub struct Transfer {
    sock: TftpSocket,
    peer: SocketAddr,
    bound: bool,
    config: TransferConfig,
}

impl Transfer {
    /// A transfer whose peer endpoint is not known yet. The first reply accepted by the
    /// processor decides it.
    pub fn new(sock: TftpSocket, peer: SocketAddr, config: TransferConfig) -> Transfer {
        Transfer { sock, peer, bound: false, config }
    }

    /// A transfer with a peer whose port is already settled, as is the case for a server
    /// answering a request.
    pub fn bound_to(sock: TftpSocket, peer: SocketAddr, config: TransferConfig) -> Transfer {
        Transfer { sock, peer, bound: true, config }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether a datagram from `src` belongs to this transfer.
    fn accepts(&self, src: SocketAddr) -> bool {
        !self.bound || src == self.peer
    }

    fn bind(&mut self, src: SocketAddr) {
        if !self.bound {
            log::debug!("Transfer with {} bound to {src}", self.peer);
            self.peer = src;
            self.bound = true;
        }
    }

    /// Sends a packet that nobody waits on an answer for. Failures are only logged.
    async fn send_courtesy(&self, packet: &Packet, dst: SocketAddr) {
        if let Err(e) = self.sock.send(packet, dst).await {
            log::debug!("Unable to send {packet} to {dst}: {e}");
        }
    }

    /// Runs the transfer to completion, starting by sending `initial`.
    ///
    /// Returns once the processor reports the transfer complete, the peer sends an Error, the
    /// retry budget is spent, or a local IO failure occurs.
    pub async fn run<P: PacketProcessor>(
        &mut self,
        initial: Packet,
        processor: &mut P,
    ) -> Result<(), TransferError> {
        let mut out_packet = initial;

        // Each pass of this loop puts one new packet in flight.
        loop {
            let mut retries = 0;

            // Each pass of this loop (re)sends the packet in flight.
            'send: loop {
                self.sock.send(&out_packet, self.peer).await?;
                let deadline = Instant::now() + self.config.timeout;

                loop {
                    let (packet, src) = match self.sock.recv_until(deadline).await {
                        Ok(received) => received,
                        Err(SocketError::Timeout(_)) => {
                            retries += 1;
                            if retries > self.config.max_retries {
                                log::warn!(
                                    "Giving up on {} after {} retransmissions of {out_packet}",
                                    self.peer,
                                    self.config.max_retries
                                );
                                return Err(TransferError::RetryExhausted {
                                    retries: self.config.max_retries,
                                });
                            }
                            log::info!(
                                "Timed out waiting on {}, resending {out_packet} ({retries}/{})",
                                self.peer,
                                self.config.max_retries
                            );
                            continue 'send;
                        }
                        Err(SocketError::MalformedPacket(msg)) => {
                            log::warn!("Discarding malformed packet: {msg}");
                            continue;
                        }
                        Err(SocketError::IO(e)) if is_transient(&e) => {
                            log::debug!("Ignoring transient receive error: {e}");
                            continue;
                        }
                        Err(SocketError::IO(e)) => return Err(TransferError::Socket(e)),
                    };

                    if !self.accepts(src) {
                        log::warn!("Got {packet} from unknown transfer ID {src}, discarding");
                        self.send_courtesy(
                            &Packet::error(
                                ErrorCode::UnknownTransferId,
                                "Packet does not belong to this transfer",
                            ),
                            src,
                        )
                        .await;
                        continue;
                    }

                    match processor.process_packet(packet).await {
                        ResultAction::RetryRecv => continue,
                        ResultAction::SendPacketAndAwait(p) => {
                            self.bind(src);
                            out_packet = p;
                            break 'send;
                        }
                        ResultAction::TerminateWithPacket(p) => {
                            self.bind(src);
                            self.sock.send(&p, self.peer).await?;
                            log::debug!("Transfer with {} complete", self.peer);
                            return Ok(());
                        }
                        ResultAction::CloseConnection => {
                            self.bind(src);
                            log::debug!("Transfer with {} complete", self.peer);
                            return Ok(());
                        }
                        ResultAction::Abort { notify, error } => {
                            self.bind(src);
                            if let Some(p) = notify {
                                self.send_courtesy(&p, self.peer).await;
                            }
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

/// Sends `packet` from `sock` to `dst` and ignores the outcome. Used for error packets on
/// paths where there is no transfer to abort.
pub async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let packet = Packet::error(code, message);
    if let Err(e) = sock.send(&packet, dst).await {
        log::debug!("Unable to send {packet} to {dst}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Receiver, Sender};
    use crate::tftp::DATA_BUFFER_SIZE;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    /// Data payload sizes for a transfer of `len` bytes. A length that is an exact multiple of
    /// the block size ends with an empty block.
    fn block_sizes(len: usize) -> Vec<usize> {
        let mut sizes = vec![DATA_BUFFER_SIZE; len / DATA_BUFFER_SIZE];
        sizes.push(len % DATA_BUFFER_SIZE);
        sizes
    }

    fn fast_config(max_retries: u32, timeout_ms: u64) -> TransferConfig {
        TransferConfig::default()
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_max_retries(max_retries)
    }

    fn local_socket() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    async fn fake_peer() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
    }

    async fn recv_packet(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0; 1024];
        let (n, src) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("peer never heard from the transfer")
            .unwrap();
        (Packet::decode(&buf[..n]).unwrap(), src)
    }

    async fn send_packet(sock: &UdpSocket, packet: Packet, dst: SocketAddr) {
        sock.send_to(&packet.encode(), dst).await.unwrap();
    }

    /// Drains whatever is queued at `sock`, waiting `quiet` for each further datagram.
    async fn drain(sock: &UdpSocket, quiet: Duration) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut buf = [0; 1024];
        while let Ok(Ok((n, _))) = timeout(quiet, sock.recv_from(&mut buf)).await {
            packets.push(Packet::decode(&buf[..n]).unwrap());
        }
        packets
    }

    #[tokio::test]
    async fn test_silent_peer_gets_exactly_max_retries_retransmissions() {
        let peer = fake_peer().await;
        let mut transfer = Transfer::new(local_socket(), peer.local_addr().unwrap(), fast_config(3, 30));
        let source: &[u8] = b"never delivered";
        let mut sender = Sender::new(source, 0);

        let result = transfer.run(Packet::write_request("f"), &mut sender).await;
        assert!(matches!(result, Err(TransferError::RetryExhausted { retries: 3 })));

        let sent = drain(&peer, Duration::from_millis(100)).await;
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|p| *p == Packet::write_request("f")));
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_reset_retry_budget() {
        let peer = fake_peer().await;
        let peer_addr = peer.local_addr().unwrap();
        let mut transfer = Transfer::new(local_socket(), peer_addr, fast_config(1, 150));
        let source: &[u8] = b"payload";
        let mut sender = Sender::new(source, 0);

        let script = tokio::spawn(async move {
            // Let the first send time out, then answer the retransmission with a stale ack.
            let (first, src) = recv_packet(&peer).await;
            assert_eq!(first, Packet::write_request("f"));
            let (second, _) = recv_packet(&peer).await;
            assert_eq!(second, Packet::write_request("f"));
            send_packet(&peer, Packet::Ack { block: 7 }, src).await;
            drain(&peer, Duration::from_millis(400)).await
        });

        let result = transfer.run(Packet::write_request("f"), &mut sender).await;
        assert!(matches!(result, Err(TransferError::RetryExhausted { retries: 1 })));
        // Nothing beyond the two request copies: the stale ack neither advanced the transfer
        // nor bought another retransmission.
        assert!(script.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_ack_is_ignored_then_transfer_continues() {
        let rendezvous = fake_peer().await;
        let mut transfer =
            Transfer::new(local_socket(), rendezvous.local_addr().unwrap(), fast_config(3, 2000));
        let source: &[u8] = b"hello";
        let mut sender = Sender::new(source, 0);

        let script = tokio::spawn(async move {
            let (_, client) = recv_packet(&rendezvous).await;
            let session = fake_peer().await;
            send_packet(&session, Packet::Ack { block: 4 }, client).await;
            send_packet(&session, Packet::Ack { block: 0 }, client).await;
            let (data, _) = recv_packet(&session).await;
            send_packet(&session, Packet::Ack { block: 1 }, client).await;
            data
        });

        transfer.run(Packet::write_request("f"), &mut sender).await.unwrap();
        assert_eq!(script.await.unwrap(), Packet::Data { block: 1, data: b"hello".to_vec() });
        assert_eq!(sender.bytes_transferred(), 5);
    }

    #[tokio::test]
    async fn test_first_reply_binds_transfer_id() {
        let rendezvous = fake_peer().await;
        let mut transfer =
            Transfer::new(local_socket(), rendezvous.local_addr().unwrap(), fast_config(3, 2000));
        let mut sink = Vec::new();
        let mut receiver = Receiver::new(&mut sink, 0);

        let script = tokio::spawn(async move {
            let (request, client) = recv_packet(&rendezvous).await;
            assert_eq!(request, Packet::read_request("f"));

            let session = fake_peer().await;
            let intruder = fake_peer().await;

            send_packet(&session, Packet::Data { block: 1, data: vec![0x11; 512] }, client).await;
            let (ack, _) = recv_packet(&session).await;
            assert_eq!(ack, Packet::Ack { block: 1 });

            // A different port on the same host is a different transfer.
            send_packet(&intruder, Packet::Data { block: 2, data: vec![0x66; 3] }, client).await;
            let (rejection, _) = recv_packet(&intruder).await;
            assert!(matches!(
                rejection,
                Packet::Error { code: ErrorCode::UnknownTransferId, .. }
            ));

            send_packet(&session, Packet::Data { block: 2, data: vec![0x22; 3] }, client).await;
            let (ack, _) = recv_packet(&session).await;
            assert_eq!(ack, Packet::Ack { block: 2 });
            session.local_addr().unwrap()
        });

        transfer.run(Packet::read_request("f"), &mut receiver).await.unwrap();
        let session_addr = script.await.unwrap();
        assert_eq!(transfer.peer(), session_addr);
        assert_eq!(receiver.bytes_transferred(), 515);
        drop(receiver);
        assert_eq!(&sink[..512], &[0x11; 512][..]);
        assert_eq!(&sink[512..], &[0x22; 3][..]);
    }

    #[tokio::test]
    async fn test_first_reply_may_come_from_another_address() {
        let rendezvous = UdpSocket::bind((Ipv4Addr::new(127, 0, 0, 2), 0)).await.unwrap();
        let mut transfer =
            Transfer::new(local_socket(), rendezvous.local_addr().unwrap(), fast_config(2, 2000));
        let mut sink = Vec::new();
        let mut receiver = Receiver::new(&mut sink, 0);

        let script = tokio::spawn(async move {
            let (_, client) = recv_packet(&rendezvous).await;
            let session = fake_peer().await;
            send_packet(&session, Packet::Data { block: 1, data: b"hello".to_vec() }, client).await;
            let (ack, _) = recv_packet(&session).await;
            assert_eq!(ack, Packet::Ack { block: 1 });
            session.local_addr().unwrap()
        });

        transfer.run(Packet::read_request("f"), &mut receiver).await.unwrap();
        assert_eq!(transfer.peer(), script.await.unwrap());
        drop(receiver);
        assert_eq!(sink, b"hello");
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_noise() {
        let peer = fake_peer().await;
        let peer_addr = peer.local_addr().unwrap();
        let mut sink = Vec::new();
        let mut receiver = Receiver::new(&mut sink, 0);
        let mut transfer = Transfer::bound_to(local_socket(), peer_addr, fast_config(3, 2000));

        let script = tokio::spawn(async move {
            let (ack, client) = recv_packet(&peer).await;
            assert_eq!(ack, Packet::Ack { block: 0 });
            peer.send_to(&[0x00, 0x09, 0xFF], client).await.unwrap();
            send_packet(&peer, Packet::Data { block: 1, data: b"ok".to_vec() }, client).await;
            recv_packet(&peer).await.0
        });

        transfer.run(Packet::Ack { block: 0 }, &mut receiver).await.unwrap();
        assert_eq!(script.await.unwrap(), Packet::Ack { block: 1 });
        drop(receiver);
        assert_eq!(sink, b"ok");
    }

    #[tokio::test]
    async fn test_peer_error_is_terminal() {
        let peer = fake_peer().await;
        let peer_addr = peer.local_addr().unwrap();
        let mut transfer = Transfer::new(local_socket(), peer_addr, fast_config(3, 2000));
        let mut sink = Vec::new();
        let mut receiver = Receiver::new(&mut sink, 0);

        let script = tokio::spawn(async move {
            let (_, client) = recv_packet(&peer).await;
            send_packet(&peer, Packet::error(ErrorCode::FileNotFound, "nope"), client).await;
            drain(&peer, Duration::from_millis(100)).await
        });

        let result = transfer.run(Packet::read_request("missing"), &mut receiver).await;
        match result {
            Err(TransferError::Protocol { code, message }) => {
                assert_eq!(code, ErrorCode::FileNotFound);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected result {other:?}"),
        }
        // No retry and no reply to an error.
        assert!(script.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receiving_side_writes_every_block_in_order() {
        let peer = fake_peer().await;
        let peer_addr = peer.local_addr().unwrap();
        let contents: Vec<u8> = (0..1536).map(|i| (i % 251) as u8).collect();
        let expected = contents.clone();
        let mut sink = Vec::new();
        let mut receiver = Receiver::new(&mut sink, 0);
        let mut transfer = Transfer::bound_to(local_socket(), peer_addr, fast_config(3, 2000));

        let script = tokio::spawn(async move {
            let (_, client) = recv_packet(&peer).await;
            let mut acks = Vec::new();
            let mut offset = 0;
            for (i, size) in block_sizes(contents.len()).into_iter().enumerate() {
                let data = contents[offset..offset + size].to_vec();
                offset += size;
                send_packet(&peer, Packet::Data { block: i as u16 + 1, data }, client).await;
                acks.push(recv_packet(&peer).await.0);
            }
            acks
        });

        transfer.run(Packet::Ack { block: 0 }, &mut receiver).await.unwrap();
        let acks = script.await.unwrap();
        assert_eq!(
            acks,
            (1..=4).map(|block| Packet::Ack { block }).collect::<Vec<_>>()
        );
        drop(receiver);
        assert_eq!(sink, expected);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(block_sizes(0), vec![0]);
        assert_eq!(block_sizes(1000), vec![512, 488]);
        assert_eq!(block_sizes(1024), vec![512, 512, 0]);
    }
}
