// The server listener. It owns the well-known port and does nothing there except accept
// requests: every ReadReq or WriteReq gets its own ServerRequestHandler on its own task and its
// own port, and the listener goes straight back to waiting. Anything else arriving on the
// well-known port is dropped.

use crate::config::ServerConfig;
use crate::handler::ServerRequestHandler;
use crate::tftp::{Packet, SocketError, TftpResult, TftpSocket};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Pause after the first failed receive. Doubles with each further consecutive failure.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How long the listener waits after `failures` receive errors in a row.
fn recv_error_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    RECV_ERROR_BACKOFF
        .saturating_mul(1 << doublings)
        .min(MAX_RECV_ERROR_BACKOFF)
}

pub struct Server {
    sock: TftpSocket,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the listening socket described by `config`.
    pub fn bind(config: ServerConfig) -> TftpResult<Server> {
        let sock = TftpSocket::bind(SocketAddr::new(config.ip, config.port))?;
        log::info!(
            "Serving {} on {}",
            config.root.display(),
            sock.local_addr()?
        );
        Ok(Server {
            sock,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Accepts requests until `shutdown` resolves. Transfers already handed off keep running.
    pub async fn serve_until<F: Future<Output = ()>>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.sock.recv() => match received {
                    Ok((packet, src)) => {
                        failures = 0;
                        self.dispatch(packet, src);
                    }
                    Err(SocketError::MalformedPacket(msg)) => {
                        log::debug!("Discarding request: {msg}");
                    }
                    Err(e) => {
                        failures += 1;
                        let pause = recv_error_backoff(failures);
                        log::warn!("Failed to receive request: {e}, pausing {pause:?}");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
            }
        }
        log::info!("Listener shutting down");
    }

    fn dispatch(&self, packet: Packet, src: SocketAddr) {
        match packet {
            Packet::ReadReq { .. } | Packet::WriteReq { .. } => {
                log::info!("{packet} from {src}");
                let config = Arc::clone(&self.config);
                tokio::spawn(async move {
                    match ServerRequestHandler::new(&config, packet, src).await {
                        Ok(handler) => {
                            // Outcome is logged by the handler.
                            let _ = handler.handle().await;
                        }
                        Err(e) => log::warn!("Refused request from {src}: {e}"),
                    }
                });
            }
            other => log::debug!("Ignoring {other} from {src} on the request port"),
        }
    }
}
