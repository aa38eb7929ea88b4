use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(7000);
pub const DEFAULT_MAX_RETRIES: u32 = 15;
pub const DEFAULT_PORT: u16 = 69;

/// Retransmission policy for a single transfer.
///
/// Handed by value to every client session and request handler when it is built, so changing
/// it never affects a transfer that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long to wait for a reply before resending the last packet.
    pub timeout: Duration,
    /// How many times the same packet may be resent before the transfer is abandoned.
    pub max_retries: u32,
}

impl TransferConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// TFTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address to listen on. Transfer endpoints bind to the same address.
    pub ip: IpAddr,
    /// Well-known port requests arrive on
    pub port: u16,
    /// Directory that request filenames are resolved against
    pub root: PathBuf,
    /// Ports transfer endpoints pick from. `None` lets the OS choose.
    pub port_range: Option<RangeInclusive<u16>>,
    /// Reject all write requests
    pub read_only: bool,
    /// Replace existing files on write instead of refusing them
    pub overwrite: bool,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    pub fn new(ip: IpAddr, port: u16, root: PathBuf) -> Self {
        Self {
            ip,
            port,
            root,
            port_range: None,
            read_only: false,
            overwrite: true,
            transfer: TransferConfig::default(),
        }
    }

    pub fn with_port_range(mut self, port_range: Option<RangeInclusive<u16>>) -> Self {
        self.port_range = port_range;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT, PathBuf::from("."))
    }
}

/// Parses a `LO-HI` port range as given on the command line.
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LO-HI, got '{s}'"))?;
    let lo: u16 = lo.trim().parse().map_err(|_| format!("invalid port '{lo}'"))?;
    let hi: u16 = hi.trim().parse().map_err(|_| format!("invalid port '{hi}'"))?;
    if lo == 0 || lo > hi {
        return Err(format!("invalid port range {lo}-{hi}"));
    }
    Ok(lo..=hi)
}
