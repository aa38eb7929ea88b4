// Interactive client shell. Reads one command per line from stdin and turns it into Client
// calls. The retry settings live here and are copied into each Client as it is built, so a
// change only affects transfers started afterwards.

use crate::client::{self, Client};
use crate::config::TransferConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  connect <host> [port]      set the server to talk to
  get <remote> [local]       fetch a file (alias: 1)
  put <local> [remote]       store a file (alias: 2)
  timeout [ms]               show or set the retransmission timeout (alias: t)
  retries [n]                show or set the maximum retransmissions
  status                     show the current settings
  help                       show this text
  quit                       leave (alias: exit)";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: Option<String> },
    Get { remote: String, local: PathBuf },
    Put { local: PathBuf, remote: String },
    Timeout(Option<u64>),
    Retries(Option<u32>),
    Status,
    Help,
    Quit,
    Empty,
}

/// Last component of a path as given by the user, falling back to the whole string.
fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Ok(Command::Empty);
        };

        let command = match (name.to_ascii_lowercase().as_str(), args) {
            ("connect", [host]) => Command::Connect {
                host: host.to_string(),
                port: None,
            },
            ("connect", [host, port]) => Command::Connect {
                host: host.to_string(),
                port: Some(port.to_string()),
            },
            ("connect", _) => return Err("usage: connect <host> [port]".to_string()),

            ("get" | "1", [remote]) => Command::Get {
                remote: remote.to_string(),
                local: PathBuf::from(base_name(remote)),
            },
            ("get" | "1", [remote, local]) => Command::Get {
                remote: remote.to_string(),
                local: PathBuf::from(local),
            },
            ("get" | "1", _) => return Err("usage: get <remote> [local]".to_string()),

            ("put" | "2", [local]) => Command::Put {
                local: PathBuf::from(local),
                remote: base_name(local),
            },
            ("put" | "2", [local, remote]) => Command::Put {
                local: PathBuf::from(local),
                remote: remote.to_string(),
            },
            ("put" | "2", _) => return Err("usage: put <local> [remote]".to_string()),

            ("timeout" | "t", []) => Command::Timeout(None),
            ("timeout" | "t", [ms]) => match ms.parse::<u64>() {
                Ok(ms) if ms > 0 => Command::Timeout(Some(ms)),
                _ => return Err(format!("Timeout value {ms} is invalid")),
            },
            ("timeout" | "t", _) => return Err("usage: timeout [ms]".to_string()),

            ("retries", []) => Command::Retries(None),
            ("retries", [n]) => match n.parse::<u32>() {
                Ok(n) => Command::Retries(Some(n)),
                Err(_) => return Err(format!("Retry count {n} is invalid")),
            },
            ("retries", _) => return Err("usage: retries [n]".to_string()),

            ("status", []) => Command::Status,
            ("help" | "?", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            (other, _) => return Err(format!("Unknown command '{other}', try 'help'")),
        };
        Ok(command)
    }
}

pub struct Shell {
    target: Option<SocketAddr>,
    default_port: u16,
    config: TransferConfig,
}

impl Shell {
    pub fn new(target: Option<SocketAddr>, default_port: u16, config: TransferConfig) -> Shell {
        Shell {
            target,
            default_port,
            config,
        }
    }

    /// Reads commands from stdin until `quit` or end of input.
    pub async fn run(&mut self) -> io::Result<()> {
        let mut lines = BufReader::new(io::stdin()).lines();
        println!("tftp> type 'help' for a list of commands");

        while let Some(line) = lines.next_line().await? {
            match Command::parse(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(msg) => println!("{msg}"),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { host, port } => {
                let port = port.unwrap_or_else(|| self.default_port.to_string());
                match client::resolve_target(&host, &port).await {
                    Ok(addr) => {
                        println!("Connected to {addr}");
                        self.target = Some(addr);
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Command::Get { remote, local } => {
                let Some(client) = self.client() else { return };
                match client.fetch(&remote, &local).await {
                    Ok(bytes) => println!("Received {bytes} bytes into {}", local.display()),
                    Err(e) => println!("Transfer failed: {e}"),
                }
            }
            Command::Put { local, remote } => {
                let Some(client) = self.client() else { return };
                match client.store(&local, &remote).await {
                    Ok(bytes) => println!("Sent {bytes} bytes as {remote}"),
                    Err(e) => println!("Transfer failed: {e}"),
                }
            }
            Command::Timeout(Some(ms)) => {
                self.config = self.config.with_timeout(Duration::from_millis(ms));
                println!("Timeout set to {ms} ms");
            }
            Command::Timeout(None) => println!("Timeout is {} ms", self.config.timeout.as_millis()),
            Command::Retries(Some(n)) => {
                self.config = self.config.with_max_retries(n);
                println!("Max retries set to {n}");
            }
            Command::Retries(None) => println!("Max retries is {}", self.config.max_retries),
            Command::Status => {
                match self.target {
                    Some(addr) => println!("Connected to {addr}"),
                    None => println!("Not connected"),
                }
                println!(
                    "Timeout {} ms, max retries {}",
                    self.config.timeout.as_millis(),
                    self.config.max_retries
                );
            }
            Command::Help => println!("{HELP}"),
            Command::Quit | Command::Empty => {}
        }
    }

    fn client(&self) -> Option<Client> {
        match self.target {
            Some(addr) => Some(Client::new(addr, self.config)),
            None => {
                println!("Not connected, use 'connect <host> [port]' first");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        assert_eq!(
            Command::parse("connect localhost"),
            Ok(Command::Connect { host: "localhost".to_string(), port: None })
        );
        assert_eq!(
            Command::parse("  CONNECT 10.0.0.1 6969 "),
            Ok(Command::Connect {
                host: "10.0.0.1".to_string(),
                port: Some("6969".to_string())
            })
        );
        assert!(Command::parse("connect").is_err());
    }

    #[test]
    fn test_parse_get_defaults_local_name() {
        assert_eq!(
            Command::parse("get boot/pxelinux.0"),
            Ok(Command::Get {
                remote: "boot/pxelinux.0".to_string(),
                local: PathBuf::from("pxelinux.0")
            })
        );
        assert_eq!(
            Command::parse("1 a.bin /tmp/b.bin"),
            Ok(Command::Get {
                remote: "a.bin".to_string(),
                local: PathBuf::from("/tmp/b.bin")
            })
        );
        assert!(Command::parse("get").is_err());
    }

    #[test]
    fn test_parse_put_defaults_remote_name() {
        assert_eq!(
            Command::parse("put /home/me/notes.txt"),
            Ok(Command::Put {
                local: PathBuf::from("/home/me/notes.txt"),
                remote: "notes.txt".to_string()
            })
        );
        assert_eq!(
            Command::parse("2 notes.txt remote.txt"),
            Ok(Command::Put {
                local: PathBuf::from("notes.txt"),
                remote: "remote.txt".to_string()
            })
        );
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!(Command::parse("timeout"), Ok(Command::Timeout(None)));
        assert_eq!(Command::parse("t 2500"), Ok(Command::Timeout(Some(2500))));
        assert!(Command::parse("t 0").is_err());
        assert!(Command::parse("t soon").is_err());
        assert_eq!(Command::parse("retries 3"), Ok(Command::Retries(Some(3))));
        assert_eq!(Command::parse("retries"), Ok(Command::Retries(None)));
        assert!(Command::parse("retries -1").is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(Command::parse(""), Ok(Command::Empty));
        assert_eq!(Command::parse("   "), Ok(Command::Empty));
        assert_eq!(Command::parse("status"), Ok(Command::Status));
        assert_eq!(Command::parse("help"), Ok(Command::Help));
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
        assert_eq!(Command::parse("exit"), Ok(Command::Quit));
        assert!(Command::parse("frobnicate").is_err());
    }
}
