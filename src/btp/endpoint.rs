//! Where the IUT's BTP listener lives and how to open it.

use core::fmt;
use core::str::FromStr;
use std::path::PathBuf;

use log::{debug, info};
use tokio::time::Duration;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

use super::client::BtpIo;
use super::error::Error;

/// Default auto-pts socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/bt-stack-tester";

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A BTP transport endpoint.
///
/// Textual forms: `tcp:HOST:PORT`, `unix:PATH` (or `unix` alone for the
/// default socket path) and `serial:PATH[@BAUD]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
    Serial { path: String, baud: u32 },
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidEndpoint(s.to_string());
        let (scheme, rest) = match s.split_once(':') {
            Some((scheme, rest)) => (scheme, rest),
            None => (s, ""),
        };
        match scheme {
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(invalid());
                }
                Ok(Endpoint::Tcp(rest.to_string()))
            }
            "unix" if rest.is_empty() => Ok(Endpoint::default()),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(rest))),
            "serial" => {
                let (path, baud) = match rest.split_once('@') {
                    Some((path, baud)) => (path, baud.parse::<u32>().map_err(|_| invalid())?),
                    None => (rest, DEFAULT_BAUD_RATE),
                };
                if path.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Serial {
                    path: path.to_string(),
                    baud,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Serial { path, baud } => write!(f, "serial:{}@{}", path, baud),
        }
    }
}

impl Endpoint {
    /// Open the underlying stream.
    pub async fn open(&self) -> Result<Box<dyn BtpIo>, Error> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(Error::InvalidEndpoint(self.to_string())),
            Endpoint::Serial { path, baud } => {
                let mut port = SerialStream::open(
                    &tokio_serial::new(path.as_str(), *baud)
                        .data_bits(DataBits::Eight)
                        .parity(Parity::None)
                        .stop_bits(StopBits::One),
                )
                .map_err(|e| Error::from(std::io::Error::from(e)))?;
                drain_input(&mut port).await;
                info!("Opened {} at {} baud", path, baud);
                Ok(Box::new(port))
            }
        }
    }
}

/// Discard whatever the board printed before the link was opened.
async fn drain_input(port: &mut SerialStream) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut drained = 0usize;
    loop {
        let mut buf = [0; 64];
        match port.try_read(&mut buf[..]) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(_) => break,
        }
    }
    if drained > 0 {
        debug!("Drained {} stale byte(s)", drained);
    }
}
