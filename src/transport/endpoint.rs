//! Endpoint URLs.
//!
//! - `inproc://<name>` - in-process queues owned by a runtime
//! - `tcp://<host>:<port>` - TCP socket (port 0 binds an ephemeral port)
//! - `ipc://<path>` or `unix://<path>` - Unix domain socket

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::TransportError;

/// `sun_path` is 104 bytes on macOS, 108 on Linux; use the conservative limit.
pub const MAX_SOCKET_PATH: usize = 104;

/// A parsed transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Same-process queues.
    Inproc(String),
    /// `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Short scheme label, used as the connection-id prefix.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Inproc(_) => "inproc",
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "ipc",
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| TransportError::InvalidEndpoint(format!("{url}: {why}"));
        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if rest.is_empty() {
            return Err(invalid("empty address"));
        }
        match scheme {
            "inproc" => Ok(Self::Inproc(rest.to_string())),
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                Ok(Self::Tcp(rest.to_string()))
            }
            "ipc" | "unix" => {
                if rest.len() >= MAX_SOCKET_PATH {
                    return Err(invalid(&format!(
                        "socket path too long ({} bytes, max {})",
                        rest.len(),
                        MAX_SOCKET_PATH - 1
                    )));
                }
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inproc(name) => write!(f, "inproc://{name}"),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
