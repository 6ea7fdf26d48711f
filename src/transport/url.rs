//! Dial-in URL parsing.
//!
//! Daemons reach a pool through one of four schemes:
//! `tcp://host:port`, `tls+tcp://host:port`, `ipc:///path/to/socket`,
//! and `abstract://name` (Linux abstract namespace). Port 0 asks the
//! listener for an ephemeral port; the bound port is substituted back
//! into the stored URL.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("unknown url scheme in {0:?}")]
    UnknownScheme(String),
    #[error("missing `://` separator in {0:?}")]
    MissingSeparator(String),
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("unterminated `[` in host of {0:?}")]
    UnterminatedBracket(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
    #[error("empty socket path in {0:?}")]
    EmptyPath(String),
}

/// A parsed dial-in URL. Hosts are stored without brackets; `Display`
/// re-brackets IPv6 literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialUrl {
    Tcp { host: String, port: u16 },
    TlsTcp { host: String, port: u16 },
    Ipc { path: PathBuf },
    Abstract { name: String },
}

impl DialUrl {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| UrlError::MissingSeparator(input.to_string()))?;
        match scheme {
            "tcp" => {
                let (host, port) = parse_host_port(input, rest)?;
                Ok(DialUrl::Tcp { host, port })
            }
            "tls+tcp" => {
                let (host, port) = parse_host_port(input, rest)?;
                Ok(DialUrl::TlsTcp { host, port })
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(UrlError::EmptyPath(input.to_string()));
                }
                Ok(DialUrl::Ipc {
                    path: PathBuf::from(rest),
                })
            }
            "abstract" => {
                if rest.is_empty() {
                    return Err(UrlError::EmptyPath(input.to_string()));
                }
                Ok(DialUrl::Abstract {
                    name: rest.to_string(),
                })
            }
            _ => Err(UrlError::UnknownScheme(input.to_string())),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, DialUrl::TlsTcp { .. })
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            DialUrl::Tcp { port, .. } | DialUrl::TlsTcp { port, .. } => Some(*port),
            _ => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            DialUrl::Tcp { host, .. } | DialUrl::TlsTcp { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Substitute the actually-bound port (wildcard-port resolution).
    pub fn with_port(&self, new_port: u16) -> Self {
        match self {
            DialUrl::Tcp { host, .. } => DialUrl::Tcp {
                host: host.clone(),
                port: new_port,
            },
            DialUrl::TlsTcp { host, .. } => DialUrl::TlsTcp {
                host: host.clone(),
                port: new_port,
            },
            other => other.clone(),
        }
    }
}

fn parse_host_port(input: &str, rest: &str) -> Result<(String, u16), UrlError> {
    let (host, port_str) = if let Some(stripped) = rest.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| UrlError::UnterminatedBracket(input.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| UrlError::MissingPort(input.to_string()))?;
        (host, port)
    } else {
        rest.rsplit_once(':')
            .ok_or_else(|| UrlError::MissingPort(input.to_string()))?
    };
    if host.is_empty() {
        return Err(UrlError::EmptyHost(input.to_string()));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| UrlError::InvalidPort(input.to_string()))?;
    Ok((host.to_string(), port))
}

fn fmt_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

impl fmt::Display for DialUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialUrl::Tcp { host, port } => write!(f, "tcp://{}:{}", fmt_host(host), port),
            DialUrl::TlsTcp { host, port } => write!(f, "tls+tcp://{}:{}", fmt_host(host), port),
            DialUrl::Ipc { path } => write!(f, "ipc://{}", path.display()),
            DialUrl::Abstract { name } => write!(f, "abstract://{name}"),
        }
    }
}
