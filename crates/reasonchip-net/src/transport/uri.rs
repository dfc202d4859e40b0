//! Transport URIs: `tcp://host:port` and `unix:///path/to.sock`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::{ClientTransport, ServerTransport, TcpClientTransport, TcpServerTransport, TransportError};
#[cfg(unix)]
use super::{UnixClientTransport, UnixServerTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUri {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for TransportUri {
    type Err = TransportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUri(raw.to_string()))?;
        match scheme {
            "tcp" => {
                if rest.is_empty() || !rest.contains(':') {
                    return Err(TransportError::InvalidUri(raw.to_string()));
                }
                Ok(TransportUri::Tcp(rest.to_string()))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidUri(raw.to_string()));
                }
                Ok(TransportUri::Unix(PathBuf::from(rest)))
            }
            _ => Err(TransportError::UnsupportedScheme(raw.to_string())),
        }
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUri::Tcp(addr) => write!(f, "tcp://{addr}"),
            TransportUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Build the client transport for a URI. No I/O happens until `connect`.
pub fn client_transport(uri: &TransportUri) -> Result<Arc<dyn ClientTransport>, TransportError> {
    match uri {
        TransportUri::Tcp(addr) => Ok(Arc::new(TcpClientTransport::new(addr.clone()))),
        #[cfg(unix)]
        TransportUri::Unix(path) => Ok(Arc::new(UnixClientTransport::new(path.clone()))),
        #[cfg(not(unix))]
        TransportUri::Unix(_) => Err(TransportError::UnsupportedScheme(uri.to_string())),
    }
}

/// Build the server transport for a URI. No I/O happens until `start`.
pub fn server_transport(uri: &TransportUri) -> Result<Arc<dyn ServerTransport>, TransportError> {
    match uri {
        TransportUri::Tcp(addr) => Ok(Arc::new(TcpServerTransport::new(addr.clone()))),
        #[cfg(unix)]
        TransportUri::Unix(path) => Ok(Arc::new(UnixServerTransport::new(path.clone()))),
        #[cfg(not(unix))]
        TransportUri::Unix(_) => Err(TransportError::UnsupportedScheme(uri.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_and_unix() {
        assert_eq!(
            "tcp://127.0.0.1:51001".parse::<TransportUri>().unwrap(),
            TransportUri::Tcp("127.0.0.1:51001".to_string())
        );
        assert_eq!(
            "unix:///tmp/rc.sock".parse::<TransportUri>().unwrap(),
            TransportUri::Unix(PathBuf::from("/tmp/rc.sock"))
        );
    }

    #[test]
    fn test_reject_bad_uris() {
        assert!(matches!(
            "grpc://host:1".parse::<TransportUri>(),
            Err(TransportError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp://".parse::<TransportUri>(),
            Err(TransportError::InvalidUri(_))
        ));
        assert!(matches!(
            "no-scheme".parse::<TransportUri>(),
            Err(TransportError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["tcp://0.0.0.0:51001", "unix:///var/run/rc.sock"] {
            let uri: TransportUri = raw.parse().unwrap();
            assert_eq!(uri.to_string(), raw);
        }
    }
}
