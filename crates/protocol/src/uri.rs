//! Stream URIs. Grounded in `original_source/src/uri.cpp`.
//!
//! A `ftl://host:port/path` (or `tcp://`, `ws://`, `wss://`, `file://`,
//! `cast://`, `mux://`) string names a stream without saying how to reach
//! it; `Universe`/`Self` resolve the scheme to a concrete transport.

use crate::error::{ErrorKind, ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ftl,
    Tcp,
    Ws,
    Wss,
    File,
    Cast,
    Mux,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ftl" => Some(Self::Ftl),
            "tcp" => Some(Self::Tcp),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            "file" => Some(Self::File),
            "cast" => Some(Self::Cast),
            "mux" => Some(Self::Mux),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ftl => "ftl",
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::File => "file",
            Self::Cast => "cast",
            Self::Mux => "mux",
        }
    }

    /// Schemes whose authority names a reachable network host, as opposed
    /// to a local resource (`file://`) or a purely logical grouping
    /// (`mux://`).
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Ftl | Self::Tcp | Self::Ws | Self::Wss | Self::Cast)
    }
}

/// A parsed stream URI: `scheme://host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Uri {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme_str, rest) = s.split_once("://").ok_or_else(|| {
            ProtocolError::new(ErrorKind::BadUri, format!("missing scheme in '{s}'"))
        })?;
        let scheme = Scheme::parse(scheme_str)
            .ok_or_else(|| ProtocolError::new(ErrorKind::BadUri, format!("unknown scheme '{scheme_str}'")))?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        if authority.is_empty() && scheme.is_network() {
            return Err(ProtocolError::new(ErrorKind::BadUri, format!("missing host in '{s}'")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::new(ErrorKind::BadUri, format!("bad port in '{s}'")))?;
                (h.to_string(), Some(port))
            }
            None => (authority.to_string(), None),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path: path.to_string(),
        })
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ftl_uri_with_port_and_path() {
        let uri = Uri::parse("ftl://example.com:9001/stream/a").unwrap();
        assert_eq!(uri.scheme, Scheme::Ftl);
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(9001));
        assert_eq!(uri.path, "/stream/a");
    }

    #[test]
    fn parses_file_uri_without_port() {
        let uri = Uri::parse("file:///tmp/recording.ftl").unwrap();
        assert_eq!(uri.scheme, Scheme::File);
        assert_eq!(uri.port, None);
        assert_eq!(uri.path, "/tmp/recording.ftl");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Uri::parse("http://example.com/").is_err());
    }

    #[test]
    fn rejects_missing_host_for_network_scheme() {
        assert!(Uri::parse("ftl:///path").is_err());
    }

    #[test]
    fn roundtrips_through_display() {
        let uri = Uri::parse("ws://localhost:8080/a").unwrap();
        assert_eq!(uri.to_string(), "ws://localhost:8080/a");
    }
}
