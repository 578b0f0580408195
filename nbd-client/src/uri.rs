//! NBD URIs.
//!
//! Supported forms:
//!
//! ```text
//! nbd://host[:port][/export]
//! nbds://host[:port][/export]
//! nbd+unix:///[export]?socket=/path/to/socket
//! nbds+unix:///[export]?socket=/path/to/socket
//! ```
//!
//! The `s` variants require TLS.

use std::fmt;
use std::path::PathBuf;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::Url;

use crate::error::{Error, Result};

pub const NBD_DEFAULT_PORT: u16 = 10809;

/// Bytes left unescaped when rebuilding a URI.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriTarget {
    Tcp { host: String, port: u16 },
    Unix { socket: PathBuf },
}

/// A parsed NBD URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdUri {
    pub tls: bool,
    pub target: UriTarget,
    pub export_name: String,
}

impl NbdUri {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| Error::uri(e.to_string()))?;

        let (tls, unix) = match url.scheme() {
            "nbd" => (false, false),
            "nbds" => (true, false),
            "nbd+unix" => (false, true),
            "nbds+unix" => (true, true),
            scheme => return Err(Error::uri(format!("unsupported scheme {scheme:?}"))),
        };

        let path = url.path();
        let export = path.strip_prefix('/').unwrap_or(path);
        let export_name = percent_decode(export)?;

        let target = if unix {
            if url.host_str().is_some_and(|h| !h.is_empty()) {
                return Err(Error::uri("unix socket URIs must not name a host"));
            }
            let socket = url
                .query()
                .unwrap_or_default()
                .split('&')
                .find_map(|pair| pair.strip_prefix("socket="))
                .ok_or_else(|| Error::uri("missing socket= query parameter"))?;
            UriTarget::Unix {
                socket: PathBuf::from(percent_decode(socket)?),
            }
        } else {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| Error::uri("missing host"))?;
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host)
                .to_string();
            UriTarget::Tcp {
                host,
                port: url.port().unwrap_or(NBD_DEFAULT_PORT),
            }
        };

        Ok(Self {
            tls,
            target,
            export_name,
        })
    }

    fn scheme(&self) -> &'static str {
        match (&self.target, self.tls) {
            (UriTarget::Tcp { .. }, false) => "nbd",
            (UriTarget::Tcp { .. }, true) => "nbds",
            (UriTarget::Unix { .. }, false) => "nbd+unix",
            (UriTarget::Unix { .. }, true) => "nbds+unix",
        }
    }
}

impl fmt::Display for NbdUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme())?;
        if let UriTarget::Tcp { host, port } = &self.target {
            if host.contains(':') {
                write!(f, "[{host}]")?;
            } else {
                f.write_str(host)?;
            }
            if *port != NBD_DEFAULT_PORT {
                write!(f, ":{port}")?;
            }
        }
        f.write_str("/")?;
        write!(f, "{}", utf8_percent_encode(&self.export_name, COMPONENT))?;
        if let UriTarget::Unix { socket } = &self.target {
            let socket = socket.to_string_lossy();
            write!(f, "?socket={}", utf8_percent_encode(&socket, COMPONENT))?;
        }
        Ok(())
    }
}

/// Undo `%XX` escapes only; `+` stays literal. A `%` not followed by two
/// hex digits is an error.
fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    for (i, _) in input.match_indices('%') {
        let escape = bytes.get(i + 1..i + 3);
        if !escape.is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit)) {
            return Err(Error::uri("malformed percent escape"));
        }
    }
    percent_decode_str(input)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::uri("URI component is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_uri_with_defaults() {
        let uri = NbdUri::parse("nbd://example.com").unwrap();
        assert!(!uri.tls);
        assert_eq!(
            uri.target,
            UriTarget::Tcp {
                host: "example.com".into(),
                port: NBD_DEFAULT_PORT
            }
        );
        assert_eq!(uri.export_name, "");
        assert_eq!(uri.to_string(), "nbd://example.com/");
    }

    #[test]
    fn tcp_uri_with_port_and_export() {
        let uri = NbdUri::parse("nbds://127.0.0.1:1234/disk%20one").unwrap();
        assert!(uri.tls);
        assert_eq!(uri.export_name, "disk one");
        assert_eq!(uri.to_string(), "nbds://127.0.0.1:1234/disk%20one");
    }

    #[test]
    fn ipv6_host_is_unbracketed() {
        let uri = NbdUri::parse("nbd://[::1]:10810/x").unwrap();
        assert_eq!(
            uri.target,
            UriTarget::Tcp {
                host: "::1".into(),
                port: 10810
            }
        );
        assert_eq!(uri.to_string(), "nbd://[::1]:10810/x");
    }

    #[test]
    fn unix_uri() {
        let uri = NbdUri::parse("nbd+unix:///export?socket=/tmp/nbd.sock").unwrap();
        assert_eq!(
            uri.target,
            UriTarget::Unix {
                socket: PathBuf::from("/tmp/nbd.sock")
            }
        );
        assert_eq!(uri.export_name, "export");
        assert_eq!(uri.to_string(), "nbd+unix:///export?socket=/tmp/nbd.sock");
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!(
            NbdUri::parse("http://example.com/"),
            Err(Error::Uri { .. })
        ));
        assert!(NbdUri::parse("nbd+unix:///export").is_err());
        assert!(NbdUri::parse("not a uri").is_err());
        assert!(NbdUri::parse("nbd:///export").is_err());
    }

    #[test]
    fn plus_in_socket_path_is_literal() {
        let uri = NbdUri::parse("nbd+unix:///e?socket=/tmp/a+b.sock").unwrap();
        assert_eq!(
            uri.target,
            UriTarget::Unix {
                socket: PathBuf::from("/tmp/a+b.sock")
            }
        );
        assert_eq!(uri.to_string(), "nbd+unix:///e?socket=/tmp/a%2Bb.sock");
        assert_eq!(NbdUri::parse(&uri.to_string()).unwrap(), uri);

        let uri = NbdUri::parse("nbd+unix:///?socket=/tmp/a%20b.sock").unwrap();
        assert_eq!(
            uri.target,
            UriTarget::Unix {
                socket: PathBuf::from("/tmp/a b.sock")
            }
        );
    }

    #[test]
    fn malformed_escapes_are_rejected() {
        for bad in [
            "nbd://h/a%+1b",
            "nbd://h/a%1",
            "nbd://h/a%zz",
            "nbd+unix:///e?socket=/tmp/%-1",
        ] {
            assert!(
                matches!(NbdUri::parse(bad), Err(Error::Uri { .. })),
                "{bad} should be rejected"
            );
        }
        assert_eq!(NbdUri::parse("nbd://h/a+b").unwrap().export_name, "a+b");
    }
}
