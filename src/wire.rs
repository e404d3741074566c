//! The FastCGI wire adapter: listen-address parsing/binding and the
//! mechanism used to unblock a pending `accept()` during shutdown.
//!
//! Grounded on `original_source/src/Application.c`'s `FCGX_InitRequest`
//! (stdin-fd-0 vs. an explicit listen socket) and
//! `other_examples/09a417ec_fourdollars-rust-playground__fcgi-app-src-main.rs.rs`,
//! which is real, idiomatic use of the synchronous `fastcgi` crate this
//! runtime is built on (`fastcgi::run`/`fastcgi::run_raw`).

use crate::error::ConfigError;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

/// Where to listen for FastCGI connections, parsed from a single
/// configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Inherit fd 0 from the process's parent (the traditional
    /// spawned-by-the-web-server FastCGI mode).
    Stdin,
    /// A Unix domain socket at an absolute path.
    Unix(PathBuf),
    /// A TCP socket. `host` is empty for `*`/`:PORT` (bind all interfaces).
    Tcp { host: String, port: u16 },
}

/// Parse `:PORT`, `*:PORT`, `HOST:PORT`, an absolute path, or the literal
/// `stdin`.
pub fn parse_listen_address(s: &str) -> Result<ListenAddress, ConfigError> {
    if s == "stdin" || s.is_empty() {
        return Ok(ListenAddress::Stdin);
    }
    if s.starts_with('/') {
        return Ok(ListenAddress::Unix(PathBuf::from(s)));
    }
    let Some((host, port)) = s.rsplit_once(':') else {
        return Err(ConfigError::ListenNotBound(s.to_string()));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::ListenNotBound(s.to_string()))?;
    let host = if host.is_empty() || host == "*" {
        String::new()
    } else {
        host.to_string()
    };
    Ok(ListenAddress::Tcp { host, port })
}

/// An open listener plus the raw fd `fastcgi::run_raw` needs. Keeping the
/// listener alive for the lifetime of the accept loop is the caller's
/// responsibility — dropping it closes the fd.
pub enum Listener {
    Stdin,
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    pub fn bind(addr: &ListenAddress) -> std::io::Result<Listener> {
        match addr {
            ListenAddress::Stdin => Ok(Listener::Stdin),
            ListenAddress::Unix(path) => {
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            ListenAddress::Tcp { host, port } => {
                let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
                Ok(Listener::Tcp(TcpListener::bind((bind_host.as_ref(), *port))?))
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Stdin => 0,
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

/// Force a blocked `accept()` on `fd` to return, the way `_sighandler_close_fcgi`
/// called `FCGX_ShutdownPending()`. `shutdown(2)` on a listening socket —
/// unlike `close(2)` — has well-defined behavior when another thread is
/// blocked in `accept()` on the same fd: the accept fails instead of racing
/// with the fd being reused.
pub fn trigger_shutdown(fd: RawFd) -> nix::Result<()> {
    use nix::sys::socket::{shutdown, Shutdown};
    shutdown(fd, Shutdown::Both)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_port() {
        assert_eq!(
            parse_listen_address(":9000").unwrap(),
            ListenAddress::Tcp { host: String::new(), port: 9000 }
        );
        assert_eq!(
            parse_listen_address("*:9000").unwrap(),
            ListenAddress::Tcp { host: String::new(), port: 9000 }
        );
    }

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_listen_address("127.0.0.1:9000").unwrap(),
            ListenAddress::Tcp { host: "127.0.0.1".to_string(), port: 9000 }
        );
    }

    #[test]
    fn parses_unix_path() {
        assert_eq!(
            parse_listen_address("/tmp/app.sock").unwrap(),
            ListenAddress::Unix(PathBuf::from("/tmp/app.sock"))
        );
    }

    #[test]
    fn parses_stdin() {
        assert_eq!(parse_listen_address("stdin").unwrap(), ListenAddress::Stdin);
        assert_eq!(parse_listen_address("").unwrap(), ListenAddress::Stdin);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_listen_address("not-a-valid-address-at-all").is_err());
    }
}
