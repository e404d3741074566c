//! The per-request response façade: header buffering, the begin/body state
//! machine, `send_file` host-server detection, and cookie setting.
//!
//! Grounded on `original_source/src/Response.c`: `has_begun` gating every
//! header mutation, `begin()`'s fixed header order (session cookie, then
//! `Server:`, then user headers, then the blank-line separator), and
//! `send_file`'s `SERVER_SOFTWARE` sniffing.

use crate::error::Error;
use crate::header::{self, CookieOpts};
use std::io::Write;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A response in progress. Headers may only be added or changed before the
/// first byte goes out; [`Response::begin`] (called implicitly by
/// `write`/`finish` if needed) flips `has_begun` and nothing after that can
/// touch headers again.
pub struct Response<W: Write> {
    out: W,
    headers: Vec<String>,
    has_begun: bool,
    server_software: Option<String>,
    new_session_cookie: Option<(String, String)>,
}

impl<W: Write> Response<W> {
    pub fn new(out: W, server_software: Option<String>) -> Self {
        Response {
            out,
            headers: Vec::new(),
            has_begun: false,
            server_software,
            new_session_cookie: None,
        }
    }

    /// Called once per request, before dispatch, mirroring
    /// `smisk_Response_reset`.
    pub fn reset(&mut self) {
        self.has_begun = false;
        self.headers.clear();
        self.new_session_cookie = None;
    }

    pub fn has_begun(&self) -> bool {
        self.has_begun
    }

    /// Tell `begin()` to emit a session cookie for a freshly created
    /// session. `Application` calls this once per request, before the
    /// handler runs, whenever `SessionHandle::is_new()` is true.
    pub fn set_new_session_cookie(&mut self, cookie_name: impl Into<String>, session_id: impl Into<String>) {
        self.new_session_cookie = Some((cookie_name.into(), session_id.into()));
    }

    /// Index of the first header whose name starts with `prefix`.
    pub fn find_header(&self, prefix: &str) -> Option<usize> {
        let prefix_lower = prefix.to_ascii_lowercase();
        self.headers
            .iter()
            .position(|h| h.to_ascii_lowercase().starts_with(&prefix_lower))
    }

    /// Append a raw `Name: value` header line, verbatim.
    pub fn add_header(&mut self, line: impl Into<String>) -> Result<(), Error> {
        if self.has_begun {
            return Err(Error::user(HeadersAlreadyBegun));
        }
        self.headers.push(line.into());
        Ok(())
    }

    /// Append a formatted `Set-Cookie` header.
    pub fn set_cookie(&mut self, name: &str, value: &str, opts: &CookieOpts) -> Result<(), Error> {
        if self.has_begun {
            return Err(Error::user(HeadersAlreadyBegun));
        }
        let value = header::format_set_cookie(name, value, opts);
        self.headers.push(format!("Set-Cookie: {value}"));
        Ok(())
    }

    /// Tell the host server to serve `path` itself, via the sendfile-style
    /// header it understands. Fails if `SERVER_SOFTWARE` doesn't match a
    /// known server.
    pub fn send_file(&mut self, path: &str) -> Result<(), Error> {
        if self.has_begun {
            return Err(Error::user(HeadersAlreadyBegun));
        }
        let server = self.server_software.as_deref().unwrap_or("unknown server software");
        let header_name = if server.contains("lighttpd/1.4") {
            "X-LIGHTTPD-send-file"
        } else if server.contains("lighttpd/") || server.contains("Apache/2") {
            "X-Sendfile"
        } else if server.contains("nginx/") {
            "X-Accel-Redirect"
        } else {
            return Err(Error::user(SendFileUnsupported(server.to_string())));
        };
        self.headers.push(format!("{header_name}: {path}"));
        Ok(())
    }

    /// Emit the status-free CGI header block: an optional new-session
    /// `Set-Cookie`, the `Server` tag, then every user header, then the
    /// blank-line separator. A no-op if already begun.
    pub fn begin(&mut self) -> std::io::Result<()> {
        if self.has_begun {
            return Ok(());
        }

        if let Some((name, sid)) = &self.new_session_cookie {
            write!(self.out, "Set-Cookie: {name}={sid};Version=1;Path=/\r\n")?;
        }

        match &self.server_software {
            Some(server) => write!(self.out, "Server: {server} fcgi-runtime/{CRATE_VERSION}\r\n")?,
            None => write!(self.out, "Server: fcgi-runtime/{CRATE_VERSION}\r\n")?,
        }

        for header in &self.headers {
            self.out.write_all(header.as_bytes())?;
            self.out.write_all(b"\r\n")?;
        }

        self.out.write_all(b"\r\n")?;
        self.has_begun = true;
        Ok(())
    }

    /// Write body bytes, beginning the response first if needed.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.begin()?;
        self.out.write_all(data)
    }

    /// Write each item in turn, beginning the response before the first
    /// one, mirroring `smisk_Response_writelines`/`__call__`.
    pub fn writelines<'a, I: IntoIterator<Item = &'a [u8]>>(&mut self, lines: I) -> std::io::Result<()> {
        for line in lines {
            self.write(line)?;
        }
        Ok(())
    }

    /// Called once per request after the handler returns, ensuring headers
    /// go out even for a handler that never wrote a body.
    pub fn finish(&mut self) -> std::io::Result<()> {
        self.begin()?;
        self.out.flush()
    }

    /// Consume the response, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[derive(Debug, thiserror::Error)]
#[error("headers have already been sent; cannot modify them now")]
struct HeadersAlreadyBegun;

#[derive(Debug, thiserror::Error)]
#[error("sendfile not supported by host server ({0:?})")]
struct SendFileUnsupported(String);
