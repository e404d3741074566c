//! A FastCGI application runtime: request decoding, sessions, and response
//! streaming for a user-supplied service handler.
//!
//! FastCGI is an antique and awkward app server protocol that, despite its
//! limitations, enabled an ease of app deployment and maintenance that has
//! yet to be matched by modern tooling and infrastructure — throw a binary
//! up on shared hosting behind `mod_fcgid` or nginx's `fastcgi_pass` and
//! forget about it. This crate is the part of that story that doesn't
//! change from one app to the next: decoding the wire protocol into a
//! request, buffering/streaming the response, and keeping session state
//! across requests. You supply a [`app::Service`] — one function from
//! request to response — and [`app::Application`] does the rest.
//!
//! ```no_run
//! use fcgi_runtime::app::{Application, Service};
//! use fcgi_runtime::config::Config;
//! use fcgi_runtime::error::Error;
//! use fcgi_runtime::request::Request;
//! use fcgi_runtime::response::Response;
//! use fcgi_runtime::session::file_store::FileSessionStore;
//! use fcgi_runtime::wire::ListenAddress;
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! fn hello(req: &Request, res: &mut Response<&mut dyn Write>) -> Result<(), Error> {
//!     res.add_header("Content-Type: text/plain")?;
//!     res.write(format!("hello, {}\n", req.url()).as_bytes())?;
//!     Ok(())
//! }
//!
//! # fn run() -> Result<(), Error> {
//! let config = Config::default();
//! let sessions = Arc::new(FileSessionStore::new(
//!     std::env::temp_dir().join("fcgi-runtime-sessions"),
//!     "sess_".to_string(),
//!     config.session_cookie_name.clone(),
//!     std::time::Duration::from_secs(config.session_ttl_secs),
//! )?);
//! let app = Application::new(config, sessions, Arc::new(hello));
//! app.run(ListenAddress::Stdin)?;
//! # Ok(())
//! # }
//! ```
//!
//! This crate is in an experimental state. It currently assumes a
//! single-threaded-per-worker deployment model (the OS, not an async
//! runtime, provides concurrency across `Config::forks` sibling
//! processes) — should be feasible to layer an async facade on top later,
//! but that's not what's here today.

pub mod app;
pub mod config;
pub mod error;
pub mod header;
pub mod multipart;
pub mod request;
pub mod response;
pub mod session;
pub mod uid;
pub mod url;
pub mod wire;

pub use app::{Application, Service};
pub use config::Config;
pub use error::Error;
pub use request::Request;
pub use response::Response;
