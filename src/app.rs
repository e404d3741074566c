//! The application runtime: pre-fork workers, signal-driven graceful
//! shutdown, and the per-request dispatch loop around the synchronous
//! `fastcgi` crate.
//!
//! Grounded on `original_source/src/Application.c`'s `smisk_Application_run`
//! (fork-then-accept-loop shape, signal save/restore, `FCGX_IsCGI`-style
//! stdin fallback) and its `_fork`/`_wait_for_child_procs` helpers. Where the
//! original ran a single process juggling libfcgi's internal request queue,
//! this runtime gets its concurrency from the OS scheduling `accept()`
//! across `forks` sibling processes that all inherit the same listening fd —
//! no event loop, no thread pool, one request in flight per process at a
//! time.

use crate::config::Config;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::session::SessionStore;
use crate::wire::{self, ListenAddress, Listener};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// A user-supplied request handler. `Application` builds the `Request` and
/// `Response` for each incoming FastCGI call and hands them to `call`; the
/// handler's only job is to read from `req` and write to `res`.
///
/// `Response`'s writer is type-erased to `&mut dyn Write` so this trait stays
/// object-safe regardless of what stream type the wire adapter hands back.
pub trait Service: Send + Sync {
    fn call(&self, req: &Request, res: &mut Response<&mut dyn Write>) -> Result<(), Error>;
}

impl<F> Service for F
where
    F: Fn(&Request, &mut Response<&mut dyn Write>) -> Result<(), Error> + Send + Sync,
{
    fn call(&self, req: &Request, res: &mut Response<&mut dyn Write>) -> Result<(), Error> {
        self(req, res)
    }
}

/// Tracks the most recent terminating signal received, so it can be
/// re-raised against ourselves once cleanup finishes — mirroring the global
/// `smisk_Application_trapped_signal` in the original.
static TRAPPED_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// The application runtime. Owns the configuration, the session store, and
/// the service handler for the lifetime of the process (and every forked
/// copy of it).
pub struct Application {
    config: Config,
    sessions: Arc<dyn SessionStore>,
    service: Arc<dyn Service>,
}

impl Application {
    pub fn new(config: Config, sessions: Arc<dyn SessionStore>, service: Arc<dyn Service>) -> Self {
        Application { config, sessions, service }
    }

    /// Pre-fork `self.config.forks` extra worker processes, install signal
    /// handlers, and run the accept loop until a shutdown signal arrives or
    /// [`Application::exit`] is called from within a handler. Blocks until
    /// every worker this process started (if any) has exited.
    pub fn run(&self, listen: ListenAddress) -> Result<(), Error> {
        let listener = Listener::bind(&listen).map_err(Error::Wire)?;
        let fd = listener.as_raw_fd();

        let mut child_pids = Vec::new();
        let is_parent = self.fork_workers(&mut child_pids)?;

        let signals = Signals::new([SIGINT, SIGHUP, SIGTERM, SIGUSR1]).map_err(Error::Wire)?;
        let signals_handle = signals.handle();
        let watcher = self.spawn_signal_watcher(signals, fd);

        tracing::info!(pid = std::process::id(), "entering accept loop");
        let run_result = self.accept_loop(&listener);
        signals_handle.close();
        let _ = watcher.join();

        drop(listener);

        if is_parent {
            self.reap_workers(&child_pids);
        }

        let trapped = TRAPPED_SIGNAL.swap(0, Ordering::SeqCst);
        if trapped != 0 && trapped != SIGUSR1 {
            tracing::info!(signal = trapped, "re-raising trapped signal after shutdown");
            let sig = Signal::try_from(trapped).expect("only signals we registered are trapped");
            let _ = signal::raise(sig);
        }

        run_result
    }

    /// Send ourselves `SIGUSR1`, the same graceful-stop trigger a signal
    /// handler would use, but from inside a running handler. Mirrors
    /// `smisk_Application_exit`'s use of a signal the accept loop treats as
    /// "stop, but don't propagate" rather than a real termination request.
    pub fn exit() {
        let _ = signal::raise(Signal::SIGUSR1);
    }

    fn fork_workers(&self, child_pids: &mut Vec<Pid>) -> Result<bool, Error> {
        for _ in 0..self.config.forks {
            // Safety: no threads have been spawned yet at this point in
            // `run` (the signal watcher starts after forking), so forking
            // here can't leave a child with a half-locked mutex held by a
            // thread that doesn't exist in it.
            match unsafe { fork() }.map_err(|e| Error::Wire(std::io::Error::from(e)))? {
                ForkResult::Parent { child } => child_pids.push(child),
                ForkResult::Child => return Ok(false),
            }
        }
        Ok(true)
    }

    fn reap_workers(&self, child_pids: &[Pid]) {
        for pid in child_pids {
            match waitpid(*pid, None) {
                Ok(WaitStatus::Exited(p, code)) => {
                    tracing::info!(pid = p.as_raw(), code, "worker exited");
                }
                Ok(WaitStatus::Signaled(p, sig, _)) => {
                    tracing::warn!(pid = p.as_raw(), ?sig, "worker killed by signal");
                }
                Ok(other) => tracing::debug!(?other, "worker wait status"),
                Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "waitpid failed"),
            }
        }
    }

    fn spawn_signal_watcher(&self, mut signals: Signals, fd: std::os::unix::io::RawFd) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                tracing::info!(signal = sig, "received shutdown signal");
                TRAPPED_SIGNAL.store(sig, Ordering::SeqCst);
                if let Err(e) = wire::trigger_shutdown(fd) {
                    tracing::warn!(error = %e, "failed to unblock pending accept()");
                }
            }
        })
    }

    fn accept_loop(&self, listener: &Listener) -> Result<(), Error> {
        // Cloned (not borrowed) so the closure below is `'static` — the
        // `fastcgi` crate's run loop may dispatch connections on its own
        // worker threads, which rules out borrowing from `&self`.
        let config = self.config.clone();
        let sessions = self.sessions.clone();
        let service = self.service.clone();
        let fd = listener.as_raw_fd();

        let outcome = match listener {
            Listener::Stdin => fastcgi::run(move |mut req| {
                if let Err(e) = dispatch(&mut req, &config, sessions.as_ref(), service.as_ref()) {
                    tracing::error!(error = %e, "request dispatch failed");
                }
            }),
            _ => fastcgi::run_raw(
                move |mut req| {
                    if let Err(e) = dispatch(&mut req, &config, sessions.as_ref(), service.as_ref()) {
                        tracing::error!(error = %e, "request dispatch failed");
                    }
                },
                fd,
            ),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if TRAPPED_SIGNAL.load(Ordering::SeqCst) != 0 => {
                tracing::debug!(error = %e, "accept loop ended by shutdown signal");
                Ok(())
            }
            Err(e) => Err(Error::Wire(e)),
        }
    }
}

/// Build a `Request`/`Response` pair around one accepted FastCGI connection,
/// run the session lifecycle and the handler, and flush a response no
/// matter what the handler did.
fn dispatch(
    req: &mut fastcgi::Request,
    config: &Config,
    sessions: &dyn SessionStore,
    service: &dyn Service,
) -> Result<(), Error> {
    let env: std::collections::HashMap<String, String> =
        req.params().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let server_software = env.get("SERVER_SOFTWARE").cloned();

    let cap = config.max_body_bytes;
    let mut body_buf = Vec::new();
    req.by_ref().take(cap + 1).read_to_end(&mut body_buf).map_err(Error::Wire)?;
    if body_buf.len() as u64 > cap {
        tracing::warn!(cap, "request body exceeded the configured cap; truncating");
        body_buf.truncate(cap as usize);
    }

    let request = Request::new(env, Box::new(Cursor::new(body_buf)), config);
    request.load_session(sessions, config)?;

    let mut stdout = req.stdout();
    let mut stdout_dyn: &mut dyn Write = &mut stdout;
    let mut response = Response::new(stdout_dyn, server_software);

    if let Err(e) = service.call(&request, &mut response) {
        tracing::error!(error = %e, "handler returned an error");
        render_error_page(&mut response, config, &e);
    }

    // Sweep any spooled upload that the handler didn't move out of the
    // upload directory. A fresh `Request` is built per call instead of
    // reusing one across requests the way the original resets in place, so
    // this is where the original's "no temp file survives reset()"
    // guarantee lands instead.
    if let Ok(files) = request.files() {
        for upload in files.values() {
            let _ = std::fs::remove_file(&upload.path);
        }
    }

    let (session_is_new, session_id) = request.with_session(|h| (h.is_new(), h.id().map(str::to_string)));
    if session_is_new {
        if let Some(id) = session_id {
            response.set_new_session_cookie(config.session_cookie_name.clone(), id);
        }
    }

    response.finish().map_err(Error::Wire)?;

    if let Some(handle) = request.take_session() {
        handle.finish(sessions, config.session_id_width)?;
    }

    Ok(())
}

/// Render the fixed 500 HTML skeleton, mirroring the original's `error()`
/// hook and its fallback to `smisk_Response_finish` afterward. If the
/// handler already began writing its own response, headers can't be fixed
/// up anymore, but the error fragment is still appended to whatever body
/// bytes already went out — better a readable error after partial output
/// than silence. If the write itself fails, the connection is unsalvageable
/// and we escalate the same way `Application.c` does: `raise(SIGINT)`.
fn render_error_page(response: &mut Response<&mut dyn Write>, config: &Config, err: &Error) {
    if !response.has_begun() {
        let _ = response.add_header("Status: 500 Internal Server Error");
        let _ = response.add_header("Content-Type: text/html; charset=utf-8");
        let _ = response.add_header("Cache-Control: no-cache");
    }

    let body = error_page_html(config, err);
    if let Err(io_err) = response.write(body.as_bytes()) {
        tracing::error!(error = %io_err, "failed to write error response; escalating");
        let _ = signal::raise(Signal::SIGINT);
    }
}

fn error_page_html(config: &Config, err: &Error) -> String {
    if config.show_traceback {
        format!(
            "<!doctype html><html><head><title>500 Internal Server Error</title></head>\
             <body><h1>500 Internal Server Error</h1><pre>{}</pre></body></html>",
            html_escape(&format!("{err:?}"))
        )
    } else {
        "<!doctype html><html><head><title>500 Internal Server Error</title></head>\
         <body><h1>500 Internal Server Error</h1></body></html>"
            .to_string()
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
