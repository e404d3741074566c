//! A tiny demo service: greets whoever hits it, remembers a per-session
//! visit count, and accepts an alternate name via a urlencoded POST field.
//! Same shape as the teacher's original `dadapp` demo, rebuilt against the
//! synchronous [`Service`] trait instead of an Axum `Router`.

use fcgi_runtime::app::Service;
use fcgi_runtime::config::SessionIdWidth;
use fcgi_runtime::error::Error;
use fcgi_runtime::request::Request;
use fcgi_runtime::response::Response;
use fcgi_runtime::url::FieldValue;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

static LIFETIME_JOKES: AtomicU32 = AtomicU32::new(0);

/// Greets visitors at `mount_path`, keeping a joke count for the process's
/// whole lifetime alongside one for each visitor's own session.
pub struct DadApp {
    mount: String,
    session_id_width: SessionIdWidth,
}

impl DadApp {
    /// `mount_path` should start with `/`; pass `"/"` or `""` for a
    /// root-mounted app.
    pub fn new(mount_path: &str, session_id_width: SessionIdWidth) -> Self {
        DadApp {
            mount: mount_path
                .strip_prefix('/')
                .unwrap_or(mount_path)
                .trim_end_matches('/')
                .to_string(),
            session_id_width,
        }
    }

    fn visitor_name<'a>(&self, req: &'a Request) -> &'a str {
        let path = req.url().path.as_deref().unwrap_or("/");
        let rest = path.strip_prefix('/').unwrap_or(path);
        rest.strip_prefix(&self.mount).unwrap_or(rest).trim_matches('/')
    }
}

impl Service for DadApp {
    fn call(&self, req: &Request, res: &mut Response<&mut dyn Write>) -> Result<(), Error> {
        let lifetime_jokes = LIFETIME_JOKES.fetch_add(1, Ordering::Relaxed) + 1;

        let visits_this_session = req.with_session(|session| {
            let prior: u32 = session
                .data()
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let next = prior + 1;
            session.ensure_id(self.session_id_width);
            session.set_data(next.to_string().into_bytes());
            next
        });

        let name = match req.method() {
            Some("POST") => match req.post()?.get("name") {
                Some(FieldValue::Single(name)) => name.clone(),
                _ => "a stranger".to_string(),
            },
            _ => {
                let path_name = self.visitor_name(req);
                if path_name.is_empty() {
                    "a stranger".to_string()
                } else {
                    path_name.to_string()
                }
            }
        };

        res.add_header("Content-Type: text/plain; charset=utf-8")?;
        res.write(
            format!(
                "Hi {name}, I'm dad.\n\n{visits_this_session} joke(s) for you this session, \
                 {lifetime_jokes} for everyone since I started.\n"
            )
            .as_bytes(),
        )?;
        Ok(())
    }
}
