//! The per-request façade handed to a service handler: environment, parsed
//! URL, query/post/cookie data, uploaded files, and the session.
//!
//! Grounded on `original_source/src/Request.c`: lazily computed, memoized
//! accessors (`env`/`url`/`get`/`post`/`files`/`cookies`/`session_id`/
//! `session`/`referring_url`/`method`), rebuilt here as `OnceCell`-backed
//! methods instead of Python's `self->x == NULL` lazy-getter pattern.

use crate::config::Config;
use crate::error::{Error, ProtocolError};
use crate::multipart::{self, FileUpload};
use crate::session::{SessionHandle, SessionStore};
use crate::url::{self, FieldValue, Url};
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::io::{BufRead, Read};

/// Everything parsed out of a request body: form fields plus uploaded
/// files. Populated together, mirroring `_parse_request_body` filling both
/// `self->post` and `self->files` from one pass over the stream.
struct BodyData {
    post: HashMap<String, FieldValue>,
    files: HashMap<String, FileUpload>,
}

/// A single incoming request. Holds no reference back to the application
/// or wire adapter — those own the `Request`, not the other way around —
/// so there is no reference cycle to break.
pub struct Request {
    env: HashMap<String, String>,
    charset: &'static encoding_rs::Encoding,
    max_body_bytes: u64,
    upload_dir: std::path::PathBuf,
    upload_prefix: String,

    body: RefCell<Option<Box<dyn BufRead>>>,
    url: OnceCell<Url>,
    get: OnceCell<HashMap<String, FieldValue>>,
    body_data: OnceCell<BodyData>,
    cookies: OnceCell<HashMap<String, String>>,
    referring_url: OnceCell<Option<Url>>,
    session: RefCell<Option<SessionHandle>>,
}

impl Request {
    /// Build a request from its CGI-style environment variables and a
    /// reader over the (possibly empty) request body.
    pub fn new(
        env: HashMap<String, String>,
        body: Box<dyn BufRead>,
        config: &Config,
    ) -> Self {
        Request {
            env,
            charset: config.charset,
            max_body_bytes: config.max_body_bytes,
            upload_dir: config.upload_dir.clone(),
            upload_prefix: config.upload_prefix.clone(),
            body: RefCell::new(Some(body)),
            url: OnceCell::new(),
            get: OnceCell::new(),
            body_data: OnceCell::new(),
            cookies: OnceCell::new(),
            referring_url: OnceCell::new(),
            session: RefCell::new(None),
        }
    }

    /// Raw CGI environment (`REQUEST_METHOD`, `SCRIPT_NAME`, `HTTP_*`,
    /// ...), transcribed verbatim by the wire adapter. Unlike the
    /// original's per-entry `SERVER_SOFTWARE` cache, the whole map is built
    /// once up front — there's no laziness to buy here, and interning a
    /// `String` map doesn't need Python's object-cache trick.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }

    /// The request's URL, assembled from `HTTPS`/`SERVER_NAME`/
    /// `SERVER_PORT`/`SCRIPT_NAME`/`PATH_INFO`/`QUERY_STRING`.
    pub fn url(&self) -> &Url {
        self.url.get_or_init(|| self.build_url())
    }

    fn build_url(&self) -> Url {
        let mut u = Url::default();

        u.scheme = Some(
            match self.env_get("HTTPS") {
                Some(s) if s.len() > 1 && s[..2].eq_ignore_ascii_case("on") => "https",
                _ => "http",
            }
            .to_string(),
        );

        if let Some(user) = self.env_get("REMOTE_USER") {
            u.user = Some(user.to_string());
        }

        if let Some(server_name) = self.env_get("SERVER_NAME") {
            if let Some((host, port)) = server_name.split_once(':') {
                u.host = Some(host.to_string());
                u.port = port.parse().unwrap_or(0);
            } else {
                u.host = Some(server_name.to_string());
                if let Some(port) = self.env_get("SERVER_PORT") {
                    u.port = port.parse().unwrap_or(0);
                }
            }
        }

        let mut path = self.env_get("SCRIPT_NAME").unwrap_or("").to_string();
        if let Some(path_info) = self.env_get("PATH_INFO") {
            path.push_str(path_info);
        }
        if !path.is_empty() {
            u.path = Some(path);
        }

        if let Some(query) = self.env_get("QUERY_STRING") {
            u.query = Some(query.to_string());
        }

        u
    }

    /// Query string, decomposed into field values (repeated keys collapse
    /// into `FieldValue::Multi`).
    pub fn get(&self) -> &HashMap<String, FieldValue> {
        self.get.get_or_init(|| {
            let query = self.url().query.clone().unwrap_or_default();
            if query.is_empty() {
                HashMap::new()
            } else {
                url::decompose_query(&query, self.charset)
            }
        })
    }

    fn ensure_body_parsed(&self) -> Result<(), Error> {
        if self.body_data.get().is_some() {
            return Ok(());
        }

        let content_type = self.env_get("CONTENT_TYPE").map(|s| s.to_string());
        let content_length: u64 = self
            .env_get("CONTENT_LENGTH")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let mut reader_slot = self.body.borrow_mut();
        let Some(mut reader) = reader_slot.take() else {
            let _ = self.body_data.set(BodyData {
                post: HashMap::new(),
                files: HashMap::new(),
            });
            return Ok(());
        };

        let data = match content_type.as_deref() {
            Some(ct) if ct.contains("multipart/") => {
                let boundary = ct
                    .split(';')
                    .skip(1)
                    .find_map(|p| p.trim().strip_prefix("boundary="))
                    .map(|b| b.trim_matches('"').to_string())
                    .ok_or_else(|| {
                        Error::Protocol(ProtocolError::Multipart(
                            "multipart Content-Type missing boundary parameter".to_string(),
                        ))
                    })?;
                let parsed = multipart::parse(
                    &mut reader,
                    &boundary,
                    self.charset,
                    &self.upload_dir,
                    &self.upload_prefix,
                    self.max_body_bytes,
                )?;
                BodyData {
                    post: parsed.fields,
                    files: parsed.files,
                }
            }
            Some(ct) if ct.contains("/x-www-form-urlencoded") => {
                let cap = content_length.min(self.max_body_bytes);
                let mut buf = Vec::with_capacity(cap as usize);
                let mut limited = reader.by_ref().take(self.max_body_bytes + 1);
                limited.read_to_end(&mut buf).map_err(Error::Wire)?;
                if buf.len() as u64 > self.max_body_bytes {
                    return Err(Error::Protocol(ProtocolError::BodyTooLarge {
                        cap: self.max_body_bytes,
                        read: buf.len() as u64,
                    }));
                }
                let body_str = String::from_utf8_lossy(&buf).into_owned();
                let post = url::decompose_query(&body_str, self.charset);
                BodyData {
                    post,
                    files: HashMap::new(),
                }
            }
            _ => BodyData {
                post: HashMap::new(),
                files: HashMap::new(),
            },
        };

        let _ = self.body_data.set(data);
        Ok(())
    }

    /// Parsed POST fields (urlencoded or multipart form fields).
    pub fn post(&self) -> Result<&HashMap<String, FieldValue>, Error> {
        self.ensure_body_parsed()?;
        Ok(&self.body_data.get().unwrap().post)
    }

    /// Uploaded files from a multipart body, keyed by field name.
    pub fn files(&self) -> Result<&HashMap<String, FileUpload>, Error> {
        self.ensure_body_parsed()?;
        Ok(&self.body_data.get().unwrap().files)
    }

    /// `Cookie` header, split on `;` into a flat name/value map (later
    /// values for a repeated name win, matching `smisk_parse_input_data`'s
    /// "unique" mode used for cookies).
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            let mut map = HashMap::new();
            let Some(raw) = self.env_get("HTTP_COOKIE") else {
                return map;
            };
            for pair in raw.split(';') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = match pair.split_once('=') {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => (pair, ""),
                };
                let key = String::from_utf8_lossy(&url::decode(k.as_bytes())).into_owned();
                let val = String::from_utf8_lossy(&url::decode(v.as_bytes())).into_owned();
                map.insert(key, val);
            }
            map
        })
    }

    /// `HTTP_REFERER`, parsed as a URL if present.
    pub fn referring_url(&self) -> Option<&Url> {
        self.referring_url
            .get_or_init(|| self.env_get("HTTP_REFERER").map(Url::parse))
            .as_ref()
    }

    /// `REQUEST_METHOD`.
    pub fn method(&self) -> Option<&str> {
        self.env_get("REQUEST_METHOD")
    }

    /// Load (creating a handle, but not yet an id, if absent) this
    /// request's session from `store`, using the cookie named
    /// `store.cookie_name()`.
    pub fn load_session(&self, store: &dyn SessionStore, config: &Config) -> Result<(), Error> {
        let cookie_value = self.cookies().get(store.cookie_name()).cloned();
        let handle = SessionHandle::load(store, cookie_value.as_deref(), config)?;
        *self.session.borrow_mut() = Some(handle);
        Ok(())
    }

    /// Run `f` against the mutable session handle. Panics if
    /// [`Request::load_session`] hasn't run yet — `Application` always
    /// calls it before dispatching to a handler.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut SessionHandle) -> R) -> R {
        let mut guard = self.session.borrow_mut();
        let handle = guard.as_mut().expect("load_session must run before with_session");
        f(handle)
    }

    /// Take the session handle for response-time write-back. Leaves the
    /// request without a session — only `Application` should call this,
    /// once per request, after the handler returns.
    pub fn take_session(&self) -> Option<SessionHandle> {
        self.session.borrow_mut().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn url_assembled_from_script_name_and_path_info() {
        let e = env(&[
            ("SERVER_NAME", "example.com"),
            ("SERVER_PORT", "8080"),
            ("SCRIPT_NAME", "/app"),
            ("PATH_INFO", "/widgets/1"),
            ("QUERY_STRING", "q=1"),
        ]);
        let req = Request::new(e, Box::new(Cursor::new(Vec::new())), &Config::default());
        let u = req.url();
        assert_eq!(u.scheme.as_deref(), Some("http"));
        assert_eq!(u.host.as_deref(), Some("example.com"));
        assert_eq!(u.port, 8080);
        assert_eq!(u.path.as_deref(), Some("/app/widgets/1"));
        assert_eq!(u.query.as_deref(), Some("q=1"));
    }

    #[test]
    fn https_on_sets_scheme() {
        let e = env(&[("HTTPS", "on"), ("SERVER_NAME", "example.com")]);
        let req = Request::new(e, Box::new(Cursor::new(Vec::new())), &Config::default());
        assert_eq!(req.url().scheme.as_deref(), Some("https"));
    }

    #[test]
    fn query_string_decomposed_into_get() {
        let e = env(&[("QUERY_STRING", "a=1&a=2")]);
        let req = Request::new(e, Box::new(Cursor::new(Vec::new())), &Config::default());
        match req.get().get("a").unwrap() {
            FieldValue::Multi(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn urlencoded_body_parsed_into_post() {
        let e = env(&[
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
            ("CONTENT_LENGTH", "11"),
        ]);
        let body = Cursor::new(b"name=world".to_vec());
        let req = Request::new(e, Box::new(body), &Config::default());
        let post = req.post().unwrap();
        match post.get("name").unwrap() {
            FieldValue::Single(s) => assert_eq!(s, "world"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cookies_parsed_from_header() {
        let e = env(&[("HTTP_COOKIE", "a=1; b=2")]);
        let req = Request::new(e, Box::new(Cursor::new(Vec::new())), &Config::default());
        assert_eq!(req.cookies().get("a").map(String::as_str), Some("1"));
        assert_eq!(req.cookies().get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn referring_url_absent_without_header() {
        let req = Request::new(HashMap::new(), Box::new(Cursor::new(Vec::new())), &Config::default());
        assert!(req.referring_url().is_none());
    }

    #[test]
    fn method_reads_request_method() {
        let e = env(&[("REQUEST_METHOD", "POST")]);
        let req = Request::new(e, Box::new(Cursor::new(Vec::new())), &Config::default());
        assert_eq!(req.method(), Some("POST"));
    }
}
