//! Application-wide configuration: charset, form-data size cap, temp
//! directory, session bit width, and the handful of other knobs spec'd as
//! "glue" between the components.

use std::path::PathBuf;

/// Bit width used to render session ids, mirroring `smisk_uid_format`'s
/// 4/5/6-bits-per-character alphabets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdWidth {
    /// 4 bits/char, 40 characters, alphabet `0-9a-f`.
    Bits4,
    /// 5 bits/char, 32 characters, alphabet `0-9a-v`.
    Bits5,
    /// 6 bits/char, 27 characters, alphabet `0-9a-zA-Z_-`.
    Bits6,
}

impl SessionIdWidth {
    pub(crate) fn char_count(self) -> usize {
        match self {
            SessionIdWidth::Bits4 => 40,
            SessionIdWidth::Bits5 => 32,
            SessionIdWidth::Bits6 => 27,
        }
    }

    pub(crate) fn bits(self) -> u32 {
        match self {
            SessionIdWidth::Bits4 => 4,
            SessionIdWidth::Bits5 => 5,
            SessionIdWidth::Bits6 => 6,
        }
    }
}

/// Runtime-wide configuration, analogous to the knobs scattered across
/// `smisk.core`'s module-level globals and `Application` members.
#[derive(Debug, Clone)]
pub struct Config {
    /// Text encoding used when decoding form values/query values and when
    /// writing unicode text to the response. Defaults to utf-8.
    pub charset: &'static encoding_rs::Encoding,

    /// Upper bound on a request body the multipart/urlencoded decoders will
    /// read before truncating with a logged warning. Defaults to 2^30 bytes.
    pub max_body_bytes: u64,

    /// Directory uploaded file parts are spooled into.
    pub upload_dir: PathBuf,

    /// Prefix used for spooled upload temp file names.
    pub upload_prefix: String,

    /// Name of the session cookie. Defaults to `SID`.
    pub session_cookie_name: String,

    /// Bit width used when formatting freshly generated session ids.
    pub session_id_width: SessionIdWidth,

    /// Session TTL, in seconds, enforced by the default file-backed store.
    pub session_ttl_secs: u64,

    /// Probability in [0,1] that a session read triggers a GC sweep of the
    /// session directory.
    pub session_gc_probability: f64,

    /// Number of additional worker processes to pre-fork before entering
    /// the accept loop. 0 disables pre-fork.
    pub forks: u32,

    /// Listen backlog; <= 0 means "OS default".
    pub backlog: i32,

    /// Whether the default error page includes a full backtrace.
    pub show_traceback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            charset: encoding_rs::UTF_8,
            max_body_bytes: 1 << 30,
            upload_dir: std::env::temp_dir(),
            upload_prefix: "fcgi-runtime-upload-".to_string(),
            session_cookie_name: "SID".to_string(),
            session_id_width: SessionIdWidth::Bits6,
            session_ttl_secs: 24 * 60 * 60,
            session_gc_probability: 0.1,
            forks: 0,
            backlog: 0,
            show_traceback: false,
        }
    }
}
