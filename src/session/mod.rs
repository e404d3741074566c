//! Session subsystem: the `SessionStore` trait and the write-back policy
//! that decides whether a request's session needs to hit the store at all.
//!
//! Grounded on `original_source/src/SessionStore.c` (the write-back
//! decision) and `original_source/src/FileSessionStore.c` (the concrete
//! file-backed implementation, in `file_store`).

pub mod file_store;

use crate::config::{Config, SessionIdWidth};
use crate::error::SessionError;
use crate::uid::Uid;
use std::path::PathBuf;

/// Result of looking a session id up in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Found(Vec<u8>),
    NotFound,
}

/// A pluggable session backend. The default implementation is
/// [`file_store::FileSessionStore`]; callers may supply their own (e.g. a
/// database-backed store) since nothing in `Application`/`Request` assumes
/// the filesystem.
pub trait SessionStore: Send + Sync {
    /// Read the raw payload for `sid`, or `NotFound` if it doesn't exist or
    /// has expired.
    fn read(&self, sid: &str) -> Result<SessionOutcome, SessionError>;

    /// Overwrite the payload for `sid`, creating it if necessary.
    fn write(&self, sid: &str, data: &[u8]) -> Result<(), SessionError>;

    /// Bump the last-modified time for `sid` without changing its payload
    /// (used when a session was read but not mutated, to extend its TTL).
    fn refresh(&self, sid: &str) -> Result<(), SessionError>;

    /// Remove `sid` entirely.
    fn destroy(&self, sid: &str) -> Result<(), SessionError>;

    /// Name of the cookie this store expects to find the id in. Stores are
    /// free to ignore `Config::session_cookie_name` but by default they
    /// should honor it.
    fn cookie_name(&self) -> &str;
}

/// Tracks a single request's session lifecycle: whether it was ever
/// touched, its id, and the hash of the payload as last read from the
/// store, so `Application` can decide at response time whether a write is
/// actually needed.
pub struct SessionHandle {
    id: Option<String>,
    is_new: bool,
    initial_hash: Option<u64>,
    data: Option<Vec<u8>>,
    touched: bool,
    /// Id to purge from the store at `finish()`, set by `destroy()`. Kept
    /// separate from `id` so a destroyed handle still remembers what it
    /// needs to remove once `id` itself is cleared.
    destroyed: Option<String>,
}

impl SessionHandle {
    pub fn empty() -> Self {
        SessionHandle {
            id: None,
            is_new: false,
            initial_hash: None,
            data: None,
            touched: false,
            destroyed: None,
        }
    }

    /// Load (or create) the session named by `cookie_value`, per
    /// `Config::session_id_width`. `cookie_value` is `None` when the
    /// request carried no session cookie at all.
    pub fn load(
        store: &dyn SessionStore,
        cookie_value: Option<&str>,
        config: &Config,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(sid) = cookie_value {
            if crate::uid::is_valid(sid, config.session_id_width) {
                match store.read(sid)? {
                    SessionOutcome::Found(data) => {
                        let hash = hash_bytes(&data);
                        return Ok(SessionHandle {
                            id: Some(sid.to_string()),
                            is_new: false,
                            initial_hash: Some(hash),
                            data: Some(data),
                            touched: false,
                            destroyed: None,
                        });
                    }
                    SessionOutcome::NotFound => {
                        // Fall through: cookie pointed at a session that no
                        // longer exists. Start fresh under the same id.
                        return Ok(SessionHandle {
                            id: Some(sid.to_string()),
                            is_new: true,
                            initial_hash: None,
                            data: None,
                            touched: false,
                            destroyed: None,
                        });
                    }
                }
            }
        }
        Ok(SessionHandle::empty())
    }

    /// Allocate a fresh id (lazily — callers only need this if they intend
    /// to actually start a session this request).
    pub fn ensure_id(&mut self, width: SessionIdWidth) -> &str {
        if self.id.is_none() {
            self.id = Some(Uid::generate(None).format(width));
            self.is_new = true;
        }
        self.id.as_deref().unwrap()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.touched = true;
    }

    /// Mark the session destroyed: `finish()` will remove it from the store
    /// immediately (not defer to the touched/hash write-back policy) and no
    /// `Set-Cookie` will be emitted. Mirrors `smisk_Request_set_session`'s
    /// "passing None destroys the current session" — the original calls
    /// `sessions.destroy(session_id)` right away, it doesn't wait to compare
    /// payload hashes first.
    pub fn destroy(&mut self) {
        if let Some(id) = self.id.take() {
            self.destroyed = Some(id);
        }
        self.data = None;
        self.is_new = false;
        self.initial_hash = None;
        self.touched = true;
    }

    /// Decide and perform the write-back action against `store`, per the
    /// policy in `SessionStore.c`: a destroyed handle purges the store and
    /// skips everything else; otherwise skip entirely if the session was
    /// never touched and never existed; skip the write if the payload is
    /// unchanged from what was read; otherwise write (new session) or
    /// refresh (existing, unchanged) or write (existing, changed).
    pub fn finish(self, store: &dyn SessionStore, width: SessionIdWidth) -> Result<(), SessionError> {
        if let Some(id) = &self.destroyed {
            return store.destroy(id);
        }

        let Some(id) = self.id.clone() else {
            return Ok(());
        };

        if !self.touched && self.initial_hash.is_none() && !self.is_new {
            return Ok(());
        }

        match &self.data {
            None => {
                // Session existed (or was allocated) but carries no data:
                // nothing worth persisting, and if it previously existed in
                // the store we leave it untouched rather than destroying it
                // on a no-op request.
                if self.initial_hash.is_some() {
                    store.refresh(&id)?;
                }
                Ok(())
            }
            Some(data) => {
                let current_hash = hash_bytes(data);
                if Some(current_hash) == self.initial_hash {
                    store.refresh(&id)
                } else {
                    store.write(&id, data)?;
                    let _ = width;
                    Ok(())
                }
            }
        }
    }

    /// True if the handle still has an id and was not destroyed, meaning a
    /// `Set-Cookie` should be emitted on `is_new`.
    pub fn should_emit_cookie(&self) -> bool {
        self.id.is_some()
    }
}

fn hash_bytes(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// Compute the on-disk/in-store path a file-backed store would use for
/// `sid`, exposed for callers that want to probe the store out of band
/// (tests, admin tooling).
pub fn store_path(base_dir: &std::path::Path, prefix: &str, sid: &str) -> PathBuf {
    base_dir.join(format!("{}{}", prefix, sid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        data: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl SessionStore for MemStore {
        fn read(&self, sid: &str) -> Result<SessionOutcome, SessionError> {
            match self.data.borrow().get(sid) {
                Some(d) => Ok(SessionOutcome::Found(d.clone())),
                None => Ok(SessionOutcome::NotFound),
            }
        }
        fn write(&self, sid: &str, data: &[u8]) -> Result<(), SessionError> {
            self.data.borrow_mut().insert(sid.to_string(), data.to_vec());
            Ok(())
        }
        fn refresh(&self, _sid: &str) -> Result<(), SessionError> {
            Ok(())
        }
        fn destroy(&self, sid: &str) -> Result<(), SessionError> {
            self.data.borrow_mut().remove(sid);
            Ok(())
        }
        fn cookie_name(&self) -> &str {
            "SID"
        }
    }

    #[test]
    fn untouched_session_with_no_cookie_writes_nothing() {
        let store = MemStore { data: RefCell::new(HashMap::new()) };
        let handle = SessionHandle::load(&store, None, &Config::default()).unwrap();
        handle.finish(&store, Config::default().session_id_width).unwrap();
        assert!(store.data.borrow().is_empty());
    }

    #[test]
    fn new_session_with_data_is_written() {
        let store = MemStore { data: RefCell::new(HashMap::new()) };
        let mut handle = SessionHandle::load(&store, None, &Config::default()).unwrap();
        let id = handle.ensure_id(SessionIdWidth::Bits6).to_string();
        handle.set_data(b"payload".to_vec());
        handle.finish(&store, SessionIdWidth::Bits6).unwrap();
        assert_eq!(store.data.borrow().get(&id).map(|v| v.as_slice()), Some(&b"payload"[..]));
    }

    #[test]
    fn unchanged_existing_session_refreshes_not_writes() {
        let store = MemStore { data: RefCell::new(HashMap::new()) };
        let config = Config::default();

        let mut seed = SessionHandle::empty();
        let id = seed.ensure_id(config.session_id_width).to_string();
        store.data.borrow_mut().insert(id.clone(), b"same".to_vec());

        let reloaded = SessionHandle::load(&store, Some(&id), &config).unwrap();
        reloaded.finish(&store, config.session_id_width).unwrap();
        assert_eq!(store.data.borrow().get(&id).map(|v| v.as_slice()), Some(&b"same"[..]));
    }

    #[test]
    fn destroyed_session_emits_no_cookie() {
        let mut handle = SessionHandle::empty();
        handle.ensure_id(SessionIdWidth::Bits6);
        handle.destroy();
        assert!(!handle.should_emit_cookie());
    }

    #[test]
    fn destroyed_session_is_purged_from_store_on_finish() {
        let store = MemStore { data: RefCell::new(HashMap::new()) };
        let config = Config::default();

        let mut seed = SessionHandle::empty();
        let id = seed.ensure_id(config.session_id_width).to_string();
        seed.set_data(b"payload".to_vec());
        seed.finish(&store, config.session_id_width).unwrap();
        assert!(store.data.borrow().contains_key(&id));

        let mut reloaded = SessionHandle::load(&store, Some(&id), &config).unwrap();
        reloaded.destroy();
        reloaded.finish(&store, config.session_id_width).unwrap();

        assert!(!store.data.borrow().contains_key(&id));
    }
}
