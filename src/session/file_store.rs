//! File-backed [`SessionStore`](super::SessionStore).
//!
//! Grounded on `original_source/src/FileSessionStore.c`: one file per
//! session under `<dir>/<prefix><sid>`, advisory locking around reads and
//! writes, mtime-based TTL expiry, and a probabilistic GC sweep triggered
//! from `read`. Departs from the original in two ways, both recorded as
//! resolved Open Questions: payloads are tagged `version byte + bincode`
//! instead of Python marshal, and writes go through a temp file + rename
//! instead of locking the live file directly, so a reader never observes a
//! half-written payload.

use super::{SessionOutcome, SessionStore};
use crate::error::SessionError;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

const PAYLOAD_VERSION: u8 = 1;

/// A session store rooted at a directory, with files named
/// `<file_prefix><session_id>`.
pub struct FileSessionStore {
    dir: PathBuf,
    file_prefix: String,
    cookie_name: String,
    ttl: Duration,
    gc_probability: f64,
}

impl FileSessionStore {
    /// `dir` is created if missing. `file_prefix` defaults to
    /// `smisk-sess.` in the original; callers here choose their own to
    /// avoid collisions between unrelated services sharing a temp dir.
    pub fn new(dir: PathBuf, file_prefix: impl Into<String>, cookie_name: impl Into<String>, ttl: Duration) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(FileSessionStore {
            dir,
            file_prefix: file_prefix.into(),
            cookie_name: cookie_name.into(),
            ttl,
            gc_probability: 0.1,
        })
    }

    pub fn with_gc_probability(mut self, p: f64) -> Self {
        self.gc_probability = p;
        self
    }

    fn path_for(&self, sid: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.file_prefix, sid))
    }

    fn is_garbage(&self, path: &std::path::Path) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    /// Probabilistically sweep the directory for expired session files,
    /// matching `_gc_run`'s directory scan + prefix match + unlink.
    fn maybe_gc(&self) {
        if self.gc_probability <= 0.0 {
            return;
        }
        if rand::random::<f64>() >= self.gc_probability {
            return;
        }
        self.gc_run();
    }

    fn gc_run(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.file_prefix) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if self.is_garbage(&path) {
                let _ = fs::remove_file(&path);
            }
        }
    }

    fn encode_payload(data: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(PAYLOAD_VERSION);
        let body = bincode::serialize(&data.to_vec())
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode_payload(bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| SessionError::Decode("empty session file".to_string()))?;
        if *version != PAYLOAD_VERSION {
            return Err(SessionError::Decode(format!(
                "unsupported session payload version {version}"
            )));
        }
        bincode::deserialize(body).map_err(|e| SessionError::Decode(e.to_string()))
    }
}

impl SessionStore for FileSessionStore {
    fn read(&self, sid: &str) -> Result<SessionOutcome, SessionError> {
        self.maybe_gc();

        let path = self.path_for(sid);
        if !path.exists() {
            return Ok(SessionOutcome::NotFound);
        }
        if self.is_garbage(&path) {
            let _ = fs::remove_file(&path);
            return Ok(SessionOutcome::NotFound);
        }

        let mut file = File::open(&path)?;
        file.lock_shared()?;
        let mut buf = Vec::new();
        let read_result = file.read_to_end(&mut buf);
        let _ = FileExt::unlock(&file);
        read_result?;

        let data = Self::decode_payload(&buf)?;
        Ok(SessionOutcome::Found(data))
    }

    fn write(&self, sid: &str, data: &[u8]) -> Result<(), SessionError> {
        let path = self.path_for(sid);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}{}.", self.file_prefix, sid))
            .tempfile_in(&self.dir)?;

        if tmp.as_file().try_lock_exclusive().is_err() {
            // Another process is already writing this session; matches the
            // original's "fail silently, last writer wins" behavior.
            return Ok(());
        }

        let payload = Self::encode_payload(data)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        let _ = FileExt::unlock(tmp.as_file());
        tmp.persist(&path).map_err(|e| SessionError::Io(e.error))?;
        Ok(())
    }

    fn refresh(&self, sid: &str) -> Result<(), SessionError> {
        let path = self.path_for(sid);
        match filetime::set_file_mtime(&path, filetime::FileTime::now()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    fn destroy(&self, sid: &str) -> Result<(), SessionError> {
        let path = self.path_for(sid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tmp: &tempfile::TempDir) -> FileSessionStore {
        FileSessionStore::new(
            tmp.path().to_path_buf(),
            "test-sess.",
            "SID",
            Duration::from_secs(3600),
        )
        .unwrap()
        .with_gc_probability(0.0)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        store.write("abc123", b"hello session").unwrap();
        match store.read("abc123").unwrap() {
            SessionOutcome::Found(data) => assert_eq!(data, b"hello session"),
            SessionOutcome::NotFound => panic!("expected Found"),
        }
    }

    #[test]
    fn read_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        assert_eq!(store.read("nope").unwrap(), SessionOutcome::NotFound);
    }

    #[test]
    fn expired_session_is_garbage_collected_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(
            tmp.path().to_path_buf(),
            "test-sess.",
            "SID",
            Duration::from_secs(0),
        )
        .unwrap()
        .with_gc_probability(0.0);
        store.write("old", b"stale").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.read("old").unwrap(), SessionOutcome::NotFound);
        assert!(!store.path_for("old").exists());
    }

    #[test]
    fn destroy_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        store.write("gone", b"data").unwrap();
        store.destroy("gone").unwrap();
        assert_eq!(store.read("gone").unwrap(), SessionOutcome::NotFound);
    }

    #[test]
    fn destroy_of_missing_session_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        assert!(store.destroy("never-existed").is_ok());
    }

    #[test]
    fn refresh_bumps_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        store.write("sid", b"data").unwrap();
        let before = fs::metadata(store.path_for("sid")).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        store.refresh("sid").unwrap();
        let after = fs::metadata(store.path_for("sid")).unwrap().modified().unwrap();
        assert!(after >= before);
    }

    #[test]
    fn gc_run_sweeps_only_prefixed_expired_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(
            tmp.path().to_path_buf(),
            "test-sess.",
            "SID",
            Duration::from_secs(0),
        )
        .unwrap()
        .with_gc_probability(0.0);
        store.write("a", b"1").unwrap();
        fs::write(tmp.path().join("unrelated-file"), b"keep me").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        store.gc_run();
        assert!(!store.path_for("a").exists());
        assert!(tmp.path().join("unrelated-file").exists());
    }
}
