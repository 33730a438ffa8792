//! Frame persistence and upload idempotency
//!
//! Frames land as flat files in `<data_dir>/frames` — no subdirectories,
//! no index file. Deduplication state lives only in memory: a map keyed by
//! the caller's idempotency key plus an insertion-ordered list for FIFO
//! capacity eviction. A background sweeper expires entries past the TTL.
//!
//! `seen_at` is never refreshed on a hit, so a client cannot keep an entry
//! alive forever; do not convert this cache to LRU.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::metrics::Metrics;

const DEFAULT_IDEM_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_IDEM_MAX: usize = 50_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("create frames dir: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("write frame: {0}")]
    Write(#[source] std::io::Error),
}

/// Metadata describing one persisted frame.
///
/// Immutable once returned; the `duplicate` flag is set on copies handed
/// back for cache hits, never on the cached original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub timestamp: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub idempotency_key: String,
    pub file_name: String,
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub sha256: String,
    pub received_at: DateTime<Utc>,
    pub duplicate: bool,
}

struct IdemEntry {
    meta: FrameMeta,
    seen_at: DateTime<Utc>,
}

struct StoreInner {
    by_idempotency: HashMap<String, IdemEntry>,
    idem_order: VecDeque<String>,
    last: Option<FrameMeta>,
    count: u64,
}

pub struct FrameStore {
    frames_dir: PathBuf,
    idem_ttl: chrono::Duration,
    idem_max: usize,
    metrics: Arc<Metrics>,
    inner: Mutex<StoreInner>,
}

impl FrameStore {
    /// Create the store, ensure `<data_dir>/frames` exists, and start the
    /// background TTL sweeper. Fails only on directory creation.
    ///
    /// `idem_ttl` of zero falls back to 10 minutes, `idem_max` of zero to
    /// 50 000.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        idem_ttl: Duration,
        idem_max: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, StoreError> {
        let idem_ttl = if idem_ttl.is_zero() { DEFAULT_IDEM_TTL } else { idem_ttl };
        let idem_max = if idem_max == 0 { DEFAULT_IDEM_MAX } else { idem_max };

        let frames_dir = data_dir.into().join("frames");
        fs::create_dir_all(&frames_dir).map_err(StoreError::CreateDir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&frames_dir, fs::Permissions::from_mode(0o755));
        }

        let store = Arc::new(Self {
            frames_dir,
            idem_ttl: chrono::Duration::from_std(idem_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            idem_max,
            metrics,
            inner: Mutex::new(StoreInner {
                by_idempotency: HashMap::new(),
                idem_order: VecDeque::new(),
                last: None,
                count: 0,
            }),
        });

        tokio::spawn(cleanup_loop(Arc::downgrade(&store)));
        Ok(store)
    }

    /// Persist a frame, deduplicating on `idem_key` within the TTL.
    ///
    /// A cache hit returns a copy of the original metadata with
    /// `duplicate = true` and writes nothing. A disk failure is returned to
    /// the caller without touching the cache or counters.
    pub fn save_frame(
        &self,
        frame_id: &str,
        timestamp: &str,
        idem_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<FrameMeta, StoreError> {
        let mut clean_id = sanitize_token(frame_id);
        if clean_id.is_empty() {
            clean_id = format!("frame-{}", unix_nanos());
        }
        let timestamp = if timestamp.is_empty() {
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
        } else {
            timestamp.to_string()
        };

        let now = Utc::now();
        let mut inner = self.inner.lock().expect("frame store lock");

        if !idem_key.is_empty() {
            if let Some(existing) = inner.by_idempotency.get(idem_key) {
                if now.signed_duration_since(existing.seen_at) <= self.idem_ttl {
                    let mut meta = existing.meta.clone();
                    meta.duplicate = true;
                    return Ok(meta);
                }
                self.remove_entry_locked(&mut inner, idem_key);
            }
        }

        let ext = ext_from_content_type(content_type);
        let name = format!("{}_{}{}", clean_id, unix_nanos(), ext);
        let full_path = self.frames_dir.join(&name);
        fs::write(&full_path, payload).map_err(StoreError::Write)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&full_path, fs::Permissions::from_mode(0o644));
        }

        let meta = FrameMeta {
            frame_id: frame_id.to_string(),
            timestamp,
            idempotency_key: idem_key.to_string(),
            file_name: name,
            path: full_path.to_string_lossy().into_owned(),
            size: payload.len() as u64,
            content_type: content_type.to_string(),
            sha256: hex::encode(Sha256::digest(payload)),
            received_at: now,
            duplicate: false,
        };

        inner.last = Some(meta.clone());
        inner.count += 1;
        if !idem_key.is_empty() {
            self.add_entry_locked(&mut inner, idem_key, meta.clone(), now);
        }
        self.metrics
            .idempotency_entries
            .set(inner.by_idempotency.len() as i64);
        Ok(meta)
    }

    /// Metadata of the most recent persisted frame plus the running count
    /// of persisted frames (duplicates excluded).
    pub fn last_meta(&self) -> (Option<FrameMeta>, u64) {
        let inner = self.inner.lock().expect("frame store lock");
        (inner.last.clone(), inner.count)
    }

    /// Readiness probe: the frames directory exists.
    pub fn is_ready(&self) -> bool {
        fs::metadata(&self.frames_dir).is_ok()
    }

    pub fn idempotency_size(&self) -> usize {
        self.inner.lock().expect("frame store lock").by_idempotency.len()
    }

    /// Remove every cache entry older than the TTL as of `now`.
    pub fn run_cleanup(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("frame store lock");
        let expired: Vec<String> = inner
            .by_idempotency
            .iter()
            .filter(|(_, e)| now.signed_duration_since(e.seen_at) > self.idem_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.by_idempotency.remove(key);
        }
        if !expired.is_empty() {
            let inner = &mut *inner;
            inner
                .idem_order
                .retain(|k| inner.by_idempotency.contains_key(k));
            debug!(removed = expired.len(), "idempotency cache swept");
        }
        self.metrics
            .idempotency_entries
            .set(inner.by_idempotency.len() as i64);
    }

    fn add_entry_locked(
        &self,
        inner: &mut StoreInner,
        key: &str,
        meta: FrameMeta,
        now: DateTime<Utc>,
    ) {
        inner.idem_order.push_back(key.to_string());
        inner
            .by_idempotency
            .insert(key.to_string(), IdemEntry { meta, seen_at: now });
        while inner.by_idempotency.len() > self.idem_max {
            let Some(oldest) = inner.idem_order.pop_front() else {
                break;
            };
            if inner.by_idempotency.remove(&oldest).is_some() {
                self.metrics.idempotency_evictions_total.inc();
            }
        }
    }

    fn remove_entry_locked(&self, inner: &mut StoreInner, key: &str) {
        if inner.by_idempotency.remove(key).is_some() {
            inner.idem_order.retain(|k| k != key);
        }
    }
}

async fn cleanup_loop(store: Weak<FrameStore>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.upgrade() {
            Some(store) => store.run_cleanup(Utc::now()),
            None => break,
        }
    }
}

fn sanitize_token(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn ext_from_content_type(content_type: &str) -> &'static str {
    let ct = content_type.to_lowercase();
    if ct.contains("png") {
        ".png"
    } else if ct.contains("jpeg") || ct.contains("jpg") {
        ".jpg"
    } else {
        ".bin"
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store(dir: &std::path::Path, ttl: Duration, max: usize) -> Arc<FrameStore> {
        let metrics = Arc::new(Metrics::new().unwrap());
        FrameStore::new(dir, ttl, max, metrics).unwrap()
    }

    fn files_on_disk(store: &FrameStore) -> usize {
        fs::read_dir(&store.frames_dir).unwrap().count()
    }

    // ========== Idempotency ==========

    #[tokio::test]
    async fn repeated_key_writes_once_and_flags_duplicates() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 3);

        let first = store
            .save_frame("f", "", "k", "image/png", b"a")
            .unwrap();
        assert!(!first.duplicate);

        for payload in [b"b", b"c", b"d", b"e"] {
            let meta = store
                .save_frame("f", "", "k", "image/png", payload)
                .unwrap();
            assert!(meta.duplicate);
            assert_eq!(meta.sha256, first.sha256);
            assert_eq!(meta.path, first.path);
            assert_eq!(meta.file_name, first.file_name);
        }

        assert_eq!(files_on_disk(&store), 1);
        assert_eq!(store.idempotency_size(), 1);
        assert_eq!(store.last_meta().1, 1);
    }

    #[tokio::test]
    async fn empty_key_never_deduplicates() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        store.save_frame("f", "", "", "image/png", b"a").unwrap();
        store.save_frame("f", "", "", "image/png", b"a").unwrap();

        assert_eq!(files_on_disk(&store), 2);
        assert_eq!(store.idempotency_size(), 0);
        assert_eq!(store.last_meta().1, 2);
    }

    #[tokio::test]
    async fn capacity_eviction_is_fifo() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 3);

        for key in ["a", "b", "c", "d", "e"] {
            store.save_frame("f", "", key, "image/png", b"x").unwrap();
        }
        assert_eq!(store.idempotency_size(), 3);

        // Oldest two were evicted; a re-save of "a" writes a fresh file.
        let meta = store.save_frame("f", "", "a", "image/png", b"y").unwrap();
        assert!(!meta.duplicate);
        // Newest survivors still hit.
        let meta = store.save_frame("f", "", "e", "image/png", b"z").unwrap();
        assert!(meta.duplicate);
    }

    #[tokio::test]
    async fn ttl_cleanup_removes_expired_entries() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_millis(50), 100);

        store
            .save_frame("f", "", "idem-key", "image/png", b"x")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        store.run_cleanup(Utc::now());
        assert_eq!(store.idempotency_size(), 0);
    }

    #[tokio::test]
    async fn expired_entry_is_replaced_on_resave() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_millis(50), 100);

        let first = store.save_frame("f", "", "k", "image/png", b"a").unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;

        let second = store.save_frame("f", "", "k", "image/png", b"b").unwrap();
        assert!(!second.duplicate);
        assert_ne!(second.file_name, first.file_name);
        assert_eq!(store.idempotency_size(), 1);
        assert_eq!(files_on_disk(&store), 2);
    }

    // ========== Naming ==========

    #[tokio::test]
    async fn hostile_frame_id_is_sanitized() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        let meta = store
            .save_frame("../bad:id", "", "", "image/png", b"ok")
            .unwrap();
        assert!(meta.file_name.starts_with(".._bad_id_"));
        assert!(meta.file_name.ends_with(".png"));
        assert!(!meta.file_name.contains('/'));
        assert!(meta
            .file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        // The file resolves inside the frames directory.
        assert!(std::path::Path::new(&meta.path).starts_with(&store.frames_dir));
    }

    #[tokio::test]
    async fn empty_frame_id_is_synthesized() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        let meta = store.save_frame("  ", "", "", "image/png", b"x").unwrap();
        assert!(meta.file_name.starts_with("frame-"));
    }

    #[tokio::test]
    async fn extension_follows_content_type() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        let png = store.save_frame("a", "", "", "image/png", b"x").unwrap();
        let jpg = store.save_frame("b", "", "", "image/jpeg", b"x").unwrap();
        let bin = store.save_frame("c", "", "", "text/plain", b"x").unwrap();
        assert!(png.file_name.ends_with(".png"));
        assert!(jpg.file_name.ends_with(".jpg"));
        assert!(bin.file_name.ends_with(".bin"));
    }

    // ========== Metadata ==========

    #[tokio::test]
    async fn sha256_matches_disk_contents() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        let meta = store
            .save_frame("f", "", "", "image/png", b"payload bytes")
            .unwrap();
        let on_disk = fs::read(&meta.path).unwrap();
        assert_eq!(meta.sha256, hex::encode(Sha256::digest(&on_disk)));
        assert_eq!(meta.size, on_disk.len() as u64);
    }

    #[tokio::test]
    async fn empty_timestamp_is_filled_with_utc() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);

        let meta = store.save_frame("f", "", "", "image/png", b"x").unwrap();
        assert!(!meta.timestamp.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&meta.timestamp).is_ok());

        let meta = store
            .save_frame("f", "2026-01-02T03:04:05.000000006Z", "", "image/png", b"x")
            .unwrap();
        assert_eq!(meta.timestamp, "2026-01-02T03:04:05.000000006Z");
    }

    // ========== Readiness ==========

    #[tokio::test]
    async fn ready_tracks_frames_dir_existence() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path(), Duration::from_secs(600), 100);
        assert!(store.is_ready());

        fs::remove_dir_all(&store.frames_dir).unwrap();
        assert!(!store.is_ready());
    }

    #[test]
    fn sanitize_token_rules() {
        assert_eq!(sanitize_token(" frame 1 "), "frame_1");
        assert_eq!(sanitize_token("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_token("ok-1.2_3"), "ok-1.2_3");
        assert_eq!(sanitize_token("   "), "");
    }
}
