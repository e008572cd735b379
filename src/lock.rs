use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

const MAX_ACQUIRE_ATTEMPTS: usize = 3;

static NONCE_SEQ: AtomicU64 = AtomicU64::new(0);

pub trait LockCache: Send + Sync {
    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, HarvestError>;
    fn unlock(&self, key: &str) -> Result<(), HarvestError>;
}

pub struct LockGuard<'a, L: LockCache + ?Sized> {
    cache: &'a L,
    key: String,
}

impl<'a, L: LockCache + ?Sized> LockGuard<'a, L> {
    pub fn acquire(cache: &'a L, key: &str, ttl: Duration) -> Result<Option<Self>, HarvestError> {
        if cache.try_lock(key, ttl)? {
            tracing::debug!(key, "lock acquired");
            Ok(Some(Self {
                cache,
                key: key.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<L: LockCache + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        match self.cache.unlock(&self.key) {
            Ok(()) => tracing::debug!(key = %self.key, "lock released"),
            Err(err) => tracing::warn!(key = %self.key, error = %err, "failed to release lock; it expires with its TTL"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockToken {
    key: String,
    nonce: String,
    pid: u32,
    acquired_at_ms: i64,
    expires_at_ms: i64,
}

enum TokenState {
    Missing,
    Live,
    Stale,
}

#[derive(Debug)]
pub struct FileLockCache {
    dir: Utf8PathBuf,
    held: Mutex<HashMap<String, String>>,
}

impl FileLockCache {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self {
            dir,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn token_path(&self, key: &str) -> Utf8PathBuf {
        let name: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.dir.join(format!("{name}.lock"))
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_token(&self, path: &Utf8Path, token: &LockToken) -> io::Result<bool> {
        let content = serde_json::to_vec(token).map_err(io::Error::other)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".token-")
            .tempfile_in(self.dir.as_std_path())?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;
        match fs::hard_link(temp.path(), path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl LockCache for FileLockCache {
    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, HarvestError> {
        fs::create_dir_all(self.dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let path = self.token_path(key);

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let token = LockToken {
                key: key.to_string(),
                nonce: new_nonce(),
                pid: std::process::id(),
                acquired_at_ms: now_ms,
                expires_at_ms: now_ms.saturating_add(ttl.as_millis() as i64),
            };
            let published = self
                .publish_token(&path, &token)
                .map_err(|err| HarvestError::Filesystem(format!("{path}: {err}")))?;
            if published {
                self.held().insert(key.to_string(), token.nonce);
                return Ok(true);
            }

            match inspect_token(&path, ttl)? {
                TokenState::Missing => continue,
                TokenState::Live => return Ok(false),
                TokenState::Stale => {
                    tracing::warn!(key, "reclaiming expired lock");
                    reclaim_stale(&path, ttl)?;
                }
            }
        }
        Ok(false)
    }

    fn unlock(&self, key: &str) -> Result<(), HarvestError> {
        let Some(nonce) = self.held().remove(key) else {
            tracing::debug!(key, "unlock of a key this cache does not hold");
            return Ok(());
        };
        let path = self.token_path(key);
        match read_token(&path)? {
            Some(Ok(token)) if token.nonce == nonce => {}
            Some(_) => {
                tracing::warn!(key, "lock was taken over after expiry; leaving the new token");
                return Ok(());
            }
            None => return Ok(()),
        }
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HarvestError::Filesystem(err.to_string())),
        }
    }
}

fn new_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seq = NONCE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{seq}", std::process::id())
}

fn read_token(path: &Utf8Path) -> Result<Option<Result<LockToken, SystemTime>>, HarvestError> {
    let content = match fs::read(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(HarvestError::Filesystem(err.to_string())),
    };
    if let Ok(token) = serde_json::from_slice::<LockToken>(&content) {
        return Ok(Some(Ok(token)));
    }
    match fs::metadata(path.as_std_path()).and_then(|meta| meta.modified()) {
        Ok(mtime) => Ok(Some(Err(mtime))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(HarvestError::Filesystem(err.to_string())),
    }
}

/// An undecodable token is held until its mtime plus `ttl`.
fn inspect_token(path: &Utf8Path, ttl: Duration) -> Result<TokenState, HarvestError> {
    let state = match read_token(path)? {
        None => TokenState::Missing,
        Some(Ok(token)) => {
            if chrono::Utc::now().timestamp_millis() < token.expires_at_ms {
                TokenState::Live
            } else {
                TokenState::Stale
            }
        }
        Some(Err(mtime)) => match SystemTime::now().duration_since(mtime) {
            Ok(age) if age < ttl => TokenState::Live,
            Err(_) if !ttl.is_zero() => TokenState::Live,
            _ => TokenState::Stale,
        },
    };
    Ok(state)
}

fn reclaim_stale(path: &Utf8Path, ttl: Duration) -> Result<(), HarvestError> {
    let aside = path.with_extension(format!("stale-{}", new_nonce()));
    match fs::rename(path.as_std_path(), aside.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(HarvestError::Filesystem(err.to_string())),
    }
    if let TokenState::Live = inspect_token(&aside, ttl)? {
        if let Err(err) = fs::hard_link(aside.as_std_path(), path.as_std_path()) {
            tracing::warn!(path = %path, error = %err, "failed to restore a live lock token");
        }
    }
    if let Err(err) = fs::remove_file(aside.as_std_path()) {
        tracing::warn!(path = %aside, error = %err, "failed to remove stale lock token");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, FileLockCache) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("locks")).unwrap();
        (temp, FileLockCache::new(dir))
    }

    fn write_raw_token(cache: &FileLockCache, key: &str, content: &[u8]) {
        fs::create_dir_all(cache.dir().as_std_path()).unwrap();
        fs::write(cache.token_path(key).as_std_path(), content).unwrap();
    }

    #[test]
    fn second_lock_is_refused_until_unlock() {
        let (_temp, cache) = cache();
        assert!(cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
        assert!(!cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
        assert!(cache.try_lock("other", DEFAULT_LOCK_TTL).unwrap());

        cache.unlock("dedup").unwrap();
        assert!(cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let (_temp, cache) = cache();
        assert!(cache.try_lock("dedup", Duration::ZERO).unwrap());
        assert!(cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
        assert!(!cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_temp, cache) = cache();
        {
            let guard = LockGuard::acquire(&cache, "dedup", DEFAULT_LOCK_TTL)
                .unwrap()
                .unwrap();
            assert_eq!(guard.key(), "dedup");
            assert!(LockGuard::acquire(&cache, "dedup", DEFAULT_LOCK_TTL)
                .unwrap()
                .is_none());
        }
        assert!(cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn unlock_of_missing_key_is_ok() {
        let (_temp, cache) = cache();
        cache.unlock("never-taken").unwrap();
    }

    #[test]
    fn empty_token_counts_as_held() {
        let (_temp, cache) = cache();
        write_raw_token(&cache, "dedup", b"");
        assert!(!cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
        assert!(cache.token_path("dedup").as_std_path().exists());
    }

    #[test]
    fn garbled_token_expires_with_ttl() {
        let (_temp, cache) = cache();
        write_raw_token(&cache, "dedup", b"{\"key\":");
        assert!(cache.try_lock("dedup", Duration::ZERO).unwrap());
        assert!(!cache.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn unlock_from_another_cache_leaves_token() {
        let (_temp, holder) = cache();
        let other = FileLockCache::new(holder.dir().to_path_buf());
        assert!(holder.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());

        other.unlock("dedup").unwrap();
        assert!(!other.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());

        holder.unlock("dedup").unwrap();
        assert!(other.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn late_unlock_keeps_the_new_holders_token() {
        let (_temp, first) = cache();
        let second = FileLockCache::new(first.dir().to_path_buf());
        assert!(first.try_lock("dedup", Duration::ZERO).unwrap());
        assert!(second.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());

        first.unlock("dedup").unwrap();
        assert!(!first.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());

        second.unlock("dedup").unwrap();
        assert!(first.try_lock("dedup", DEFAULT_LOCK_TTL).unwrap());
    }

    #[test]
    fn keys_are_encoded_into_file_names() {
        let (_temp, cache) = cache();
        let path = cache.token_path("reposconsumer-dedup:http://host:9000:42");
        assert_eq!(
            path.file_name(),
            Some("reposconsumer-dedup%3Ahttp%3A%2F%2Fhost%3A9000%3A42.lock")
        );
    }

    #[test]
    fn distinct_keys_never_share_a_token() {
        let (_temp, cache) = cache();
        let names: Vec<_> = ["a:b", "a/b", "a_b", "a b", "a+b"]
            .iter()
            .map(|key| cache.token_path(key))
            .collect();
        for (i, name) in names.iter().enumerate() {
            assert!(!names[i + 1..].contains(name), "{name} collides");
        }

        assert!(cache.try_lock("a:b", DEFAULT_LOCK_TTL).unwrap());
        assert!(cache.try_lock("a/b", DEFAULT_LOCK_TTL).unwrap());
    }
}
