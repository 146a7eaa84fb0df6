//! Disk-backed cache of rendered player bust images.
//!
//! Lookups are served from disk while the file is younger than the TTL.
//! Refreshes are single-flight per key: concurrent callers share one
//! upstream fetch. When the upstream fails the last file on disk keeps being
//! served; with nothing on disk a bundled placeholder is written and served.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

/// Image served when no render has ever been fetched for a player.
pub const PLACEHOLDER_PNG: &[u8] = include_bytes!("../assets/default_bust.png");

pub const DEFAULT_TTL_DAYS: u64 = 30;

pub fn ttl_days(days: u64) -> Duration {
    Duration::from_secs(days * 24 * 60 * 60)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AvatarError {
    #[error("identifier contains no usable characters")]
    InvalidIdentifier,
    #[error("upstream render failed: {0}")]
    Upstream(String),
    #[error("avatar cache I/O failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for AvatarError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// How current the served image is; drives downstream cache headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl Freshness {
    pub fn cache_control(self) -> &'static str {
        match self {
            Self::Fresh => "public, max-age=86400",
            Self::Stale => "public, max-age=3600",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Avatar {
    pub bytes: Bytes,
    pub freshness: Freshness,
}

/// Upstream renderer of player busts.
pub trait AvatarSource: Send + Sync {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, AvatarError>>;
}

/// Fetches renders over HTTP from a URL template containing `{id}`.
pub struct HttpAvatarSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpAvatarSource {
    pub fn new(url_template: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url_template: url_template.into(),
        }
    }
}

impl AvatarSource for HttpAvatarSource {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, AvatarError>> {
        async move {
            let url = self.url_template.replace("{id}", key);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| AvatarError::Upstream(e.to_string()))?;
            response
                .bytes()
                .await
                .map_err(|e| AvatarError::Upstream(e.to_string()))
        }
        .boxed()
    }
}

type Refresh = Shared<BoxFuture<'static, Result<Avatar, AvatarError>>>;

struct Inner {
    dir: PathBuf,
    ttl: Duration,
    source: Arc<dyn AvatarSource>,
    in_flight: DashMap<String, Refresh>,
}

#[derive(Clone)]
pub struct AvatarCache {
    inner: Arc<Inner>,
}

/// Keep only ASCII alphanumerics, `_` and `-`.
pub fn sanitize_key(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl AvatarCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, source: Arc<dyn AvatarSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                ttl,
                source,
                in_flight: DashMap::new(),
            }),
        }
    }

    pub async fn get_avatar(
        &self,
        identifier: &str,
        force_refresh: bool,
    ) -> Result<Avatar, AvatarError> {
        let key = sanitize_key(identifier);
        if key.is_empty() {
            return Err(AvatarError::InvalidIdentifier);
        }

        if !force_refresh {
            if let Some(bytes) = self.inner.read_fresh(&key).await {
                return Ok(Avatar {
                    bytes,
                    freshness: Freshness::Fresh,
                });
            }
        }

        // Join a refresh already running for this key, or start one. The
        // refresh runs as its own task so it settles even if every caller
        // goes away.
        let refresh = self
            .inner
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let result = inner.refresh(&key).await;
                    inner.in_flight.remove(&key);
                    result
                })
                .map(|joined| match joined {
                    Ok(result) => result,
                    Err(e) => Err(AvatarError::Io(format!("refresh task failed: {e}"))),
                })
                .boxed()
                .shared()
            })
            .clone();

        refresh.await
    }
}

impl Inner {
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.png"))
    }

    async fn read_fresh(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        if metadata.len() == 0 {
            return None;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            return None;
        }
        tokio::fs::read(&path).await.ok().map(Bytes::from)
    }

    async fn refresh(&self, key: &str) -> Result<Avatar, AvatarError> {
        let path = self.path_for(key);

        match self.source.fetch(key).await {
            Ok(bytes) if !bytes.is_empty() => {
                if let Err(e) = self.write_atomic(&path, &bytes).await {
                    tracing::warn!("Could not cache avatar for {key}: {e}");
                }
                return Ok(Avatar {
                    bytes,
                    freshness: Freshness::Fresh,
                });
            }
            Ok(_) => tracing::warn!("Upstream returned an empty avatar for {key}"),
            Err(e) => tracing::warn!("Avatar refresh for {key} failed: {e}"),
        }

        // Any file on disk, however old, beats the placeholder
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if !bytes.is_empty() {
                return Ok(Avatar {
                    bytes: Bytes::from(bytes),
                    freshness: Freshness::Stale,
                });
            }
        }

        self.write_atomic(&path, PLACEHOLDER_PNG).await?;
        Ok(Avatar {
            bytes: Bytes::from_static(PLACEHOLDER_PNG),
            freshness: Freshness::Stale,
        })
    }

    /// Write to a temporary sibling then rename over the target.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), AvatarError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts fetches; optionally fails, optionally waits before answering.
    struct StubSource {
        calls: AtomicUsize,
        body: Option<&'static [u8]>,
        delay: Duration,
    }

    impl StubSource {
        fn ok(body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body: Some(body),
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body: None,
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AvatarSource for StubSource {
        fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Bytes, AvatarError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                match self.body {
                    Some(body) => Ok(Bytes::from_static(body)),
                    None => Err(AvatarError::Upstream("stub down".into())),
                }
            }
            .boxed()
        }
    }

    fn cache(dir: &Path, source: Arc<StubSource>) -> AvatarCache {
        AvatarCache::new(dir, ttl_days(DEFAULT_TTL_DAYS), source)
    }

    #[test]
    fn sanitizes_identifiers() {
        assert_eq!(sanitize_key("Steve"), "Steve");
        assert_eq!(sanitize_key("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_key("a_b-c d.png"), "a_b-cdpng");
        assert_eq!(sanitize_key("///"), "");
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubSource {
            calls: AtomicUsize::new(0),
            body: Some(b"steve-render"),
            delay: Duration::from_millis(100),
        });
        let cache = cache(dir.path(), source.clone());

        let results = futures::future::join_all(
            (0..8).map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_avatar("Steve", false).await })
            }),
        )
        .await;

        assert_eq!(source.calls(), 1);
        for result in results {
            let avatar = result.unwrap().unwrap();
            assert_eq!(&avatar.bytes[..], b"steve-render");
        }
        assert!(cache.inner.in_flight.is_empty());
    }

    #[tokio::test]
    async fn abandoned_refresh_still_settles() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubSource {
            calls: AtomicUsize::new(0),
            body: Some(b"steve-render"),
            delay: Duration::from_millis(100),
        });
        let cache = cache(dir.path(), source.clone());

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_avatar("Steve", false).await }
        });
        while cache.inner.in_flight.is_empty() {
            tokio::task::yield_now().await;
        }
        waiter.abort();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.inner.in_flight.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("in-flight marker should clear");
        assert_eq!(std::fs::read(dir.path().join("Steve.png")).unwrap(), b"steve-render");

        cache.get_avatar("Steve", false).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn fresh_hit_skips_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::ok(b"render");
        let cache = cache(dir.path(), source.clone());

        let first = cache.get_avatar("Steve", false).await.unwrap();
        assert_eq!(first.freshness, Freshness::Fresh);
        let second = cache.get_avatar("Steve", false).await.unwrap();
        assert_eq!(second.freshness, Freshness::Fresh);
        assert_eq!(&second.bytes[..], b"render");
        assert_eq!(source.calls(), 1);

        cache.get_avatar("Steve", true).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn expired_file_triggers_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::ok(b"new");
        std::fs::write(dir.path().join("Steve.png"), b"old").unwrap();
        let cache = AvatarCache::new(dir.path(), Duration::ZERO, source.clone());

        let avatar = cache.get_avatar("Steve", false).await.unwrap();
        assert_eq!(&avatar.bytes[..], b"new");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_serves_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Steve.png"), b"old-render").unwrap();
        let source = StubSource::failing();
        let cache = cache(dir.path(), source.clone());

        let avatar = cache.get_avatar("Steve", true).await.unwrap();
        assert_eq!(&avatar.bytes[..], b"old-render");
        assert_eq!(avatar.freshness, Freshness::Stale);
        assert_eq!(avatar.freshness.cache_control(), "public, max-age=3600");
    }

    #[tokio::test]
    async fn upstream_failure_without_file_writes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::failing();
        let cache = cache(dir.path(), source.clone());

        let avatar = cache.get_avatar("Alex", false).await.unwrap();
        assert_eq!(&avatar.bytes[..], PLACEHOLDER_PNG);
        assert_eq!(avatar.freshness, Freshness::Stale);
        assert_eq!(std::fs::read(dir.path().join("Alex.png")).unwrap(), PLACEHOLDER_PNG);

        // Placeholder now sits on the fast path
        let again = cache.get_avatar("Alex", false).await.unwrap();
        assert_eq!(again.freshness, Freshness::Fresh);
        assert_eq!(source.calls(), 1);
        assert!(cache.inner.in_flight.is_empty());
    }

    #[tokio::test]
    async fn unwritable_cache_without_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the cache directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = cache(&blocker, StubSource::failing());

        let err = cache.get_avatar("Steve", false).await.unwrap_err();
        assert!(matches!(err, AvatarError::Io(_)));
    }

    #[tokio::test]
    async fn empty_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = StubSource::ok(b"x");
        let cache = cache(dir.path(), source.clone());
        assert!(matches!(
            cache.get_avatar("../", false).await,
            Err(AvatarError::InvalidIdentifier)
        ));
        assert_eq!(source.calls(), 0);
    }
}
