//! Byte-range fetchers backing the range cache.
//!
//! - `HttpRangeFetcher`: remote object store via `Range: bytes=start-end`
//! - `FileRangeFetcher`: local files, used by the CLI
//! - `MemoryRangeFetcher`: in-memory objects for tests
//!
//! New backends can be added by implementing `RangeFetcher`.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::FetchError;

/// Type alias for a boxed future that can be sent between threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inclusive byte range, as in an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range covering `len` bytes from `start`. `len` must be non-zero.
    pub fn from_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.saturating_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Fetches byte ranges of remote objects.
///
/// Implementations must be `Send + Sync` for use across async tasks.
/// Methods return boxed futures for dyn-compatibility.
pub trait RangeFetcher: Send + Sync {
    /// Returns the requested bytes. A response may be shorter than the range
    /// when the object ends first.
    fn fetch_range(&self, url: String, range: ByteRange) -> BoxFuture<'_, Result<Bytes, FetchError>>;
}

/// HTTP range requests against an object store.
pub struct HttpRangeFetcher {
    client: reqwest::Client,
}

impl HttpRangeFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeFetcher for HttpRangeFetcher {
    fn fetch_range(&self, url: String, range: ByteRange) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(&url)
                .header(reqwest::header::RANGE, range.header_value())
                .send()
                .await
                .map_err(|e| FetchError::new(format!("HTTP request failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::new(format!("HTTP error: {status}")));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| FetchError::new(format!("failed to read response: {e}")))?;

            // A server that ignores Range answers 200 with the whole object.
            if status == reqwest::StatusCode::PARTIAL_CONTENT {
                Ok(body)
            } else {
                Ok(slice_range(body, range))
            }
        })
    }
}

/// Local files addressed by path (optionally relative to a root directory).
pub struct FileRangeFetcher {
    root: Option<PathBuf>,
}

impl FileRangeFetcher {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = url.strip_prefix("file://").unwrap_or(url);
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl Default for FileRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeFetcher for FileRangeFetcher {
    fn fetch_range(&self, url: String, range: ByteRange) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        let path = self.resolve(&url);
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| FetchError::new(format!("open {}: {e}", path.display())))?;
            let file_len = file
                .metadata()
                .await
                .map_err(|e| FetchError::new(format!("stat {}: {e}", path.display())))?
                .len();
            if range.start >= file_len {
                return Ok(Bytes::new());
            }
            let len = range.len().min(file_len - range.start) as usize;
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| FetchError::new(format!("seek {}: {e}", path.display())))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| FetchError::new(format!("read {}: {e}", path.display())))?;
            Ok(Bytes::from(buf))
        })
    }
}

/// In-memory objects for tests. Counts every underlying fetch.
#[derive(Default)]
pub struct MemoryRangeFetcher {
    objects: RwLock<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
    failures_remaining: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryRangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, widening the window in which requests overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(url.into(), data.into());
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RangeFetcher for MemoryRangeFetcher {
    fn fetch_range(&self, url: String, range: ByteRange) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(FetchError::new("injected failure"));
            }
            let data = self
                .objects
                .read()
                .get(&url)
                .cloned()
                .ok_or_else(|| FetchError::new(format!("HTTP error: 404 Not Found ({url})")))?;
            Ok(slice_range(data, range))
        })
    }
}

fn slice_range(data: Bytes, range: ByteRange) -> Bytes {
    let len = data.len() as u64;
    if range.start >= len {
        return Bytes::new();
    }
    let end = range.end.saturating_add(1).min(len);
    data.slice(range.start as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::{ByteRange, FileRangeFetcher, MemoryRangeFetcher, RangeFetcher};
    use std::io::Write;

    #[test]
    fn range_header_is_inclusive() {
        let r = ByteRange::from_len(100, 50);
        assert_eq!(r.end, 149);
        assert_eq!(r.len(), 50);
        assert_eq!(r.header_value(), "bytes=100-149");
        assert_eq!(r.to_string(), "100-149");
    }

    #[tokio::test]
    async fn memory_fetcher_slices_and_truncates() {
        let fetcher = MemoryRangeFetcher::new();
        fetcher.insert("mem://a", b"0123456789".to_vec());

        let got = fetcher
            .fetch_range("mem://a".to_string(), ByteRange::new(2, 4))
            .await
            .unwrap();
        assert_eq!(&got[..], b"234");

        let tail = fetcher
            .fetch_range("mem://a".to_string(), ByteRange::new(8, 100))
            .await
            .unwrap();
        assert_eq!(&tail[..], b"89");
        assert_eq!(fetcher.fetch_count(), 2);

        assert!(
            fetcher
                .fetch_range("mem://missing".to_string(), ByteRange::new(0, 1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let fetcher = MemoryRangeFetcher::new();
        fetcher.insert("mem://a", b"abc".to_vec());
        fetcher.fail_next(1);
        let range = ByteRange::new(0, 2);
        assert!(fetcher.fetch_range("mem://a".to_string(), range).await.is_err());
        assert!(fetcher.fetch_range("mem://a".to_string(), range).await.is_ok());
    }

    #[tokio::test]
    async fn file_fetcher_reads_ranges_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("layer.sksf")).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let fetcher = FileRangeFetcher::with_root(dir.path());
        let got = fetcher
            .fetch_range("layer.sksf".to_string(), ByteRange::new(6, 10))
            .await
            .unwrap();
        assert_eq!(&got[..], b"world");

        let past_end = fetcher
            .fetch_range("layer.sksf".to_string(), ByteRange::new(50, 60))
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }
}
