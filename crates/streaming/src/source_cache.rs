use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;

use crate::cache::{DEFAULT_PAGE_BYTES, MemoryBudget, RangeCache};
use crate::error::SourceError;
use crate::fetch::{BoxFuture, RangeFetcher};
use crate::source::{PageOptions, Source};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCacheOptions {
    /// Prefix for object keys that are not already absolute URLs.
    pub base_url: Option<String>,
    pub max_bytes: usize,
    /// Alignment and granularity of cached byte ranges.
    pub cache_page_bytes: u64,
    /// Open sources beyond which idle ones are closed.
    pub max_sources: usize,
    pub pages: PageOptions,
}

impl Default for SourceCacheOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            max_bytes: 50 * 1024 * 1024,
            cache_page_bytes: DEFAULT_PAGE_BYTES,
            max_sources: 256,
            pages: PageOptions::default(),
        }
    }
}

type SharedOpen = Shared<BoxFuture<'static, Result<Arc<Source>, SourceError>>>;

enum Slot {
    Opening(SharedOpen),
    Ready { source: Arc<Source>, last_used: u64 },
}

struct Slots {
    max_sources: usize,
    tick: u64,
    by_url: HashMap<String, Slot>,
}

impl Slots {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn ready(&mut self, url: String, source: Arc<Source>) {
        let last_used = self.touch();
        self.by_url.insert(url.clone(), Slot::Ready { source, last_used });
        self.evict_idle(&url);
    }

    /// Closes least recently used sources that only this registry still
    /// holds while more than `max_sources` are open.
    fn evict_idle(&mut self, keep: &str) {
        let open = self
            .by_url
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count();
        if open <= self.max_sources {
            return;
        }
        let mut idle: Vec<(u64, String)> = self
            .by_url
            .iter()
            .filter_map(|(url, slot)| match slot {
                Slot::Ready { source, last_used }
                    if url != keep && Arc::strong_count(source) == 1 =>
                {
                    Some((*last_used, url.clone()))
                }
                _ => None,
            })
            .collect();
        idle.sort();
        for (_, url) in idle.into_iter().take(open - self.max_sources) {
            self.by_url.remove(&url);
            tracing::debug!(url = %url, "closed idle source");
        }
    }
}

/// Process-wide registry of opened sources over one shared range cache.
///
/// Construct once at startup and pass it to whatever needs clipping-layer
/// data. `get` returns the same `Source` for the same key while it stays
/// open; concurrent opens of one key are deduplicated and a failed open is
/// retried by the next caller. Sources nobody else holds are closed least
/// recently used first once more than `max_sources` of them are open.
pub struct SourceCache {
    ranges: RangeCache,
    options: SourceCacheOptions,
    slots: Arc<Mutex<Slots>>,
}

impl SourceCache {
    pub fn new(fetcher: Arc<dyn RangeFetcher>, options: SourceCacheOptions) -> Self {
        Self {
            ranges: RangeCache::new(fetcher, MemoryBudget::new(options.max_bytes))
                .with_page_bytes(options.cache_page_bytes),
            slots: Arc::new(Mutex::new(Slots {
                max_sources: options.max_sources,
                tick: 0,
                by_url: HashMap::new(),
            })),
            options,
        }
    }

    pub fn ranges(&self) -> &RangeCache {
        &self.ranges
    }

    /// Number of open or opening sources.
    pub fn open_sources(&self) -> usize {
        self.slots.lock().by_url.len()
    }

    pub fn resolve_url(&self, object_key: &str) -> String {
        let absolute = object_key.contains("://") || object_key.starts_with('/');
        match (&self.options.base_url, absolute) {
            (Some(base), false) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                object_key.trim_start_matches('/')
            ),
            _ => object_key.to_string(),
        }
    }

    pub async fn get(&self, object_key: &str) -> Result<Arc<Source>, SourceError> {
        let url = self.resolve_url(object_key);
        let pending = {
            let mut slots = self.slots.lock();
            let now = slots.touch();
            match slots.by_url.get_mut(&url) {
                Some(Slot::Ready { source, last_used }) => {
                    *last_used = now;
                    return Ok(source.clone());
                }
                Some(Slot::Opening(shared)) => shared.clone(),
                None => {
                    let shared = self.start_open(url.clone());
                    slots.by_url.insert(url, Slot::Opening(shared.clone()));
                    shared
                }
            }
        };
        pending.await
    }

    fn start_open(&self, url: String) -> SharedOpen {
        let ranges = self.ranges.clone();
        let pages = self.options.pages;
        let slots = self.slots.clone();
        let fut: BoxFuture<'static, Result<Arc<Source>, SourceError>> = Box::pin(async move {
            let result = Source::open(url.clone(), ranges, pages).await.map(Arc::new);
            {
                let mut slots = slots.lock();
                match &result {
                    Ok(source) => slots.ready(url, source.clone()),
                    Err(_) => {
                        slots.by_url.remove(&url);
                    }
                }
            }
            result
        });
        fut.shared()
    }
}
