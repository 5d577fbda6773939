use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use futures_util::future::{self, Shared, try_join_all};
use parking_lot::Mutex;

use crate::error::SourceError;
use crate::fetch::{BoxFuture, ByteRange, RangeFetcher};
use crate::residency::ResidencyState;

pub const DEFAULT_PAGE_BYTES: u64 = 64 * 1024;

/// One aligned page of one object: bytes `page * page_bytes` up to the next
/// page boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub url: String,
    pub page: u64,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, page: u64) -> Self {
        Self {
            url: url.into(),
            page,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_bytes: usize,
}

impl MemoryBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    last_used_tick: u64,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, SourceError>>>;

struct CacheState {
    budget: MemoryBudget,
    used_bytes: usize,
    tick: u64,
    evictions: u64,
    entries: BTreeMap<CacheKey, CacheEntry>,
    inflight: HashMap<CacheKey, SharedFetch>,
}

impl CacheState {
    fn hit(&mut self, key: &CacheKey) -> Option<Bytes> {
        self.tick += 1;
        let entry = self.entries.get_mut(key)?;
        entry.last_used_tick = self.tick;
        Some(entry.data.clone())
    }

    fn known(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key) || self.inflight.contains_key(key)
    }

    fn insert(&mut self, key: CacheKey, data: Bytes) {
        if data.len() > self.budget.max_bytes {
            tracing::debug!(
                url = %key.url,
                page = key.page,
                bytes = data.len(),
                max = self.budget.max_bytes,
                "page larger than cache budget; not retained"
            );
            return;
        }

        self.tick += 1;
        let bytes = data.len();
        if let Some(old) = self.entries.insert(
            key.clone(),
            CacheEntry {
                data,
                last_used_tick: self.tick,
            },
        ) {
            self.used_bytes = self.used_bytes.saturating_sub(old.data.len());
        }
        self.used_bytes += bytes;
        self.evict_as_needed(&key);
    }

    /// LRU by `last_used_tick`, tie-break by key ordering. The entry just
    /// inserted is evicted last.
    fn evict_as_needed(&mut self, protected: &CacheKey) {
        while self.used_bytes > self.budget.max_bytes {
            let candidate = self
                .entries
                .iter()
                .filter(|(k, _)| *k != protected)
                .min_by(|(ka, ea), (kb, eb)| {
                    ea.last_used_tick
                        .cmp(&eb.last_used_tick)
                        .then_with(|| ka.cmp(kb))
                })
                .map(|(k, _)| k.clone());

            let Some(key) = candidate else {
                break;
            };
            if let Some(e) = self.entries.remove(&key) {
                self.used_bytes = self.used_bytes.saturating_sub(e.data.len());
                self.evictions += 1;
                tracing::debug!(url = %key.url, page = key.page, "evicted cached page");
            }
        }
    }
}

/// LRU page cache over byte-range fetches, with a byte budget and shared
/// in-flight fetches.
///
/// Requests are widened to fixed, aligned pages. Pages are cached and
/// deduplicated per `(url, page)`, so overlapping requests share both resident
/// data and pending fetches. A run of consecutive missing pages is fetched
/// with one request. Failed fetches are not cached; the next caller issues a
/// new request.
#[derive(Clone)]
pub struct RangeCache {
    fetcher: Arc<dyn RangeFetcher>,
    page_bytes: u64,
    state: Arc<Mutex<CacheState>>,
}

impl RangeCache {
    pub fn new(fetcher: Arc<dyn RangeFetcher>, budget: MemoryBudget) -> Self {
        Self {
            fetcher,
            page_bytes: DEFAULT_PAGE_BYTES,
            state: Arc::new(Mutex::new(CacheState {
                budget,
                used_bytes: 0,
                tick: 0,
                evictions: 0,
                entries: BTreeMap::new(),
                inflight: HashMap::new(),
            })),
        }
    }

    pub fn with_page_bytes(mut self, page_bytes: u64) -> Self {
        self.page_bytes = page_bytes.max(1);
        self
    }

    pub fn page_bytes(&self) -> u64 {
        self.page_bytes
    }

    /// Bytes of `range`, shorter than requested when the object ends first.
    pub async fn get(&self, url: &str, range: ByteRange) -> Result<Bytes, SourceError> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let (first, last) = self.pages(range);
        let pending: Vec<BoxFuture<'static, Result<Bytes, SourceError>>> = {
            let mut state = self.state.lock();
            let mut pending: Vec<BoxFuture<'static, Result<Bytes, SourceError>>> = Vec::new();
            let mut page = first;
            while page <= last {
                let key = CacheKey::new(url, page);
                if let Some(data) = state.hit(&key) {
                    pending.push(Box::pin(future::ready(Ok(data))));
                    page += 1;
                } else if let Some(shared) = state.inflight.get(&key) {
                    pending.push(Box::pin(shared.clone()));
                    page += 1;
                } else {
                    let mut run_end = page;
                    while run_end < last && !state.known(&CacheKey::new(url, run_end + 1)) {
                        run_end += 1;
                    }
                    for shared in self.start_fetch(&mut state, url, page, run_end) {
                        pending.push(Box::pin(shared));
                    }
                    page = run_end + 1;
                }
            }
            pending
        };
        let pages = try_join_all(pending).await?;
        Ok(assemble(&pages, range, first * self.page_bytes, self.page_bytes))
    }

    /// Registers one request for pages `first..=last` and returns a shared
    /// future per page.
    fn start_fetch(
        &self,
        state: &mut CacheState,
        url: &str,
        first: u64,
        last: u64,
    ) -> Vec<SharedFetch> {
        let page_bytes = self.page_bytes;
        let range = ByteRange::from_len(first * page_bytes, (last - first + 1) * page_bytes);
        let run: SharedFetch = {
            let fetcher = self.fetcher.clone();
            let cache = self.state.clone();
            let url = url.to_string();
            let fut: BoxFuture<'static, Result<Bytes, SourceError>> = Box::pin(async move {
                tracing::debug!(url = %url, range = %range, "fetching pages");
                let result = fetcher
                    .fetch_range(url.clone(), range)
                    .await
                    .map_err(|e| SourceError::fetch(&url, range, e));

                let mut state = cache.lock();
                for page in first..=last {
                    let key = CacheKey::new(url.as_str(), page);
                    state.inflight.remove(&key);
                    if let Ok(data) = &result {
                        state.insert(key, page_slice(data, page - first, page_bytes));
                    }
                }
                if let Err(e) = &result {
                    tracing::warn!("{e}");
                }
                result
            });
            fut.shared()
        };

        (first..=last)
            .map(|page| {
                let run = run.clone();
                let fut: BoxFuture<'static, Result<Bytes, SourceError>> = Box::pin(async move {
                    run.await
                        .map(|data| page_slice(&data, page - first, page_bytes))
                });
                let shared = fut.shared();
                state.inflight.insert(CacheKey::new(url, page), shared.clone());
                shared
            })
            .collect()
    }

    fn pages(&self, range: ByteRange) -> (u64, u64) {
        (range.start / self.page_bytes, range.end / self.page_bytes)
    }

    /// Resident when every page of `range` is, fetching when any is pending.
    pub fn state(&self, url: &str, range: ByteRange) -> ResidencyState {
        let (first, last) = self.pages(range);
        let state = self.state.lock();
        let keys = (first..=last).map(|page| CacheKey::new(url, page));
        let mut resident = true;
        for key in keys {
            if state.inflight.contains_key(&key) {
                return ResidencyState::Fetching;
            }
            resident &= state.entries.contains_key(&key);
        }
        if resident {
            ResidencyState::Resident
        } else {
            ResidencyState::Absent
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.state.lock().budget
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.state.lock().evictions
    }
}

fn page_slice(run: &Bytes, index: u64, page_bytes: u64) -> Bytes {
    window(run, index.saturating_mul(page_bytes), page_bytes)
}

fn window(data: &Bytes, offset: u64, len: u64) -> Bytes {
    let size = data.len() as u64;
    let start = offset.min(size);
    let end = offset.saturating_add(len).min(size);
    data.slice(start as usize..end as usize)
}

/// Joins consecutive pages starting at byte `base` and cuts out `range`. A
/// short page is the end of the object.
fn assemble(pages: &[Bytes], range: ByteRange, base: u64, page_bytes: u64) -> Bytes {
    let offset = range.start - base;
    if let [page] = pages {
        return window(page, offset, range.len());
    }
    let mut joined = BytesMut::with_capacity(pages.iter().map(Bytes::len).sum());
    for page in pages {
        joined.extend_from_slice(page);
        if (page.len() as u64) < page_bytes {
            break;
        }
    }
    window(&joined.freeze(), offset, range.len())
}
