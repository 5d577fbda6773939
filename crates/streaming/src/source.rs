use formats::{
    Feature, HEADER_LEN, IndexEntry, SourceHeader, decode_feature, decode_header, decode_index,
};
use foundation::Envelope;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::cache::RangeCache;
use crate::error::SourceError;
use crate::fetch::ByteRange;

/// How selected records are grouped into range requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    /// Upper bound on a single request when coalescing neighbouring records.
    pub max_page_bytes: u64,
    /// Records separated by at most this many unwanted bytes share a request.
    pub overfetch_bytes: u64,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            max_page_bytes: 5 * 1024 * 1024,
            overfetch_bytes: 64 * 1024,
        }
    }
}

/// An opened clipping-layer file: header and index are resident, records are
/// fetched on demand through the shared range cache.
pub struct Source {
    url: String,
    header: SourceHeader,
    index: Vec<IndexEntry>,
    cache: RangeCache,
    pages: PageOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Page {
    range: ByteRange,
    // (offset, length) of each wanted record, in file order
    records: Vec<(u64, u32)>,
}

impl Source {
    pub async fn open(
        url: impl Into<String>,
        cache: RangeCache,
        pages: PageOptions,
    ) -> Result<Self, SourceError> {
        let url = url.into();
        let header_bytes = cache.get(&url, ByteRange::from_len(0, HEADER_LEN)).await?;
        let header = decode_header(&header_bytes).map_err(|e| SourceError::format(&url, e))?;

        let index = if header.feature_count == 0 {
            Vec::new()
        } else {
            let index_bytes = cache
                .get(&url, ByteRange::from_len(HEADER_LEN, header.index_len()))
                .await?;
            decode_index(&index_bytes, header.feature_count)
                .map_err(|e| SourceError::format(&url, e))?
        };

        tracing::debug!(url = %url, features = header.feature_count, "opened source");
        Ok(Self {
            url,
            header,
            index,
            cache,
            pages,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bounds(&self) -> Envelope {
        self.header.bounds
    }

    pub fn feature_count(&self) -> u32 {
        self.header.feature_count
    }

    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Lazily streams every feature whose indexed bbox intersects any of
    /// `envelopes`. Each feature is yielded at most once per call.
    pub fn features(&self, envelopes: &[Envelope]) -> BoxStream<'static, Result<Feature, SourceError>> {
        let pages = plan_pages(&self.index, envelopes, self.pages);
        let cache = self.cache.clone();
        let url = self.url.clone();

        stream::iter(pages)
            .then(move |page| {
                let cache = cache.clone();
                let url = url.clone();
                async move { fetch_page(&cache, &url, page).await }
            })
            .flat_map(|result| {
                let items: Vec<Result<Feature, SourceError>> = match result {
                    Ok(features) => features.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    pub async fn features_vec(&self, envelopes: &[Envelope]) -> Result<Vec<Feature>, SourceError> {
        self.features(envelopes).try_collect().await
    }
}

async fn fetch_page(cache: &RangeCache, url: &str, page: Page) -> Result<Vec<Feature>, SourceError> {
    let bytes = cache.get(url, page.range).await?;
    let mut out = Vec::with_capacity(page.records.len());
    for (offset, length) in page.records {
        let start = (offset - page.range.start) as usize;
        let end = start + length as usize;
        if end > bytes.len() {
            return Err(SourceError::format(
                url,
                format!("record at offset {offset} is truncated"),
            ));
        }
        let feature = decode_feature(&bytes[start..end]).map_err(|e| SourceError::format(url, e))?;
        out.push(feature);
    }
    Ok(out)
}

fn plan_pages(index: &[IndexEntry], envelopes: &[Envelope], options: PageOptions) -> Vec<Page> {
    let mut wanted: Vec<&IndexEntry> = index
        .iter()
        .filter(|e| e.length > 0 && e.bbox.intersects_any(envelopes))
        .collect();
    wanted.sort_by_key(|e| e.offset);
    wanted.dedup_by_key(|e| e.offset);

    let mut pages: Vec<Page> = Vec::new();
    for entry in wanted {
        if let Some(page) = pages.last_mut() {
            let page_end = page.range.end + 1;
            let gap = entry.offset.saturating_sub(page_end);
            let grown = entry.end() - page.range.start;
            if gap <= options.overfetch_bytes && grown <= options.max_page_bytes {
                page.range.end = entry.end() - 1;
                page.records.push((entry.offset, entry.length));
                continue;
            }
        }
        pages.push(Page {
            range: ByteRange::from_len(entry.offset, entry.length as u64),
            records: vec![(entry.offset, entry.length)],
        });
    }
    pages
}
