//! Where the boolean work of a clip runs.
//!
//! Both executors pull candidate polygons from the shared `SourceCache`,
//! limited to the sketch envelopes. `InlineClipExecutor` then clips on the
//! calling task; `PooledClipExecutor` hands the clip to tokio's blocking
//! pool, with at most `workers` clips in flight.

use std::sync::Arc;

use formats::Feature;
use foundation::Envelope;
use futures_util::TryStreamExt;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use streaming::{BoxFuture, SourceCache};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::clip::{ClippingLayer, PolygonClipResult, clip_sketch_to_polygons};
use crate::error::ClipError;

#[derive(Debug, Clone, PartialEq)]
pub struct ClipRequest {
    pub sketch: MultiPolygon<f64>,
    pub envelopes: Vec<Envelope>,
    pub layer: ClippingLayer,
}

pub trait ClipExecutor: Send + Sync {
    fn clip(&self, request: ClipRequest) -> BoxFuture<'_, Result<PolygonClipResult, ClipError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipMode {
    #[default]
    Inline,
    Pooled,
}

impl std::str::FromStr for ClipMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(ClipMode::Inline),
            "pooled" => Ok(ClipMode::Pooled),
            other => Err(format!("unknown clip mode: {other}")),
        }
    }
}

pub fn executor_for(mode: ClipMode, sources: Arc<SourceCache>, workers: usize) -> Arc<dyn ClipExecutor> {
    match mode {
        ClipMode::Inline => Arc::new(InlineClipExecutor::new(sources)),
        ClipMode::Pooled => Arc::new(PooledClipExecutor::new(sources, workers)),
    }
}

/// Every feature of `source` whose indexed bbox touches one of `envelopes`.
pub async fn collect_candidates(
    sources: &SourceCache,
    source: &str,
    envelopes: &[Envelope],
) -> Result<Vec<Feature>, ClipError> {
    let opened = sources.get(source).await?;
    let features: Vec<Feature> = opened.features(envelopes).try_collect().await?;
    debug!(source, candidates = features.len(), "collected clipping candidates");
    Ok(features)
}

pub struct InlineClipExecutor {
    sources: Arc<SourceCache>,
}

impl InlineClipExecutor {
    pub fn new(sources: Arc<SourceCache>) -> Self {
        Self { sources }
    }
}

impl ClipExecutor for InlineClipExecutor {
    fn clip(&self, request: ClipRequest) -> BoxFuture<'_, Result<PolygonClipResult, ClipError>> {
        Box::pin(async move {
            let features = collect_candidates(&self.sources, &request.layer.source, &request.envelopes).await?;
            clip_sketch_to_polygons(
                &request.sketch,
                request.layer.op,
                request.layer.cql2_query.as_ref(),
                &features,
            )
        })
    }
}

pub struct PooledClipExecutor {
    sources: Arc<SourceCache>,
    permits: Arc<Semaphore>,
}

impl PooledClipExecutor {
    pub fn new(sources: Arc<SourceCache>, workers: usize) -> Self {
        Self {
            sources,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }
}

impl ClipExecutor for PooledClipExecutor {
    fn clip(&self, request: ClipRequest) -> BoxFuture<'_, Result<PolygonClipResult, ClipError>> {
        Box::pin(async move {
            let features = collect_candidates(&self.sources, &request.layer.source, &request.envelopes).await?;
            let _permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ClipError::WorkerFailed(e.to_string()))?;
            let ClipRequest { sketch, layer, .. } = request;
            tokio::task::spawn_blocking(move || {
                clip_sketch_to_polygons(&sketch, layer.op, layer.cql2_query.as_ref(), &features)
            })
            .await
            .map_err(|e| ClipError::WorkerFailed(e.to_string()))?
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_sources::source_cache;
    use super::{ClipExecutor, ClipMode, ClipRequest, InlineClipExecutor, PooledClipExecutor, collect_candidates, executor_for};
    use crate::clip::{ClippingLayer, ClippingOperation};
    use crate::geometry::test_shapes::{rect, rect_mp};
    use formats::Feature;
    use foundation::Envelope;
    use geo::Area;
    use serde_json::json;
    use std::sync::Arc;

    fn layer_features() -> Vec<Feature> {
        vec![
            Feature::new(rect(0.0, 0.0, 1.0, 1.0)).with_property("kind", "reef"),
            Feature::new(rect(1.0, 0.0, 2.0, 1.0)).with_property("kind", "kelp"),
            Feature::new(rect(40.0, 40.0, 41.0, 41.0)).with_property("kind", "reef"),
        ]
    }

    fn request(query: Option<serde_json::Value>) -> ClipRequest {
        let mut layer = ClippingLayer::new(ClippingOperation::Intersect, "habitat");
        layer.cql2_query = query;
        ClipRequest {
            sketch: rect_mp(0.5, 0.0, 1.5, 1.0),
            envelopes: vec![Envelope::new(0.5, 0.0, 1.5, 1.0)],
            layer,
        }
    }

    #[tokio::test]
    async fn candidates_are_limited_to_envelopes() {
        let sources = source_cache(&[("habitat", layer_features())]);
        let near = collect_candidates(&sources, "habitat", &[Envelope::new(0.5, 0.0, 1.5, 1.0)])
            .await
            .unwrap();
        assert_eq!(near.len(), 2);
        let far = collect_candidates(&sources, "habitat", &[Envelope::new(40.5, 40.5, 40.6, 40.6)])
            .await
            .unwrap();
        assert_eq!(far.len(), 1);
    }

    #[tokio::test]
    async fn inline_and_pooled_agree() {
        let sources = source_cache(&[("habitat", layer_features())]);
        let inline = InlineClipExecutor::new(sources.clone());
        let pooled = PooledClipExecutor::new(sources, 2);
        let reef = json!({"op": "=", "args": [{"property": "kind"}, "reef"]});

        let a = inline.clip(request(Some(reef.clone()))).await.unwrap();
        let b = pooled.clip(request(Some(reef))).await.unwrap();
        assert_eq!(a, b);
        assert!(a.changed);
        assert!((a.output.unwrap().unsigned_area() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pooled_executor_handles_concurrent_requests() {
        let sources = source_cache(&[("habitat", layer_features())]);
        let pooled: Arc<dyn ClipExecutor> = executor_for(ClipMode::Pooled, sources, 1);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pooled = pooled.clone();
            tasks.push(tokio::spawn(async move { pooled.clip(request(None)).await }));
        }
        for t in tasks {
            let r = t.await.unwrap().unwrap();
            assert!(!r.changed);
        }
    }

    #[test]
    fn clip_mode_parses_from_text() {
        assert_eq!("pooled".parse::<ClipMode>(), Ok(ClipMode::Pooled));
        assert_eq!(" Inline ".parse::<ClipMode>(), Ok(ClipMode::Inline));
        assert!("threads".parse::<ClipMode>().is_err());
        assert_eq!(serde_json::from_value::<ClipMode>(json!("pooled")).unwrap(), ClipMode::Pooled);
    }
}
