use std::sync::Arc;

use foundation::SketchId;
use parking_lot::Mutex;
use streaming::BoxFuture;
use tracing::warn;

/// Recomputes report metrics after a sketch changes. Called without
/// awaiting; failures are logged and otherwise ignored.
pub trait MetricsTrigger: Send + Sync {
    fn sketch_updated(&self, id: SketchId) -> BoxFuture<'_, Result<(), String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsTrigger for NoopMetrics {
    fn sketch_updated(&self, _id: SketchId) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}

/// Remembers every triggered sketch id, in order.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    seen: Mutex<Vec<SketchId>>,
    fail: bool,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn seen(&self) -> Vec<SketchId> {
        self.seen.lock().clone()
    }
}

impl MetricsTrigger for RecordingMetrics {
    fn sketch_updated(&self, id: SketchId) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.seen.lock().push(id);
            if self.fail {
                return Err(format!("metrics backend rejected sketch {id}"));
            }
            Ok(())
        })
    }
}

/// Fires the trigger on a background task.
pub fn spawn_sketch_updated(trigger: Arc<dyn MetricsTrigger>, id: SketchId) {
    tokio::spawn(async move {
        if let Err(err) = trigger.sketch_updated(id).await {
            warn!(sketch = %id, error = %err, "metrics trigger failed");
        }
    });
}
