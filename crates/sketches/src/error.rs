use foundation::{GeographyId, SketchId};
use overlay::{ClipError, FragmentError, FragmentHash, InvalidGeometryError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    Missing(String),
    #[error("store constraint violated: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    /// Kept fragments would overlap replacements for the same sketch: some
    /// fragment that fed the merge was left out of the deletion scope.
    #[error("deletion scope for sketch {sketch_id} misses overlapping fragments: {}", join_hashes(.hashes))]
    IncompleteDeletionScope {
        sketch_id: SketchId,
        hashes: Vec<FragmentHash>,
    },
    /// The sketch's fragments changed between checking a plan and applying it.
    #[error("fragments of sketch {sketch_id} changed since the plan was checked")]
    StalePlan { sketch_id: SketchId },
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn join_hashes(hashes: &[FragmentHash]) -> String {
    hashes
        .iter()
        .map(FragmentHash::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum SketchError {
    #[error("{0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    InvalidGeometry(#[from] InvalidGeometryError),
    #[error("clipping failed: the sketch does not fall within any of its geographies")]
    ClippingFailed,
    #[error("geography {0} is listed more than once")]
    DuplicateGeography(GeographyId),
    #[error("geography {0} has no clipping settings")]
    UnknownGeography(GeographyId),
    /// A concurrent change moved the rows this mutation was planned against.
    #[error("conflicting change: {0}")]
    Conflict(String),
    #[error("background work failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Clip(ClipError),
    #[error(transparent)]
    Reconcile(ReconcileError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<ReconcileError> for SketchError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::StalePlan { sketch_id } => {
                SketchError::Conflict(format!("fragments of sketch {sketch_id} changed concurrently"))
            }
            other => SketchError::Reconcile(other),
        }
    }
}

impl From<tokio::task::JoinError> for SketchError {
    fn from(err: tokio::task::JoinError) -> Self {
        SketchError::Worker(err.to_string())
    }
}

impl From<ClipError> for SketchError {
    fn from(err: ClipError) -> Self {
        match err {
            ClipError::ClippingFailed => SketchError::ClippingFailed,
            ClipError::DuplicateGeography(id) => SketchError::DuplicateGeography(id),
            ClipError::UnknownGeography(id) => SketchError::UnknownGeography(id),
            other => SketchError::Clip(other),
        }
    }
}

impl From<StoreError> for SketchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(_) => SketchError::NotFound,
            other => SketchError::Store(other),
        }
    }
}

impl From<FragmentError> for SketchError {
    fn from(err: FragmentError) -> Self {
        SketchError::Reconcile(ReconcileError::Fragment(err))
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconcileError, SketchError, StoreError};
    use foundation::{GeographyId, SketchId};
    use overlay::ClipError;

    #[test]
    fn clip_failures_map_to_dedicated_variants() {
        assert!(matches!(SketchError::from(ClipError::ClippingFailed), SketchError::ClippingFailed));
        assert!(matches!(
            SketchError::from(ClipError::DuplicateGeography(GeographyId::new(2))),
            SketchError::DuplicateGeography(_)
        ));
        assert!(matches!(
            SketchError::from(ClipError::UnknownGeography(GeographyId::new(4))),
            SketchError::UnknownGeography(id) if id == GeographyId::new(4)
        ));
        assert!(matches!(
            SketchError::from(ClipError::MissingIntersectLayer),
            SketchError::Clip(ClipError::MissingIntersectLayer)
        ));
    }

    #[test]
    fn access_errors_do_not_leak_details() {
        assert_eq!(SketchError::from(StoreError::Missing("sketch 3".into())).to_string(), "not found");
        assert_eq!(SketchError::PermissionDenied.to_string(), "permission denied");
    }

    #[test]
    fn stale_plans_surface_as_conflicts() {
        let err = SketchError::from(ReconcileError::StalePlan {
            sketch_id: SketchId::new(3),
        });
        assert!(matches!(err, SketchError::Conflict(_)));
        assert_eq!(err.to_string(), "conflicting change: fragments of sketch 3 changed concurrently");
    }

    #[test]
    fn incomplete_scope_lists_hashes() {
        let err = ReconcileError::IncompleteDeletionScope {
            sketch_id: SketchId::new(5),
            hashes: Vec::new(),
        };
        assert!(err.to_string().starts_with("deletion scope for sketch 5"));
    }
}
