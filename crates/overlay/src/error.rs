use foundation::GeographyId;
use streaming::SourceError;

/// Input geometry could not be prepared for clipping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid geometry: {0}")]
pub struct InvalidGeometryError(pub String);

impl InvalidGeometryError {
    pub fn new(message: impl Into<String>) -> Self {
        InvalidGeometryError(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Cql2Error {
    #[error("Query cannot be null or undefined")]
    NullQuery,
    #[error("Invalid query format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("Invalid arguments for operator {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment decomposition did not converge after {iterations} passes")]
    DecomposeLimitExceeded { iterations: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("at least one INTERSECT layer is required")]
    MissingIntersectLayer,
    #[error("geography {0} is listed more than once")]
    DuplicateGeography(GeographyId),
    #[error("geography {0} has no clipping settings")]
    UnknownGeography(GeographyId),
    #[error("clipping produced no usable geometry")]
    ClippingFailed,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Query(#[from] Cql2Error),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("clip worker failed: {0}")]
    WorkerFailed(String),
}
