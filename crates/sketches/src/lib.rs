pub mod config;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod reconcile;
pub mod service;
pub mod store;

// Sketch orchestration over the overlay engine: persistence, collection
// locking and fragment reconciliation.
pub use config::*;
pub use error::*;
pub use locks::*;
pub use metrics::*;
pub use model::*;
pub use reconcile::*;
pub use service::*;
pub use store::*;
