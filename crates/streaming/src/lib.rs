pub mod cache;
pub mod error;
pub mod fetch;
pub mod residency;
pub mod source;
pub mod source_cache;

pub use cache::*;
pub use error::*;
pub use fetch::*;
pub use residency::*;
pub use source::*;
pub use source_cache::*;
