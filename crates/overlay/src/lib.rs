pub mod clip;
pub mod cql2;
pub mod error;
pub mod executor;
pub mod fragments;
pub mod geometry;
pub mod hash;
pub mod prepare;

pub use clip::*;
pub use error::*;
pub use executor::*;
pub use fragments::*;
pub use hash::*;
pub use prepare::*;
