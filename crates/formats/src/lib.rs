pub mod geojson;
pub mod source_file;

pub use geojson::*;
pub use source_file::*;
