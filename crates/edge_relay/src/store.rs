mod sqlite_marker_store;

pub use sqlite_marker_store::*;
