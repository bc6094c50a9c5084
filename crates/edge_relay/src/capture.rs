mod device_source;
mod directory_source;

pub use device_source::*;
pub use directory_source::*;
