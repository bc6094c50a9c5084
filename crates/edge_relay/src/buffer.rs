mod offline_event_buffer;

pub use offline_event_buffer::*;
