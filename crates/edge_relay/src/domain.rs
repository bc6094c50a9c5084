mod event_factory;
mod presigned_media_uploader;
mod processing_loop;
mod retry_policy;
mod session_relay_client;
mod session_state_machine;
mod stable_weight;

pub use event_factory::*;
pub use presigned_media_uploader::*;
pub use processing_loop::*;
pub use retry_policy::*;
pub use session_relay_client::*;
pub use session_state_machine::*;
pub use stable_weight::*;
