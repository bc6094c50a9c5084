mod broker_client;
mod network_loop;
mod topic;

pub use broker_client::*;
pub use network_loop::*;
pub use topic::*;
