pub mod buffer;
pub mod capture;
pub mod domain;
pub mod http;
pub mod mqtt;
pub mod store;

mod edge_relay;

pub use edge_relay::*;
