pub mod error;
pub mod fs_store;
pub mod http;
pub mod network;
pub mod telemetry;
