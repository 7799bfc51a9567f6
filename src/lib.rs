pub mod config;
pub mod error;
pub mod http;
pub mod platform;
pub mod sensors;
pub mod storage;
pub mod transport;
pub mod uplink;
