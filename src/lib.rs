pub mod broker;
pub mod config;
pub mod idle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
