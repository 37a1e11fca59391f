pub mod api;
pub mod config;
pub mod pool;
pub mod server;
pub mod session;
pub mod ws;
