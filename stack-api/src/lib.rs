pub mod config;
pub mod database;
pub mod router;
pub mod server;
