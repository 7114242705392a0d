pub mod config;
pub mod descriptor;
pub mod handlers;
pub mod orchestrator;
pub mod volume;
pub mod server;
