pub mod duration;
pub mod health_check;
pub mod interpolate;
pub mod launcher;
pub mod metrics;
pub mod probe;
pub mod readiness;
pub mod retry;
pub mod spec;
pub mod supervisor;
