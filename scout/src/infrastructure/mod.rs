pub mod audit;
pub mod config;
pub mod preferences;
pub mod server;
pub mod telemetry;
