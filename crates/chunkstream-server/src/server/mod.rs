pub mod config;
pub mod generation;
pub mod pool;
pub mod service;
pub mod telemetry;
