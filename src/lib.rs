pub mod action_executor;
pub mod autopilot;
pub mod config;
pub mod currency;
pub mod db;
pub mod error;
pub mod guardrails;
pub mod health_score;
pub mod health_service;
pub mod memory_store;
pub mod metric_rollup;
pub mod models;
pub mod providers;
pub mod recommendations;
pub mod rollback;
pub mod store;
pub mod telemetry;

pub use autopilot::Autopilot;
pub use error::{EngineError, EngineResult, PlatformError};
