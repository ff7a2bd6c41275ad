// Common library for the engagement automation orchestrator

pub mod actuator;
pub mod alarm;
pub mod bulk;
pub mod config;
pub mod cooldown;
pub mod errors;
pub mod hours;
pub mod models;
pub mod queue;
pub mod runner;
pub mod slots;
pub mod store;
pub mod telemetry;
