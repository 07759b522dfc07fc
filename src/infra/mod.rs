//! Infrastructure adapters and runtime bootstrap.

pub mod telemetry;
