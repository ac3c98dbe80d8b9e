//! Cadence MCP Server Library
//!
//! Configuration management, telemetry setup and application wiring for
//! the `cadence-mcp` binary.

pub mod config;
pub mod setup;
pub mod telemetry;

pub use config::Config;
pub use setup::{ensure_database_directory, initialize_store, load_flow_config};
pub use telemetry::init_telemetry;
