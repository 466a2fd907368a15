//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads `host.toml` from the platform config
//! directory (or an explicit `--config` path), fills missing fields with
//! defaults, and turns the result into the settings structs the application
//! layer is built from.
//!
//! Nothing else in the host touches the file system.

pub mod config;
