//! Modelgate - local control plane for an AI model proxy
//!
//! This library runs a thinking-aware relay in front of a local proxy engine:
//! - Supervises the relay and the backend engine as a pair with health checks
//!   and automatic restarts
//! - Runs provider login subprocesses and reports device codes and success
//! - Merges provider switches and key files into the backend's YAML config
//! - Writes the cloud gateway config the relay reads on each request
//! - Injects thinking budgets into Messages API requests and routes them to the
//!   backend, the cloud gateway or the third-party upstream

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod healthcheck;
pub mod logbuf;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod routing;
pub mod supervisor;
pub mod sync;
pub mod thinking;
pub mod upstream;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
