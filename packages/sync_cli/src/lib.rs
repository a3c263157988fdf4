//! Configuration loading and the loopback demo behind the `sync-demo` binary.

pub mod config;
pub mod demo;

pub use config::{DemoConfig, DemoPaths, FileConfig, load_config};
pub use demo::{DemoOptions, DemoReport, run_demo};
