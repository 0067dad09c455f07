//! CLI command implementations.

pub mod config;
pub mod run;

pub use config::cmd_config;
pub use run::run_remediation;
