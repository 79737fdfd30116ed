//! CLI command handlers
//!
//! Each subcommand family is implemented in its own module.

pub mod config;
pub mod helpers;
pub mod promote;
pub mod registry;
pub mod run;
pub mod status;
