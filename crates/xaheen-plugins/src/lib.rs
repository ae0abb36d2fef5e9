pub mod archive;
pub mod cache;
pub mod commands;
pub mod compat;
pub mod config;
pub mod deps;
pub mod error;
pub mod installer;
pub mod io;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PluginError, Result};
