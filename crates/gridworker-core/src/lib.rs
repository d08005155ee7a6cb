#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model, configuration, and host-info capture for `gridworker`.

pub mod config;
pub mod error;
pub mod hostinfo;
pub mod model;

pub use config::Config;
pub use error::ConfigError;
pub use model::HostInfo;
