#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The DB Gateway: every SQL statement the core issues, plus the FS-lock
//! primitives built on top of it and the optional job-server TCP client.

pub mod error;
pub mod gateway;
pub mod jobserver;
pub mod locking;

pub use error::GatewayError;
pub use gateway::Gateway;
