//! rv-core: Core abstractions and configuration for rendezvous tunnels
//!
//! This crate provides the error taxonomy, configuration structures and
//! collaborator traits shared by the agent and its binary.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{RvError, TunnelError};
pub use types::{ConnectionState, Credentials, Registration};
