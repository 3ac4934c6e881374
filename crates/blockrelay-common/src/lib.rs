//! BlockRelay Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, and configuration
//! structures shared between the proxy core and its consumers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{GeometryDefaults, PoolConfig, ProxyConfig};
pub use error::{Error, Result};
pub use types::*;
