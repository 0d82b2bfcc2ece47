//! Shared types, error definitions, and the hook system used across all brainproxy crates.

pub mod error;
pub mod hooks;
pub mod types;

pub use {
    error::{Error, Result},
    types::TenantId,
};
