//! Key derivation and management
//!
//! This module provides functionality for deriving and managing keys for
//! different blockchains.

pub mod bitcoin;
pub mod ethereum;
mod derivation;

pub use derivation::*;
