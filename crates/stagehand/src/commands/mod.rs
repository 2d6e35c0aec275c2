//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod mount;
pub mod preview;
pub mod tree;
