//! Core library for stagehand
//!
//! This crate folds generated build steps into a project file tree, projects
//! the tree into a mountable filesystem description, and drives a sandbox
//! through dependency install and dev server startup until a preview URL is
//! reachable.

pub mod config;
pub mod errors;
pub mod file_tree;
pub mod lifecycle;
pub mod local;
pub mod logging;
pub mod mount;
pub mod preview;
pub mod sandbox;
pub mod session;
pub mod steps;
