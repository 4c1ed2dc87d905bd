//! Block model.
//!
//! A "block" is one command execution:
//! - command + classification
//! - processed output
//! - status / exit code
//! - cwd
//! - timing

pub mod model;

pub use model::{Block, BlockId, BlockOrigin, BlockSnapshot, BlockStatus};
