//! Mock daemon implementation for testing and development.
//!
//! This module provides a simulated daemon that can be inspected and driven
//! programmatically without requiring a single-board computer.

pub mod daemon;

// Re-export commonly used types
pub use daemon::{MockConnection, MockDaemon};
