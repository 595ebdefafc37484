//! The `utils` module provides shared definitions used across the harness:
//! the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;
