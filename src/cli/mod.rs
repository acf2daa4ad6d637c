//! Command-line interface for queue-schema.

mod commands;

pub use commands::{is_verbose, run};
