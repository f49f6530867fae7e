//! Command-line interface for `rmeter`.

mod commands;
mod helpers;

pub use commands::{is_verbose, run};
