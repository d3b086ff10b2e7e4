//! Command implementations.
//!
//! The default command (loading an image) lives in [`load`]; each
//! subcommand has its own module.

pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod load;
