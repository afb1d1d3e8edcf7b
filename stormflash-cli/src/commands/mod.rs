//! Command implementations.
//!
//! Each subcommand group is implemented in its own module.

pub(crate) mod device;
pub(crate) mod flash;
pub(crate) mod image;
