//! Command implementations.
//!
//! Each subcommand group lives in its own module.

pub(crate) mod completions;
pub(crate) mod control;
pub(crate) mod cycle;
pub(crate) mod info;
pub(crate) mod terminal;
pub(crate) mod update;
