//! CLI subcommand implementations.

pub mod backup;
pub mod capability;
pub mod product;
