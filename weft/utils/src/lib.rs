//! Shared utilities for the weft scheduler.
mod dump;
mod errors;
mod id;
mod namegenerator;

pub use dump::DumpCtx;
pub use errors::{Error, WeftResult};
pub use id::Id;
pub use namegenerator::NameGenerator;
