//! Interface to the external IR consumed by the weft scheduler.
//!
//! The scheduler never interprets statements: it sees opaque logic with a
//! sensitivity domain, a read set, a write set, and a purity flag. Signal
//! instances live in an arena owned by [`Design`] and are referenced by
//! index everywhere; identity is the index, never a pointer.
mod classes;
mod cost;
mod design;
mod signal;
mod stmt;

pub use classes::LogicClasses;
pub use cost::{CostOracle, WordCost};
pub use design::Design;
pub use signal::{Signal, SignalId, SignalTable, SubstMap};
pub use stmt::{ClockId, Domain, Stmt, StmtId, StmtTable};
