use crate::{Design, StmtId};

/// Static per-statement instruction-cost estimate. The oracle is a black
/// box to the scheduler: deterministic and stable within one compilation,
/// and only required to rank statements consistently, not to match real
/// hardware latency.
pub trait CostOracle {
    fn cost(&self, design: &Design, stmt: StmtId) -> u32;
}

/// Default oracle: the size estimate the IR carries on each statement.
#[derive(Clone, Copy, Debug, Default)]
pub struct WordCost;

impl CostOracle for WordCost {
    fn cost(&self, design: &Design, stmt: StmtId) -> u32 {
        design.stmts[stmt].cost_words
    }
}
