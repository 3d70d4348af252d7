use crate::{Design, Domain, StmtId};
use std::collections::HashSet;
use weft_utils::{Error, WeftResult};

/// Partition of the design's statements into scheduling regions, as
/// delivered by the external logic classifier. The scheduler owns the
/// bucket lists (statement lists are rebuilt wholesale by retiming and
/// resynchronization) but never the statements themselves.
#[derive(Clone, Debug, Default)]
pub struct LogicClasses {
    pub statik: Vec<StmtId>,
    pub initial: Vec<StmtId>,
    pub finals: Vec<StmtId>,
    pub comb: Vec<StmtId>,
    pub clocked: Vec<StmtId>,
}

impl LogicClasses {
    /// Bucket every statement by its classifier tag.
    pub fn gather(design: &Design) -> Self {
        let mut classes = LogicClasses::default();
        for (id, stmt) in design.stmts.iter() {
            match stmt.domain {
                Domain::Static => classes.statik.push(id),
                Domain::Initial => classes.initial.push(id),
                Domain::Final => classes.finals.push(id),
                Domain::Comb => classes.comb.push(id),
                Domain::Clocked(..) => classes.clocked.push(id),
            }
        }
        classes
    }

    /// The next-state region handed to the dependency graph builder:
    /// combinational logic followed by clocked logic.
    pub fn next_state_region(&self) -> Vec<StmtId> {
        let mut region = self.comb.clone();
        region.extend(self.clocked.iter().copied());
        region
    }

    /// Reject designs the BSP scheduler cannot handle. The classifier
    /// guarantees most of this upstream; we re-check the cheap parts so a
    /// broken caller gets a diagnostic instead of a garbage schedule.
    ///
    /// - more than one clock domain in the clocked region;
    /// - external combinational inputs: a signal read somewhere but written
    ///   nowhere (a self-contained design defines everything it reads).
    ///
    /// Combinational cycles are detected later by the graph builder, where
    /// the cycle can be reported precisely.
    pub fn validate(&self, design: &Design) -> WeftResult<()> {
        let mut clocks = HashSet::new();
        for &id in &self.clocked {
            if let Some(clk) = design.stmts[id].domain.clock() {
                clocks.insert(clk);
            }
        }
        if clocks.len() > 1 {
            return Err(Error::unsupported(format!(
                "design has {} clock domains, only a single clock is supported",
                clocks.len()
            )));
        }

        let mut written = HashSet::new();
        for (_, stmt) in design.stmts.iter() {
            written.extend(stmt.writes.iter().copied());
        }
        for (_, stmt) in design.stmts.iter() {
            for &read in &stmt.reads {
                if !written.contains(&read) {
                    return Err(Error::unsupported(format!(
                        "signal {} is read but never produced; \
                         external inputs are not supported",
                        design.signals[read].name
                    )));
                }
            }
        }
        Ok(())
    }
}
