//! Small builders shared by the unit tests.
use weft_ir::{ClockId, Design, Domain, Signal, SignalId, Stmt, StmtId};
use weft_utils::Id;

pub fn signal(design: &mut Design, name: &str, words: u32) -> SignalId {
    design.add_signal(Signal::new(Id::new(name), words, 1))
}

pub fn comb(
    design: &mut Design,
    reads: impl IntoIterator<Item = SignalId>,
    writes: impl IntoIterator<Item = SignalId>,
    cost: u32,
) -> StmtId {
    design.add_stmt(Stmt::new(Domain::Comb, reads, writes, cost))
}

pub fn clocked(
    design: &mut Design,
    reads: impl IntoIterator<Item = SignalId>,
    writes: impl IntoIterator<Item = SignalId>,
    cost: u32,
) -> StmtId {
    clocked_on(design, 0, reads, writes, cost)
}

pub fn clocked_on(
    design: &mut Design,
    clk: u32,
    reads: impl IntoIterator<Item = SignalId>,
    writes: impl IntoIterator<Item = SignalId>,
    cost: u32,
) -> StmtId {
    design.add_stmt(Stmt::new(Domain::Clocked(ClockId(clk)), reads, writes, cost))
}

/// The fan-out-2 scenario: four commit points, one shared combinational
/// statement C (cost 10) feeding two of them, each sequential statement of
/// cost 5. `region[0]` is C.
pub fn fanout_design() -> (Design, Vec<StmtId>) {
    let mut design = Design::new();
    let w = signal(&mut design, "w", 1);
    let r0 = signal(&mut design, "r0", 1);
    let r1 = signal(&mut design, "r1", 1);
    let r2 = signal(&mut design, "r2", 1);
    let r3 = signal(&mut design, "r3", 1);

    let c = comb(&mut design, [r0], [w], 10);
    let s0 = clocked(&mut design, [w], [r0], 5);
    let s1 = clocked(&mut design, [w], [r1], 5);
    let s2 = clocked(&mut design, [r2], [r2], 5);
    let s3 = clocked(&mut design, [r3], [r3], 5);
    (design, vec![c, s0, s1, s2, s3])
}

/// A chain of combinational costs feeding one sequential sink of cost
/// `seq_cost`, plus one consumer fiber of cost `reader_cost`. The consumer
/// reads the chain's register and commits the chain's input, so each fiber
/// is the other's downstream reader.
pub fn chain_design(
    costs: &[u32],
    seq_cost: u32,
    reader_cost: u32,
) -> (Design, Vec<crate::fiber::Fiber>) {
    let mut design = Design::new();
    let reg = signal(&mut design, "reg", 1);
    let inp = signal(&mut design, "inp", 1);
    let wires: Vec<_> = (0..costs.len())
        .map(|i| signal(&mut design, &format!("w{}", i), 1))
        .collect();
    let mut region = Vec::new();
    for (i, &c) in costs.iter().enumerate() {
        let read = if i == 0 { inp } else { wires[i - 1] };
        region.push(comb(&mut design, [read], [wires[i]], c));
    }
    region.push(clocked(
        &mut design,
        [*wires.last().unwrap()],
        [reg],
        seq_cost,
    ));
    region.push(clocked(&mut design, [reg], [inp], reader_cost));
    let graph = crate::dep_graph::build(&design, &region).unwrap();
    let fibers = crate::dep_graph::split_fibers(&design, &graph);
    (design, fibers)
}

/// A deterministic linear congruential generator for fuzz-style tests.
/// Keeps the tests reproducible without a rand dependency.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493))
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    pub fn below(&mut self, bound: u32) -> u32 {
        self.next_u32() % bound.max(1)
    }
}
