use crate::{SignalId, SubstMap};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Index;

/// Identity of a clock in the design. The scheduler supports exactly one
/// clock domain in the next-state region; carrying the id lets the builder
/// reject designs that violate that up front.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClockId(pub u32);

/// Sensitivity domain of a statement, as tagged by the external classifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Domain {
    /// Evaluated whenever an input changes.
    Comb,
    /// Evaluated at the clock edge; writes commit at the superstep barrier.
    Clocked(ClockId),
    /// Executed once before the first superstep.
    Initial,
    /// Elaboration-time constant initialization.
    Static,
    /// Executed once after the last superstep.
    Final,
}

impl Domain {
    pub fn is_comb(self) -> bool {
        matches!(self, Domain::Comb)
    }

    pub fn is_clocked(self) -> bool {
        matches!(self, Domain::Clocked(..))
    }

    pub fn clock(self) -> Option<ClockId> {
        match self {
            Domain::Clocked(clk) => Some(clk),
            _ => None,
        }
    }
}

/// Index-based identity of a logic statement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(u32);

impl StmtId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// An opaque IR subtree. The graph layer treats statements as atomic and
/// immutable except for the two bounded rewrites it is allowed to inject:
/// cloning and signal substitution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stmt {
    pub domain: Domain,
    pub reads: SmallVec<[SignalId; 4]>,
    pub writes: SmallVec<[SignalId; 2]>,
    /// Intrinsic size estimate consumed by the default cost oracle.
    pub cost_words: u32,
    /// False when the statement calls into the host (DPI/PLI); impure logic
    /// can never be replicated or moved across a sequential boundary.
    pub pure: bool,
}

impl Stmt {
    pub fn new(
        domain: Domain,
        reads: impl IntoIterator<Item = SignalId>,
        writes: impl IntoIterator<Item = SignalId>,
        cost_words: u32,
    ) -> Self {
        Stmt {
            domain,
            reads: reads.into_iter().collect(),
            writes: writes.into_iter().collect(),
            cost_words,
            pure: true,
        }
    }

    pub fn impure(mut self) -> Self {
        self.pure = false;
        self
    }

    /// A plain copy assignment `dst := src`, used for the sample statements
    /// the retiming and resync engines materialize.
    pub fn assign(domain: Domain, dst: SignalId, src: SignalId, cost_words: u32) -> Self {
        Stmt::new(domain, [src], [dst], cost_words)
    }

    pub fn reads_signal(&self, sig: SignalId) -> bool {
        self.reads.contains(&sig)
    }

    pub fn writes_signal(&self, sig: SignalId) -> bool {
        self.writes.contains(&sig)
    }

    /// Rewrite every read and write through `subst`. Unmapped signals are
    /// left alone.
    pub fn substitute(&mut self, subst: &SubstMap) {
        for sig in self.reads.iter_mut().chain(self.writes.iter_mut()) {
            if let Some(repl) = subst.get(*sig) {
                *sig = repl;
            }
        }
    }
}

/// Arena of logic statements, owned by [`crate::Design`]. Like signals,
/// statements are append-only: clones injected by transformations get fresh
/// ids at the end of the table.
#[derive(Clone, Debug, Default)]
pub struct StmtTable {
    stmts: Vec<Stmt>,
}

impl StmtTable {
    pub fn add(&mut self, stmt: Stmt) -> StmtId {
        let id = StmtId(u32::try_from(self.stmts.len()).expect("statement arena overflow"));
        self.stmts.push(stmt);
        id
    }

    /// Clone `id` into a fresh statement with `subst` applied.
    pub fn clone_with(&mut self, id: StmtId, subst: &SubstMap) -> StmtId {
        let mut stmt = self.stmts[id.index()].clone();
        stmt.substitute(subst);
        self.add(stmt)
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StmtId, &Stmt)> {
        self.stmts
            .iter()
            .enumerate()
            .map(|(ix, stmt)| (StmtId(ix as u32), stmt))
    }
}

impl Index<StmtId> for StmtTable {
    type Output = Stmt;

    fn index(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.index()]
    }
}

impl std::ops::IndexMut<StmtId> for StmtTable {
    fn index_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.index()]
    }
}
