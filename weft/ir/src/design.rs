use crate::{Signal, SignalId, SignalTable, Stmt, StmtId, StmtTable};
use weft_utils::{Id, NameGenerator};

/// The external IR as seen by the scheduler: the two arenas plus a name
/// generator seeded with every declared name. Signal instances and logic
/// statements outlive the whole pipeline; transformations only append.
#[derive(Clone, Debug, Default)]
pub struct Design {
    pub signals: SignalTable,
    pub stmts: StmtTable,
    namegen: NameGenerator,
}

impl Design {
    pub fn new() -> Self {
        Design::default()
    }

    pub fn add_signal(&mut self, signal: Signal) -> SignalId {
        self.namegen.reserve(signal.name);
        self.signals.add(signal)
    }

    /// Declare a fresh signal shaped like `like`, named `<prefix>_<name>__N`.
    /// Used by merge/retime/resync when they materialize a sampled or
    /// duplicated value.
    pub fn fresh_signal_like(&mut self, prefix: &str, like: SignalId) -> SignalId {
        let orig = &self.signals[like];
        let name = self
            .namegen
            .gen_name(Id::new(format!("{}_{}", prefix, orig.name)));
        let signal = Signal::new(name, orig.width_words, orig.array_elems);
        self.signals.add(signal)
    }

    /// Declare a fresh scalar signal, e.g. a latch-guard flag.
    pub fn fresh_signal(&mut self, prefix: &str, width_words: u32) -> SignalId {
        let name = self.namegen.gen_name(Id::new(prefix));
        self.signals.add(Signal::new(name, width_words, 1))
    }

    pub fn add_stmt(&mut self, stmt: Stmt) -> StmtId {
        self.stmts.add(stmt)
    }

    /// Transfer size of a signal in words.
    pub fn words(&self, sig: SignalId) -> u32 {
        self.signals[sig].words()
    }
}
