use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use weft_utils::Id;

/// Index-based identity of a signal instance. Two vertices in different
/// fiber graphs referring to the same `SignalId` are how a value crossing a
/// fiber boundary is detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u32);

impl SignalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A uniquely named storage location (register or wire).
#[derive(Clone, Debug)]
pub struct Signal {
    pub name: Id,
    /// Width of one element in machine words.
    pub width_words: u32,
    /// Number of unpacked elements; 1 for scalars.
    pub array_elems: u32,
}

impl Signal {
    pub fn new(name: Id, width_words: u32, array_elems: u32) -> Self {
        Signal {
            name,
            width_words,
            array_elems,
        }
    }

    /// Total storage and transfer size in words.
    pub fn words(&self) -> u32 {
        self.width_words * self.array_elems
    }
}

/// Arena of canonical signal declarations. The scheduler only appends:
/// original declarations outlive the whole pipeline, and transformations add
/// fresh shadow signals at the end.
#[derive(Clone, Debug, Default)]
pub struct SignalTable {
    signals: Vec<Signal>,
}

impl SignalTable {
    pub fn add(&mut self, signal: Signal) -> SignalId {
        let id = SignalId(u32::try_from(self.signals.len()).expect("signal arena overflow"));
        self.signals.push(signal);
        id
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalId, &Signal)> {
        self.signals
            .iter()
            .enumerate()
            .map(|(ix, sig)| (SignalId(ix as u32), sig))
    }
}

impl Index<SignalId> for SignalTable {
    type Output = Signal;

    fn index(&self, id: SignalId) -> &Signal {
        &self.signals[id.index()]
    }
}

/// Mapping from original signal instances to their replacements, reported to
/// downstream module generation whenever a transformation renamed a value.
#[derive(Clone, Debug, Default)]
pub struct SubstMap {
    map: HashMap<SignalId, SignalId>,
}

impl SubstMap {
    pub fn insert(&mut self, from: SignalId, to: SignalId) {
        self.map.insert(from, to);
    }

    pub fn get(&self, from: SignalId) -> Option<SignalId> {
        self.map.get(&from).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalId, SignalId)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    /// Fold `other` into this map.
    pub fn extend(&mut self, other: SubstMap) {
        self.map.extend(other.map);
    }
}
