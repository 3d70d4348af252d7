use crate::Id;
use std::collections::{HashMap, HashSet};

/// HashMap-based generator for fresh, unique names.
///
/// Transformations that materialize shadow registers or duplicated values ask
/// this generator for names; seeding it with every name already declared in
/// the design guarantees the result never collides.
#[derive(Clone, Debug, Default)]
pub struct NameGenerator {
    counts: HashMap<Id, u64>,
    taken: HashSet<Id>,
}

impl NameGenerator {
    /// Create a generator that will never produce any of `taken`.
    pub fn with_taken(taken: HashSet<Id>) -> Self {
        NameGenerator {
            counts: HashMap::default(),
            taken,
        }
    }

    /// Mark additional names as in use.
    pub fn reserve(&mut self, name: Id) {
        self.taken.insert(name);
    }

    /// Return a fresh name starting with `prefix`, e.g. `__Vretime_x__0`.
    pub fn gen_name<S: Into<Id>>(&mut self, prefix: S) -> Id {
        let prefix: Id = prefix.into();
        loop {
            let count = self.counts.entry(prefix).or_insert(0);
            let name = Id::new(format!("{}__{}", prefix, count));
            *count += 1;
            if !self.taken.contains(&name) {
                self.taken.insert(name);
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_never_collide() {
        let mut taken = HashSet::new();
        taken.insert(Id::new("sig__0"));
        let mut gen = NameGenerator::with_taken(taken);
        let a = gen.gen_name("sig");
        let b = gen.gen_name("sig");
        assert_ne!(a, Id::new("sig__0"));
        assert_ne!(a, b);
    }
}
