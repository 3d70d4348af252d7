use std::cmp::Ordering;
use std::fmt;
use symbol_table::GlobalSymbol;

/// Interned name. Cheap to copy and compare; the backing string lives in a
/// global symbol table for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(GlobalSymbol);

impl Id {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Id(GlobalSymbol::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &'static str {
        self.0.as_str()
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::new(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::new(s)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.as_str())
    }
}
