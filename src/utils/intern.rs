//! Interned loop names.
//!
//! Loop nests refer to logical loops by name, and the same names are compared
//! over and over while collecting bounds and rebuilding loop nests. Names are
//! interned once in a process-wide table and handled as copyable symbols.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::RwLock;
use string_interner::{backend::StringBackend, DefaultSymbol, StringInterner, Symbol as SymbolTrait};

type Backend = StringBackend<DefaultSymbol>;

/// A symbol representing an interned loop name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Intern `name` and return its symbol.
    pub fn new(name: &str) -> Self {
        intern(name)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }

    /// Resolve the symbol back to its name.
    pub fn name(&self) -> String {
        resolve(*self).unwrap_or_else(|| format!("<sym{}>", self.0))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({}: {:?})", self.0, self.name())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        intern(name)
    }
}

static GLOBAL_INTERNER: Lazy<RwLock<StringInterner<Backend>>> =
    Lazy::new(|| RwLock::new(StringInterner::new()));

/// Intern a string in the global interner.
pub fn intern(s: &str) -> Symbol {
    // A poisoned lock still holds a consistent table: interning never
    // leaves it half-updated.
    let mut interner = GLOBAL_INTERNER.write().unwrap_or_else(|e| e.into_inner());
    let sym = interner.get_or_intern(s);
    Symbol(sym.to_usize() as u32)
}

/// Resolve a symbol from the global interner.
pub fn resolve(sym: Symbol) -> Option<String> {
    let interner = GLOBAL_INTERNER.read().unwrap_or_else(|e| e.into_inner());
    let internal_sym = DefaultSymbol::try_from_usize(sym.0 as usize)?;
    interner.resolve(internal_sym).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_same_symbol() {
        let i1 = intern("loop_i");
        let i2 = Symbol::new("loop_i");
        let j = Symbol::from("loop_j");
        assert_eq!(i1, i2);
        assert_ne!(i1, j);
    }

    #[test]
    fn test_resolve_round_trip() {
        let sym = intern("rematerialized_k");
        assert_eq!(resolve(sym), Some("rematerialized_k".to_string()));
        assert_eq!(sym.to_string(), "rematerialized_k");
    }
}
