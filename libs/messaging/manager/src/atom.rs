//! Interned message names

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

/// An interned message name
///
/// Atoms from the same [`AtomTable`] compare by pointer; the string
/// comparison only runs for atoms interned by different tables.
#[derive(Clone)]
pub struct Atom(Arc<str>);

impl Atom {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Atom {}

impl PartialEq<str> for Atom {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Deref for Atom {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({:?})", &*self.0)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-scoped string interner
#[derive(Default)]
pub struct AtomTable {
    atoms: Mutex<HashSet<Arc<str>>>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, name: &str) -> Atom {
        let mut atoms = self.atoms.lock();
        if let Some(existing) = atoms.get(name) {
            return Atom(Arc::clone(existing));
        }
        let atom: Arc<str> = Arc::from(name);
        atoms.insert(Arc::clone(&atom));
        Atom(atom)
    }

    pub fn len(&self) -> usize {
        self.atoms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_storage() {
        let table = AtomTable::new();
        let a = table.intern("ping");
        let b = table.intern("ping");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(table.len(), 1);
        assert!(a == *"ping");
        assert_eq!(a.as_str(), "ping");
    }

    #[test]
    fn test_atoms_from_different_tables_compare_by_value() {
        let a = AtomTable::new().intern("evt");
        let b = AtomTable::new().intern("evt");
        assert_eq!(a, b);
    }
}
