//! Hierarchical names
//!
//! Objects in the environment are keyed by dotted identifiers (`list.map`,
//! `int.add`). Names are cheap to clone and hash; the component vector is
//! shared behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A dotted hierarchical name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name {
    parts: Arc<Vec<String>>,
}

impl Name {
    /// The anonymous name (no components). Used for binder hints with no
    /// user-facing name.
    pub fn anon() -> Self {
        Name {
            parts: Arc::new(Vec::new()),
        }
    }

    /// Parse a dotted identifier, e.g. `"int.add"`.
    pub fn from_string(s: &str) -> Self {
        if s.is_empty() {
            return Name::anon();
        }
        Name {
            parts: Arc::new(s.split('.').map(str::to_owned).collect()),
        }
    }

    /// Extend this name with one more component: `int` → `int.add`.
    #[must_use]
    pub fn child(&self, component: &str) -> Self {
        let mut parts = self.parts.as_ref().clone();
        parts.push(component.to_owned());
        Name {
            parts: Arc::new(parts),
        }
    }

    /// True for the anonymous name.
    pub fn is_anon(&self) -> bool {
        self.parts.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Iterate over the components, outermost first.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(String::as_str)
    }

    /// A 32-bit hash used by the expression fingerprint mixer.
    pub(crate) fn hash32(&self) -> u32 {
        let mut h: u32 = 0x811c_9dc5;
        for part in self.parts.iter() {
            for b in part.bytes() {
                h ^= u32::from(b);
                h = h.wrapping_mul(0x0100_0193);
            }
            h = h.wrapping_mul(31).wrapping_add(0x9e37);
        }
        h
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anon() {
            return write!(f, "_");
        }
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

// Debug output for names reads better as the dotted form.
impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::from_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string_roundtrip() {
        let n = Name::from_string("a.b.c");
        assert_eq!(n.len(), 3);
        assert_eq!(n.to_string(), "a.b.c");
        assert_eq!(n.components().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_anon() {
        assert!(Name::anon().is_anon());
        assert_eq!(Name::anon().to_string(), "_");
        assert_eq!(Name::from_string(""), Name::anon());
    }

    #[test]
    fn test_child() {
        let n = Name::from_string("int").child("add");
        assert_eq!(n, Name::from_string("int.add"));
    }

    #[test]
    fn test_hash32_distinguishes() {
        assert_ne!(
            Name::from_string("a.b").hash32(),
            Name::from_string("a.c").hash32()
        );
    }
}
