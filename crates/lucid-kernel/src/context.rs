//! Local typing contexts
//!
//! A context is the ordered list of binders crossed on the way to a subterm.
//! Entries are stored outermost-first; de Bruijn index `0` refers to the
//! innermost (last) entry. Let-bound entries carry their value so clients
//! can unfold them. Contexts travel with metavariables (the binders visible
//! at the introduction site) and with error payloads.

use crate::expr::Expr;
use crate::name::Name;
use crate::subst::lift;
use std::fmt;

/// One binder of a context.
#[derive(Clone, Debug)]
pub struct ContextEntry {
    pub hint: Name,
    /// Domain type, expressed in the prefix context before this entry.
    pub domain: Expr,
    /// Bound value for let entries.
    pub value: Option<Expr>,
}

impl ContextEntry {
    pub fn new(hint: Name, domain: Expr) -> Self {
        ContextEntry {
            hint,
            domain,
            value: None,
        }
    }

    pub fn with_value(hint: Name, domain: Expr, value: Expr) -> Self {
        ContextEntry {
            hint,
            domain,
            value: Some(value),
        }
    }
}

/// Ordered binder list, outermost first.
#[derive(Clone, Default)]
pub struct Context {
    entries: Vec<ContextEntry>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for de Bruijn index `i` (0 = innermost).
    pub fn lookup(&self, i: u32) -> Option<&ContextEntry> {
        let n = self.entries.len();
        self.entries.get(n.checked_sub(1 + i as usize)?)
    }

    /// Type of `Var(i)` expressed in this context (the stored domain lives
    /// in the prefix, so it is lifted across the `i + 1` entries in between).
    pub fn var_domain(&self, i: u32) -> Option<Expr> {
        self.lookup(i).map(|e| lift(&e.domain, 0, i + 1))
    }

    /// Let value of `Var(i)` expressed in this context.
    pub fn var_value(&self, i: u32) -> Option<Expr> {
        self.lookup(i)
            .and_then(|e| e.value.as_ref())
            .map(|v| lift(v, 0, i + 1))
    }

    /// New context with one more inner binder.
    #[must_use]
    pub fn extend(&self, hint: Name, domain: Expr) -> Context {
        let mut entries = self.entries.clone();
        entries.push(ContextEntry::new(hint, domain));
        Context { entries }
    }

    /// New context with one more inner let binder.
    #[must_use]
    pub fn extend_let(&self, hint: Name, domain: Expr, value: Expr) -> Context {
        let mut entries = self.entries.clone();
        entries.push(ContextEntry::with_value(hint, domain, value));
        Context { entries }
    }

    /// Entries outermost-first.
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    /// True iff `self` is a prefix of `other` (entry-wise shared domains).
    pub fn is_prefix_of(&self, other: &Context) -> bool {
        self.entries.len() <= other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| Expr::ptr_eq(&a.domain, &b.domain))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} : {:?}", e.hint, e.domain)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{mk_sort, mk_var};
    use crate::level::Level;

    fn nm(s: &str) -> Name {
        Name::from_string(s)
    }

    #[test]
    fn test_lookup_order() {
        let ctx = Context::new()
            .extend(nm("a"), mk_sort(Level::of(1)))
            .extend(nm("b"), mk_sort(Level::of(2)));
        // index 0 = innermost = b
        assert_eq!(ctx.lookup(0).unwrap().hint, nm("b"));
        assert_eq!(ctx.lookup(1).unwrap().hint, nm("a"));
        assert!(ctx.lookup(2).is_none());
    }

    #[test]
    fn test_var_domain_lifts() {
        // a : Sort 1, b : #0 (the variable a)
        let ctx = Context::new()
            .extend(nm("a"), mk_sort(Level::of(1)))
            .extend(nm("b"), mk_var(0));
        // b's domain is #0 in the prefix; seen from inside it is #1
        assert!(Expr::ptr_eq(&ctx.var_domain(0).unwrap(), &mk_var(1)));
    }

    #[test]
    fn test_prefix() {
        let base = Context::new().extend(nm("a"), mk_sort(Level::of(1)));
        let ext = base.extend(nm("b"), mk_sort(Level::of(2)));
        assert!(base.is_prefix_of(&ext));
        assert!(!ext.is_prefix_of(&base));
    }
}
