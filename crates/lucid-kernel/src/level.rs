//! Universe levels
//!
//! Levels stratify the `Sort` hierarchy. A level is built from `Zero`,
//! successor offsets, binary `max`, and universe variables declared in an
//! environment (`Level::Param`). `Sort(Zero)` is the impredicative sort of
//! propositions (Bool); `Sort(succ^k(Zero))` are the predicative type
//! universes.
//!
//! `Level::is_geq` is the purely structural order: it knows nothing about
//! the constraints a universe variable was declared with. The environment
//! extends it with declared bounds (see `Env::is_ge`).

use crate::name::Name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Universe level expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// The bottom level (Bool / Prop).
    Zero,
    /// Successor: `l + 1`.
    Succ(Arc<Level>),
    /// Maximum of two levels.
    Max(Arc<Level>, Arc<Level>),
    /// A universe variable declared in the environment.
    Param(Name),
}

impl Level {
    pub fn zero() -> Self {
        Level::Zero
    }

    /// Successor level.
    pub fn succ(l: Level) -> Self {
        Level::Succ(Arc::new(l))
    }

    /// `max(l1, l2)`, simplifying when one side is clearly redundant.
    pub fn max(l1: Level, l2: Level) -> Self {
        if l1 == l2 {
            return l1;
        }
        if l1.is_zero() {
            return l2;
        }
        if l2.is_zero() {
            return l1;
        }
        if Level::is_geq(&l1, &l2) {
            return l1;
        }
        if Level::is_geq(&l2, &l1) {
            return l2;
        }
        Level::Max(Arc::new(l1), Arc::new(l2))
    }

    /// A universe variable.
    pub fn param(name: Name) -> Self {
        Level::Param(name)
    }

    /// A concrete level `succ^n(Zero)`.
    pub fn of(n: u32) -> Self {
        Level::Zero.add_offset(n)
    }

    /// True iff the level is zero for every valuation of its variables.
    pub fn is_zero(&self) -> bool {
        match self {
            Level::Zero => true,
            Level::Succ(_) | Level::Param(_) => false,
            Level::Max(l1, l2) => l1.is_zero() && l2.is_zero(),
        }
    }

    /// True iff the level is strictly positive for every valuation.
    pub fn is_nonzero(&self) -> bool {
        match self {
            Level::Zero | Level::Param(_) => false,
            Level::Succ(_) => true,
            Level::Max(l1, l2) => l1.is_nonzero() || l2.is_nonzero(),
        }
    }

    /// Decompose `succ^k(base)` into `(base, k)`.
    pub fn to_offset(&self) -> (&Level, u32) {
        match self {
            Level::Succ(inner) => {
                let (base, k) = inner.to_offset();
                (base, k + 1)
            }
            _ => (self, 0),
        }
    }

    /// Wrap `n` successors around this level.
    #[must_use]
    pub fn add_offset(&self, n: u32) -> Level {
        let mut l = self.clone();
        for _ in 0..n {
            l = Level::succ(l);
        }
        l
    }

    /// Push successors inside `max` and collapse nested maxima.
    #[must_use]
    pub fn normalize(&self) -> Level {
        match self {
            Level::Zero | Level::Param(_) => self.clone(),
            Level::Succ(l) => Level::succ(l.normalize()),
            Level::Max(l1, l2) => Level::max(l1.normalize(), l2.normalize()),
        }
    }

    /// Structural `l1 >= l2`. Conservative: returns `true` only when the
    /// inequality holds for every valuation of the universe variables.
    pub fn is_geq(l1: &Level, l2: &Level) -> bool {
        if l1 == l2 || l2.is_zero() {
            return true;
        }

        let (base1, off1) = l1.to_offset();
        let (base2, off2) = l2.to_offset();
        if base1 == base2 {
            return off1 >= off2;
        }
        // Every level is >= Zero, so succ^k(x) >= succ^j(Zero) whenever k >= j.
        if base2.is_zero() && off1 >= off2 {
            return true;
        }
        // succ(l) >= r if l >= r.
        if off1 > 0 {
            if let Level::Succ(inner) = l1 {
                if Level::is_geq(inner, l2) {
                    return true;
                }
            }
        }
        // max(a, b) >= r if either side is.
        if let Level::Max(a, b) = l1 {
            if Level::is_geq(a, l2) || Level::is_geq(b, l2) {
                return true;
            }
        }
        // l >= max(a, b) requires both.
        if let Level::Max(a, b) = l2 {
            if Level::is_geq(l1, a) && Level::is_geq(l1, b) {
                return true;
            }
        }
        false
    }

    /// Structural level equality up to normalization.
    pub fn is_equiv(l1: &Level, l2: &Level) -> bool {
        l1 == l2 || l1.normalize() == l2.normalize()
    }

    /// Substitute universe variables by name.
    #[must_use]
    pub fn substitute(&self, subst: &[(Name, Level)]) -> Level {
        match self {
            Level::Zero => Level::Zero,
            Level::Succ(l) => Level::succ(l.substitute(subst)),
            Level::Max(l1, l2) => Level::max(l1.substitute(subst), l2.substitute(subst)),
            Level::Param(name) => {
                for (n, l) in subst {
                    if n == name {
                        return l.clone();
                    }
                }
                self.clone()
            }
        }
    }

    /// Collect the universe variables mentioned in this level.
    pub fn collect_params(&self, out: &mut Vec<Name>) {
        match self {
            Level::Zero => {}
            Level::Succ(l) => l.collect_params(out),
            Level::Max(l1, l2) => {
                l1.collect_params(out);
                l2.collect_params(out);
            }
            Level::Param(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
        }
    }

    pub(crate) fn hash32(&self) -> u32 {
        match self {
            Level::Zero => 0x51ed_2701,
            Level::Succ(l) => l.hash32().wrapping_mul(0x9e37_79b9).wrapping_add(1),
            Level::Max(l1, l2) => l1
                .hash32()
                .wrapping_mul(0x85eb_ca6b)
                .wrapping_add(l2.hash32())
                .rotate_left(7),
            Level::Param(name) => name.hash32() ^ 0xa5a5_0000,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, off) = self.to_offset();
        match base {
            Level::Zero => write!(f, "{off}"),
            Level::Param(name) => {
                if off > 0 {
                    write!(f, "{name}+{off}")
                } else {
                    write!(f, "{name}")
                }
            }
            Level::Max(l1, l2) => {
                write!(f, "max({l1}, {l2})")?;
                if off > 0 {
                    write!(f, "+{off}")?;
                }
                Ok(())
            }
            Level::Succ(_) => unreachable!("to_offset strips successors"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u() -> Level {
        Level::param(Name::from_string("u"))
    }

    #[test]
    fn test_max_simplification() {
        assert_eq!(Level::max(Level::zero(), u()), u());
        assert_eq!(Level::max(u(), Level::zero()), u());
        assert_eq!(Level::max(u(), u()), u());
        // max(u+1, u) simplifies to u+1
        assert_eq!(Level::max(u().add_offset(1), u()), u().add_offset(1));
    }

    #[test]
    fn test_offsets() {
        let l = u().add_offset(3);
        let (base, off) = l.to_offset();
        assert_eq!(base, &u());
        assert_eq!(off, 3);
    }

    #[test]
    fn test_is_geq_structural() {
        assert!(Level::is_geq(&u(), &Level::zero()));
        assert!(Level::is_geq(&u().add_offset(2), &u()));
        assert!(!Level::is_geq(&u(), &u().add_offset(1)));
        // succ(u) >= 1 because u >= 0
        assert!(Level::is_geq(&u().add_offset(1), &Level::of(1)));
        // but u >= 1 is not derivable structurally
        assert!(!Level::is_geq(&u(), &Level::of(1)));
    }

    #[test]
    fn test_is_geq_max() {
        let v = Level::param(Name::from_string("v"));
        let m = Level::Max(Arc::new(u()), Arc::new(v.clone()));
        assert!(Level::is_geq(&m, &u()));
        assert!(Level::is_geq(&m, &v));
        assert!(!Level::is_geq(&u(), &m));
    }

    #[test]
    fn test_substitute() {
        let l = Level::max(u().add_offset(1), Level::param(Name::from_string("v")));
        let s = l.substitute(&[(Name::from_string("u"), Level::of(1))]);
        // max(2, v)
        assert_eq!(
            s,
            Level::max(Level::of(2), Level::param(Name::from_string("v")))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Level::of(2).to_string(), "2");
        assert_eq!(u().add_offset(1).to_string(), "u+1");
    }
}
