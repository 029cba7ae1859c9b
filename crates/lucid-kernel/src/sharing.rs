//! Maximal sharing
//!
//! `max_sharing` rewrites a DAG so every sub-expression is the canonical
//! hash-consed representative. Nodes built through the smart constructors
//! are canonical already (their max-shared bit is set at interning time), so
//! the pass is usually a no-op; it exists as the explicit canonicalization
//! entry point and re-canonicalizes any node whose bit is unset. The pass is
//! idempotent and returns a term structurally equal to its input.

use crate::error::KernelError;
use crate::expr::{
    mk_app, mk_heq, mk_lambda, mk_let, mk_metavar, mk_pair, mk_pi, mk_proj, mk_sigma, Expr,
    ExprArgs, ExprKind, LocalEntry,
};
use crate::interrupt::InterruptFlag;

/// Reusable maximal-sharing pass with a cross-call cache.
pub struct MaxSharing {
    cache: hashbrown::HashMap<usize, Expr>,
    interrupt: Option<InterruptFlag>,
}

impl MaxSharing {
    pub fn new() -> Self {
        MaxSharing {
            cache: hashbrown::HashMap::new(),
            interrupt: None,
        }
    }

    pub fn with_interrupt(flag: InterruptFlag) -> Self {
        MaxSharing {
            cache: hashbrown::HashMap::new(),
            interrupt: Some(flag),
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn apply(&mut self, e: &Expr) -> Result<Expr, KernelError> {
        if let Some(flag) = &self.interrupt {
            flag.check()?;
        }
        if let Some(hit) = self.cache.get(&e.node_addr()) {
            return Ok(hit.clone());
        }
        if e.is_max_shared() {
            self.cache.insert(e.node_addr(), e.clone());
            return Ok(e.clone());
        }
        use ExprKind::*;
        let res = match e.kind() {
            Var(_) | Const(..) | Sort(_) | Value(_) => e.clone(),
            App(args) => {
                let mut new_args: ExprArgs = ExprArgs::new();
                for a in args {
                    new_args.push(self.apply(a)?);
                }
                mk_app(new_args)
            }
            Lambda(b) => mk_lambda(
                b.hint.clone(),
                self.apply(&b.domain)?,
                self.apply(&b.body)?,
            ),
            Pi(b) => mk_pi(
                b.hint.clone(),
                self.apply(&b.domain)?,
                self.apply(&b.body)?,
            ),
            Sigma(b) => mk_sigma(
                b.hint.clone(),
                self.apply(&b.domain)?,
                self.apply(&b.body)?,
            ),
            Pair(f, s, t) => mk_pair(self.apply(f)?, self.apply(s)?, self.apply(t)?),
            Proj(k, arg) => mk_proj(*k, self.apply(arg)?),
            Let {
                hint,
                ty,
                value,
                body,
            } => {
                let ty = match ty {
                    Some(t) => Some(self.apply(t)?),
                    None => None,
                };
                mk_let(hint.clone(), ty, self.apply(value)?, self.apply(body)?)
            }
            HEq(l, r) => mk_heq(self.apply(l)?, self.apply(r)?),
            MetaVar(idx, entries) => {
                let mut new_entries = Vec::with_capacity(entries.len());
                for entry in entries {
                    new_entries.push(match entry {
                        LocalEntry::Lift { start, offset } => LocalEntry::Lift {
                            start: *start,
                            offset: *offset,
                        },
                        LocalEntry::Inst { start, value } => LocalEntry::Inst {
                            start: *start,
                            value: self.apply(value)?,
                        },
                    });
                }
                mk_metavar(*idx, new_entries)
            }
        };
        res.set_max_shared();
        self.cache.insert(e.node_addr(), res.clone());
        Ok(res)
    }
}

impl Default for MaxSharing {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonicalize a single term.
pub fn max_sharing(e: &Expr) -> Expr {
    if e.is_max_shared() {
        return e.clone();
    }
    // No interrupt flag attached, so the pass cannot fail.
    MaxSharing::new().apply(e).unwrap_or_else(|_| e.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{expr_eq, mk_const, mk_sort, mk_var};
    use crate::level::Level;
    use crate::name::Name;

    #[test]
    fn test_max_sharing_identity_on_canonical_nodes() {
        let e = mk_app([mk_const(Name::from_string("f")), mk_var(0)]);
        let shared = max_sharing(&e);
        assert!(Expr::ptr_eq(&shared, &e));
    }

    #[test]
    fn test_max_sharing_idempotent() {
        let e = mk_lambda(
            Name::from_string("x"),
            mk_sort(Level::of(1)),
            mk_app([mk_var(0), mk_var(0)]),
        );
        let once = max_sharing(&e);
        let twice = max_sharing(&once);
        assert!(Expr::ptr_eq(&once, &twice));
        assert!(expr_eq(&once, &e));
    }

    #[test]
    fn test_max_sharing_pass_reuses_cache() {
        let mut pass = MaxSharing::new();
        let e = mk_app([mk_const(Name::from_string("g")), mk_var(1)]);
        let a = pass.apply(&e).unwrap();
        let b = pass.apply(&e).unwrap();
        assert!(Expr::ptr_eq(&a, &b));
    }
}
