//! De Bruijn substitution and lifting
//!
//! The three primitives that open and close binders: `lift`, `instantiate`,
//! and beta application. All are free-variable-range-aware: a subterm with
//! no free variable above the cutoff is returned as the same handle, so
//! closed sub-DAGs are shared untouched across substitutions.
//!
//! Substitution cannot be pushed through an uninstantiated metavariable;
//! instead the pending operation is recorded as a [`LocalEntry`] on the
//! occurrence and replayed by `MetavarEnv::instantiate_metavars` once the
//! metavariable is assigned.

use crate::expr::{
    mk_app, mk_heq, mk_lambda, mk_let, mk_metavar, mk_pair, mk_pi, mk_proj, mk_sigma, mk_var,
    Expr, ExprArgs, ExprKind, LocalEntry,
};

/// Add `offset` to every free variable with index `>= cutoff`.
pub fn lift(e: &Expr, cutoff: u32, offset: u32) -> Expr {
    if offset == 0 {
        return e.clone();
    }
    lift_core(e, cutoff, offset)
}

fn lift_core(e: &Expr, cutoff: u32, offset: u32) -> Expr {
    if e.fv_hi() <= cutoff {
        return e.clone();
    }
    use ExprKind::*;
    match e.kind() {
        Var(v) => {
            if *v >= cutoff {
                mk_var(v + offset)
            } else {
                e.clone()
            }
        }
        Const(..) | Sort(_) | Value(_) => e.clone(),
        MetaVar(idx, entries) => {
            let mut entries = entries.to_vec();
            entries.push(LocalEntry::Lift {
                start: cutoff,
                offset,
            });
            mk_metavar(*idx, entries)
        }
        App(args) => {
            let new_args: ExprArgs = args.iter().map(|a| lift_core(a, cutoff, offset)).collect();
            mk_app(new_args)
        }
        Lambda(b) => mk_lambda(
            b.hint.clone(),
            lift_core(&b.domain, cutoff, offset),
            lift_core(&b.body, cutoff + 1, offset),
        ),
        Pi(b) => mk_pi(
            b.hint.clone(),
            lift_core(&b.domain, cutoff, offset),
            lift_core(&b.body, cutoff + 1, offset),
        ),
        Sigma(b) => mk_sigma(
            b.hint.clone(),
            lift_core(&b.domain, cutoff, offset),
            lift_core(&b.body, cutoff + 1, offset),
        ),
        Pair(f, s, t) => mk_pair(
            lift_core(f, cutoff, offset),
            lift_core(s, cutoff, offset),
            lift_core(t, cutoff, offset),
        ),
        Proj(k, arg) => mk_proj(*k, lift_core(arg, cutoff, offset)),
        Let {
            hint,
            ty,
            value,
            body,
        } => mk_let(
            hint.clone(),
            ty.as_ref().map(|t| lift_core(t, cutoff, offset)),
            lift_core(value, cutoff, offset),
            lift_core(body, cutoff + 1, offset),
        ),
        HEq(l, r) => mk_heq(lift_core(l, cutoff, offset), lift_core(r, cutoff, offset)),
    }
}

/// Replace `Var(start + i)` for `i` in `[0, n)` by `subst[n - 1 - i]` and
/// shift every free variable `>= start + n` down by `n`. Replacement terms
/// are lifted by the binder depth they are substituted under.
pub fn instantiate(e: &Expr, start: u32, subst: &[Expr]) -> Expr {
    if subst.is_empty() {
        return e.clone();
    }
    instantiate_core(e, start, subst, false, 0)
}

/// `instantiate` for replacement terms that are known to be closed: skips
/// the per-binder lifting of the substitution.
pub fn instantiate_closed(e: &Expr, start: u32, subst: &[Expr]) -> Expr {
    debug_assert!(
        subst.iter().all(|s| s.is_closed()),
        "instantiate_closed requires closed replacement terms"
    );
    if subst.is_empty() {
        return e.clone();
    }
    instantiate_core(e, start, subst, true, 0)
}

/// Substitute a single term for `Var(0)`.
pub fn instantiate1(e: &Expr, value: &Expr) -> Expr {
    instantiate(e, 0, std::slice::from_ref(value))
}

fn instantiate_core(e: &Expr, start: u32, subst: &[Expr], closed: bool, depth: u32) -> Expr {
    let n = subst.len() as u32;
    // Nothing at or above `start + depth` means nothing to replace or shift.
    if e.fv_hi() <= start.saturating_add(depth) {
        return e.clone();
    }
    use ExprKind::*;
    match e.kind() {
        Var(v) => {
            let v = *v;
            if v < depth + start {
                e.clone()
            } else if v < depth + start + n {
                let i = v - start - depth;
                let replacement = &subst[(n - 1 - i) as usize];
                if closed {
                    replacement.clone()
                } else {
                    lift(replacement, 0, depth)
                }
            } else {
                mk_var(v - n)
            }
        }
        Const(..) | Sort(_) | Value(_) => e.clone(),
        MetaVar(idx, entries) => {
            // Record one Inst entry per replacement; the lift compensates for
            // the entries that will replay before it.
            let mut entries = entries.to_vec();
            for (i, s) in subst.iter().enumerate() {
                let i = i as u32;
                let value = if closed {
                    s.clone()
                } else {
                    lift(s, 0, depth + n - i - 1)
                };
                entries.push(LocalEntry::Inst {
                    start: depth + start + n - i - 1,
                    value,
                });
            }
            mk_metavar(*idx, entries)
        }
        App(args) => {
            let new_args: ExprArgs = args
                .iter()
                .map(|a| instantiate_core(a, start, subst, closed, depth))
                .collect();
            mk_app(new_args)
        }
        Lambda(b) => mk_lambda(
            b.hint.clone(),
            instantiate_core(&b.domain, start, subst, closed, depth),
            instantiate_core(&b.body, start, subst, closed, depth + 1),
        ),
        Pi(b) => mk_pi(
            b.hint.clone(),
            instantiate_core(&b.domain, start, subst, closed, depth),
            instantiate_core(&b.body, start, subst, closed, depth + 1),
        ),
        Sigma(b) => mk_sigma(
            b.hint.clone(),
            instantiate_core(&b.domain, start, subst, closed, depth),
            instantiate_core(&b.body, start, subst, closed, depth + 1),
        ),
        Pair(f, s, t) => mk_pair(
            instantiate_core(f, start, subst, closed, depth),
            instantiate_core(s, start, subst, closed, depth),
            instantiate_core(t, start, subst, closed, depth),
        ),
        Proj(k, arg) => mk_proj(*k, instantiate_core(arg, start, subst, closed, depth)),
        Let {
            hint,
            ty,
            value,
            body,
        } => mk_let(
            hint.clone(),
            ty.as_ref()
                .map(|t| instantiate_core(t, start, subst, closed, depth)),
            instantiate_core(value, start, subst, closed, depth),
            instantiate_core(body, start, subst, closed, depth + 1),
        ),
        HEq(l, r) => mk_heq(
            instantiate_core(l, start, subst, closed, depth),
            instantiate_core(r, start, subst, closed, depth),
        ),
    }
}

/// True iff `e` is an application whose head is a lambda.
pub fn is_head_beta(e: &Expr) -> bool {
    e.is_app() && e.arg(0).is_some_and(Expr::is_lambda)
}

/// Apply `f` to `args`, contracting as many leading lambdas as there are
/// arguments. Excess arguments become a residual application; missing ones
/// leave a partially applied lambda.
pub fn apply_beta(f: &Expr, args: &[Expr]) -> Expr {
    if args.is_empty() {
        return f.clone();
    }
    if !f.is_lambda() {
        let mut all: ExprArgs = ExprArgs::new();
        all.push(f.clone());
        all.extend(args.iter().cloned());
        return mk_app(all);
    }
    let mut body = match f.abst_body() {
        Some(b) => b,
        None => return f.clone(),
    };
    let mut m: usize = 1;
    while m < args.len() {
        match body.kind() {
            ExprKind::Lambda(b) => {
                body = &b.body;
                m += 1;
            }
            _ => break,
        }
    }
    let r = instantiate(body, 0, &args[..m]);
    if m == args.len() {
        r
    } else {
        let mut all: ExprArgs = ExprArgs::new();
        all.push(r);
        all.extend(args[m..].iter().cloned());
        mk_app(all)
    }
}

/// Contract the outermost beta redex, if any.
pub fn head_beta_reduce(e: &Expr) -> Expr {
    if !is_head_beta(e) {
        return e.clone();
    }
    match e.app_args() {
        Some(args) => apply_beta(&args[0], &args[1..]),
        None => e.clone(),
    }
}

/// Contract beta redexes everywhere, to fixpoint.
pub fn beta_reduce(e: &Expr) -> Expr {
    let mut current = e.clone();
    loop {
        let next = beta_reduce_pass(&current);
        if Expr::ptr_eq(&next, &current) {
            return next;
        }
        current = next;
    }
}

fn beta_reduce_pass(e: &Expr) -> Expr {
    use ExprKind::*;
    let rebuilt = match e.kind() {
        Var(_) | Const(..) | Sort(_) | Value(_) | MetaVar(..) => e.clone(),
        App(args) => {
            let new_args: ExprArgs = args.iter().map(beta_reduce_pass).collect();
            mk_app(new_args)
        }
        Lambda(b) => mk_lambda(
            b.hint.clone(),
            beta_reduce_pass(&b.domain),
            beta_reduce_pass(&b.body),
        ),
        Pi(b) => mk_pi(
            b.hint.clone(),
            beta_reduce_pass(&b.domain),
            beta_reduce_pass(&b.body),
        ),
        Sigma(b) => mk_sigma(
            b.hint.clone(),
            beta_reduce_pass(&b.domain),
            beta_reduce_pass(&b.body),
        ),
        Pair(f, s, t) => mk_pair(
            beta_reduce_pass(f),
            beta_reduce_pass(s),
            beta_reduce_pass(t),
        ),
        Proj(k, arg) => mk_proj(*k, beta_reduce_pass(arg)),
        Let {
            hint,
            ty,
            value,
            body,
        } => mk_let(
            hint.clone(),
            ty.as_ref().map(beta_reduce_pass),
            beta_reduce_pass(value),
            beta_reduce_pass(body),
        ),
        HEq(l, r) => mk_heq(beta_reduce_pass(l), beta_reduce_pass(r)),
    };
    head_beta_reduce(&rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{expr_eq, mk_const, mk_sort};
    use crate::level::Level;
    use crate::name::Name;

    fn nm(s: &str) -> Name {
        Name::from_string(s)
    }

    fn ty() -> Expr {
        mk_sort(Level::of(1))
    }

    #[test]
    fn test_lift_identity_cases() {
        let closed = mk_const(nm("c"));
        assert!(Expr::ptr_eq(&lift(&closed, 0, 5), &closed));
        let open = mk_var(3);
        assert!(Expr::ptr_eq(&lift(&open, 0, 0), &open));
        // below the cutoff
        assert!(Expr::ptr_eq(&lift(&open, 4, 7), &open));
    }

    #[test]
    fn test_lift_shifts_above_cutoff() {
        let e = mk_app([mk_var(0), mk_var(2)]);
        let lifted = lift(&e, 1, 10);
        assert!(Expr::ptr_eq(&lifted, &mk_app([mk_var(0), mk_var(12)])));
    }

    #[test]
    fn test_lift_under_binder() {
        // fun (x : T) => #0 #1 : only #1 is free
        let e = mk_lambda(nm("x"), ty(), mk_app([mk_var(0), mk_var(1)]));
        let lifted = lift(&e, 0, 3);
        let expected = mk_lambda(nm("x"), ty(), mk_app([mk_var(0), mk_var(4)]));
        assert!(Expr::ptr_eq(&lifted, &expected));
    }

    #[test]
    fn test_instantiate_basic() {
        let c = mk_const(nm("c"));
        // #0 := c
        assert!(Expr::ptr_eq(&instantiate1(&mk_var(0), &c), &c));
        // #1 shifts down
        assert!(Expr::ptr_eq(&instantiate1(&mk_var(1), &c), &mk_var(0)));
    }

    #[test]
    fn test_instantiate_multi_order() {
        // subst [a, b] replaces #0 with b and #1 with a
        let a = mk_const(nm("a"));
        let b = mk_const(nm("b"));
        let e = mk_app([mk_var(0), mk_var(1)]);
        let r = instantiate(&e, 0, &[a.clone(), b.clone()]);
        assert!(Expr::ptr_eq(&r, &mk_app([b, a])));
    }

    #[test]
    fn test_instantiate_lifts_under_binder() {
        // (fun (x : T) => #1) [#0 := y]  ==> fun (x : T) => lift(y)
        let y = mk_var(4);
        let e = mk_lambda(nm("x"), ty(), mk_var(1));
        let r = instantiate1(&e, &y);
        let expected = mk_lambda(nm("x"), ty(), mk_var(5));
        assert!(Expr::ptr_eq(&r, &expected));
    }

    #[test]
    fn test_instantiate_empty_is_identity() {
        let e = mk_app([mk_var(0), mk_var(7)]);
        assert!(Expr::ptr_eq(&instantiate(&e, 0, &[]), &e));
    }

    #[test]
    fn test_apply_beta_exact() {
        // (fun x y => y x) a b  ==>  b a
        let f = mk_lambda(
            nm("x"),
            ty(),
            mk_lambda(nm("y"), ty(), mk_app([mk_var(0), mk_var(1)])),
        );
        let a = mk_const(nm("a"));
        let b = mk_const(nm("b"));
        let r = apply_beta(&f, &[a.clone(), b.clone()]);
        assert!(Expr::ptr_eq(&r, &mk_app([b, a])));
    }

    #[test]
    fn test_apply_beta_excess_args() {
        let f = mk_lambda(nm("x"), ty(), mk_var(0));
        let a = mk_const(nm("a"));
        let b = mk_const(nm("b"));
        let r = apply_beta(&f, &[a.clone(), b.clone()]);
        assert!(Expr::ptr_eq(&r, &mk_app([a, b])));
    }

    #[test]
    fn test_apply_beta_partial() {
        let f = mk_lambda(nm("x"), ty(), mk_lambda(nm("y"), ty(), mk_var(1)));
        let a = mk_const(nm("a"));
        let r = apply_beta(&f, &[a.clone()]);
        // one argument consumed, inner lambda remains with x := a
        let expected = mk_lambda(nm("y"), ty(), lift(&a, 0, 1));
        assert!(expr_eq(&r, &expected));
    }

    #[test]
    fn test_beta_reduce_fixpoint() {
        // ((fun x => x) ((fun y => y) a))  ==>  a
        let id = mk_lambda(nm("x"), ty(), mk_var(0));
        let a = mk_const(nm("a"));
        let e = mk_app([id.clone(), mk_app([id, a.clone()])]);
        assert!(Expr::ptr_eq(&beta_reduce(&e), &a));
    }

    #[test]
    fn test_metavar_accumulates_entries() {
        let m = crate::expr::mk_metavar(0, vec![]);
        let lifted = lift(&m, 2, 3);
        let entries = lifted.metavar_entries().unwrap();
        assert_eq!(
            entries,
            &[LocalEntry::Lift {
                start: 2,
                offset: 3
            }]
        );

        let inst = instantiate1(&m, &mk_const(nm("a")));
        let entries = inst.metavar_entries().unwrap();
        assert!(matches!(entries[0], LocalEntry::Inst { start: 0, .. }));
    }
}
