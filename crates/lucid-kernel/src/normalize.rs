//! Normalization and definitional equality
//!
//! The [`Normalizer`] owns one reduction configuration: an environment for
//! delta-unfolding, an optional metavariable environment consulted
//! transparently when reduction reaches a metavariable, an interrupt flag,
//! and a step budget. Weak-head normalization performs beta, delta (non-
//! opaque definitions in the unfoldable set), iota (projections of pairs),
//! zeta (lets), metavariable resolution, and embedded-value hooks; full
//! normalization reduces under binders with a per-call memo keyed on node
//! identity.
//!
//! Convertibility compares weak-head normal forms structurally, with eta for
//! functions and pairs, and universe cumulativity flowing only through Pi
//! codomains and the right-hand side of a directed check. When structure
//! disagrees and either side mentions metavariables, the decision is
//! delegated to the unifier, whose assignments are kept even if the overall
//! conversion later fails (callers snapshot the metavariable environment for
//! transactional behavior).

use crate::context::Context;
use crate::env::{Env, Object};
use crate::error::KernelError;
use crate::expr::{
    mk_app, mk_heq, mk_lambda, mk_pair, mk_pi, mk_proj, mk_sigma, mk_var, substitute_levels, Expr,
    ExprArgs, ExprKind, ProjKind,
};
use crate::interrupt::{InterruptFlag, StepBudget};
use crate::level::Level;
use crate::metavar::MetavarEnv;
use crate::subst::{apply_beta, head_beta_reduce, instantiate1, is_head_beta, lift};
use hashbrown::HashMap;
use tracing::trace;

/// Minimum stack space to reserve before recursive calls (32 KB).
const MIN_STACK_RED_ZONE: usize = 32 * 1024;

/// Stack size to grow to when running low (1 MB).
const STACK_GROWTH_SIZE: usize = 1024 * 1024;

pub struct Normalizer<'a> {
    env: &'a Env,
    menv: Option<&'a MetavarEnv>,
    interrupt: Option<InterruptFlag>,
    budget: StepBudget,
}

impl<'a> Normalizer<'a> {
    pub fn new(env: &'a Env) -> Self {
        Normalizer {
            env,
            menv: None,
            interrupt: None,
            budget: StepBudget::unlimited(),
        }
    }

    /// Normalizer that resolves metavariables through `menv` and shares its
    /// interrupt flag and unfoldable-definition filter.
    pub fn with_menv(menv: &'a MetavarEnv) -> Self {
        Normalizer {
            env: menv.env(),
            menv: Some(menv),
            interrupt: Some(menv.interrupt_flag().clone()),
            budget: StepBudget::unlimited(),
        }
    }

    #[must_use]
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.budget = StepBudget::new(max_steps);
        self
    }

    pub fn env(&self) -> &Env {
        self.env
    }

    fn checkpoint(&self) -> Result<(), KernelError> {
        if let Some(flag) = &self.interrupt {
            flag.check()?;
        }
        self.budget.step()
    }

    fn may_unfold(&self, name: &crate::name::Name) -> bool {
        self.menv.map_or(true, |m| m.may_unfold(name))
    }

    // ------------------------------------------------------------------
    // Weak-head normalization
    // ------------------------------------------------------------------

    /// Reduce until the outermost constructor is irreducible.
    pub fn whnf(&self, e: &Expr) -> Result<Expr, KernelError> {
        stacker::maybe_grow(MIN_STACK_RED_ZONE, STACK_GROWTH_SIZE, || self.whnf_core(e))
    }

    fn whnf_core(&self, e: &Expr) -> Result<Expr, KernelError> {
        self.checkpoint()?;
        match e.kind() {
            ExprKind::App(args) => {
                let f = self.whnf(&args[0])?;
                if f.is_lambda() {
                    let r = apply_beta(&f, &args[1..]);
                    return self.whnf(&r);
                }
                if let Some(v) = f.value() {
                    if let Some(r) = v.normalize(&args[1..]) {
                        return self.whnf(&r);
                    }
                }
                if Expr::ptr_eq(&f, &args[0]) {
                    Ok(e.clone())
                } else {
                    // Head reduced to something stuck (possibly itself an
                    // application spine); rebuild flattened and retry once.
                    let mut all: ExprArgs = ExprArgs::new();
                    all.push(f);
                    all.extend(args[1..].iter().cloned());
                    self.whnf(&mk_app(all))
                }
            }
            ExprKind::Const(name, levels) => match self.env.get_object(name)? {
                Object::Definition {
                    value,
                    opaque: false,
                    ..
                } if self.may_unfold(name) => {
                    trace!(name = %name, "delta unfold");
                    let value = match levels {
                        Some(ls) => substitute_levels(&value, &self.env.level_subst(ls)),
                        None => value,
                    };
                    self.whnf(&value)
                }
                Object::Builtin { value, .. } => Ok(value),
                _ => Ok(e.clone()),
            },
            ExprKind::Let { value, body, .. } => {
                // Zeta.
                self.whnf(&instantiate1(body, value))
            }
            ExprKind::Proj(k, arg) => {
                let a = self.whnf(arg)?;
                match a.kind() {
                    ExprKind::Pair(first, second, _) => {
                        // Iota.
                        let component = match k {
                            ProjKind::First => first,
                            ProjKind::Second => second,
                        };
                        self.whnf(&component.clone())
                    }
                    _ => {
                        if Expr::ptr_eq(&a, arg) {
                            Ok(e.clone())
                        } else {
                            Ok(mk_proj(*k, a))
                        }
                    }
                }
            }
            ExprKind::MetaVar(..) => match self.menv {
                Some(menv) => {
                    let r = menv.instantiate_metavars(e);
                    if Expr::ptr_eq(&r, e) {
                        Ok(e.clone())
                    } else {
                        self.whnf(&r)
                    }
                }
                None => Ok(e.clone()),
            },
            // Sort, Pi, Lambda, Sigma, Var, Pair, HEq, Value: already weak-head.
            _ => Ok(e.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Full normalization
    // ------------------------------------------------------------------

    /// Normalize under binders. Terminates on strongly-normalizing input
    /// (guaranteed by the surface type system, not checked here); the step
    /// budget bounds everything else.
    pub fn normalize(&self, e: &Expr) -> Result<Expr, KernelError> {
        let mut memo: HashMap<usize, Expr> = HashMap::new();
        self.normalize_core(e, &mut memo)
    }

    fn normalize_core(
        &self,
        e: &Expr,
        memo: &mut HashMap<usize, Expr>,
    ) -> Result<Expr, KernelError> {
        stacker::maybe_grow(MIN_STACK_RED_ZONE, STACK_GROWTH_SIZE, || {
            self.normalize_impl(e, memo)
        })
    }

    fn normalize_impl(
        &self,
        e: &Expr,
        memo: &mut HashMap<usize, Expr>,
    ) -> Result<Expr, KernelError> {
        if let Some(hit) = memo.get(&e.node_addr()) {
            return Ok(hit.clone());
        }
        self.checkpoint()?;
        let w = self.whnf(e)?;
        let r = match w.kind() {
            ExprKind::App(args) => {
                let mut new_args: ExprArgs = ExprArgs::new();
                for a in args {
                    new_args.push(self.normalize_core(a, memo)?);
                }
                // Normalized arguments may have become literals the head's
                // value hook can fold, or exposed a beta redex.
                let folded = new_args[0]
                    .value()
                    .and_then(|v| v.normalize(&new_args[1..]));
                if let Some(folded) = folded {
                    let r = self.normalize_core(&folded, memo)?;
                    return self.finish_memo(e, r, memo);
                }
                let rebuilt = mk_app(new_args);
                if is_head_beta(&rebuilt) {
                    self.normalize_core(&head_beta_reduce(&rebuilt), memo)?
                } else {
                    rebuilt
                }
            }
            ExprKind::Lambda(b) => mk_lambda(
                b.hint.clone(),
                self.normalize_core(&b.domain, memo)?,
                self.normalize_core(&b.body, memo)?,
            ),
            ExprKind::Pi(b) => mk_pi(
                b.hint.clone(),
                self.normalize_core(&b.domain, memo)?,
                self.normalize_core(&b.body, memo)?,
            ),
            ExprKind::Sigma(b) => mk_sigma(
                b.hint.clone(),
                self.normalize_core(&b.domain, memo)?,
                self.normalize_core(&b.body, memo)?,
            ),
            ExprKind::Pair(f, s, t) => mk_pair(
                self.normalize_core(f, memo)?,
                self.normalize_core(s, memo)?,
                self.normalize_core(t, memo)?,
            ),
            ExprKind::Proj(k, arg) => mk_proj(*k, self.normalize_core(arg, memo)?),
            ExprKind::HEq(l, r) => mk_heq(
                self.normalize_core(l, memo)?,
                self.normalize_core(r, memo)?,
            ),
            ExprKind::Let { .. } => w.clone(), // eliminated by whnf (zeta)
            _ => w.clone(),
        };
        self.finish_memo(e, r, memo)
    }

    fn finish_memo(
        &self,
        key: &Expr,
        result: Expr,
        memo: &mut HashMap<usize, Expr>,
    ) -> Result<Expr, KernelError> {
        memo.insert(key.node_addr(), result.clone());
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Convertibility
    // ------------------------------------------------------------------

    /// Symmetric definitional equality.
    pub fn is_convertible(&self, a: &Expr, b: &Expr, ctx: &Context) -> Result<bool, KernelError> {
        self.conv(a, b, ctx, false)
    }

    /// Directed check `a <= b` up to cumulativity: `Sort(u) <= Sort(v)` when
    /// `v >= u`, with the direction threaded through Pi codomains only.
    pub fn is_convertible_cum(
        &self,
        a: &Expr,
        b: &Expr,
        ctx: &Context,
    ) -> Result<bool, KernelError> {
        self.conv(a, b, ctx, true)
    }

    fn conv(&self, a0: &Expr, b0: &Expr, ctx: &Context, cum: bool) -> Result<bool, KernelError> {
        stacker::maybe_grow(MIN_STACK_RED_ZONE, STACK_GROWTH_SIZE, || {
            self.conv_impl(a0, b0, ctx, cum)
        })
    }

    fn conv_impl(&self, a0: &Expr, b0: &Expr, ctx: &Context, cum: bool) -> Result<bool, KernelError> {
        self.checkpoint()?;
        if Expr::ptr_eq(a0, b0) {
            return Ok(true);
        }
        let a = self.whnf(a0)?;
        let b = self.whnf(b0)?;
        if Expr::ptr_eq(&a, &b) {
            return Ok(true);
        }

        if let Some(result) = self.conv_structural(&a, &b, ctx, cum)? {
            if result {
                return Ok(true);
            }
        }

        // Structural disagreement: when metavariables block the comparison,
        // ask the unifier. Its assignments are not rolled back on failure.
        if a.has_metavar() || b.has_metavar() {
            if let Some(menv) = self.menv {
                return match menv.unify(&a, &b, ctx) {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_abort() => Err(e),
                    Err(_) => Ok(false),
                };
            }
        }
        Ok(false)
    }

    /// Structural comparison of two weak-head normal forms. `Ok(None)` means
    /// the heads do not match any structural case.
    fn conv_structural(
        &self,
        a: &Expr,
        b: &Expr,
        ctx: &Context,
        cum: bool,
    ) -> Result<Option<bool>, KernelError> {
        use ExprKind::*;
        let r = match (a.kind(), b.kind()) {
            (Sort(u), Sort(v)) => {
                if cum {
                    self.env.is_ge(v, u)?
                } else {
                    Level::is_equiv(u, v) || (self.env.is_ge(u, v)? && self.env.is_ge(v, u)?)
                }
            }
            (Var(i), Var(j)) => i == j,
            (Const(n1, l1), Const(n2, l2)) => n1 == n2 && levels_eq(l1.as_deref(), l2.as_deref()),
            (Value(v1), Value(v2)) => v1 == v2,
            (Pi(b1), Pi(b2)) => {
                self.conv(&b1.domain, &b2.domain, ctx, false)?
                    && self.conv(
                        &b1.body,
                        &b2.body,
                        &ctx.extend(b1.hint.clone(), b1.domain.clone()),
                        cum,
                    )?
            }
            (Sigma(b1), Sigma(b2)) => {
                self.conv(&b1.domain, &b2.domain, ctx, false)?
                    && self.conv(
                        &b1.body,
                        &b2.body,
                        &ctx.extend(b1.hint.clone(), b1.domain.clone()),
                        false,
                    )?
            }
            (Lambda(b1), Lambda(b2)) => {
                self.conv(&b1.domain, &b2.domain, ctx, false)?
                    && self.conv(
                        &b1.body,
                        &b2.body,
                        &ctx.extend(b1.hint.clone(), b1.domain.clone()),
                        false,
                    )?
            }
            (App(a1), App(a2)) if a1.len() == a2.len() => {
                let mut all = true;
                for (x, y) in a1.iter().zip(a2.iter()) {
                    if !self.conv(x, y, ctx, false)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            (Pair(f1, s1, t1), Pair(f2, s2, t2)) => {
                self.conv(f1, f2, ctx, false)?
                    && self.conv(s1, s2, ctx, false)?
                    && self.conv(t1, t2, ctx, false)?
            }
            (Proj(k1, e1), Proj(k2, e2)) => k1 == k2 && self.conv(e1, e2, ctx, false)?,
            (HEq(l1, r1), HEq(l2, r2)) => {
                self.conv(l1, l2, ctx, false)? && self.conv(r1, r2, ctx, false)?
            }
            (MetaVar(i, es), MetaVar(j, fs)) if i == j && es == fs => true,
            // Eta for functions: compare the body against the other side
            // applied to the bound variable.
            (Lambda(b1), _) => {
                let expanded = mk_app([lift(b, 0, 1), mk_var(0)]);
                return Ok(Some(self.conv(
                    &b1.body,
                    &expanded,
                    &ctx.extend(b1.hint.clone(), b1.domain.clone()),
                    false,
                )?));
            }
            (_, Lambda(b2)) => {
                let expanded = mk_app([lift(a, 0, 1), mk_var(0)]);
                return Ok(Some(self.conv(
                    &expanded,
                    &b2.body,
                    &ctx.extend(b2.hint.clone(), b2.domain.clone()),
                    false,
                )?));
            }
            // Eta for pairs: a literal pair matches anything whose
            // projections match its components.
            (Pair(f1, s1, _), _) => {
                return Ok(Some(
                    self.conv(f1, &mk_proj(ProjKind::First, b.clone()), ctx, false)?
                        && self.conv(s1, &mk_proj(ProjKind::Second, b.clone()), ctx, false)?,
                ));
            }
            (_, Pair(f2, s2, _)) => {
                return Ok(Some(
                    self.conv(&mk_proj(ProjKind::First, a.clone()), f2, ctx, false)?
                        && self.conv(&mk_proj(ProjKind::Second, a.clone()), s2, ctx, false)?,
                ));
            }
            _ => return Ok(None),
        };
        Ok(Some(r))
    }
}

fn levels_eq(l1: Option<&[Level]>, l2: Option<&[Level]>) -> bool {
    let l1 = l1.unwrap_or(&[]);
    let l2 = l2.unwrap_or(&[]);
    l1.len() == l2.len() && l1.iter().zip(l2.iter()).all(|(a, b)| Level::is_equiv(a, b))
}

// ------------------------------------------------------------------
// Environment-level entry points
// ------------------------------------------------------------------

/// Weak-head normal form of `e` in `env`.
pub fn whnf(e: &Expr, env: &Env) -> Result<Expr, KernelError> {
    Normalizer::new(env).whnf(e)
}

/// Full normal form of `e` in `env`.
pub fn normalize(e: &Expr, env: &Env) -> Result<Expr, KernelError> {
    Normalizer::new(env).normalize(e)
}

/// Symmetric definitional equality of closed terms in `env`.
pub fn is_convertible(a: &Expr, b: &Expr, env: &Env) -> Result<bool, KernelError> {
    Normalizer::new(env).is_convertible(a, b, &Context::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{mk_const, mk_lambda, mk_let, mk_pair, mk_sort};
    use crate::name::Name;

    fn nm(s: &str) -> Name {
        Name::from_string(s)
    }

    fn ty() -> Expr {
        mk_sort(Level::of(1))
    }

    #[test]
    fn test_whnf_beta() {
        let env = Env::new();
        let id = mk_lambda(nm("x"), ty(), mk_var(0));
        let a = mk_sort(Level::zero());
        let e = mk_app([id, a.clone()]);
        assert!(Expr::ptr_eq(&whnf(&e, &env).unwrap(), &a));
    }

    #[test]
    fn test_whnf_zeta() {
        let env = Env::new();
        let a = mk_sort(Level::zero());
        let e = mk_let(nm("x"), Some(ty()), a.clone(), mk_var(0));
        assert!(Expr::ptr_eq(&whnf(&e, &env).unwrap(), &a));
    }

    #[test]
    fn test_whnf_iota() {
        let env = Env::new();
        let a = mk_sort(Level::zero());
        let b = mk_sort(Level::of(1));
        let sigma = mk_sigma(nm("x"), mk_sort(Level::of(2)), mk_sort(Level::of(2)));
        let p = mk_pair(a.clone(), b.clone(), sigma);
        assert!(Expr::ptr_eq(
            &whnf(&mk_proj(ProjKind::First, p.clone()), &env).unwrap(),
            &a
        ));
        assert!(Expr::ptr_eq(
            &whnf(&mk_proj(ProjKind::Second, p), &env).unwrap(),
            &b
        ));
    }

    #[test]
    fn test_whnf_delta_respects_opacity() {
        let env = Env::new();
        env.add_definition(nm("d"), ty(), mk_sort(Level::zero()), false)
            .unwrap();
        env.add_definition(nm("o"), ty(), mk_sort(Level::zero()), true)
            .unwrap();
        let d = mk_const(nm("d"));
        let o = mk_const(nm("o"));
        assert!(Expr::ptr_eq(
            &whnf(&d, &env).unwrap(),
            &mk_sort(Level::zero())
        ));
        // opaque definitions stay stuck
        assert!(Expr::ptr_eq(&whnf(&o, &env).unwrap(), &o));
    }

    #[test]
    fn test_normalize_under_binder() {
        let env = Env::new();
        let id = mk_lambda(nm("x"), ty(), mk_var(0));
        // fun (y : T) => (fun x => x) y
        let e = mk_lambda(nm("y"), ty(), mk_app([id, mk_var(0)]));
        let n = normalize(&e, &env).unwrap();
        let expected = mk_lambda(nm("y"), ty(), mk_var(0));
        assert!(Expr::ptr_eq(&n, &expected));
    }

    #[test]
    fn test_convertible_beta_eta() {
        let env = Env::new();
        env.add_var(nm("f"), mk_pi(nm("x"), ty(), ty())).unwrap();
        let f = mk_const(nm("f"));
        // eta: fun x => f x  ~  f
        let eta = mk_lambda(nm("x"), ty(), mk_app([f.clone(), mk_var(0)]));
        assert!(is_convertible(&eta, &f, &env).unwrap());
        assert!(is_convertible(&f, &eta, &env).unwrap());
    }

    #[test]
    fn test_convertible_sorts_requires_equality() {
        let env = Env::new();
        let s0 = mk_sort(Level::zero());
        let s1 = mk_sort(Level::of(1));
        assert!(!is_convertible(&s0, &s1, &env).unwrap());
        assert!(is_convertible(&s1, &s1, &env).unwrap());
    }

    #[test]
    fn test_cumulativity_is_directional() {
        let env = Env::new();
        env.define_uvar(nm("u"), Level::of(1)).unwrap();
        let n = Normalizer::new(&env);
        let s1 = mk_sort(Level::of(1));
        let su = mk_sort(Level::param(nm("u")));
        let ctx = Context::new();
        // Sort(1) <= Sort(u) since u >= 1
        assert!(n.is_convertible_cum(&s1, &su, &ctx).unwrap());
        // but not the other way
        assert!(!n.is_convertible_cum(&su, &s1, &ctx).unwrap());
        // and symmetric convertibility fails
        assert!(!n.is_convertible(&s1, &su, &ctx).unwrap());
    }

    #[test]
    fn test_interrupt_aborts_normalization() {
        let env = Env::new();
        let flag = InterruptFlag::new();
        flag.set();
        let n = Normalizer::new(&env).with_interrupt(flag);
        let e = mk_sort(Level::zero());
        assert!(matches!(n.whnf(&e), Err(KernelError::Interrupted)));
    }

    #[test]
    fn test_step_budget_aborts_normalization() {
        let env = Env::new();
        let n = Normalizer::new(&env).with_max_steps(2);
        let id = mk_lambda(nm("x"), ty(), mk_var(0));
        let mut e = mk_sort(Level::zero());
        for _ in 0..8 {
            e = mk_app([id.clone(), e]);
        }
        assert!(matches!(n.whnf(&e), Err(KernelError::MaxStepsExceeded)));
    }
}
