//! Type inference and checking
//!
//! The bidirectional core: `infer` synthesizes a type for every term form,
//! `check` compares a synthesized type against an expected one up to
//! cumulativity. The checker never mutates the environment; definitional
//! equality and weak-head forms come from the [`Normalizer`], which consults
//! the optional metavariable environment transparently.

use crate::context::Context;
use crate::env::Env;
use crate::error::KernelError;
use crate::expr::{mk_pi, mk_proj, mk_sort, Expr, ExprKind, ProjKind};
use crate::interrupt::InterruptFlag;
use crate::level::Level;
use crate::metavar::MetavarEnv;
use crate::normalize::Normalizer;
use crate::subst::instantiate1;

/// Minimum stack space to reserve before recursive calls (32 KB).
const MIN_STACK_RED_ZONE: usize = 32 * 1024;

/// Stack size to grow to when running low (1 MB).
const STACK_GROWTH_SIZE: usize = 1024 * 1024;

pub struct TypeChecker<'a> {
    env: &'a Env,
    menv: Option<&'a MetavarEnv>,
    interrupt: Option<InterruptFlag>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(env: &'a Env) -> Self {
        TypeChecker {
            env,
            menv: None,
            interrupt: None,
        }
    }

    /// Type checker that resolves metavariables through `menv` and may
    /// allocate fresh type metavariables for unassigned ones.
    pub fn with_menv(menv: &'a MetavarEnv) -> Self {
        TypeChecker {
            env: menv.env(),
            menv: Some(menv),
            interrupt: Some(menv.interrupt_flag().clone()),
        }
    }

    #[must_use]
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn normalizer(&self) -> Normalizer<'a> {
        let n = match self.menv {
            Some(menv) => Normalizer::with_menv(menv),
            None => Normalizer::new(self.env),
        };
        match &self.interrupt {
            Some(flag) => n.with_interrupt(flag.clone()),
            None => n,
        }
    }

    /// Infer the type of `e` in `ctx`.
    pub fn infer(&self, e: &Expr, ctx: &Context) -> Result<Expr, KernelError> {
        stacker::maybe_grow(MIN_STACK_RED_ZONE, STACK_GROWTH_SIZE, || {
            self.infer_core(e, ctx)
        })
    }

    fn infer_core(&self, e: &Expr, ctx: &Context) -> Result<Expr, KernelError> {
        if let Some(flag) = &self.interrupt {
            flag.check()?;
        }
        match e.kind() {
            ExprKind::Var(i) => ctx
                .var_domain(*i)
                .ok_or(KernelError::UnboundVariable(*i)),
            ExprKind::Const(name, levels) => {
                let obj = self.env.get_object(name)?;
                let ty = obj.ty().ok_or_else(|| KernelError::UnknownName {
                    env: self.env.clone(),
                    name: name.clone(),
                })?;
                match levels {
                    Some(ls) => {
                        for l in ls {
                            self.env.check_level_declared(l)?;
                        }
                        Ok(crate::expr::substitute_levels(
                            &ty,
                            &self.env.level_subst(ls),
                        ))
                    }
                    None => Ok(ty),
                }
            }
            ExprKind::Sort(u) => {
                self.env.check_level_declared(u)?;
                Ok(mk_sort(Level::succ(u.clone())))
            }
            ExprKind::App(args) => {
                let mut fn_ty = self.infer(&args[0], ctx)?;
                for (pos, arg) in args[1..].iter().enumerate() {
                    let fn_ty_whnf = self.normalizer().whnf(&fn_ty)?;
                    let ExprKind::Pi(b) = fn_ty_whnf.kind() else {
                        return Err(KernelError::FunctionExpected {
                            env: self.env.clone(),
                            ctx: ctx.clone(),
                            expr: e.clone(),
                        });
                    };
                    let arg_ty = self.infer(arg, ctx)?;
                    if !self
                        .normalizer()
                        .is_convertible_cum(&arg_ty, &b.domain, ctx)?
                    {
                        return Err(KernelError::AppTypeMismatch {
                            env: self.env.clone(),
                            ctx: ctx.clone(),
                            app: e.clone(),
                            arg_pos: pos + 1,
                            expected: b.domain.clone(),
                            given: arg_ty,
                        });
                    }
                    fn_ty = instantiate1(&b.body, arg);
                }
                Ok(fn_ty)
            }
            ExprKind::Lambda(b) => {
                self.ensure_type(&b.domain, ctx)?;
                let body_ty =
                    self.infer(&b.body, &ctx.extend(b.hint.clone(), b.domain.clone()))?;
                Ok(mk_pi(b.hint.clone(), b.domain.clone(), body_ty))
            }
            ExprKind::Pi(b) | ExprKind::Sigma(b) => {
                let u = self.ensure_type(&b.domain, ctx)?;
                let v =
                    self.ensure_type(&b.body, &ctx.extend(b.hint.clone(), b.domain.clone()))?;
                Ok(mk_sort(formation_level(u, v)))
            }
            ExprKind::Pair(first, second, ty) => {
                self.ensure_type(ty, ctx)?;
                let ty_whnf = self.normalizer().whnf(ty)?;
                let ExprKind::Sigma(b) = ty_whnf.kind() else {
                    return Err(KernelError::PairTypeMismatch {
                        env: self.env.clone(),
                        ctx: ctx.clone(),
                        expr: e.clone(),
                        expected: Some(ty.clone()),
                    });
                };
                let first_ty = self.infer(first, ctx)?;
                if !self
                    .normalizer()
                    .is_convertible_cum(&first_ty, &b.domain, ctx)?
                {
                    return Err(KernelError::PairTypeMismatch {
                        env: self.env.clone(),
                        ctx: ctx.clone(),
                        expr: first.clone(),
                        expected: Some(b.domain.clone()),
                    });
                }
                let second_expected = instantiate1(&b.body, first);
                let second_ty = self.infer(second, ctx)?;
                if !self
                    .normalizer()
                    .is_convertible_cum(&second_ty, &second_expected, ctx)?
                {
                    return Err(KernelError::PairTypeMismatch {
                        env: self.env.clone(),
                        ctx: ctx.clone(),
                        expr: second.clone(),
                        expected: Some(second_expected),
                    });
                }
                Ok(ty.clone())
            }
            ExprKind::Proj(k, p) => {
                let p_ty = self.infer(p, ctx)?;
                let p_ty_whnf = self.normalizer().whnf(&p_ty)?;
                let ExprKind::Sigma(b) = p_ty_whnf.kind() else {
                    return Err(KernelError::PairTypeMismatch {
                        env: self.env.clone(),
                        ctx: ctx.clone(),
                        expr: e.clone(),
                        expected: None,
                    });
                };
                match k {
                    ProjKind::First => Ok(b.domain.clone()),
                    ProjKind::Second => Ok(instantiate1(
                        &b.body,
                        &mk_proj(ProjKind::First, p.clone()),
                    )),
                }
            }
            ExprKind::Let {
                hint,
                ty,
                value,
                body,
            } => {
                let value_ty = match ty {
                    Some(t) => {
                        self.ensure_type(t, ctx)?;
                        let given = self.infer(value, ctx)?;
                        if !self.normalizer().is_convertible_cum(&given, t, ctx)? {
                            return Err(KernelError::DefTypeMismatch {
                                env: self.env.clone(),
                                name: None,
                                expected: t.clone(),
                                given,
                            });
                        }
                        t.clone()
                    }
                    None => self.infer(value, ctx)?,
                };
                let body_ctx = ctx.extend_let(hint.clone(), value_ty, value.clone());
                let body_ty = self.infer(body, &body_ctx)?;
                Ok(instantiate1(&body_ty, value))
            }
            ExprKind::HEq(lhs, rhs) => {
                // Heterogeneous: the two sides may live in different types.
                self.infer(lhs, ctx)?;
                self.infer(rhs, ctx)?;
                Ok(mk_sort(Level::zero()))
            }
            ExprKind::MetaVar(..) => match self.menv {
                Some(menv) => {
                    let resolved = menv.instantiate_metavars(e);
                    if !Expr::ptr_eq(&resolved, e) {
                        self.infer(&resolved, ctx)
                    } else {
                        // Unassigned: its type is a fresh hole over the same
                        // introduction context.
                        let mctx = menv.get_context(e).unwrap_or_default();
                        Ok(menv.mk_metavar(mctx))
                    }
                }
                None => Err(KernelError::UnexpectedMetavar { expr: e.clone() }),
            },
            ExprKind::Value(v) => Ok(v.ty()),
        }
    }

    /// Check `e` against `expected` (up to cumulativity on the right).
    pub fn check(&self, e: &Expr, expected: &Expr, ctx: &Context) -> Result<(), KernelError> {
        let given = self.infer(e, ctx)?;
        if self
            .normalizer()
            .is_convertible_cum(&given, expected, ctx)?
        {
            Ok(())
        } else {
            Err(KernelError::DefTypeMismatch {
                env: self.env.clone(),
                name: None,
                expected: expected.clone(),
                given,
            })
        }
    }

    /// Require that `e` is a type; returns its universe level.
    pub fn ensure_type(&self, e: &Expr, ctx: &Context) -> Result<Level, KernelError> {
        let ty = self.infer(e, ctx)?;
        let ty_whnf = self.normalizer().whnf(&ty)?;
        match ty_whnf.kind() {
            ExprKind::Sort(l) => Ok(l.clone()),
            _ => Err(KernelError::TypeExpected {
                env: self.env.clone(),
                ctx: ctx.clone(),
                expr: e.clone(),
            }),
        }
    }
}

/// Universe of a Pi/Sigma formation: `Sort(Zero)` is impredicative, so a
/// codomain in the bottom sort keeps the whole abstraction there; otherwise
/// the formation lives at `max` of the two levels. A universe-variable
/// codomain is not assumed zero and takes the `max` path.
fn formation_level(u: Level, v: Level) -> Level {
    if v.is_zero() {
        Level::zero()
    } else {
        Level::max(u, v)
    }
}

/// Infer the type of a closed term in `env`.
pub fn infer_type(e: &Expr, env: &Env) -> Result<Expr, KernelError> {
    TypeChecker::new(env).infer(e, &Context::new())
}

/// Check a closed term against a type in `env`.
pub fn check(e: &Expr, ty: &Expr, env: &Env) -> Result<(), KernelError> {
    TypeChecker::new(env).check(e, ty, &Context::new())
}
