//! Lucid kernel - trusted core of the Lucid proof assistant
//!
//! This crate implements the logical kernel: representation, normalization,
//! type checking, and unification for a higher-order type theory with a
//! cumulative universe hierarchy, dependent products and sums, let-bindings,
//! and heterogeneous equality.
//!
//! # Architecture
//!
//! - Hash-consed expression DAG (`expr.rs`) with per-node caches
//! - Universe levels (`level.rs`) and hierarchical names (`name.rs`)
//! - De Bruijn substitution and beta application (`subst.rs`)
//! - Maximal sharing pass (`sharing.rs`)
//! - Environments with parent/child scoping and universe constraints
//!   (`env.rs`)
//! - Weak-head/full normalization and convertibility (`normalize.rs`)
//! - Type inference and checking (`tc.rs`)
//! - Metavariable environment with union-find and pattern unification
//!   (`metavar.rs`)
//! - Embedded value plugins (`value.rs`) and the arithmetic builtins
//!   (`arith.rs`)
//!
//! The parser, elaborator, pretty-printer, and tactic engine are external
//! collaborators; they build terms through the constructors exposed here and
//! drive the checker through [`infer_type`], [`check`], [`normalize`],
//! [`whnf`], [`is_convertible`], and the metavariable API.

pub mod arith;
pub mod context;
pub mod env;
pub mod error;
pub mod expr;
pub mod interrupt;
pub mod level;
pub mod metavar;
pub mod name;
pub mod normalize;
pub mod sharing;
pub mod subst;
pub mod tc;
pub mod value;

pub use context::{Context, ContextEntry};
pub use env::{new_env, Env, Object};
pub use error::KernelError;
pub use expr::{
    expr_eq, has_free_var, mk_app, mk_app2, mk_const, mk_const_with_levels, mk_heq, mk_lambda,
    mk_let, mk_metavar, mk_pair, mk_pi, mk_proj, mk_sigma, mk_sort, mk_value, mk_var,
    substitute_levels, Binder, Expr, ExprKind, LocalEntry, ProjKind,
};
pub use interrupt::{InterruptFlag, StepBudget};
pub use level::Level;
pub use metavar::{new_menv, MetavarEnv, MetavarSnapshot, DEFAULT_MAX_DEPTH};
pub use name::Name;
pub use normalize::{is_convertible, normalize, whnf, Normalizer};
pub use sharing::{max_sharing, MaxSharing};
pub use subst::{
    apply_beta, beta_reduce, head_beta_reduce, instantiate, instantiate1, instantiate_closed,
    is_head_beta, lift,
};
pub use tc::{check, infer_type, TypeChecker};
pub use value::{ValuePlugin, ValueRef};
