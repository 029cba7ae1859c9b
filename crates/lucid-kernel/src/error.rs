//! Kernel error taxonomy
//!
//! Every kernel entry point returns `Result<_, KernelError>`. Variants carry
//! structural diagnostic payloads (environment snapshot, local context,
//! offending subterms) rather than formatted strings; rendering precise
//! messages is the job of the formatter collaborator. Errors propagate out
//! unchanged; there is no retry, and metavariable assignments made before a
//! failure are not rolled back (transactional callers snapshot the
//! metavariable environment first).

use crate::context::Context;
use crate::env::Env;
use crate::expr::Expr;
use crate::name::Name;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum KernelError {
    #[error("unknown object '{name}'")]
    UnknownName { env: Env, name: Name },

    #[error("unknown universe variable '{name}'")]
    UnknownUniverseVariable { env: Env, name: Name },

    #[error("object '{name}' has already been declared")]
    AlreadyDeclared { env: Env, name: Name },

    #[error("universe variable '{name}' has already been declared")]
    AlreadyDeclaredUniverse { env: Env, name: Name },

    #[error("environment cannot be updated because it has children environments")]
    ReadOnlyEnvironment { env: Env },

    #[error("function expected: {expr:?}")]
    FunctionExpected { env: Env, ctx: Context, expr: Expr },

    #[error("type expected: {expr:?}")]
    TypeExpected { env: Env, ctx: Context, expr: Expr },

    #[error(
        "argument {arg_pos} of {app:?} has type {given:?} but is expected to have type {expected:?}"
    )]
    AppTypeMismatch {
        env: Env,
        ctx: Context,
        app: Expr,
        arg_pos: usize,
        expected: Expr,
        given: Expr,
    },

    #[error("declared type {expected:?} does not match value type {given:?}")]
    DefTypeMismatch {
        env: Env,
        /// Definition name when the mismatch was found during `add_definition`.
        name: Option<Name>,
        expected: Expr,
        given: Expr,
    },

    #[error("pair/projection does not match a sigma type: {expr:?}")]
    PairTypeMismatch {
        env: Env,
        ctx: Context,
        expr: Expr,
        expected: Option<Expr>,
    },

    #[error("occurs check failed: ?m{midx} occurs in {expr:?}")]
    OccursCheck { midx: u32, expr: Expr },

    #[error("assignment of ?m{midx} is not well-scoped in its context: {expr:?}")]
    MetavarScope { midx: u32, expr: Expr },

    #[error("failed to unify {lhs:?} with {rhs:?}")]
    FailedToUnify { ctx: Context, lhs: Expr, rhs: Expr },

    #[error("unification exceeded the maximum recursion depth")]
    MaxDepthExceeded,

    #[error("computation exceeded its step budget")]
    MaxStepsExceeded,

    #[error("interrupted")]
    Interrupted,

    #[error("unbound variable #{0}")]
    UnboundVariable(u32),

    #[error("unexpected metavariable occurrence: {expr:?}")]
    UnexpectedMetavar { expr: Expr },
}

impl KernelError {
    /// True for the two cooperative-abort conditions; callers that treat
    /// unification failure as a boolean must still propagate these.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            KernelError::Interrupted
                | KernelError::MaxStepsExceeded
                | KernelError::MaxDepthExceeded
        )
    }
}
