//! Opaque embedded values
//!
//! `Expr::Value` nodes embed host objects (integer literals, builtin
//! operations, ...) into the term language. The kernel never looks inside a
//! value; it only calls the methods of this trait. Plugins registered by the
//! host (see `arith` for the reference implementation) give values a type, a
//! normalization hook, and the hash/equality the hash-cons table needs.

use crate::expr::Expr;
use std::fmt;
use std::sync::Arc;

/// Host-provided value plugin.
///
/// `normalize` is called by the normalizer when the value heads an
/// application; returning `None` leaves the application stuck.
pub trait ValuePlugin: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Tag identifying the plugin family (`"int"`, `"int.add"`, ...).
    /// Values with different tags are never equal.
    fn kind_tag(&self) -> &'static str;

    /// Downcast hook so `equals` implementations can compare payloads after
    /// matching on `kind_tag`.
    fn as_any(&self) -> &dyn std::any::Any;

    /// The type of this value as a kernel term.
    fn ty(&self) -> Expr;

    /// Reduction hook: given the arguments of an application headed by this
    /// value, return the contractum, or `None` when the arguments do not
    /// reduce (e.g. non-literal operands of an arithmetic operation).
    fn normalize(&self, args: &[Expr]) -> Option<Expr>;

    /// 32-bit hash mixed into the containing expression fingerprint.
    /// Must agree with `equals`.
    fn hash(&self) -> u32;

    /// Semantic equality between values. Implementations should downcast on
    /// `kind_tag` first.
    fn equals(&self, other: &dyn ValuePlugin) -> bool;
}

/// Shared handle to a value plugin, as stored in `Expr::Value` nodes.
#[derive(Clone)]
pub struct ValueRef(Arc<dyn ValuePlugin>);

impl ValueRef {
    pub fn new(v: impl ValuePlugin + 'static) -> Self {
        ValueRef(Arc::new(v))
    }

    pub fn kind_tag(&self) -> &'static str {
        self.0.kind_tag()
    }

    pub fn ty(&self) -> Expr {
        self.0.ty()
    }

    pub fn normalize(&self, args: &[Expr]) -> Option<Expr> {
        self.0.normalize(args)
    }

    pub fn hash(&self) -> u32 {
        self.0.hash()
    }

    /// Downcast helper for plugins: the raw trait object.
    pub fn plugin(&self) -> &dyn ValuePlugin {
        self.0.as_ref()
    }
}

impl PartialEq for ValueRef {
    fn eq(&self, other: &Self) -> bool {
        // Identical handles are always equal; otherwise defer to the plugin.
        Arc::ptr_eq(&self.0, &other.0) || self.0.equals(other.0.as_ref())
    }
}

impl Eq for ValueRef {}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
