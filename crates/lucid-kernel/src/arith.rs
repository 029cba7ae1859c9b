//! Builtin arithmetic values
//!
//! The reference [`ValuePlugin`] implementations: the `Int` type, integer
//! literals, the binary operations on them, and Bool literals. Operations
//! reduce through their `normalize` hook when every operand is a literal;
//! anything else stays stuck, which is exactly what the normalizer expects
//! from an embedded value.

use crate::env::Env;
use crate::error::KernelError;
use crate::expr::{mk_app, mk_pi, mk_sort, mk_value, Expr, ExprArgs};
use crate::level::Level;
use crate::name::Name;
use crate::value::{ValuePlugin, ValueRef};
use std::any::Any;
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// Int type
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct IntType;

impl fmt::Display for IntType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Int")
    }
}

impl ValuePlugin for IntType {
    fn kind_tag(&self) -> &'static str {
        "int"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ty(&self) -> Expr {
        mk_sort(Level::of(1))
    }

    fn normalize(&self, _args: &[Expr]) -> Option<Expr> {
        None
    }

    fn hash(&self) -> u32 {
        0x1ca7_0001
    }

    fn equals(&self, other: &dyn ValuePlugin) -> bool {
        other.kind_tag() == self.kind_tag()
    }
}

/// The `Int` type as a term.
pub fn int_type() -> Expr {
    static CELL: OnceLock<Expr> = OnceLock::new();
    CELL.get_or_init(|| mk_value(ValueRef::new(IntType))).clone()
}

// ============================================================================
// Int literals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntLit(i64);

impl fmt::Display for IntLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ValuePlugin for IntLit {
    fn kind_tag(&self) -> &'static str {
        "int.lit"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ty(&self) -> Expr {
        int_type()
    }

    fn normalize(&self, _args: &[Expr]) -> Option<Expr> {
        None
    }

    fn hash(&self) -> u32 {
        let v = self.0 as u64;
        ((v ^ (v >> 32)) as u32).wrapping_mul(0x9e37_79b9) ^ 0x1ca7_0002
    }

    fn equals(&self, other: &dyn ValuePlugin) -> bool {
        other
            .as_any()
            .downcast_ref::<IntLit>()
            .is_some_and(|o| o.0 == self.0)
    }
}

/// Integer literal.
pub fn mk_int(value: i64) -> Expr {
    mk_value(ValueRef::new(IntLit(value)))
}

/// Extract an integer literal.
pub fn to_int(e: &Expr) -> Option<i64> {
    e.value()?
        .plugin()
        .as_any()
        .downcast_ref::<IntLit>()
        .map(|l| l.0)
}

// ============================================================================
// Binary operations
// ============================================================================

#[derive(Clone, Copy)]
struct IntBinOp {
    tag: &'static str,
    op: fn(i64, i64) -> i64,
}

impl fmt::Debug for IntBinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntBinOp({})", self.tag)
    }
}

impl fmt::Display for IntBinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag)
    }
}

impl ValuePlugin for IntBinOp {
    fn kind_tag(&self) -> &'static str {
        self.tag
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ty(&self) -> Expr {
        // Int -> Int -> Int
        mk_pi(
            Name::anon(),
            int_type(),
            mk_pi(Name::anon(), int_type(), int_type()),
        )
    }

    fn normalize(&self, args: &[Expr]) -> Option<Expr> {
        if args.len() < 2 {
            return None;
        }
        let a = to_int(&args[0])?;
        let b = to_int(&args[1])?;
        let folded = mk_int((self.op)(a, b));
        if args.len() == 2 {
            Some(folded)
        } else {
            let mut all: ExprArgs = ExprArgs::new();
            all.push(folded);
            all.extend(args[2..].iter().cloned());
            Some(mk_app(all))
        }
    }

    fn hash(&self) -> u32 {
        let mut h: u32 = 0x1ca7_0003;
        for b in self.tag.bytes() {
            h = h.wrapping_mul(31).wrapping_add(u32::from(b));
        }
        h
    }

    fn equals(&self, other: &dyn ValuePlugin) -> bool {
        other.kind_tag() == self.kind_tag()
    }
}

fn binop(tag: &'static str, op: fn(i64, i64) -> i64, cell: &OnceLock<Expr>) -> Expr {
    cell.get_or_init(|| mk_value(ValueRef::new(IntBinOp { tag, op })))
        .clone()
}

/// Integer addition operator.
pub fn int_add() -> Expr {
    static CELL: OnceLock<Expr> = OnceLock::new();
    binop("int.add", |a, b| a.wrapping_add(b), &CELL)
}

/// Integer subtraction operator.
pub fn int_sub() -> Expr {
    static CELL: OnceLock<Expr> = OnceLock::new();
    binop("int.sub", |a, b| a.wrapping_sub(b), &CELL)
}

/// Integer multiplication operator.
pub fn int_mul() -> Expr {
    static CELL: OnceLock<Expr> = OnceLock::new();
    binop("int.mul", |a, b| a.wrapping_mul(b), &CELL)
}

// ============================================================================
// Bool literals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoolLit(bool);

impl fmt::Display for BoolLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ValuePlugin for BoolLit {
    fn kind_tag(&self) -> &'static str {
        "bool.lit"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ty(&self) -> Expr {
        // Bool is the bottom sort.
        mk_sort(Level::zero())
    }

    fn normalize(&self, _args: &[Expr]) -> Option<Expr> {
        None
    }

    fn hash(&self) -> u32 {
        if self.0 {
            0x1ca7_0011
        } else {
            0x1ca7_0010
        }
    }

    fn equals(&self, other: &dyn ValuePlugin) -> bool {
        other
            .as_any()
            .downcast_ref::<BoolLit>()
            .is_some_and(|o| o.0 == self.0)
    }
}

/// Bool literal.
pub fn mk_bool(value: bool) -> Expr {
    mk_value(ValueRef::new(BoolLit(value)))
}

/// Extract a Bool literal.
pub fn to_bool(e: &Expr) -> Option<bool> {
    e.value()?
        .plugin()
        .as_any()
        .downcast_ref::<BoolLit>()
        .map(|l| l.0)
}

/// Register the arithmetic builtins in `env` under their dotted names.
pub fn add_arith_builtins(env: &Env) -> Result<(), KernelError> {
    env.add_builtin(Name::from_string("int"), int_type())?;
    env.add_builtin(Name::from_string("int.add"), int_add())?;
    env.add_builtin(Name::from_string("int.sub"), int_sub())?;
    env.add_builtin(Name::from_string("int.mul"), int_mul())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, whnf};
    use crate::tc::infer_type;

    #[test]
    fn test_literal_roundtrip() {
        assert_eq!(to_int(&mk_int(42)), Some(42));
        assert_eq!(to_int(&int_type()), None);
        assert_eq!(to_bool(&mk_bool(true)), Some(true));
    }

    #[test]
    fn test_literals_hash_cons() {
        assert!(Expr::ptr_eq(&mk_int(7), &mk_int(7)));
        assert!(!Expr::ptr_eq(&mk_int(7), &mk_int(8)));
    }

    #[test]
    fn test_add_folds_literals() {
        let env = Env::new();
        let e = mk_app([int_add(), mk_int(1), mk_int(2)]);
        let r = whnf(&e, &env).unwrap();
        assert_eq!(to_int(&r), Some(3));
    }

    #[test]
    fn test_non_literal_operand_is_stuck() {
        let env = Env::new();
        env.add_var(Name::from_string("n"), int_type()).unwrap();
        let e = mk_app([
            int_add(),
            crate::expr::mk_const(Name::from_string("n")),
            mk_int(2),
        ]);
        let r = whnf(&e, &env).unwrap();
        assert!(r.is_app());
    }

    #[test]
    fn test_nested_folding_through_normalize() {
        let env = Env::new();
        // (1 + 2) * (3 + 4) = 21
        let lhs = mk_app([int_add(), mk_int(1), mk_int(2)]);
        let rhs = mk_app([int_add(), mk_int(3), mk_int(4)]);
        let e = mk_app([int_mul(), lhs, rhs]);
        let r = normalize(&e, &env).unwrap();
        assert_eq!(to_int(&r), Some(21));
    }

    #[test]
    fn test_operation_types() {
        let env = Env::new();
        let t = infer_type(&mk_app([int_add(), mk_int(1), mk_int(2)]), &env).unwrap();
        assert!(Expr::ptr_eq(&t, &int_type()));
        assert!(Expr::ptr_eq(
            &infer_type(&mk_int(5), &env).unwrap(),
            &int_type()
        ));
    }
}
