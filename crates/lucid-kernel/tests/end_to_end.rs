//! End-to-end kernel scenarios: arithmetic reduction through builtin hooks,
//! universe cumulativity, opaque definitions, pattern unification, occur
//! checks, and read-only environments.

use anyhow::{anyhow, Result};
use lucid_kernel::arith::{add_arith_builtins, int_add, int_mul, int_type, mk_int, to_int};
use lucid_kernel::{
    check, expr_eq, infer_type, is_convertible, mk_app, mk_const, mk_lambda, mk_pi, mk_sort,
    mk_var, normalize, Context, Env, KernelError, Level, MetavarEnv, Name,
};

fn nm(s: &str) -> Name {
    Name::from_string(s)
}

#[test]
fn arithmetic_reduction_with_parent_and_child() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;

    // a := 1 + 2
    env.add_definition(
        nm("a"),
        int_type(),
        mk_app([int_add(), mk_int(1), mk_int(2)]),
        false,
    )?;
    // b := 2 * a
    env.add_definition(
        nm("b"),
        int_type(),
        mk_app([int_mul(), mk_int(2), mk_const(nm("a"))]),
        false,
    )?;

    let b = normalize(&mk_const(nm("b")), &env)?;
    assert_eq!(to_int(&b), Some(6));

    // a child with c := a sees the parent's definitions
    let child = env.mk_child();
    child.add_definition(nm("c"), int_type(), mk_const(nm("a")), false)?;
    let c = normalize(&mk_const(nm("c")), &child)?;
    assert_eq!(to_int(&c), Some(3));

    // the parent does not know c
    match normalize(&mk_const(nm("c")), &env) {
        Err(KernelError::UnknownName { name, .. }) => assert_eq!(name, nm("c")),
        other => return Err(anyhow!("expected unknown_name, got {other:?}")),
    }
    Ok(())
}

#[test]
fn universe_cumulativity() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    // u >= 1, w >= u + 1
    env.define_uvar(nm("u"), Level::of(1))?;
    env.define_uvar(nm("w"), Level::param(nm("u")).add_offset(1))?;

    let sort_u = mk_sort(Level::param(nm("u")));
    let sort_w = mk_sort(Level::param(nm("w")));

    // f : Type(u) -> Type(u)
    env.add_var(nm("f"), mk_pi(nm("A"), sort_u.clone(), sort_u.clone()))?;

    // f Int : Type(u), since Int : Type(1) and u >= 1
    let t = infer_type(&mk_app([mk_const(nm("f")), int_type()]), &env)?;
    assert!(expr_eq(&t, &sort_u));

    // f (Type(w)) is rejected: Type(w) : Type(w+1) and u >= w+1 is not derivable
    match infer_type(&mk_app([mk_const(nm("f")), sort_w]), &env) {
        Err(KernelError::AppTypeMismatch { arg_pos: 1, .. }) => Ok(()),
        other => Err(anyhow!("expected app_type_mismatch, got {other:?}")),
    }
}

#[test]
fn opaque_definitions_block_delta() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    env.add_definition(nm("a"), int_type(), mk_int(1), true)?;

    // a + 1 does not reduce
    let e = mk_app([int_add(), mk_const(nm("a")), mk_int(1)]);
    let n = normalize(&e, &env)?;
    assert!(expr_eq(&n, &e));

    // but a is still definitionally understood as an Int where needed
    check(&e, &int_type(), &env)?;

    // using a + 1 as a type is rejected
    let bad = mk_lambda(nm("x"), e, mk_var(0));
    match infer_type(&bad, &env) {
        Err(KernelError::TypeExpected { .. }) => Ok(()),
        other => Err(anyhow!("expected type_expected, got {other:?}")),
    }
}

#[test]
fn pattern_unification_solves_identity() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    let menv = MetavarEnv::new(env);

    let m = menv.mk_metavar(Context::new());
    // ?m 0 == 0
    menv.unify(
        &mk_app([m.clone(), mk_int(0)]),
        &mk_int(0),
        &Context::new(),
    )?;

    let solution = menv.instantiate_metavars(&m);
    let expected = mk_lambda(Name::anon(), int_type(), mk_var(0));
    assert!(
        expr_eq(&solution, &expected),
        "expected identity lambda, got {solution:?}"
    );

    // and the application now reduces to 0
    let applied = menv.instantiate_metavars(&mk_app([m, mk_int(7)]));
    let n = normalize(&applied, menv.env())?;
    assert_eq!(to_int(&n), Some(7));
    Ok(())
}

#[test]
fn occur_check_rejects_cyclic_assignment() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    let menv = MetavarEnv::new(env);

    let m = menv.mk_metavar(Context::new());
    // ?m := ?m + 1
    let cyclic = mk_app([int_add(), m.clone(), mk_int(1)]);
    match menv.assign(&m, &cyclic) {
        Err(KernelError::OccursCheck { .. }) => Ok(()),
        other => Err(anyhow!("expected occurs_check, got {other:?}")),
    }
}

#[test]
fn inference_commutes_with_normalization() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    env.add_definition(
        nm("three"),
        int_type(),
        mk_app([int_add(), mk_int(1), mk_int(2)]),
        false,
    )?;

    let e = mk_app([int_mul(), mk_const(nm("three")), mk_int(2)]);
    let lhs = infer_type(&normalize(&e, &env)?, &env)?;
    let rhs = normalize(&infer_type(&e, &env)?, &env)?;
    assert!(is_convertible(&lhs, &rhs, &env)?);
    Ok(())
}

#[test]
fn read_only_environment() -> Result<()> {
    let env = Env::new();
    env.add_var(nm("x"), mk_sort(Level::of(1)))?;

    let child = env.mk_child();
    match env.add_var(nm("y"), mk_sort(Level::of(1))) {
        Err(KernelError::ReadOnlyEnvironment { .. }) => {}
        other => return Err(anyhow!("expected read_only_environment, got {other:?}")),
    }

    // reads remain fine while frozen
    assert!(env.find_object(&nm("x")).is_some());
    assert!(is_convertible(
        &mk_sort(Level::zero()),
        &mk_sort(Level::zero()),
        &env
    )?);

    drop(child);
    env.add_var(nm("y"), mk_sort(Level::of(1)))?;
    Ok(())
}

#[test]
fn unification_respects_unfoldable_set() -> Result<()> {
    // with an empty unfoldable set, definitions do not unfold during
    // unification, so `a` and its body are not identified
    let env = Env::new();
    add_arith_builtins(&env)?;
    env.add_definition(nm("a"), int_type(), mk_int(1), false)?;

    let menv = lucid_kernel::new_menv(env.clone(), Some(Default::default()), 64);
    let res = menv.unify(&mk_const(nm("a")), &mk_int(1), &Context::new());
    assert!(matches!(res, Err(KernelError::FailedToUnify { .. })));

    // with the default (everything unfoldable) it succeeds
    let menv = MetavarEnv::new(env);
    menv.unify(&mk_const(nm("a")), &mk_int(1), &Context::new())?;
    Ok(())
}

#[test]
fn interruption_is_cooperative_and_resumable() -> Result<()> {
    let env = Env::new();
    add_arith_builtins(&env)?;
    let menv = MetavarEnv::new(env);

    menv.set_interrupt(true);
    let res = menv.unify(&mk_int(1), &mk_int(1), &Context::new());
    assert!(matches!(res, Err(KernelError::Interrupted)));

    // clearing the flag resumes normally
    menv.set_interrupt(false);
    menv.unify(&mk_int(1), &mk_int(1), &Context::new())?;
    Ok(())
}
