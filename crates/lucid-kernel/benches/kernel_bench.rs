//! Kernel benchmarks
//!
//! Core-operation timings: weak-head reduction of application chains,
//! type inference on nested abstractions, and convertibility on shared DAGs.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lucid_kernel::arith::{add_arith_builtins, int_add, int_type, mk_int};
use lucid_kernel::{
    infer_type, mk_app, mk_const, mk_lambda, mk_pi, mk_sort, mk_var, normalize, whnf, Env, Level,
    Name,
};
use std::hint::black_box;

fn nm(s: &str) -> Name {
    Name::from_string(s)
}

fn arith_env() -> Env {
    let env = Env::new();
    add_arith_builtins(&env).unwrap();
    env
}

/// `id (id (... (id x)))` with the polymorphic-free identity on Int.
fn id_chain(depth: usize) -> lucid_kernel::Expr {
    let id = mk_lambda(nm("x"), int_type(), mk_var(0));
    let mut e = mk_int(1);
    for _ in 0..depth {
        e = mk_app([id.clone(), e]);
    }
    e
}

fn bench_whnf(c: &mut Criterion) {
    let env = arith_env();
    let mut group = c.benchmark_group("whnf");
    for depth in [8usize, 64, 256] {
        let e = id_chain(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &e, |b, e| {
            b.iter(|| whnf(black_box(e), &env).unwrap());
        });
    }
    group.finish();
}

fn bench_normalize_arith(c: &mut Criterion) {
    let env = arith_env();
    // a balanced tree of additions over literals
    fn tree(depth: usize, seed: i64) -> lucid_kernel::Expr {
        if depth == 0 {
            mk_int(seed)
        } else {
            mk_app([int_add(), tree(depth - 1, seed), tree(depth - 1, seed + 1)])
        }
    }
    let mut group = c.benchmark_group("normalize_arith");
    for depth in [4usize, 8, 12] {
        let e = tree(depth, 0);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &e, |b, e| {
            b.iter(|| normalize(black_box(e), &env).unwrap());
        });
    }
    group.finish();
}

fn bench_infer(c: &mut Criterion) {
    let env = arith_env();
    env.add_var(nm("A"), mk_sort(Level::of(1))).unwrap();
    let a = mk_const(nm("A"));
    // fun (x1 : A) ... (xn : A) => x1
    let mut deep = mk_var(31);
    for _ in 0..32 {
        deep = mk_lambda(nm("x"), a.clone(), deep);
    }
    c.bench_function("infer_nested_lambda", |b| {
        b.iter(|| infer_type(black_box(&deep), &env).unwrap());
    });

    let app = mk_app([int_add(), mk_int(1), mk_int(2)]);
    c.bench_function("infer_app", |b| {
        b.iter(|| infer_type(black_box(&app), &env).unwrap());
    });
}

fn bench_convertibility(c: &mut Criterion) {
    let env = arith_env();
    env.add_var(nm("f"), mk_pi(nm("x"), int_type(), int_type()))
        .unwrap();
    let f = mk_const(nm("f"));
    // eta-expanded vs bare head, repeated into a spine
    let eta = mk_lambda(nm("x"), int_type(), mk_app([f.clone(), mk_var(0)]));
    c.bench_function("convertible_eta", |b| {
        b.iter(|| lucid_kernel::is_convertible(black_box(&eta), black_box(&f), &env).unwrap());
    });
}

criterion_group!(
    benches,
    bench_whnf,
    bench_normalize_arith,
    bench_infer,
    bench_convertibility
);
criterion_main!(benches);
