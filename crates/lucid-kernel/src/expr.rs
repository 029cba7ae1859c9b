//! Hash-consed expression DAG
//!
//! Terms are immutable DAGs of [`ExprCell`] nodes behind [`Expr`] handles.
//! Every node is built through a smart constructor (`mk_var`, `mk_app`, ...)
//! which computes the node caches and interns the node in a process-global
//! weak table, so structurally equal sub-DAGs built anywhere in the process
//! share identity. Cached per node:
//!
//! - a 32-bit structural fingerprint (binder name hints excluded, so
//!   alpha-equivalent construction dedupes),
//! - a free-variable index range `[lo, hi)`,
//! - a has-metavariable bit,
//! - an approximate weight (node count),
//! - a max-shared bit marking the node as the canonical representative.
//!
//! The table holds weak references only; terms are freed when the last
//! outside handle drops, and dead entries are swept periodically.

use crate::level::Level;
use crate::name::Name;
use crate::value::ValueRef;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Argument vector of an n-ary application. `args[0]` is the function.
pub type ExprArgs = SmallVec<[Expr; 4]>;

/// Pending substitution recorded on a metavariable occurrence.
///
/// Substitution and lifting cannot be pushed through an uninstantiated
/// metavariable, so they accumulate here and are replayed (in recording
/// order) once the metavariable is assigned.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LocalEntry {
    /// Shift free indices `>= start` up by `offset`.
    Lift { start: u32, offset: u32 },
    /// Substitute `value` for `Var(start)`, shifting higher indices down.
    Inst { start: u32, value: Expr },
}

/// Which component a `Proj` extracts from a pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProjKind {
    First,
    Second,
}

/// Binder payload shared by `Lambda`, `Pi`, and `Sigma`.
#[derive(Clone, Debug)]
pub struct Binder {
    /// Pretty-printing hint; ignored by equality and hashing.
    pub hint: Name,
    pub domain: Expr,
    /// Scope of the binder: `Var(0)` refers to the bound variable.
    pub body: Expr,
}

/// The view of an expression node.
#[derive(Clone, Debug)]
pub enum ExprKind {
    /// Bound variable (de Bruijn index, 0 = innermost binder).
    Var(u32),
    /// Reference to an environment object, with optional explicit universe
    /// levels instantiating the environment's universe variables.
    Const(Name, Option<Vec<Level>>),
    /// A universe.
    Sort(Level),
    /// N-ary application; `args[0]` is the function.
    App(ExprArgs),
    Lambda(Binder),
    Pi(Binder),
    Sigma(Binder),
    /// `Pair(first, second, ty)` where `ty` is the sigma type of the pair.
    Pair(Expr, Expr, Expr),
    Proj(ProjKind, Expr),
    /// Local definition; `body` sees the bound value as `Var(0)`.
    Let {
        hint: Name,
        ty: Option<Expr>,
        value: Expr,
        body: Expr,
    },
    /// Heterogeneous equality.
    HEq(Expr, Expr),
    /// Metavariable occurrence: cell index plus pending local entries.
    MetaVar(u32, Vec<LocalEntry>),
    /// Opaque embedded value.
    Value(ValueRef),
}

/// Interned expression node with caches. Never mutated after publication
/// (the max-shared bit only ever flips false → true).
pub struct ExprCell {
    kind: ExprKind,
    hash: u32,
    fv_lo: u32,
    fv_hi: u32,
    has_metavar: bool,
    weight: u32,
    max_shared: AtomicBool,
}

/// Cheaply clonable handle to an interned expression node.
#[derive(Clone)]
pub struct Expr(Arc<ExprCell>);

// ============================================================================
// Cache computation
// ============================================================================

const TAG_VAR: u32 = 0x01;
const TAG_CONST: u32 = 0x02;
const TAG_SORT: u32 = 0x03;
const TAG_APP: u32 = 0x04;
const TAG_LAMBDA: u32 = 0x05;
const TAG_PI: u32 = 0x06;
const TAG_SIGMA: u32 = 0x07;
const TAG_PAIR: u32 = 0x08;
const TAG_PROJ: u32 = 0x09;
const TAG_LET: u32 = 0x0a;
const TAG_HEQ: u32 = 0x0b;
const TAG_METAVAR: u32 = 0x0c;
const TAG_VALUE: u32 = 0x0d;

fn mix(a: u32, b: u32) -> u32 {
    let mut h = a.wrapping_mul(0x9e37_79b9) ^ b;
    h ^= h >> 15;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^ (h >> 13)
}

/// Free-variable index range `[lo, hi)`; `(0, 0)` means closed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct FvRange {
    lo: u32,
    hi: u32,
}

impl FvRange {
    const CLOSED: FvRange = FvRange { lo: 0, hi: 0 };

    fn single(idx: u32) -> FvRange {
        FvRange {
            lo: idx,
            hi: idx + 1,
        }
    }

    fn is_closed(self) -> bool {
        self.lo >= self.hi
    }

    fn union(self, other: FvRange) -> FvRange {
        if self.is_closed() {
            other
        } else if other.is_closed() {
            self
        } else {
            FvRange {
                lo: self.lo.min(other.lo),
                hi: self.hi.max(other.hi),
            }
        }
    }

    /// Range of a binder body seen from outside: index 0 is bound, the
    /// remaining indices shift down by one.
    fn under_binder(self) -> FvRange {
        if self.hi <= 1 {
            FvRange::CLOSED
        } else {
            FvRange {
                lo: self.lo.saturating_sub(1),
                hi: self.hi - 1,
            }
        }
    }
}

fn kind_caches(kind: &ExprKind) -> (u32, FvRange, bool, u32) {
    match kind {
        ExprKind::Var(idx) => (mix(TAG_VAR, *idx), FvRange::single(*idx), false, 1),
        ExprKind::Const(name, levels) => {
            let mut h = mix(TAG_CONST, name.hash32());
            if let Some(levels) = levels {
                for l in levels {
                    h = mix(h, l.hash32());
                }
            }
            (h, FvRange::CLOSED, false, 1)
        }
        ExprKind::Sort(level) => (mix(TAG_SORT, level.hash32()), FvRange::CLOSED, false, 1),
        ExprKind::App(args) => {
            let mut h = TAG_APP;
            let mut fv = FvRange::CLOSED;
            let mut mv = false;
            let mut w: u32 = 1;
            for a in args {
                h = mix(h, a.hash());
                fv = fv.union(a.fv_range());
                mv |= a.has_metavar();
                w = w.saturating_add(a.weight());
            }
            (h, fv, mv, w)
        }
        ExprKind::Lambda(b) | ExprKind::Pi(b) | ExprKind::Sigma(b) => {
            let tag = match kind {
                ExprKind::Lambda(_) => TAG_LAMBDA,
                ExprKind::Pi(_) => TAG_PI,
                _ => TAG_SIGMA,
            };
            let h = mix(mix(tag, b.domain.hash()), b.body.hash());
            let fv = b.domain.fv_range().union(b.body.fv_range().under_binder());
            let mv = b.domain.has_metavar() || b.body.has_metavar();
            let w = 1u32
                .saturating_add(b.domain.weight())
                .saturating_add(b.body.weight());
            (h, fv, mv, w)
        }
        ExprKind::Pair(first, second, ty) => {
            let h = mix(mix(mix(TAG_PAIR, first.hash()), second.hash()), ty.hash());
            let fv = first
                .fv_range()
                .union(second.fv_range())
                .union(ty.fv_range());
            let mv = first.has_metavar() || second.has_metavar() || ty.has_metavar();
            let w = 1u32
                .saturating_add(first.weight())
                .saturating_add(second.weight())
                .saturating_add(ty.weight());
            (h, fv, mv, w)
        }
        ExprKind::Proj(k, arg) => {
            let kh = match k {
                ProjKind::First => 1,
                ProjKind::Second => 2,
            };
            (
                mix(mix(TAG_PROJ, kh), arg.hash()),
                arg.fv_range(),
                arg.has_metavar(),
                1u32.saturating_add(arg.weight()),
            )
        }
        ExprKind::Let {
            ty, value, body, ..
        } => {
            let mut h = mix(TAG_LET, value.hash());
            let mut fv = value.fv_range();
            let mut mv = value.has_metavar();
            let mut w = 1u32.saturating_add(value.weight());
            if let Some(ty) = ty {
                h = mix(h, ty.hash());
                fv = fv.union(ty.fv_range());
                mv |= ty.has_metavar();
                w = w.saturating_add(ty.weight());
            }
            h = mix(h, body.hash());
            fv = fv.union(body.fv_range().under_binder());
            mv |= body.has_metavar();
            w = w.saturating_add(body.weight());
            (h, fv, mv, w)
        }
        ExprKind::HEq(lhs, rhs) => (
            mix(mix(TAG_HEQ, lhs.hash()), rhs.hash()),
            lhs.fv_range().union(rhs.fv_range()),
            lhs.has_metavar() || rhs.has_metavar(),
            1u32.saturating_add(lhs.weight()).saturating_add(rhs.weight()),
        ),
        ExprKind::MetaVar(idx, entries) => {
            let mut h = mix(TAG_METAVAR, *idx);
            let mut w: u32 = 1;
            for e in entries {
                match e {
                    LocalEntry::Lift { start, offset } => {
                        h = mix(h, mix(*start, *offset));
                    }
                    LocalEntry::Inst { start, value } => {
                        h = mix(h, mix(*start, value.hash()));
                        w = w.saturating_add(value.weight());
                    }
                }
            }
            // A metavariable stands for an arbitrary term of its context, so
            // the free-variable summary is conservative.
            (
                h,
                FvRange {
                    lo: 0,
                    hi: u32::MAX,
                },
                true,
                w,
            )
        }
        ExprKind::Value(v) => (mix(TAG_VALUE, v.hash()), FvRange::CLOSED, false, 1),
    }
}

// ============================================================================
// Global interner
// ============================================================================

/// Shallow structural comparison used as the interner key: children compare
/// by identity (they are already canonical), payloads by value, binder name
/// hints are ignored.
fn shallow_eq(a: &ExprKind, b: &ExprKind) -> bool {
    use ExprKind::*;
    match (a, b) {
        (Var(i), Var(j)) => i == j,
        (Const(n1, l1), Const(n2, l2)) => n1 == n2 && l1 == l2,
        (Sort(l1), Sort(l2)) => l1 == l2,
        (App(a1), App(a2)) => {
            a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| Expr::ptr_eq(x, y))
        }
        (Lambda(b1), Lambda(b2)) | (Pi(b1), Pi(b2)) | (Sigma(b1), Sigma(b2)) => {
            Expr::ptr_eq(&b1.domain, &b2.domain) && Expr::ptr_eq(&b1.body, &b2.body)
        }
        (Pair(f1, s1, t1), Pair(f2, s2, t2)) => {
            Expr::ptr_eq(f1, f2) && Expr::ptr_eq(s1, s2) && Expr::ptr_eq(t1, t2)
        }
        (Proj(k1, e1), Proj(k2, e2)) => k1 == k2 && Expr::ptr_eq(e1, e2),
        (
            Let {
                ty: t1,
                value: v1,
                body: b1,
                ..
            },
            Let {
                ty: t2,
                value: v2,
                body: b2,
                ..
            },
        ) => {
            let ty_eq = match (t1, t2) {
                (None, None) => true,
                (Some(x), Some(y)) => Expr::ptr_eq(x, y),
                _ => false,
            };
            ty_eq && Expr::ptr_eq(v1, v2) && Expr::ptr_eq(b1, b2)
        }
        (HEq(l1, r1), HEq(l2, r2)) => Expr::ptr_eq(l1, l2) && Expr::ptr_eq(r1, r2),
        (MetaVar(i1, e1), MetaVar(i2, e2)) => {
            i1 == i2
                && e1.len() == e2.len()
                && e1.iter().zip(e2).all(|(x, y)| match (x, y) {
                    (
                        LocalEntry::Lift {
                            start: s1,
                            offset: o1,
                        },
                        LocalEntry::Lift {
                            start: s2,
                            offset: o2,
                        },
                    ) => s1 == s2 && o1 == o2,
                    (
                        LocalEntry::Inst {
                            start: s1,
                            value: v1,
                        },
                        LocalEntry::Inst {
                            start: s2,
                            value: v2,
                        },
                    ) => s1 == s2 && Expr::ptr_eq(v1, v2),
                    _ => false,
                })
        }
        (Value(v1), Value(v2)) => v1 == v2,
        _ => false,
    }
}

struct Interner {
    table: hashbrown::HashMap<u32, SmallVec<[Weak<ExprCell>; 2]>>,
    inserts_since_sweep: usize,
}

impl Interner {
    const SWEEP_INTERVAL: usize = 4096;

    fn new() -> Self {
        Interner {
            table: hashbrown::HashMap::new(),
            inserts_since_sweep: 0,
        }
    }

    fn intern(&mut self, kind: ExprKind) -> Expr {
        let (hash, fv, has_metavar, weight) = kind_caches(&kind);
        if let Some(bucket) = self.table.get(&hash) {
            for weak in bucket {
                if let Some(cell) = weak.upgrade() {
                    if shallow_eq(&cell.kind, &kind) {
                        return Expr(cell);
                    }
                }
            }
        }
        let cell = Arc::new(ExprCell {
            kind,
            hash,
            fv_lo: fv.lo,
            fv_hi: fv.hi,
            has_metavar,
            weight,
            max_shared: AtomicBool::new(true),
        });
        self.table
            .entry(hash)
            .or_default()
            .push(Arc::downgrade(&cell));
        self.inserts_since_sweep += 1;
        if self.inserts_since_sweep >= Self::SWEEP_INTERVAL {
            self.sweep();
        }
        Expr(cell)
    }

    /// Drop dead weak entries so the table does not grow with garbage.
    fn sweep(&mut self) {
        self.inserts_since_sweep = 0;
        self.table.retain(|_, bucket| {
            bucket.retain(|w| w.strong_count() > 0);
            !bucket.is_empty()
        });
    }
}

fn interner() -> &'static Mutex<Interner> {
    static INTERNER: OnceLock<Mutex<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| Mutex::new(Interner::new()))
}

fn intern(kind: ExprKind) -> Expr {
    let mut guard = interner().lock().unwrap_or_else(|e| e.into_inner());
    guard.intern(kind)
}

// ============================================================================
// Smart constructors (total; always return the canonical node)
// ============================================================================

/// Bound variable.
pub fn mk_var(idx: u32) -> Expr {
    intern(ExprKind::Var(idx))
}

/// Reference to an environment object.
pub fn mk_const(name: Name) -> Expr {
    intern(ExprKind::Const(name, None))
}

/// Reference with explicit universe levels.
pub fn mk_const_with_levels(name: Name, levels: Vec<Level>) -> Expr {
    intern(ExprKind::Const(name, Some(levels)))
}

/// A universe.
pub fn mk_sort(level: Level) -> Expr {
    intern(ExprKind::Sort(level))
}

/// N-ary application. `args[0]` is the function; a nested application head
/// is flattened so application spines stay n-ary. A single-element vector
/// returns that element unchanged.
pub fn mk_app(args: impl IntoIterator<Item = Expr>) -> Expr {
    let mut flat: ExprArgs = SmallVec::new();
    for (i, a) in args.into_iter().enumerate() {
        if i == 0 {
            if let ExprKind::App(head_args) = a.kind() {
                flat.extend(head_args.iter().cloned());
                continue;
            }
        }
        flat.push(a);
    }
    debug_assert!(!flat.is_empty(), "mk_app requires a function");
    if flat.len() == 1 {
        return flat.remove(0);
    }
    intern(ExprKind::App(flat))
}

/// Binary application helper.
pub fn mk_app2(f: Expr, a: Expr) -> Expr {
    mk_app([f, a])
}

pub fn mk_lambda(hint: Name, domain: Expr, body: Expr) -> Expr {
    intern(ExprKind::Lambda(Binder { hint, domain, body }))
}

pub fn mk_pi(hint: Name, domain: Expr, body: Expr) -> Expr {
    intern(ExprKind::Pi(Binder { hint, domain, body }))
}

pub fn mk_sigma(hint: Name, domain: Expr, body: Expr) -> Expr {
    intern(ExprKind::Sigma(Binder { hint, domain, body }))
}

/// Dependent pair; `ty` is the sigma type the pair inhabits. Shape errors
/// (`ty` not a sigma) are deferred to the type checker.
pub fn mk_pair(first: Expr, second: Expr, ty: Expr) -> Expr {
    intern(ExprKind::Pair(first, second, ty))
}

pub fn mk_proj(kind: ProjKind, arg: Expr) -> Expr {
    intern(ExprKind::Proj(kind, arg))
}

pub fn mk_let(hint: Name, ty: Option<Expr>, value: Expr, body: Expr) -> Expr {
    intern(ExprKind::Let {
        hint,
        ty,
        value,
        body,
    })
}

pub fn mk_heq(lhs: Expr, rhs: Expr) -> Expr {
    intern(ExprKind::HEq(lhs, rhs))
}

/// Metavariable occurrence. Fresh metavariables are allocated through
/// `MetavarEnv::mk_metavar`, which picks the index.
pub fn mk_metavar(idx: u32, entries: Vec<LocalEntry>) -> Expr {
    intern(ExprKind::MetaVar(idx, entries))
}

/// Embedded host value.
pub fn mk_value(v: ValueRef) -> Expr {
    intern(ExprKind::Value(v))
}

// ============================================================================
// Handle API
// ============================================================================

impl Expr {
    /// The view of the root node.
    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    /// Cached 32-bit structural fingerprint.
    pub fn hash(&self) -> u32 {
        self.0.hash
    }

    /// Lower bound of the free-variable range.
    pub fn fv_lo(&self) -> u32 {
        self.0.fv_lo
    }

    /// Exclusive upper bound of the free-variable range. `0` means closed.
    pub fn fv_hi(&self) -> u32 {
        self.0.fv_hi
    }

    fn fv_range(&self) -> FvRange {
        FvRange {
            lo: self.0.fv_lo,
            hi: self.0.fv_hi,
        }
    }

    /// No free variables (conservatively false for metavariable-containing
    /// terms, whose scope is only known once they are assigned).
    pub fn is_closed(&self) -> bool {
        self.0.fv_lo >= self.0.fv_hi
    }

    pub fn has_metavar(&self) -> bool {
        self.0.has_metavar
    }

    /// Approximate size (node count, sharing not discounted).
    pub fn weight(&self) -> u32 {
        self.0.weight
    }

    /// Identity comparison.
    pub fn ptr_eq(a: &Expr, b: &Expr) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Stable per-node address, usable as a memoization key for the lifetime
    /// of the handles that keep the node alive.
    pub(crate) fn node_addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn is_max_shared(&self) -> bool {
        self.0.max_shared.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_shared(&self) {
        self.0.max_shared.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Kind predicates
    // ------------------------------------------------------------------

    pub fn is_var(&self) -> bool {
        matches!(self.kind(), ExprKind::Var(_))
    }
    pub fn is_const(&self) -> bool {
        matches!(self.kind(), ExprKind::Const(..))
    }
    pub fn is_sort(&self) -> bool {
        matches!(self.kind(), ExprKind::Sort(_))
    }
    pub fn is_app(&self) -> bool {
        matches!(self.kind(), ExprKind::App(_))
    }
    pub fn is_lambda(&self) -> bool {
        matches!(self.kind(), ExprKind::Lambda(_))
    }
    pub fn is_pi(&self) -> bool {
        matches!(self.kind(), ExprKind::Pi(_))
    }
    pub fn is_sigma(&self) -> bool {
        matches!(self.kind(), ExprKind::Sigma(_))
    }
    pub fn is_pair(&self) -> bool {
        matches!(self.kind(), ExprKind::Pair(..))
    }
    pub fn is_proj(&self) -> bool {
        matches!(self.kind(), ExprKind::Proj(..))
    }
    pub fn is_let(&self) -> bool {
        matches!(self.kind(), ExprKind::Let { .. })
    }
    pub fn is_heq(&self) -> bool {
        matches!(self.kind(), ExprKind::HEq(..))
    }
    pub fn is_metavar(&self) -> bool {
        matches!(self.kind(), ExprKind::MetaVar(..))
    }
    pub fn is_value(&self) -> bool {
        matches!(self.kind(), ExprKind::Value(_))
    }
    /// Lambda, Pi, or Sigma.
    pub fn is_abstraction(&self) -> bool {
        matches!(
            self.kind(),
            ExprKind::Lambda(_) | ExprKind::Pi(_) | ExprKind::Sigma(_)
        )
    }

    // ------------------------------------------------------------------
    // Accessors (panic on kind mismatch only through the Option API misuse;
    // all return Option so callers stay total)
    // ------------------------------------------------------------------

    pub fn var_idx(&self) -> Option<u32> {
        match self.kind() {
            ExprKind::Var(i) => Some(*i),
            _ => None,
        }
    }

    pub fn const_name(&self) -> Option<&Name> {
        match self.kind() {
            ExprKind::Const(n, _) => Some(n),
            _ => None,
        }
    }

    pub fn const_levels(&self) -> Option<&[Level]> {
        match self.kind() {
            ExprKind::Const(_, Some(ls)) => Some(ls.as_slice()),
            _ => None,
        }
    }

    pub fn sort_level(&self) -> Option<&Level> {
        match self.kind() {
            ExprKind::Sort(l) => Some(l),
            _ => None,
        }
    }

    /// Total number of application components, function included.
    pub fn num_args(&self) -> usize {
        match self.kind() {
            ExprKind::App(args) => args.len(),
            _ => 1,
        }
    }

    /// Application component `i`; `arg(0)` is the function.
    pub fn arg(&self, i: usize) -> Option<&Expr> {
        match self.kind() {
            ExprKind::App(args) => args.get(i),
            _ => None,
        }
    }

    pub fn app_args(&self) -> Option<&[Expr]> {
        match self.kind() {
            ExprKind::App(args) => Some(args.as_slice()),
            _ => None,
        }
    }

    /// Head of an application spine (itself when not an application).
    pub fn app_fn(&self) -> &Expr {
        match self.kind() {
            ExprKind::App(args) => &args[0],
            _ => self,
        }
    }

    pub fn abst_name(&self) -> Option<&Name> {
        self.binder().map(|b| &b.hint)
    }

    pub fn abst_domain(&self) -> Option<&Expr> {
        self.binder().map(|b| &b.domain)
    }

    pub fn abst_body(&self) -> Option<&Expr> {
        self.binder().map(|b| &b.body)
    }

    pub fn binder(&self) -> Option<&Binder> {
        match self.kind() {
            ExprKind::Lambda(b) | ExprKind::Pi(b) | ExprKind::Sigma(b) => Some(b),
            _ => None,
        }
    }

    pub fn pair_first(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Pair(f, _, _) => Some(f),
            _ => None,
        }
    }

    pub fn pair_second(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Pair(_, s, _) => Some(s),
            _ => None,
        }
    }

    pub fn pair_type(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Pair(_, _, t) => Some(t),
            _ => None,
        }
    }

    pub fn proj_kind(&self) -> Option<ProjKind> {
        match self.kind() {
            ExprKind::Proj(k, _) => Some(*k),
            _ => None,
        }
    }

    pub fn proj_arg(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Proj(_, e) => Some(e),
            _ => None,
        }
    }

    pub fn let_name(&self) -> Option<&Name> {
        match self.kind() {
            ExprKind::Let { hint, .. } => Some(hint),
            _ => None,
        }
    }

    pub fn let_type(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Let { ty: Some(t), .. } => Some(t),
            _ => None,
        }
    }

    pub fn let_value(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Let { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn let_body(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::Let { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn heq_lhs(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::HEq(l, _) => Some(l),
            _ => None,
        }
    }

    pub fn heq_rhs(&self) -> Option<&Expr> {
        match self.kind() {
            ExprKind::HEq(_, r) => Some(r),
            _ => None,
        }
    }

    pub fn metavar_idx(&self) -> Option<u32> {
        match self.kind() {
            ExprKind::MetaVar(i, _) => Some(*i),
            _ => None,
        }
    }

    pub fn metavar_entries(&self) -> Option<&[LocalEntry]> {
        match self.kind() {
            ExprKind::MetaVar(_, es) => Some(es.as_slice()),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&ValueRef> {
        match self.kind() {
            ExprKind::Value(v) => Some(v),
            _ => None,
        }
    }
}

// Canonical nodes make identity a sound equality: every handle comes out of
// a smart constructor, so structurally equal terms (up to name hints) share
// their cell. `expr_eq` below is the full structural walk.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Expr::ptr_eq(self, other)
    }
}

impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.hash);
    }
}

// ============================================================================
// Alpha-equivalence
// ============================================================================

/// Structural (alpha) equality: ignores binder name hints, short-circuits on
/// identity and fingerprint inequality, and keeps a visited pair set so
/// shared sub-DAGs are compared once.
pub fn expr_eq(a: &Expr, b: &Expr) -> bool {
    let mut visited: hashbrown::HashSet<(usize, usize)> = hashbrown::HashSet::new();
    expr_eq_core(a, b, &mut visited)
}

fn opt_expr_eq(
    a: Option<&Expr>,
    b: Option<&Expr>,
    visited: &mut hashbrown::HashSet<(usize, usize)>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => expr_eq_core(a, b, visited),
        _ => false,
    }
}

fn expr_eq_core(a: &Expr, b: &Expr, visited: &mut hashbrown::HashSet<(usize, usize)>) -> bool {
    if Expr::ptr_eq(a, b) {
        return true;
    }
    if a.hash() != b.hash() {
        return false;
    }
    if !visited.insert((a.node_addr(), b.node_addr())) {
        // Pair already compared (or in progress on a shared sub-DAG).
        return true;
    }
    use ExprKind::*;
    match (a.kind(), b.kind()) {
        (Var(i), Var(j)) => i == j,
        (Const(n1, l1), Const(n2, l2)) => n1 == n2 && l1 == l2,
        (Sort(l1), Sort(l2)) => l1 == l2,
        (App(a1), App(a2)) => {
            a1.len() == a2.len()
                && a1
                    .iter()
                    .zip(a2.iter())
                    .all(|(x, y)| expr_eq_core(x, y, visited))
        }
        (Lambda(b1), Lambda(b2)) | (Pi(b1), Pi(b2)) | (Sigma(b1), Sigma(b2)) => {
            expr_eq_core(&b1.domain, &b2.domain, visited)
                && expr_eq_core(&b1.body, &b2.body, visited)
        }
        (Pair(f1, s1, t1), Pair(f2, s2, t2)) => {
            expr_eq_core(f1, f2, visited)
                && expr_eq_core(s1, s2, visited)
                && expr_eq_core(t1, t2, visited)
        }
        (Proj(k1, e1), Proj(k2, e2)) => k1 == k2 && expr_eq_core(e1, e2, visited),
        (
            Let {
                ty: t1,
                value: v1,
                body: b1,
                ..
            },
            Let {
                ty: t2,
                value: v2,
                body: b2,
                ..
            },
        ) => {
            opt_expr_eq(t1.as_ref(), t2.as_ref(), visited)
                && expr_eq_core(v1, v2, visited)
                && expr_eq_core(b1, b2, visited)
        }
        (HEq(l1, r1), HEq(l2, r2)) => {
            expr_eq_core(l1, l2, visited) && expr_eq_core(r1, r2, visited)
        }
        (MetaVar(i1, e1), MetaVar(i2, e2)) => {
            i1 == i2
                && e1.len() == e2.len()
                && e1.iter().zip(e2.iter()).all(|(x, y)| match (x, y) {
                    (
                        LocalEntry::Lift {
                            start: s1,
                            offset: o1,
                        },
                        LocalEntry::Lift {
                            start: s2,
                            offset: o2,
                        },
                    ) => s1 == s2 && o1 == o2,
                    (
                        LocalEntry::Inst {
                            start: s1,
                            value: v1,
                        },
                        LocalEntry::Inst {
                            start: s2,
                            value: v2,
                        },
                    ) => s1 == s2 && expr_eq_core(v1, v2, visited),
                    _ => false,
                })
        }
        (Value(v1), Value(v2)) => v1 == v2,
        _ => false,
    }
}

// ============================================================================
// Free-variable queries
// ============================================================================

/// True iff `e` has a free variable with index in `[low, high)`.
pub fn has_free_var(e: &Expr, low: u32, high: u32) -> bool {
    if low >= high {
        return false;
    }
    has_free_var_core(e, low, high, 0)
}

fn has_free_var_core(e: &Expr, low: u32, high: u32, depth: u32) -> bool {
    // Prune with the cached summary: free vars of `e` at this depth map to
    // outer indices `v - depth` for `v >= depth`.
    if e.is_closed() {
        return false;
    }
    let lo_bound = low.saturating_add(depth);
    if e.fv_hi() <= lo_bound {
        return false;
    }
    if let Some(hi_bound) = high.checked_add(depth) {
        if e.fv_lo() >= hi_bound {
            return false;
        }
    }
    use ExprKind::*;
    match e.kind() {
        Var(v) => *v >= depth && (*v - depth) >= low && (*v - depth) < high,
        Const(..) | Sort(_) | Value(_) => false,
        // Conservative: an unassigned metavariable may mention anything in
        // scope at its creation site.
        MetaVar(..) => true,
        App(args) => args.iter().any(|a| has_free_var_core(a, low, high, depth)),
        Lambda(b) | Pi(b) | Sigma(b) => {
            has_free_var_core(&b.domain, low, high, depth)
                || has_free_var_core(&b.body, low, high, depth + 1)
        }
        Pair(f, s, t) => {
            has_free_var_core(f, low, high, depth)
                || has_free_var_core(s, low, high, depth)
                || has_free_var_core(t, low, high, depth)
        }
        Proj(_, arg) => has_free_var_core(arg, low, high, depth),
        Let {
            ty, value, body, ..
        } => {
            ty.as_ref()
                .is_some_and(|t| has_free_var_core(t, low, high, depth))
                || has_free_var_core(value, low, high, depth)
                || has_free_var_core(body, low, high, depth + 1)
        }
        HEq(l, r) => {
            has_free_var_core(l, low, high, depth) || has_free_var_core(r, low, high, depth)
        }
    }
}

// ============================================================================
// Universe substitution
// ============================================================================

/// Substitute universe variables throughout a term (in `Sort` levels and in
/// explicit `Const` level lists).
pub fn substitute_levels(e: &Expr, subst: &[(Name, Level)]) -> Expr {
    if subst.is_empty() {
        return e.clone();
    }
    use ExprKind::*;
    match e.kind() {
        Var(_) | Value(_) => e.clone(),
        Sort(l) => mk_sort(l.substitute(subst)),
        Const(_, None) => e.clone(),
        Const(n, Some(ls)) => mk_const_with_levels(
            n.clone(),
            ls.iter().map(|l| l.substitute(subst)).collect(),
        ),
        App(args) => {
            let new_args: ExprArgs = args.iter().map(|a| substitute_levels(a, subst)).collect();
            mk_app(new_args)
        }
        Lambda(b) => mk_lambda(
            b.hint.clone(),
            substitute_levels(&b.domain, subst),
            substitute_levels(&b.body, subst),
        ),
        Pi(b) => mk_pi(
            b.hint.clone(),
            substitute_levels(&b.domain, subst),
            substitute_levels(&b.body, subst),
        ),
        Sigma(b) => mk_sigma(
            b.hint.clone(),
            substitute_levels(&b.domain, subst),
            substitute_levels(&b.body, subst),
        ),
        Pair(f, s, t) => mk_pair(
            substitute_levels(f, subst),
            substitute_levels(s, subst),
            substitute_levels(t, subst),
        ),
        Proj(k, arg) => mk_proj(*k, substitute_levels(arg, subst)),
        Let {
            hint,
            ty,
            value,
            body,
        } => mk_let(
            hint.clone(),
            ty.as_ref().map(|t| substitute_levels(t, subst)),
            substitute_levels(value, subst),
            substitute_levels(body, subst),
        ),
        HEq(l, r) => mk_heq(substitute_levels(l, subst), substitute_levels(r, subst)),
        MetaVar(idx, entries) => {
            let entries = entries
                .iter()
                .map(|entry| match entry {
                    LocalEntry::Lift { start, offset } => LocalEntry::Lift {
                        start: *start,
                        offset: *offset,
                    },
                    LocalEntry::Inst { start, value } => LocalEntry::Inst {
                        start: *start,
                        value: substitute_levels(value, subst),
                    },
                })
                .collect();
            mk_metavar(*idx, entries)
        }
    }
}

// ============================================================================
// Debug formatting
// ============================================================================

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ExprKind::*;
        match self.kind() {
            Var(i) => write!(f, "#{i}"),
            Const(n, None) => write!(f, "{n}"),
            Const(n, Some(ls)) => {
                write!(f, "{n}.{{")?;
                for (i, l) in ls.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{l}")?;
                }
                write!(f, "}}")
            }
            Sort(l) => write!(f, "Sort({l})"),
            App(args) => {
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{a:?}")?;
                }
                write!(f, ")")
            }
            Lambda(b) => write!(f, "(fun ({} : {:?}) {:?})", b.hint, b.domain, b.body),
            Pi(b) => write!(f, "(Pi ({} : {:?}) {:?})", b.hint, b.domain, b.body),
            Sigma(b) => write!(f, "(Sigma ({} : {:?}) {:?})", b.hint, b.domain, b.body),
            Pair(a, s, t) => write!(f, "(pair {a:?} {s:?} : {t:?})"),
            Proj(ProjKind::First, e) => write!(f, "(fst {e:?})"),
            Proj(ProjKind::Second, e) => write!(f, "(snd {e:?})"),
            Let {
                hint,
                ty,
                value,
                body,
            } => match ty {
                Some(t) => write!(f, "(let {hint} : {t:?} := {value:?} in {body:?})"),
                None => write!(f, "(let {hint} := {value:?} in {body:?})"),
            },
            HEq(l, r) => write!(f, "({l:?} == {r:?})"),
            MetaVar(i, entries) => {
                write!(f, "?m{i}")?;
                if !entries.is_empty() {
                    write!(f, "[")?;
                    for (k, e) in entries.iter().enumerate() {
                        if k > 0 {
                            write!(f, "; ")?;
                        }
                        match e {
                            LocalEntry::Lift { start, offset } => {
                                write!(f, "lift {start} {offset}")?;
                            }
                            LocalEntry::Inst { start, value } => {
                                write!(f, "inst {start} {value:?}")?;
                            }
                        }
                    }
                    write!(f, "]")?;
                }
                Ok(())
            }
            Value(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nm(s: &str) -> Name {
        Name::from_string(s)
    }

    #[test]
    fn test_hash_cons_shares_identity() {
        let a = mk_app([mk_const(nm("f")), mk_var(0), mk_var(1)]);
        let b = mk_app([mk_const(nm("f")), mk_var(0), mk_var(1)]);
        assert!(Expr::ptr_eq(&a, &b));
    }

    #[test]
    fn test_hash_cons_ignores_binder_hints() {
        let t = mk_sort(Level::zero());
        let a = mk_lambda(nm("x"), t.clone(), mk_var(0));
        let b = mk_lambda(nm("y"), t, mk_var(0));
        assert!(Expr::ptr_eq(&a, &b));
        assert!(expr_eq(&a, &b));
    }

    #[test]
    fn test_app_flattening() {
        let f = mk_const(nm("f"));
        let inner = mk_app([f.clone(), mk_var(0)]);
        let outer = mk_app([inner, mk_var(1)]);
        assert_eq!(outer.num_args(), 3);
        assert!(Expr::ptr_eq(outer.arg(0).unwrap(), &f));
    }

    #[test]
    fn test_free_var_range() {
        let e = mk_app([mk_const(nm("f")), mk_var(2), mk_var(5)]);
        assert_eq!(e.fv_lo(), 2);
        assert_eq!(e.fv_hi(), 6);
        assert!(!e.is_closed());

        let lam = mk_lambda(nm("x"), mk_sort(Level::zero()), mk_var(0));
        assert!(lam.is_closed());

        let lam_open = mk_lambda(nm("x"), mk_sort(Level::zero()), mk_var(3));
        assert_eq!(lam_open.fv_lo(), 2);
        assert_eq!(lam_open.fv_hi(), 3);
    }

    #[test]
    fn test_has_free_var() {
        let e = mk_lambda(nm("x"), mk_sort(Level::zero()), mk_var(2));
        assert!(has_free_var(&e, 1, 2));
        assert!(!has_free_var(&e, 0, 1));
        assert!(!has_free_var(&e, 2, 10));
        assert!(!has_free_var(&e, 5, 5));
    }

    #[test]
    fn test_metavar_is_conservative() {
        let m = mk_metavar(0, vec![]);
        assert!(m.has_metavar());
        assert!(!m.is_closed());
        assert!(has_free_var(&m, 0, 1));
    }

    #[test]
    fn test_weight() {
        let f = mk_const(nm("f"));
        let e = mk_app([f, mk_var(0)]);
        assert_eq!(e.weight(), 3);
    }

    #[test]
    fn test_expr_eq_shortcuts() {
        let a = mk_var(0);
        let b = mk_var(1);
        assert!(!expr_eq(&a, &b));
        assert!(expr_eq(&a, &a));
    }
}
