//! Environments
//!
//! An environment is a symbol table of named objects (postulates,
//! definitions, builtins, opaque host payloads) plus the partial order of
//! universe variables. Environments form a tree: `mk_child` forks a mutable
//! child and freezes the parent for as long as any child is alive, which is
//! what speculative elaboration needs: a child can declare freely and be
//! thrown away without the parent ever observing it.
//!
//! Declarations are checked on insertion: a definition's value must check
//! against its declared type in the environment as it exists at that point,
//! so a well-formed environment is well-formed prefix by prefix.

use crate::context::Context;
use crate::error::KernelError;
use crate::expr::Expr;
use crate::level::Level;
use crate::name::Name;
use crate::tc::TypeChecker;
use hashbrown::HashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A named object in an environment.
#[derive(Clone)]
pub enum Object {
    /// Universe variable with its declared lower bound: `name >= bound`.
    UVarDecl { name: Name, bound: Level },
    /// Axiom or variable: a name with a type and no value.
    Postulate { name: Name, ty: Expr },
    /// Definition; `opaque` definitions are never unfolded by the normalizer.
    Definition {
        name: Name,
        ty: Expr,
        value: Expr,
        opaque: bool,
    },
    /// Builtin: a named `Expr::Value` node.
    Builtin { name: Name, value: Expr },
    /// Host-extensible payload (notations, coercions, aliases). The kernel
    /// stores and returns it; it never interprets the payload.
    Neutral {
        name: Name,
        kind_tag: &'static str,
        payload: Arc<dyn Any + Send + Sync>,
    },
}

impl Object {
    pub fn name(&self) -> &Name {
        match self {
            Object::UVarDecl { name, .. }
            | Object::Postulate { name, .. }
            | Object::Definition { name, .. }
            | Object::Builtin { name, .. }
            | Object::Neutral { name, .. } => name,
        }
    }

    /// Type of the object when it can appear as a `Const` head.
    pub fn ty(&self) -> Option<Expr> {
        match self {
            Object::Postulate { ty, .. } | Object::Definition { ty, .. } => Some(ty.clone()),
            Object::Builtin { value, .. } => value.value().map(|v| v.ty()),
            Object::UVarDecl { .. } | Object::Neutral { .. } => None,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::UVarDecl { name, bound } => write!(f, "universe {name} >= {bound}"),
            Object::Postulate { name, ty } => write!(f, "axiom {name} : {ty:?}"),
            Object::Definition {
                name, ty, opaque, ..
            } => {
                if *opaque {
                    write!(f, "opaque definition {name} : {ty:?}")
                } else {
                    write!(f, "definition {name} : {ty:?}")
                }
            }
            Object::Builtin { name, .. } => write!(f, "builtin {name}"),
            Object::Neutral { name, kind_tag, .. } => write!(f, "neutral[{kind_tag}] {name}"),
        }
    }
}

#[derive(Default)]
struct EnvState {
    objects: Vec<Object>,
    index: HashMap<Name, usize>,
    uvars: HashMap<Name, Level>,
    uvar_order: Vec<Name>,
    geq_cache: HashMap<(Level, Level), bool>,
}

struct EnvCell {
    parent: Option<Env>,
    state: Mutex<EnvState>,
    children: AtomicU64,
}

impl Drop for EnvCell {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.0.children.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Cheaply clonable handle to an environment node.
#[derive(Clone)]
pub struct Env(Arc<EnvCell>);

/// Fresh root environment.
pub fn new_env() -> Env {
    Env::new()
}

impl Env {
    pub fn new() -> Env {
        Env(Arc::new(EnvCell {
            parent: None,
            state: Mutex::new(EnvState::default()),
            children: AtomicU64::new(0),
        }))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EnvState) -> R) -> R {
        let mut guard = self.0.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Identity comparison of environment nodes.
    pub fn ptr_eq(a: &Env, b: &Env) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    // ------------------------------------------------------------------
    // Parent/child structure
    // ------------------------------------------------------------------

    /// Fork a mutable child. The receiver becomes read-only until every
    /// child handle is dropped.
    pub fn mk_child(&self) -> Env {
        self.0.children.fetch_add(1, Ordering::AcqRel);
        Env(Arc::new(EnvCell {
            parent: Some(self.clone()),
            state: Mutex::new(EnvState::default()),
            children: AtomicU64::new(0),
        }))
    }

    pub fn parent(&self) -> Option<Env> {
        self.0.parent.clone()
    }

    /// Number of live children; the environment is writable iff this is 0.
    pub fn live_children(&self) -> u64 {
        self.0.children.load(Ordering::Acquire)
    }

    pub fn has_children(&self) -> bool {
        self.live_children() > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.has_children()
    }

    fn ensure_writable(&self) -> Result<(), KernelError> {
        if self.is_read_only() {
            Err(KernelError::ReadOnlyEnvironment { env: self.clone() })
        } else {
            Ok(())
        }
    }

    fn ensure_undeclared(&self, name: &Name) -> Result<(), KernelError> {
        if self.find_object(name).is_some() {
            Err(KernelError::AlreadyDeclared {
                env: self.clone(),
                name: name.clone(),
            })
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Declare a variable (a postulate with no value).
    pub fn add_var(&self, name: Name, ty: Expr) -> Result<(), KernelError> {
        self.add_postulate(name, ty)
    }

    /// Declare an axiom. Identical to `add_var` at the kernel level.
    pub fn add_axiom(&self, name: Name, ty: Expr) -> Result<(), KernelError> {
        self.add_postulate(name, ty)
    }

    fn add_postulate(&self, name: Name, ty: Expr) -> Result<(), KernelError> {
        self.ensure_writable()?;
        self.ensure_undeclared(&name)?;
        TypeChecker::new(self).ensure_type(&ty, &Context::new())?;
        debug!(name = %name, "declare postulate");
        self.insert(Object::Postulate { name, ty });
        Ok(())
    }

    /// Declare a definition. The value is checked against the declared type
    /// in the environment as it exists now; opaque definitions are never
    /// delta-unfolded.
    pub fn add_definition(
        &self,
        name: Name,
        ty: Expr,
        value: Expr,
        opaque: bool,
    ) -> Result<(), KernelError> {
        self.ensure_writable()?;
        self.ensure_undeclared(&name)?;
        let tc = TypeChecker::new(self);
        tc.ensure_type(&ty, &Context::new())?;
        tc.check(&value, &ty, &Context::new())
            .map_err(|e| match e {
                KernelError::DefTypeMismatch {
                    env,
                    expected,
                    given,
                    ..
                } => KernelError::DefTypeMismatch {
                    env,
                    name: Some(name.clone()),
                    expected,
                    given,
                },
                other => other,
            })?;
        debug!(name = %name, opaque, "declare definition");
        self.insert(Object::Definition {
            name,
            ty,
            value,
            opaque,
        });
        Ok(())
    }

    /// Register a builtin: a named embedded value.
    pub fn add_builtin(&self, name: Name, value: Expr) -> Result<(), KernelError> {
        debug_assert!(value.is_value(), "builtins are Expr::Value nodes");
        self.ensure_writable()?;
        self.ensure_undeclared(&name)?;
        debug!(name = %name, "declare builtin");
        self.insert(Object::Builtin { name, value });
        Ok(())
    }

    /// Store an opaque host payload under a name. The kernel never looks at
    /// the payload; hosts dispatch on `kind_tag`.
    pub fn add_neutral(
        &self,
        name: Name,
        kind_tag: &'static str,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), KernelError> {
        self.ensure_writable()?;
        self.ensure_undeclared(&name)?;
        self.insert(Object::Neutral {
            name,
            kind_tag,
            payload,
        });
        Ok(())
    }

    fn insert(&self, object: Object) {
        self.with_state(|s| {
            let idx = s.objects.len();
            s.index.insert(object.name().clone(), idx);
            if let Object::UVarDecl { name, bound } = &object {
                s.uvars.insert(name.clone(), bound.clone());
                s.uvar_order.push(name.clone());
            }
            s.objects.push(object);
        });
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Walk child → parent looking for `name`.
    pub fn find_object(&self, name: &Name) -> Option<Object> {
        let local = self.with_state(|s| s.index.get(name).map(|&i| s.objects[i].clone()));
        match local {
            Some(o) => Some(o),
            None => self.parent().and_then(|p| p.find_object(name)),
        }
    }

    /// Like `find_object`, failing with `UnknownName`.
    pub fn get_object(&self, name: &Name) -> Result<Object, KernelError> {
        self.find_object(name)
            .ok_or_else(|| KernelError::UnknownName {
                env: self.clone(),
                name: name.clone(),
            })
    }

    /// Objects declared in this node, in declaration order (parents not
    /// included; walk `parent()` for the full chain).
    pub fn objects(&self) -> Vec<Object> {
        self.with_state(|s| s.objects.clone())
    }

    /// Objects of the whole chain, root first, in declaration order.
    pub fn all_objects(&self) -> Vec<Object> {
        let mut out = match self.parent() {
            Some(p) => p.all_objects(),
            None => Vec::new(),
        };
        out.extend(self.objects());
        out
    }

    // ------------------------------------------------------------------
    // Universe variables
    // ------------------------------------------------------------------

    /// Declare a universe variable with lower bound `bound` (`name >= bound`).
    /// The bound may only mention previously declared universe variables,
    /// which keeps the constraint graph acyclic by construction.
    pub fn define_uvar(&self, name: Name, bound: Level) -> Result<(), KernelError> {
        self.ensure_writable()?;
        if self.uvar_bound(&name).is_some() {
            return Err(KernelError::AlreadyDeclaredUniverse {
                env: self.clone(),
                name,
            });
        }
        self.ensure_undeclared(&name)?;
        self.check_level_declared(&bound)?;
        debug!(name = %name, bound = %bound, "declare universe variable");
        self.insert(Object::UVarDecl { name, bound });
        Ok(())
    }

    /// Declared lower bound of a universe variable, walking the chain.
    pub fn uvar_bound(&self, name: &Name) -> Option<Level> {
        let local = self.with_state(|s| s.uvars.get(name).cloned());
        match local {
            Some(l) => Some(l),
            None => self.parent().and_then(|p| p.uvar_bound(name)),
        }
    }

    pub fn uvar_declared(&self, name: &Name) -> bool {
        self.uvar_bound(name).is_some()
    }

    /// Universe variables of the whole chain, in declaration order.
    pub fn uvar_names(&self) -> Vec<Name> {
        let mut out = match self.parent() {
            Some(p) => p.uvar_names(),
            None => Vec::new(),
        };
        out.extend(self.with_state(|s| s.uvar_order.clone()));
        out
    }

    /// Fail with `UnknownUniverseVariable` if `level` mentions an
    /// undeclared universe variable.
    pub fn check_level_declared(&self, level: &Level) -> Result<(), KernelError> {
        let mut params = Vec::new();
        level.collect_params(&mut params);
        for p in params {
            if !self.uvar_declared(&p) {
                return Err(KernelError::UnknownUniverseVariable {
                    env: self.clone(),
                    name: p,
                });
            }
        }
        Ok(())
    }

    /// Cumulativity query: `u >= v` derivable from the structural order plus
    /// the declared lower bounds. Memoized per environment node.
    pub fn is_ge(&self, u: &Level, v: &Level) -> Result<bool, KernelError> {
        self.check_level_declared(u)?;
        self.check_level_declared(v)?;
        let key = (u.clone(), v.clone());
        if let Some(hit) = self.with_state(|s| s.geq_cache.get(&key).copied()) {
            return Ok(hit);
        }
        let r = self.is_ge_core(u, v);
        self.with_state(|s| {
            s.geq_cache.insert(key, r);
        });
        Ok(r)
    }

    fn is_ge_core(&self, u: &Level, v: &Level) -> bool {
        if Level::is_geq(u, v) {
            return true;
        }
        let (base_u, off_u) = u.to_offset();
        let (base_v, off_v) = v.to_offset();
        // succ is monotone: strip matched offsets.
        if off_u > 0 && off_v > 0 {
            let k = off_u.min(off_v);
            return self.is_ge_core(&base_u.add_offset(off_u - k), &base_v.add_offset(off_v - k));
        }
        if let Level::Max(a, b) = base_u {
            if off_u == 0 && (self.is_ge_core(a, v) || self.is_ge_core(b, v)) {
                return true;
            }
        }
        if let Level::Max(a, b) = base_v {
            if off_v == 0 && self.is_ge_core(u, a) && self.is_ge_core(u, b) {
                return true;
            }
        }
        // u = p + off with declared p >= bound gives u >= bound + off.
        // Bounds only mention earlier declarations, so this terminates.
        if let Level::Param(p) = base_u {
            if let Some(bound) = self.uvar_bound(p) {
                if self.is_ge_core(&bound.add_offset(off_u), v) {
                    return true;
                }
            }
        }
        false
    }

    /// Positional universe instantiation for `Const(name, Some(levels))`:
    /// the given levels replace the first `levels.len()` universe variables
    /// of the chain in declaration order.
    pub fn level_subst(&self, levels: &[Level]) -> Vec<(Name, Level)> {
        self.uvar_names()
            .into_iter()
            .zip(levels.iter().cloned())
            .collect()
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.with_state(|s| s.objects.len());
        write!(
            f,
            "Env {{ objects: {n}, children: {}, parent: {} }}",
            self.live_children(),
            self.0.parent.is_some()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{mk_const, mk_sort};
    use crate::level::Level;

    fn nm(s: &str) -> Name {
        Name::from_string(s)
    }

    fn ty0() -> Expr {
        mk_sort(Level::of(1))
    }

    #[test]
    fn test_add_and_find() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();
        let o = env.find_object(&nm("A")).unwrap();
        assert_eq!(o.name(), &nm("A"));
        assert!(env.find_object(&nm("B")).is_none());
        assert!(matches!(
            env.get_object(&nm("B")),
            Err(KernelError::UnknownName { .. })
        ));
    }

    #[test]
    fn test_duplicate_declaration() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();
        assert!(matches!(
            env.add_var(nm("A"), ty0()),
            Err(KernelError::AlreadyDeclared { .. })
        ));
    }

    #[test]
    fn test_child_sees_parent_and_freezes_it() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();

        let child = env.mk_child();
        assert!(env.is_read_only());
        assert!(matches!(
            env.add_var(nm("B"), ty0()),
            Err(KernelError::ReadOnlyEnvironment { .. })
        ));

        // the child sees the parent's objects and can declare its own
        assert!(child.find_object(&nm("A")).is_some());
        child.add_var(nm("B"), ty0()).unwrap();
        assert!(child.find_object(&nm("B")).is_some());
        // ... which the parent does not see
        assert!(env.find_object(&nm("B")).is_none());

        // dropping the child unfreezes the parent
        drop(child);
        assert!(!env.is_read_only());
        env.add_var(nm("C"), ty0()).unwrap();
    }

    #[test]
    fn test_child_may_not_shadow_parent() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();
        let child = env.mk_child();
        assert!(matches!(
            child.add_var(nm("A"), ty0()),
            Err(KernelError::AlreadyDeclared { .. })
        ));
    }

    #[test]
    fn test_uvar_order_and_bounds() {
        let env = Env::new();
        env.define_uvar(nm("u"), Level::of(1)).unwrap();
        env.define_uvar(nm("w"), Level::param(nm("u")).add_offset(1))
            .unwrap();

        let u = Level::param(nm("u"));
        let w = Level::param(nm("w"));
        // u >= 1 by declaration, w >= u + 1 by declaration
        assert!(env.is_ge(&u, &Level::of(1)).unwrap());
        assert!(env.is_ge(&w, &u.add_offset(1)).unwrap());
        assert!(env.is_ge(&w, &Level::of(2)).unwrap());
        // the converse is not derivable
        assert!(!env.is_ge(&u, &w).unwrap());
        assert!(!env.is_ge(&u, &u.add_offset(1)).unwrap());
    }

    #[test]
    fn test_uvar_errors() {
        let env = Env::new();
        env.define_uvar(nm("u"), Level::zero()).unwrap();
        assert!(matches!(
            env.define_uvar(nm("u"), Level::zero()),
            Err(KernelError::AlreadyDeclaredUniverse { .. })
        ));
        assert!(matches!(
            env.define_uvar(nm("v"), Level::param(nm("zzz"))),
            Err(KernelError::UnknownUniverseVariable { .. })
        ));
        assert!(matches!(
            env.is_ge(&Level::param(nm("zzz")), &Level::zero()),
            Err(KernelError::UnknownUniverseVariable { .. })
        ));
    }

    #[test]
    fn test_objects_in_declaration_order() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();
        env.add_var(nm("B"), ty0()).unwrap();
        let names: Vec<_> = env
            .objects()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_definition_requires_well_typed_value() {
        let env = Env::new();
        env.add_var(nm("A"), ty0()).unwrap();
        // B : Sort 1 := A  is fine (A : Sort 1)
        env.add_definition(nm("B"), ty0(), mk_const(nm("A")), false)
            .unwrap();
        // C : A := A  is not (A's type is Sort 1, not A)
        let err = env.add_definition(nm("C"), mk_const(nm("A")), mk_const(nm("A")), false);
        assert!(matches!(
            err,
            Err(KernelError::DefTypeMismatch { name: Some(n), .. }) if n == nm("C")
        ));
    }
}
