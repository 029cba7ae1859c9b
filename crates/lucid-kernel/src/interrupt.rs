//! Cooperative cancellation and step budgets
//!
//! Kernel traversals run to completion; there is no preemption. Long-running
//! operations (normalization, conversion, unification, sharing passes)
//! instead poll an [`InterruptFlag`] once per recursive descent and abort
//! with [`KernelError::Interrupted`] when it is set. The flag is a cloneable
//! token passed down the call chain rather than a thread-local registry, so
//! a caller can cancel exactly the computation it started.

use crate::error::KernelError;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation token.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The next cooperative check fails with
    /// `Interrupted`; the computation is not preempted synchronously.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clear the flag so the owner can resume issuing kernel calls.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Cooperative check point.
    pub fn check(&self) -> Result<(), KernelError> {
        if self.is_set() {
            Err(KernelError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Per-call step counter for traversals that must stay bounded even on
/// adversarial inputs (full normalization, sharing passes).
#[derive(Debug)]
pub struct StepBudget {
    remaining: Cell<u64>,
}

impl StepBudget {
    pub fn new(max_steps: u64) -> Self {
        StepBudget {
            remaining: Cell::new(max_steps),
        }
    }

    /// Effectively unbounded budget.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// Consume one step, failing with `MaxStepsExceeded` once exhausted.
    pub fn step(&self) -> Result<(), KernelError> {
        let r = self.remaining.get();
        if r == 0 {
            return Err(KernelError::MaxStepsExceeded);
        }
        self.remaining.set(r - 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        let flag = InterruptFlag::new();
        assert!(flag.check().is_ok());
        flag.set();
        assert!(matches!(flag.check(), Err(KernelError::Interrupted)));
        flag.clear();
        assert!(flag.check().is_ok());
    }

    #[test]
    fn test_step_budget_exhaustion() {
        let budget = StepBudget::new(2);
        assert!(budget.step().is_ok());
        assert!(budget.step().is_ok());
        assert!(matches!(
            budget.step(),
            Err(KernelError::MaxStepsExceeded)
        ));
    }
}
