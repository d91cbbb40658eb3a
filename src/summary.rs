//! Summary reduction of per-stream contributions.
//!
//! A `SummaryReducer` wraps the shared accumulator of one summary scope.
//! Folds from streams are serialized through a mutex; the global finalize
//! runs exactly once, after which no further fold is accepted.
//!
//! Fold order across streams is unspecified. Client fold functions must be
//! commutative and associative; `replay_orders_agree` checks that property
//! for a given set of contributions.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{ContractViolation, Result};

pub struct SummaryReducer<T> {
    value: Mutex<T>,
    folds: AtomicU64,
    finalized: AtomicBool,
}

impl<T> SummaryReducer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            folds: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    /// Fold one stream's contribution into the accumulator.
    /// At most one fold runs at a time.
    pub fn fold<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| ContractViolation::ordering("summary accumulator poisoned by a failed fold"))?;
        if self.finalized.load(Ordering::SeqCst) {
            return Err(ContractViolation::ordering("stream end-summary fold after global finalize").into());
        }
        let out = f(&mut *value)?;
        self.folds.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }

    /// Run the global finalize hook. A second call is a double invocation.
    pub fn finalize<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| ContractViolation::ordering("summary accumulator poisoned by a failed fold"))?;
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(ContractViolation::ordering("summary finalize invoked twice").into());
        }
        f(&mut *value)
    }

    pub fn fold_count(&self) -> u64 {
        self.folds.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Consume the reducer and return the accumulated value
    pub fn into_inner(self) -> T {
        match self.value.into_inner() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fold `contributions` in forward and reverse order from `initial` and
/// report whether both orders produce the same accumulator.
pub fn replay_orders_agree<T, C>(initial: T, contributions: &[C], fold: impl Fn(&mut T, &C)) -> bool
where
    T: Clone + PartialEq,
{
    let mut forward = initial.clone();
    for c in contributions {
        fold(&mut forward, c);
    }
    let mut reverse = initial;
    for c in contributions.iter().rev() {
        fold(&mut reverse, c);
    }
    forward == reverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;
    use std::sync::Arc;

    #[test]
    fn test_fold_then_finalize() {
        let r = SummaryReducer::new(0u32);
        r.fold(|acc| {
            *acc += 3;
            Ok(())
        })
        .unwrap();
        r.fold(|acc| {
            *acc += 4;
            Ok(())
        })
        .unwrap();
        let total = r.finalize(|acc| Ok(*acc)).unwrap();
        assert_eq!(total, 7);
        assert_eq!(r.fold_count(), 2);
        assert!(r.is_finalized());
    }

    #[test]
    fn test_fold_after_finalize_rejected() {
        let r = SummaryReducer::new(0u32);
        r.finalize(|_| Ok(())).unwrap();
        let err = r.fold(|acc| {
            *acc += 1;
            Ok(())
        });
        assert!(err.unwrap_err().is_violation(ViolationKind::Ordering));
    }

    #[test]
    fn test_double_finalize_rejected() {
        let r = SummaryReducer::new(0u32);
        r.finalize(|_| Ok(())).unwrap();
        assert!(r.finalize(|_| Ok(())).is_err());
    }

    #[test]
    fn test_concurrent_folds_are_serialized() {
        // Non-atomic read-modify-write: only correct if folds never overlap
        let r = Arc::new(SummaryReducer::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        r.fold(|acc| {
                            let current = *acc;
                            std::hint::black_box(current);
                            *acc = current + i;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let r = Arc::try_unwrap(r).ok().unwrap();
        assert_eq!(r.fold_count(), 4000);
        assert_eq!(r.into_inner(), 500 * (0..8).sum::<u64>());
    }

    #[test]
    fn test_replay_orders_agree_for_sum() {
        assert!(replay_orders_agree(0u32, &[3, 5, 9, 1], |acc, c| *acc += c));
    }

    #[test]
    fn test_replay_orders_detect_order_dependence() {
        // "last writer wins" is not order independent
        assert!(!replay_orders_agree(0u32, &[3, 5], |acc, c| *acc = *c));
    }

    #[test]
    fn test_failed_fold_not_counted() {
        let r = SummaryReducer::new(0u32);
        let err = r.fold(|_| -> Result<()> { Err(ContractViolation::count("bad contribution").into()) });
        assert!(err.is_err());
        assert_eq!(r.fold_count(), 0);
    }
}
