//! Transaction coordinator: captures writes made inside a transaction and
//! replays them on commit, or discards them on abort.

use crate::change;
use crate::error::{Error, Result};
use crate::metadata::DynValue;
use crate::subject::PropertyReference;
use std::cell::RefCell;

/// One write captured while a transaction was in the `Capturing` state.
struct CapturedWrite {
    property: PropertyReference,
    pre_capture_value: DynValue,
    apply: Box<dyn FnOnce() + Send>,
    restore: Box<dyn FnOnce() + Send>,
}

/// The transaction coordinator's state machine, per `spec.md` §4.10.
enum TransactionState {
    Idle,
    Capturing { writes: Vec<CapturedWrite> },
    Committing,
    Aborting,
}

thread_local! {
    static TRANSACTION: RefCell<TransactionState> = RefCell::new(TransactionState::Idle);
}

/// `true` while a transaction is open and not yet committing — the state
/// in which non-derived writes are captured rather than propagated.
pub fn is_capturing() -> bool {
    TRANSACTION.with(|t| matches!(&*t.borrow(), TransactionState::Capturing { .. }))
}

/// `true` while a commit is replaying captured writes.
pub fn is_committing() -> bool {
    TRANSACTION.with(|t| matches!(&*t.borrow(), TransactionState::Committing))
}

/// Begins a transaction on this thread. Panics if one is already open —
/// nested transactions aren't part of the model; a caller that needs
/// scoping should finish or abort the outer transaction first.
pub fn begin() {
    TRANSACTION.with(|t| {
        let mut state = t.borrow_mut();
        assert!(matches!(&*state, TransactionState::Idle), "a transaction is already open");
        *state = TransactionState::Capturing { writes: Vec::new() };
    });
}

/// Records a write made while capturing. `apply` performs the terminal
/// storage if later replayed during commit; `restore` undoes it if the
/// transaction aborts instead.
pub fn capture(
    property: PropertyReference,
    pre_capture_value: DynValue,
    apply: impl FnOnce() + Send + 'static,
    restore: impl FnOnce() + Send + 'static,
) {
    TRANSACTION.with(|t| {
        let mut state = t.borrow_mut();
        if let TransactionState::Capturing { writes } = &mut *state {
            writes.push(CapturedWrite {
                property,
                pre_capture_value,
                apply: Box::new(apply),
                restore: Box::new(restore),
            });
        }
    });
}

/// Checks a caller-supplied expected timestamp against the actual
/// per-property timestamp at capture time, raising
/// [`Error::ConcurrencyConflict`] on mismatch without capturing the write.
pub fn check_conflict(
    property: &'static str,
    expected: u64,
    actual: u64,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ConcurrencyConflict { property, expected, actual })
    }
}

/// Commits the open transaction: replays every captured write in
/// insertion order with the change context's commit flag set, so derived
/// propagation runs normally for each. Each replayed write's dependent
/// recomputations complete before the next replay starts, since replay is
/// a synchronous in-order loop on the committing thread.
pub fn commit() {
    let writes = TRANSACTION.with(|t| {
        let mut state = t.borrow_mut();
        match std::mem::replace(&mut *state, TransactionState::Committing) {
            TransactionState::Capturing { writes } => writes,
            other => {
                *state = other;
                panic!("commit called with no open transaction");
            }
        }
    });
    tracing::debug!(count = writes.len(), "replaying captured writes on commit");
    change::with_committing(|| {
        for write in writes {
            (write.apply)();
        }
    });
    TRANSACTION.with(|t| *t.borrow_mut() = TransactionState::Idle);
}

/// Aborts the open transaction: discards every captured write and runs
/// each one's `restore` closure to return the graph to its pre-capture
/// state.
pub fn abort() {
    let writes = TRANSACTION.with(|t| {
        let mut state = t.borrow_mut();
        match std::mem::replace(&mut *state, TransactionState::Aborting) {
            TransactionState::Capturing { writes } => writes,
            other => {
                *state = other;
                panic!("abort called with no open transaction");
            }
        }
    });
    tracing::debug!(count = writes.len(), "aborting transaction, restoring pre-capture values");
    for write in writes.into_iter().rev() {
        let _ = &write.pre_capture_value;
        (write.restore)();
    }
    TRANSACTION.with(|t| *t.borrow_mut() = TransactionState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectId;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn capture_then_commit_applies_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        begin();
        assert!(is_capturing());
        for i in 0..3 {
            let log = log.clone();
            capture(
                PropertyReference::new(SubjectId::next(), "X"),
                DynValue::new(0i32),
                move || log.lock().unwrap().push(i),
                || {},
            );
        }
        commit();
        assert!(!is_capturing());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn capture_then_abort_runs_restore_not_apply() {
        let applied = Arc::new(AtomicI32::new(0));
        let restored = Arc::new(AtomicI32::new(0));
        begin();
        {
            let applied = applied.clone();
            let restored = restored.clone();
            capture(
                PropertyReference::new(SubjectId::next(), "X"),
                DynValue::new(0i32),
                move || {
                    applied.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    restored.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        abort();
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conflict_check_matches_raises_error() {
        assert!(check_conflict("X", 5, 5).is_ok());
        assert!(matches!(
            check_conflict("X", 5, 6),
            Err(Error::ConcurrencyConflict { expected: 5, actual: 6, .. })
        ));
    }
}
