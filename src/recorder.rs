//! Dependency recorder: a thread-local, pooled, stack-structured buffer
//! that records which properties a derived getter reads.

use crate::subject::PropertyReference;
use std::cell::RefCell;

const INITIAL_FRAME_CAPACITY: usize = 8;

struct Pool {
    buffers: Vec<Vec<PropertyReference>>,
}

impl Pool {
    fn rent(&mut self) -> Vec<PropertyReference> {
        self.buffers.pop().unwrap_or_else(|| Vec::with_capacity(INITIAL_FRAME_CAPACITY))
    }

    fn give_back(&mut self, mut buf: Vec<PropertyReference>) {
        buf.clear();
        self.buffers.push(buf);
    }
}

struct RecorderState {
    pool: Pool,
    frames: Vec<Vec<PropertyReference>>,
    /// The most recently finished frame, held until [`clear_last`] releases
    /// it back to the pool. Kept distinct from `frames` so a caller can
    /// read the recording (`store_recorded`'s several passes over it)
    /// before explicitly releasing it.
    last_finished: Option<Vec<PropertyReference>>,
}

thread_local! {
    static RECORDER: RefCell<RecorderState> = RefCell::new(RecorderState {
        pool: Pool { buffers: Vec::new() },
        frames: Vec::new(),
        last_finished: None,
    });
}

/// Pushes a fresh recording frame, renting a pooled buffer. Recording
/// nests: a derived getter that reads another derived property keeps the
/// outer frame on the stack while the inner one accumulates independently.
pub fn start_recording() {
    RECORDER.with(|r| {
        let mut state = r.borrow_mut();
        let buf = state.pool.rent();
        state.frames.push(buf);
    });
}

/// `true` if a recording frame is currently active on this thread.
pub fn is_recording() -> bool {
    RECORDER.with(|r| !r.borrow().frames.is_empty())
}

/// Appends `property` to the top frame, deduplicated by a linear scan —
/// frames are small in practice (a derived getter typically touches a
/// handful of base properties), so this beats hashing. A no-op if no
/// frame is active.
pub fn touch(property: PropertyReference) {
    RECORDER.with(|r| {
        let mut state = r.borrow_mut();
        if let Some(frame) = state.frames.last_mut() {
            if !frame.contains(&property) {
                frame.push(property);
            }
        }
    });
}

/// Pops the top frame and holds its contents as "the last finished
/// recording", returning a copy for immediate use. The recording stays
/// available (for further inspection) until [`clear_last`] releases it
/// back to the pool. Panics if no frame is active — a recorder stack
/// underflow is a bug in the engine, not a caller mistake, per the "fatal"
/// policy for invariant violations.
pub fn finish_recording() -> Vec<PropertyReference> {
    RECORDER.with(|r| {
        let mut state = r.borrow_mut();
        let frame = state.frames.pop().expect("recorder stack underflow: finish without start");
        let result = frame.clone();
        if let Some(stale) = state.last_finished.replace(frame) {
            state.pool.give_back(stale);
        }
        result
    })
}

/// Releases the most recently finished recording back to the buffer pool,
/// dropping any subject references it retained. Safe to call even if
/// nothing is held.
pub fn clear_last() {
    RECORDER.with(|r| {
        let mut state = r.borrow_mut();
        if let Some(buf) = state.last_finished.take() {
            state.pool.give_back(buf);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectId;

    fn prop(name: &'static str) -> PropertyReference {
        PropertyReference::new(SubjectId::next(), name)
    }

    #[test]
    fn records_and_deduplicates_within_a_frame() {
        start_recording();
        let p = prop("FirstName");
        touch(p);
        touch(p);
        touch(prop("LastName"));
        let recorded = finish_recording();
        assert_eq!(recorded.len(), 2);
    }

    #[test]
    fn nested_frames_stay_independent() {
        start_recording();
        let outer = prop("Outer");
        touch(outer);
        start_recording();
        let inner = prop("Inner");
        touch(inner);
        let inner_recorded = finish_recording();
        assert_eq!(inner_recorded, vec![inner]);
        touch(prop("OuterAgain"));
        let outer_recorded = finish_recording();
        assert_eq!(outer_recorded.len(), 2);
    }

    #[test]
    fn touch_without_recording_is_a_harmless_no_op() {
        assert!(!is_recording());
        touch(prop("Ignored"));
    }

    #[test]
    fn clear_last_is_idempotent() {
        start_recording();
        touch(prop("X"));
        finish_recording();
        clear_last();
        clear_last();
    }
}
