use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identifies a registered callback. Ids are unique for the whole process,
/// so an id handed out by one object is never valid on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

// 0 is never handed out
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A list of callbacks of one kind.
///
/// Emitting takes a snapshot and invokes it with no lock held, so a
/// callback may add or remove handlers, including itself.
pub(crate) struct HandlerList<F: ?Sized> {
    entries: Mutex<Vec<(HandlerId, Arc<F>)>>,
}

impl<F: ?Sized> HandlerList<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: Arc<F>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.lock().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.lock().iter().map(|(_, handler)| handler.clone()).collect()
    }
}
