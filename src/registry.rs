//! A process-global registry of live loops.
//!
//! Some events concern every loop in the process at once, the canonical one being "the machine
//! just woke from suspend, recompute your deadlines". Whoever detects such an event calls
//! [wake_all_loops](fn.wake_all_loops.html) and every registered loop gets its waker nudged; the
//! loops then notice on their own that time has jumped.
//!
//! The registry is initialized lazily under a one-shot guard and is read-mostly. Entries hold
//! nothing but the loop's id and a clone of its waker, so no loop internals are ever touched from
//! a foreign thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use mio::Waker;

struct Entry {
    id: u64,
    waker: Arc<Waker>,
}

lazy_static! {
    static ref LOOPS: Mutex<Vec<Entry>> = Mutex::new(Vec::new());
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(0);

/// Register a freshly created loop. Returns the id to deregister with later.
pub(crate) fn register(waker: Arc<Waker>) -> u64 {
    let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
    LOOPS.lock().unwrap().push(Entry { id, waker });
    id
}

/// Forget a loop that is going away. Unknown ids are ignored.
pub(crate) fn unregister(id: u64) {
    let mut loops = LOOPS.lock().unwrap();
    if let Some(pos) = loops.iter().position(|e| e.id == id) {
        loops.swap_remove(pos);
    }
}

/// Nudge every live loop's waker.
///
/// Safe to call from any thread. Each loop treats the nudge like any other spurious wakeup: it
/// refreshes its cached time and re-evaluates its timers, which is exactly what a wake-from-
/// suspend notification needs.
pub fn wake_all_loops() {
    let loops = LOOPS.lock().unwrap();
    for entry in loops.iter() {
        // A failed nudge means the loop is being torn down right now; nothing to do about it.
        let _ = entry.waker.wake();
    }
}
