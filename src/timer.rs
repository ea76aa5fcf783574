//! Single-threaded absolute-time callback service.
//!
//! Callers submit `(deadline, callback)` pairs and receive an opaque id that
//! can later cancel the entry.  Entries are kept ordered by deadline; one
//! dedicated thread sleeps until the earliest deadline, pops it, runs the
//! callback synchronously, and re-arms from the new head.
//!
//! Be nice in callbacks: this single thread drives every device's
//! motion-completion check.  Anything that takes long must be offloaded to a
//! worker instead of running here.

use log::trace;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Opaque handle for a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallbackId(u64);

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Pending {
    /// Ordered by (deadline, id) so two entries with an equal deadline keep
    /// submission order.
    entries: BTreeMap<(Instant, u64), Callback>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    wakeup: Condvar,
}

/// The callback-timer service.  Create one per process and share it by `Arc`.
pub struct CallbackTimer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackTimer {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wakeup: Condvar::new(),
        });

        let for_thread = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("callback-timer".into())
            .spawn(move || timer_thread(&for_thread))
            .expect("spawning the timer thread");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `callback` to run at the absolute time `deadline`.
    pub fn submit_at(&self, deadline: Instant, callback: Callback) -> CallbackId {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.next_id += 1;
        let id = pending.next_id;
        pending.entries.insert((deadline, id), callback);
        trace!("timer: scheduled #{id}");

        // Wake the thread in case the new entry became the head.
        self.shared.wakeup.notify_one();
        CallbackId(id)
    }

    /// Schedule `callback` to run after `delay`.
    pub fn submit_in(&self, delay: Duration, callback: Callback) -> CallbackId {
        self.submit_at(Instant::now() + delay, callback)
    }

    /// Cancel a pending callback.  Returns `false` if it already ran or was
    /// cancelled before.
    pub fn cancel(&self, id: CallbackId) -> bool {
        let mut pending = self.shared.pending.lock().unwrap();
        let key = pending
            .entries
            .keys()
            .find(|(_, entry_id)| *entry_id == id.0)
            .copied();
        match key {
            Some(key) => {
                pending.entries.remove(&key);
                // If the head was removed, the thread re-arms from whatever
                // is now first.
                self.shared.wakeup.notify_one();
                true
            }
            None => false,
        }
    }

    /// Number of callbacks not yet fired.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().unwrap().entries.len()
    }

    /// Stop the timer thread and drop all pending callbacks without running
    /// them.
    pub fn shutdown(&self) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.shutdown = true;
            pending.entries.clear();
        }
        self.shared.wakeup.notify_one();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn timer_thread(shared: &Shared) {
    let mut pending = shared.pending.lock().unwrap();
    loop {
        if pending.shutdown {
            return;
        }

        let Some((&(deadline, id), _)) = pending.entries.iter().next() else {
            pending = shared.wakeup.wait(pending).unwrap();
            continue;
        };

        let now = Instant::now();
        if deadline > now {
            let (relocked, _) = shared
                .wakeup
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = relocked;
            // Head may have changed while waiting; re-evaluate.
            continue;
        }

        let callback = pending
            .entries
            .remove(&(deadline, id))
            .expect("head entry present");
        trace!("timer: firing #{id}");

        // Run the callback without holding the lock so it may submit or
        // cancel entries itself.
        drop(pending);
        callback();
        pending = shared.pending.lock().unwrap();
    }
}
