//! Worker threads and their work queues.
//!
//! Each worker owns a FIFO of requests, a mutex, and a condition variable.
//! The thread holds the mutex except while waiting for work or while
//! dispatching an item; a dispatched item still counts toward the queue
//! length so the schedulers see in-flight work.
//!
//! Workers may carry a nonzero *group* tag (the identity of a serial bus);
//! the group scheduler pins all requests for one bus onto one worker so
//! the bus never sees lock contention from the request path.

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::request::Request;
use crate::config::MAX_WORKERS;
use crate::error::{DriverError, Result};

pub type Dispatcher = Arc<dyn Fn(Request) + Send + Sync>;

/// Queue state shared between a worker thread and the schedulers.
pub struct WorkerShared {
    queue: Mutex<VecDeque<Request>>,
    signal: Condvar,
    group: AtomicU32,
    in_flight: AtomicBool,
    shutdown: AtomicBool,
}

impl WorkerShared {
    fn new(group: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            group: AtomicU32::new(group),
            in_flight: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> u32 {
        self.group.load(Ordering::Acquire)
    }

    pub fn set_group(&self, group: u32) {
        self.group.store(group, Ordering::Release);
    }

    /// Queued plus in-flight work.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len() + usize::from(self.in_flight.load(Ordering::Acquire))
    }

    pub fn enqueue(&self, request: Request) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(request);
        if queue.len() == 1 {
            // Empty → non-empty: the thread may be asleep.
            self.signal.notify_one();
        }
    }

    fn stop(&self) {
        // Taken under the queue lock so a worker between its shutdown
        // check and its wait cannot miss the wakeup.
        let _queue = self.queue.lock().unwrap();
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify_one();
    }
}

fn worker_thread(shared: &WorkerShared, dispatcher: &Dispatcher) {
    let mut queue = shared.queue.lock().unwrap();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Some(request) = queue.pop_front() {
            shared.in_flight.store(true, Ordering::Release);
            drop(queue);
            dispatcher(request);
            shared.in_flight.store(false, Ordering::Release);
            queue = shared.queue.lock().unwrap();
        } else {
            queue = shared.signal.wait(queue).unwrap();
        }
    }
}

/// Handle for a live worker: generation guards against slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId {
    pub index: u16,
    pub generation: u32,
}

struct PoolSlot {
    generation: u32,
    shared: Option<Arc<WorkerShared>>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed-capacity pool of worker threads.
pub struct WorkerPool {
    slots: Mutex<Vec<PoolSlot>>,
    dispatcher: Dispatcher,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(dispatcher: Dispatcher, max_workers: usize) -> Self {
        let max_workers = max_workers.min(MAX_WORKERS);
        let slots = (0..max_workers)
            .map(|_| PoolSlot {
                generation: 0,
                shared: None,
                thread: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            dispatcher,
            max_workers,
        }
    }

    /// Spawn a worker in the first free slot.
    pub fn add_worker(&self, group: u32) -> Result<(WorkerId, Arc<WorkerShared>)> {
        let mut slots = self.slots.lock().unwrap();
        let Some(index) = slots.iter().position(|s| s.shared.is_none()) else {
            warn!("workers: all {} slots busy", self.max_workers);
            return Err(DriverError::TooMany);
        };

        let shared = Arc::new(WorkerShared::new(group));
        let for_thread = Arc::clone(&shared);
        let dispatcher = Arc::clone(&self.dispatcher);
        let thread = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || worker_thread(&for_thread, &dispatcher))
            .map_err(|_| DriverError::TooMany)?;

        let slot = &mut slots[index];
        slot.generation += 1;
        slot.shared = Some(Arc::clone(&shared));
        slot.thread = Some(thread);
        debug!("workers: spawned worker {index} (group {group})");
        Ok((
            WorkerId {
                index: index as u16,
                generation: slot.generation,
            },
            shared,
        ))
    }

    /// Snapshot of all live workers.
    pub fn workers(&self) -> Vec<Arc<WorkerShared>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.shared.clone())
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.shared.is_some())
            .count()
    }

    /// Stop every worker and join its thread.  Queued requests are dropped;
    /// their reply channels close, which callers observe as disconnects.
    pub fn shutdown(&self) {
        let mut threads = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.iter_mut() {
                if let Some(shared) = slot.shared.take() {
                    shared.stop();
                }
                if let Some(thread) = slot.thread.take() {
                    threads.push(thread);
                }
            }
        }
        for thread in threads {
            let _ = thread.join();
        }
    }
}
