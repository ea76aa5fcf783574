//! Request scheduling: which worker gets an inbound request.
//!
//! Two policies share one signature.  `least_busy` spreads load by queue
//! length.  `driver_group` (the default) resolves the target motor and
//! pins its request to the worker owning that motor's bus group, spawning
//! and tagging a new worker for a group seen for the first time — so all
//! requests for motors sharing a serial port serialize on one thread while
//! different ports run in parallel.

use log::{debug, warn};
use std::sync::Arc;

use super::request::Request;
use super::worker::WorkerPool;
use crate::config::SchedulerPolicy;
use crate::driver::MotorTable;
use crate::error::{DriverError, Result};

pub struct Scheduler {
    pool: Arc<WorkerPool>,
    motors: Arc<MotorTable>,
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>, motors: Arc<MotorTable>, policy: SchedulerPolicy) -> Self {
        Self {
            pool,
            motors,
            policy,
        }
    }

    /// Hand `request` to a worker.
    pub fn schedule(&self, request: Request) -> Result<()> {
        match self.policy {
            SchedulerPolicy::LeastBusy => self.least_busy(request),
            SchedulerPolicy::DriverGroup => self.driver_group(request),
        }
    }

    /// Enqueue on the first idle worker, or the one with the shortest
    /// queue.  Fails only when no workers exist at all.
    fn least_busy(&self, request: Request) -> Result<()> {
        let workers = self.pool.workers();

        if let Some(idle) = workers.iter().find(|w| w.queue_len() == 0) {
            idle.enqueue(request);
            return Ok(());
        }

        match workers.iter().min_by_key(|w| w.queue_len()) {
            Some(worker) => {
                worker.enqueue(request);
                Ok(())
            }
            None => {
                warn!("scheduler: no workers to take the request");
                Err(DriverError::TooMany)
            }
        }
    }

    /// Pin the request to the worker owning the target motor's bus group.
    /// Requests for unconnected motors (connect itself, search) fall back
    /// to `least_busy` — the seed worker guarantees they land somewhere.
    fn driver_group(&self, request: Request) -> Result<()> {
        let group = request
            .motor_id()
            .and_then(|id| self.motors.driver(id).ok())
            .map(|driver| driver.group())
            .unwrap_or(0);
        if group == 0 {
            return self.least_busy(request);
        }

        if let Some(worker) = self
            .pool
            .workers()
            .into_iter()
            .find(|w| w.group() == group)
        {
            worker.enqueue(request);
            return Ok(());
        }

        debug!("scheduler: creating worker for group {group}");
        match self.pool.add_worker(group) {
            Ok((_, worker)) => {
                worker.enqueue(request);
                Ok(())
            }
            // The pool is full; serialize through the busiest-but-alive
            // path rather than dropping the request.
            Err(_) => self.least_busy(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_WORKERS;
    use crate::daemon::worker::Dispatcher;
    use crate::driver::{DriverRegistry, MotorId};
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn idle_dispatcher() -> (Dispatcher, Arc<Mutex<Vec<Request>>>) {
        let taken = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&taken);
        let dispatcher: Dispatcher = Arc::new(move |req| {
            sink.lock().unwrap().push(req);
        });
        (dispatcher, taken)
    }

    fn motors() -> Arc<MotorTable> {
        Arc::new(MotorTable::new(Arc::new(DriverRegistry::new())))
    }

    fn connect_request() -> Request {
        let (tx, _rx) = mpsc::channel();
        std::mem::forget(_rx);
        Request::Connect {
            cxn: "mdrive:///dev/ttyS0".into(),
            reply: tx,
        }
    }

    #[test]
    fn least_busy_fails_with_no_workers() {
        let (dispatcher, _) = idle_dispatcher();
        let pool = Arc::new(WorkerPool::new(dispatcher, MAX_WORKERS));
        let sched = Scheduler::new(pool, motors(), SchedulerPolicy::LeastBusy);
        assert!(sched.schedule(connect_request()).is_err());
    }

    #[test]
    fn least_busy_prefers_idle_worker() {
        let (dispatcher, _) = idle_dispatcher();
        let pool = Arc::new(WorkerPool::new(dispatcher, MAX_WORKERS));
        pool.add_worker(0).unwrap();
        let sched = Scheduler::new(Arc::clone(&pool), motors(), SchedulerPolicy::LeastBusy);
        assert!(sched.schedule(connect_request()).is_ok());
        pool.shutdown();
    }

    #[test]
    fn group_policy_falls_back_for_unconnected_motor() {
        let (dispatcher, _) = idle_dispatcher();
        let pool = Arc::new(WorkerPool::new(dispatcher, MAX_WORKERS));
        pool.add_worker(0).unwrap();
        let sched = Scheduler::new(Arc::clone(&pool), motors(), SchedulerPolicy::DriverGroup);

        // Unknown motor id → no group → least-busy path.
        let (tx, _rx) = mpsc::channel();
        let req = Request::Reset {
            motor: MotorId {
                index: 3,
                generation: 9,
            },
            reply: tx,
        };
        assert!(sched.schedule(req).is_ok());
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown();
    }
}
