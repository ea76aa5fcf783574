//! Daemon assembly: registry, motor table, workers, scheduler.
//!
//! ```text
//!   client transport ──▶ Daemon::submit ──▶ Scheduler ──▶ Worker ──▶ dispatch
//!                                                                     │
//!                                       MotorTable ◀── driver calls ◀─┘
//! ```
//!
//! The client transport itself lives outside this crate; everything from
//! [`Daemon::submit`] inward is the daemon proper.

pub mod request;
pub mod scheduler;
pub mod worker;

use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::driver::{DriverRegistry, MotorTable};
use crate::mdrive::port::{SerialBackend, SystemSerial};
use crate::mdrive::{CommSettings, MdriveClass};
use crate::timer::CallbackTimer;
use request::{DaemonContext, Request};
use scheduler::Scheduler;
use worker::{Dispatcher, WorkerPool};

/// One running daemon instance.
pub struct Daemon {
    registry: Arc<DriverRegistry>,
    motors: Arc<MotorTable>,
    pool: Arc<WorkerPool>,
    scheduler: Scheduler,
    timer: Arc<CallbackTimer>,
}

impl Daemon {
    /// Build a daemon against the host's real serial ports.
    pub fn new(config: &DaemonConfig) -> Self {
        Self::with_backend(config, Arc::new(SystemSerial))
    }

    /// Build a daemon against any serial backend.  Tests substitute a
    /// simulated bus here.
    pub fn with_backend(config: &DaemonConfig, backend: Arc<dyn SerialBackend>) -> Self {
        let timer = CallbackTimer::new();
        let registry = Arc::new(DriverRegistry::new());

        registry.register(Arc::new(MdriveClass::new(
            backend,
            Arc::clone(&timer),
            CommSettings {
                min_tx_gap: config.min_tx_gap(),
                max_retries: config.max_retries,
            },
            config.default_port_speed,
        )));

        let motors = Arc::new(MotorTable::new(Arc::clone(&registry)));

        let context = Arc::new(DaemonContext {
            motors: Arc::clone(&motors),
            registry: Arc::clone(&registry),
        });
        let dispatcher: Dispatcher = Arc::new(move |req| request::dispatch(&context, req));

        let pool = Arc::new(WorkerPool::new(dispatcher, config.max_workers));
        // The group scheduler adds workers as buses appear, but it needs
        // one seed worker for connect requests to land on.
        let _ = pool.add_worker(0);

        let scheduler = Scheduler::new(
            Arc::clone(&pool),
            Arc::clone(&motors),
            config.scheduler,
        );

        Self {
            registry,
            motors,
            pool,
            scheduler,
            timer,
        }
    }

    /// Queue one request for execution.  Fails only when no worker can
    /// take it.
    pub fn submit(&self, request: Request) -> crate::error::Result<()> {
        self.scheduler.schedule(request)
    }

    pub fn motors(&self) -> &Arc<MotorTable> {
        &self.motors
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Orderly teardown: stop the workers, then the timer.  Connected
    /// devices are released as their table entries drop.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.timer.shutdown();
    }
}
