//! Inbound requests and their handlers.
//!
//! A [`Request`] is the daemon's unit of work: the client-transport layer
//! (out of scope here) turns each RPC into one of these and hands it to
//! the scheduler; a worker later runs [`dispatch`], which resolves the
//! motor handle and calls into the driver.  Results travel back on the
//! request's reply channel.

use log::{debug, warn};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::driver::{
    HomeDirection, HomeKind, MotionInstruction, MotorId, MotorQuery, MotorTable, Profile,
    QueryId, StopKind, SubscriptionId,
};
use crate::error::Result;
use crate::events::{EventCallback, EventCode};

pub type Reply<T> = Sender<Result<T>>;

/// One logical daemon operation.
pub enum Request {
    Connect {
        cxn: String,
        reply: Reply<MotorId>,
    },
    Disconnect {
        motor: MotorId,
        reply: Reply<()>,
    },
    Reset {
        motor: MotorId,
        reply: Reply<()>,
    },

    Move {
        motor: MotorId,
        instruction: MotionInstruction,
        reply: Reply<()>,
    },
    Stop {
        motor: MotorId,
        kind: StopKind,
        reply: Reply<()>,
    },
    Home {
        motor: MotorId,
        kind: HomeKind,
        direction: HomeDirection,
        reply: Reply<()>,
    },

    QueryRead {
        motor: MotorId,
        query: MotorQuery,
        reply: Reply<MotorQuery>,
    },
    QueryWrite {
        motor: MotorId,
        query: MotorQuery,
        reply: Reply<()>,
    },
    ProfileGet {
        motor: MotorId,
        reply: Reply<Profile>,
    },
    ProfileSet {
        motor: MotorId,
        profile: Profile,
        reply: Reply<()>,
    },

    Notify {
        motor: MotorId,
        event: EventCode,
        condition: i32,
        callback: EventCallback,
        reply: Reply<SubscriptionId>,
    },
    Subscribe {
        motor: MotorId,
        event: EventCode,
        callback: EventCallback,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        motor: MotorId,
        id: SubscriptionId,
        reply: Reply<()>,
    },

    LoadFirmware {
        motor: MotorId,
        path: PathBuf,
        reply: Reply<()>,
    },
    LoadMicrocode {
        motor: MotorId,
        path: PathBuf,
        reply: Reply<()>,
    },

    Search {
        class: String,
        reply: Reply<Vec<String>>,
    },
}

impl Request {
    /// The motor a request targets, for group scheduling.  Connect and
    /// search target no connected motor yet.
    pub fn motor_id(&self) -> Option<MotorId> {
        match self {
            Request::Connect { .. } | Request::Search { .. } => None,
            Request::Disconnect { motor, .. }
            | Request::Reset { motor, .. }
            | Request::Move { motor, .. }
            | Request::Stop { motor, .. }
            | Request::Home { motor, .. }
            | Request::QueryRead { motor, .. }
            | Request::QueryWrite { motor, .. }
            | Request::ProfileGet { motor, .. }
            | Request::ProfileSet { motor, .. }
            | Request::Notify { motor, .. }
            | Request::Subscribe { motor, .. }
            | Request::Unsubscribe { motor, .. }
            | Request::LoadFirmware { motor, .. }
            | Request::LoadMicrocode { motor, .. } => Some(*motor),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::Connect { .. } => "Connect",
            Request::Disconnect { .. } => "Disconnect",
            Request::Reset { .. } => "Reset",
            Request::Move { .. } => "Move",
            Request::Stop { .. } => "Stop",
            Request::Home { .. } => "Home",
            Request::QueryRead { .. } => "QueryRead",
            Request::QueryWrite { .. } => "QueryWrite",
            Request::ProfileGet { .. } => "ProfileGet",
            Request::ProfileSet { .. } => "ProfileSet",
            Request::Notify { .. } => "Notify",
            Request::Subscribe { .. } => "Subscribe",
            Request::Unsubscribe { .. } => "Unsubscribe",
            Request::LoadFirmware { .. } => "LoadFirmware",
            Request::LoadMicrocode { .. } => "LoadMicrocode",
            Request::Search { .. } => "Search",
        };
        write!(f, "Request::{name}")
    }
}

/// Everything a handler needs.
pub struct DaemonContext {
    pub motors: Arc<MotorTable>,
    pub registry: Arc<crate::driver::DriverRegistry>,
}

fn answer<T>(reply: &Reply<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        // The client went away while the request was queued.
        debug!("request: reply channel closed");
    }
}

/// Whether a successful write through this query changed how the unit is
/// reached, making its cached connection string a lie.
fn invalidates_connection(query: &MotorQuery) -> bool {
    matches!(
        query.query,
        Some(QueryId::Baudrate)
            | Some(QueryId::Address)
            | Some(QueryId::Name)
            | Some(QueryId::FactoryDefaults)
    )
}

/// Run one request to completion.  Called on a worker thread.
pub fn dispatch(ctx: &DaemonContext, request: Request) {
    match request {
        Request::Connect { cxn, reply } => {
            answer(&reply, ctx.motors.connect(&cxn));
        }
        Request::Disconnect { motor, reply } => {
            answer(&reply, ctx.motors.disconnect(motor));
        }
        Request::Reset { motor, reply } => {
            answer(&reply, ctx.motors.driver(motor).and_then(|d| d.reset()));
        }

        Request::Move {
            motor,
            instruction,
            reply,
        } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.start_move(&instruction)),
            );
        }
        Request::Stop { motor, kind, reply } => {
            answer(&reply, ctx.motors.driver(motor).and_then(|d| d.stop(kind)));
        }
        Request::Home {
            motor,
            kind,
            direction,
            reply,
        } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.home(kind, direction)),
            );
        }

        Request::QueryRead {
            motor,
            mut query,
            reply,
        } => {
            let result = ctx
                .motors
                .driver(motor)
                .and_then(|d| d.read(&mut query).map(|()| query));
            answer(&reply, result);
        }
        Request::QueryWrite {
            motor,
            query,
            reply,
        } => {
            let result = ctx.motors.driver(motor).and_then(|driver| {
                let status = driver.write(&query);
                if status.is_ok() && invalidates_connection(&query) {
                    // A reconnect with the original string must probe
                    // fresh rather than alias this instance.
                    ctx.motors.invalidate(&driver);
                }
                status
            });
            answer(&reply, result);
        }
        Request::ProfileGet { motor, reply } => {
            answer(&reply, ctx.motors.driver(motor).and_then(|d| d.profile()));
        }
        Request::ProfileSet {
            motor,
            profile,
            reply,
        } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.set_profile(&profile)),
            );
        }

        Request::Notify {
            motor,
            event,
            condition,
            callback,
            reply,
        } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.notify(event, condition, callback)),
            );
        }
        Request::Subscribe {
            motor,
            event,
            callback,
            reply,
        } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.subscribe(event, callback)),
            );
        }
        Request::Unsubscribe { motor, id, reply } => {
            answer(
                &reply,
                ctx.motors.driver(motor).and_then(|d| d.unsubscribe(id)),
            );
        }

        Request::LoadFirmware { motor, path, reply } => {
            let result = ctx.motors.driver(motor).and_then(|driver| {
                let status = driver.load_firmware(&path);
                if status.is_ok() {
                    // Flashing factory-defaults the unit; its old
                    // connection string no longer reaches it.
                    ctx.motors.invalidate(&driver);
                }
                status
            });
            answer(&reply, result);
        }
        Request::LoadMicrocode { motor, path, reply } => {
            answer(
                &reply,
                ctx.motors
                    .driver(motor)
                    .and_then(|d| d.load_microcode(&path)),
            );
        }

        Request::Search { class, reply } => {
            let result = ctx.registry.search(&class);
            if let Ok(found) = &result {
                debug!("request: search found {} units", found.len());
            } else {
                warn!("request: search against unknown class '{class}'");
            }
            answer(&reply, result);
        }
    }
}
