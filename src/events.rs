//! Event codes and payloads shared between the driver core and subscribers.
//!
//! Events flow from two sources:
//! - asynchronous frames parsed off the wire by a bus reader thread
//!   (`!"a"?86` — stall on unit `a`), and
//! - software observations such as motion-completion check-backs.
//!
//! Both funnel through the per-device subscription table in
//! [`crate::mdrive::events`] and are delivered as an [`EventInfo`].

use std::sync::Arc;

/// Event codes a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// A move finished, stalled, or was cancelled.  Payload: [`MotionUpdate`].
    Motion = 1,
    /// A watched position was reached.
    Position,
    /// An input line changed state.
    Input,
    /// Unclassified device exception.
    Exception,
    /// The unit reported an over-temperature condition.
    OverTemp,
    /// The unit rebooted.
    MotorReset,
    /// A unit was discovered during a bus search.
    MotorProbe,
}

/// Details of a finished (or interrupted) move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionUpdate {
    /// Move finished normally.
    pub completed: bool,
    /// Move was interrupted by a stall.
    pub stalled: bool,
    /// Move was replaced by a newer move before it finished.
    pub cancelled: bool,
    /// A stop was issued.
    pub stopped: bool,
    /// The `position` field is valid.
    pub pos_known: bool,
    /// Resting position in micro-revolutions, if known.
    pub position: i64,
    /// Following error in micro-revolutions.
    pub error: i64,
}

/// Data coupled with an event code.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum EventData {
    #[default]
    None,
    Number(i64),
    Motion(MotionUpdate),
    /// Over-temperature payload: unit-scaled temperature reading.
    Temperature(i32),
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub event: EventCode,
    pub data: EventData,
}

/// Subscriber callback.  Runs on the thread that observed the event (a bus
/// reader, a worker, or the completion-timer thread), so it must be brief.
pub type EventCallback = Arc<dyn Fn(&EventInfo) + Send + Sync>;
