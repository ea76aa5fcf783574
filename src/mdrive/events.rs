//! Per-device event subscriptions and signal routing.
//!
//! Subscribers land in a fixed table of [`MAX_SUBSCRIPTIONS`] slots.
//! Notifications are one-shot: a delivered slot deactivates and the
//! subscriber must re-register for the next occurrence.  Subscriptions made
//! with `subscribe` persist until removed.
//!
//! Events reach this table from two directions:
//! - the bus reader thread, for asynchronous wire frames (`!"a"?86`), and
//! - the driver itself (classification, motion check-backs).
//!
//! Device-side cleanup that an event requires (clearing the stall flag,
//! fetching the temperature, re-inspecting after a reboot) is pushed onto
//! the callback timer instead of running inline: the reader thread cannot
//! wait on responses it is itself supposed to receive.

use log::{debug, info, warn};
use std::time::Duration;

use super::Device;
use crate::config::MAX_SUBSCRIPTIONS;
use crate::driver::SubscriptionId;
use crate::error::{device_code, DriverError, Result};
use crate::events::{EventCallback, EventCode, EventData, EventInfo, MotionUpdate};

struct Slot {
    active: bool,
    paused: bool,
    oneshot: bool,
    generation: u32,
    event: EventCode,
    condition: i32,
    callback: Option<EventCallback>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            active: false,
            paused: false,
            oneshot: true,
            generation: 0,
            event: EventCode::Motion,
            condition: 0,
            callback: None,
        }
    }
}

/// Fixed-capacity subscription table.
pub struct SubscriptionTable {
    slots: [Slot; MAX_SUBSCRIPTIONS],
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::empty()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error code → event cross-reference.
fn event_for_code(code: u16) -> Option<EventCode> {
    match code {
        device_code::STALL => Some(EventCode::Motion),
        device_code::OVER_TEMP => Some(EventCode::OverTemp),
        device_code::RESET => Some(EventCode::MotorReset),
        _ => None,
    }
}

impl Device {
    // ── Subscription management ───────────────────────────────

    pub(crate) fn add_subscription(
        &self,
        event: EventCode,
        condition: i32,
        callback: EventCallback,
        oneshot: bool,
    ) -> Result<SubscriptionId> {
        let mut table = self.subs.lock().unwrap();
        let Some((index, slot)) = table
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.active)
        else {
            return Err(DriverError::TooMany);
        };

        let generation = slot.generation + 1;
        *slot = Slot {
            active: true,
            paused: false,
            oneshot,
            generation,
            event,
            condition,
            callback: Some(callback),
        };
        Ok(SubscriptionId {
            index: index as u16,
            generation,
        })
    }

    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        let mut table = self.subs.lock().unwrap();
        let slot = table
            .slots
            .get_mut(id.index as usize)
            .ok_or(DriverError::Invalid)?;
        if !slot.active || slot.generation != id.generation {
            return Err(DriverError::Stale);
        }
        slot.active = false;
        slot.callback = None;
        Ok(())
    }

    // ── Signalling ────────────────────────────────────────────

    /// Broadcast `event` to every matching subscriber.  One-shot slots
    /// deactivate after delivery.
    pub(crate) fn signal_event(&self, event: EventCode, data: EventData) {
        if event == EventCode::MotorReset {
            // The unit came up with power-on comm settings and lost every
            // lazy-loaded value.  Resynchronize off this thread.
            let weak = self.me.clone();
            self.timer.submit_in(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(device) = weak.upgrade() {
                        if let Err(e) = device.config_after_reboot() {
                            warn!("mdrive: resync after reboot failed: {e}");
                        }
                    }
                }),
            );
        }

        let callbacks: Vec<EventCallback> = {
            let mut table = self.subs.lock().unwrap();
            let mut fired = Vec::new();
            for slot in table.slots.iter_mut() {
                if slot.active && !slot.paused && slot.event == event {
                    if let Some(cb) = &slot.callback {
                        fired.push(cb.clone());
                    }
                    if slot.oneshot {
                        // The subscriber must request notification again.
                        slot.active = false;
                        slot.callback = None;
                    }
                }
            }
            fired
        };

        let info = EventInfo { event, data };
        for callback in callbacks {
            callback(&info);
        }
    }

    /// Signal an event derived from a device error code, updating the
    /// statistics the code implies.  Codes without an event mapping are
    /// ignored.
    pub(crate) fn signal_error_event(&self, code: u16) {
        let Some(event) = event_for_code(code) else {
            return;
        };

        let mut data = EventData::None;
        match code {
            device_code::STALL => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.stats.stalls += 1;
                    state.movement.stalls = state.movement.stalls.saturating_add(1);
                    // The unit stops on a stall; the move is over.
                    state.movement.kind = None;
                }
                data = EventData::Motion(MotionUpdate {
                    stalled: true,
                    ..MotionUpdate::default()
                });

                // Clear the stall flag on the unit.
                let weak = self.me.clone();
                self.timer.submit_in(
                    Duration::ZERO,
                    Box::new(move || {
                        if let Some(device) = weak.upgrade() {
                            let _ = device.send("ST");
                        }
                    }),
                );
            }
            device_code::OVER_TEMP => {
                let weak = self.me.clone();
                self.timer.submit_in(
                    Duration::ZERO,
                    Box::new(move || {
                        if let Some(device) = weak.upgrade() {
                            match device.get_integer("IT") {
                                Ok(temp) => warn!(
                                    "mdrive '{}': unit reports over temperature: {temp}",
                                    device.address() as char
                                ),
                                Err(_) => warn!(
                                    "mdrive '{}': unit reports over temperature",
                                    device.address() as char
                                ),
                            }
                        }
                    }),
                );
            }
            _ => {}
        }

        debug!("mdrive '{}': error {code} → {event:?}", self.address() as char);
        self.signal_event(event, data);
    }

    /// An asynchronous event frame arrived on the bus for this device.
    pub(crate) fn wire_event(&self, code: u16) {
        info!(
            "mdrive '{}': asynchronous event {code}",
            self.address() as char
        );
        self.signal_error_event(code);
    }
}
