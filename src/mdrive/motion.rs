//! Motion commands and trajectory projection.
//!
//! A move is fired at the unit and then *projected*: from the active
//! profile the driver computes when the unit should come to rest, and
//! schedules a check-back on the completion timer just before that moment.
//! The check-back samples the unit; either the move is done (emit the
//! motion event) or the unit is still decelerating (estimate the remaining
//! time and reschedule).
//!
//! ```text
//!         move                    timer fires            V == 0
//!  Idle ────────▶ Moving ───────────────────▶ Checking ─────────▶ Idle
//!    ▲              │ newer move                 │ V != 0, dt ≥ latency
//!    │              ▼                            ▼
//!    └───── cancelled event              Resting (recheck at dt)
//! ```
//!
//! If the unit does not reach Vmax the velocity curve is triangular:
//!
//! ```text
//!   v ^
//!     |       /\
//!     |     /    \
//! VI _|   /        \
//!     | |            \
//!     +-+-----+-------+--> t
//!       0   t@VM    t@rest
//! ```
//!
//! The area under the curve is the travel distance; the projection solves
//! for t@rest.

use log::{debug, trace, warn};
use std::time::{Duration, Instant};

use super::port::xmit_time;
use super::{CompletionPhase, Device, MotionRecord};
use crate::driver::{
    HomeDirection, HomeKind, MotionInstruction, MoveKind, StopKind,
};
use crate::error::{DriverError, Result};
use crate::events::{EventCode, EventData, MotionUpdate};

/// Characters of traffic needed to sample completion state; backed out of
/// the check-back deadline so the answer arrives right at rest time.
const CHECKBACK_CHARS: u32 = 15;

/// Sampling attempts for the completion check before giving up.
const CHECKBACK_TRIES: u32 = 5;

// ── Unit conversion ───────────────────────────────────────────

impl Device {
    /// Fetch microstep and encoder settings on first use.
    pub fn lazyload_motion_config(&self) -> Result<()> {
        if self.state.lock().unwrap().loaded.encoder {
            return Ok(());
        }

        let values = self.get_integers(&["MS", "EE"])?;
        let mut state = self.state.lock().unwrap();
        state.steps_per_rev = values[0] as i32 * 200;
        state.encoder = values[1] != 0;
        state.loaded.encoder = true;
        Ok(())
    }

    fn steps_per_rev(&self) -> Result<i32> {
        self.lazyload_motion_config()?;
        let state = self.state.lock().unwrap();
        // With the encoder active the unit positions in encoder counts.
        Ok(if state.encoder { 2048 } else { state.steps_per_rev })
    }

    pub fn microrevs_to_steps(&self, microrevs: i64) -> Result<i32> {
        let spr = i64::from(self.steps_per_rev()?);
        Ok(((microrevs * spr) / 1_000_000) as i32)
    }

    pub fn steps_to_microrevs(&self, steps: i32) -> Result<i64> {
        let spr = i64::from(self.steps_per_rev()?);
        if spr == 0 {
            return Err(DriverError::Io);
        }
        Ok(i64::from(steps) * 1_000_000 / spr)
    }
}

// ── Trajectory math (pure; exercised heavily by tests) ────────

/// Projection outputs, microseconds relative to motion start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub vmax_us: i64,
    pub decel_us: i64,
    pub total: Duration,
}

/// Project the travel time for `urevs` of distance under the given profile
/// (all values micro-revolutions).  Fails when the triangular peak would
/// exceed the profile's Vmax, which means the inputs are inconsistent.
pub fn project_travel(
    accel: f64,
    decel: f64,
    vstart: f64,
    vmax: f64,
    urevs: f64,
) -> Result<Projection> {
    if accel < 1.0 || decel < 1.0 || vmax < 1.0 {
        return Err(DriverError::Invalid);
    }
    let distance = urevs.abs();

    // Acceleration ramp and the distance it covers.
    let ramp = vmax - vstart;
    let t1 = ramp / accel;
    let accel_distance = (ramp / 2.0 + vstart) * t1;
    // Deceleration ramp from vmax to rest.
    let t3 = vmax / decel;
    let decel_distance = (vmax / 2.0) * t3;

    let remaining = distance - accel_distance - decel_distance;

    if remaining < 0.0 {
        // The unit never reaches vmax: it starts decelerating at the
        // intersection of the two ramps.
        let peak =
            (((distance * 2.0 * accel * decel) - (decel * vstart * vstart)) / (accel + decel))
                .sqrt();
        if peak > vmax {
            return Err(DriverError::Invalid);
        }
        let accel_time = (peak - vstart) / accel;
        let decel_time = peak / decel;
        let boundary = (accel_time * 1e6) as i64;
        Ok(Projection {
            vmax_us: boundary,
            decel_us: boundary,
            total: Duration::from_secs_f64(accel_time + decel_time),
        })
    } else {
        let t2 = remaining / vmax;
        Ok(Projection {
            vmax_us: (t1 * 1e6) as i64,
            decel_us: ((t1 + t2) * 1e6) as i64,
            total: Duration::from_secs_f64(t1 + t2 + t3),
        })
    }
}

/// Position (micro-revolutions) `when_us` microseconds into a projected
/// move: the accel ramp, the vmax plateau, then the decel ramp.
pub fn position_at(
    accel: f64,
    decel: f64,
    vstart: f64,
    vmax: f64,
    vmax_us: i64,
    decel_us: i64,
    when_us: i64,
) -> f64 {
    let t = when_us as f64 / 1e6;
    let t_v = vmax_us as f64 / 1e6;
    let t_d = decel_us as f64 / 1e6;

    let dt1 = t.min(t_v);
    let mut position = vstart * dt1 + 0.5 * accel * dt1 * dt1;
    if t > t_v {
        position += vmax * (t.min(t_d) - t_v);
    }
    if t > t_d {
        let dt3 = t - t_d;
        position += vmax * dt3 - 0.5 * decel * dt3 * dt3;
    }
    position
}

// ── Driver entry points ───────────────────────────────────────

pub fn move_device(device: &Device, instruction: &MotionInstruction) -> Result<()> {
    let steps = device.microrevs_to_steps(instruction.amount)?;
    let mut urevs = instruction.amount;

    let command = match instruction.kind {
        MoveKind::Absolute => {
            let position = device.state.lock().unwrap().position;
            urevs = device.steps_to_microrevs(steps - position)?;
            format!("MA {steps}")
        }
        MoveKind::Relative => format!("MR {steps}"),
        MoveKind::Slew => {
            let state = device.state.lock().unwrap();
            if state.movement.kind == Some(MoveKind::Slew) && state.movement.urevs == urevs {
                // Requested slew rate is already in progress.
                return Ok(());
            }
            drop(state);
            format!("SL {steps}")
        }
        MoveKind::Jitter => return Err(DriverError::NotSupported),
    };

    let assisted = device.state.lock().unwrap().microcode.has_move;
    if assisted {
        move_assisted(device, instruction, steps)?;
    } else {
        super::profile::set_profile(device, &instruction.profile)?;
        if device.send(&command) != super::comm::ResponseClass::Ok {
            return Err(DriverError::Io);
        }
    }

    // A move still being tracked is superseded by this one: its check-back
    // is dropped and it is reported as cancelled.
    if device.cancel_completion() {
        device.signal_event(
            EventCode::Motion,
            EventData::Motion(MotionUpdate {
                cancelled: true,
                ..MotionUpdate::default()
            }),
        );
    }

    {
        let mut state = device.state.lock().unwrap();
        let now = Instant::now();
        if let Some(end) = state.last_motion_end.take() {
            state.stats.idle_ms += now.duration_since(end).as_millis() as u64;
        }
        let generation = state.movement.generation + 1;
        state.movement = MotionRecord {
            kind: Some(instruction.kind),
            urevs,
            pstart: state.position,
            start: now,
            generation,
            ..MotionRecord::default()
        };
    }

    // A slew never completes on its own; everything else gets a check-back.
    // A projection failure only costs the completion event, not the move.
    if instruction.kind != MoveKind::Slew {
        if let Err(e) = device.schedule_completion() {
            warn!("mdrive: move started but completion projection failed: {e}");
        }
    }
    Ok(())
}

/// Microcode-assisted move: pack the mode, profile slot, and reset flag
/// into R1, the step count into R2, then execute the move label.
fn move_assisted(
    device: &Device,
    instruction: &MotionInstruction,
    steps: i32,
) -> Result<()> {
    let (mode, reset_pos) = match instruction.kind {
        MoveKind::Absolute => (1u8, false),
        MoveKind::Relative => (2, false),
        MoveKind::Slew => (3, true),
        MoveKind::Jitter => return Err(DriverError::NotSupported),
    };

    let profile_slot = if instruction.profile.hw_profile != 0 {
        instruction.profile.hw_profile & 0x07
    } else {
        super::profile::set_profile(device, &instruction.profile)?;
        0
    };

    let control = i64::from(mode)
        + (i64::from(profile_slot) << 3)
        + (i64::from(u8::from(reset_pos)) << 6);
    device.set_variable("R1", control)?;
    device.set_variable("R2", i64::from(steps))?;

    let label = device.state.lock().unwrap().microcode.move_label.clone();
    match device.send(&format!("EX {label}")) {
        super::comm::ResponseClass::Ok => Ok(()),
        _ => Err(DriverError::Io),
    }
}

pub fn stop_device(device: &Device, kind: StopKind) -> Result<()> {
    // Whatever was moving isn't any more.
    device.cancel_completion();
    {
        let mut state = device.state.lock().unwrap();
        state.movement = MotionRecord::default();
    }

    use super::comm::ResponseClass;
    match kind {
        StopKind::Stop => match device.send("SL 0") {
            ResponseClass::Ok => Ok(()),
            _ => Err(DriverError::Io),
        },
        StopKind::Halt => match device.send("\x1b") {
            ResponseClass::Ok => Ok(()),
            _ => Err(DriverError::Io),
        },
        StopKind::EStop => {
            // Halt and de-energize every unit on the bus, through the
            // broadcast pseudo-device, whatever this device's party mode.
            let all = device.broadcast_peer();
            if all.send("\x1b") == ResponseClass::IoError {
                return Err(DriverError::Io);
            }
            if all.send("DE=0") == ResponseClass::IoError {
                return Err(DriverError::Io);
            }
            Ok(())
        }
    }
}

pub fn home_device(device: &Device, kind: HomeKind, _direction: HomeDirection) -> Result<()> {
    match kind {
        HomeKind::Default => match device.send("EX M1") {
            super::comm::ResponseClass::Ok => Ok(()),
            _ => Err(DriverError::Io),
        },
        HomeKind::HardStop => Err(DriverError::NotSupported),
    }
}

// ── Completion tracking ───────────────────────────────────────

impl Device {
    /// Project the current move and schedule its check-back just before
    /// the expected completion.
    pub(crate) fn schedule_completion(&self) -> Result<()> {
        let (projection, start) = {
            let state = self.state.lock().unwrap();
            let projection = project_travel(
                state.profile.accel as f64,
                state.profile.decel as f64,
                state.profile.vstart as f64,
                state.profile.vmax as f64,
                state.movement.urevs as f64,
            )?;
            (projection, state.movement.start)
        };

        let (latency, speed) = {
            let state = self.state.lock().unwrap();
            (
                Duration::from_nanos(state.stats.latency_ns),
                state.speed,
            )
        };

        // Check back just before the projected rest: back out half the
        // unit latency and the sampling traffic, then re-add a millisecond
        // for latency jitter.
        let projected = start + projection.total;
        let mut when = projected + Duration::from_millis(1);
        when = when
            .checked_sub(latency / 2)
            .unwrap_or(projected)
            .checked_sub(xmit_time(speed, CHECKBACK_CHARS))
            .unwrap_or(projected);

        let weak = self.me.clone();
        let id = self.timer.submit_at(
            when,
            Box::new(move || {
                if let Some(device) = weak.upgrade() {
                    device.completion_check();
                }
            }),
        );

        let mut state = self.state.lock().unwrap();
        state.movement.vmax_us = projection.vmax_us;
        state.movement.decel_us = projection.decel_us;
        state.movement.projected = projected;
        state.movement.cb_complete = Some(id);
        state.movement.phase = CompletionPhase::Moving;
        trace!(
            "mdrive '{}': projected completion in {:?}",
            state.address as char,
            projection.total
        );
        Ok(())
    }

    /// Drop a pending check-back, if any.  Returns whether a move was
    /// still being tracked.
    pub(crate) fn cancel_completion(&self) -> bool {
        let (was_armed, cb) = {
            let mut state = self.state.lock().unwrap();
            let was_armed = state.movement.phase != CompletionPhase::Idle;
            state.movement.phase = CompletionPhase::Idle;
            (was_armed, state.movement.cb_complete.take())
        };
        if let Some(id) = cb {
            self.timer.cancel(id);
        }
        was_armed
    }

    /// Timer-driven completion check.  Samples stall flag, position, and
    /// velocity in one exchange, decides whether the unit is at rest, and
    /// either emits the motion event or reschedules itself.
    pub(crate) fn completion_check(&self) {
        let (generation, start, has_fe, fe_var) = {
            let mut state = self.state.lock().unwrap();
            if state.movement.phase == CompletionPhase::Idle {
                // A newer move (or a stop) got here first.
                return;
            }
            state.movement.cb_complete = None;
            state.movement.phase = CompletionPhase::Checking;
            (
                state.movement.generation,
                state.movement.start,
                state.microcode.has_following_error,
                state.microcode.following_error_var.clone(),
            )
        };

        let mut vars: Vec<&str> = vec!["ST", "P", "V"];
        if has_fe {
            vars.push(fe_var.as_str());
        }

        let mut sample = None;
        for _ in 0..CHECKBACK_TRIES {
            match self.get_integers(&vars) {
                Ok(values) => {
                    sample = Some(values);
                    break;
                }
                Err(_) => continue,
            }
        }
        let Some(values) = sample else {
            warn!("mdrive: completion check could not sample the unit");
            self.state.lock().unwrap().movement.phase = CompletionPhase::Idle;
            return;
        };

        let stalled = values[0] != 0;
        let position = values[1] as i32;
        let velocity = values[2] as i32;

        // Following error: from the microcode variable when available,
        // otherwise projected from the profile and elapsed travel time.
        let error_steps = if has_fe {
            values[3] as i32
        } else {
            let latency = self.state.lock().unwrap().stats.latency_ns;
            let travel_us = start.elapsed().as_micros() as i64 + (latency / 2000) as i64;
            let (expected, pstart) = {
                let state = self.state.lock().unwrap();
                let urevs = position_at(
                    state.profile.accel as f64,
                    state.profile.decel as f64,
                    state.profile.vstart as f64,
                    state.profile.vmax as f64,
                    state.movement.vmax_us,
                    state.movement.decel_us,
                    travel_us,
                );
                (urevs, state.movement.pstart)
            };
            let expected_steps = self
                .microrevs_to_steps(expected as i64)
                .unwrap_or(0)
                .saturating_add(pstart);
            position - expected_steps
        };

        let mut completed = true;
        if velocity != 0 {
            // Assume the unit is decelerating.  The decel curve crosses
            // zero at dt = v / D; until then there is nothing to report.
            let vel_urevs = self.steps_to_microrevs(velocity.abs()).unwrap_or(0);
            let decel = self.state.lock().unwrap().profile.decel.max(1);
            let dt = vel_urevs as f64 / decel as f64;
            let latency = Duration::from_nanos(self.state.lock().unwrap().stats.latency_ns);

            if Duration::from_secs_f64(dt) < latency {
                // Effectively stopped: we couldn't reach the unit again
                // before it rests.  Estimate the resting position (the
                // remaining travel is the area of the decel triangle).
                let resting = position + (dt * f64::from(velocity) / 2.0) as i32;
                self.state.lock().unwrap().position = resting;
            } else {
                let mut state = self.state.lock().unwrap();
                if state.movement.generation != generation {
                    return;
                }
                state.movement.phase = CompletionPhase::Resting;
                drop(state);

                let mut recheck = Duration::from_secs_f64(dt);
                recheck = recheck
                    .saturating_sub(latency / 2)
                    .saturating_sub(Duration::from_millis(1));
                debug!("mdrive: early check-back, unit rests in {recheck:?}");

                let weak = self.me.clone();
                let id = self
                    .timer
                    .submit_in(recheck, Box::new(move || {
                        if let Some(device) = weak.upgrade() {
                            device.completion_check();
                        }
                    }));
                self.state.lock().unwrap().movement.cb_complete = Some(id);
                completed = false;
            }
        } else {
            // At rest; the sampled position is authoritative.
            self.state.lock().unwrap().position = position;
        }

        if completed {
            let error_urevs = self.steps_to_microrevs(error_steps).unwrap_or(0);
            let position_urevs = self.steps_to_microrevs(position).unwrap_or(0);
            {
                let mut state = self.state.lock().unwrap();
                if state.movement.generation != generation {
                    return;
                }
                state.movement.phase = CompletionPhase::Idle;
                state.movement.error = error_urevs;
                state.last_motion_end = Some(Instant::now());
                state.stats.moving_ms += start.elapsed().as_millis() as u64;
            }
            debug!("mdrive: signalling motion completion");
            self.signal_event(
                EventCode::Motion,
                EventData::Motion(MotionUpdate {
                    completed: !stalled,
                    stalled,
                    pos_known: true,
                    position: position_urevs,
                    error: error_urevs,
                    ..MotionUpdate::default()
                }),
            );
        }
    }
}
