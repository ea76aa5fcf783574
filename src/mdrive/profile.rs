//! Motion-profile cache and diff-write.
//!
//! The profile (accel, decel, velocities, currents, slip) is loaded from
//! the unit once, with a single multi-variable read, and kept as a shadow.
//! Every setter compares against the shadow and only writes when the value
//! actually changes, so re-sending an unchanged profile costs no serial
//! traffic at all.

use super::Device;
use crate::driver::Profile;
use crate::error::{DriverError, Result};

impl Device {
    /// Load the profile shadow from the unit on first use.  The same read
    /// refreshes the known position for free.
    pub fn lazyload_profile(&self) -> Result<()> {
        if self.state.lock().unwrap().loaded.profile {
            return Ok(());
        }

        let values = self.get_integers(&["A", "D", "VM", "VI", "SF", "RC", "HC", "P"])?;
        let [a, d, vm, vi, sf, rc, hc, p] = values[..] else {
            return Err(DriverError::Io);
        };

        let accel = self.steps_to_microrevs(a as i32)?;
        let decel = self.steps_to_microrevs(d as i32)?;
        let vmax = self.steps_to_microrevs(vm as i32)?;
        let vstart = self.steps_to_microrevs(vi as i32)?;
        let slip_max = self.steps_to_microrevs(sf as i32)?;

        let mut state = self.state.lock().unwrap();
        state.profile.accel = accel;
        state.profile.decel = decel;
        state.profile.vmax = vmax;
        state.profile.vstart = vstart;
        state.profile.slip_max = slip_max;
        state.profile.current_run = rc as i32;
        state.profile.current_hold = hc as i32;
        state.position = p as i32;
        state.loaded.profile = true;
        Ok(())
    }

    pub fn profile_accel(&self, accel: i64) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.accel == accel {
            return Ok(());
        }
        if accel < 1 {
            return Err(DriverError::Invalid);
        }
        let steps = self.microrevs_to_steps(accel)?;
        self.set_variable("A", i64::from(steps))?;
        self.state.lock().unwrap().profile.accel = accel;
        Ok(())
    }

    pub fn profile_decel(&self, decel: i64) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.decel == decel {
            return Ok(());
        }
        if decel < 1 {
            return Err(DriverError::Invalid);
        }
        let steps = self.microrevs_to_steps(decel)?;
        self.set_variable("D", i64::from(steps))?;
        self.state.lock().unwrap().profile.decel = decel;
        Ok(())
    }

    pub fn profile_vmax(&self, vmax: i64) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.vmax == vmax {
            return Ok(());
        }
        if vmax < 1 {
            return Err(DriverError::Invalid);
        }
        let steps = self.microrevs_to_steps(vmax)?;
        self.set_variable("VM", i64::from(steps))?;
        self.state.lock().unwrap().profile.vmax = vmax;
        Ok(())
    }

    pub fn profile_vstart(&self, vstart: i64) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.vstart == vstart {
            return Ok(());
        }
        if vstart < 1 {
            return Err(DriverError::Invalid);
        }
        let steps = self.microrevs_to_steps(vstart)?;
        self.set_variable("VI", i64::from(steps))?;
        self.state.lock().unwrap().profile.vstart = vstart;
        Ok(())
    }

    /// Stall factor.  The unit only honors `SF` when its encoder is
    /// enabled.
    pub fn profile_slipmax(&self, slip_max: i64) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.slip_max == slip_max {
            return Ok(());
        }

        self.lazyload_motion_config()?;
        if !self.state.lock().unwrap().encoder {
            return Err(DriverError::NotSupported);
        }

        if slip_max < 1 {
            return Err(DriverError::Invalid);
        }
        let steps = self.microrevs_to_steps(slip_max)?;
        self.set_variable("SF", i64::from(steps))?;
        self.state.lock().unwrap().profile.slip_max = slip_max;
        Ok(())
    }

    pub fn profile_run_current(&self, current: i32) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.current_run == current {
            return Ok(());
        }
        if !(10..=100).contains(&current) {
            return Err(DriverError::Invalid);
        }
        self.set_variable("RC", i64::from(current))?;
        self.state.lock().unwrap().profile.current_run = current;
        Ok(())
    }

    pub fn profile_hold_current(&self, current: i32) -> Result<()> {
        self.lazyload_profile()?;
        if self.state.lock().unwrap().profile.current_hold == current {
            return Ok(());
        }
        if !(10..=100).contains(&current) {
            return Err(DriverError::Invalid);
        }
        self.set_variable("HC", i64::from(current))?;
        self.state.lock().unwrap().profile.current_hold = current;
        Ok(())
    }
}

/// The device's current profile, from the shadow (loading it on first use).
pub fn get_profile(device: &Device) -> Result<Profile> {
    device.lazyload_profile()?;
    let state = device.state.lock().unwrap();
    Ok(Profile {
        accel: state.profile.accel,
        decel: state.profile.decel,
        vmax: state.profile.vmax,
        vstart: state.profile.vstart,
        slip_max: state.profile.slip_max,
        current_run: state.profile.current_run,
        current_hold: state.profile.current_hold,
        hw_profile: 0,
    })
}

/// Apply every member of `profile`, writing only the ones that differ from
/// the shadow.  A slip limit of zero is "not requested" and skipped, since
/// encoderless units reject it outright.
pub fn set_profile(device: &Device, profile: &Profile) -> Result<()> {
    device.profile_accel(profile.accel)?;
    device.profile_decel(profile.decel)?;
    device.profile_vmax(profile.vmax)?;
    device.profile_vstart(profile.vstart)?;
    if profile.slip_max > 0 {
        device.profile_slipmax(profile.slip_max)?;
    }
    device.profile_run_current(profile.current_run)?;
    device.profile_hold_current(profile.current_hold)?;
    Ok(())
}
