//! Communication-setting inspection and reconfiguration.
//!
//! The `CK` (checksum) and `EM` (echo) settings are interdependent: until
//! both are known, the unit's responses cannot be framed reliably.  The
//! inspection routines therefore brute-force the small mode space, setting
//! the local shadow to each candidate until a `PR` round-trips.

use log::{debug, info};
use std::time::Duration;

use super::comm::{ResponseClass, SendOpts};
use super::{baud_setting, ChecksumMode, Device, EchoMode};
use crate::error::{DriverError, Result};

/// Settle time for `IP` (rollback) and `S` (commit).
const SETTLE_WAIT: Duration = Duration::from_millis(750);

/// Settings not to be reverted to user-friendly values at commit time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreserveFlags {
    pub checksum: bool,
    pub echo: bool,
}

/// Options for [`Device::reboot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RebootOpts {
    /// Switch the host side to this speed for (and after) the reboot.
    /// Zero keeps the current speed.
    pub baudrate: u32,
    /// Skip the ESC halt and only send the soft reset.
    pub no_halt: bool,
}

impl Device {
    // ── Variable writes ───────────────────────────────────────

    pub fn set_variable_text(&self, variable: &str, value: &str) -> Result<()> {
        match self.send(&format!("{variable}={value}")) {
            ResponseClass::Ok => Ok(()),
            _ => Err(DriverError::Io),
        }
    }

    pub fn set_variable(&self, variable: &str, value: i64) -> Result<()> {
        self.set_variable_text(variable, &value.to_string())
    }

    // ── Mode changes ──────────────────────────────────────────

    /// Move the unit into `mode` checksum handling.  The local shadow is
    /// updated first when enabling: the unit frames its *response* in the
    /// new mode, while the request must still carry the old framing.
    pub fn set_checksum(&self, mode: ChecksumMode, force: bool) -> Result<()> {
        let old = {
            let state = self.state.lock().unwrap();
            if !force && state.checksum == mode {
                return Ok(());
            }
            state.checksum
        };

        if mode != ChecksumMode::Off {
            self.state.lock().unwrap().checksum = mode;
        }

        if self.set_variable("CK", mode.setting()).is_ok() {
            self.state.lock().unwrap().checksum = mode;
            Ok(())
        } else {
            self.state.lock().unwrap().checksum = old;
            Err(DriverError::Io)
        }
    }

    pub fn set_echo(&self, mode: EchoMode, force: bool) -> Result<()> {
        let old = {
            let state = self.state.lock().unwrap();
            if !force && state.echo == mode {
                return Ok(());
            }
            state.echo
        };

        self.state.lock().unwrap().echo = mode;
        if self.set_variable("EM", mode.setting()).is_ok() {
            Ok(())
        } else {
            self.state.lock().unwrap().echo = old;
            Err(DriverError::Io)
        }
    }

    // ── Inspection ────────────────────────────────────────────

    fn inspect_checksum(&self) -> Result<()> {
        let old = self.state.lock().unwrap().checksum;
        for mode in [ChecksumMode::Off, ChecksumMode::On] {
            self.state.lock().unwrap().checksum = mode;
            if let Ok(value) = self.get_integer("CK") {
                let mode = ChecksumMode::from_setting(value);
                self.state.lock().unwrap().checksum = mode;
                debug!("mdrive: unit CK mode is {value}");
                return Ok(());
            }
        }
        self.state.lock().unwrap().checksum = old;
        Err(DriverError::Io)
    }

    fn inspect_echo(&self) -> Result<()> {
        let old = self.state.lock().unwrap().echo;
        for mode in [EchoMode::On, EchoMode::Prompt, EchoMode::Quiet] {
            self.state.lock().unwrap().echo = mode;
            if let Ok(value) = self.get_integer("EM") {
                let mode = EchoMode::from_setting(value);
                self.state.lock().unwrap().echo = mode;
                debug!("mdrive: unit EM mode is {value}");
                return Ok(());
            }
        }
        self.state.lock().unwrap().echo = old;
        Err(DriverError::Io)
    }

    /// Detect the unit's current checksum/echo modes and, when `set`, push
    /// it into the driver-preferred combination (EM=1, CK=1).
    pub fn config_inspect(&self, set: bool) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.address == b'*' {
                // Units don't answer global commands; and if they did, the
                // responses would clobber each other.
                return Ok(());
            }
            // Assume full echo, the worst case for framing ambiguity.
            state.echo = EchoMode::On;
        }

        self.inspect_checksum()?;
        self.inspect_echo()?;

        if set {
            self.set_echo(EchoMode::Prompt, false)?;
            self.set_checksum(ChecksumMode::On, false)?;
        }

        self.state.lock().unwrap().loaded.comm_config = true;
        Ok(())
    }

    // ── Rollback / commit ─────────────────────────────────────

    /// Revert unsaved (uncommitted) settings on the unit with `IP`, then
    /// rediscover the comm modes the revert restored.
    pub fn config_rollback(&self) -> Result<()> {
        let opts = SendOpts {
            waittime: Some(SETTLE_WAIT),
            ..SendOpts::default()
        };
        if self.communicate("IP", &opts).class != ResponseClass::Ok {
            return Err(DriverError::Io);
        }
        self.config_inspect(true)
    }

    /// Commit settings to NVRAM with `S`.  Unless preserved, comm settings
    /// are first put back to the user-friendly power-on defaults so a bare
    /// terminal can talk to the unit after its next reboot.
    pub fn config_commit(&self, preserve: Option<PreserveFlags>) -> Result<()> {
        let preserve = preserve.unwrap_or_default();
        if !preserve.checksum {
            self.set_checksum(ChecksumMode::Off, false)?;
        }
        if !preserve.echo {
            self.set_echo(EchoMode::On, false)?;
        }

        let opts = SendOpts {
            waittime: Some(SETTLE_WAIT),
            ..SendOpts::default()
        };
        if self.communicate("S", &opts).class != ResponseClass::Ok {
            return Err(DriverError::Io);
        }
        self.config_inspect(true)
    }

    // ── Persistent reconfiguration ────────────────────────────

    /// Change the unit's stored baud rate and follow it to the new speed.
    ///
    /// The caller must invalidate the connection-string cache afterwards: a
    /// connect with the original string can no longer reach this unit.
    pub fn config_set_baudrate(&self, speed: u32) -> Result<()> {
        let setting = baud_setting(speed).ok_or(DriverError::NotSupported)?;

        // Make sure nothing unexpected gets saved alongside.
        self.config_rollback()?;

        self.set_variable("BD", i64::from(setting))?;
        self.config_commit(None)?;

        // BD only takes effect on reboot.  Once rebooted, the unit is at
        // the new speed, so there is no way to retry this transition.
        self.reboot(Some(&RebootOpts {
            baudrate: speed,
            no_halt: false,
        }))?;

        info!("mdrive: unit now at {speed} baud");
        self.config_inspect(true)
    }

    /// Assign a party-mode address to the unit.
    ///
    /// The caller must invalidate the connection-string cache afterwards.
    pub fn config_set_address(&self, address: u8) -> Result<()> {
        self.config_rollback()?;

        self.set_variable_text("DN", &format!("\"{}\"", address as char))?;

        let (old, party) = {
            let mut state = self.state.lock().unwrap();
            let old = state.address;
            state.address = address;
            (old, state.party_mode)
        };
        self.bus.reindex_device(old, address);

        if !party {
            self.set_variable("PY", 1)?;
            self.state.lock().unwrap().party_mode = true;
        }

        self.config_commit(None)
    }

    // ── Reboot handling ───────────────────────────────────────

    /// Reboot the unit: ESC to halt any running microcode, then CTRL-C.
    /// A `$` response means the unit came up in factory upgrade mode.
    pub fn reboot(&self, opts: Option<&RebootOpts>) -> Result<()> {
        let reboot_opts = opts.copied().unwrap_or_default();

        if reboot_opts.baudrate != 0 {
            let mut state = self.state.lock().unwrap();
            state.speed = reboot_opts.baudrate;
        }

        let party = self.state.lock().unwrap().party_mode;
        let commands: &[(&str, Option<Duration>)] = if reboot_opts.no_halt {
            &[("\x03", Some(Duration::from_millis(950)))]
        } else {
            &[("\x1b", None), ("\x03", Some(Duration::from_millis(950)))]
        };

        for (command, wait) in commands {
            let send_opts = SendOpts {
                expect_err: true,
                raw: true,
                waittime: *wait,
                // The unit gives no indication of acceptance in party mode;
                // retrying would only reboot it twice.
                tries: if party { Some(1) } else { None },
                ..SendOpts::default()
            };
            let exchange = self.communicate(command, &send_opts);
            if let Some(response) = exchange.response {
                if response.payload_bytes().first() == Some(&b'$') {
                    self.state.lock().unwrap().upgrade_mode = true;
                }
            }
        }
        Ok(())
    }

    /// Bring the local shadow back in line after the unit is known to have
    /// rebooted: everything lazy-loaded is stale and the comm modes are
    /// back at power-on defaults.
    pub fn config_after_reboot(&self) -> Result<()> {
        let encoder = {
            let mut state = self.state.lock().unwrap();
            state.loaded.clear();
            state.stats.reboots += 1;
            state.encoder
        };

        self.config_inspect(true)?;

        // Re-assert the encoder setting the unit lost with the reboot.
        self.set_variable("EE", i64::from(encoder))?;
        Ok(())
    }
}
