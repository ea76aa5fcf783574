//! Microcode (MCode program) installation and feature inspection.
//!
//! Programs are streamed line by line over the normal command channel.
//! Variables already present on a unit cannot be cleared by `CP`, so a
//! clobbered `VA` declaration is downgraded to a plain assignment of the
//! new default value.  `EM`/`CK` writes inside the program are honored
//! over the final commit, and `S` instructions are dropped (the commit
//! saves under controlled comm settings instead).

use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use super::comm::{ResponseClass, SendOpts};
use super::config::PreserveFlags;
use super::Device;
use crate::error::{device_code, DriverError, Result};

/// `CP` and program lines take the unit a long moment to process.
const LINE_WAIT: Duration = Duration::from_millis(900);

pub fn load_microcode(device: &Device, path: &Path) -> Result<()> {
    info!("mdrive: loading microcode from {}", path.display());

    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::IsADirectory => DriverError::BadFile,
        _ => DriverError::Io,
    })?;

    // Reset any unsaved changes (comm configuration, in-flight edits).
    device.config_rollback()?;

    let opts = SendOpts {
        waittime: Some(LINE_WAIT),
        ..SendOpts::default()
    };

    // Clear stored microcode.  This makes split program files impossible,
    // and that is intentional: every install starts from nothing.
    if device.communicate("CP", &opts).class != ResponseClass::Ok {
        return Err(DriverError::Io);
    }

    let mut programming = false;
    match stream_program(device, file, &opts, &mut programming) {
        Ok(preserve) => {
            if programming && device.send("PG") == ResponseClass::Ok {
                // Bogus microcode: it entered program mode but never left.
                programming = false;
            }
            device.config_commit(Some(preserve))?;
            if programming {
                let _ = device.send("PG");
            }
            Ok(())
        }
        Err(e) => {
            // Whatever happened, the unit must not be left in program mode.
            if programming {
                let _ = device.send("PG");
            }
            Err(e)
        }
    }
}

fn stream_program(
    device: &Device,
    file: File,
    opts: &SendOpts,
    programming: &mut bool,
) -> Result<PreserveFlags> {
    let mut preserve = PreserveFlags::default();

    for raw_line in BufReader::new(file).lines() {
        let raw_line = raw_line.map_err(|_| DriverError::Io)?;

        // Strip comments (apostrophe to end of line) and whitespace.
        let line = match raw_line.find('\'') {
            Some(pos) => raw_line[..pos].trim(),
            None => raw_line.trim(),
        };
        if line.is_empty() {
            continue;
        }

        // Auto-save would persist the current comm settings; the final
        // commit handles saving under controlled ones.
        if line == "S" {
            continue;
        }

        send_program_line(device, line, opts)?;

        if let Some(rest) = line.strip_prefix("EM") {
            if !rest.starts_with(char::is_alphanumeric) {
                preserve.echo = true;
            }
        }
        if let Some(rest) = line.strip_prefix("CK") {
            if !rest.starts_with(char::is_alphanumeric) {
                preserve.checksum = true;
            }
        }
        if let Some(rest) = line.strip_prefix("PG") {
            // `PG <addr>` enters program mode; a bare `PG` leaves it.
            let address: i64 = rest.trim().parse().unwrap_or(0);
            *programming = address > 0;
        }
    }

    Ok(preserve)
}

/// Send one program line, recovering a clobbered variable declaration by
/// assigning its default to the already-existing variable.
fn send_program_line(device: &Device, line: &str, opts: &SendOpts) -> Result<()> {
    let mut tries = 2;
    loop {
        let exchange = device.communicate(line, opts);
        if exchange.class == ResponseClass::Ok {
            return Ok(());
        }

        let code = exchange.response.map_or(0, |r| r.code);
        if code == device_code::CLOBBER {
            let Some(assignment) = line.strip_prefix("VA ") else {
                // A clobbered label cannot be recovered in place.
                debug!("mdrive: clobbered non-variable line: {line}");
                return Err(DriverError::Clobbered);
            };
            if !assignment.contains('=') {
                // No default value in the program; the existing variable
                // keeps whatever it holds.
                return Ok(());
            }
            // Re-send as a plain assignment of the program's default.
            if device.communicate(assignment, opts).class == ResponseClass::Ok {
                return Ok(());
            }
            return Err(DriverError::Io);
        }

        tries -= 1;
        if tries == 0 {
            debug!("mdrive: unit refused program line: {line}");
            return Err(if code != 0 {
                DriverError::from_device_code(code)
            } else {
                DriverError::Io
            });
        }
    }
}

// ── Feature inspection ────────────────────────────────────────

impl Device {
    /// Probe the installed microcode for driver-assist features.
    ///
    /// `EX CF` prints `<version> <move_label> <following_error_var>`,
    /// with `-` standing for an unsupported feature.
    pub fn microcode_inspect(&self) -> Result<()> {
        if self.state.lock().unwrap().address == b'*' {
            return Ok(());
        }

        let opts = SendOpts {
            expect_data: true,
            // Error 30 (no such label) is handled here, not retried.
            expect_err: true,
            ..SendOpts::default()
        };
        let exchange = self.communicate("EX CF", &opts);
        if exchange.class == ResponseClass::Timeout
            || exchange.class == ResponseClass::IoError
        {
            return Err(DriverError::Io);
        }
        let response = exchange.response.ok_or(DriverError::Io)?;
        if response.code == device_code::NO_LABEL {
            return Err(DriverError::NotSupported);
        }

        let text = response.text();
        let mut fields = text.split_whitespace();
        let version: i32 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or(DriverError::Io)?;

        let mut state = self.state.lock().unwrap();
        state.microcode.version = version;
        debug!("mdrive: unit has microcode interface version {version}");

        if version >= 1 {
            if let Some(label) = fields.next() {
                state.microcode.move_label.clear();
                let _ = state.microcode.move_label.push_str(label);
                state.microcode.has_move = label != "-";
            }
            if let Some(variable) = fields.next() {
                state.microcode.following_error_var.clear();
                let _ = state.microcode.following_error_var.push_str(variable);
                state.microcode.has_following_error = variable != "-";
            }
        }
        debug!(
            "mdrive: move label '{}', following-error var '{}'",
            state.microcode.move_label, state.microcode.following_error_var
        );
        Ok(())
    }
}
