//! Firmware flashing through the factory upgrade mode.
//!
//! The unit is switched into its bootloader (`UG 2956102` + reboot at
//! 19200 baud), greeted with a magic handshake, and then fed the firmware
//! image as Intel-HEX-style records, one per line, each acknowledged with
//! a bare ACK.  The bootloader has no checksum or echo modes and announces
//! itself with a lone `$`.

use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread;
use std::time::Duration;

use super::comm::SendOpts;
use super::config::RebootOpts;
use super::{ChecksumMode, Device, DEFAULT_PORT_SPEED};
use crate::error::{DriverError, Result};

/// Baud rate the bootloader always runs at.
const UPGRADE_SPEED: u32 = 19200;

/// Pacing between handshake/record transmissions.
const RECORD_PACING: Duration = Duration::from_millis(11);

/// Backoff after a record the bootloader did not acknowledge.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Handshake attempts per magic code before declaring the unit lost.
const MAGIC_TRIES: u32 = 100;

fn open_image(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::IsADirectory => DriverError::BadFile,
        _ => DriverError::Io,
    })
}

pub fn load_firmware(device: &Device, path: &Path) -> Result<()> {
    info!("mdrive: loading firmware from {}", path.display());

    // Open before touching the unit; a bad path must not strand it in
    // upgrade mode.
    let file = open_image(path)?;

    let status = flash(device, file);

    // Error handling comes back on regardless of how the flash went.
    device.state.lock().unwrap().ignore_errors = false;
    status
}

fn flash(device: &Device, file: File) -> Result<()> {
    debug!("mdrive: entering firmware upgrade mode");

    // The unit may NACK from here on but will not answer `PR ER`.
    device.state.lock().unwrap().ignore_errors = true;

    let blind = SendOpts {
        tries: Some(1),
        expect_err: true,
        ..SendOpts::default()
    };
    let _ = device.communicate("UG 2956102", &blind);

    // The bootloader has no checksum mode and answers the ':' address.
    {
        let mut state = device.state.lock().unwrap();
        state.checksum = ChecksumMode::Off;
        state.party_mode = false;
    }

    device.reboot(Some(&RebootOpts {
        baudrate: UPGRADE_SPEED,
        no_halt: true,
    }))?;

    if !device.state.lock().unwrap().upgrade_mode {
        return Err(DriverError::Io);
    }

    // The handshake answers, in order: firmware version, config, part
    // number, serial number, and finally entry into programming mode.
    let record_opts = SendOpts {
        expect_data: true,
        expect_err: true,
        waittime: Some(Duration::from_secs(3)),
        tries: Some(1),
        raw: true,
        ..SendOpts::default()
    };

    debug!("mdrive: sending magic");
    for magic in [":IMSInc\r", "::v\r", "::c\r", "::p\r", "::s\r", "::e\r"] {
        let mut acked = false;
        for _ in 0..MAGIC_TRIES {
            thread::sleep(RECORD_PACING);
            let exchange = device.communicate(magic, &record_opts);
            if exchange.response.as_ref().is_some_and(|r| r.ack) {
                acked = true;
                break;
            }
        }
        if !acked {
            warn!("mdrive: bootloader never acknowledged {magic:?}");
            return Err(DriverError::Io);
        }
    }

    // Record lines use the default timeout algorithm.
    let line_opts = SendOpts {
        waittime: None,
        ..record_opts
    };

    let mut pacing = RECORD_PACING;
    let mut line_number = 0u32;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|_| DriverError::Io)?;

        // Records look like  :10 1EB8 00 <payload...> 51  — only ':' and
        // hex digits survive; type-03 records are skipped.
        let mut record: String = line
            .chars()
            .filter(|c| *c == ':' || c.is_ascii_hexdigit())
            .collect();
        if record.is_empty() {
            continue;
        }
        if record.len() > 8 && &record[7..9] == "03" {
            continue;
        }
        record.push('\r');

        line_number += 1;
        if line_number % 25 == 0 {
            debug!("mdrive: burning block {line_number}");
        }

        // The bootloader ACKs or NACKs each record even without checksum
        // mode.  Retry a refused record a few times, stretching the pacing
        // each time.
        let mut tries = 3;
        loop {
            thread::sleep(pacing);
            let exchange = device.communicate(&record, &line_opts);
            if exchange.response.as_ref().is_some_and(|r| r.ack) {
                break;
            }
            if tries == 0 {
                warn!("mdrive: bootloader refused record at line {line_number}");
                return Err(DriverError::Io);
            }
            tries -= 1;
            thread::sleep(RETRY_BACKOFF);
            pacing += Duration::from_millis(1);
        }
    }

    debug!("mdrive: completed, rebooting");
    device.state.lock().unwrap().ignore_errors = false;

    // Let the unit settle, then reboot without a speed change so a unit
    // still stuck in upgrade mode can be detected.
    thread::sleep(Duration::from_secs(1));
    device.state.lock().unwrap().upgrade_mode = false;
    device.reboot(Some(&RebootOpts {
        baudrate: 0,
        no_halt: false,
    }))?;

    if device.state.lock().unwrap().upgrade_mode {
        return Err(DriverError::Io);
    }

    info!("mdrive: firmware upgrade successful");
    thread::sleep(Duration::from_secs(1));

    // The unit is factory defaulted now: default speed, no party address,
    // power-on comm modes, unknown firmware version.  The caller must
    // invalidate the connection cache.
    {
        let mut state = device.state.lock().unwrap();
        state.speed = DEFAULT_PORT_SPEED;
    }
    device.config_inspect(true)?;
    {
        let mut state = device.state.lock().unwrap();
        state.address = b'!';
        state.firmware_version.clear();
    }
    Ok(())
}

/// Determine whether some unit on this channel is stuck in factory upgrade
/// mode, and recover its serial number if so.
pub fn check_ug_mode(device: &Device) -> Result<String> {
    let (old_speed, old_checksum) = {
        let mut state = device.state.lock().unwrap();
        let saved = (state.speed, state.checksum);
        state.speed = UPGRADE_SPEED;
        state.checksum = ChecksumMode::Off;
        saved
    };

    device.reboot(None)?;

    let opts = SendOpts {
        expect_data: true,
        expect_err: true,
        waittime: Some(Duration::from_millis(200)),
        tries: Some(1),
        raw: true,
        ..SendOpts::default()
    };

    let mut serial = None;
    for magic in [":IMSInc\r", "::s\r"] {
        let exchange = device.communicate(magic, &opts);
        serial = exchange
            .response
            .filter(|r| r.ack)
            .map(|r| r.text().trim().to_owned());
    }

    {
        let mut state = device.state.lock().unwrap();
        state.speed = old_speed;
        state.checksum = old_checksum;
    }

    serial.ok_or(DriverError::Io)
}
