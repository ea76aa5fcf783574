//! Peek/poke dispatch for everything that isn't motion.
//!
//! The driver is chiefly designed for motion and motion events; all other
//! characteristics of a unit are reached through a generic read/write
//! query, routed through the static table below.  Simple rows name a
//! device variable and are satisfied by `PR <var>` / `<var>=<value>`;
//! special rows carry peek/poke functions for the cases that need real
//! work (renaming a unit, changing its stored baud rate, IO setup).

use log::{debug, info};
use std::thread;
use std::time::Duration;

use super::comm::{ResponseClass, SendOpts};
use super::{io_type, ChecksumMode, Device, EchoMode, BAUD_RATES};
use crate::driver::{MotorQuery, QueryId, QueryValue};
use crate::error::{DriverError, Result};

type Peek = fn(&Device, &mut MotorQuery) -> Result<()>;
type Poke = fn(&Device, &MotorQuery) -> Result<()>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Plain integer variable.
    Int,
    /// Integer variable holding steps, surfaced as micro-revolutions.
    UrevInt,
    /// String variable.
    Str,
    /// Integer variable selected by item number (`I1`, `O3`).
    IntItem,
    /// Peek/poke functions do all the work.
    Custom,
}

struct QueryDef {
    id: QueryId,
    kind: Kind,
    variable: Option<&'static str>,
    peek: Option<Peek>,
    poke: Option<Poke>,
}

static QUERY_TABLE: &[QueryDef] = &[
    QueryDef { id: QueryId::Position, kind: Kind::UrevInt, variable: Some("P"), peek: None, poke: Some(position_poke) },
    QueryDef { id: QueryId::Velocity, kind: Kind::UrevInt, variable: Some("V"), peek: None, poke: None },
    QueryDef { id: QueryId::Accelerating, kind: Kind::Int, variable: Some("VC"), peek: None, poke: None },
    QueryDef { id: QueryId::Moving, kind: Kind::Int, variable: Some("MV"), peek: None, poke: None },
    QueryDef { id: QueryId::Stalled, kind: Kind::Int, variable: Some("ST"), peek: None, poke: Some(stalled_poke) },
    QueryDef { id: QueryId::Input, kind: Kind::IntItem, variable: Some("I"), peek: None, poke: None },
    QueryDef { id: QueryId::Output, kind: Kind::IntItem, variable: Some("O"), peek: None, poke: Some(output_poke) },

    // Profile members answer from the lazy-loaded shadow.
    QueryDef { id: QueryId::Accel, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::Decel, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::VMax, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::VInitial, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::RunCurrent, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::HoldCurrent, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::SlipMax, kind: Kind::Custom, variable: None, peek: Some(profile_peek), poke: None },
    QueryDef { id: QueryId::Encoder, kind: Kind::Int, variable: Some("EE"), peek: None, poke: Some(ee_poke) },

    QueryDef { id: QueryId::Variable, kind: Kind::Custom, variable: None, peek: Some(var_peek), poke: Some(var_poke) },
    QueryDef { id: QueryId::Execute, kind: Kind::Custom, variable: None, peek: None, poke: Some(ex_poke) },

    QueryDef { id: QueryId::IoType, kind: Kind::Custom, variable: None, peek: Some(io_peek), poke: Some(io_poke) },
    QueryDef { id: QueryId::IoParm1, kind: Kind::Custom, variable: None, peek: Some(io_peek), poke: Some(io_poke) },
    QueryDef { id: QueryId::IoParm2, kind: Kind::Custom, variable: None, peek: Some(io_peek), poke: Some(io_poke) },

    QueryDef { id: QueryId::Serial, kind: Kind::Custom, variable: Some("SN"), peek: Some(sn_peek), poke: None },
    QueryDef { id: QueryId::Part, kind: Kind::Custom, variable: Some("PN"), peek: Some(pn_peek), poke: None },
    QueryDef { id: QueryId::Firmware, kind: Kind::Custom, variable: Some("VR"), peek: Some(vr_peek), poke: None },
    QueryDef { id: QueryId::Microcode, kind: Kind::Str, variable: Some("AA"), peek: None, poke: None },
    QueryDef { id: QueryId::Baudrate, kind: Kind::Custom, variable: Some("BD"), peek: Some(bd_peek), poke: Some(bd_poke) },
    QueryDef { id: QueryId::Checksum, kind: Kind::Int, variable: Some("CK"), peek: None, poke: Some(checksum_poke) },
    QueryDef { id: QueryId::Echo, kind: Kind::Int, variable: Some("EM"), peek: None, poke: None },

    QueryDef { id: QueryId::Address, kind: Kind::Str, variable: Some("DN"), peek: None, poke: Some(address_poke) },
    QueryDef { id: QueryId::Name, kind: Kind::Custom, variable: None, peek: None, poke: Some(name_poke) },
    QueryDef { id: QueryId::FactoryDefaults, kind: Kind::Custom, variable: Some("FD"), peek: None, poke: Some(fd_poke) },
];

fn lookup(id: QueryId) -> Option<&'static QueryDef> {
    QUERY_TABLE.iter().find(|def| def.id == id)
}

// ── Driver entry points ───────────────────────────────────────

pub fn read_variable(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let id = query.query.ok_or(DriverError::Invalid)?;
    let def = lookup(id).ok_or(DriverError::NotSupported)?;

    match def.kind {
        Kind::Int => {
            let value = device.get_integer(def.variable.unwrap())?;
            query.value = QueryValue::Number(value);
        }
        Kind::UrevInt => {
            let value = device.get_integer(def.variable.unwrap())?;
            query.value = QueryValue::Number(device.steps_to_microrevs(value as i32)?);
        }
        Kind::Str => {
            let text = device.get_string(def.variable.unwrap())?;
            if text.is_empty() {
                return Err(DriverError::Io);
            }
            query.value = QueryValue::Text(text);
        }
        Kind::IntItem => {
            let variable = format!("{}{}", def.variable.unwrap(), query.arg_number);
            let value = device.get_integer(&variable)?;
            query.value = QueryValue::Number(value);
        }
        Kind::Custom => {
            let peek = def.peek.ok_or(DriverError::NotSupported)?;
            peek(device, query)?;
        }
    }
    Ok(())
}

pub fn write_variable(device: &Device, query: &MotorQuery) -> Result<()> {
    let id = query.query.ok_or(DriverError::Invalid)?;
    let def = lookup(id).ok_or(DriverError::NotSupported)?;
    let poke = def.poke.ok_or(DriverError::NotSupported)?;
    poke(device, query)
}

// ── Simple pokes ──────────────────────────────────────────────

fn position_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let urevs = query.value.number().ok_or(DriverError::Invalid)?;
    let steps = device.microrevs_to_steps(urevs)?;
    device.set_variable("P", i64::from(steps))?;
    device.state.lock().unwrap().position = steps;
    Ok(())
}

fn stalled_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let value = query.value.number().ok_or(DriverError::Invalid)?;
    device.set_variable("ST", value)
}

fn output_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let value = query.value.number().ok_or(DriverError::Invalid)?;
    device.set_variable(&format!("O{}", query.arg_number), value)
}

fn ee_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let enable = query.value.number().ok_or(DriverError::Invalid)? != 0;
    if device.state.lock().unwrap().encoder == enable {
        return Ok(());
    }

    device.set_variable("EE", i64::from(enable))?;

    // Steps-per-rev and the whole profile scale change with the encoder.
    let mut state = device.state.lock().unwrap();
    state.loaded.encoder = false;
    state.loaded.profile = false;
    state.encoder = enable;
    Ok(())
}

fn var_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    if query.arg_text.is_empty() {
        return Err(DriverError::Invalid);
    }
    let value = device.get_integer(&query.arg_text)?;
    query.value = QueryValue::Number(value);
    Ok(())
}

fn var_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    if query.arg_text.is_empty() {
        return Err(DriverError::Invalid);
    }
    let value = query.value.number().ok_or(DriverError::Invalid)?;
    device.set_variable(&query.arg_text, value)
}

fn ex_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let label = query.value.text().ok_or(DriverError::Invalid)?;
    match device.send(&format!("EX {label}")) {
        ResponseClass::Ok => Ok(()),
        _ => Err(DriverError::Io),
    }
}

// ── Identity peeks (cached on the device) ─────────────────────

fn sn_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let cached = device.state.lock().unwrap().serial_number.clone();
    let serial = if cached.is_empty() {
        let serial = device.get_string("SN")?;
        if serial.is_empty() {
            return Err(DriverError::Io);
        }
        let mut state = device.state.lock().unwrap();
        let _ = state.serial_number.push_str(&serial);
        serial
    } else {
        cached.as_str().to_owned()
    };
    query.value = QueryValue::Text(serial);
    Ok(())
}

fn pn_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let cached = device.state.lock().unwrap().part_number.clone();
    let part = if cached.is_empty() {
        let part = device.get_string("PN")?;
        if part.is_empty() {
            return Err(DriverError::Io);
        }
        let mut state = device.state.lock().unwrap();
        let _ = state.part_number.push_str(&part);
        part
    } else {
        cached.as_str().to_owned()
    };
    query.value = QueryValue::Text(part);
    Ok(())
}

fn vr_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let cached = device.state.lock().unwrap().firmware_version.clone();
    let version = if cached.is_empty() {
        let version = device.get_string("VR")?;
        if version.is_empty() {
            return Err(DriverError::Io);
        }
        let mut state = device.state.lock().unwrap();
        let _ = state.firmware_version.push_str(&version);
        version
    } else {
        cached.as_str().to_owned()
    };
    query.value = QueryValue::Text(version);
    Ok(())
}

// ── Profile / comm peeks and pokes ────────────────────────────

fn profile_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    device.lazyload_profile()?;
    let state = device.state.lock().unwrap();
    let value = match query.query {
        Some(QueryId::Accel) => state.profile.accel,
        Some(QueryId::Decel) => state.profile.decel,
        Some(QueryId::VMax) => state.profile.vmax,
        Some(QueryId::VInitial) => state.profile.vstart,
        Some(QueryId::RunCurrent) => i64::from(state.profile.current_run),
        Some(QueryId::HoldCurrent) => i64::from(state.profile.current_hold),
        Some(QueryId::SlipMax) => state.profile.slip_max,
        _ => return Err(DriverError::Invalid),
    };
    query.value = QueryValue::Number(value);
    Ok(())
}

fn bd_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let speed = device.state.lock().unwrap().speed;
    if !BAUD_RATES.iter().any(|b| b.human == speed) {
        return Err(DriverError::Io);
    }
    query.value = QueryValue::Number(i64::from(speed));
    Ok(())
}

fn bd_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let speed = query.value.number().ok_or(DriverError::Invalid)?;
    device.config_set_baudrate(speed as u32)
}

fn checksum_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let mode = query.value.number().ok_or(DriverError::Invalid)?;
    device.set_checksum(ChecksumMode::from_setting(mode), false)
}

fn address_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let text = query.value.text().ok_or(DriverError::Invalid)?;
    let address = *text.as_bytes().first().ok_or(DriverError::Invalid)?;
    device.config_set_address(address)
}

/// Factory defaults.  The unit drops off the bus afterwards, so both
/// probes are fired blind.
fn fd_poke(device: &Device, _query: &MotorQuery) -> Result<()> {
    let opts = SendOpts {
        expect_err: true,
        tries: Some(1),
        waittime: Some(Duration::from_millis(20)),
        ..SendOpts::default()
    };
    let _ = device.communicate("", &opts);

    // Assume checksum mode: a unit without it ignores the trailing byte,
    // while a unit in checksum mode refuses the command without one.
    let saved = device.state.lock().unwrap().checksum;
    device.state.lock().unwrap().checksum = ChecksumMode::On;
    let _ = device.communicate("FD", &opts);
    device.state.lock().unwrap().checksum = saved;

    // Nothing is known about the unit's configuration any more.
    device.state.lock().unwrap().loaded.clear();
    Ok(())
}

// ── Renaming a unit by serial number ──────────────────────────

/// Install and run a one-shot naming routine: every unit on the bus gets
/// the program, only the one whose `SN` matches takes the new device name
/// and enables party mode.  The result is verified by reading the serial
/// back through a scratch handle at the new address.
fn name_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let serial = query.arg_text.as_str();
    let new_address = *query
        .value
        .text()
        .and_then(|t| t.as_bytes().first())
        .ok_or(DriverError::Invalid)?;
    if serial.is_empty() {
        return Err(DriverError::Invalid);
    }
    info!(
        "mdrive: naming unit with S/N {serial} as '{}'",
        new_address as char
    );

    // Likely talking to more than one unit: silence unsolicited responses
    // first.  Assume checksum is on; the shadow is forced afterwards since
    // a crowded line garbles any confirmation.
    device.state.lock().unwrap().checksum = ChecksumMode::On;
    let _ = device.set_checksum(ChecksumMode::Off, false);
    device.state.lock().unwrap().checksum = ChecksumMode::Off;
    device.set_echo(EchoMode::Quiet, true)?;

    let prologue = ["ER".to_owned(), "CP N".to_owned()];
    let program = [
        "PG 100".to_owned(),
        "LB N".to_owned(),
        // All other units skip to the end of the routine.
        format!("BR N2, SN <> {serial}"),
        format!("DN = {}", u32::from(new_address)),
        "PY = 1".to_owned(),
        "LB N2".to_owned(),
        "E".to_owned(),
        "PG".to_owned(),
    ];

    for section in [&prologue[..], &program[..]] {
        for line in section {
            let _ = device.send(line);
        }
        thread::sleep(Duration::from_millis(600));
    }

    let _ = device.send("EX N");

    // The renamed unit now answers at the new party address; this handle
    // keeps the broadcast-ish identity for further naming.
    let renamed = device.peer_at(new_address, true);
    {
        let mut state = renamed.state.lock().unwrap();
        state.checksum = ChecksumMode::Off;
        state.echo = EchoMode::Quiet;
    }
    renamed.set_echo(EchoMode::Prompt, false)?;

    let readback = renamed.get_string("SN")?;
    if readback != serial {
        debug!("mdrive: naming verification failed: '{readback}'");
        return Err(DriverError::Io);
    }

    // Clear the naming routine and save the settings on the renamed unit.
    let opts = SendOpts {
        waittime: Some(Duration::from_millis(600)),
        ..SendOpts::default()
    };
    let _ = renamed.communicate("CP N", &opts);
    renamed.config_commit(None)
}

// ── IO configuration ──────────────────────────────────────────

impl Device {
    /// Load the IO line setup from the unit on first use.
    fn lazyload_io(&self) -> Result<()> {
        if self.state.lock().unwrap().loaded.io {
            return Ok(());
        }

        let exchange = self.communicate(
            "PR S1,\":\",S2,\":\",S3,\":\",S4,\":\",S5",
            &SendOpts::data(),
        );
        if !exchange.is_ok() {
            return Err(DriverError::Io);
        }
        let text = exchange.response.map(|r| r.text()).unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        for (index, group) in text.split(':').take(5).enumerate() {
            let mut fields = group.trim().split(',').map(|f| f.trim().parse::<i64>());
            let kind = fields.next().and_then(core::result::Result::ok).unwrap_or(0);
            let parm1 = fields.next().and_then(core::result::Result::ok).unwrap_or(0);
            let parm2 = fields.next().and_then(core::result::Result::ok).unwrap_or(0);

            let io = &mut state.io[index];
            io.kind = kind as u8;
            if index == 4 {
                io.wide_range = parm1 != 0;
            } else {
                io.active_high = parm1 != 0;
                io.source = parm2 != 0;
            }
            io.output = io.kind >= io_type::OUTPUT;
        }
        state.loaded.io = true;
        Ok(())
    }
}

fn io_port(query: &MotorQuery) -> Result<usize> {
    let port = query.arg_number;
    if port < 1 {
        return Err(DriverError::Invalid);
    }
    if port > 5 {
        return Err(DriverError::NotSupported);
    }
    Ok(port as usize)
}

fn io_peek(device: &Device, query: &mut MotorQuery) -> Result<()> {
    let port = io_port(query)?;
    device.lazyload_io()?;

    let state = device.state.lock().unwrap();
    let io = state.io[port - 1];
    let value = match query.query {
        Some(QueryId::IoType) => i64::from(io.kind),
        Some(QueryId::IoParm1) => {
            if port == 5 {
                i64::from(io.wide_range)
            } else {
                i64::from(io.active_high)
            }
        }
        Some(QueryId::IoParm2) => {
            if port == 5 {
                return Err(DriverError::Invalid);
            }
            i64::from(io.source)
        }
        _ => return Err(DriverError::Invalid),
    };
    query.value = QueryValue::Number(value);
    Ok(())
}

/// Changes sync to the unit as soon as the port has a type, so setting the
/// type last minimizes traffic.
fn io_poke(device: &Device, query: &MotorQuery) -> Result<()> {
    let port = io_port(query)?;
    device.lazyload_io()?;

    let value = query.value.number().ok_or(DriverError::Invalid)?;
    let mut io = device.state.lock().unwrap().io[port - 1];

    match query.query {
        Some(QueryId::IoType) => {
            let kind = value as u8;
            if port == 5 {
                match kind {
                    io_type::ANALOG_VOLTAGE | io_type::ANALOG_CURRENT => io.kind = kind,
                    _ => return Err(DriverError::Invalid),
                }
            } else {
                match kind {
                    io_type::OUTPUT
                    | io_type::MOVING
                    | io_type::FAULT
                    | io_type::STALL
                    | io_type::DELTA_V
                    | io_type::MOVING_ABS => {
                        io.output = true;
                        io.kind = kind;
                    }
                    io_type::INPUT
                    | io_type::HOME
                    | io_type::LIMIT_POS
                    | io_type::LIMIT_NEG
                    | io_type::G0
                    | io_type::SOFT_STOP
                    | io_type::PAUSE
                    | io_type::JOG_POS
                    | io_type::JOG_NEG
                    | io_type::RESET => {
                        io.output = false;
                        io.kind = kind;
                    }
                    _ => return Err(DriverError::Invalid),
                }
            }
        }
        Some(QueryId::IoParm1) => {
            if port == 5 {
                io.wide_range = value != 0;
            } else {
                io.active_high = value != 0;
            }
        }
        Some(QueryId::IoParm2) => {
            if port == 5 {
                return Err(DriverError::Invalid);
            }
            io.source = value != 0;
        }
        _ => return Err(DriverError::Invalid),
    }

    let command = if port == 5 {
        // The analog input can only be configured once its type is known.
        if io.kind == 0 {
            device.state.lock().unwrap().io[port - 1] = io;
            return Ok(());
        }
        format!("S5={},{}", io.kind, i64::from(io.wide_range))
    } else {
        format!(
            "S{port}={},{},{}",
            io.kind,
            i64::from(io.active_high),
            i64::from(io.source)
        )
    };

    match device.send(&command) {
        ResponseClass::Ok => {
            device.state.lock().unwrap().io[port - 1] = io;
            Ok(())
        }
        _ => Err(DriverError::Io),
    }
}
