//! Simulated MDrive units behind the serial-port traits.
//!
//! A [`MockBackend`] hosts any number of fake serial ports, each with one
//! simulated unit.  The unit keeps its own checksum/echo modes and a
//! variable store, validates inbound framing the way real units do
//! (address prefix, terminator flavor, checksum byte, line speed), and
//! composes responses in whatever mode it is currently in — so the driver
//! under test has to do real mode discovery, framing, and repair.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use motiond::mdrive::parser::calc_checksum;
use motiond::mdrive::port::{SerialBackend, SerialIo};

const ACK: u8 = 0x06;
const NACK: u8 = 0x15;

/// Initial state for a simulated unit.
pub struct UnitConfig {
    /// Party address; `None` for a single non-party unit.
    pub address: Option<u8>,
    pub baud: u32,
    pub checksum_on: bool,
    /// 0 = full echo, 1 = prompt, 2 = quiet.
    pub echo: u8,
    pub vars: HashMap<String, String>,
    /// Identification emitted for a discovery probe.
    pub serial: String,
}

impl Default for UnitConfig {
    fn default() -> Self {
        let mut vars = HashMap::new();
        for (k, v) in [
            ("MS", "256"),
            ("EE", "0"),
            ("A", "5120000"),
            ("D", "5120000"),
            ("VM", "512000"),
            ("VI", "1536"),
            ("SF", "0"),
            ("RC", "25"),
            ("HC", "5"),
            ("P", "0"),
            ("ST", "0"),
            ("V", "0"),
            ("MV", "0"),
            ("VR", "3.013"),
            ("SN", "MD34ER1234"),
            ("PN", "MDI1CRD17A4"),
        ] {
            vars.insert(k.to_owned(), v.to_owned());
        }
        Self {
            address: None,
            baud: 9600,
            checksum_on: false,
            echo: 0,
            vars,
            serial: "MD34ER1234".to_owned(),
        }
    }
}

pub struct PortState {
    // Unit state
    address: Option<u8>,
    baud: u32,
    checksum_on: bool,
    echo: u8,
    vars: HashMap<String, String>,
    serial: String,
    pending_error: u16,
    /// Command → device error code, consumed on first match.
    pub fail_once: HashMap<String, u16>,

    // Wire state
    host_baud: u32,
    to_host: VecDeque<u8>,
    rx_accum: Vec<u8>,
    /// Every byte the host ever wrote.
    pub written: Vec<u8>,
    /// Commands the unit accepted, in order (address/checksum stripped).
    pub commands: Vec<String>,
}

impl PortState {
    fn new(config: UnitConfig) -> Self {
        Self {
            address: config.address,
            baud: config.baud,
            checksum_on: config.checksum_on,
            echo: config.echo,
            vars: config.vars,
            serial: config.serial,
            pending_error: 0,
            fail_once: HashMap::new(),
            host_baud: 0,
            to_host: VecDeque::new(),
            rx_accum: Vec::new(),
            written: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Push raw bytes at the host, as an asynchronous event frame would
    /// arrive.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.to_host.extend(bytes);
    }

    pub fn commands_matching(&self, needle: &str) -> usize {
        self.commands.iter().filter(|c| c.contains(needle)).count()
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn checksum_on(&self) -> bool {
        self.checksum_on
    }

    pub fn echo_mode(&self) -> u8 {
        self.echo
    }

    // ── Inbound framing ───────────────────────────────────────

    fn pump(&mut self) {
        loop {
            if self.rx_accum.is_empty() {
                return;
            }
            // Raw control frames (halt, soft reset) carry no terminator;
            // a checksum byte may trail them.
            if self.rx_accum[0] == 0x1b || self.rx_accum[0] == 0x03 {
                self.rx_accum.remove(0);
                if self.rx_accum.first().is_some_and(|b| b & 0x80 != 0) {
                    self.rx_accum.remove(0);
                }
                continue;
            }

            let Some(end) = self
                .rx_accum
                .iter()
                .position(|b| *b == b'\r' || *b == b'\n')
            else {
                return;
            };
            let terminator = self.rx_accum[end];
            let frame: Vec<u8> = self.rx_accum.drain(..=end).take(end).collect();
            self.handle_frame(&frame, terminator);
        }
    }

    fn handle_frame(&mut self, frame: &[u8], terminator: u8) {
        if self.host_baud != self.baud {
            return; // Wrong line speed: nothing but framing errors.
        }

        let mut frame = frame.to_vec();
        let mut broadcast = false;

        match self.address {
            Some(addr) => {
                // Party units only hear LF-terminated frames for their
                // address (or the broadcast address).
                if terminator != b'\n' || frame.is_empty() {
                    return;
                }
                match frame[0] {
                    b'*' => broadcast = true,
                    b if b == addr => {}
                    _ => return,
                }
            }
            None => {
                if terminator != b'\r' {
                    return;
                }
            }
        }

        // Checksum validation happens in the mode the unit is in *now*;
        // the response is framed in whatever mode the command leaves it.
        if self.checksum_on {
            let Some((&ck, body)) = frame.split_last() else {
                return self.respond_error();
            };
            if ck != calc_checksum(body) {
                return self.respond_error();
            }
            frame = body.to_vec();
        } else if frame.last().is_some_and(|b| b & 0x80 != 0) {
            // Tolerate an assumed checksum from a probing host.
            frame.pop();
        }

        if self.address.is_some() {
            frame.remove(0);
        }

        let echo_frame = frame.clone();
        let Ok(command) = String::from_utf8(frame) else {
            return self.respond_error();
        };
        let command = command.trim().to_owned();
        self.commands.push(command.clone());

        if let Some(code) = self.fail_once.remove(&command) {
            self.pending_error = code;
            return self.respond_error();
        }

        let reply = self.execute(&command);
        if broadcast {
            return; // Units never answer global commands.
        }
        match reply {
            Ok(payload) => self.respond(&echo_frame, &payload),
            Err(code) => {
                self.pending_error = code;
                self.respond_error();
            }
        }
    }

    // ── Command execution ─────────────────────────────────────

    fn execute(&mut self, command: &str) -> Result<String, u16> {
        if command.is_empty() {
            return Ok(String::new());
        }

        if let Some(list) = command.strip_prefix("PR ") {
            return self.print_variables(list);
        }

        if command == "FD" {
            let ident = match self.address {
                Some(addr) => format!("{}${}", self.serial, addr as char),
                None => format!("{}$", self.serial),
            };
            return Ok(ident);
        }

        if command == "EX CF" {
            return match self.vars.get("CF_OUTPUT") {
                Some(out) => Ok(out.clone()),
                None => Err(30), // no such label
            };
        }

        // Moves land instantly in the simulation: position updates, the
        // unit reads back as already at rest.
        if let Some(steps) = command.strip_prefix("MA ") {
            if let Ok(target) = steps.trim().parse::<i64>() {
                self.vars.insert("P".into(), target.to_string());
            }
            return Ok(String::new());
        }
        if let Some(steps) = command.strip_prefix("MR ") {
            if let Ok(delta) = steps.trim().parse::<i64>() {
                let position: i64 = self
                    .vars
                    .get("P")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                self.vars.insert("P".into(), (position + delta).to_string());
            }
            return Ok(String::new());
        }

        if let Some((name, value)) = command.split_once('=') {
            let name = name.trim();
            let value = value.trim().trim_matches('"').to_owned();
            match name {
                "CK" => self.checksum_on = value != "0",
                "EM" => self.echo = value.parse().unwrap_or(0),
                "ER" => self.pending_error = 0,
                _ => {
                    self.vars.insert(name.to_owned(), value);
                }
            }
            return Ok(String::new());
        }

        if command == "ER" {
            self.pending_error = 0;
        }

        // Program lines, motion commands, IP/CP/S and friends all accept.
        Ok(String::new())
    }

    fn print_variables(&mut self, list: &str) -> Result<String, u16> {
        let mut out = String::new();
        for item in list.split(',') {
            let item = item.trim();
            if let Some(literal) = item.strip_prefix('"').and_then(|i| i.strip_suffix('"')) {
                out.push_str(literal);
            } else if item == "ER" {
                out.push_str(&self.pending_error.to_string());
                self.pending_error = 0;
            } else if item == "CK" {
                out.push_str(if self.checksum_on { "1" } else { "0" });
            } else if item == "EM" {
                out.push_str(&self.echo.to_string());
            } else {
                match self.vars.get(item) {
                    Some(value) => out.push_str(value),
                    None => return Err(21), // invalid variable
                }
            }
        }
        Ok(out)
    }

    // ── Response composition ──────────────────────────────────

    fn respond(&mut self, echo_frame: &[u8], payload: &str) {
        if self.echo == 2 {
            return; // Quiet mode: success is silence.
        }

        let mut out = Vec::new();
        if self.echo == 0 {
            // Full echo first, closed like a response of its own.
            out.extend_from_slice(echo_frame);
            out.extend_from_slice(b"\r\n");
        }

        if self.checksum_on {
            out.push(ACK);
            if !payload.is_empty() {
                out.extend_from_slice(payload.as_bytes());
                out.push(calc_checksum(payload.as_bytes()));
            }
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(payload.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if self.echo == 1 {
            out.push(b'>');
        }
        self.to_host.extend(out);
    }

    fn respond_error(&mut self) {
        if self.checksum_on {
            // A bare NACK; the host must come asking with `PR ER`.
            self.to_host.push_back(NACK);
        } else {
            self.to_host.extend(b"\r\n?");
        }
    }
}

// ── SerialIo / SerialBackend plumbing ─────────────────────────

pub struct MockPort(Arc<Mutex<PortState>>);

impl SerialIo for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.lock().unwrap();
        if state.to_host.is_empty() {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            match state.to_host.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.0.lock().unwrap();
        state.written.extend_from_slice(buf);
        state.rx_accum.extend_from_slice(buf);
        state.pump();
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.0.lock().unwrap().host_baud = baud;
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(MockPort(Arc::clone(&self.0))))
    }
}

#[derive(Default)]
pub struct MockBackend {
    ports: Mutex<HashMap<String, Arc<Mutex<PortState>>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, path: &str, config: UnitConfig) -> Arc<Mutex<PortState>> {
        let state = Arc::new(Mutex::new(PortState::new(config)));
        self.ports
            .lock()
            .unwrap()
            .insert(path.to_owned(), Arc::clone(&state));
        state
    }
}

impl SerialBackend for MockBackend {
    fn enumerate_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.ports.lock().unwrap().keys().cloned().collect();
        ports.sort();
        ports
    }

    fn open(&self, path: &str, baud: u32) -> io::Result<Box<dyn SerialIo>> {
        let state = self
            .ports
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))?;
        state.lock().unwrap().host_baud = baud;
        Ok(Box::new(MockPort(state)))
    }
}
