//! Bus discovery: find every unit reachable from this host.
//!
//! Every candidate TTY is probed at every supported baud rate, once per
//! candidate party address plus once unaddressed.  The probe asks the unit
//! to identify itself as `<serial>$<addr>`; whatever accumulates on the
//! line after a sweep is scanned for such identifications.

use log::{debug, trace};
use regex::Regex;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use super::comm::frame_command;
use super::port::SerialBackend;
use super::BAUD_RATES;

/// Pause between probes so slow units get their answer out before the
/// next address is hit.
const PROBE_GAP: Duration = Duration::from_millis(18);

/// Console/system ttys that can never be a drive bus.
fn console_filter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(ptmx|console|tty|tty[0-9]+|ttyM32.*)$").expect("console filter")
    })
}

fn candidate_addresses() -> impl Iterator<Item = Option<u8>> {
    std::iter::once(None).chain(
        (b'a'..=b'z')
            .chain(b'A'..=b'Z')
            .chain(b'0'..=b'9')
            .map(Some),
    )
}

/// A unit that answered a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub port: String,
    pub speed: u32,
    /// `None` for a unit answering the unaddressed probe (non-party).
    pub address: Option<u8>,
}

impl Discovered {
    /// Render as a full connection string.
    pub fn connection_string(&self) -> String {
        match self.address {
            Some(addr) => format!("mdrive://{}@{}:{}", self.port, self.speed, addr as char),
            None => format!("mdrive://{}@{}", self.port, self.speed),
        }
    }
}

/// Enumerate candidate serial ports, dropping console devices.
pub fn enumerate_candidate_ports(backend: &dyn SerialBackend) -> Vec<String> {
    backend
        .enumerate_ports()
        .into_iter()
        .filter(|port| {
            let name = port.rsplit('/').next().unwrap_or(port);
            !console_filter().is_match(name)
        })
        .collect()
}

/// Probe one port at every supported baud and address.
pub fn enumerate_units_on_port(backend: &dyn SerialBackend, port: &str) -> Vec<Discovered> {
    let mut found = Vec::new();

    for baud in &BAUD_RATES {
        let Ok(mut io) = backend.open(port, baud.human) else {
            continue;
        };
        debug!("mdrive search: {port} at {} baud", baud.human);

        let mut probes: Vec<Vec<u8>> = Vec::new();
        for address in candidate_addresses() {
            // Probe with an assumed checksum; units without checksum mode
            // treat the extra byte as line noise.
            let frame = match address {
                Some(addr) => frame_command(b"FD", addr, true, true, false),
                None => frame_command(b"FD", 0, false, true, false),
            };
            if io.write_all(&frame).is_err() {
                break;
            }
            let _ = io.drain();
            probes.push(frame);
            thread::sleep(PROBE_GAP);
        }
        thread::sleep(PROBE_GAP);

        // Collect everything the sweep shook loose.
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = io.read(&mut buf) {
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        trace!("mdrive search: {port}@{}: {:02x?}", baud.human, collected);

        for hit in scan_responses(&collected, &probes) {
            let unit = Discovered {
                port: port.to_owned(),
                speed: baud.human,
                address: hit,
            };
            debug!("mdrive search: found {}", unit.connection_string());
            if !found.contains(&unit) {
                found.push(unit);
            }
        }
    }

    if !found.is_empty() {
        // Probed units reboot; give them a moment before anyone connects.
        thread::sleep(Duration::from_secs(1));
    }
    found
}

/// Scan accumulated probe responses for `<serial>$<addr>` identifications.
fn scan_responses(collected: &[u8], probes: &[Vec<u8>]) -> Vec<Option<u8>> {
    let mut hits = Vec::new();

    for chunk in collected.split(|b| *b == b'\r' || *b == b'\n') {
        // Drop prompt/error leftovers and control bytes around the text.
        let chunk: Vec<u8> = chunk
            .iter()
            .copied()
            .filter(|b| b.is_ascii_graphic() || *b == b' ')
            .skip_while(|b| *b == b'>' || *b == b'?')
            .collect();

        // Echo mode on some unit: the probe itself comes back.
        if probes.iter().any(|p| p.starts_with(&chunk) || chunk.starts_with(&p[..p.len() - 1])) {
            continue;
        }

        // Too short to be a serial-number identification.
        if chunk.len() < 8 {
            continue;
        }

        let address = match chunk.iter().position(|b| *b == b'$') {
            Some(pos) => chunk.get(pos + 1).copied(),
            None => continue,
        };
        let hit = address.filter(|a| a.is_ascii_alphanumeric());
        if !hits.contains(&hit) {
            hits.push(hit);
        }
    }
    hits
}

/// Full host sweep: every candidate port, rendered as connection strings.
pub fn search(backend: &dyn SerialBackend) -> Vec<String> {
    let mut results = Vec::new();
    for port in enumerate_candidate_ports(backend) {
        for unit in enumerate_units_on_port(backend, &port) {
            results.push(unit.connection_string());
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_ttys_are_filtered() {
        for name in ["console", "tty", "tty0", "tty12", "ptmx", "ttyM32x"] {
            assert!(console_filter().is_match(name), "{name} must be filtered");
        }
        for name in ["ttyS0", "ttyUSB0", "ttyACM3"] {
            assert!(!console_filter().is_match(name), "{name} must survive");
        }
    }

    #[test]
    fn address_sweep_covers_spec_space() {
        let addrs: Vec<_> = candidate_addresses().collect();
        assert_eq!(addrs.len(), 1 + 26 + 26 + 10);
        assert_eq!(addrs[0], None);
        assert!(addrs.contains(&Some(b'b')));
        assert!(addrs.contains(&Some(b'9')));
    }

    #[test]
    fn scan_finds_party_identification() {
        let hits = scan_responses(b"MD34ER1234$b\r\n", &[]);
        assert_eq!(hits, vec![Some(b'b')]);
    }

    #[test]
    fn scan_ignores_short_and_echoed_chunks() {
        let probe = frame_command(b"FD", b'a', true, true, false);
        let mut wire = probe.clone();
        wire.extend_from_slice(b"\r\nxx$a\r\n");
        let hits = scan_responses(&wire, &[probe]);
        assert!(hits.is_empty());
    }

    #[test]
    fn scan_dedups_addresses() {
        let hits = scan_responses(b"MD34ER1234$b\r\nMD34ER1234$b\r\n", &[]);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn connection_string_forms() {
        let party = Discovered {
            port: "/dev/ttyS0".into(),
            speed: 9600,
            address: Some(b'b'),
        };
        assert_eq!(party.connection_string(), "mdrive:///dev/ttyS0@9600:b");

        let single = Discovered {
            port: "/dev/ttyS0".into(),
            speed: 19200,
            address: None,
        };
        assert_eq!(single.connection_string(), "mdrive:///dev/ttyS0@19200");
    }
}
