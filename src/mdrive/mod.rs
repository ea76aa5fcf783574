//! Device driver for the MDrive family of stepper/servo drives.
//!
//! ```text
//!  daemon worker ──▶ Device ──▶ communicate ──▶ Bus (tx lock) ──▶ TTY
//!                      ▲                          │
//!                      │        response stack ◀──┘ reader thread
//!                      └── completion timer / event frames
//! ```
//!
//! One [`Device`] per addressable unit; units sharing a serial port share
//! one [`Bus`](port::Bus).  The driver keeps a shadow of everything it has
//! observed or commanded on the unit (comm modes, profile, position) so
//! repeat writes can be elided and responses can be framed correctly.

pub mod comm;
pub mod config;
pub mod events;
pub mod firmware;
pub mod microcode;
pub mod motion;
pub mod parser;
pub mod port;
pub mod profile;
pub mod query;
pub mod search;

use log::{debug, warn};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::driver::{
    DriverClass, HomeDirection, HomeKind, MotionInstruction, MotorDriver, MotorQuery,
    Profile, StopKind, SubscriptionId,
};
use crate::error::{DriverError, Result};
use crate::events::{EventCallback, EventCode};
use crate::timer::{CallbackId, CallbackTimer};
use events::SubscriptionTable;
use port::{Bus, SerialBackend};

/// Line speed assumed when a connection string does not give one.
pub const DEFAULT_PORT_SPEED: u32 = 9600;

/// Human baud rate and the unit's `BD` encoding for it.
pub struct BaudRate {
    pub human: u32,
    pub setting: u32,
}

pub const BAUD_RATES: [BaudRate; 5] = [
    BaudRate { human: 4800, setting: 48 },
    BaudRate { human: 9600, setting: 96 },
    BaudRate { human: 19200, setting: 19 },
    BaudRate { human: 38400, setting: 38 },
    BaudRate { human: 115_200, setting: 11 },
];

pub fn baud_setting(human: u32) -> Option<u32> {
    BAUD_RATES
        .iter()
        .find(|b| b.human == human)
        .map(|b| b.setting)
}

// ── Comm modes ────────────────────────────────────────────────

/// The unit's `CK` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    Off,
    On,
    /// Checksums enabled and the unit NACKs while busy.
    BusyNack,
}

impl ChecksumMode {
    pub fn setting(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::BusyNack => 2,
        }
    }

    pub fn from_setting(value: i64) -> Self {
        match value {
            1 => Self::On,
            2 => Self::BusyNack,
            _ => Self::Off,
        }
    }

    pub fn enabled(self) -> bool {
        self != Self::Off
    }
}

/// The unit's `EM` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoMode {
    /// Full echo of every command (EM=0).
    #[default]
    On,
    /// Prompt only (EM=1); the driver's preferred mode.
    Prompt,
    /// No responses at all (EM=2).
    Quiet,
    /// Responses delayed until queried (EM=3).
    Delay,
}

impl EchoMode {
    pub fn setting(self) -> i64 {
        match self {
            Self::On => 0,
            Self::Prompt => 1,
            Self::Quiet => 2,
            Self::Delay => 3,
        }
    }

    pub fn from_setting(value: i64) -> Self {
        match value {
            1 => Self::Prompt,
            2 => Self::Quiet,
            3 => Self::Delay,
            _ => Self::On,
        }
    }
}

// ── Per-device records ────────────────────────────────────────

/// Communication and operational statistics for one unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub rx: u32,
    pub rxbytes: u32,
    pub tx: u32,
    pub txbytes: u32,
    pub acks: u32,
    pub nacks: u32,
    /// No response from the unit.
    pub timeouts: u32,
    pub resends: u32,
    pub bad_checksums: u32,
    /// Error 63s received from this unit.
    pub overflows: u32,
    /// EMA of first-response latency, nanoseconds, weight 1/32.
    pub latency_ns: u64,

    pub stalls: u32,
    pub reboots: u32,
    pub moving_ms: u64,
    pub idle_ms: u64,
    pub off_ms: u64,
}

/// Which device state has been lazy-loaded.  Cleared wholesale when the
/// unit is seen to reboot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loaded {
    pub comm_config: bool,
    pub profile: bool,
    pub encoder: bool,
    pub io: bool,
    pub enabled: bool,
}

impl Loaded {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Cached motion profile, values in micro-revolutions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileCache {
    pub accel: i64,
    pub decel: i64,
    pub vmax: i64,
    pub vstart: i64,
    pub slip_max: i64,
    pub current_run: i32,
    pub current_hold: i32,
}

/// Completion-tracking state machine for the current move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPhase {
    #[default]
    Idle,
    /// Move commanded; check-back scheduled at the projected end.
    Moving,
    /// Check-back sampling the unit now.
    Checking,
    /// Unit still decelerating at check time; a follow-up is scheduled.
    Resting,
}

/// Everything known about the move in progress (or the last move).
#[derive(Debug, Clone, Copy)]
pub struct MotionRecord {
    pub kind: Option<crate::driver::MoveKind>,
    /// Requested travel in micro-revolutions (rate for slew).
    pub urevs: i64,
    /// Starting position, steps.
    pub pstart: i32,
    pub start: Instant,
    /// Estimated end of the accel ramp, microseconds after start.
    pub vmax_us: i64,
    /// Estimated start of the decel ramp, microseconds after start.
    pub decel_us: i64,
    pub projected: Instant,
    pub phase: CompletionPhase,
    pub cb_complete: Option<CallbackId>,
    /// Bumped for each new move so a stale check-back can recognize itself.
    pub generation: u64,
    /// Following error, micro-revolutions.
    pub error: i64,
    pub stalls: u8,
}

impl Default for MotionRecord {
    fn default() -> Self {
        Self {
            kind: None,
            urevs: 0,
            pstart: 0,
            start: Instant::now(),
            vmax_us: 0,
            decel_us: 0,
            projected: Instant::now(),
            phase: CompletionPhase::Idle,
            cb_complete: None,
            generation: 0,
            error: 0,
            stalls: 0,
        }
    }
}

/// Features discovered from the unit's installed microcode (`EX CF`).
#[derive(Debug, Clone, Default)]
pub struct MicrocodeInfo {
    pub version: i32,
    pub move_label: heapless::String<4>,
    pub following_error_var: heapless::String<4>,
    pub has_move: bool,
    pub has_following_error: bool,
}

/// IO line configuration shadow (S1..S5).
#[derive(Debug, Clone, Copy, Default)]
pub struct IoConfig {
    pub kind: u8,
    pub active_high: bool,
    pub source: bool,
    /// S5 analog input range select.
    pub wide_range: bool,
    pub output: bool,
}

/// IO type codes for the `S<n>` variables.
pub mod io_type {
    pub const INPUT: u8 = 0;
    pub const HOME: u8 = 1;
    pub const LIMIT_POS: u8 = 2;
    pub const LIMIT_NEG: u8 = 3;
    pub const G0: u8 = 4;
    pub const SOFT_STOP: u8 = 5;
    pub const PAUSE: u8 = 6;
    pub const JOG_POS: u8 = 7;
    pub const JOG_NEG: u8 = 8;
    pub const ANALOG_VOLTAGE: u8 = 9;
    pub const ANALOG_CURRENT: u8 = 10;
    pub const RESET: u8 = 11;
    pub const OUTPUT: u8 = 16;
    pub const MOVING: u8 = 17;
    pub const FAULT: u8 = 18;
    pub const STALL: u8 = 19;
    pub const DELTA_V: u8 = 20;
    pub const MOVING_ABS: u8 = 23;
}

// ── Device ────────────────────────────────────────────────────

/// Mutable shadow of one unit, guarded by a single short-held lock.
///
/// Lock order: the bus tx lock is always taken before this one, never the
/// other way around.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub address: u8,
    pub party_mode: bool,
    pub checksum: ChecksumMode,
    pub echo: EchoMode,
    /// This unit's line speed.  Units sharing a bus may differ.
    pub speed: u32,
    pub upgrade_mode: bool,
    /// Don't auto-fetch the error number inside classification.
    pub ignore_errors: bool,

    pub stats: Stats,
    pub loaded: Loaded,

    pub steps_per_rev: i32,
    pub encoder: bool,
    /// Last known position, steps.
    pub position: i32,
    pub profile: ProfileCache,
    pub movement: MotionRecord,
    pub drive_disabled: bool,
    /// When the last tracked move came to rest, for idle-time accounting.
    pub last_motion_end: Option<Instant>,

    pub serial_number: heapless::String<16>,
    pub part_number: heapless::String<16>,
    pub firmware_version: heapless::String<8>,
    pub microcode: MicrocodeInfo,
    pub io: [IoConfig; 5],
}

/// Comm-layer tunables handed down from the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct CommSettings {
    pub min_tx_gap: Duration,
    pub max_retries: u32,
}

impl Default for CommSettings {
    fn default() -> Self {
        Self {
            min_tx_gap: Duration::ZERO,
            max_retries: 1,
        }
    }
}

/// One connected MDrive unit.
pub struct Device {
    pub(crate) bus: Arc<Bus>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) subs: Mutex<SubscriptionTable>,
    pub(crate) timer: Arc<CallbackTimer>,
    pub(crate) settings: CommSettings,
    pub(crate) me: Weak<Device>,
    /// Set once the device is entered in the bus routing table.  Scratch
    /// handles (broadcast peers, rename probes) stay unregistered and must
    /// not release the bus when dropped.
    registered: std::sync::atomic::AtomicBool,
}

impl Device {
    pub fn new(
        bus: Arc<Bus>,
        address: u8,
        speed: u32,
        timer: Arc<CallbackTimer>,
        settings: CommSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            state: Mutex::new(DeviceState {
                address,
                // Address '!' can't be assigned on a unit, so a device
                // carrying it is not in party mode.
                party_mode: address != b'!',
                speed,
                ..DeviceState::default()
            }),
            subs: Mutex::new(SubscriptionTable::new()),
            timer,
            settings,
            me: me.clone(),
            registered: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn mark_registered(&self) {
        self.registered
            .store(true, std::sync::atomic::Ordering::Release);
    }

    fn is_registered(&self) -> bool {
        self.registered.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn address(&self) -> u8 {
        self.state.lock().unwrap().address
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().unwrap().stats
    }

    /// A broadcast pseudo-handle on the same bus, used by estop and other
    /// all-units helpers.  It bypasses the scheduler's one-worker-per-bus
    /// routing, which is exactly what the bus tx lock exists to cover.
    pub(crate) fn broadcast_peer(&self) -> Arc<Device> {
        let state = self.state.lock().unwrap();
        let peer = Device::new(
            Arc::clone(&self.bus),
            b'*',
            state.speed,
            Arc::clone(&self.timer),
            self.settings,
        );
        {
            let mut pstate = peer.state.lock().unwrap();
            pstate.checksum = state.checksum;
            pstate.echo = state.echo;
            pstate.party_mode = true;
        }
        peer
    }

    /// A second handle to the same bus at a different address, used to talk
    /// to a unit right after renaming it.
    pub(crate) fn peer_at(&self, address: u8, party: bool) -> Arc<Device> {
        let state = self.state.lock().unwrap();
        let peer = Device::new(
            Arc::clone(&self.bus),
            address,
            state.speed,
            Arc::clone(&self.timer),
            self.settings,
        );
        {
            let mut pstate = peer.state.lock().unwrap();
            pstate.checksum = state.checksum;
            pstate.echo = state.echo;
            pstate.party_mode = party;
        }
        peer
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cancel_completion();
        if self.is_registered() {
            // Hand the unit back in user-friendly comm modes, then release
            // the bus.  Best effort: the unit may already be unreachable.
            let _ = self.set_checksum(ChecksumMode::Off, false);
            let _ = self.set_echo(EchoMode::On, false);
            self.bus.release_device(self.address());
        }
    }
}

// ── Connection strings ────────────────────────────────────────

/// Parsed `PORT[@SPEED][:ADDR]` connection-string remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdriveAddress {
    pub port: String,
    pub speed: u32,
    pub address: u8,
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("^([^@:]+)(@[0-9]+)?(:[*!a-zA-Z0-9^])?$").expect("address regex")
    })
}

pub fn parse_address(rest: &str, default_speed: u32) -> Result<MdriveAddress> {
    let captures = address_regex().captures(rest).ok_or(DriverError::Invalid)?;

    let port = captures.get(1).unwrap().as_str().to_owned();
    let speed = match captures.get(2) {
        Some(m) => m.as_str()[1..].parse().map_err(|_| DriverError::Invalid)?,
        None => default_speed,
    };
    let address = match captures.get(3) {
        Some(m) => m.as_str().as_bytes()[1],
        None => b'!',
    };

    if baud_setting(speed).is_none() {
        return Err(DriverError::Invalid);
    }

    Ok(MdriveAddress {
        port,
        speed,
        address,
    })
}

// ── Driver class ──────────────────────────────────────────────

/// The MDrive driver family: owns the serial backend and the set of open
/// buses so devices sharing a port alias one transport.
pub struct MdriveClass {
    backend: Arc<dyn SerialBackend>,
    timer: Arc<CallbackTimer>,
    settings: CommSettings,
    default_speed: u32,
    buses: Mutex<Vec<(String, Weak<Bus>)>>,
}

impl MdriveClass {
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        timer: Arc<CallbackTimer>,
        settings: CommSettings,
        default_speed: u32,
    ) -> Self {
        Self {
            backend,
            timer,
            settings,
            default_speed,
            buses: Mutex::new(Vec::new()),
        }
    }

    /// Connect the unit named by a connection-string remainder, returning
    /// the concrete device.
    pub fn connect_device(&self, rest: &str) -> Result<Arc<Device>> {
        let address = parse_address(rest, self.default_speed)?;
        debug!(
            "mdrive: connecting {}@{}:{}",
            address.port, address.speed, address.address as char
        );

        let bus = self.bus_for(&address.port, address.speed)?;
        let device = Device::new(
            bus.clone(),
            address.address,
            address.speed,
            Arc::clone(&self.timer),
            self.settings,
        );
        bus.register_device(address.address, &device);
        device.mark_registered();

        // Detect the unit's comm modes and push it into the driver's
        // preferred ones.  A unit that never answers is not connected.
        device
            .config_inspect(true)
            .map_err(|_| DriverError::CommFail)?;

        // Feature discovery is optional; stock units carry no microcode.
        if let Err(e) = device.microcode_inspect() {
            debug!("mdrive: no microcode features: {e}");
        }

        Ok(device)
    }

    /// Find or open the bus for `port`.
    fn bus_for(&self, port: &str, speed: u32) -> Result<Arc<Bus>> {
        let mut buses = self.buses.lock().unwrap();
        buses.retain(|(_, weak)| weak.strong_count() > 0);

        if let Some(bus) = buses
            .iter()
            .find(|(path, _)| path == port)
            .and_then(|(_, weak)| weak.upgrade())
        {
            return Ok(bus);
        }

        let bus = Bus::open(self.backend.as_ref(), port, speed).map_err(|e| {
            warn!("mdrive: unable to open {port}: {e}");
            DriverError::CommFail
        })?;
        buses.push((port.to_owned(), Arc::downgrade(&bus)));
        Ok(bus)
    }
}

impl DriverClass for MdriveClass {
    fn name(&self) -> &'static str {
        "mdrive"
    }

    fn search(&self) -> Vec<String> {
        search::search(self.backend.as_ref())
    }

    fn connect(&self, rest: &str) -> Result<Arc<dyn MotorDriver>> {
        Ok(self.connect_device(rest)?)
    }
}

// ── Driver trait glue ─────────────────────────────────────────

impl MotorDriver for Device {
    fn group(&self) -> u32 {
        self.bus.id()
    }

    fn reset(&self) -> Result<()> {
        self.reboot(None)
    }

    fn start_move(&self, instruction: &MotionInstruction) -> Result<()> {
        motion::move_device(self, instruction)
    }

    fn stop(&self, kind: StopKind) -> Result<()> {
        motion::stop_device(self, kind)
    }

    fn home(&self, kind: HomeKind, direction: HomeDirection) -> Result<()> {
        motion::home_device(self, kind, direction)
    }

    fn read(&self, query: &mut MotorQuery) -> Result<()> {
        query::read_variable(self, query)
    }

    fn write(&self, query: &MotorQuery) -> Result<()> {
        query::write_variable(self, query)
    }

    fn profile(&self) -> Result<Profile> {
        profile::get_profile(self)
    }

    fn set_profile(&self, profile: &Profile) -> Result<()> {
        profile::set_profile(self, profile)
    }

    fn notify(
        &self,
        event: EventCode,
        condition: i32,
        callback: EventCallback,
    ) -> Result<SubscriptionId> {
        self.add_subscription(event, condition, callback, true)
    }

    fn subscribe(&self, event: EventCode, callback: EventCallback) -> Result<SubscriptionId> {
        self.add_subscription(event, 0, callback, false)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.remove_subscription(id)
    }

    fn load_firmware(&self, path: &Path) -> Result<()> {
        firmware::load_firmware(self, path)
    }

    fn load_microcode(&self, path: &Path) -> Result<()> {
        microcode::load_microcode(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_connection_string() {
        let a = parse_address("/dev/ttyS0@115200:a", DEFAULT_PORT_SPEED).unwrap();
        assert_eq!(a.port, "/dev/ttyS0");
        assert_eq!(a.speed, 115_200);
        assert_eq!(a.address, b'a');
    }

    #[test]
    fn parse_defaults() {
        let a = parse_address("/dev/ttyUSB1", DEFAULT_PORT_SPEED).unwrap();
        assert_eq!(a.speed, 9600);
        assert_eq!(a.address, b'!');
    }

    #[test]
    fn parse_speed_only() {
        let a = parse_address("/dev/ttyS2@19200", DEFAULT_PORT_SPEED).unwrap();
        assert_eq!(a.speed, 19_200);
        assert_eq!(a.address, b'!');
    }

    #[test]
    fn parse_broadcast_address() {
        let a = parse_address("/dev/ttyS0:*", DEFAULT_PORT_SPEED).unwrap();
        assert_eq!(a.address, b'*');
    }

    #[test]
    fn parse_rejects_bad_speed() {
        assert!(parse_address("/dev/ttyS0@1234", DEFAULT_PORT_SPEED).is_err());
    }

    #[test]
    fn parse_rejects_bad_address() {
        assert!(parse_address("/dev/ttyS0:ab", DEFAULT_PORT_SPEED).is_err());
        assert!(parse_address("/dev/ttyS0:$", DEFAULT_PORT_SPEED).is_err());
    }

    #[test]
    fn baud_table_round_trip() {
        assert_eq!(baud_setting(9600), Some(96));
        assert_eq!(baud_setting(115_200), Some(11));
        assert_eq!(baud_setting(2400), None);
    }

    #[test]
    fn checksum_and_echo_settings_round_trip() {
        for mode in [ChecksumMode::Off, ChecksumMode::On, ChecksumMode::BusyNack] {
            assert_eq!(ChecksumMode::from_setting(mode.setting()), mode);
        }
        for mode in [EchoMode::On, EchoMode::Prompt, EchoMode::Quiet, EchoMode::Delay] {
            assert_eq!(EchoMode::from_setting(mode.setting()), mode);
        }
    }
}
