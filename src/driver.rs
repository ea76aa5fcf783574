//! The stable driver contract and the daemon-side driver registry.
//!
//! A [`DriverClass`] knows how to discover and connect devices of one
//! family; a [`MotorDriver`] is one connected device.  The daemon resolves
//! connection strings of the form `class://rest` through the
//! [`DriverRegistry`], and caches instances by connection string so two
//! clients naming the same motor share one driver ([`MotorTable`]).
//!
//! Motor handles are `(generation, index)` pairs: a handle to a
//! disconnected motor can never resolve to a slot that was since reused.

use log::{debug, info};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{DriverError, Result};
use crate::events::{EventCallback, EventCode};

// ── Motion vocabulary ─────────────────────────────────────────

/// How a move interprets its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// Travel to an absolute position (micro-revolutions).
    Absolute,
    /// Travel a relative distance (micro-revolutions).
    Relative,
    /// Run at a constant rate (micro-revolutions per second).
    Slew,
    /// Oscillate around the current position.
    Jitter,
}

/// The tuple governing one move.  All rates and distances are in
/// micro-revolutions (per second, per second squared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub accel: i64,
    pub decel: i64,
    pub vmax: i64,
    pub vstart: i64,
    /// Max encoder slip before a stall is flagged.  Honored only when the
    /// unit's encoder is enabled.
    pub slip_max: i64,
    /// Run current, percent.
    pub current_run: i32,
    /// Holding current, percent.
    pub current_hold: i32,
    /// Hardware profile slot stored in device microcode (0 = none).
    pub hw_profile: u8,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            accel: 1_000_000,
            decel: 1_000_000,
            vmax: 768_000,
            vstart: 30_000,
            slip_max: 0,
            current_run: 25,
            current_hold: 5,
            hw_profile: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotionInstruction {
    pub kind: MoveKind,
    /// Micro-revolutions (or urev/sec for slew).
    pub amount: i64,
    pub profile: Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Decelerate to a stop.
    Stop,
    /// Stop immediately and abort running microcode.
    Halt,
    /// Halt every motor reachable on the same bus and de-energize coils.
    EStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeKind {
    /// Microcode-preferred homing routine.
    Default,
    /// Home to hard stop.
    HardStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeDirection {
    Positive,
    Negative,
}

// ── Query vocabulary ──────────────────────────────────────────

/// What a read/write query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryId {
    Position,
    Velocity,
    Accelerating,
    Moving,
    Stalled,
    Input,
    Output,

    // Individual items from the motion profile
    Accel,
    Decel,
    VMax,
    VInitial,
    RunCurrent,
    HoldCurrent,
    SlipMax,
    Encoder,

    /// Arbitrary device variable, named in `arg_text`.
    Variable,
    /// Execute a microcode label named in the value.
    Execute,

    IoType,
    IoParm1,
    IoParm2,

    Serial,
    Part,
    Firmware,
    Microcode,
    Baudrate,
    Checksum,
    Echo,
    Address,
    /// Name a unit by serial number.
    Name,
    FactoryDefaults,
}

/// Value slot for a query (in for writes, out for reads).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryValue {
    #[default]
    None,
    Number(i64),
    Text(String),
}

impl QueryValue {
    pub fn number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// One read or write request against a device.
#[derive(Debug, Clone, Default)]
pub struct MotorQuery {
    pub query: Option<QueryId>,
    /// Item selector (IO port number, condition).
    pub arg_number: i64,
    /// Item selector as text (variable name, serial number).
    pub arg_text: String,
    pub value: QueryValue,
}

impl MotorQuery {
    pub fn read(query: QueryId) -> Self {
        Self {
            query: Some(query),
            ..Self::default()
        }
    }

    pub fn write(query: QueryId, value: QueryValue) -> Self {
        Self {
            query: Some(query),
            value,
            ..Self::default()
        }
    }
}

/// Subscription handle: generation + slot, per the stale-handle rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    pub index: u16,
    pub generation: u32,
}

// ── Driver traits ─────────────────────────────────────────────

/// One connected device.  All methods may block on serial traffic and are
/// expected to be called from a daemon worker (or the completion timer).
pub trait MotorDriver: Send + Sync {
    /// Scheduler group: the identity of the bus this device lives on.
    /// Devices sharing a group must be driven from a single worker.
    fn group(&self) -> u32;

    /// Reboot the device, rolling back unsaved settings.
    fn reset(&self) -> Result<()>;

    fn start_move(&self, instruction: &MotionInstruction) -> Result<()>;
    fn stop(&self, kind: StopKind) -> Result<()>;
    fn home(&self, kind: HomeKind, direction: HomeDirection) -> Result<()>;

    fn read(&self, query: &mut MotorQuery) -> Result<()>;
    fn write(&self, query: &MotorQuery) -> Result<()>;

    /// Current motion profile as the device knows it.
    fn profile(&self) -> Result<Profile>;
    fn set_profile(&self, profile: &Profile) -> Result<()>;

    /// One-shot notification for `event`; re-register after delivery.
    fn notify(
        &self,
        event: EventCode,
        condition: i32,
        callback: EventCallback,
    ) -> Result<SubscriptionId>;
    /// Persistent subscription for `event`.
    fn subscribe(&self, event: EventCode, callback: EventCallback) -> Result<SubscriptionId>;
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    fn load_firmware(&self, path: &Path) -> Result<()>;
    fn load_microcode(&self, path: &Path) -> Result<()>;
}

impl std::fmt::Debug for dyn MotorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MotorDriver {{ group: {} }}", self.group())
    }
}

impl PartialEq for dyn MotorDriver {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// A device family: discovery plus connection.
pub trait DriverClass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scan for reachable devices; returns full connection strings
    /// (`class://...`).
    fn search(&self) -> Vec<String>;

    /// Connect the device identified by `rest` (the connection string with
    /// the `class://` prefix already removed).
    fn connect(&self, rest: &str) -> Result<Arc<dyn MotorDriver>>;
}

// ── Registry ──────────────────────────────────────────────────

fn cxn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^([^:]+)://(.+)$").expect("connection regex"))
}

/// Process-wide set of registered driver classes.
pub struct DriverRegistry {
    classes: Mutex<Vec<Arc<dyn DriverClass>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, class: Arc<dyn DriverClass>) {
        info!("driver: registered class '{}'", class.name());
        self.classes.lock().unwrap().push(class);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn DriverClass>> {
        self.classes
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Run `search` on the named class and return its connection strings.
    pub fn search(&self, class: &str) -> Result<Vec<String>> {
        let class = self.lookup(class).ok_or(DriverError::Invalid)?;
        Ok(class.search())
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Connection cache ──────────────────────────────────────────

/// Handle the daemon gives clients for a connected motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorId {
    pub index: u16,
    pub generation: u32,
}

struct MotorSlot {
    generation: u32,
    /// Connection string; cleared on invalidation so the slot is never
    /// aliased again, while existing handles keep working.
    cxn: Option<String>,
    driver: Option<Arc<dyn MotorDriver>>,
    refs: u32,
}

/// Fixed-capacity table of connected motors, keyed by connection string.
pub struct MotorTable {
    registry: Arc<DriverRegistry>,
    slots: Mutex<Vec<MotorSlot>>,
}

/// Upper bound on simultaneously connected motors.
pub const MAX_MOTORS: usize = 64;

impl MotorTable {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        let slots = (0..MAX_MOTORS)
            .map(|_| MotorSlot {
                generation: 0,
                cxn: None,
                driver: None,
                refs: 0,
            })
            .collect();
        Self {
            registry,
            slots: Mutex::new(slots),
        }
    }

    /// Connect (or alias) the motor named by `cxn_string`.
    ///
    /// Two calls with the same string return the same instance; the second
    /// call only bumps the reference count.
    pub fn connect(&self, cxn_string: &str) -> Result<MotorId> {
        let captures = cxn_regex()
            .captures(cxn_string)
            .ok_or(DriverError::Invalid)?;
        let class_name = captures.get(1).unwrap().as_str();
        let rest = captures.get(2).unwrap().as_str();

        let class = self
            .registry
            .lookup(class_name)
            .ok_or(DriverError::Invalid)?;

        {
            let mut slots = self.slots.lock().unwrap();
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.cxn.as_deref() == Some(cxn_string) && slot.driver.is_some() {
                    slot.refs += 1;
                    debug!("driver: aliased '{cxn_string}'");
                    return Ok(MotorId {
                        index: index as u16,
                        generation: slot.generation,
                    });
                }
            }
        }

        // Connect outside the table lock: device setup involves serial
        // traffic and can take a while.
        let driver = class.connect(rest)?;

        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| s.driver.is_none())
            .ok_or(DriverError::TooMany)?;
        let slot = &mut slots[index];
        slot.generation += 1;
        slot.cxn = Some(cxn_string.to_owned());
        slot.driver = Some(driver);
        slot.refs = 1;
        info!("driver: connected '{cxn_string}' as motor {index}");
        Ok(MotorId {
            index: index as u16,
            generation: slot.generation,
        })
    }

    pub fn driver(&self, id: MotorId) -> Result<Arc<dyn MotorDriver>> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(id.index as usize).ok_or(DriverError::Stale)?;
        if slot.generation != id.generation {
            return Err(DriverError::Stale);
        }
        slot.driver.clone().ok_or(DriverError::Stale)
    }

    /// Release one client reference; the driver is dropped (and the device
    /// disconnected) when the last reference goes.
    pub fn disconnect(&self, id: MotorId) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(id.index as usize).ok_or(DriverError::Stale)?;
        if slot.generation != id.generation || slot.driver.is_none() {
            return Err(DriverError::Stale);
        }
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slot.cxn = None;
            slot.driver = None;
            debug!("driver: motor {} fully disconnected", id.index);
        }
        Ok(())
    }

    /// Forget the connection string for the slot holding `driver`, so a
    /// later connect with the original string performs a fresh connection.
    /// Used after operations that change a device's address or speed.
    pub fn invalidate(&self, driver: &Arc<dyn MotorDriver>) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(d) = &slot.driver {
                if Arc::ptr_eq(d, driver) {
                    debug!("driver: cache invalidated for '{:?}'", slot.cxn);
                    slot.cxn = None;
                    return;
                }
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.driver.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMotor;
    impl MotorDriver for FakeMotor {
        fn group(&self) -> u32 {
            7
        }
        fn reset(&self) -> Result<()> {
            Ok(())
        }
        fn start_move(&self, _: &MotionInstruction) -> Result<()> {
            Ok(())
        }
        fn stop(&self, _: StopKind) -> Result<()> {
            Ok(())
        }
        fn home(&self, _: HomeKind, _: HomeDirection) -> Result<()> {
            Err(DriverError::NotSupported)
        }
        fn read(&self, _: &mut MotorQuery) -> Result<()> {
            Ok(())
        }
        fn write(&self, _: &MotorQuery) -> Result<()> {
            Ok(())
        }
        fn profile(&self) -> Result<Profile> {
            Ok(Profile::default())
        }
        fn set_profile(&self, _: &Profile) -> Result<()> {
            Ok(())
        }
        fn notify(&self, _: EventCode, _: i32, _: EventCallback) -> Result<SubscriptionId> {
            Ok(SubscriptionId {
                index: 0,
                generation: 1,
            })
        }
        fn subscribe(&self, _: EventCode, _: EventCallback) -> Result<SubscriptionId> {
            Ok(SubscriptionId {
                index: 0,
                generation: 1,
            })
        }
        fn unsubscribe(&self, _: SubscriptionId) -> Result<()> {
            Ok(())
        }
        fn load_firmware(&self, _: &Path) -> Result<()> {
            Err(DriverError::BadFile)
        }
        fn load_microcode(&self, _: &Path) -> Result<()> {
            Err(DriverError::BadFile)
        }
    }

    struct FakeClass;
    impl DriverClass for FakeClass {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn search(&self) -> Vec<String> {
            vec!["fake://dev0".into()]
        }
        fn connect(&self, rest: &str) -> Result<Arc<dyn MotorDriver>> {
            if rest.is_empty() {
                return Err(DriverError::Invalid);
            }
            Ok(Arc::new(FakeMotor))
        }
    }

    fn table() -> MotorTable {
        let registry = Arc::new(DriverRegistry::new());
        registry.register(Arc::new(FakeClass));
        MotorTable::new(registry)
    }

    #[test]
    fn connect_twice_aliases() {
        let motors = table();
        let a = motors.connect("fake://dev0").unwrap();
        let b = motors.connect("fake://dev0").unwrap();
        assert_eq!(a, b);
        assert_eq!(motors.connected_count(), 1);

        let da = motors.driver(a).unwrap();
        let db = motors.driver(b).unwrap();
        assert!(Arc::ptr_eq(&da, &db));
    }

    #[test]
    fn bad_connection_string_is_invalid() {
        let motors = table();
        assert_eq!(motors.connect("no-scheme"), Err(DriverError::Invalid));
        assert_eq!(motors.connect("nosuch://x"), Err(DriverError::Invalid));
    }

    #[test]
    fn disconnect_releases_only_after_last_ref() {
        let motors = table();
        let a = motors.connect("fake://dev0").unwrap();
        let _b = motors.connect("fake://dev0").unwrap();

        motors.disconnect(a).unwrap();
        assert_eq!(motors.connected_count(), 1);
        motors.disconnect(a).unwrap();
        assert_eq!(motors.connected_count(), 0);
        assert_eq!(motors.driver(a), Err(DriverError::Stale));
    }

    #[test]
    fn stale_generation_never_resolves() {
        let motors = table();
        let a = motors.connect("fake://dev0").unwrap();
        motors.disconnect(a).unwrap();

        let b = motors.connect("fake://dev0").unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert_eq!(motors.driver(a), Err(DriverError::Stale));
        assert!(motors.driver(b).is_ok());
    }

    #[test]
    fn invalidate_forces_fresh_connect() {
        let motors = table();
        let a = motors.connect("fake://dev0").unwrap();
        let driver = motors.driver(a).unwrap();

        motors.invalidate(&driver);
        let b = motors.connect("fake://dev0").unwrap();
        assert_ne!(a, b);
        assert_eq!(motors.connected_count(), 2);
    }

    #[test]
    fn registry_search_unknown_class() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.search("nope"), Err(DriverError::Invalid));
    }
}
