//! Serial-port boundary and the shared bus transport.
//!
//! ```text
//!   serialport crate ──▶ SerialIo / SerialBackend ──▶ Bus ──▶ Device
//!         (production)        (port traits)        (shared transport)
//! ```
//!
//! [`SerialIo`]/[`SerialBackend`] are the hardware seam: the production
//! adapter wraps the `serialport` crate, the test suite substitutes a
//! scripted in-memory device.  The driver core above never touches a TTY
//! directly.
//!
//! A [`Bus`] is one physical serial port plus everything needed to serialize
//! transactions on it: the writer handle behind the transaction lock, the
//! response stack behind the receive lock, the transaction id, and the
//! reader thread that parses the inbound byte stream.

use log::{debug, trace, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::parser::Response;
use super::Device;

// ── Port traits ───────────────────────────────────────────────

/// One open serial line.  `read` must time out quickly (returning `Ok(0)`)
/// so reader threads stay responsive to shutdown.
pub trait SerialIo: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Switch the line speed.  Devices sharing one bus may run at different
    /// speeds, so this is called on (nearly) every transaction.
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;
    /// Block until the kernel has pushed all written bytes onto the wire.
    fn drain(&mut self) -> io::Result<()>;
    /// A second handle onto the same line, for the reader thread.
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;
}

/// Factory for serial lines; also enumerates candidate ports for discovery.
pub trait SerialBackend: Send + Sync {
    fn enumerate_ports(&self) -> Vec<String>;
    fn open(&self, path: &str, baud: u32) -> io::Result<Box<dyn SerialIo>>;
}

// ── Production adapter (serialport crate) ─────────────────────

/// Read timeout on the raw port.  Short, so the reader thread can coalesce
/// bytes itself and notice shutdown promptly.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(5);

struct SystemPort(Box<dyn serialport::SerialPort>);

impl SerialIo for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut self.0, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.0, buf)
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.0
            .set_baud_rate(baud)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn drain(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.0)
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        let clone = self
            .0
            .try_clone()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Box::new(SystemPort(clone)))
    }
}

/// The host's real serial ports.
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn enumerate_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("serial: unable to enumerate ports: {e}");
                Vec::new()
            }
        }
    }

    fn open(&self, path: &str, baud: u32) -> io::Result<Box<dyn SerialIo>> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Box::new(SystemPort(port)))
    }
}

// ── Bus ───────────────────────────────────────────────────────

/// Time to put `chars` characters on the wire at `speed` baud.  The units
/// only support 8N1, so one byte costs ten bit-times.
pub fn xmit_time(speed: u32, chars: u32) -> Duration {
    let speed = speed.max(1);
    Duration::from_nanos(u64::from(chars) * 10 * 1_000_000_000 / u64::from(speed))
}

/// Writer-side state guarded by the transaction lock.
pub struct BusTx {
    pub io: Box<dyn SerialIo>,
    /// Line speed the port is currently configured for.
    pub speed: u32,
    /// Time of last transmission, for latency measurement.
    pub last_tx: Instant,
}

static NEXT_BUS_ID: AtomicU32 = AtomicU32::new(1);

/// One physical serial port shared by the devices connected through it.
pub struct Bus {
    /// Stable nonzero identity; doubles as the scheduler group tag.
    id: u32,
    path: String,

    /// Transaction lock: held for the whole of one command/response cycle.
    /// At most one transaction is in flight on a bus at any instant.
    tx: Mutex<BusTx>,

    /// Response stack (last-pushed-first) and its condition.
    rx: Mutex<Vec<Response>>,
    has_data: Condvar,

    /// Incremented (under the tx lock) for every transmit; responses queued
    /// with a smaller txid are stale.
    txid: AtomicU32,
    /// Mirror of `BusTx::speed` for the reader's character timing.
    line_speed: AtomicU32,
    /// Time of last tx or rx on the wire.
    last_activity: Mutex<Instant>,

    /// Address → device, for routing asynchronous event frames.
    devices: Mutex<Vec<(u8, Weak<Device>)>>,

    active_devices: AtomicUsize,
    shutdown: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Open `path` at `speed` and start the reader thread.
    pub fn open(
        backend: &dyn SerialBackend,
        path: &str,
        speed: u32,
    ) -> io::Result<Arc<Self>> {
        let io = backend.open(path, speed)?;
        let reader_io = io.try_clone_io()?;

        let bus = Arc::new(Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_owned(),
            tx: Mutex::new(BusTx {
                io,
                speed,
                last_tx: Instant::now(),
            }),
            rx: Mutex::new(Vec::with_capacity(16)),
            has_data: Condvar::new(),
            txid: AtomicU32::new(0),
            line_speed: AtomicU32::new(speed),
            last_activity: Mutex::new(Instant::now()),
            devices: Mutex::new(Vec::new()),
            active_devices: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let for_reader = Arc::clone(&bus);
        let handle = thread::Builder::new()
            .name(format!("mdrive-rx {path}"))
            .spawn(move || reader_thread(&for_reader, reader_io))?;
        *bus.reader.lock().unwrap() = Some(handle);

        debug!("bus {}: opened {} at {} baud", bus.id, path, speed);
        Ok(bus)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lock_tx(&self) -> MutexGuard<'_, BusTx> {
        self.tx.lock().unwrap()
    }

    pub fn current_txid(&self) -> u32 {
        self.txid.load(Ordering::Acquire)
    }

    /// Allocate the txid for a new transmit.  Caller must hold the tx lock.
    pub fn next_txid(&self) -> u32 {
        self.txid.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn line_speed(&self) -> u32 {
        self.line_speed.load(Ordering::Relaxed)
    }

    pub fn note_speed(&self, speed: u32) {
        self.line_speed.store(speed, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Drop all queued responses.  Done before a fresh transaction when no
    /// in-flight responses are expected.
    pub fn flush_responses(&self) {
        self.rx.lock().unwrap().clear();
    }

    fn push_response(&self, response: Response) {
        let mut queue = self.rx.lock().unwrap();
        queue.push(response);
        self.has_data.notify_all();
    }

    /// Pop the most recent response, waiting until `deadline`.
    pub fn wait_response(&self, deadline: Instant) -> Option<Response> {
        let mut queue = self.rx.lock().unwrap();
        loop {
            if let Some(response) = queue.pop() {
                return Some(response);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (relocked, result) = self
                .has_data
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = relocked;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    // ── Device registry (event routing + lifetime) ────────────

    pub fn register_device(&self, address: u8, device: &Arc<Device>) {
        self.active_devices.fetch_add(1, Ordering::AcqRel);
        self.devices
            .lock()
            .unwrap()
            .push((address, Arc::downgrade(device)));
    }

    /// The reader saw the unit change address (rename, rediscovery).
    pub fn reindex_device(&self, old: u8, new: u8) {
        let mut devices = self.devices.lock().unwrap();
        for entry in devices.iter_mut() {
            if entry.0 == old {
                entry.0 = new;
            }
        }
    }

    pub fn device_for_address(&self, address: u8) -> Option<Arc<Device>> {
        let devices = self.devices.lock().unwrap();
        devices
            .iter()
            .find(|(a, _)| *a == address)
            .and_then(|(_, w)| w.upgrade())
    }

    /// Release one device's hold on the bus.  The last release cancels the
    /// reader thread, drains the queue, and closes the handle (on drop).
    pub fn release_device(&self, address: u8) {
        {
            let mut devices = self.devices.lock().unwrap();
            if let Some(pos) = devices.iter().position(|(a, _)| *a == address) {
                devices.swap_remove(pos);
            }
        }
        if self.active_devices.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shutdown.store(true, Ordering::Release);
            if let Some(handle) = self.reader.lock().unwrap().take() {
                if handle.thread().id() == thread::current().id() {
                    // The last device handle died inside an event callback
                    // on the reader itself; its loop exits on the shutdown
                    // flag, it must not join its own thread.
                    drop(handle);
                } else {
                    let _ = handle.join();
                }
            }
            self.flush_responses();
            debug!("bus {}: released {}", self.id, self.path);
        }
    }
}

// ── Reader thread ─────────────────────────────────────────────

const READ_CHUNK: usize = 512;

/// Receive loop: one per bus.  Parses the inbound stream into framing
/// units, routes event frames to the emitting device, and queues command
/// responses for the writer blocked in `communicate`.
fn reader_thread(bus: &Arc<Bus>, mut io: Box<dyn SerialIo>) {
    let mut response = Response::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut txid_seen = 0u32;

    loop {
        if bus.shutdown.load(Ordering::Acquire) {
            return;
        }

        // One short sleep per cycle coalesces bytes into one read call.
        thread::sleep(xmit_time(bus.line_speed(), 4));

        let length = match io.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("bus {}: read error: {e}", bus.id());
                match e.kind() {
                    io::ErrorKind::NotFound
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::InvalidInput => return,
                    _ => continue,
                }
            }
        };

        // If the txid changed while this thread was asleep, whatever was
        // accumulated belongs to a stale transaction.
        let txid = bus.current_txid();
        if txid_seen != 0 && txid_seen != txid {
            response.reset();
        }
        txid_seen = txid;

        bus.touch_activity();

        if length == 0 {
            continue;
        }
        trace!("bus {} rx: {:02x?}", bus.id(), &buf[..length]);

        let mut offset = 0;
        while offset < length {
            let consumed = response.feed(&buf[offset..length]);
            offset += consumed;

            if response.ack || response.nack || response.processed {
                if response.event {
                    dispatch_event(bus, response.address, response.code);
                } else if offset == length {
                    // All current input consumed: hand it to the writer.
                    // An unprocessed but ACKed response is queued too, so a
                    // slow unit's early ACK reaches `communicate` promptly.
                    let mut done = std::mem::take(&mut response);
                    done.txid = bus.current_txid();
                    bus.push_response(done);
                }
                // More input follows a complete frame: it belongs to a
                // newer transmission, so the old unit is dropped.
                response = Response::new();
            }

            if consumed == 0 {
                break;
            }
        }
    }
}

/// Route an asynchronous event frame to the device it came from.
fn dispatch_event(bus: &Arc<Bus>, address: u8, code: u16) {
    debug!("bus {}: event frame from '{}': {code}", bus.id(), address as char);
    match bus.device_for_address(address) {
        Some(device) => device.wire_event(code),
        None => warn!(
            "bus {}: event for unknown address '{}'",
            bus.id(),
            address as char
        ),
    }
}
