//! Connection, mode discovery, and daemon-level aliasing.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motiond::config::DaemonConfig;
use motiond::daemon::request::Request;
use motiond::daemon::Daemon;
use motiond::driver::{MotorDriver, MotorQuery, QueryId, QueryValue};
use motiond::error::DriverError;
use motiond::mdrive::search::search;
use motiond::mdrive::{CommSettings, MdriveClass};
use motiond::timer::CallbackTimer;

use crate::mock_bus::{MockBackend, UnitConfig};

pub fn mdrive_class(backend: Arc<MockBackend>) -> MdriveClass {
    MdriveClass::new(backend, CallbackTimer::new(), CommSettings::default(), 9600)
}

#[test]
fn connect_discovers_and_sets_preferred_modes() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));

    let device = class.connect_device("/dev/ttyS0").expect("connect");

    // The unit powered on in full-echo, no-checksum mode; connect must
    // have moved it to prompt + checksum.
    let state = port.lock().unwrap();
    assert!(state.checksum_on());
    assert_eq!(state.echo_mode(), 1);
    assert!(device.stats().tx > 0);
}

#[test]
fn connect_repairs_wrong_checksum_assumption() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port(
        "/dev/ttyS0",
        UnitConfig {
            checksum_on: true,
            echo: 1,
            ..UnitConfig::default()
        },
    );
    let class = mdrive_class(Arc::clone(&backend));

    // The driver's first probe assumes no checksum and gets refused; it
    // must still converge on the unit's true modes.
    let device = class.connect_device("/dev/ttyS0").expect("connect");
    assert!(port.lock().unwrap().checksum_on());
    assert!(device.stats().nacks > 0);
}

#[test]
fn checksum_roundtrip_reads_firmware_version() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    assert_eq!(device.get_string("VR").unwrap(), "3.013");
    let stats = device.stats();
    assert_eq!(stats.bad_checksums, 0);
    assert!(stats.acks > 0);
}

#[test]
fn search_finds_unit_at_unknown_baud_and_address() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port(
        "/dev/ttyS0",
        UnitConfig {
            address: Some(b'b'),
            baud: 9600,
            echo: 1,
            ..UnitConfig::default()
        },
    );

    let found = search(backend.as_ref());
    assert_eq!(found, vec!["mdrive:///dev/ttyS0@9600:b".to_owned()]);
}

#[test]
fn daemon_aliases_identical_connection_strings() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let daemon = Daemon::with_backend(&DaemonConfig::default(), backend);

    let connect = |daemon: &Daemon| {
        let (reply, rx) = mpsc::channel();
        daemon
            .submit(Request::Connect {
                cxn: "mdrive:///dev/ttyS0@9600".into(),
                reply,
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap()
    };

    let first = connect(&daemon);
    let second = connect(&daemon);
    assert_eq!(first, second);
    assert_eq!(daemon.motors().connected_count(), 1);

    // Requests for the connected motor ride the driver-group scheduler.
    let (reply, rx) = mpsc::channel();
    daemon
        .submit(Request::QueryRead {
            motor: first,
            query: MotorQuery::read(QueryId::Position),
            reply,
        })
        .unwrap();
    let answer = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(answer.value, QueryValue::Number(0));

    daemon.shutdown();
}

#[test]
fn stale_motor_handle_never_resolves() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let daemon = Daemon::with_backend(&DaemonConfig::default(), backend);

    let (reply, rx) = mpsc::channel();
    daemon
        .submit(Request::Connect {
            cxn: "mdrive:///dev/ttyS0@9600".into(),
            reply,
        })
        .unwrap();
    let motor = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();

    let (reply, rx) = mpsc::channel();
    daemon.submit(Request::Disconnect { motor, reply }).unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();

    assert_eq!(daemon.motors().driver(motor).err(), Some(DriverError::Stale));
    daemon.shutdown();
}

#[test]
fn overflow_error_retries_within_budget() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    // First `PR P` overruns (error 63); the retry must succeed.
    port.lock().unwrap().fail_once.insert("PR P".into(), 63);

    let mut query = MotorQuery::read(QueryId::Position);
    device.read(&mut query).expect("read retried past error 63");
    assert_eq!(query.value, QueryValue::Number(0));
    assert_eq!(device.stats().overflows, 1);
}

#[test]
fn decoded_device_error_is_surfaced_not_retried() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let before = port.lock().unwrap().commands_matching("PR P");
    port.lock().unwrap().fail_once.insert("PR P".into(), 21);

    let mut query = MotorQuery::read(QueryId::Position);
    assert!(device.read(&mut query).is_err());
    // One attempt only: the decoded code ended the try loop.
    let after = port.lock().unwrap().commands_matching("PR P");
    assert_eq!(after - before, 1);
}
