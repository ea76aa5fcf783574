//! Motion, completion events, and stop behavior against simulated units.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motiond::driver::{MotionInstruction, MotorDriver, MoveKind, Profile, StopKind};
use motiond::events::{EventCode, EventData, EventInfo};
use motiond::mdrive::Device;

use crate::connect_tests::mdrive_class;
use crate::mock_bus::{MockBackend, UnitConfig};

/// Profile matching the mock unit's power-on values exactly (MS=256 →
/// 51200 steps/rev), so applying it issues no writes.
pub fn resident_profile() -> Profile {
    Profile {
        accel: 100_000_000,
        decel: 100_000_000,
        vmax: 10_000_000,
        vstart: 30_000,
        slip_max: 0,
        current_run: 25,
        current_hold: 5,
        hw_profile: 0,
    }
}

fn motion_events(device: &Arc<Device>) -> mpsc::Receiver<EventInfo> {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    device
        .subscribe(
            EventCode::Motion,
            Arc::new(move |info: &EventInfo| {
                let _ = tx.lock().unwrap().send(info.clone());
            }),
        )
        .expect("subscribe");
    rx
}

#[test]
fn relative_move_completes_and_signals() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");
    let events = motion_events(&device);

    device
        .start_move(&MotionInstruction {
            kind: MoveKind::Relative,
            amount: 100_000, // 0.1 rev
            profile: resident_profile(),
        })
        .expect("move");

    let info = events
        .recv_timeout(Duration::from_secs(5))
        .expect("motion event");
    let EventData::Motion(update) = info.data else {
        panic!("motion payload expected, got {:?}", info.data);
    };
    assert!(update.completed);
    assert!(!update.stalled);
    assert!(update.pos_known);
    assert_eq!(update.position, 100_000);

    let state = port.lock().unwrap();
    assert_eq!(state.commands_matching("MR 5120"), 1);
    // The requested profile matched the unit's resident one: diff-write
    // must have issued nothing.
    assert_eq!(state.commands_matching("A="), 0);
    assert_eq!(state.commands_matching("VM="), 0);
}

#[test]
fn redundant_slew_is_a_noop() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let slew = MotionInstruction {
        kind: MoveKind::Slew,
        amount: 50_000,
        profile: resident_profile(),
    };
    device.start_move(&slew).expect("first slew");
    device.start_move(&slew).expect("second slew");

    assert_eq!(port.lock().unwrap().commands_matching("SL 2560"), 1);
}

#[test]
fn superseding_move_cancels_the_first() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");
    let events = motion_events(&device);

    // A long move (10 revs, ~1.1 s projected) superseded right away.
    device
        .start_move(&MotionInstruction {
            kind: MoveKind::Relative,
            amount: 10_000_000,
            profile: resident_profile(),
        })
        .expect("first move");
    device
        .start_move(&MotionInstruction {
            kind: MoveKind::Relative,
            amount: 100_000,
            profile: resident_profile(),
        })
        .expect("second move");

    let first = events
        .recv_timeout(Duration::from_secs(5))
        .expect("cancel event");
    let EventData::Motion(update) = first.data else {
        panic!("motion payload expected");
    };
    assert!(update.cancelled);
    assert!(!update.completed);

    let second = events
        .recv_timeout(Duration::from_secs(5))
        .expect("completion event");
    let EventData::Motion(update) = second.data else {
        panic!("motion payload expected");
    };
    assert!(update.completed);
}

#[test]
fn estop_broadcasts_halt_and_deenergize() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    device.stop(StopKind::EStop).expect("estop");

    // Both frames went out on the broadcast pseudo-address, whatever the
    // originating device's party mode.
    let written = port.lock().unwrap().written.clone();
    assert!(
        written.windows(2).any(|w| w == &[b'*', 0x1b][..]),
        "broadcast ESC missing"
    );
    assert!(
        written.windows(4).any(|w| w == &b"*DE="[..]),
        "broadcast DE=0 missing"
    );
}

#[test]
fn stall_event_routes_by_address_and_clears() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port(
        "/dev/ttyS0",
        UnitConfig {
            address: Some(b'b'),
            echo: 1,
            ..UnitConfig::default()
        },
    );
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0@9600:b").expect("connect");
    let events = motion_events(&device);

    // Asynchronous stall frame from unit 'b' mid-move.
    port.lock().unwrap().inject(b"!\"b\"?86\r\n");

    let info = events
        .recv_timeout(Duration::from_secs(5))
        .expect("stall event");
    assert_eq!(info.event, EventCode::Motion);
    let EventData::Motion(update) = info.data else {
        panic!("motion payload expected");
    };
    assert!(update.stalled);
    assert_eq!(device.stats().stalls, 1);

    // The driver clears the stall flag on the unit itself.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if port.lock().unwrap().commands_matching("ST") > 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "ST never sent");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn one_shot_notify_fires_once() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    device
        .notify(
            EventCode::Motion,
            0,
            Arc::new(move |info: &EventInfo| {
                let _ = tx.lock().unwrap().send(info.clone());
            }),
        )
        .expect("notify");

    port.lock().unwrap().inject(b"!\"!\"?86\r\n");
    rx.recv_timeout(Duration::from_secs(5)).expect("first stall");

    // A second stall must not reach the one-shot subscriber.
    port.lock().unwrap().inject(b"!\"!\"?86\r\n");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(device.stats().stalls, 2);
}
