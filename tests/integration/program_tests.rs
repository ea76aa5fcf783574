//! Microcode installation, feature discovery, and query dispatch.

use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motiond::driver::{
    MotionInstruction, MotorDriver, MotorQuery, MoveKind, QueryId, QueryValue,
};
use motiond::error::DriverError;
use motiond::events::{EventCode, EventData, EventInfo};

use crate::connect_tests::mdrive_class;
use crate::mock_bus::{MockBackend, UnitConfig};

fn microcode_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write program");
    file
}

#[test]
fn clobbered_variable_declaration_recovers() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    // `myvar` already exists on the unit: the declaration errors with 28
    // and the driver must fall back to assigning the new default.
    port.lock()
        .unwrap()
        .fail_once
        .insert("VA myvar = 5".into(), 28);

    let file = microcode_file(
        "' station microcode\n\
         VA myvar = 5\n\
         PG 100\n\
         LB G1\n\
         E\n\
         PG\n\
         S\n",
    );
    device.load_microcode(file.path()).expect("install");

    let state = port.lock().unwrap();
    // The failed declaration, then the bare assignment that recovered it.
    assert_eq!(
        state
            .commands
            .iter()
            .filter(|c| c.as_str() == "myvar = 5")
            .count(),
        1
    );
    // The program's literal `S` line is never sent; the single save comes
    // from the commit.
    assert_eq!(
        state.commands.iter().filter(|c| c.as_str() == "S").count(),
        1
    );
    assert_eq!(state.commands_matching("CP"), 1);
}

#[test]
fn clobbered_label_is_fatal_and_exits_program_mode() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    port.lock().unwrap().fail_once.insert("LB G1".into(), 28);

    let file = microcode_file("PG 100\nLB G1\nE\nPG\n");
    assert_eq!(
        device.load_microcode(file.path()),
        Err(DriverError::Clobbered)
    );

    // The bail path must have left program mode behind it.
    let state = port.lock().unwrap();
    assert_eq!(state.commands.last().map(String::as_str), Some("PG"));
}

#[test]
fn missing_microcode_file_is_bad_file() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    assert_eq!(
        device.load_microcode(std::path::Path::new("/nonexistent/program.mc")),
        Err(DriverError::BadFile)
    );
}

#[test]
fn microcode_features_drive_assisted_moves() {
    let backend = Arc::new(MockBackend::new());
    let mut config = UnitConfig::default();
    // Installed microcode exposes a move label and a following-error var.
    config.vars.insert("CF_OUTPUT".into(), "1 MV FE".into());
    config.vars.insert("FE".into(), "0".into());
    let port = backend.add_port("/dev/ttyS0", config);

    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

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

    device
        .start_move(&MotionInstruction {
            kind: MoveKind::Relative,
            amount: 100_000,
            profile: crate::motion_tests::resident_profile(),
        })
        .expect("assisted move");

    // The packed control word and step count land in R1/R2 and the move
    // label is executed instead of a bare MR.
    {
        let state = port.lock().unwrap();
        assert_eq!(state.commands_matching("R1=2"), 1);
        assert_eq!(state.commands_matching("R2=5120"), 1);
        assert_eq!(state.commands_matching("EX MV"), 1);
        assert_eq!(state.commands_matching("MR "), 0);
    }

    let info = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
    let EventData::Motion(update) = info.data else {
        panic!("motion payload expected");
    };
    assert!(update.completed);
    assert_eq!(update.error, 0);
}

#[test]
fn profile_set_writes_only_the_changed_member() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let mut profile = crate::motion_tests::resident_profile();
    profile.accel = 200_000_000; // 2× the resident accel

    device.set_profile(&profile).expect("profile set");

    let state = port.lock().unwrap();
    assert_eq!(state.commands_matching("A=10240000"), 1);
    assert_eq!(state.commands_matching("D="), 0);
    assert_eq!(state.commands_matching("VM="), 0);
    assert_eq!(state.var("A"), Some("10240000"));
}

#[test]
fn setting_profile_value_to_cached_value_is_silent() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let profile = crate::motion_tests::resident_profile();
    device.set_profile(&profile).expect("first set");
    device.set_profile(&profile).expect("second set");

    let state = port.lock().unwrap();
    for member in ["A=", "D=", "VM=", "VI=", "RC=", "HC="] {
        assert_eq!(state.commands_matching(member), 0, "{member} was written");
    }
}

#[test]
fn profile_validation_rejects_out_of_range() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let mut profile = crate::motion_tests::resident_profile();
    profile.current_run = 101;
    assert_eq!(device.set_profile(&profile), Err(DriverError::Invalid));

    let mut profile = crate::motion_tests::resident_profile();
    profile.accel = 0;
    assert_eq!(device.set_profile(&profile), Err(DriverError::Invalid));

    // Slip limit requires the encoder.
    assert_eq!(device.profile_slipmax(1000), Err(DriverError::NotSupported));
}

#[test]
fn profile_get_returns_the_cached_profile() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let profile = device.profile().expect("profile get");
    assert_eq!(profile.accel, 100_000_000);
    assert_eq!(profile.decel, 100_000_000);
    assert_eq!(profile.vmax, 10_000_000);
    assert_eq!(profile.vstart, 30_000);
    assert_eq!(profile.current_run, 25);
    assert_eq!(profile.current_hold, 5);
}

#[test]
fn identity_queries_read_and_cache() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let mut query = MotorQuery::read(QueryId::Serial);
    device.read(&mut query).expect("serial");
    assert_eq!(query.value, QueryValue::Text("MD34ER1234".into()));

    let mut query = MotorQuery::read(QueryId::Firmware);
    device.read(&mut query).expect("firmware");
    assert_eq!(query.value, QueryValue::Text("3.013".into()));

    // Second read answers from the device-side cache.
    let mut query = MotorQuery::read(QueryId::Serial);
    device.read(&mut query).expect("serial again");
    assert_eq!(port.lock().unwrap().commands_matching("PR SN"), 1);
}

#[test]
fn arbitrary_variable_peek_and_poke() {
    let backend = Arc::new(MockBackend::new());
    let port = backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let mut poke = MotorQuery::write(QueryId::Variable, QueryValue::Number(42));
    poke.arg_text = "Q7".into();
    device.write(&poke).expect("poke");
    assert_eq!(port.lock().unwrap().var("Q7"), Some("42"));

    let mut peek = MotorQuery::read(QueryId::Variable);
    peek.arg_text = "Q7".into();
    device.read(&mut peek).expect("peek");
    assert_eq!(peek.value, QueryValue::Number(42));
}

#[test]
fn unsupported_writes_are_rejected() {
    let backend = Arc::new(MockBackend::new());
    backend.add_port("/dev/ttyS0", UnitConfig::default());
    let class = mdrive_class(Arc::clone(&backend));
    let device = class.connect_device("/dev/ttyS0").expect("connect");

    let query = MotorQuery::write(QueryId::Velocity, QueryValue::Number(1));
    assert_eq!(device.write(&query), Err(DriverError::NotSupported));
}
