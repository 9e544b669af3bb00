mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use remote_desktop_portal::{Error, PersistMode, Point, RemoteDesktop};
use support::{config_in, Call, FakePortal};

const BTN_LEFT: i32 = 0x110;

fn shared(portal: &FakePortal, dir: &tempfile::TempDir) -> Arc<RemoteDesktop<FakePortal>> {
    let desktop = RemoteDesktop::with_transport(config_in(dir), portal.clone()).expect("runtime");
    desktop.initialize(PersistMode::UntilRevoked, true).unwrap();
    portal.clear_calls();
    Arc::new(desktop)
}

#[test]
fn frames_and_input_from_several_threads_keep_each_call_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let portal = FakePortal::new();
    let desktop = shared(&portal, &dir);

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let desktop = desktop.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    assert!(!desktop.get_frame().unwrap().is_empty());
                }
            })
        })
        .collect();
    let clicker = {
        let desktop = desktop.clone();
        thread::spawn(move || desktop.click(Point::new(150, 80), 1))
    };
    let typist = {
        let desktop = desktop.clone();
        thread::spawn(move || desktop.type_text("ab", Duration::ZERO))
    };

    for reader in readers {
        reader.join().unwrap();
    }
    clicker.join().unwrap().unwrap();
    typist.join().unwrap().unwrap();

    let calls = portal.input_calls();
    let pointer: Vec<_> = calls
        .iter()
        .filter(|call| matches!(call, Call::MotionAbsolute { .. } | Call::Button { .. }))
        .cloned()
        .collect();
    assert_eq!(
        pointer,
        vec![
            Call::MotionAbsolute {
                stream: 42,
                x: 50.0,
                y: 30.0,
            },
            Call::Button {
                button: BTN_LEFT,
                state: 1,
            },
            Call::Button {
                button: BTN_LEFT,
                state: 0,
            },
        ]
    );
    let keys: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Keysym { keysym, state } => Some((*keysym, *state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        keys,
        vec![
            ('a' as i32, 1),
            ('a' as i32, 0),
            ('b' as i32, 1),
            ('b' as i32, 0),
        ]
    );
}

#[test]
fn close_wakes_a_blocked_screenshot() {
    let dir = tempfile::tempdir().unwrap();
    let portal = FakePortal::new();
    portal.produce_frames(false);
    let desktop = shared(&portal, &dir);

    let started = Instant::now();
    let waiter = {
        let desktop = desktop.clone();
        thread::spawn(move || desktop.capture_screenshot())
    };
    thread::sleep(Duration::from_millis(100));
    desktop.close();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::StreamUnavailable)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!desktop.is_active());
}
