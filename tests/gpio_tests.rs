use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use doorbell::{
    EdgeKind, GpioError, GpioManager, GpioTimings, MockBackend, PinDirection, PullWrite,
    ResistorMode,
};

fn fast_timings() -> GpioTimings {
    GpioTimings {
        poll_interval_ms: 1,
        debounce_ms: 1,
        settle_delay_ms: 0,
    }
}

fn manager() -> (Arc<MockBackend>, GpioManager<MockBackend>) {
    let backend = Arc::new(MockBackend::default());
    let manager = GpioManager::new(Arc::clone(&backend), fast_timings());
    (backend, manager)
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn export_claims_pin_and_fixes_direction() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    assert_eq!(pin.number(), 18);
    assert_eq!(pin.direction(), PinDirection::Input);
    assert_eq!(pin.resistor_mode(), ResistorMode::Off);
    assert!(!pin.is_monitoring());
    assert_eq!(pin.name(), "Pin 18");
    assert!(backend.is_claimed(18));
    assert_eq!(backend.direction_of(18), Some(PinDirection::Input));
    assert_eq!(manager.exported_pins(), vec![18]);
}

#[test]
fn exporting_twice_fails() {
    let (_, manager) = manager();

    manager.export(18, PinDirection::Input).unwrap();
    let err = manager.export(18, PinDirection::Output).unwrap_err();
    assert!(matches!(err, GpioError::AlreadyExported(18)));
}

#[test]
fn unexport_releases_the_number_for_reexport() {
    let (backend, manager) = manager();

    manager.export(18, PinDirection::Input).unwrap();
    manager.unexport(18).unwrap();
    assert!(!backend.is_claimed(18));
    assert!(manager.exported_pins().is_empty());

    manager.export(18, PinDirection::Output).unwrap();

    let err = manager.unexport(99).unwrap_err();
    assert!(matches!(err, GpioError::NotExported(99)));
}

#[test]
fn output_state_is_cache_authoritative() {
    let (backend, manager) = manager();

    let pin = manager.export(4, PinDirection::Output).unwrap();
    assert!(!pin.get_state().unwrap());

    pin.set_state(true).unwrap();
    assert!(pin.get_state().unwrap());
    pin.set_state(false).unwrap();
    assert!(!pin.get_state().unwrap());

    // No hardware read ever happens for an output pin.
    assert_eq!(backend.read_count(4), 0);
}

#[test]
fn input_state_is_always_reread() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    backend.set_value(18, false);
    assert!(!pin.get_state().unwrap());
    backend.set_value(18, true);
    assert!(pin.get_state().unwrap());
    assert_eq!(backend.read_count(18), 2);
}

#[test]
fn set_state_on_input_fails() {
    let (_, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    let err = pin.set_state(true).unwrap_err();
    assert!(matches!(err, GpioError::InvalidDirection(_)));
}

#[test]
fn set_resistor_on_output_fails() {
    let (_, manager) = manager();

    let pin = manager.export(4, PinDirection::Output).unwrap();
    let err = manager.set_resistor(&pin, ResistorMode::PullUp).unwrap_err();
    assert!(matches!(err, GpioError::InvalidDirection(_)));
    assert_eq!(pin.resistor_mode(), ResistorMode::Off);
}

#[test]
fn set_resistor_drives_the_latch_sequence() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    manager.set_resistor(&pin, ResistorMode::PullUp).unwrap();
    assert_eq!(pin.resistor_mode(), ResistorMode::PullUp);

    assert_eq!(
        backend.pull_writes(),
        vec![
            PullWrite::Control(0b10),
            PullWrite::Clock(1 << 18),
            PullWrite::Control(0),
            PullWrite::Clock(0),
        ]
    );
}

#[test]
fn failed_latch_still_clears_the_pull_registers() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    backend.fail_next_pull_clock();

    let err = manager.set_resistor(&pin, ResistorMode::PullUp).unwrap_err();
    assert!(matches!(err, GpioError::Hardware(_)));
    assert_eq!(pin.resistor_mode(), ResistorMode::Off);

    // The control write went through before the clock write failed; both
    // registers must end up cleared anyway.
    let writes = backend.pull_writes();
    assert_eq!(
        writes,
        vec![
            PullWrite::Control(0b10),
            PullWrite::Control(0),
            PullWrite::Clock(0),
        ]
    );

    // The pin is still usable for a retry.
    manager.set_resistor(&pin, ResistorMode::PullUp).unwrap();
    assert_eq!(pin.resistor_mode(), ResistorMode::PullUp);
}

#[test]
fn set_resistor_outside_bank_zero_fails() {
    let (_, manager) = manager();

    let pin = manager.export(32, PinDirection::Input).unwrap();
    let err = manager.set_resistor(&pin, ResistorMode::PullDown).unwrap_err();
    assert!(matches!(err, GpioError::Hardware(_)));
}

#[test]
fn monitor_on_output_fails() {
    let (_, manager) = manager();

    let pin = manager.export(4, PinDirection::Output).unwrap();
    let err = pin.monitor(|_, _| {}, EdgeKind::Both).unwrap_err();
    assert!(matches!(err, GpioError::InvalidDirection(_)));
}

#[test]
fn monitoring_twice_fails() {
    let (_, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    pin.monitor(|_, _| {}, EdgeKind::Both).unwrap();
    assert!(pin.is_monitoring());

    let err = pin.monitor(|_, _| {}, EdgeKind::Both).unwrap_err();
    assert!(matches!(err, GpioError::AlreadyMonitoring(18)));

    manager.unexport(18).unwrap();
}

#[test]
fn rising_edge_fires_exactly_once() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    // The first value is consumed as the baseline read.
    backend.script_reads(18, [false, false, true, true, false]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    pin.monitor(
        move |_, new_state| {
            assert!(new_state);
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EdgeKind::Rising,
    )
    .unwrap();

    assert!(wait_for(Duration::from_secs(1), || backend.read_count(18) > 6));
    manager.unexport(18).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn both_edges_fire_twice() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    backend.script_reads(18, [false, false, true, true, false]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    pin.monitor(
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EdgeKind::Both,
    )
    .unwrap();

    assert!(wait_for(Duration::from_secs(1), || backend.read_count(18) > 6));
    manager.unexport(18).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn falling_edge_ignores_the_rise() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    backend.script_reads(18, [false, false, true, true, false]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    pin.monitor(
        move |_, new_state| {
            assert!(!new_state);
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EdgeKind::Falling,
    )
    .unwrap();

    assert!(wait_for(Duration::from_secs(1), || backend.read_count(18) > 6));
    manager.unexport(18).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn unexport_stops_the_monitor_loop() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    backend.set_value(18, false);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    pin.monitor(
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EdgeKind::Both,
    )
    .unwrap();

    backend.set_value(18, true);
    assert!(wait_for(Duration::from_secs(1), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    manager.unexport(18).unwrap();
    assert!(!pin.is_monitoring());

    // Transitions after unexport must not reach the callback.
    let settled = fired.load(Ordering::SeqCst);
    backend.set_value(18, false);
    backend.set_value(18, true);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), settled);

    manager.export(18, PinDirection::Input).unwrap();
}

#[test]
fn concurrent_unexports_release_exactly_once() {
    for _ in 0..50 {
        let (backend, manager) = manager();
        let manager = Arc::new(manager);

        let pin = manager.export(18, PinDirection::Input).unwrap();
        pin.monitor(|_, _| {}, EdgeKind::Both).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut workers = Vec::new();
        for _ in 0..2 {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                barrier.wait();
                manager.unexport(18)
            }));
        }
        let results: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect();

        // Exactly one caller tears the pin down; the other loses the race
        // and sees the pin as gone.
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(GpioError::NotExported(18))))
        );
        assert!(!backend.is_claimed(18));
        assert!(manager.exported_pins().is_empty());

        // The number is free again afterwards.
        manager.export(18, PinDirection::Input).unwrap();
    }
}

#[test]
fn cleanup_drains_the_registry() {
    let (backend, manager) = manager();

    let plain = manager.export(4, PinDirection::Output).unwrap();
    let pulled = manager.export(17, PinDirection::Input).unwrap();
    let watched = manager.export(18, PinDirection::Input).unwrap();

    manager.set_resistor(&pulled, ResistorMode::PullUp).unwrap();
    watched.monitor(|_, _| {}, EdgeKind::Both).unwrap();

    manager.cleanup();

    assert!(manager.exported_pins().is_empty());
    assert!(!backend.is_claimed(4));
    assert!(!backend.is_claimed(17));
    assert!(!backend.is_claimed(18));
    assert!(!watched.is_monitoring());
    assert_eq!(pulled.resistor_mode(), ResistorMode::Off);
    assert_eq!(plain.resistor_mode(), ResistorMode::Off);

    // The reset for pin 17 must have latched Off onto its bit.
    let writes = backend.pull_writes();
    assert_eq!(
        writes[writes.len() - 4..],
        [
            PullWrite::Control(0),
            PullWrite::Clock(1 << 17),
            PullWrite::Control(0),
            PullWrite::Clock(0),
        ]
    );

    // Idempotent on an empty registry.
    manager.cleanup();
    assert!(manager.exported_pins().is_empty());
}

#[test]
fn monitor_read_failure_surfaces_once() {
    let (backend, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    pin.monitor(|_, _| {}, EdgeKind::Both).unwrap();

    backend.fail_reads(18);
    assert!(wait_for(Duration::from_secs(1), || !pin.is_monitoring()));

    let fault = pin.take_monitor_fault();
    assert!(matches!(fault, Some(GpioError::Hardware(_))));
    assert!(pin.take_monitor_fault().is_none());

    manager.unexport(18).unwrap();
}

#[test]
fn pins_compare_by_number_and_display_their_name() {
    let (_, manager) = manager();

    let pin = manager.export(18, PinDirection::Input).unwrap();
    assert_eq!(pin.to_string(), "Pin 18");
    pin.set_name("Doorbell");
    assert_eq!(pin.to_string(), "Doorbell");
    assert_eq!(pin.name(), "Doorbell");
}
