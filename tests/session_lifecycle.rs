//! Integration coverage for the counter session's state machine and for
//! the two load-bearing cross-cutting behaviors: calibrator stability and
//! tick monotonicity across repeated calibration runs.

use pmubench::{EventKind, Session};

#[test]
fn double_start_is_a_no_op_with_no_side_effects() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }

    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();

    session.start().unwrap();
    assert!(session.is_counting());

    let mut acc: u64 = 0;
    for i in 0..100_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);

    // A second `start()` while already counting returns `true` and leaves
    // the running totals untouched rather than resetting them — calling it
    // must not throw away the counts accumulated since the first `start()`.
    // Counting keeps running across the two snapshots below, so the second
    // can only be >= the first; a reset back toward zero would prove the
    // no-op regressed into re-issuing `start` on the backend.
    let before = session.get_counters()[0];
    session.start().unwrap();
    assert!(session.is_counting());
    let after = session.get_counters()[0];
    assert!(after >= before, "counter appears to have been reset by the second start(): {before} -> {after}");

    session.stop().unwrap();
    assert!(!session.is_counting());
    assert!(session.get_counters()[0] > 0);
    session.close();
}

#[test]
fn opening_with_no_events_fails_cleanly() {
    let mut session = Session::new();
    let err = session.open().unwrap_err();
    // Either the configuration was rejected for having no events, or this
    // target's backend never loaded at all — both are acceptable, a panic
    // or a partially-open session are not.
    let message = err.to_string();
    assert!(!message.is_empty());
    assert!(!session.is_open());
}

#[test]
fn stop_before_start_is_rejected() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();
    assert!(session.stop().is_err());
    session.close();
}

#[test]
fn counting_a_busy_loop_reports_nonzero_cycles() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();

    session.start().unwrap();
    let mut acc: u64 = 0;
    for i in 0..100_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);
    session.stop().unwrap();

    let counters = session.get_counters();
    assert_eq!(counters.len(), 1);
    assert!(counters[0] > 0);
    session.close();
}

#[test]
fn calibration_is_stable_across_repeated_runs() {
    pmubench::calibrate::measure_freq();
    let first = pmubench::calibrate::cpu_freq_hz();
    pmubench::calibrate::measure_freq();
    let second = pmubench::calibrate::cpu_freq_hz();

    assert!(first > 0);
    assert!(second > 0);
    let ratio = first.max(second) as f64 / first.min(second) as f64;
    assert!(ratio < 1.5, "calibrated frequency drifted too far between runs: {first} vs {second}");
}

#[test]
fn calibration_is_stable_across_five_runs() {
    // A looser bound than the §8/S2 ≤1.05 target: shared CI hardware is
    // noisier than "an otherwise-idle machine", so this only guards
    // against gross miscalibration, not CPU-governor jitter.
    let mut samples = [0u64; 5];
    for s in samples.iter_mut() {
        pmubench::calibrate::measure_freq();
        *s = pmubench::calibrate::cpu_freq_hz();
    }
    let max = *samples.iter().max().unwrap();
    let min = *samples.iter().min().unwrap();
    assert!(min > 0);
    let ratio = max as f64 / min as f64;
    assert!(ratio < 2.0, "cycles_per_sec varied too much across five runs: {samples:?}");
}

#[test]
fn get_counters_in_opened_idle_is_idempotent() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();
    session.start().unwrap();
    session.stop().unwrap();

    let first: Vec<u64> = session.get_counters().to_vec();
    let second: Vec<u64> = session.get_counters().to_vec();
    assert_eq!(first, second);
    session.close();
}

#[test]
fn add_event_after_open_is_rejected_and_count_is_unchanged() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();

    let before = session.get_event_count();
    let err = session.add_event(EventKind::Instructions).unwrap_err();
    assert!(matches!(err, pmubench::PerfError::WrongState { .. }));
    assert_eq!(session.get_event_count(), before);
    session.close();
}

#[test]
fn remove_all_events_outside_configuring_is_rejected() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();

    let before = session.get_event_count();
    assert!(session.remove_all_events().is_err());
    assert_eq!(session.get_event_count(), before);
    session.close();
}

#[cfg(target_os = "macos")]
#[test]
fn userspace_backend_overhead_subtraction_keeps_noop_window_near_zero() {
    let mut session = Session::new();
    if !Session::load(false) || !session.event_available(EventKind::Cycles) {
        eprintln!("skipping: no PMU backend available on this host");
        return;
    }
    session.add_event(EventKind::Cycles).unwrap();
    session.open().unwrap();

    session.start().unwrap();
    session.stop().unwrap();
    for &c in session.get_counters() {
        assert!(c <= 1, "expected overhead-subtracted no-op window near zero, got {c}");
    }
    session.close();
}

#[test]
fn ticks_never_go_backwards_across_a_calibration_run() {
    let before = pmubench::tick::now_ticks();
    pmubench::calibrate::measure_freq();
    let after = pmubench::tick::now_ticks();
    assert!(after >= before);
}
