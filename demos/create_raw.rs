//! Counts an event that has no portable `EventKind`, via each backend's
//! native descriptor syntax: a packed `(type << 32) | config` 64-bit value
//! on the syscall backend, a `kpep` event name on the userspace backend.

use pmubench::Session;

pub fn main() {
    env_logger::init();

    if !Session::load(true) {
        println!("no PMU backend available on this host; skipping");
        return;
    }

    let mut session = Session::new();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    session
        .add_event_raw_syscall((4u64 << 32) | 1, Some("branches")) // PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS
        .expect("native descriptor should resolve on a loaded backend");
    #[cfg(target_os = "macos")]
    session
        .add_event_raw_userspace("INST_BRANCH", Some("branches"))
        .expect("native descriptor should resolve on a loaded backend");

    session.open().expect("single event should open");

    session.start().expect("session was opened");
    println!();
    session.stop().expect("session was started");

    let counters = session.get_counters();
    println!("branches: {}", counters[0]);
    session.close();
}
