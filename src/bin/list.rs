//! Prints which portable event kinds this host can actually open, one line
//! per [`EventKind`], without ever opening a counting session.

use pmubench::{EventKind, Session};

fn main() {
    env_logger::init();

    let backend_ready = Session::load(true);
    println!("backend available: {backend_ready}");
    println!();

    let session = Session::new();
    let mut available = 0;
    for &kind in EventKind::ALL {
        let ok = session.event_available(kind);
        println!("{kind:?}: {}", if ok { "available" } else { "unavailable" });
        if ok {
            available += 1;
        }
    }

    println!();
    println!("{available}/{} portable events available", EventKind::ALL.len());
}
