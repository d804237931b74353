//! Dummy backend: compiled in whenever neither the syscall nor the
//! userspace backend targets the host. Every mutating call fails; this
//! keeps callers portable without `cfg` at call sites (spec §4.6).

use crate::error::PerfError;
use crate::event::EventKind;

#[derive(Debug, Default)]
pub struct DummyBackend {
    names: Vec<String>,
}

impl DummyBackend {
    pub fn load(verbose: bool) -> bool {
        if verbose {
            log::warn!("pmubench: no PMU backend available on this target");
        }
        false
    }

    pub fn new() -> Self {
        DummyBackend::default()
    }

    pub fn add_event(&mut self, kind: EventKind) -> Result<(), PerfError> {
        Err(PerfError::UnsupportedEvent(kind))
    }

    pub fn event_available(&self, _kind: EventKind) -> bool {
        false
    }

    pub fn remove_all_events(&mut self) {
        self.names.clear();
    }

    pub fn event_count(&self) -> u32 {
        0
    }

    pub fn event_names(&self) -> &[String] {
        &self.names
    }

    pub fn open(&mut self) -> Result<(), PerfError> {
        Err(PerfError::NotLoaded)
    }

    pub fn close(&mut self) {}

    pub fn start(&mut self) -> Result<(), PerfError> {
        Err(PerfError::NotLoaded)
    }

    pub fn stop(&mut self) -> Result<(), PerfError> {
        Err(PerfError::NotLoaded)
    }

    pub fn counters(&self) -> &[u64] {
        &[]
    }

    pub fn refresh_counters(&mut self) {}
}
