//! Portable hardware performance counters and a tick clock calibrated to
//! wall-clock time, for writing benchmarks that report cycles and
//! cache/branch behavior instead of only elapsed time.
//!
//! The three pieces compose independently:
//!
//! - [`tick`] reads a monotonic, high-resolution hardware tick on every
//!   supported target, with a wall-clock fallback where no such counter
//!   exists.
//! - [`calibrate`] turns a run of ticks into seconds and, on targets where
//!   a tick isn't already a cycle, into an estimated cycle count.
//! - [`session`] opens a group of hardware performance-monitoring counters
//!   (cycles, instructions, branches, cache traffic) and reads them back
//!   atomically, via whichever of the syscall, userspace-framework or
//!   dummy backends this target selects.

pub mod calibrate;
pub mod error;
pub mod event;
pub mod session;
pub mod tick;

mod backend;

pub use error::PerfError;
pub use event::EventKind;
pub use session::{Session, SessionState};
