//! Backend selection. `Session` (see `crate::session`) wraps exactly one of
//! these, chosen once at `new()` time from the compile-time target, per the
//! tagged-variant design: no conditional compilation at call sites.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod syscall;

#[cfg(target_os = "macos")]
pub mod userspace;

pub mod dummy;
