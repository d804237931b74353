//! The public counter session: a small state machine wrapping exactly one
//! backend, selected once at construction time from the compile-time
//! target. Mirrors the reference implementation's own counter lifecycle
//! (`_open`/`_start`/`_stop`), generalized from a single x86/Linux backend
//! to the portable, dual/triple-backend contract.

use crate::backend::dummy::DummyBackend;
#[cfg(target_os = "macos")]
use crate::backend::userspace::UserspaceBackend;
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::backend::syscall::SyscallBackend;

use crate::error::PerfError;
use crate::event::EventKind;

/// Where a session sits in its lifecycle. Every mutating method checks this
/// before touching the backend and returns [`PerfError::WrongState`] rather
/// than letting an illegal call reach the kernel/framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting `add_event`/`add_event_raw_*`/`remove_all_events` calls.
    Configuring,
    /// Opened, counters exist and read as zero, not yet started.
    OpenedIdle,
    /// Opened and actively counting since the last `start()`.
    OpenedCounting,
    /// Reached only while a [`Session`] is being dropped; never observable
    /// from application code because the value no longer exists once
    /// `Drop::drop` returns. `close()` itself returns to `Configuring`, not
    /// here — this variant exists purely to mirror the language-neutral
    /// state table's terminal post-destruction state.
    Closed,
}

enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Syscall(SyscallBackend),
    #[cfg(target_os = "macos")]
    Userspace(UserspaceBackend),
    Dummy(DummyBackend),
}

/// A configured set of performance events, counted together as one group.
///
/// Not `Send`/`Sync`, enforced by the `PhantomData<*const ()>` marker below
/// rather than left to fall out of the backends' field types: a backend may
/// hold only plain integers (syscall backend's file descriptors are bare
/// `i32`s, which are themselves `Send`) and would otherwise auto-implement
/// `Send` despite the per-thread counting contract (§4.3, §5) requiring a
/// session never cross the thread that opened it.
pub struct Session {
    backend: Backend,
    state: SessionState,
    _not_send_sync: std::marker::PhantomData<*const ()>,
}

impl Session {
    /// Probe backend availability for this host/process. Does not
    /// allocate a session; callers typically gate a one-time fallback
    /// decision on this before constructing any [`Session`]s. `verbose`
    /// controls whether probe failures are logged at `warn` level.
    pub fn load(verbose: bool) -> bool {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            SyscallBackend::load(verbose)
        }
        #[cfg(target_os = "macos")]
        {
            UserspaceBackend::load(verbose)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
        {
            DummyBackend::load(verbose)
        }
    }

    /// Construct a new, unconfigured session using whichever backend this
    /// target selects at compile time. Always succeeds; a host without
    /// working PMU access still gets a session, just one whose `open()`
    /// will fail (syscall/userspace) or whose backend is the dummy no-op.
    pub fn new() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let backend = Backend::Syscall(SyscallBackend::new());
        #[cfg(target_os = "macos")]
        let backend = Backend::Userspace(UserspaceBackend::new());
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
        let backend = Backend::Dummy(DummyBackend::new());

        Session {
            backend,
            state: SessionState::Configuring,
            _not_send_sync: std::marker::PhantomData,
        }
    }

    fn require(&self, expected: SessionState) -> Result<(), PerfError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PerfError::WrongState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Add a portable event kind. Only legal while `Configuring`.
    pub fn add_event(&mut self, kind: EventKind) -> Result<(), PerfError> {
        self.require(SessionState::Configuring)?;
        match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.add_event(kind),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.add_event(kind),
            Backend::Dummy(b) => b.add_event(kind),
        }
    }

    /// Add a raw syscall-backend event descriptor that has no portable
    /// [`EventKind`] counterpart: a packed `(type << 32) | config` 64-bit
    /// value (see the module-level docs on the packing). Only legal while
    /// `Configuring`, and only meaningful on a session using the syscall
    /// backend — on any other backend this returns
    /// [`PerfError::UnsupportedEvent`].
    pub fn add_event_raw_syscall(&mut self, descriptor: u64, alias: Option<&str>) -> Result<(), PerfError> {
        self.require(SessionState::Configuring)?;
        match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.add_event_native(descriptor, alias),
            _ => Err(PerfError::UnsupportedEvent(EventKind::None)),
        }
    }

    /// Add a raw userspace-backend event by its canonical `kpep` database
    /// name (e.g. `"FIXED_CYCLES"`). Only legal while `Configuring`, and
    /// only meaningful on a session using the userspace backend — on any
    /// other backend this returns [`PerfError::UnsupportedEvent`].
    pub fn add_event_raw_userspace(&mut self, name: &str, alias: Option<&str>) -> Result<(), PerfError> {
        self.require(SessionState::Configuring)?;
        match &mut self.backend {
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.add_event_native(name, alias),
            _ => Err(PerfError::UnsupportedEvent(EventKind::None)),
        }
    }

    /// Probe whether `kind` resolves and can be opened on this host,
    /// without adding it to the session. Legal in any state.
    pub fn event_available(&self, kind: EventKind) -> bool {
        match &self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.event_available(kind),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.event_available(kind),
            Backend::Dummy(b) => b.event_available(kind),
        }
    }

    /// Probe a raw syscall-backend packed descriptor the same way
    /// [`Self::event_available`] probes a portable kind. `false` on any
    /// other backend. Legal in any state.
    pub fn event_available_raw_syscall(&self, descriptor: u64) -> bool {
        match &self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.event_available_native(descriptor),
            _ => false,
        }
    }

    /// Probe a raw userspace-backend `kpep` event name the same way
    /// [`Self::event_available`] probes a portable kind. `false` on any
    /// other backend. Legal in any state.
    pub fn event_available_raw_userspace(&self, name: &str) -> bool {
        match &self.backend {
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.event_available_native(name),
            _ => false,
        }
    }

    /// Clear the configured event list. Only legal while `Configuring`.
    pub fn remove_all_events(&mut self) -> Result<(), PerfError> {
        self.require(SessionState::Configuring)?;
        match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.remove_all_events(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.remove_all_events(),
            Backend::Dummy(b) => b.remove_all_events(),
        }
        Ok(())
    }

    pub fn get_event_count(&self) -> u32 {
        match &self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.event_count(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.event_count(),
            Backend::Dummy(b) => b.event_count(),
        }
    }

    pub fn get_event_names(&self) -> &[String] {
        match &self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.event_names(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.event_names(),
            Backend::Dummy(b) => b.event_names(),
        }
    }

    /// Open every configured event as one atomically-managed group and
    /// move to `OpenedIdle`. Fails and leaves the session in `Configuring`
    /// (nothing partially opened survives) if any event cannot be opened,
    /// or if no events have been added.
    pub fn open(&mut self) -> Result<(), PerfError> {
        self.require(SessionState::Configuring)?;
        let result = match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.open(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.open(),
            Backend::Dummy(b) => b.open(),
        };
        if result.is_ok() {
            self.state = SessionState::OpenedIdle;
        }
        result
    }

    /// Release kernel/framework resources and move back to `Configuring`,
    /// where events may be re-added and the session re-opened. Idempotent:
    /// closing a session that is already `Configuring` is a no-op.
    pub fn close(&mut self) {
        if self.state == SessionState::Configuring {
            return;
        }
        match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.close(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.close(),
            Backend::Dummy(b) => b.close(),
        }
        self.state = SessionState::Configuring;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::OpenedIdle | SessionState::OpenedCounting)
    }

    /// Reset counters to zero and begin counting. Legal from `OpenedIdle`.
    /// Calling `start` again while already `OpenedCounting` is a no-op that
    /// returns `Ok(())` without touching the backend or the running
    /// totals — matching the reference implementation's own
    /// `if (perf->is_counting) return true;` short-circuit.
    pub fn start(&mut self) -> Result<(), PerfError> {
        if self.state == SessionState::OpenedCounting {
            return Ok(());
        }
        if self.state != SessionState::OpenedIdle {
            return Err(PerfError::WrongState {
                expected: SessionState::OpenedIdle,
                actual: self.state,
            });
        }
        let result = match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.start(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.start(),
            Backend::Dummy(b) => b.start(),
        };
        if result.is_ok() {
            self.state = SessionState::OpenedCounting;
        }
        result
    }

    /// Stop counting and latch the final counter values. Legal only from
    /// `OpenedCounting`.
    pub fn stop(&mut self) -> Result<(), PerfError> {
        self.require(SessionState::OpenedCounting)?;
        let result = match &mut self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.stop(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.stop(),
            Backend::Dummy(b) => b.stop(),
        };
        if result.is_ok() {
            self.state = SessionState::OpenedIdle;
        }
        result
    }

    pub fn is_counting(&self) -> bool {
        self.state == SessionState::OpenedCounting
    }

    /// Current counter values, in the order events were added. Live
    /// (reflects the latest `refresh_counters`) while `OpenedCounting`;
    /// latched at the last `stop()` otherwise. Empty before the session is
    /// opened.
    pub fn get_counters(&mut self) -> &[u64] {
        if self.state == SessionState::OpenedCounting {
            match &mut self.backend {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                Backend::Syscall(b) => {
                    // Infallible at this API surface: a live snapshot mid-count
                    // best-effort-refreshes and keeps the last good values on
                    // a short read or id mismatch rather than surfacing an
                    // error through a signature the contract documents as
                    // unconditional. `stop()` performs the same read and
                    // does surface the typed error through its `Result`.
                    if let Err(e) = b.refresh_counters() {
                        log::debug!("pmubench: live counter refresh skipped: {e}");
                    }
                }
                #[cfg(target_os = "macos")]
                Backend::Userspace(b) => b.refresh_counters(),
                Backend::Dummy(b) => b.refresh_counters(),
            }
        }
        match &self.backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Syscall(b) => b.counters(),
            #[cfg(target_os = "macos")]
            Backend::Userspace(b) => b.counters(),
            Backend::Dummy(b) => b.counters(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_configuring_state() {
        let session = Session::new();
        assert_eq!(session.state, SessionState::Configuring);
        assert!(!session.is_open());
        assert!(!session.is_counting());
    }

    #[test]
    fn open_with_no_events_fails_and_stays_configuring() {
        let mut session = Session::new();
        let err = session.open().unwrap_err();
        assert!(matches!(err, PerfError::NoEvents) || matches!(err, PerfError::NotLoaded));
        assert_eq!(session.state, SessionState::Configuring);
    }

    #[test]
    fn start_before_open_is_rejected() {
        let mut session = Session::new();
        let err = session.start().unwrap_err();
        assert!(matches!(err, PerfError::WrongState { .. }));
    }

    #[test]
    fn close_before_open_is_a_harmless_noop() {
        let mut session = Session::new();
        session.close();
        assert_eq!(session.state, SessionState::Configuring);
    }

    #[test]
    fn close_returns_to_configuring_and_session_is_reusable() {
        let mut session = Session::new();
        if !Session::load(false) || !session.event_available(EventKind::Cycles) {
            eprintln!("skipping: no PMU backend available on this host");
            return;
        }
        session.add_event(EventKind::Cycles).unwrap();
        session.open().unwrap();
        session.close();
        assert_eq!(session.state, SessionState::Configuring);
        assert!(!session.is_open());

        // A closed session can be reconfigured and reopened.
        session.add_event(EventKind::Instructions).unwrap();
        session.open().unwrap();
        assert!(session.is_open());
        session.close();
    }
}
