//! macOS `kperf`/`kperfdata` private-framework backend. Grounded on the
//! Apple branch of the reference C implementation (`yybench_perf.c`) for
//! the state machine and overhead-subtraction protocol, and on the
//! `darwin-kperf-sys` crate's symbol table for which `kpc_*`/`kpep_*`
//! entry points exist and what each one touches. Binds both frameworks
//! with `libloading`, the ecosystem's dynamic-linker binding facility,
//! rather than a hand-rolled `dlopen` wrapper.

use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use libloading::{Library, Symbol};

use crate::error::PerfError;
use crate::event::EventKind;

const KPERF_PATH: &str = "/System/Library/PrivateFrameworks/kperf.framework/kperf";
const KPERFDATA_PATH: &str = "/System/Library/PrivateFrameworks/kperfdata.framework/kperfdata";

/// Hardware-defined ceiling on simultaneously configured counters. The
/// reference implementation's own fixed-size snapshot arrays cap usable
/// slots here regardless of what the live framework could in principle
/// support.
const MAX_COUNTERS: usize = 8;

type KpcPmuVersion = unsafe extern "C" fn() -> u32;
type KpcSetCounting = unsafe extern "C" fn(classes: u32) -> c_int;
type KpcSetThreadCounting = unsafe extern "C" fn(classes: u32) -> c_int;
type KpcGetThreadCounters = unsafe extern "C" fn(tid: u32, buf_count: u32, buf: *mut u64) -> c_int;

type KpepDbCreate = unsafe extern "C" fn(cpu_name: *const c_char, db_out: *mut *mut c_void) -> c_int;
type KpepConfigCreate = unsafe extern "C" fn(db: *mut c_void, cfg_out: *mut *mut c_void) -> c_int;
type KpepConfigFree = unsafe extern "C" fn(cfg: *mut c_void);
type KpepDbEvent = unsafe extern "C" fn(db: *mut c_void, name: *const c_char, ev_out: *mut *mut c_void) -> c_int;
type KpepConfigAddEvent = unsafe extern "C" fn(cfg: *mut c_void, ev: *mut *mut c_void, flag: u32, err: *mut u32) -> c_int;
type KpepConfigRemoveEvent = unsafe extern "C" fn(cfg: *mut c_void, index: usize) -> c_int;
type KpepConfigEventsCount = unsafe extern "C" fn(cfg: *mut c_void, count_out: *mut usize) -> c_int;
type KpepConfigKpcClasses = unsafe extern "C" fn(cfg: *mut c_void, classes_out: *mut u32) -> c_int;
type KpepConfigApply = unsafe extern "C" fn(cfg: *mut c_void) -> c_int;

struct Symbols {
    _kperf: Library,
    _kperfdata: Library,
    kpc_pmu_version: KpcPmuVersion,
    kpc_set_counting: KpcSetCounting,
    kpc_set_thread_counting: KpcSetThreadCounting,
    kpc_get_thread_counters: KpcGetThreadCounters,
    kpep_db_create: KpepDbCreate,
    kpep_config_create: KpepConfigCreate,
    kpep_config_free: KpepConfigFree,
    kpep_db_event: KpepDbEvent,
    kpep_config_add_event: KpepConfigAddEvent,
    kpep_config_remove_event: KpepConfigRemoveEvent,
    kpep_config_events_count: KpepConfigEventsCount,
    kpep_config_kpc_classes: KpepConfigKpcClasses,
    kpep_config_apply: KpepConfigApply,
}

// SAFETY: the resolved function pointers are plain `extern "C" fn`s with no
// interior mutability; the libraries they come from are kept alive for the
// process lifetime in `SYMBOLS`.
unsafe impl Send for Symbols {}
unsafe impl Sync for Symbols {}

static SYMBOLS: OnceLock<Option<Symbols>> = OnceLock::new();
// SAFETY: `db` is only ever read after `OnceLock` init; kpep_db is an
// opaque, append-only handle for the process lifetime.
struct DbHandle(*mut c_void);
unsafe impl Send for DbHandle {}
unsafe impl Sync for DbHandle {}

static DB: OnceLock<DbHandle> = OnceLock::new();
static LOADED: AtomicBool = AtomicBool::new(false);

fn load_symbols(verbose: bool) -> Option<Symbols> {
    macro_rules! bind {
        ($lib:expr, $name:literal) => {{
            let sym: Symbol<'_, _> = match unsafe { $lib.get($name) } {
                Ok(s) => s,
                Err(e) => {
                    if verbose {
                        log::warn!("pmubench: missing symbol {} ({e})", stringify!($name));
                    }
                    return None;
                }
            };
            *sym
        }};
    }

    let kperf = match unsafe { Library::new(KPERF_PATH) } {
        Ok(l) => l,
        Err(e) => {
            if verbose {
                log::warn!("pmubench: failed to load {KPERF_PATH}: {e}");
            }
            return None;
        }
    };
    let kperfdata = match unsafe { Library::new(KPERFDATA_PATH) } {
        Ok(l) => l,
        Err(e) => {
            if verbose {
                log::warn!("pmubench: failed to load {KPERFDATA_PATH}: {e}");
            }
            return None;
        }
    };

    let kpc_pmu_version = bind!(kperf, b"kpc_pmu_version\0");
    let kpc_set_counting = bind!(kperf, b"kpc_set_counting\0");
    let kpc_set_thread_counting = bind!(kperf, b"kpc_set_thread_counting\0");
    let kpc_get_thread_counters = bind!(kperf, b"kpc_get_thread_counters\0");
    let kpep_db_create = bind!(kperfdata, b"kpep_db_create\0");
    let kpep_config_create = bind!(kperfdata, b"kpep_config_create\0");
    let kpep_config_free = bind!(kperfdata, b"kpep_config_free\0");
    let kpep_db_event = bind!(kperfdata, b"kpep_db_event\0");
    let kpep_config_add_event = bind!(kperfdata, b"kpep_config_add_event\0");
    let kpep_config_remove_event = bind!(kperfdata, b"kpep_config_remove_event\0");
    let kpep_config_events_count = bind!(kperfdata, b"kpep_config_events_count\0");
    let kpep_config_kpc_classes = bind!(kperfdata, b"kpep_config_kpc_classes\0");
    let kpep_config_apply = bind!(kperfdata, b"kpep_config_apply\0");

    Some(Symbols {
        _kperf: kperf,
        _kperfdata: kperfdata,
        kpc_pmu_version,
        kpc_set_counting,
        kpc_set_thread_counting,
        kpc_get_thread_counters,
        kpep_db_create,
        kpep_config_create,
        kpep_config_free,
        kpep_db_event,
        kpep_config_add_event,
        kpep_config_remove_event,
        kpep_config_events_count,
        kpep_config_kpc_classes,
        kpep_config_apply,
    })
}

fn symbols() -> Option<&'static Symbols> {
    SYMBOLS.get_or_init(|| load_symbols(false)).as_ref()
}

/// Per-architecture canonical-event-name tables. Only a subset of
/// `EventKind` is resolvable on this backend, matching the reference
/// implementation's own tables exactly.
#[cfg(target_arch = "aarch64")]
fn canonical_name(kind: EventKind) -> Option<&'static str> {
    Some(match kind {
        EventKind::Cycles => "FIXED_CYCLES",
        EventKind::Instructions => "FIXED_INSTRUCTIONS",
        EventKind::Branches => "INST_BRANCH",
        EventKind::BranchMisses => "BRANCH_MISPREDICT",
        EventKind::L1dLoadMisses => "DCACHE_LOAD_MISS",
        EventKind::L1dStoreMisses => "DCACHE_STORE_MISS",
        _ => return None,
    })
}

#[cfg(not(target_arch = "aarch64"))]
fn canonical_name(kind: EventKind) -> Option<&'static str> {
    Some(match kind {
        EventKind::Cycles => "CPU_CLK_UNHALTED.THREAD",
        EventKind::Instructions => "INST_RETIRED.ANY",
        EventKind::Branches => "BR_INST_RETIRED.ALL_BRANCHES",
        EventKind::BranchMisses => "BR_MISP_RETIRED.ALL_BRANCHES",
        _ => return None,
    })
}

pub struct UserspaceBackend {
    cfg: *mut c_void,
    names: Vec<String>,
    classes: u32,
    counters_begin: [u64; MAX_COUNTERS],
    counters_end: [u64; MAX_COUNTERS],
    counters_overhead: [u64; MAX_COUNTERS],
    counters: [u64; MAX_COUNTERS],
}

impl UserspaceBackend {
    /// Construct an unconfigured backend. Never fails: the `kpep_config`
    /// handle is created lazily on first use so a session can exist (and
    /// report `NotLoaded` errors cleanly) even on a host where `load()`
    /// never succeeded.
    pub fn new() -> Self {
        UserspaceBackend {
            cfg: std::ptr::null_mut(),
            names: Vec::new(),
            classes: 0,
            counters_begin: [0; MAX_COUNTERS],
            counters_end: [0; MAX_COUNTERS],
            counters_overhead: [0; MAX_COUNTERS],
            counters: [0; MAX_COUNTERS],
        }
    }

    fn ensure_cfg(&mut self) -> Result<&'static Symbols, PerfError> {
        let syms = symbols().ok_or(PerfError::NotLoaded)?;
        if self.cfg.is_null() {
            let db = DB.get().ok_or(PerfError::NotLoaded)?.0;
            let mut cfg: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { (syms.kpep_config_create)(db, &mut cfg) };
            if rc != 0 || cfg.is_null() {
                return Err(PerfError::LoadFailed(format!("kpep_config_create failed (rc={rc})")));
            }
            self.cfg = cfg;
        }
        Ok(syms)
    }

    pub fn load(verbose: bool) -> bool {
        if LOADED.load(Ordering::Relaxed) {
            return true;
        }
        let Some(syms) = ({
            if SYMBOLS.get().is_none() {
                let _ = SYMBOLS.set(load_symbols(verbose));
            }
            symbols()
        }) else {
            return false;
        };

        if DB.get().is_none() {
            let mut db_ptr: *mut c_void = std::ptr::null_mut();
            let rc = unsafe { (syms.kpep_db_create)(std::ptr::null(), &mut db_ptr) };
            if rc != 0 || db_ptr.is_null() {
                if verbose {
                    log::warn!("pmubench: kpep_db_create failed (rc={rc})");
                }
                return false;
            }
            let _ = DB.set(DbHandle(db_ptr));
        }

        let version = unsafe { (syms.kpc_pmu_version)() };
        const KPC_PMU_ERROR: u32 = 0;
        if version == KPC_PMU_ERROR {
            if verbose {
                log::warn!(
                    "pmubench: kpc_pmu_version() reported no PMU access; this backend \
                     requires root or the com.apple.private.kernel.kpc entitlement"
                );
            }
            return false;
        }

        LOADED.store(true, Ordering::Relaxed);
        true
    }

    pub fn add_event(&mut self, kind: EventKind) -> Result<(), PerfError> {
        let name = canonical_name(kind).ok_or(PerfError::UnsupportedEvent(kind))?;
        self.add_event_native(name, None)
    }

    pub fn add_event_native(&mut self, name: &str, alias: Option<&str>) -> Result<(), PerfError> {
        if self.names.len() >= MAX_COUNTERS {
            return Err(PerfError::CapacityExceeded { max: MAX_COUNTERS });
        }
        let syms = self.ensure_cfg()?;
        let db = DB.get().ok_or(PerfError::NotLoaded)?.0;
        let cname = CString::new(name).map_err(|_| PerfError::UnsupportedEvent(EventKind::None))?;

        let mut ev: *mut c_void = std::ptr::null_mut();
        let rc = unsafe { (syms.kpep_db_event)(db, cname.as_ptr(), &mut ev) };
        if rc != 0 || ev.is_null() {
            return Err(PerfError::LoadFailed(format!("unknown event {name}")));
        }

        let mut err: u32 = 0;
        let rc = unsafe { (syms.kpep_config_add_event)(self.cfg, &mut ev, 0, &mut err) };
        if rc != 0 {
            return Err(PerfError::LoadFailed(format!("kpep_config_add_event failed (err={err})")));
        }

        self.names.push(alias.unwrap_or(name).to_string());
        Ok(())
    }

    pub fn event_available(&self, kind: EventKind) -> bool {
        let Some(name) = canonical_name(kind) else { return false };
        self.event_available_native(name)
    }

    /// Probe a canonical `kpep` database event name directly, the same way
    /// [`Self::event_available`] probes a portable [`EventKind`].
    pub fn event_available_native(&self, name: &str) -> bool {
        let Some(syms) = symbols() else { return false };
        let Some(db_handle) = DB.get() else { return false };
        let db = db_handle.0;
        let Ok(cname) = CString::new(name) else { return false };
        let mut ev: *mut c_void = std::ptr::null_mut();
        unsafe { (syms.kpep_db_event)(db, cname.as_ptr(), &mut ev) == 0 && !ev.is_null() }
    }

    pub fn remove_all_events(&mut self) {
        let Some(syms) = symbols() else { return };
        loop {
            let mut count = 0usize;
            let rc = unsafe { (syms.kpep_config_events_count)(self.cfg, &mut count) };
            if rc != 0 || count == 0 {
                break;
            }
            unsafe { (syms.kpep_config_remove_event)(self.cfg, 0) };
        }
        self.names.clear();
    }

    pub fn event_count(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn event_names(&self) -> &[String] {
        &self.names
    }

    pub fn open(&mut self) -> Result<(), PerfError> {
        if self.names.is_empty() {
            return Err(PerfError::NoEvents);
        }
        let syms = symbols().ok_or(PerfError::NotLoaded)?;

        let mut classes = 0u32;
        let rc = unsafe { (syms.kpep_config_kpc_classes)(self.cfg, &mut classes) };
        if rc != 0 {
            return Err(PerfError::LoadFailed(format!("kpep_config_kpc_classes failed (rc={rc})")));
        }
        let rc = unsafe { (syms.kpep_config_apply)(self.cfg) };
        if rc != 0 {
            return Err(PerfError::LoadFailed(format!("kpep_config_apply failed (rc={rc})")));
        }
        if unsafe { (syms.kpc_set_counting)(classes) } != 0 {
            return Err(PerfError::PermissionDenied("kpc_set_counting failed".into()));
        }
        if unsafe { (syms.kpc_set_thread_counting)(classes) } != 0 {
            return Err(PerfError::PermissionDenied("kpc_set_thread_counting failed".into()));
        }
        self.classes = classes;
        self.counters_begin = [0; MAX_COUNTERS];
        self.counters_end = [0; MAX_COUNTERS];
        self.counters_overhead = [0; MAX_COUNTERS];
        self.counters = [0; MAX_COUNTERS];

        // Measure the counting apparatus's own overhead with no user work
        // between start and stop, and bank it for later subtraction.
        self.start()?;
        self.stop()?;
        self.counters_overhead = self.counters;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(syms) = symbols() {
            unsafe {
                (syms.kpc_set_counting)(0);
                (syms.kpc_set_thread_counting)(0);
            }
        }
        self.classes = 0;
        self.counters_begin = [0; MAX_COUNTERS];
        self.counters_end = [0; MAX_COUNTERS];
        self.counters_overhead = [0; MAX_COUNTERS];
        self.counters = [0; MAX_COUNTERS];
    }

    pub fn start(&mut self) -> Result<(), PerfError> {
        let syms = symbols().ok_or(PerfError::NotLoaded)?;
        self.counters_begin = [0; MAX_COUNTERS];
        self.counters_end = [0; MAX_COUNTERS];
        let rc = unsafe {
            (syms.kpc_get_thread_counters)(0, MAX_COUNTERS as u32, self.counters_begin.as_mut_ptr())
        };
        if rc != 0 {
            return Err(PerfError::PermissionDenied("kpc_get_thread_counters failed".into()));
        }
        self.counters_end = self.counters_begin;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), PerfError> {
        self.refresh_counters();
        Ok(())
    }

    pub fn counters(&self) -> &[u64] {
        &self.counters[..self.names.len()]
    }

    pub fn refresh_counters(&mut self) {
        let Some(syms) = symbols() else { return };
        unsafe {
            (syms.kpc_get_thread_counters)(0, MAX_COUNTERS as u32, self.counters_end.as_mut_ptr());
        }
        for i in 0..MAX_COUNTERS {
            let delta = self.counters_end[i].saturating_sub(self.counters_begin[i]);
            self.counters[i] = if delta <= self.counters_overhead[i] {
                0
            } else {
                delta - self.counters_overhead[i]
            };
        }
    }
}

impl Drop for UserspaceBackend {
    fn drop(&mut self) {
        self.close();
        if !self.cfg.is_null() {
            if let Some(syms) = symbols() {
                unsafe { (syms.kpep_config_free)(self.cfg) };
            }
        }
    }
}
