//! Linux/Android `perf_event_open` backend: one kernel file descriptor per
//! event, opened in grouped mode so the whole group starts/stops/reads
//! atomically. Grounded on the reference crate's `linux/mod.rs` and
//! `linux/perf_format.rs` (the `EventAttr` ABI struct and its bitflags are
//! reused near-verbatim), transformed to the portable `EventKind` contract.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::PerfError;
use crate::event::EventKind;

/// Kernel ABI types. Kept separate from the rest of the backend so the
/// `#[repr(C)]` struct and its bit layout are easy to audit against
/// `perf_event_open(2)`.
mod abi {
    bitflags::bitflags! {
        pub struct ReadFormat: u64 {
            const ID = 1 << 2;
            const GROUP = 1 << 3;
        }
    }

    bitflags::bitflags! {
        pub struct Settings: u64 {
            const DISABLED = 1 << 0;
            const EXCLUDE_KERNEL = 1 << 5;
            const EXCLUDE_HV = 1 << 6;
        }
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct EventAttr {
        pub attr_type: u32,
        pub size: u32,
        pub config: u64,
        pub sample_period_freq: u64,
        pub sample_type: u64,
        pub read_format: ReadFormat,
        pub settings: Settings,
        pub wakeup_events_watermark: u32,
        pub bp_type: u32,
        pub config1_or_bp_addr: u64,
        pub config2_or_bp_len: u64,
        pub branch_sample_type: u64,
        pub sample_regs_user: u64,
        pub sample_stack_user: u32,
        pub clock_id: i32,
        pub sample_regs_intr: u64,
        pub aux_watermark: u32,
        pub reserved: u32,
    }

    impl Default for EventAttr {
        fn default() -> EventAttr {
            unsafe { std::mem::zeroed() }
        }
    }

    pub const PERF_TYPE_HARDWARE: u32 = 0;
    pub const PERF_TYPE_SOFTWARE: u32 = 1;
    pub const PERF_TYPE_HW_CACHE: u32 = 3;

    pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
    pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

    pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
    pub const PERF_COUNT_HW_CACHE_L1I: u64 = 1;
    pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;

    pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
    pub const PERF_COUNT_HW_CACHE_OP_WRITE: u64 = 1;

    pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
    pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

    pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;
    pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
    pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
    pub const PERF_EVENT_IOC_ID: u64 = 0x80082407;
    pub const PERF_IOC_FLAG_GROUP: libc::c_int = 1;
}

use abi::EventAttr;

fn perf_event_open(attr: &EventAttr, pid: libc::pid_t, cpu: libc::c_int, group_fd: RawFd, flags: libc::c_ulong) -> RawFd {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const EventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        ) as RawFd
    }
}

fn ioctl(fd: RawFd, request: u64, arg: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn ioctl_id(fd: RawFd) -> io::Result<u64> {
    let mut id: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, abi::PERF_EVENT_IOC_ID, &mut id as *mut u64) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

/// `(type, config)` pair the kernel understands for a portable [`EventKind`].
/// `None` means the kind has no syscall-backend translation.
fn resolve(kind: EventKind) -> Option<(u32, u64)> {
    use abi::*;
    Some(match kind {
        EventKind::Cycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        EventKind::Instructions => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
        EventKind::Branches => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
        EventKind::BranchMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        EventKind::L1iLoads => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1I, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS)),
        EventKind::L1iLoadMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1I, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS)),
        EventKind::L1dLoads => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS)),
        EventKind::L1dLoadMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS)),
        EventKind::L1dStores => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_ACCESS)),
        EventKind::L1dStoreMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_MISS)),
        EventKind::LlcLoads => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS)),
        EventKind::LlcLoadMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS)),
        EventKind::LlcStores => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_ACCESS)),
        EventKind::LlcStoreMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_MISS)),
        EventKind::None => return None,
    })
}

const fn cache(id: u64, op: u64, result: u64) -> u64 {
    id | (op << 8) | (result << 16)
}

fn canonical_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::None => "none",
        EventKind::Cycles => "cpu-cycles",
        EventKind::Instructions => "instructions",
        EventKind::Branches => "branch-instructions",
        EventKind::BranchMisses => "branch-misses",
        EventKind::L1iLoads => "L1i-read",
        EventKind::L1iLoadMisses => "L1i-read-misses",
        EventKind::L1dLoads => "L1d-read",
        EventKind::L1dLoadMisses => "L1d-read-misses",
        EventKind::L1dStores => "L1d-write",
        EventKind::L1dStoreMisses => "L1d-write-misses",
        EventKind::LlcLoads => "LLC-read",
        EventKind::LlcLoadMisses => "LLC-read-misses",
        EventKind::LlcStores => "LLC-write",
        EventKind::LlcStoreMisses => "LLC-write-misses",
    }
}

fn base_attr(descriptor: (u32, u64)) -> EventAttr {
    let mut attr = EventAttr::default();
    attr.attr_type = descriptor.0;
    attr.config = descriptor.1;
    attr.size = mem::size_of::<EventAttr>() as u32;
    attr.read_format = abi::ReadFormat::ID | abi::ReadFormat::GROUP;
    attr.settings = abi::Settings::DISABLED | abi::Settings::EXCLUDE_KERNEL | abi::Settings::EXCLUDE_HV;
    attr
}

fn open_one(descriptor: (u32, u64), group_fd: RawFd) -> io::Result<RawFd> {
    let attr = base_attr(descriptor);
    let fd = perf_event_open(&attr, 0, -1, group_fd, 0);
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

static LOADED: AtomicBool = AtomicBool::new(false);

pub struct SyscallBackend {
    names: Vec<String>,
    descriptors: Vec<(u32, u64)>,
    fds: Vec<RawFd>,
    ids: Vec<u64>,
    counters: Vec<u64>,
    buffer: Vec<u64>,
}

impl SyscallBackend {
    pub fn load(verbose: bool) -> bool {
        if LOADED.load(Ordering::Relaxed) {
            return true;
        }
        match open_one((abi::PERF_TYPE_HARDWARE, abi::PERF_COUNT_HW_CPU_CYCLES), -1) {
            Ok(fd) => {
                unsafe { libc::close(fd) };
                LOADED.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                if verbose {
                    log::warn!(
                        "pmubench: perf_event_open probe failed ({e}); this usually means \
                         /proc/sys/kernel/perf_event_paranoid is too restrictive or the \
                         process lacks CAP_PERFMON/root"
                    );
                }
                false
            }
        }
    }

    pub fn new() -> Self {
        SyscallBackend {
            names: Vec::with_capacity(8),
            descriptors: Vec::with_capacity(8),
            fds: Vec::new(),
            ids: Vec::new(),
            counters: Vec::new(),
            buffer: Vec::new(),
        }
    }

    pub fn add_event(&mut self, kind: EventKind) -> Result<(), PerfError> {
        let descriptor = resolve(kind).ok_or(PerfError::UnsupportedEvent(kind))?;
        self.descriptors.push(descriptor);
        self.names.push(canonical_name(kind).to_string());
        Ok(())
    }

    /// Accepts a packed 64-bit descriptor, `(type << 32) | (config &
    /// 0xFFFFFFFF)` — wire-compatible with `perf_event_attr.type`/`.config`
    /// and preserved bit-for-bit, e.g. `(4u64 << 32) | 1` for
    /// branch-instructions or a hand-built `HW_CACHE` packing for a cache
    /// event with no portable [`EventKind`].
    pub fn add_event_native(&mut self, descriptor: u64, alias: Option<&str>) -> Result<(), PerfError> {
        let attr_type = (descriptor >> 32) as u32;
        let config = descriptor & 0xFFFF_FFFF;

        self.descriptors.push((attr_type, config));
        self.names
            .push(alias.map(str::to_string).unwrap_or_else(|| format!("raw:0x{descriptor:016x}")));
        Ok(())
    }

    pub fn event_available(&self, kind: EventKind) -> bool {
        let Some(descriptor) = resolve(kind) else { return false };
        self.event_available_native_pair(descriptor)
    }

    /// Probe a packed `(type << 32) | config` descriptor the same way
    /// [`Self::event_available`] probes a portable [`EventKind`]: open a
    /// disabled counter and close it immediately without committing any
    /// session state.
    pub fn event_available_native(&self, packed: u64) -> bool {
        self.event_available_native_pair(((packed >> 32) as u32, packed & 0xFFFF_FFFF))
    }

    fn event_available_native_pair(&self, descriptor: (u32, u64)) -> bool {
        match open_one(descriptor, -1) {
            Ok(fd) => {
                unsafe { libc::close(fd) };
                true
            }
            Err(_) => false,
        }
    }

    pub fn remove_all_events(&mut self) {
        self.names.clear();
        self.descriptors.clear();
    }

    pub fn event_count(&self) -> u32 {
        self.descriptors.len() as u32
    }

    pub fn event_names(&self) -> &[String] {
        &self.names
    }

    pub fn open(&mut self) -> Result<(), PerfError> {
        if self.descriptors.is_empty() {
            return Err(PerfError::NoEvents);
        }
        let mut opened: Vec<RawFd> = Vec::with_capacity(self.descriptors.len());
        let mut leader: RawFd = -1;
        for descriptor in &self.descriptors {
            match open_one(*descriptor, leader) {
                Ok(fd) => {
                    if leader == -1 {
                        leader = fd;
                    }
                    opened.push(fd);
                }
                Err(e) => {
                    for fd in opened {
                        unsafe { libc::close(fd) };
                    }
                    return Err(PerfError::Os(e));
                }
            }
        }

        let mut ids = Vec::with_capacity(opened.len());
        for fd in &opened {
            match ioctl_id(*fd) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for fd in opened {
                        unsafe { libc::close(fd) };
                    }
                    return Err(PerfError::Os(e));
                }
            }
        }

        let n = opened.len();
        self.fds = opened;
        self.ids = ids;
        self.counters = vec![0; n];
        self.buffer = vec![0u64; 2 * n + 1];
        Ok(())
    }

    pub fn close(&mut self) {
        if self.fds.is_empty() {
            return;
        }
        for fd in self.fds.drain(..) {
            unsafe { libc::close(fd) };
        }
        self.ids.clear();
        for c in &mut self.counters {
            *c = 0;
        }
    }

    pub fn start(&mut self) -> Result<(), PerfError> {
        let leader = self.fds[0];
        ioctl(leader, abi::PERF_EVENT_IOC_RESET, abi::PERF_IOC_FLAG_GROUP)?;
        ioctl(leader, abi::PERF_EVENT_IOC_ENABLE, abi::PERF_IOC_FLAG_GROUP)?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), PerfError> {
        let leader = self.fds[0];
        ioctl(leader, abi::PERF_EVENT_IOC_DISABLE, abi::PERF_IOC_FLAG_GROUP)?;
        self.refresh_counters()
    }

    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    /// Reads the grouped counter values and, while doing so, checks that the
    /// id the kernel reports at each position still matches the id recorded
    /// at `open` time — counters must never silently shift order. A short or
    /// garbled read leaves the previous counter values untouched.
    pub fn refresh_counters(&mut self) -> Result<(), PerfError> {
        let leader = self.fds[0];
        let byte_len = self.buffer.len() * 8;
        let read = unsafe {
            libc::read(
                leader,
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                byte_len,
            )
        };
        if read < 0 || read as usize != byte_len {
            return Err(PerfError::ShortRead);
        }

        let nr = self.buffer[0] as usize;
        let mut mismatch: Option<usize> = None;
        for i in 0..nr.min(self.counters.len()) {
            let value = self.buffer[1 + i * 2];
            let id = self.buffer[2 + i * 2];
            if id != self.ids[i] && mismatch.is_none() {
                mismatch = Some(i);
            }
            self.counters[i] = value;
        }

        match mismatch {
            Some(position) => Err(PerfError::CounterOrderMismatch { position }),
            None => Ok(()),
        }
    }
}
