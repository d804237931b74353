//! Monotonic tick clock. All platform dispatch happens at compile time via
//! `cfg`, never behind a runtime branch, so `now_ticks` stays on its
//! documented fast path unconditionally.

use std::time::{SystemTime, UNIX_EPOCH};

/// Read a monotonic, fixed-frequency tick. Not a CPU cycle on modern
/// hardware — see the calibrator (`crate::calibrate`) for the conversion.
///
/// Branch-free and syscall-free on x86, x86-64 and aarch64; falls back to a
/// microsecond wall clock read everywhere else.
#[inline]
pub fn now_ticks() -> u64 {
    imp::now_ticks()
}

/// Wall time in seconds, at least microsecond resolution. A different
/// timebase from [`now_ticks`]; used only as the calibrator's reference.
#[inline]
pub fn now_seconds() -> f64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch");
    d.as_secs() as f64 + d.subsec_micros() as f64 / 1_000_000.0
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod imp {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::_rdtsc;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::_rdtsc;

    #[inline]
    pub fn now_ticks() -> u64 {
        // rdtsc is a fixed-frequency timer on modern x86 CPUs and may not
        // match the CPU's clock-gated cycle rate.
        unsafe { _rdtsc() }
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    use std::arch::asm;

    #[inline]
    pub fn now_ticks() -> u64 {
        let tsc: u64;
        unsafe {
            // Apple's virtual counter (cntvct_el0) traps in user mode on
            // their ARM64 cores; mach_absolute_time() reads the physical
            // counter (cntpct_el0) instead, so we do too.
            #[cfg(target_os = "macos")]
            asm!("mrs {0}, cntpct_el0", out(reg) tsc, options(nomem, nostack));
            #[cfg(not(target_os = "macos"))]
            asm!("mrs {0}, cntvct_el0", out(reg) tsc, options(nomem, nostack));
        }
        tsc
    }
}

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")),
    windows
))]
mod imp {
    #[inline]
    pub fn now_ticks() -> u64 {
        use std::mem::MaybeUninit;
        unsafe {
            let mut counter = MaybeUninit::<i64>::uninit();
            winapi_query_performance_counter(counter.as_mut_ptr());
            counter.assume_init() as u64
        }
    }

    extern "system" {
        #[link_name = "QueryPerformanceCounter"]
        fn winapi_query_performance_counter(value: *mut i64) -> i32;
    }
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    windows
)))]
mod imp {
    #[inline]
    pub fn now_ticks() -> u64 {
        super::now_seconds_micros()
    }
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    windows
)))]
fn now_seconds_micros() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch");
    d.as_secs() * 1_000_000 + d.subsec_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_nondecreasing() {
        let mut prev = now_ticks();
        for _ in 0..1_000_000 {
            let next = now_ticks();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn seconds_increase_with_wall_time() {
        let a = now_seconds();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_seconds();
        assert!(b > a);
    }
}
