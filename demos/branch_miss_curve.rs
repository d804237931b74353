//! Sweeps a branch's misprediction rate from 0% to 100% and reports the
//! average cycle cost per extra mispredict, as `cycles-per-miss` derived
//! from two counted events rather than from wall-clock time.
//!
//! The inner kernel alternates between a short and a long dependent chain
//! based on a per-iteration coin flip whose bias is swept across the run;
//! a fixed-seed PCG32 generator (not part of the library — every run needs
//! the same sequence, and nothing else in the crate needs a PRNG) drives
//! both the coin flip and the filler work so every sample does the same
//! amount of non-branch work regardless of which arm is taken.

use pmubench::{EventKind, Session};

const BRANCH_NUM: u32 = 4096;
const SAMPLE_NUM: u32 = 200;
const ITERAT_NUM: u32 = 128;

/// PCG32, grounded on the reference benchmark harness's own random-number
/// helper: fixed default state/increment so every run sees the identical
/// sequence.
struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const MUL: u64 = ((0x5851F42Du64) << 32) + 0x4C957F2D;

    fn new() -> Self {
        Pcg32 {
            state: (0x853C_49E6u64 << 32) + 0x748F_EA9B,
            inc: (0xDA3E_39CBu64 << 32) + 0x94B9_5BDB,
        }
    }

    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state.wrapping_mul(Self::MUL).wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }
}

/// One sample's worth of the inner kernel: `BRANCH_NUM` data-dependent
/// branches, each taking the short arm with probability `bias/SAMPLE_NUM`.
fn run_kernel(rng: &mut Pcg32, bias: u32) {
    let mut sink_a: u32 = 0;
    let mut sink_b: u64 = 0;
    for _ in 0..BRANCH_NUM {
        if rng.next_u32() % SAMPLE_NUM < bias {
            for _ in 0..4 {
                sink_a = sink_a.wrapping_add(rng.next_u32());
            }
        } else {
            for _ in 0..2 {
                sink_b = sink_b.wrapping_add(rng.next_u64());
            }
        }
    }
    std::hint::black_box((sink_a, sink_b));
}

pub fn main() {
    env_logger::init();

    if !Session::load(true) {
        println!("no PMU backend available on this host; skipping");
        return;
    }

    let mut session = Session::new();
    for kind in [EventKind::Cycles, EventKind::BranchMisses] {
        if !session.event_available(kind) {
            println!("{kind:?} is not available on this host/backend; skipping");
            return;
        }
        session.add_event(kind).expect("kind was just probed as available");
    }
    session.open().expect("group of available events should open");

    let mut rng = Pcg32::new();
    let mut cycles = vec![0f64; (SAMPLE_NUM + 1) as usize];
    let mut misses = vec![0f64; (SAMPLE_NUM + 1) as usize];

    for bias in 0..=SAMPLE_NUM {
        let mut total_cycles = 0u64;
        let mut total_misses = 0u64;
        for _ in 0..ITERAT_NUM {
            session.start().expect("session was opened");
            run_kernel(&mut rng, bias);
            session.stop().expect("session was started");
            let counters = session.get_counters();
            total_cycles += counters[0];
            total_misses += counters[1];
        }
        cycles[bias as usize] = total_cycles as f64;
        misses[bias as usize] = total_misses as f64;
    }

    session.close();

    // Subtract the endpoint-to-endpoint linear trend from the cycle series
    // so a non-zero slope in the surrounding work doesn't bias the peak.
    let c0 = cycles[0];
    let c1 = cycles[SAMPLE_NUM as usize];
    let denom = (BRANCH_NUM * ITERAT_NUM) as f64;
    let mut peak_ratio = 0f64;
    for s in 0..=SAMPLE_NUM as usize {
        let trend = c0 + (c1 - c0) * (s as f64 / SAMPLE_NUM as f64);
        let detrended_cycles = (cycles[s] - trend) / denom;
        let misses_per_branch = misses[s] / denom;
        if misses_per_branch > 0.0 {
            let ratio = detrended_cycles.abs() / misses_per_branch;
            if ratio > peak_ratio {
                peak_ratio = ratio;
            }
        }
    }

    println!("peak cycles-per-mispredict: {peak_ratio:.2}");
}
