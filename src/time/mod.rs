//! Cycle, retired-instruction, and frequency readings.
//!
//! Three per-architecture reads back the capture engine: a free-running
//! time counter with a 16-32 ns tick, a per-core retired-instructions
//! count, and the current core frequency. The engine is generic over
//! [`TimeSource`] so replay and tests can script timestamps;
//! [`CycleCounter`] is the hardware implementation.

use std::fs;
use std::fs::File;
use std::io::Result;
use std::sync::OnceLock;

use log::warn;

use crate::ffi::bindings as b;
use crate::ffi::syscall::{ioctl, num_possible_cpus, perf_event_open, read_count, sched_getcpu};
use crate::ffi::Attr;

pub trait TimeSource: Send + Sync {
    /// Monotone counter scaled to a ~16-32 ns tick. Performance critical:
    /// read once per trace entry.
    fn now_cycles(&self) -> u64;

    /// The calling core's retired-instructions count, or 0 when the
    /// counter is unavailable. Performance critical when IPC is on.
    fn inst_retired(&self) -> u64;

    /// Current core frequency in MHz, or 0 when unknown. Sampled only at
    /// PC samples, never on the insert path.
    fn cpu_freq_mhz(&self) -> u64;

    /// One-time per-core counter setup. Idempotent; called on the first
    /// traceblock a core allocates.
    fn enable_core(&self, cpu: usize);
}

/// Reads the hardware counters of the running machine.
///
/// The retired-instructions counters are per-core pinned
/// `PERF_COUNT_HW_INSTRUCTIONS` events counting both user and kernel.
/// System-wide counting needs `CAP_PERFMON` or a permissive
/// `/proc/sys/kernel/perf_event_paranoid`; without it the counter falls
/// back to this process only, and failing that reads as zero.
pub struct CycleCounter {
    cores: Box<[OnceLock<Option<File>>]>,
}

impl CycleCounter {
    pub fn new() -> Self {
        let mut cores = Vec::new();
        cores.resize_with(num_possible_cpus(), OnceLock::new);
        Self {
            cores: cores.into_boxed_slice(),
        }
    }
}

impl Default for CycleCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for CycleCounter {
    #[cfg(target_arch = "x86_64")]
    fn now_cycles(&self) -> u64 {
        // Constant-rate TSC; >> 6 gives ~20 ns per count at 3 GHz.
        unsafe { core::arch::x86_64::_rdtsc() >> 6 }
    }

    #[cfg(target_arch = "aarch64")]
    fn now_cycles(&self) -> u64 {
        // 32-54 MHz generic timer, already in the target tick range.
        let counter: u64;
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) counter) };
        counter
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn now_cycles(&self) -> u64 {
        compile_error!("define the time counter for this architecture");
    }

    fn inst_retired(&self) -> u64 {
        let cpu = sched_getcpu();
        match self.cores.get(cpu).and_then(|slot| slot.get()) {
            Some(Some(counter)) => read_count(counter).unwrap_or(0),
            _ => 0,
        }
    }

    fn cpu_freq_mhz(&self) -> u64 {
        let path = format!(
            "/sys/devices/system/cpu/cpu{}/cpufreq/scaling_cur_freq",
            sched_getcpu()
        );
        match fs::read_to_string(path) {
            Ok(khz) => khz.trim().parse::<u64>().unwrap_or(0) / 1000,
            Err(_) => 0,
        }
    }

    fn enable_core(&self, cpu: usize) {
        let Some(slot) = self.cores.get(cpu) else {
            return;
        };
        slot.get_or_init(|| match open_inst_counter(cpu) {
            Ok(counter) => Some(counter),
            Err(e) => {
                warn!("no retired-instructions counter on cpu{cpu}: {e}");
                None
            }
        });
    }
}

fn open_inst_counter(cpu: usize) -> Result<File> {
    let attr = Attr {
        type_: b::PERF_TYPE_HARDWARE,
        size: b::PERF_ATTR_SIZE_VER5,
        config: b::PERF_COUNT_HW_INSTRUCTIONS,
        flags: b::ATTR_DISABLED | b::ATTR_PINNED | b::ATTR_EXCLUDE_HV,
        ..Attr::default()
    };
    // All tasks on this core, falling back to just this process when the
    // caller may not observe the whole system.
    let counter = perf_event_open(&attr, -1, cpu as i32, -1, b::PERF_FLAG_FD_CLOEXEC)
        .or_else(|_| perf_event_open(&attr, 0, cpu as i32, -1, b::PERF_FLAG_FD_CLOEXEC))?;
    ioctl(&counter, b::PERF_IOC_OP_RESET)?;
    ioctl(&counter, b::PERF_IOC_OP_ENABLE)?;
    Ok(counter)
}
