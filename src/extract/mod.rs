//! Trace extraction: anchors, block walk, wall-clock reconstruction.
//!
//! A [`Dumper`] drives an engine purely through its control surface, the
//! way the user-space control program drives the module: stop tracing,
//! flush, then walk traceblocks from the high end of the arena down,
//! 4 KB at a time, patching each block header with a reconstructed
//! gettimeofday value on the way out. The very first block additionally
//! receives the tracefile version and the start/stop anchor pairs that
//! make the reconstruction possible offline.

use std::ffi::CStr;
use std::fs::{self, File};
use std::io::{BufWriter, Result, Write};
use std::path::Path;
use std::slice;
use std::thread::sleep;
use std::time::Duration;

use log::info;

use crate::config::DO_IPC;
use crate::control::{probe, Command};
use crate::engine::{Engine, BLOCK_BYTES, BLOCK_WORDS, BLOCK_WORDS_SHIFT, IPC_BLOCK_WORDS};
use crate::event::{
    code, name_entry, pack, FULL_TIMESTAMP_MASK, GETTIMEOFDAY_MASK, IPC_FLAG, VERSION_MASK,
    WRAP_FLAG,
};
use crate::ffi::syscall::gettimeofday_usec;
use crate::time::TimeSource;

/// Format version written into the first block's flags byte.
pub const TRACEFILE_VERSION: u64 = 3;

/// First engine version with the 4 KB extraction commands.
const MIN_4KB_VERSION: u64 = 4;

/// A live dump stops after this bounded prefix (1.75 MB).
const LIVE_DUMP_BLOCKS: u64 = 28;

const WORDS_PER_4KB: usize = 512;

/// A `(cycle counter, gettimeofday microseconds)` pair captured close
/// together, anchoring cycle timestamps to wall time offline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimePair {
    pub cycles: u64,
    pub usec: i64,
}

/// Reads the time counter and gettimeofday back to back, retrying when
/// an interruption lands between the two reads.
pub fn time_pair<T: TimeSource>(time: &T) -> TimePair {
    loop {
        let cycles = time.now_cycles();
        let usec = gettimeofday_usec();
        let elapsed = time.now_cycles().wrapping_sub(cycles);
        if elapsed <= 320 {
            return TimePair { cycles, usec };
        }
    }
}

/// `usec(cycles) = base_usec + (cycles - base_cycles) * slope`.
#[derive(Clone, Copy)]
struct Slope {
    base_cycles: u64,
    base_usec: i64,
    per_cycle: f64,
}

impl Slope {
    fn new(start: TimePair, stop: TimePair) -> Self {
        let mut stop_cycles = stop.cycles;
        if stop_cycles <= start.cycles {
            stop_cycles = start.cycles + 1; // avoid zdiv
        }
        Self {
            base_cycles: start.cycles,
            base_usec: start.usec,
            per_cycle: (stop.usec - start.usec) as f64 / (stop_cycles - start.cycles) as f64,
        }
    }

    fn cycles_to_usec(&self, cycles: u64) -> i64 {
        let delta = (cycles as i64).wrapping_sub(self.base_cycles as i64) as f64;
        self.base_usec + (delta * self.per_cycle) as i64
    }
}

/// Drives a trace run and extracts the arena into a trace file.
pub struct Dumper<'e, T: TimeSource> {
    engine: &'e Engine<T>,
    start: TimePair,
    stop: TimePair,
}

impl<'e, T: TimeSource> Dumper<'e, T> {
    pub fn new(engine: &'e Engine<T>) -> Self {
        Self {
            engine,
            start: TimePair::default(),
            stop: TimePair::default(),
        }
    }

    /// The start and stop anchors captured so far.
    pub fn anchors(&self) -> (TimePair, TimePair) {
        (self.start, self.stop)
    }

    fn control(&self, command: u64, arg: u64) -> u64 {
        // Every command issued here carries plain integers or pointers
        // into buffers this dumper owns.
        unsafe { self.engine.control(command, arg) }
    }

    /// Sets up for a new tracing run. Tracing must be off.
    pub fn reset(&mut self, flags: u64) {
        self.control(Command::Reset.raw(), flags);
        self.start = TimePair::default();
        self.stop = TimePair::default();
    }

    /// Turns tracing on, capturing the start anchor first.
    pub fn on(&mut self) -> bool {
        if self.start.usec == 0 {
            self.start = time_pair(self.engine.time());
        }
        self.control(Command::On.raw(), 0) == 1
    }

    /// Turns tracing off, waits out in-flight entries, and captures the
    /// stop anchor.
    pub fn off(&mut self) -> bool {
        let ret = self.control(Command::Off.raw(), 0);
        // Wait 20 msec for any pending tracing to finish.
        sleep(Duration::from_millis(20));
        if ret != 0 {
            return false;
        }
        if self.stop.usec == 0 {
            self.stop = time_pair(self.engine.time());
        }
        true
    }

    /// Zero-fills the tail of each partly-used traceblock.
    pub fn flush(&self) {
        self.control(Command::Flush.raw(), 0);
    }

    /// Logs and returns the number of traceblocks in use. With IPC on,
    /// each 64 KB traceblock drags an 8 KB sidecar block, so the
    /// per-block footprint inflates by 8/7.
    pub fn stat(&self, flags: u64) -> u64 {
        let blocks = self.control(Command::Stat.raw(), 0);
        let mut block_size = BLOCK_BYTES as f64;
        if flags & DO_IPC != 0 {
            block_size = block_size * 8.0 / 7.0;
        }
        info!(
            "stat: {} trace blocks used ({:3.1} MB)",
            blocks,
            blocks as f64 * block_size / (1 << 20) as f64
        );
        blocks
    }

    /// Seeds the trace with its environment: kernel version, CPU model
    /// name, hostname, and the current process name and pid. Tracing
    /// must be off; the entries go in through the forced insert
    /// commands.
    ///
    /// All the text is captured before the first entry is written:
    /// gathering it can block for longer than the 20-bit timestamp wrap,
    /// and a migration mid-preamble would scatter the name list across
    /// CPU blocks.
    pub fn init(&mut self, process_name: &str) {
        let kernel_version = kernel_version();
        let model_name = model_name();
        let host_name = host_name();

        self.start = time_pair(self.engine.time());

        self.insert_name(code::KERNEL_VER, 0, &kernel_version);
        self.insert_name(code::MODEL_NAME, 0, &model_name);
        self.insert_name(code::HOST_NAME, 0, &host_name);

        let pid = std::process::id() as u64 & 0xffff;
        self.insert_name(code::PIDNAME, pid, process_name);
        // And then establish that pid on this CPU.
        self.control(Command::Insert1.raw_forced(), pack(code::USERPID, pid));
    }

    fn insert_name(&self, kind: u64, number: u64, name: &str) {
        let entry = name_entry(kind, number, name);
        let mut temp = [0u64; 8];
        temp[..entry.len()].copy_from_slice(&entry);
        self.control(Command::InsertN.raw_forced(), temp.as_ptr() as u64);
    }

    /// Extracts the trace into `path`. Flushes first; when tracing is
    /// still on this becomes a live dump of a bounded prefix with the
    /// stop anchor sampled on the fly. Returns the number of traceblocks
    /// written, and leaves the engine reset for another run.
    pub fn dump(&mut self, path: &Path) -> Result<u64> {
        let live = self.control(Command::Test.raw(), 0) == 1;
        self.control(Command::Flush.raw(), 0);

        let mut word_count = self.control(Command::GetCount.raw(), 0);
        let mut wrapped = false;
        if (word_count as i64) < 0 {
            word_count = !word_count;
            wrapped = true;
        }
        let mut block_count = word_count >> BLOCK_WORDS_SHIFT;

        // Older engines only have the word-at-a-time commands.
        let use_4kb = probe(self.engine, MIN_4KB_VERSION).is_ok();

        if live {
            self.stop = time_pair(self.engine.time());
            block_count = LIVE_DUMP_BLOCKS;
            info!("live dump of {:3.2} MB", (LIVE_DUMP_BLOCKS as f64) / 16.0);
        }

        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        let mut trace_block = vec![0u64; BLOCK_WORDS];
        let mut ipc_block = vec![0u64; IPC_BLOCK_WORDS];
        let mut slope = Slope::new(self.start, self.stop);

        for i in 0..block_count {
            let mut k = i * BLOCK_WORDS as u64;
            let mut k2 = i * IPC_BLOCK_WORDS as u64;

            if use_4kb {
                for j in (0..BLOCK_WORDS).step_by(WORDS_PER_4KB) {
                    self.control(Command::Set4Kb.raw(), k);
                    let dst = trace_block[j..].as_mut_ptr();
                    if self.control(Command::Get4Kb.raw(), dst as u64) != 0 {
                        trace_block[j..j + WORDS_PER_4KB].fill(0);
                    }
                    k += WORDS_PER_4KB as u64;
                }
            } else {
                for (j, word) in trace_block.iter_mut().enumerate() {
                    *word = self.control(Command::GetWord.raw(), k + j as u64);
                }
            }

            let flags = trace_block[1] >> 56;
            let block_has_ipc = flags & IPC_FLAG != 0;

            if i == 0 {
                // Fill in the tracefile version.
                trace_block[1] |= (TRACEFILE_VERSION & VERSION_MASK) << 56;
                if !wrapped {
                    // The engine stamps the wrap flag before knowing
                    // whether the trace actually wrapped. It did not.
                    trace_block[1] &= !(WRAP_FLAG << 56);
                }
                // Anchor words, so downstream programs can rebuild the
                // same cycles-to-usec mapping.
                slope = Slope::new(self.start, self.stop);
                trace_block[2] = self.start.cycles;
                trace_block[3] = self.start.usec as u64;
                trace_block[4] = self.stop.cycles;
                trace_block[5] = self.stop.usec as u64;
            }

            // Reconstruct this block's gettimeofday value.
            let block_cycles = trace_block[0] & FULL_TIMESTAMP_MASK;
            let block_usec = slope.cycles_to_usec(block_cycles);
            trace_block[1] |= block_usec as u64 & GETTIMEOFDAY_MASK;

            out.write_all(words_as_bytes(&trace_block))?;

            if block_has_ipc {
                if use_4kb {
                    for j in (0..IPC_BLOCK_WORDS).step_by(WORDS_PER_4KB) {
                        self.control(Command::Set4Kb.raw(), k2);
                        let dst = ipc_block[j..].as_mut_ptr();
                        if self.control(Command::GetIpc4Kb.raw(), dst as u64) != 0 {
                            ipc_block[j..j + WORDS_PER_4KB].fill(0);
                        }
                        k2 += WORDS_PER_4KB as u64;
                    }
                } else {
                    for (j, word) in ipc_block.iter_mut().enumerate() {
                        *word = self.control(Command::GetIpcWord.raw(), k2 + j as u64);
                    }
                }
                out.write_all(words_as_bytes(&ipc_block))?;
            }
        }
        out.flush()?;

        info!("{} written ({:3.1} MB)", path.display(), block_count as f64 / 16.0);

        // Go ahead and set up for another trace.
        self.control(Command::Reset.raw(), 0);
        Ok(block_count)
    }
}

fn words_as_bytes(words: &[u64]) -> &[u8] {
    unsafe { slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
}

fn kernel_version() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return String::new();
    }
    format!("{} {}", c_chars_to_string(&uts.release), c_chars_to_string(&uts.version))
}

/// The `model name` line of /proc/cpuinfo, if any.
fn model_name() -> String {
    let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") else {
        return String::new();
    };
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split(':').nth(1))
        .map(|name| name.trim().to_owned())
        .unwrap_or_default()
}

fn host_name() -> String {
    let mut buf = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } != 0 {
        return String::new();
    }
    c_chars_to_string(&buf)
}

fn c_chars_to_string(chars: &[libc::c_char]) -> String {
    let bytes: &[u8] = unsafe { slice::from_raw_parts(chars.as_ptr().cast(), chars.len()) };
    match CStr::from_bytes_until_nul(bytes) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod test;
