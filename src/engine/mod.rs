//! The capture engine: a per-CPU ring of bit-packed trace entries.
//!
//! Trace memory is one arena carved into 64 KB traceblocks, consumed
//! backward from the high end. Each CPU owns one current block; claiming
//! space for an entry is a lock-free fetch-add on that CPU's `next`
//! pointer, and only block rotation takes the one global lock. A claim
//! hands out an exclusive range, so the writer fills it in race-free even
//! if a concurrent entry lands first.
//!
//! ```text
//!  base
//!  |    arena_low            arena_next                    arena_high
//!  |       |                       |                                |
//!  v       v                       v                                v
//!  +-------+-------+------+--------+-------+-------+-------+-------+
//!  |////|  | / / / / / / / / / / / |                               |
//!  +-------+-------+------+--------+-------+-------+-------+-------+
//!       <==                        <==== allocated blocks grow down
//!       IPC bytes (lower 1/8, wrap mode with IPC on)
//! ```

use std::io::Result;
use std::ptr::copy_nonoverlapping;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicU64};

use arrayvec::ArrayVec;
use log::{debug, info};
use spin::Mutex;

use crate::config::{NetFilter, TraceParams, DO_IPC, DO_WRAP};
use crate::event::code;
use crate::event::{
    entry_len, ipc_nibble, is_bad_len, is_bad_len_plus, is_return_event, pack, ARG_MASK,
    CPU_NUMBER_SHIFT, EVENT_DELTA_RETVAL_MASK, EVENT_LENGTH_FIELD_SHIFT, EVENT_RETURN_BIT,
    EVENT_SHIFT, FLAGS_SHIFT, FULL_TIMESTAMP_MASK, IPC_FLAG, LATE_STORE_THRESH, MAX_DELTA_VALUE,
    TIMESTAMP_SHIFT, UNSHIFTED_RETVAL_MASK, UNSHIFTED_TIMESTAMP_MASK, WRAP_FLAG,
};
use crate::ffi::syscall::{num_possible_cpus, sched_getcpu};
use crate::time::{CycleCounter, TimeSource};

use arena::Arena;

mod arena;
#[cfg(test)]
pub(crate) mod test;

/// Traceblock size in bytes (64 KB, 8192 words).
pub const BLOCK_SHIFT: u32 = 16;
pub const BLOCK_BYTES: usize = 1 << BLOCK_SHIFT;
pub const BLOCK_WORDS_SHIFT: u32 = BLOCK_SHIFT - 3;
pub const BLOCK_WORDS: usize = 1 << BLOCK_WORDS_SHIFT;

/// IPC sidecar block: one byte per trace word, read out as u64s.
pub const IPC_BLOCK_WORDS_SHIFT: u32 = BLOCK_WORDS_SHIFT - 3;
pub const IPC_BLOCK_WORDS: usize = 1 << IPC_BLOCK_WORDS_SHIFT;

/// The last 8 words of every block stay zero so a multi-word entry never
/// straddles a block boundary.
const TRAILER_WORDS: usize = 8;
const TRAILER_BYTES: u64 = (TRAILER_WORDS * 8) as u64;

const PID_FILTER_WORDS: usize = 1024;
const MAX_PIDNAME_BYTES: usize = 16;

/// Reported by the VERSION command; 4 is the first version with the fast
/// 4 KB extraction commands.
pub const MODULE_VERSION: u64 = 4;

/// One CPU's current-traceblock state. `next`/`limit` hold word addresses
/// as integers; zero means no block has been allocated yet.
#[repr(align(64))]
#[derive(Default)]
struct CpuSlot {
    next: AtomicU64,
    limit: AtomicU64,
    prior_cycles: AtomicU64,
    prior_inst_retired: AtomicU64,
}

/// Arena allocation state, guarded by the one global lock.
/// `next` always sits at the start of the most recently handed-out block;
/// empty means `next == high`, full means `next` went below `low`.
struct Cursor {
    next: u64,
    low: u64,
    high: u64,
}

/// The owned capture engine.
///
/// Created once, shared by reference with every tracing hook. The hot
/// path ([`trace_1`](Self::trace_1) and friends) never blocks, never
/// faults, and never returns errors: on arena exhaustion or invariant
/// violation it disables tracing and drops entries silently.
pub struct Engine<T: TimeSource = CycleCounter> {
    arena: Arena,
    cursor: Mutex<Cursor>,
    slots: Box<[CpuSlot]>,
    tracing: AtomicBool,
    did_wrap: AtomicBool,
    do_ipc: AtomicBool,
    do_wrap: AtomicBool,
    /// Word subscript for the fast 4 KB extraction commands.
    get4kb_subscr: AtomicU64,
    pid_filter: Box<[AtomicU64]>,
    net_filter: NetFilter,
    check: bool,
    pid: u64,
    comm: [u8; MAX_PIDNAME_BYTES],
    time: T,
}

// Arena words are only reached through claims that hand out disjoint
// exclusive ranges, so the engine is safe to share across threads.
unsafe impl<T: TimeSource> Send for Engine<T> {}
unsafe impl<T: TimeSource> Sync for Engine<T> {}

impl Engine<CycleCounter> {
    /// Creates an engine reading the hardware counters.
    pub fn new(params: TraceParams) -> Result<Self> {
        Self::with_time(params, CycleCounter::new())
    }
}

impl<T: TimeSource> Engine<T> {
    /// Creates an engine over a caller-supplied time source.
    pub fn with_time(params: TraceParams, time: T) -> Result<Self> {
        let len = params.trace_mb << 20;
        Self::build(params, time, len)
    }

    fn build(params: TraceParams, time: T, arena_len: usize) -> Result<Self> {
        let arena = Arena::new(arena_len)?;
        let mut slots = Vec::new();
        slots.resize_with(num_possible_cpus(), CpuSlot::default);
        let pid_filter = (0..PID_FILTER_WORDS).map(|_| AtomicU64::new(0)).collect();

        let mut comm = [0u8; MAX_PIDNAME_BYTES];
        unsafe { libc::prctl(libc::PR_GET_NAME, comm.as_mut_ptr()) };

        info!(
            "trace arena {} KB at {:p}, check={}",
            arena_len >> 10,
            arena.base(),
            params.check
        );

        let engine = Self {
            arena,
            cursor: Mutex::new(Cursor {
                next: 0,
                low: 0,
                high: 0,
            }),
            slots: slots.into_boxed_slice(),
            tracing: AtomicBool::new(false),
            did_wrap: AtomicBool::new(false),
            do_ipc: AtomicBool::new(false),
            do_wrap: AtomicBool::new(false),
            get4kb_subscr: AtomicU64::new(0),
            pid_filter,
            net_filter: NetFilter::compile(params.pktmask, params.pktmatch),
            check: params.check,
            pid: std::process::id() as u64,
            comm,
            time,
        };
        engine.reset(0);
        Ok(engine)
    }

    #[cfg(test)]
    pub(crate) fn for_test(params: TraceParams, time: T, arena_len: usize) -> Self {
        Self::build(params, time, arena_len).unwrap()
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Relaxed)
    }

    pub fn version(&self) -> u64 {
        MODULE_VERSION
    }

    pub fn time(&self) -> &T {
        &self.time
    }

    /// The compiled packet-filter state for an external packet hook; the
    /// engine itself never consumes it.
    pub fn net_filter(&self) -> &NetFilter {
        &self.net_filter
    }

    pub(crate) fn check(&self) -> bool {
        self.check
    }

    fn slot(&self) -> &CpuSlot {
        let cpu = sched_getcpu();
        &self.slots[cpu.min(self.slots.len() - 1)]
    }

    // ---- control operations ------------------------------------------

    /// Turns tracing off; returns the tracing bit (0).
    pub fn trace_off(&self) -> u64 {
        self.tracing.store(false, Relaxed);
        0
    }

    /// Turns tracing on; the arena must have been reset. Returns 1.
    pub fn trace_on(&self) -> u64 {
        self.tracing.store(true, Relaxed);
        1
    }

    /// Reinitializes the arena for a new trace. Tracing must be off.
    /// `flags` is a combination of [`DO_IPC`] and [`DO_WRAP`].
    pub fn reset(&self, flags: u64) -> u64 {
        self.tracing.store(false, Relaxed);
        let do_ipc = flags & DO_IPC != 0;
        let do_wrap = flags & DO_WRAP != 0;
        self.do_ipc.store(do_ipc, Relaxed);
        self.do_wrap.store(do_wrap, Relaxed);
        debug!("reset(ipc={do_ipc}, wrap={do_wrap})");

        self.clear_pid_filter();

        let base = self.arena.base() as u64;
        let mut cur = self.cursor.lock();
        cur.high = base + self.arena.len() as u64;
        // First insert will allocate the first block.
        cur.next = cur.high;
        cur.low = if do_ipc {
            // The lower 1/8 holds IPC bytes. Strictly this should be 1/9;
            // a little space is wasted.
            base + (self.arena.len() as u64 >> 3)
        } else {
            base
        };
        drop(cur);
        self.did_wrap.store(false, Relaxed);
        self.get4kb_subscr.store(0, Relaxed);

        for slot in self.slots.iter() {
            slot.next.store(0, Relaxed);
            slot.limit.store(0, Relaxed);
            slot.prior_cycles.store(0, Relaxed);
            slot.prior_inst_retired.store(0, Relaxed);
        }
        0
    }

    /// Zero-fills the unused tail of each CPU's current block so every
    /// used block reads as full. Tracing must be off. Returns the number
    /// of words zeroed.
    pub fn flush(&self) -> u64 {
        self.tracing.store(false, Relaxed);
        let mut zeroed = 0;
        for slot in self.slots.iter() {
            let next = slot.next.load(Relaxed);
            let limit = slot.limit.load(Relaxed);
            if next == 0 || limit == 0 {
                continue;
            }
            let mut p = next;
            while p < limit {
                unsafe { (p as *mut u64).write(0) };
                p += 8;
                zeroed += 1;
            }
            slot.next.store(limit, Relaxed);
        }
        zeroed
    }

    /// Number of traceblocks in use. Tracing may be on.
    pub fn stat(&self) -> u64 {
        let cur = self.cursor.lock();
        if self.did_wrap.load(Relaxed) || cur.next < cur.low {
            (cur.high - cur.low) >> BLOCK_SHIFT
        } else {
            (cur.high - cur.next) >> BLOCK_SHIFT
        }
    }

    /// Number of filled trace words, top-down. Turns tracing off; flush
    /// must have been called for the tail of each block to read as nops.
    pub fn word_count(&self) -> u64 {
        self.tracing.store(false, Relaxed);
        let cur = self.cursor.lock();
        if self.did_wrap.load(Relaxed) || cur.next < cur.low {
            (cur.high - cur.low) >> 3
        } else {
            (cur.high - cur.next) >> 3
        }
    }

    pub fn did_wrap(&self) -> bool {
        self.did_wrap.load(Relaxed)
    }

    /// Byte distance from the arena top to the current block, for tests.
    #[cfg(test)]
    pub(crate) fn arena_next_from_high(&self) -> u64 {
        let cur = self.cursor.lock();
        cur.high - cur.next
    }

    /// One u64 of trace data at word subscript `subscr`, blocks numbered
    /// from the high end down. Out-of-range reads return 0.
    pub fn get_word(&self, subscr: u64) -> u64 {
        if subscr >= self.word_count() {
            return 0;
        }
        let high = self.cursor.lock().high;
        let blocknum = subscr >> BLOCK_WORDS_SHIFT;
        let within = subscr & (BLOCK_WORDS as u64 - 1);
        let block = high - ((blocknum + 1) << BLOCK_SHIFT);
        unsafe { ((block + within * 8) as *const u64).read() }
    }

    /// One u64 (8 bytes) of IPC sidecar data at word subscript `subscr`.
    /// IPC blocks count down from the arena's low trace bound.
    pub fn get_ipc_word(&self, subscr: u64) -> u64 {
        // The sidecar holds 1/8 of the trace word count.
        if subscr >= self.word_count() >> 3 {
            return 0;
        }
        let low = self.cursor.lock().low;
        let blocknum = subscr >> IPC_BLOCK_WORDS_SHIFT;
        let within = subscr & (IPC_BLOCK_WORDS as u64 - 1);
        let block = low - ((blocknum + 1) << (IPC_BLOCK_WORDS_SHIFT + 3));
        unsafe { ((block + within * 8) as *const u64).read() }
    }

    /// Sets the word subscript for the 4 KB extraction commands.
    pub fn set_4kb(&self, subscr: u64) -> u64 {
        self.get4kb_subscr.store(subscr, Relaxed);
        0
    }

    /// Copies 4 KB of trace data at the cursor to `dst`. Returns the
    /// number of bytes *not* copied: 0 on success, 4096 out of range.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for 4096 bytes of writes.
    pub unsafe fn get_4kb(&self, dst: *mut u8) -> u64 {
        let subscr = self.get4kb_subscr.load(Relaxed);
        if subscr >= self.word_count() {
            return 4096;
        }
        let high = self.cursor.lock().high;
        let blocknum = subscr >> BLOCK_WORDS_SHIFT;
        let within = subscr & (BLOCK_WORDS as u64 - 1);
        let block = high - ((blocknum + 1) << BLOCK_SHIFT);
        copy_nonoverlapping((block + within * 8) as *const u8, dst, 4096);
        0
    }

    /// As [`get_4kb`](Self::get_4kb) for the IPC sidecar.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for 4096 bytes of writes.
    pub unsafe fn get_ipc_4kb(&self, dst: *mut u8) -> u64 {
        let subscr = self.get4kb_subscr.load(Relaxed);
        if subscr >= self.word_count() >> 3 {
            return 4096;
        }
        let low = self.cursor.lock().low;
        let blocknum = subscr >> IPC_BLOCK_WORDS_SHIFT;
        let within = subscr & (IPC_BLOCK_WORDS as u64 - 1);
        let block = low - ((blocknum + 1) << (IPC_BLOCK_WORDS_SHIFT + 3));
        copy_nonoverlapping((block + within * 8) as *const u8, dst, 4096);
        0
    }

    // ---- pid filter --------------------------------------------------

    /// Marks `pid` as named, returning whether it already was. The
    /// scheduler hook emits a pidname entry on the first sighting; the
    /// unlocked set-bit race at worst duplicates one name entry.
    pub fn pid_filter_test_and_set(&self, pid: u64) -> bool {
        let bit = pid & 0xffff;
        let word = &self.pid_filter[(bit >> 6) as usize];
        let mask = 1u64 << (bit & 63);
        word.fetch_or(mask, Relaxed) & mask != 0
    }

    pub fn clear_pid_filter(&self) {
        for word in self.pid_filter.iter() {
            word.store(0, Relaxed);
        }
    }

    // ---- claims ------------------------------------------------------

    /// Initializes a fresh traceblock and returns the first entry slot.
    /// Called with the arena lock held.
    unsafe fn init_block(&self, block: *mut u64, very_first_block: bool, slot: &CpuSlot) -> u64 {
        let cpu = sched_getcpu() as u64;

        // First word: time counter with the CPU number in the top byte.
        block.write((self.time.now_cycles() & FULL_TIMESTAMP_MASK) | (cpu << CPU_NUMBER_SHIFT));

        // Second word: flags over space for the block's gettimeofday
        // value, reconstructed at dump time.
        let mut flags = 0;
        if self.do_ipc.load(Relaxed) {
            flags |= IPC_FLAG << FLAGS_SHIFT;
        }
        if self.do_wrap.load(Relaxed) {
            // Whether the trace actually wrapped is unknown until
            // GETCOUNT; the dumper clears this bit if it did not.
            flags |= WRAP_FLAG << FLAGS_SHIFT;
        }
        block.add(1).write(flags);

        // The very first block reserves six words for the start/stop
        // anchors the dumper patches in, plus two spare.
        let mut claim = if very_first_block {
            for i in 2..8 {
                block.add(i).write(0);
            }
            block.add(8)
        } else {
            block.add(2)
        };

        // Every block carries the current pid and process name so
        // wraparound keeps proper context.
        claim.write(self.pid);
        claim.add(1).write(0);
        copy_nonoverlapping(
            self.comm.as_ptr(),
            claim.add(2) as *mut u8,
            MAX_PIDNAME_BYTES,
        );
        let pid_word = claim;
        claim = claim.add(4);

        for i in BLOCK_WORDS - TRAILER_WORDS..BLOCK_WORDS {
            block.add(i).write(0);
        }

        // First block on this core: set up its counters once and record
        // the core's current MHz next to the pid.
        if self.do_ipc.load(Relaxed) && slot.prior_cycles.load(Relaxed) == 0 {
            self.time.enable_core(cpu as usize);
            slot.prior_cycles.store(1, Relaxed);
            let freq_mhz = self.time.cpu_freq_mhz();
            if freq_mhz != 0 {
                *pid_word |= freq_mhz << 32;
            }
        }

        claim as u64
    }

    /// Hands out the next traceblock, wrapping or self-disabling at the
    /// bottom of the arena. Called with the arena lock held.
    fn rotate_block(&self, len: usize, slot: &CpuSlot, cur: &mut Cursor) -> Option<u64> {
        let very_first_block = cur.next == cur.high;

        // Allocations grow downward.
        cur.next -= BLOCK_BYTES as u64;
        if cur.next < cur.low {
            if self.do_wrap.load(Relaxed) {
                self.did_wrap.store(true, Relaxed);
                // Reuse from just below the very first block so its
                // anchor words survive; a one-block arena degenerately
                // reuses its only block.
                cur.next = cur.high - BLOCK_BYTES as u64;
                if cur.next - BLOCK_BYTES as u64 >= cur.low {
                    cur.next -= BLOCK_BYTES as u64;
                }
                self.clear_pid_filter();
                debug!("arena wrapped");
            } else {
                // All full. Stop and get out.
                self.tracing.store(false, Relaxed);
                debug!("arena full, tracing off");
                return None;
            }
        }

        // Initialize before publishing next/limit: an entry from another
        // thread on this slot must never see an uninitialized block.
        let claim = unsafe { self.init_block(cur.next as *mut u64, very_first_block, slot) };
        slot.next.store(claim + (len * 8) as u64, Relaxed);
        slot.limit.store(cur.next + BLOCK_BYTES as u64, Relaxed);
        Some(claim)
    }

    /// Slow path: retry the claim under the arena lock, rotating blocks
    /// if it still does not fit.
    fn slow_claim(&self, len: usize, slot: &CpuSlot) -> Option<u64> {
        if is_bad_len_plus(len) {
            self.tracing.store(false, Relaxed);
            return None;
        }
        let mut cur = self.cursor.lock();
        // Nothing else can rotate this slot while we hold the lock.
        let limit = slot.limit.load(Relaxed);
        let claim = slot.next.fetch_add((len * 8) as u64, Relaxed);
        if limit == 0 || claim + (len * 8) as u64 > limit - TRAILER_BYTES {
            return self.rotate_block(len, slot, &mut cur);
        }
        // A concurrent entry on this slot already rotated to a new block
        // and our claim landed inside it.
        Some(claim)
    }

    /// Reserves `len` consecutive words, normally lock-free. Returns the
    /// claim as a word address, or `None` if the arena is full with wrap
    /// off (the caller MUST check). Usable with tracing off so a trace
    /// file can be initialized.
    fn claim(&self, len: usize, slot: &CpuSlot) -> Option<u64> {
        if is_bad_len_plus(len) {
            self.tracing.store(false, Relaxed);
            return None;
        }
        let bytes = (len * 8) as u64;
        let mut limit;
        let mut claim = 0;

        // A concurrent entry may rotate this slot's block between the
        // two limit reads; equal reads mean the claim is decisive.
        loop {
            limit = slot.limit.load(Relaxed);
            if limit == 0 {
                break;
            }
            claim = slot.next.fetch_add(bytes, Relaxed);
            let limit_again = slot.limit.load(Relaxed);
            if limit == limit_again {
                break;
            }
            if claim < limit_again && limit_again - BLOCK_BYTES as u64 <= claim {
                // Claim already lands in the newer block.
                limit = limit_again;
                break;
            }
            // Claim sits at the end of the rotated-away block; abandon
            // it and try again.
        }

        if limit == 0 || claim + bytes > limit - TRAILER_BYTES {
            return self.slow_claim(len, slot);
        }
        Some(claim)
    }

    /// As [`claim`](Self::claim), prefixing a TSDELTA entry when the gap
    /// since this CPU's previous entry nearly wraps the 20-bit timestamp.
    /// The delta is meaningless before a CPU's first entry
    /// (`prior_cycles == 0`), so none is emitted then.
    fn claim_with_tsdelta(
        &self,
        now: u64,
        delta_cycles: u64,
        len: usize,
        slot: &CpuSlot,
    ) -> Option<u64> {
        if delta_cycles > LATE_STORE_THRESH && slot.prior_cycles.load(Relaxed) != 0 {
            let claim = self.claim(1 + len, slot)?;
            unsafe {
                (claim as *mut u64).write(
                    (now << TIMESTAMP_SHIFT)
                        | (code::TSDELTA << EVENT_SHIFT)
                        | (delta_cycles & ARG_MASK),
                );
            }
            Some(claim + 8)
        } else {
            self.claim(len, slot)
        }
    }

    /// This CPU's most recently written entry word, if any.
    fn prior_entry(&self, slot: &CpuSlot) -> Option<u64> {
        let next = slot.next.load(Relaxed);
        let limit = slot.limit.load(Relaxed);
        if next != 0 && next < limit {
            Some(next - 8)
        } else {
            None
        }
    }

    /// Computes and stores the four-bit IPC value for the entry at
    /// `claim`; a folded return goes into the high half of the byte.
    fn ipc_calc(&self, claim: u64, delta_cycles: u64, slot: &CpuSlot, fold: bool) {
        if !self.do_ipc.load(Relaxed) {
            return;
        }
        // Large garbage deltas on a core's first entry are harmless.
        let inst = self.time.inst_retired();
        let delta_inst = inst.wrapping_sub(slot.prior_inst_retired.load(Relaxed));
        slot.prior_inst_retired.store(inst, Relaxed);

        // The word offset from the arena base is exactly the sidecar
        // byte offset: 8 trace bytes map to 1 IPC byte.
        let base = self.arena.base() as u64;
        let byte = (base + ((claim - base) >> 3)) as *mut u8;
        let nibble = ipc_nibble(delta_inst, delta_cycles) as u8;
        unsafe {
            if fold {
                *byte |= nibble << 4;
            } else {
                *byte = nibble;
            }
        }
    }

    // ---- encoders ----------------------------------------------------

    /// Inserts one single-word entry. Returns the number of words
    /// written (0 when the arena is full).
    pub fn insert_1(&self, arg1: u64) -> u64 {
        let now = self.time.now_cycles();
        let slot = self.slot();
        let delta_cycles = now.wrapping_sub(slot.prior_cycles.load(Relaxed));
        let claim = self.claim_with_tsdelta(now, delta_cycles, 1, slot);
        // Must update after the claim so a first claim sees the zero
        // sentinel.
        slot.prior_cycles.store(now, Relaxed);
        match claim {
            Some(claim) => {
                unsafe { (claim as *mut u64).write(arg1 | (now << TIMESTAMP_SHIFT)) };
                self.ipc_calc(claim, delta_cycles, slot, false);
                1
            }
            None => 0,
        }
    }

    /// Inserts a return entry, folding it into the immediately prior
    /// word when that word is the matching call, still unfolded, and
    /// both the elapsed time and the return value fit in a byte. The
    /// fold succeeds 90-95% of the time.
    pub fn insert_1_retopt(&self, arg1: u64) -> u64 {
        let now = self.time.now_cycles();
        let slot = self.slot();
        if let Some(prior) = self.prior_entry(slot) {
            let prior_word = unsafe { (prior as *const u64).read() };
            // Matching call differs only in the return bit, with the
            // delta and retval bytes still zero.
            let diff = (prior_word ^ arg1) & EVENT_DELTA_RETVAL_MASK;
            let prior_t = prior_word >> TIMESTAMP_SHIFT;
            let mut delta_t = now.wrapping_sub(prior_t) & UNSHIFTED_TIMESTAMP_MASK;
            if diff == EVENT_RETURN_BIT && delta_t <= MAX_DELTA_VALUE {
                // Nonzero delta flags that a return is folded in.
                if delta_t == 0 {
                    delta_t = 1;
                }
                let opt_ret = (delta_t << crate::event::DELTA_SHIFT)
                    | ((arg1 & UNSHIFTED_RETVAL_MASK) << crate::event::RETVAL_SHIFT);
                // The prior word may be shared with a concurrent reader;
                // OR it in atomically through the raw pointer.
                unsafe { AtomicU64::from_ptr(prior as *mut u64).fetch_or(opt_ret, Relaxed) };
                self.ipc_calc(prior, delta_t, slot, true);
                return 0;
            }
        }
        self.insert_1(arg1)
    }

    /// Inserts a two-word entry (a PC sample: header plus the 64-bit PC).
    pub fn insert_2(&self, arg1: u64, arg2: u64) -> u64 {
        let now = self.time.now_cycles();
        let slot = self.slot();
        let delta_cycles = now.wrapping_sub(slot.prior_cycles.load(Relaxed));
        let claim = self.claim_with_tsdelta(now, delta_cycles, 2, slot);
        slot.prior_cycles.store(now, Relaxed);
        match claim {
            Some(claim) => {
                unsafe {
                    (claim as *mut u64).write(arg1 | (now << TIMESTAMP_SHIFT));
                    ((claim + 8) as *mut u64).write(arg2);
                }
                2
            }
            None => 0,
        }
    }

    /// Inserts one entry of 1..8 words; `words[0]` is the length-tagged
    /// head. Returns the number of words written.
    pub fn insert_n_kernel(&self, words: &[u64]) -> u64 {
        let Some(&head) = words.first() else {
            return 0;
        };
        let len = entry_len(head);
        if is_bad_len(len) || len > words.len() {
            self.tracing.store(false, Relaxed);
            return 0;
        }
        let now = self.time.now_cycles();
        let slot = self.slot();
        let delta_cycles = now.wrapping_sub(slot.prior_cycles.load(Relaxed));
        let claim = self.claim_with_tsdelta(now, delta_cycles, len, slot);
        slot.prior_cycles.store(now, Relaxed);
        match claim {
            Some(claim) => {
                unsafe {
                    (claim as *mut u64).write(head | (now << TIMESTAMP_SHIFT));
                    copy_nonoverlapping(
                        words.as_ptr().add(1),
                        (claim + 8) as *mut u64,
                        len - 1,
                    );
                }
                len as u64
            }
            None => 0,
        }
    }

    /// Inserts one entry of 1..8 words from a caller-owned buffer of
    /// exactly eight words; the head word's length nibble selects how
    /// many are used. A null pointer inserts nothing and returns 0.
    ///
    /// # Safety
    ///
    /// `user` must be null or valid for reads of eight u64s.
    pub unsafe fn insert_n_user(&self, user: *const u64) -> u64 {
        if user.is_null() {
            return 0;
        }
        let mut temp = [0u64; 8];
        copy_nonoverlapping(user, temp.as_mut_ptr(), 8);
        self.insert_n_kernel(&temp)
    }

    // ---- hook entry points -------------------------------------------

    /// Single-event hook: syscall/trap/irq calls and returns, context
    /// switches, marks. `event` must fit in 12 bits; `arg` in 16 bits
    /// for call/return events and 32 bits otherwise.
    pub fn trace_1(&self, event: u64, arg: u64) {
        if !self.tracing.load(Relaxed) {
            return;
        }
        // Return events 011x/101x/111x with a signed return value that
        // fits a byte are candidates for the call/return fold.
        if is_return_event(event) && (arg.wrapping_add(128) & !UNSHIFTED_RETVAL_MASK) == 0 {
            self.insert_1_retopt((event << EVENT_SHIFT) | arg);
            return;
        }
        self.insert_1(pack(event, arg));
    }

    /// Two-word hook, only used for PC samples at the timer interrupt.
    /// The current CPU frequency rides along in the first word.
    pub fn trace_2(&self, event: u64, _arg1: u64, arg2: u64) {
        if !self.tracing.load(Relaxed) {
            return;
        }
        let freq = self.time.cpu_freq_mhz();
        self.insert_2(pack(event, freq), arg2);
    }

    /// Variable-length hook: name entries and other multi-word payloads
    /// built in kernel-side code.
    pub fn trace_many(&self, event: u64, words: &[u64]) {
        if !self.tracing.load(Relaxed) {
            return;
        }
        let len = words.len();
        if is_bad_len(len) {
            self.tracing.store(false, Relaxed);
            return;
        }
        let mut temp: ArrayVec<u64, 8> = words.iter().copied().collect();
        temp[0] |= (event | (len as u64) << EVENT_LENGTH_FIELD_SHIFT) << EVENT_SHIFT;
        self.insert_n_kernel(&temp);
    }

    // ---- marks -------------------------------------------------------

    /// Labels this instant with up to six characters of mark text.
    /// Returns the number of words written (0 when tracing is off).
    pub fn mark_a(&self, label: &str) -> u64 {
        self.mark(code::MARKA, crate::event::base40::encode(label))
    }

    pub fn mark_b(&self, label: &str) -> u64 {
        self.mark(code::MARKB, crate::event::base40::encode(label))
    }

    pub fn mark_c(&self, label: &str) -> u64 {
        self.mark(code::MARKC, crate::event::base40::encode(label))
    }

    /// Numeric mark.
    pub fn mark_d(&self, value: u64) -> u64 {
        self.mark(code::MARKD, value)
    }

    fn mark(&self, event: u64, arg: u64) -> u64 {
        if !self.tracing.load(Relaxed) {
            return 0;
        }
        self.insert_1(pack(event, arg))
    }
}

impl<T: TimeSource> Drop for Engine<T> {
    fn drop(&mut self) {
        self.tracing.store(false, Relaxed);
        debug!("trace engine torn down");
    }
}
