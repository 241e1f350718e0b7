use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use super::{Engine, BLOCK_BYTES, BLOCK_WORDS};
use crate::config::{TraceParams, DO_IPC, DO_WRAP};
use crate::event::{code, name_entry, pack, Entry};
use crate::time::TimeSource;

/// Scripted clock so tests drive the encoder with exact timestamps.
pub(crate) struct ManualClock {
    now: AtomicU64,
    inst: AtomicU64,
}

impl ManualClock {
    pub fn at(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
            inst: AtomicU64::new(0),
        }
    }

    pub fn set(&self, t: u64) {
        self.now.store(t, Relaxed);
    }

    pub fn add_inst(&self, n: u64) {
        self.inst.fetch_add(n, Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn now_cycles(&self) -> u64 {
        self.now.load(Relaxed)
    }

    fn inst_retired(&self) -> u64 {
        self.inst.load(Relaxed)
    }

    fn cpu_freq_mhz(&self) -> u64 {
        3000
    }

    fn enable_core(&self, _cpu: usize) {}
}

pub(crate) fn params() -> TraceParams {
    let _ = env_logger::builder().is_test(true).try_init();
    TraceParams {
        check: false,
        ..TraceParams::default()
    }
}

/// Keeps a scenario on one CPU slot so its entries stay in one block.
pub(crate) fn pin_to_cpu0() {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(0, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

fn small_engine(blocks: usize, clock_start: u64) -> Engine<ManualClock> {
    Engine::for_test(params(), ManualClock::at(clock_start), blocks * BLOCK_BYTES)
}

/// Entries of the very first block start after the 8 header/anchor words
/// and the 4-word pid block.
const FIRST_ENTRY: u64 = 12;

#[test]
fn folds_matching_return_into_call() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x10000);
    engine.trace_on();

    engine.trace_1(code::SYSCALL64, 0x1234);
    engine.time().set(0x10005);
    engine.trace_1(code::SYSRET64, 0x7f);

    engine.trace_off();
    engine.flush();

    let entry = Entry(engine.get_word(FIRST_ENTRY));
    assert_eq!(entry.event(), code::SYSCALL64);
    assert_eq!(entry.arg0(), 0x1234);
    assert_eq!(entry.delta(), 5);
    assert_eq!(entry.retval(), 0x7f);
    assert_eq!(entry.timestamp(), 0x10000);
    // The fold wrote no second word.
    assert_eq!(engine.get_word(FIRST_ENTRY + 1), 0);
}

#[test]
fn wide_return_value_does_not_fold() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x10000);
    engine.trace_on();

    engine.trace_1(code::SYSCALL64, 0x1234);
    engine.time().set(0x10005);
    engine.trace_1(code::SYSRET64, 0x180); // does not fit signed 8 bits

    engine.trace_off();
    engine.flush();

    let call = Entry(engine.get_word(FIRST_ENTRY));
    assert_eq!(call.event(), code::SYSCALL64);
    assert_eq!(call.delta(), 0);
    assert_eq!(call.retval(), 0);

    let ret = Entry(engine.get_word(FIRST_ENTRY + 1));
    assert_eq!(ret.event(), code::SYSRET64);
    assert_eq!(ret.arg0(), 0x180);
    assert_eq!(ret.timestamp(), 0x10005);
}

#[test]
fn stale_call_does_not_fold() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x10000);
    engine.trace_on();

    engine.trace_1(code::SYSCALL64, 1);
    // 0x120 timestamp units elapsed: too far apart to fold.
    engine.time().set(0x10120);
    engine.trace_1(code::SYSRET64, 0);

    engine.trace_off();
    engine.flush();

    assert_eq!(Entry(engine.get_word(FIRST_ENTRY)).delta(), 0);
    assert_eq!(Entry(engine.get_word(FIRST_ENTRY + 1)).event(), code::SYSRET64);
}

#[test]
fn near_wrap_gap_inserts_tsdelta() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x00100);
    engine.trace_on();

    // First entry on a CPU never gets a TSDELTA: the delta from the
    // zero sentinel is meaningless.
    engine.insert_1(pack(code::MARKD, 1));
    engine.time().set(0xe0200);
    engine.insert_1(pack(code::MARKD, 2));

    engine.trace_off();
    engine.flush();

    let tsdelta = Entry(engine.get_word(FIRST_ENTRY + 1));
    assert_eq!(tsdelta.event(), code::TSDELTA);
    assert_eq!(tsdelta.arg(), 0xe0100);

    let entry = Entry(engine.get_word(FIRST_ENTRY + 2));
    assert_eq!(entry.event(), code::MARKD);
    assert_eq!(entry.timestamp(), 0xe0200);
}

#[test]
fn small_gap_inserts_no_tsdelta() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x00100);
    engine.trace_on();

    engine.insert_1(pack(code::MARKD, 1));
    engine.time().set(0xe0100); // exactly the threshold, not above
    engine.insert_1(pack(code::MARKD, 2));

    engine.trace_off();
    engine.flush();

    assert_eq!(Entry(engine.get_word(FIRST_ENTRY + 1)).event(), code::MARKD);
}

#[test]
fn name_entries_span_words() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x10000);
    engine.trace_on();

    let words = name_entry(code::METHODNAME, 0xa5, "read");
    assert_eq!(engine.insert_n_kernel(&words), 2);

    engine.trace_off();
    engine.flush();

    let head = Entry(engine.get_word(FIRST_ENTRY));
    assert_eq!(head.event(), 0x023); // methodname, length 2
    assert_eq!(head.arg0(), 0xa5);
    assert_eq!(super::entry_len(head.0), 2);
    assert_eq!(
        engine.get_word(FIRST_ENTRY + 1),
        u64::from_le_bytes(*b"read\0\0\0\0")
    );
}

#[test]
fn trace_many_builds_the_length_nibble() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x10000);
    engine.trace_on();

    let tail = u64::from_le_bytes(*b"worker\0\0");
    engine.trace_many(code::PIDNAME, &[1234, tail]);

    engine.trace_off();
    engine.flush();

    let head = Entry(engine.get_word(FIRST_ENTRY));
    assert_eq!(head.event(), 0x022); // pidname, length 2
    assert_eq!(head.arg0(), 1234);
    assert_eq!(engine.get_word(FIRST_ENTRY + 1), tail);
}

#[test]
fn wrap_recycles_blocks_and_keeps_tracing() {
    pin_to_cpu0();
    let engine = small_engine(1, 0x100);
    engine.reset(DO_WRAP);
    engine.trace_on();
    assert!(!engine.pid_filter_test_and_set(42));

    for i in 0..9000u64 {
        engine.time().set(0x100 + i * 2);
        engine.insert_1(pack(code::MARKD, i));
    }

    assert!(engine.did_wrap());
    assert!(engine.is_tracing());
    // The wrap cleared the pid filter.
    assert!(!engine.pid_filter_test_and_set(42));
    // A one-block arena wraps back onto the top block.
    assert_eq!(engine.arena_next_from_high(), BLOCK_BYTES as u64);
    // Wrapped count reports the whole arena.
    assert_eq!(engine.word_count(), BLOCK_WORDS as u64);
}

#[test]
fn wrap_skips_the_very_first_block() {
    pin_to_cpu0();
    let engine = small_engine(2, 0x100);
    engine.reset(DO_WRAP);
    engine.trace_on();

    engine.time().set(0x102);
    engine.insert_1(pack(code::MARKD, 0));
    // Scribble a recognizable anchor word to watch for clobbering.
    let probe = 0xfeedface;
    unsafe {
        let first_block = (engine.arena.base() as *mut u64).add(BLOCK_WORDS);
        first_block.add(2).write(probe);
    }

    for i in 0..20000u64 {
        engine.time().set(0x104 + i * 2);
        engine.insert_1(pack(code::MARKD, i));
    }

    assert!(engine.did_wrap());
    // Wrap reuses the second block from the top, never the first.
    assert_eq!(engine.arena_next_from_high(), 2 * BLOCK_BYTES as u64);
    engine.trace_off();
    engine.flush();
    assert_eq!(engine.get_word(2), probe);
}

#[test]
fn full_arena_disables_tracing_without_wrap() {
    pin_to_cpu0();
    let engine = small_engine(1, 0x100);
    engine.trace_on();

    for i in 0..9000u64 {
        engine.time().set(0x100 + i * 2);
        engine.insert_1(pack(code::MARKD, i));
    }

    assert!(!engine.is_tracing());
    assert!(!engine.did_wrap());
    // Later inserts drop silently.
    assert_eq!(engine.insert_1(pack(code::MARKD, 1)), 0);
    assert_eq!(engine.stat(), 1);
}

#[test]
fn block_trailer_words_stay_zero() {
    pin_to_cpu0();
    let engine = small_engine(1, 0x100);
    engine.reset(DO_WRAP);
    engine.trace_on();

    // Mix entry sizes so claims land at assorted offsets.
    for i in 0..4000u64 {
        engine.time().set(0x100 + i * 4);
        engine.insert_1(pack(code::MARKD, i));
        let words = name_entry(code::QUEUE_NAME, i, "queue");
        engine.insert_n_kernel(&words);
    }

    engine.trace_off();
    engine.flush();
    for w in BLOCK_WORDS as u64 - 8..BLOCK_WORDS as u64 {
        assert_eq!(engine.get_word(w), 0, "trailer word {w} not zero");
    }
}

#[test]
fn ipc_sidecar_gets_one_nibble_per_event() {
    pin_to_cpu0();
    // 8 blocks so the low 1/8 reserved for IPC is block-aligned.
    let engine = small_engine(8, 0x10000);
    engine.reset(DO_IPC);
    engine.trace_on();

    engine.trace_1(code::SYSCALL64, 7);
    engine.time().set(0x10005);
    engine.time().add_inst(80);
    engine.trace_1(code::SYSRET64, 0);

    engine.trace_off();
    engine.flush();

    // One folded word at entry 12: call nibble in the low half of its
    // IPC byte, return nibble in the high half. The call interval is
    // the bogus first-entry one, so its nibble is 0; the return ran 80
    // instructions in 5 counts (40 cycles/8), IPC 2/8, nibble 2.
    let entry = Entry(engine.get_word(FIRST_ENTRY));
    assert_eq!(entry.retval(), 0);
    assert_eq!(entry.delta(), 5);
    let ipc_word = engine.get_ipc_word(FIRST_ENTRY >> 3);
    let ipc_byte = (ipc_word >> ((FIRST_ENTRY & 7) * 8)) & 0xff;
    assert_eq!(ipc_byte, 0x20);
}

#[test]
fn reset_then_trace_then_reset_is_idempotent() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x1000);
    engine.reset(DO_WRAP);
    engine.trace_on();
    for i in 0..100u64 {
        engine.time().set(0x1000 + i * 2);
        engine.insert_1(pack(code::MARKD, i));
    }
    engine.trace_off();
    engine.flush();
    assert_ne!(engine.word_count(), 0);

    engine.reset(DO_WRAP);
    assert_eq!(engine.word_count(), 0);
    assert_eq!(engine.stat(), 0);
    assert!(!engine.did_wrap());
    assert!(!engine.is_tracing());

    // Double OFF is a no-op.
    assert_eq!(engine.trace_off(), 0);
    assert_eq!(engine.trace_off(), 0);
}

#[test]
fn flush_zero_fills_the_open_block_tail() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x1000);
    engine.trace_on();
    engine.insert_1(pack(code::MARKD, 7));
    engine.trace_off();

    let zeroed = engine.flush();
    // Header 12 words plus one entry leave the rest of the block.
    assert_eq!(zeroed, (BLOCK_WORDS - 13) as u64);
    assert_eq!(engine.word_count(), BLOCK_WORDS as u64);
    // Flushing again zeroes nothing new.
    assert_eq!(engine.flush(), 0);
}

#[test]
fn first_block_header_carries_cpu_and_flags() {
    pin_to_cpu0();
    let engine = small_engine(4, 0xabcdef);
    engine.reset(DO_WRAP);
    engine.trace_on();
    engine.insert_1(pack(code::MARKD, 1));
    engine.trace_off();
    engine.flush();

    let word0 = engine.get_word(0);
    assert_eq!(word0 & 0x00ff_ffff_ffff_ffff, 0xabcdef);
    let flags = engine.get_word(1) >> 56;
    assert_eq!(flags, 0x40); // wrap requested, no ipc
    // Pid block: pid at word 8, name at words 10..11.
    assert_eq!(engine.get_word(8), std::process::id() as u64);
}

#[test]
fn bad_length_disables_tracing() {
    pin_to_cpu0();
    let engine = small_engine(4, 0x1000);
    engine.trace_on();
    // Length nibble 9 is out of range for a name entry head.
    let bogus = pack(0x190, 0);
    assert_eq!(engine.insert_n_kernel(&[bogus; 9]), 0);
    assert!(!engine.is_tracing());
}

#[test]
fn concurrent_inserts_never_overlap() {
    let engine = small_engine(2, 0x1000);
    engine.reset(DO_WRAP);
    engine.trace_on();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let engine = &engine;
            s.spawn(move || {
                for i in 0..5000u64 {
                    engine.insert_1(pack(code::MARKD, (t << 16) | (i & 0xffff)));
                }
            });
        }
    });

    engine.trace_off();
    engine.flush();
    // The arena survived: full blocks, trailers intact.
    assert_eq!(engine.word_count() % BLOCK_WORDS as u64, 0);
    for w in BLOCK_WORDS as u64 - 8..BLOCK_WORDS as u64 {
        assert_eq!(engine.get_word(w), 0);
    }
}
