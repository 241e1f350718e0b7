use std::fs;

use super::{time_pair, Dumper, TRACEFILE_VERSION};
use crate::config::{DO_IPC, DO_WRAP};
use crate::engine::test::{params, pin_to_cpu0, ManualClock};
use crate::engine::{Engine, BLOCK_BYTES, BLOCK_WORDS, IPC_BLOCK_WORDS};
use crate::event::{code, Entry};

fn read_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn time_pair_reads_close_together() {
    let clock = ManualClock::at(500);
    let pair = time_pair(&clock);
    assert_eq!(pair.cycles, 500);
    assert!(pair.usec > 0);
}

#[test]
fn dump_writes_blocks_with_anchors_and_sidecar() {
    pin_to_cpu0();
    let engine = Engine::for_test(params(), ManualClock::at(0x4000), 8 * BLOCK_BYTES);
    let mut run = Dumper::new(&engine);

    run.reset(DO_IPC);
    assert!(run.on());
    for i in 0..100u64 {
        engine.time().set(0x4000 + i * 2);
        engine.trace_1(code::MARKD, i);
    }
    assert!(run.off());
    run.flush();

    let words_used = {
        // One block: count checked before dump resets the engine.
        let n = engine.word_count();
        assert_eq!(n, BLOCK_WORDS as u64);
        n
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ku.trace");
    let blocks = run.dump(&path).unwrap();
    assert_eq!(blocks, 1);

    let bytes = fs::read(&path).unwrap();
    // 8192 trace words plus 1024 sidecar words per block.
    assert_eq!(
        bytes.len() as u64,
        words_used * 8 + (words_used / 8) * 8
    );

    let words = read_words(&bytes);
    let flags = words[1] >> 56;
    assert_eq!(flags & 0x0f, TRACEFILE_VERSION); // version nibble
    assert_ne!(flags & 0x80, 0); // ipc flag
    assert_eq!(flags & 0x40, 0); // did not wrap

    let (start, stop) = run.anchors();
    assert_eq!(words[2], start.cycles);
    assert_eq!(words[3], start.usec as u64);
    assert_eq!(words[4], stop.cycles);
    assert_eq!(words[5], stop.usec as u64);

    // The block's reconstructed gettimeofday lands between the anchors.
    let block_usec = (words[1] & 0x00ff_ffff_ffff_ffff) as i64;
    assert!(block_usec >= start.usec && block_usec <= stop.usec);

    // First entry after the 12 header words is the first mark.
    let entry = Entry(words[12]);
    assert_eq!(entry.event(), code::MARKD);

    // The sidecar rides behind the trace block.
    assert_eq!(bytes.len(), BLOCK_BYTES + IPC_BLOCK_WORDS * 8);

    // Dump left the engine reset for another run.
    assert_eq!(engine.word_count(), 0);
}

#[test]
fn dump_clears_wrap_flag_only_when_trace_did_not_wrap() {
    pin_to_cpu0();
    let engine = Engine::for_test(params(), ManualClock::at(0x4000), 2 * BLOCK_BYTES);
    let mut run = Dumper::new(&engine);

    run.reset(DO_WRAP);
    assert!(run.on());
    for i in 0..20000u64 {
        engine.time().set(0x4000 + i * 2);
        engine.trace_1(code::MARKD, i);
    }
    assert!(run.off());
    run.flush();
    assert!(engine.did_wrap());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrapped.trace");
    let blocks = run.dump(&path).unwrap();
    assert_eq!(blocks, 2);

    let bytes = fs::read(&path).unwrap();
    let words = read_words(&bytes);
    assert_ne!((words[1] >> 56) & 0x40, 0, "wrap flag must survive");
}

#[test]
fn init_seeds_names_and_userpid() {
    pin_to_cpu0();
    let engine = Engine::for_test(params(), ManualClock::at(0x4000), 4 * BLOCK_BYTES);
    let mut run = Dumper::new(&engine);

    run.reset(0);
    run.init("testrun");
    assert!(run.on());
    assert!(run.off());
    run.flush();

    // Walk the first block's entries: kernelver/modelname/hostname name
    // entries, then the pidname and the USERPID event.
    let mut w = 12;
    let mut seen = Vec::new();
    while w < BLOCK_WORDS as u64 {
        let head = engine.get_word(w);
        if head == 0 {
            break;
        }
        let entry = Entry(head);
        seen.push(entry.event() & 0xf0f); // drop the length nibble
        w += crate::event::entry_len(head) as u64;
    }
    assert_eq!(
        seen,
        vec![
            code::KERNEL_VER,
            code::MODEL_NAME,
            code::HOST_NAME,
            code::PIDNAME,
            code::USERPID
        ]
    );
}

#[test]
fn live_dump_stops_after_a_bounded_prefix() {
    pin_to_cpu0();
    let engine = Engine::for_test(params(), ManualClock::at(0x4000), 4 * BLOCK_BYTES);
    let mut run = Dumper::new(&engine);

    run.reset(0);
    assert!(run.on());
    for i in 0..10u64 {
        engine.time().set(0x4000 + i * 2);
        engine.trace_1(code::MARKD, i);
    }

    // Tracing still on: a live dump of the bounded 28-block prefix.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.trace");
    let blocks = run.dump(&path).unwrap();
    assert_eq!(blocks, 28);
    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 28 * BLOCK_BYTES);
}
