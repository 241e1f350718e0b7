//! Per-CPU capture engine for whole-system kernel/user tracing.
//!
//! Records every transition across the kernel boundary as bit-packed
//! 8-byte entries in per-CPU 64 KB traceblocks, at well under 1% of one
//! core: reserving space for an entry is one atomic fetch-add, matching
//! call/return pairs fold into a single word, and an optional sidecar
//! keeps one instructions-per-cycle nibble per event. Hook points in
//! syscall, interrupt, and scheduler paths call [`engine::Engine::trace_1`]
//! and friends; everything else goes through the privileged
//! [`control`](engine::Engine::control) surface, mirroring the
//! trace-control syscall of the kernel implementation.
//!
//! ## Example
//!
//! ```rust
//! use kutrace_capture::config::{TraceParams, DO_WRAP};
//! use kutrace_capture::engine::Engine;
//! use kutrace_capture::event::code;
//! use kutrace_capture::extract::Dumper;
//!
//! // No privilege check so the example runs anywhere.
//! let params = TraceParams { check: false, ..TraceParams::default() };
//! let engine = Engine::new(params).unwrap();
//!
//! let mut run = Dumper::new(&engine);
//! run.reset(DO_WRAP);
//! run.on();
//!
//! engine.mark_a("work");
//! engine.trace_1(code::SYSCALL64 | 1, 42); // syscall 1 entry
//! engine.trace_1(code::SYSRET64 | 1, 0);   // its return, folded
//! engine.mark_a("done");
//!
//! run.off();
//! run.flush();
//! assert!(run.stat(DO_WRAP) >= 1);
//! ```
//!
//! The extracted trace file is a sequence of little-endian 64 KB blocks
//! (each followed by 8 KB of IPC bytes when enabled), with wall-clock
//! anchors patched into the very first block; see [`extract`] for the
//! wire layout and [`event`] for the record format.

pub mod config;
pub mod control;
pub mod engine;
pub mod event;
pub mod extract;
mod ffi;
pub mod time;
