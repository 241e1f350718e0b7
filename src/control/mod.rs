//! The privileged command surface.
//!
//! One entry point, [`Engine::control`], takes a `(command, arg)` pair
//! exactly as the trace-control syscall does. Unknown commands and
//! privilege failures return `!0`; everything else returns a meaningful
//! u64. The complemented [`Command::Insert1`]/[`Command::InsertN`] forms
//! insert even while tracing is off, which is how a trace file gets its
//! preamble of name entries.

use thiserror::Error;

use crate::engine::Engine;
use crate::ffi::syscall::has_trace_capability;
use crate::time::TimeSource;

/// Control commands, numbered as the syscall interface numbers them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Command {
    Off = 0,
    On = 1,
    Flush = 2,
    Reset = 3,
    Stat = 4,
    GetCount = 5,
    GetWord = 6,
    Insert1 = 7,
    InsertN = 8,
    GetIpcWord = 9,
    Test = 10,
    Version = 11,
    Set4Kb = 12,
    Get4Kb = 13,
    GetIpc4Kb = 14,
}

impl Command {
    pub const fn raw(self) -> u64 {
        self as u64
    }

    /// The bitwise-complement form that also inserts with tracing off.
    pub const fn raw_forced(self) -> u64 {
        !(self as u64)
    }
}

/// Why a control request was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("trace engine not present")]
    NotLoaded,
    #[error("engine version {found} is older than required {required}")]
    TooOld { found: u64, required: u64 },
    #[error("caller lacks the trace capability")]
    NotPrivileged,
}

/// Probes an engine the way the control CLI probes the module: a version
/// reply above 255 means no engine answered, a small one may be too old.
pub fn probe<T: TimeSource>(engine: &Engine<T>, required: u64) -> Result<u64, ControlError> {
    let found = unsafe { engine.control(Command::Version.raw(), 0) };
    if found > 255 {
        return Err(ControlError::NotLoaded);
    }
    if found < required {
        return Err(ControlError::TooOld { found, required });
    }
    Ok(found)
}

impl<T: TimeSource> Engine<T> {
    /// Dispatches one control command.
    ///
    /// | command | arg | returns |
    /// |---|---|---|
    /// | `Off` | — | tracing bit (0) |
    /// | `On` | — | tracing bit (1) |
    /// | `Flush` | — | words zeroed |
    /// | `Reset` | `DO_IPC`\|`DO_WRAP` | 0 |
    /// | `Stat` | — | full blocks |
    /// | `GetCount` | — | word count, complemented if wrapped |
    /// | `GetWord` | word subscript | trace word |
    /// | `Insert1` | packed entry | words written, 0 if tracing off |
    /// | `InsertN` | pointer to 8 words | words written, 0 if tracing off |
    /// | `GetIpcWord` | word subscript | sidecar word |
    /// | `Test` | — | 0/1 tracing state |
    /// | `Version` | — | engine version |
    /// | `Set4Kb` | word subscript | 0 |
    /// | `Get4Kb` | destination pointer | bytes uncopied |
    /// | `GetIpc4Kb` | destination pointer | bytes uncopied |
    /// | `!Insert1`, `!InsertN` | as above | words written even when off |
    ///
    /// Anything else returns `!0`, as does any call without the trace
    /// capability when checking is enabled.
    ///
    /// # Safety
    ///
    /// For `InsertN` (either form), `arg` must be null or a pointer valid
    /// for reads of eight u64s; for `Get4Kb`/`GetIpc4Kb` it must be a
    /// pointer valid for 4096 bytes of writes. All other commands treat
    /// `arg` as a plain integer.
    pub unsafe fn control(&self, command: u64, arg: u64) -> u64 {
        if self.check() && !has_trace_capability() {
            return !0;
        }

        if command == Command::Insert1.raw_forced() {
            return self.insert_1(arg);
        }
        if command == Command::InsertN.raw_forced() {
            return self.insert_n_user(arg as *const u64);
        }

        match command {
            c if c == Command::Off.raw() => self.trace_off(),
            c if c == Command::On.raw() => self.trace_on(),
            c if c == Command::Flush.raw() => self.flush(),
            c if c == Command::Reset.raw() => self.reset(arg),
            c if c == Command::Stat.raw() => self.stat(),
            c if c == Command::GetCount.raw() => {
                if self.did_wrap() {
                    // Convey that the trace actually wrapped.
                    !self.word_count()
                } else {
                    self.word_count()
                }
            }
            c if c == Command::GetWord.raw() => self.get_word(arg),
            c if c == Command::Insert1.raw() => {
                if self.is_tracing() {
                    self.insert_1(arg)
                } else {
                    0
                }
            }
            c if c == Command::InsertN.raw() => {
                if self.is_tracing() {
                    self.insert_n_user(arg as *const u64)
                } else {
                    0
                }
            }
            c if c == Command::GetIpcWord.raw() => self.get_ipc_word(arg),
            c if c == Command::Test.raw() => self.is_tracing() as u64,
            c if c == Command::Version.raw() => self.version(),
            c if c == Command::Set4Kb.raw() => self.set_4kb(arg),
            c if c == Command::Get4Kb.raw() => self.get_4kb(arg as *mut u8),
            c if c == Command::GetIpc4Kb.raw() => self.get_ipc_4kb(arg as *mut u8),
            _ => !0,
        }
    }
}
