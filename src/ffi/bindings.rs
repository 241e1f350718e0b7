//! Hand-declared slice of the perf ABI.
//!
//! Only the items needed to run one pinned retired-instructions counter
//! per core. Layout follows `PERF_ATTR_SIZE_VER5` (112 bytes).

#![allow(non_camel_case_types)]

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// _IO('$', n)
pub const PERF_IOC_OP_ENABLE: u64 = 0x2400;
pub const PERF_IOC_OP_RESET: u64 = 0x2403;

pub const PERF_ATTR_SIZE_VER5: u32 = 112;

// Bits of `perf_event_attr::flags`.
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_PINNED: u64 = 1 << 2;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config1: u64,
    pub bp_len_or_config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}
