//! Engine parameters, read once at creation.

/// `reset` flag: reserve the low 1/8 of the arena for IPC bytes and write
/// one instructions-per-cycle nibble per event.
pub const DO_IPC: u64 = 1;

/// `reset` flag: recycle traceblocks from the top when the arena fills
/// instead of turning tracing off.
pub const DO_WRAP: u64 = 2;

/// Knobs fixed for the lifetime of an [`Engine`](crate::engine::Engine).
///
/// The counterpart of the module parameters: everything else about a
/// tracing run is chosen per-reset via [`DO_IPC`]/[`DO_WRAP`].
#[derive(Clone, Debug)]
pub struct TraceParams {
    /// MB of trace memory to reserve.
    pub trace_mb: usize,

    /// Require the trace capability for control calls.
    pub check: bool,

    /// Bit-per-byte of which packet payload bytes the hash uses.
    /// Consumed by an external packet hook, never by the engine itself.
    pub pktmask: i64,

    /// Matching packet hash value, likewise hook-owned.
    pub pktmatch: i64,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            trace_mb: 2,
            check: true,
            pktmask: 0x0000_000f,
            pktmatch: 0xd1c5_17e5,
        }
    }
}

/// Compiled packet-filter state for an external packet hook.
///
/// The hash is a u64 XOR over the masked first 24 bytes of payload,
/// seeded with `hash_init`; a match hashes to zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetFilter {
    pub hash_mask: [u64; 3],
    pub hash_init: u64,
}

impl NetFilter {
    pub(crate) fn compile(pktmask: i64, pktmatch: i64) -> Self {
        match pktmask {
            // Match nothing: the seed keeps the hash nonzero.
            0 => Self {
                hash_mask: [0; 3],
                hash_init: 1,
            },
            // Match everything.
            -1 => Self {
                hash_mask: [0; 3],
                hash_init: 0,
            },
            mask => {
                let mut bytes = [0u8; 24];
                for (i, b) in bytes.iter_mut().enumerate() {
                    if (mask >> i) & 1 != 0 {
                        *b = 0xff;
                    }
                }
                let mut hash_mask = [0u64; 3];
                for (i, chunk) in bytes.chunks_exact(8).enumerate() {
                    hash_mask[i] = u64::from_le_bytes(chunk.try_into().unwrap());
                }
                Self {
                    hash_mask,
                    hash_init: pktmatch as u64,
                }
            }
        }
    }
}
