use std::io::Result;
use std::ptr::NonNull;

use crate::ffi::syscall::{mmap_anon, munmap};

/// Owned anonymous mapping holding the trace arena.
pub(crate) struct Arena {
    ptr: NonNull<u8>,
    len: usize,
}

impl Arena {
    pub fn new(len: usize) -> Result<Self> {
        let ptr = mmap_anon(len)?;
        Ok(Self { ptr, len })
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match unsafe { munmap(self.ptr.as_ptr(), self.len) } {
            Ok(()) => (),
            Err(e) => panic!("Failed to unmap arena: {}", e),
        }
    }
}
