use std::io::{Error, Result};
use std::ptr::{null_mut, NonNull};

/// Anonymous shared mapping backing a simulated ring buffer.
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
}

impl Arena {
    pub fn new(len: usize) -> Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_SHARED | libc::MAP_ANONYMOUS;
        let ptr = unsafe { mmap(len, prot, flags) }?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::error!("failed to unmap ring buffer arena: {}", e);
        }
    }
}

// The mapping is plain memory owned by this value.
unsafe impl Send for Arena {}

unsafe fn mmap(len: usize, prot: i32, flags: i32) -> Result<NonNull<u8>> {
    let ptr = libc::mmap(null_mut(), len, prot, flags, -1, 0);
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    // A successful mmap never returns null.
    NonNull::new(ptr as *mut u8).ok_or_else(Error::last_os_error)
}

unsafe fn munmap(ptr: NonNull<u8>, len: usize) -> Result<()> {
    if libc::munmap(ptr.as_ptr() as _, len) != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
