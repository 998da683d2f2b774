//! mmap-backed guest memory for integration tests, mirroring the page
//! allocation `qbdi_execblock::pages::CodeDataPages` does for the JIT's
//! own code/data pages.

use std::ffi::c_void;

/// An RWX page holding raw guest instruction bytes at a fixed address.
pub struct GuestCode {
    base: *mut c_void,
    len: usize,
}

impl GuestCode {
    /// Maps one host page and copies `bytes` to its start. The rest of
    /// the page stays zero-filled; real execution in these tests never
    /// reaches past the mapped instructions' own `jmp`-to-epilogue, so
    /// the trailing zero bytes are only ever decoded, never run.
    pub fn map(bytes: &[u8]) -> Self {
        let len = page_size();
        assert!(bytes.len() <= len, "guest code longer than one page");
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED, "mmap failed");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base as *mut u8, bytes.len());
        }
        Self { base, len }
    }

    pub fn addr(&self) -> u64 {
        self.base as u64
    }

    pub fn end(&self) -> u64 {
        self.addr() + self.len as u64
    }
}

impl Drop for GuestCode {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

/// An RW region a guest `ret`/`call`/`push`/`pop` can safely touch.
pub struct GuestStack {
    base: *mut c_void,
    len: usize,
}

impl GuestStack {
    pub fn new() -> Self {
        let len = 64 * 1024;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED, "mmap failed");
        Self { base, len }
    }

    /// A 16-byte-aligned address with headroom below it, matching the
    /// SysV calling convention's stack alignment at a call boundary.
    pub fn top(&self) -> u64 {
        let raw = self.base as u64 + self.len as u64 - 256;
        raw & !0xf
    }

    /// Writes `value` at `addr`, which must fall within this mapping.
    pub fn write_u64(&self, addr: u64, value: u64) {
        assert!(addr >= self.base as u64 && addr + 8 <= self.base as u64 + self.len as u64);
        unsafe {
            (addr as *mut u64).write(value);
        }
    }
}

impl Drop for GuestStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
