//! `CodeDataPages`: one mmap'd region split into a code half (front) and
//! a data half (back, `[Context | shadows]`), matching spec.md §9's
//! "single `allocateMappedMemory(2·pagesize)`, split" recommendation.
//!
//! `std`-only: the rest of this crate is `no_std` + alloc, but mapping
//! executable memory needs an OS — the same reason `embive-runtime` sits
//! outside the workspace's `no_std` default-members instead of trying to
//! stay host-agnostic.

use qbdi_ir::Rword;

/// Two RW/RX-togglable pages: `code` is executable-or-writable depending
/// on `protect_rw`/`protect_rx`, `data` stays RW for the whole lifetime
/// (the `Context`/shadow area is never executed).
pub struct CodeDataPages {
    base: *mut libc::c_void,
    total_len: usize,
    code_len: usize,
    data_len: usize,
    code_writable: bool,
}

// The mapping is only ever touched through `&mut self` methods or raw
// pointers the caller explicitly asked for; nothing here relies on
// thread-local state.
unsafe impl Send for CodeDataPages {}

impl CodeDataPages {
    /// Map `code_len + data_len` bytes (rounded up to the host page size),
    /// code first, data second. Starts RW so the ExecBlock can write the
    /// first sequence before ever becoming executable.
    pub fn map(code_len: usize, data_len: usize) -> Result<Self, crate::error::ExecError> {
        let page_size = Self::page_size();
        let code_len = round_up(code_len, page_size);
        let data_len = round_up(data_len, page_size);
        let total_len = code_len + data_len;

        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(crate::error::ExecError::AllocationFailed {
                reason: alloc::format!("mmap of {} bytes failed", total_len),
            });
        }

        Ok(Self {
            base: addr,
            total_len,
            code_len,
            data_len,
            code_writable: true,
        })
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn code_base(&self) -> *mut u8 {
        self.base as *mut u8
    }

    pub fn data_base(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(self.code_len) }
    }

    pub fn code_addr(&self) -> Rword {
        self.code_base() as Rword
    }

    pub fn data_addr(&self) -> Rword {
        self.data_base() as Rword
    }

    /// Copy `bytes` into the code half at `offset`. The caller must have
    /// called `make_writable` first (or never yet called
    /// `make_executable`).
    pub fn write_code(&mut self, offset: usize, bytes: &[u8]) {
        assert!(self.code_writable, "code page is not currently writable");
        assert!(offset + bytes.len() <= self.code_len, "write past the code page");
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code_base().add(offset), bytes.len());
        }
    }

    pub fn read_data<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + core::mem::size_of::<T>() <= self.data_len, "read past the data page");
        unsafe { core::ptr::read_unaligned(self.data_base().add(offset) as *const T) }
    }

    pub fn write_data<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(offset + core::mem::size_of::<T>() <= self.data_len, "write past the data page");
        unsafe { core::ptr::write_unaligned(self.data_base().add(offset) as *mut T, value) }
    }

    /// `mprotect(RX)` the code half, so translated sequences can run.
    pub fn make_executable(&mut self) -> Result<(), crate::error::ExecError> {
        self.protect_code(libc::PROT_READ | libc::PROT_EXEC)?;
        self.code_writable = false;
        Ok(())
    }

    /// `mprotect(RW)` the code half back, so another sequence can be
    /// written (spec.md §4.5's write/execute toggle).
    pub fn make_writable(&mut self) -> Result<(), crate::error::ExecError> {
        self.protect_code(libc::PROT_READ | libc::PROT_WRITE)?;
        self.code_writable = true;
        Ok(())
    }

    fn protect_code(&mut self, prot: libc::c_int) -> Result<(), crate::error::ExecError> {
        let rc = unsafe { libc::mprotect(self.code_base() as *mut libc::c_void, self.code_len, prot) };
        if rc != 0 {
            return Err(crate::error::ExecError::AllocationFailed {
                reason: alloc::string::String::from("mprotect on code page failed"),
            });
        }
        Ok(())
    }
}

impl Drop for CodeDataPages {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.total_len);
        }
    }
}

fn round_up(len: usize, page_size: usize) -> usize {
    (len + page_size - 1) / page_size * page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_splits_code_and_data_contiguously() {
        let pages = CodeDataPages::map(64, 64).unwrap();
        assert_eq!(pages.data_base() as usize, pages.code_base() as usize + pages.code_len());
    }

    #[test]
    fn write_then_read_roundtrips_in_data_half() {
        let mut pages = CodeDataPages::map(64, 256).unwrap();
        pages.write_data(8, 0xdead_beef_u64);
        assert_eq!(pages.read_data::<u64>(8), 0xdead_beef_u64);
    }

    #[test]
    fn write_code_then_make_executable_then_writable_again() {
        let mut pages = CodeDataPages::map(64, 64).unwrap();
        pages.write_code(0, &[0x90, 0xC3]);
        pages.make_executable().unwrap();
        pages.make_writable().unwrap();
        pages.write_code(0, &[0xC3]);
    }

    #[test]
    #[should_panic(expected = "code page is not currently writable")]
    fn write_code_after_make_executable_panics() {
        let mut pages = CodeDataPages::map(64, 64).unwrap();
        pages.make_executable().unwrap();
        pages.write_code(0, &[0x90]);
    }
}
