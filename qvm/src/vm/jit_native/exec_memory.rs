//! Mappings for generated routines. Code is copied in while the pages are
//! writable, then the mapping is sealed read-execute before first use.

use std::ptr::NonNull;

use crate::jit::CompileError;

pub(super) struct ExecutableMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl ExecutableMemory {
    pub(super) fn from_code(code: &[u8]) -> Result<Self, CompileError> {
        if code.is_empty() {
            return Err(CompileError::ExecutableMemory(
                "cannot map an empty routine".to_string(),
            ));
        }
        let ptr = sys::map(code.len())?;
        // dropping on a failed seal unmaps the region
        let memory = Self {
            ptr,
            len: code.len(),
        };
        unsafe { sys::fill(ptr.as_ptr(), code) };
        sys::seal(ptr.as_ptr(), code.len())?;
        Ok(memory)
    }

    pub(super) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr.as_ptr(), self.len) {
            tracing::warn!("failed to release native routine: {err}");
        }
    }
}

fn last_os_error(call: &str) -> CompileError {
    CompileError::ExecutableMemory(format!("{call}: {}", std::io::Error::last_os_error()))
}

fn non_null(ptr: *mut u8, call: &str) -> Result<NonNull<u8>, CompileError> {
    NonNull::new(ptr).ok_or_else(|| last_os_error(call))
}

#[cfg(all(unix, not(target_os = "macos")))]
mod sys {
    use std::ptr::NonNull;

    use super::{last_os_error, non_null};
    use crate::jit::CompileError;

    pub(super) fn map(len: usize) -> Result<NonNull<u8>, CompileError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }
        non_null(ptr.cast(), "mmap")
    }

    pub(super) unsafe fn fill(ptr: *mut u8, code: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
        #[cfg(target_arch = "aarch64")]
        unsafe {
            __clear_cache(ptr.cast(), ptr.add(code.len()).cast());
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }

    pub(super) fn seal(ptr: *mut u8, len: usize) -> Result<(), CompileError> {
        if unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            return Err(last_os_error("mprotect"));
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> Result<(), CompileError> {
        if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
            return Err(last_os_error("munmap"));
        }
        Ok(())
    }
}

/// Apple silicon forbids W^X flips on ordinary pages; MAP_JIT regions are
/// toggled per thread instead.
#[cfg(target_os = "macos")]
mod sys {
    use std::ptr::NonNull;

    use super::{last_os_error, non_null};
    use crate::jit::CompileError;

    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }

    pub(super) fn map(len: usize) -> Result<NonNull<u8>, CompileError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_error("mmap(MAP_JIT)"));
        }
        non_null(ptr.cast(), "mmap(MAP_JIT)")
    }

    pub(super) unsafe fn fill(ptr: *mut u8, code: &[u8]) {
        unsafe {
            let toggle = pthread_jit_write_protect_supported_np() != 0;
            if toggle {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            sys_icache_invalidate(ptr.cast(), code.len());
            if toggle {
                pthread_jit_write_protect_np(1);
            }
        }
    }

    pub(super) fn seal(_ptr: *mut u8, _len: usize) -> Result<(), CompileError> {
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> Result<(), CompileError> {
        if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
            return Err(last_os_error("munmap"));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::ptr::NonNull;

    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use super::{last_os_error, non_null};
    use crate::jit::CompileError;

    pub(super) fn map(len: usize) -> Result<NonNull<u8>, CompileError> {
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        non_null(ptr.cast(), "VirtualAlloc")
    }

    pub(super) unsafe fn fill(ptr: *mut u8, code: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
    }

    pub(super) fn seal(ptr: *mut u8, len: usize) -> Result<(), CompileError> {
        let mut previous = 0u32;
        if unsafe { VirtualProtect(ptr as *const _, len, PAGE_EXECUTE_READ, &mut previous) } == 0 {
            return Err(last_os_error("VirtualProtect"));
        }
        if unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len) } == 0 {
            return Err(last_os_error("FlushInstructionCache"));
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, _len: usize) -> Result<(), CompileError> {
        if unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) } == 0 {
            return Err(last_os_error("VirtualFree"));
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::ptr::NonNull;

    use crate::jit::CompileError;

    pub(super) fn map(_len: usize) -> Result<NonNull<u8>, CompileError> {
        Err(CompileError::ExecutableMemory(
            "executable memory is not available on this platform".to_string(),
        ))
    }

    pub(super) unsafe fn fill(_ptr: *mut u8, _code: &[u8]) {}

    pub(super) fn seal(_ptr: *mut u8, _len: usize) -> Result<(), CompileError> {
        Ok(())
    }

    pub(super) fn unmap(_ptr: *mut u8, _len: usize) -> Result<(), CompileError> {
        Ok(())
    }
}
