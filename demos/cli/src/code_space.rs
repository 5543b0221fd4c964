//! Memory-mapped code region with a writer refcount
use jitguard::{Backend, CodeRegion, CodeSpaceWriteScope, Mode, Runtime};
use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("the demo only builds on Linux and macOS");

pub struct CodeSpace {
    /// Pointer to a memory-mapped region
    ptr: *mut libc::c_void,

    /// Total length of the region
    len: usize,

    /// Number of open write scopes for this region, across all threads
    writers: AtomicUsize,

    /// Serializes protection changes and writes
    lock: Mutex<()>,

    /// Whether `add_writer` / `remove_writer` call `mprotect`
    per_region: bool,
}

// SAFETY: the mapping is owned by this object, and every write to it happens
// while holding `lock`
unsafe impl Send for CodeSpace {}
unsafe impl Sync for CodeSpace {}

impl CodeSpace {
    pub const PAGE_SIZE: usize = 4096;

    const PROT_RWX: i32 = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    const PROT_RW: i32 = libc::PROT_READ | libc::PROT_WRITE;
    const PROT_RX: i32 = libc::PROT_READ | libc::PROT_EXEC;

    #[cfg(target_os = "macos")]
    const MMAP_FLAGS: i32 = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT;
    #[cfg(not(target_os = "macos"))]
    const MMAP_FLAGS: i32 = libc::MAP_PRIVATE | libc::MAP_ANON;

    /// Maps a new region that can hold at least `len` bytes
    ///
    /// Page permissions depend on how `runtime` toggles write access:
    /// per-thread backends get `RWX` pages (tagged with the protection key,
    /// if any), per-region protection starts out `RX`.
    pub fn new(len: usize, runtime: &Runtime) -> Result<Self, std::io::Error> {
        let len = len.max(1).next_multiple_of(Self::PAGE_SIZE);
        let per_region = runtime.mode() == Mode::PerRegion;
        let prot = if per_region {
            Self::PROT_RX
        } else {
            Self::PROT_RWX
        };

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                Self::MMAP_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }

        let out = Self {
            ptr,
            len,
            writers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            per_region,
        };
        if let Backend::ProtectionKey(key) = *runtime.backend() {
            out.tag(key.get())?;
        }
        log::debug!(
            "mapped {len} bytes of code memory at {ptr:p} (per-region: {})",
            per_region
        );
        Ok(out)
    }

    /// Assigns the protection key to every page of the region
    #[cfg(target_os = "linux")]
    fn tag(&self, key: i32) -> Result<(), std::io::Error> {
        let r = unsafe {
            libc::syscall(
                libc::SYS_pkey_mprotect,
                self.ptr,
                self.len,
                Self::PROT_RWX,
                key,
            )
        };
        if r == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn tag(&self, _key: i32) -> Result<(), std::io::Error> {
        unreachable!("protection keys are only used on Linux")
    }

    /// Returns the size of the mapping
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of writers currently registered
    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    /// Copies `code` into the region at `offset`, then flushes caches
    ///
    /// # Panics
    /// If `code` doesn't fit, or (in debug builds) if `scope` is not the
    /// innermost open scope
    pub fn patch(
        &self,
        offset: usize,
        code: &[u8],
        _scope: &CodeSpaceWriteScope,
    ) {
        debug_assert!(CodeSpaceWriteScope::is_open());
        assert!(offset + code.len() <= self.len);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            std::ptr::copy_nonoverlapping(
                code.as_ptr(),
                (self.ptr as *mut u8).add(offset),
                code.len(),
            );
        }
        self.flush_cache(offset, code.len());
    }

    /// Calls the function at the start of the region
    ///
    /// # Safety
    /// The region must begin with a valid `extern "C" fn() -> u32`, and must
    /// not be writable-only (i.e. no per-region writer may be open)
    pub unsafe fn call(&self) -> u32 {
        let f: extern "C" fn() -> u32 =
            unsafe { std::mem::transmute(self.ptr) };
        f()
    }

    fn protect(&self, prot: i32) {
        let r = unsafe { libc::mprotect(self.ptr, self.len, prot) };
        if r != 0 {
            panic!("mprotect failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(target_os = "macos")]
    fn flush_cache(&self, offset: usize, size: usize) {
        unsafe {
            macos::sys_icache_invalidate(
                (self.ptr as *const u8).add(offset) as *const libc::c_void,
                size,
            );
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    fn flush_cache(&self, offset: usize, size: usize) {
        use std::arch::asm;
        let cache_type: usize;
        unsafe {
            asm!("mrs {tmp}, ctr_el0", tmp = out(reg) cache_type);
        }
        let icache_line = (cache_type & 0xF) << 4;
        let dcache_line = ((cache_type >> 16) & 0xF) << 4;

        let start = self.ptr as usize + offset;
        let end = start + size;
        let mut addr = start & !(dcache_line - 1);
        while addr < end {
            unsafe { asm!("dc cvau, {a}", a = in(reg) addr) };
            addr += dcache_line;
        }
        unsafe { asm!("dsb ish") };
        let mut addr = start & !(icache_line - 1);
        while addr < end {
            unsafe { asm!("ic ivau, {a}", a = in(reg) addr) };
            addr += icache_line;
        }
        unsafe { asm!("dsb ish", "isb") };
    }

    #[cfg(all(target_os = "linux", not(target_arch = "aarch64")))]
    fn flush_cache(&self, _offset: usize, _size: usize) {
        // Coherent I/D caches on x86_64
    }
}

impl CodeRegion for CodeSpace {
    fn add_writer(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.writers.fetch_add(1, Ordering::AcqRel) == 0 && self.per_region
        {
            self.protect(Self::PROT_RW);
        }
    }

    fn remove_writer(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let prev = self.writers.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "writer count underflow");
        if prev == 1 && self.per_region {
            self.protect(Self::PROT_RX);
        }
    }
}

impl Drop for CodeSpace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len as libc::size_t);
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    #[link(name = "c")]
    unsafe extern "C" {
        pub fn sys_icache_invalidate(
            start: *const libc::c_void,
            size: libc::size_t,
        );
    }
}
