//! PKRU (Protection Keys for Userspace) support
//!
//! Intel PKU tags pages with a 4-bit protection key; each thread then has a
//! PKRU register holding two bits per key (access-disable and write-disable).
//! Flipping those bits is a single unprivileged instruction, which makes it a
//! cheap way to toggle write access to JIT code pages for one thread at a
//! time.  Execute permission cannot be taken away with PKU, so this only
//! gives write protection.
//!
//! PKRU is inherited by threads spawned from the current thread.
//!
//! This module is only active on Linux x86_64.  On other platforms the key
//! can never be allocated and the register accessors are no-ops.

use crate::Error;
use std::sync::OnceLock;

/// Access rights for a single protection key, as encoded in PKRU
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    /// Reads and writes are allowed
    NoRestrictions = 0,
    /// Neither reads nor writes are allowed
    DisableAccess = 1,
    /// Reads are allowed, writes are not
    DisableWrite = 2,
}

impl Permission {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Permission::NoRestrictions,
            2 => Permission::DisableWrite,
            // Access-disable implies write-disable, whatever the WD bit says
            _ => Permission::DisableAccess,
        }
    }
}

/// Handle to the process-wide protection key
///
/// Only the one-time allocation can build one of these, so holding a
/// `MemoryProtectionKey` proves that the key was initialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryProtectionKey(i32);

impl MemoryProtectionKey {
    /// Returns the key number, as passed to `pkey_mprotect`
    pub fn get(self) -> i32 {
        self.0
    }
}

/// The process-wide key, or the `errno` from allocating it
///
/// `Err(None)` means that protection keys don't exist on this platform.
/// Written once, by whichever thread first asks for a protection-key
/// backend.
static MEMORY_PROTECTION_KEY: OnceLock<
    Result<MemoryProtectionKey, Option<i32>>,
> = OnceLock::new();

/// Allocates the process-wide protection key, if that hasn't happened yet
///
/// The key starts out write-disabled for the calling thread.  Failure is
/// sticky: a CPU or kernel without PKU will fail on every call.
pub(crate) fn initialize() -> Result<MemoryProtectionKey, Error> {
    MEMORY_PROTECTION_KEY
        .get_or_init(|| {
            let r = allocate().map(MemoryProtectionKey);
            match r {
                Ok(key) => {
                    log::debug!("allocated memory protection key {}", key.0)
                }
                Err(e) => log::debug!(
                    "memory protection keys are unavailable: {}",
                    unavailable(e)
                ),
            }
            r
        })
        .map_err(|e| Error::ProtectionKeyUnavailable(unavailable(e)))
}

/// Builds the error reported when no key could be allocated
fn unavailable(errno: Option<i32>) -> std::io::Error {
    match errno {
        Some(e) => std::io::Error::from_raw_os_error(e),
        None => std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "protection keys are only available on Linux x86_64",
        ),
    }
}

/// Returns true if [`initialize`] has run (successfully or not)
pub(crate) fn is_initialized() -> bool {
    MEMORY_PROTECTION_KEY.get().is_some()
}

/// Returns the process-wide key, if it was allocated
pub(crate) fn key() -> Option<MemoryProtectionKey> {
    MEMORY_PROTECTION_KEY.get().and_then(|r| r.ok())
}

/// Sets the calling thread's rights for the given key
pub(crate) fn set_permission(key: MemoryProtectionKey, perm: Permission) {
    let shift = 2 * key.0 as u32;
    let mut pkru = read_pkru();
    pkru &= !(0b11 << shift);
    pkru |= (perm as u32) << shift;
    write_pkru(pkru);
}

/// Reads the calling thread's rights for the given key
pub(crate) fn permission(key: MemoryProtectionKey) -> Permission {
    Permission::from_bits(read_pkru() >> (2 * key.0 as u32))
}

/// Asks the kernel for a fresh key, returning `errno` on failure
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn allocate() -> Result<i32, Option<i32>> {
    let key = unsafe {
        libc::syscall(
            libc::SYS_pkey_alloc,
            0,
            Permission::DisableWrite as libc::c_uint,
        )
    };
    if key >= 0 {
        debug_assert!(key < 16, "kernel returned protection key {key}");
        Ok(key as i32)
    } else {
        Err(std::io::Error::last_os_error().raw_os_error())
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn allocate() -> Result<i32, Option<i32>> {
    Err(None)
}

/// Read the current PKRU register value.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn read_pkru() -> u32 {
    let pkru: u32;
    unsafe {
        std::arch::asm!(
            "xor ecx, ecx",
            "rdpkru",
            out("eax") pkru,
            out("ecx") _,
            out("edx") _,
            options(nomem, nostack),
        );
    }
    pkru
}

/// Write a value to the PKRU register.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn write_pkru(pkru: u32) {
    unsafe {
        std::arch::asm!(
            "xor ecx, ecx",
            "xor edx, edx",
            "wrpkru",
            in("eax") pkru,
            out("ecx") _,
            out("edx") _,
            options(nostack),
        );
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn read_pkru() -> u32 {
    0
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn write_pkru(_pkru: u32) {
    // Nothing to do here
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permission_bits() {
        assert_eq!(Permission::from_bits(0b00), Permission::NoRestrictions);
        assert_eq!(Permission::from_bits(0b10), Permission::DisableWrite);
        assert_eq!(Permission::from_bits(0b01), Permission::DisableAccess);
        assert_eq!(Permission::from_bits(0b11), Permission::DisableAccess);
        assert_eq!(Permission::from_bits(0b1110), Permission::DisableWrite);
    }

    #[test]
    fn key_round_trip() {
        // Only exercises the register on machines that actually have PKU
        let Ok(key) = initialize() else {
            assert!(super::key().is_none());
            return;
        };
        assert!(is_initialized());
        assert_eq!(super::key(), Some(key));
        assert!((1..16).contains(&key.get()));

        let prev = permission(key);
        set_permission(key, Permission::NoRestrictions);
        assert_eq!(permission(key), Permission::NoRestrictions);
        set_permission(key, Permission::DisableWrite);
        assert_eq!(permission(key), Permission::DisableWrite);
        set_permission(key, prev);
    }

    #[test]
    fn unavailable_errors() {
        // ENOSPC: all keys are taken
        let e = unavailable(Some(28));
        assert_eq!(e.raw_os_error(), Some(28));

        let e = unavailable(None);
        assert_eq!(e.kind(), std::io::ErrorKind::Unsupported);
        assert!(e.raw_os_error().is_none());
    }

    #[test]
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn unsupported_platform() {
        let Err(Error::ProtectionKeyUnavailable(e)) = initialize() else {
            panic!("protection keys should be unavailable");
        };
        assert_eq!(e.kind(), std::io::ErrorKind::Unsupported);
    }
}
