//! Hardware backends for per-thread `W^X` switching
//!
//! A [`Backend`] answers one question ("can this thread cheaply flip its code
//! pages between writable and executable?") and provides the two flips.  It
//! is chosen once, when a [`Runtime`](crate::Runtime) is built, and never
//! changes afterwards.
//!
//! Two hardware mechanisms are supported:
//!
//! - On macOS on ARM64, pages mapped with `MAP_JIT` are switched between
//!   writable and executable for the current thread with
//!   `pthread_jit_write_protect_np`.  This is "real" `W^X`.
//! - On Linux x86_64 with Intel PKU, code pages are tagged with a protection
//!   key and the thread's PKRU register toggles write access.  The pages stay
//!   executable, so this only gives write protection.
//!
//! Everywhere else the backend is [`Backend::Unsupported`] and both flips
//! are no-ops.
use crate::{
    Error,
    pkey::{self, MemoryProtectionKey},
};

/// Backend flavor, without any per-backend payload
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Per-thread `MAP_JIT` write protection (macOS on ARM64)
    ThreadJit,
    /// Intel PKU protection keys (Linux on x86_64)
    ProtectionKey,
    /// No fast per-thread switching
    Unsupported,
}

/// Strategy used to change the current thread's code page permissions
///
/// Backends come from [`Backend::detect`] or [`Backend::select`]; the
/// permission flips themselves are only reachable through write scopes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// `pthread_jit_write_protect_np`
    ThreadJit,
    /// PKRU rights for the process-wide key
    ProtectionKey(MemoryProtectionKey),
    /// No-op
    Unsupported,
    /// Counts calls and tracks a fake per-thread register
    #[cfg(test)]
    Recording,
}

impl Backend {
    /// Picks the best available backend
    ///
    /// Protection keys are only considered if `memory_protection_keys` is
    /// set.  This never fails; the worst case is [`Backend::Unsupported`].
    pub fn detect(memory_protection_keys: bool) -> Self {
        let out = if thread_jit_supported() {
            Backend::ThreadJit
        } else if memory_protection_keys {
            match pkey::initialize() {
                Ok(key) => Backend::ProtectionKey(key),
                Err(_) => Backend::Unsupported,
            }
        } else {
            Backend::Unsupported
        };
        log::debug!("detected W^X backend: {out:?}");
        out
    }

    /// Builds the backend of the given kind, if it is available
    pub fn select(kind: BackendKind) -> Result<Self, Error> {
        match kind {
            BackendKind::ThreadJit => {
                if thread_jit_supported() {
                    Ok(Backend::ThreadJit)
                } else {
                    Err(Error::BackendUnavailable(kind))
                }
            }
            BackendKind::ProtectionKey => {
                pkey::initialize().map(Backend::ProtectionKey)
            }
            BackendKind::Unsupported => Ok(Backend::Unsupported),
        }
    }

    /// Returns the flavor of this backend
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::ThreadJit => BackendKind::ThreadJit,
            Backend::ProtectionKey(..) => BackendKind::ProtectionKey,
            Backend::Unsupported => BackendKind::Unsupported,
            #[cfg(test)]
            Backend::Recording => BackendKind::ThreadJit,
        }
    }

    /// Returns true if this backend does fast, thread-local switching
    pub fn is_supported(&self) -> bool {
        !matches!(self, Backend::Unsupported)
    }

    /// Makes code pages writable for the calling thread
    #[inline]
    pub(crate) fn set_writable(&self) {
        log::trace!("{:?}: code pages writable", self.kind());
        match *self {
            Backend::ThreadJit => thread_jit_write_protect(false),
            Backend::ProtectionKey(key) => {
                pkey::set_permission(key, pkey::Permission::NoRestrictions)
            }
            Backend::Unsupported => (),
            #[cfg(test)]
            Backend::Recording => recording::set(true),
        }
    }

    /// Makes code pages executable (and not writable) for the calling thread
    #[inline]
    pub(crate) fn set_executable(&self) {
        log::trace!("{:?}: code pages executable", self.kind());
        match *self {
            Backend::ThreadJit => thread_jit_write_protect(true),
            Backend::ProtectionKey(key) => {
                pkey::set_permission(key, pkey::Permission::DisableWrite)
            }
            Backend::Unsupported => (),
            #[cfg(test)]
            Backend::Recording => recording::set(false),
        }
    }

    /// Checks whether the calling thread's register grants write access
    ///
    /// Only protection keys can be queried; the other backends return
    /// `false`.
    pub fn is_writable(&self) -> bool {
        match *self {
            Backend::ProtectionKey(key) => {
                pkey::permission(key) == pkey::Permission::NoRestrictions
            }
            Backend::ThreadJit | Backend::Unsupported => false,
            #[cfg(test)]
            Backend::Recording => recording::get().writable,
        }
    }

    /// Returns true if spawned threads inherit this backend's register state
    pub(crate) fn is_inherited(&self) -> bool {
        match self {
            Backend::ProtectionKey(..) => true,
            Backend::ThreadJit | Backend::Unsupported => false,
            #[cfg(test)]
            Backend::Recording => true,
        }
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn thread_jit_supported() -> bool {
    unsafe { macos::pthread_jit_write_protect_supported_np() != 0 }
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
fn thread_jit_supported() -> bool {
    false
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn thread_jit_write_protect(enabled: bool) {
    unsafe {
        macos::pthread_jit_write_protect_np(enabled as libc::c_int);
    }
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
fn thread_jit_write_protect(_enabled: bool) {
    unreachable!("`ThreadJit` is only selected on macOS on ARM64")
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod macos {
    #[link(name = "pthread")]
    unsafe extern "C" {
        pub fn pthread_jit_write_protect_np(enabled: libc::c_int);
        pub fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    }
}
