//! `jitguard` keeps JIT code pages non-writable whenever they are executable
//! (`W^X`), while making it cheap to open a window for patching them.
//!
//! Toggling page protection with `mprotect` on every patch is slow, so this
//! crate leans on hardware switches that only affect the calling thread:
//!
//! - Apple's `MAP_JIT` write protection (`pthread_jit_write_protect_np`) on
//!   macOS on ARM64
//! - Intel PKU protection keys (the PKRU register) on Linux x86_64
//!
//! These switches are wrapped in RAII scopes.  Scopes nest: only the first
//! scope opened on a thread and the last one closed actually touch the
//! hardware, so call sites can open them freely without coordinating.
//!
//! # Scopes
//! [`RwxMemoryWriteScope`] is the thread-wide scope:
//! ```
//! use jitguard::RwxMemoryWriteScope;
//!
//! let _scope = RwxMemoryWriteScope::new("patching a call target");
//! // code pages are writable by this thread until `_scope` is dropped
//! ```
//!
//! [`CodeSpaceWriteScope`] is tied to a [`CodeRegion`].  With a fast backend
//! it simply defers to the thread-wide scope; without one, it can fall back
//! to per-region write protection through the region's writer refcount (see
//! [`Config::write_protect_code_memory`]).
//!
//! [`ResetPkuPermissionsForThreadSpawning`] temporarily drops write access
//! so that threads spawned while a scope is open don't inherit it.
//!
//! # Configuration
//! The backend is chosen once per process, and every scope uses it.  Call
//! [`init`] before opening any scope to pick something other than
//! [`Config::default`]:
//! ```
//! use jitguard::{BackendKind, Config};
//!
//! let rt = jitguard::init(Config {
//!     backend: Some(BackendKind::Unsupported),
//!     write_protect_code_memory: true,
//!     ..Default::default()
//! })?;
//! assert!(rt.switches_per_region());
//! # Ok::<(), jitguard::Error>(())
//! ```
//!
//! All mutable state is thread-local, so none of this takes a lock.
#![warn(missing_docs)]

pub mod backend;
mod config;
mod error;
mod pkey;
mod region;
mod scope;
mod spawn;

pub use backend::{Backend, BackendKind};
pub use pkey::MemoryProtectionKey;
pub use config::{Config, Mode, Runtime, init};
pub use error::Error;
pub use region::{CodeRegion, CodeSpaceWriteScope, RegionKey};
pub use scope::{
    NopRwxMemoryWriteScope, RwxMemoryWriteScope, RwxMemoryWriteScopeForTesting,
};
pub use spawn::ResetPkuPermissionsForThreadSpawning;
