//! Module containing the universal error type
use crate::backend::BackendKind;
use thiserror::Error;

/// Universal error type for `jitguard`
///
/// None of these are returned while opening or closing a scope; they only
/// come up while selecting a backend or installing the global runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// `pkey_alloc` failed; see inner code for details
    #[error("could not allocate a memory protection key: {0}")]
    ProtectionKeyUnavailable(#[source] std::io::Error),

    /// The requested backend is not available on this OS / CPU
    #[error("backend {0:?} is not available on this platform")]
    BackendUnavailable(BackendKind),

    /// The global runtime was already installed with a different `Config`
    #[error("the global runtime is already initialized")]
    AlreadyInitialized,
}
