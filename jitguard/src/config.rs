//! Runtime configuration and the process-wide [`Runtime`]
use crate::{
    Error,
    backend::{Backend, BackendKind},
};
use std::sync::OnceLock;

/// Settings used to build a [`Runtime`]
///
/// ```
/// use jitguard::{BackendKind, Config};
///
/// let config = Config {
///     backend: Some(BackendKind::Unsupported),
///     write_protect_code_memory: true,
///     ..Default::default()
/// };
/// # let _ = config;
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Backend to use, or `None` to pick the best available one
    pub backend: Option<BackendKind>,

    /// Allow auto-detection to pick Intel PKU protection keys
    pub memory_protection_keys: bool,

    /// Write-protect code regions individually (through their writer
    /// refcount) when no fast backend is available
    pub write_protect_code_memory: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: None,
            memory_protection_keys: true,
            write_protect_code_memory: false,
        }
    }
}

/// How region-scoped write scopes toggle permissions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// One thread-wide toggle, shared by all regions
    ///
    /// Region identity is only used to detect reentry.
    Global,

    /// Each region's writer refcount gates that region's pages
    PerRegion,
}

/// Backend and mode, chosen once
///
/// There is a single process-wide runtime (see [`init`] and
/// [`Runtime::global`]), and every public scope uses it.  Scopes share
/// per-thread state, so they must all agree on the backend and mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Runtime {
    backend: Backend,
    mode: Mode,
    config: Config,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Installs the process-wide [`Runtime`]
///
/// This must be called before the first scope is opened; afterwards, the
/// global runtime has already been built from [`Config::default`].  Calling
/// it again with the same configuration is harmless.
pub fn init(config: Config) -> Result<&'static Runtime, Error> {
    let rt = RUNTIME.get_or_init(|| Runtime::new(config));
    if rt.config == config {
        Ok(rt)
    } else {
        Err(Error::AlreadyInitialized)
    }
}

impl Runtime {
    /// Builds a new runtime, falling back to [`Backend::Unsupported`] if the
    /// requested backend is unavailable
    pub(crate) fn new(config: Config) -> Self {
        match Self::try_new(config) {
            Ok(rt) => rt,
            Err(e) => {
                log::warn!("{e}; falling back to no-op backend");
                Self::with_backend(config, Backend::Unsupported)
            }
        }
    }

    /// Builds a new runtime, returning an error if the requested backend is
    /// unavailable
    pub(crate) fn try_new(config: Config) -> Result<Self, Error> {
        let backend = match config.backend {
            Some(kind) => Backend::select(kind)?,
            None => Backend::detect(config.memory_protection_keys),
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Builds a runtime around an already-selected backend
    pub(crate) fn with_backend(config: Config, backend: Backend) -> Self {
        let degraded = !backend.is_supported();
        let mode = if degraded && config.write_protect_code_memory {
            Mode::PerRegion
        } else {
            Mode::Global
        };
        log::debug!("W^X runtime: backend {backend:?}, mode {mode:?}");
        Self {
            backend,
            mode,
            config,
        }
    }

    /// Returns the process-wide runtime, building it on first use
    pub fn global() -> &'static Runtime {
        RUNTIME.get_or_init(|| Runtime::new(Config::default()))
    }

    /// Returns the selected backend
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Returns the region-switching mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the configuration used to build this runtime
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns true if write scopes must switch per code region
    ///
    /// This is the case when no fast backend is available and
    /// [`Config::write_protect_code_memory`] is set.
    pub fn switches_per_region(&self) -> bool {
        self.mode == Mode::PerRegion
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_region_requires_flag() {
        let rt = Runtime::with_backend(Config::default(), Backend::Unsupported);
        assert_eq!(rt.mode(), Mode::Global);
        assert!(!rt.switches_per_region());

        let config = Config {
            write_protect_code_memory: true,
            ..Default::default()
        };
        let rt = Runtime::with_backend(config, Backend::Unsupported);
        assert_eq!(rt.mode(), Mode::PerRegion);
        assert!(rt.switches_per_region());
    }

    #[test]
    fn fast_backend_is_global() {
        let config = Config {
            write_protect_code_memory: true,
            ..Default::default()
        };
        let rt = Runtime::with_backend(config, Backend::Recording);
        assert_eq!(rt.mode(), Mode::Global);
        if let Ok(b) = Backend::select(BackendKind::ProtectionKey) {
            let rt = Runtime::with_backend(config, b);
            assert_eq!(rt.mode(), Mode::Global);
        }
    }

    #[test]
    fn explicit_unsupported() {
        let config = Config {
            backend: Some(BackendKind::Unsupported),
            ..Default::default()
        };
        let rt = Runtime::try_new(config).unwrap();
        assert_eq!(*rt.backend(), Backend::Unsupported);
        assert_eq!(rt.config(), &config);
    }

    #[test]
    fn lenient_fallback() {
        if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            return;
        }
        let config = Config {
            backend: Some(BackendKind::ThreadJit),
            write_protect_code_memory: true,
            ..Default::default()
        };
        assert!(Runtime::try_new(config).is_err());
        let rt = Runtime::new(config);
        assert_eq!(*rt.backend(), Backend::Unsupported);
        assert_eq!(rt.mode(), Mode::PerRegion);
    }
}
