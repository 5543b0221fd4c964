//! Guard for spawning threads while a write scope is open
use crate::Runtime;

/// Resets the current thread's PKU rights to "not writable" while alive
///
/// Calling a function that may spawn threads while holding a
/// [`RwxMemoryWriteScope`](crate::RwxMemoryWriteScope) is risky: a new
/// thread inherits its parent's PKRU, and would start out with write access
/// to code pages.  Holding this guard across the spawn makes sure it starts
/// in the default, non-writable state instead.
///
/// This does not change the nesting level of the current thread.  It is a
/// no-op unless the backend uses protection keys, which are the only
/// per-thread state inherited on spawn.
#[must_use]
pub struct ResetPkuPermissionsForThreadSpawning {
    runtime: &'static Runtime,

    /// Whether the thread was writable (and so needs to be restored)
    was_writable: bool,

    /// Marker to make the type `!Send`
    _marker: std::marker::PhantomData<*const ()>,
}
static_assertions::assert_not_impl_any!(
    ResetPkuPermissionsForThreadSpawning: Send,
    Sync
);

impl ResetPkuPermissionsForThreadSpawning {
    /// Builds a guard using the process-wide [`Runtime`]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::new_in(Runtime::global())
    }

    /// Builds a guard using the given [`Runtime`]
    pub(crate) fn new_in(runtime: &'static Runtime) -> Self {
        let backend = runtime.backend();
        let was_writable = backend.is_inherited() && backend.is_writable();
        if was_writable {
            log::debug!("revoking write access before spawning threads");
            backend.set_executable();
        }
        Self {
            runtime,
            was_writable,
            _marker: std::marker::PhantomData,
        }
    }
}

impl Drop for ResetPkuPermissionsForThreadSpawning {
    fn drop(&mut self) {
        if self.was_writable {
            self.runtime.backend().set_writable();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Backend, Config, RwxMemoryWriteScope, backend::recording};

    fn runtime(backend: Backend) -> &'static Runtime {
        Box::leak(Box::new(Runtime::with_backend(Config::default(), backend)))
    }

    #[test]
    fn not_writable_is_untouched() {
        let rt = runtime(Backend::Recording);
        {
            let _guard = ResetPkuPermissionsForThreadSpawning::new_in(rt);
            assert!(!recording::get().writable);
        }
        assert_eq!(recording::get(), recording::Record::default());
    }

    #[test]
    fn writable_is_restored() {
        let rt = runtime(Backend::Recording);
        let _scope = RwxMemoryWriteScope::new_in(rt, "holding a scope");
        assert!(recording::get().writable);
        {
            let _guard = ResetPkuPermissionsForThreadSpawning::new_in(rt);
            assert!(!recording::get().writable);
            assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);

            std::thread::scope(|s| {
                s.spawn(|| {
                    assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
                });
            });
        }
        let r = recording::get();
        assert!(r.writable);
        assert_eq!(r.writable_calls, 2);
        assert_eq!(r.executable_calls, 1);
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
    }

    #[test]
    fn unsupported_is_noop() {
        let rt = runtime(Backend::Unsupported);
        let _scope = RwxMemoryWriteScope::new_in(rt, "holding a scope");
        let guard = ResetPkuPermissionsForThreadSpawning::new_in(rt);
        assert!(!guard.was_writable);
    }

    #[test]
    fn protection_key() {
        let Ok(backend) = Backend::select(crate::BackendKind::ProtectionKey)
        else {
            return;
        };
        let rt = runtime(backend);
        let _scope = RwxMemoryWriteScope::new_in(rt, "holding a scope");
        assert!(backend.is_writable());
        {
            let _guard = ResetPkuPermissionsForThreadSpawning::new_in(rt);
            assert!(!backend.is_writable());
            std::thread::scope(|s| {
                s.spawn(|| assert!(!backend.is_writable()));
            });
        }
        assert!(backend.is_writable());
    }
}
