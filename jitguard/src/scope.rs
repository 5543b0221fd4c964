//! Reentrant, thread-local write scopes for executable pages
use crate::{Runtime, pkey};
use std::cell::Cell;

thread_local! {
    /// Number of open [`RwxMemoryWriteScope`]s on this thread
    static NESTING_LEVEL: Cell<usize> = const { Cell::new(0) };

    /// Address of the [`Runtime`] used by the outermost open scope
    static OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Holding a `RwxMemoryWriteScope` allows writes to executable pages
///
/// On macOS on ARM64, the scope switches every `MAP_JIT` page between
/// writable and executable for the **current thread only**.  With Intel PKU,
/// it switches the protection key between writable and not writable; pages
/// remain executable the whole time.  On other platforms the scope is a
/// no-op, and it is still fine to use.
///
/// Scopes are reentrant: only the outermost scope on a thread touches the
/// hardware, once on construction and once on drop.
///
/// ```
/// use jitguard::RwxMemoryWriteScope;
///
/// {
///     let _outer = RwxMemoryWriteScope::new("emitting a trampoline");
///     {
///         let _inner = RwxMemoryWriteScope::new("patching a call target");
///         assert_eq!(RwxMemoryWriteScope::nesting_level(), 2);
///     }
///     assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
/// }
/// assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
/// ```
#[must_use = "code pages are only writable while the scope is held"]
pub struct RwxMemoryWriteScope {
    runtime: &'static Runtime,

    /// Marker to make the type `!Send`
    _marker: std::marker::PhantomData<*const ()>,
}
static_assertions::assert_not_impl_any!(RwxMemoryWriteScope: Send, Sync);

impl RwxMemoryWriteScope {
    /// Opens a scope on the process-wide [`Runtime`]
    ///
    /// `reason` explains why write access is needed at this call site; it is
    /// only used for logging.
    #[inline]
    pub fn new(reason: &'static str) -> Self {
        Self::new_in(Runtime::global(), reason)
    }

    /// Opens a scope on the given [`Runtime`]
    #[inline]
    pub(crate) fn new_in(
        runtime: &'static Runtime,
        reason: &'static str,
    ) -> Self {
        log::trace!("entering write scope: {reason}");
        Self::set_writable(runtime);
        Self {
            runtime,
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns true if the current configuration supports fast
    /// write-protection of executable pages
    #[inline]
    pub fn is_supported() -> bool {
        Runtime::global().backend().is_supported()
    }

    /// Returns the number of scopes open on the current thread
    pub fn nesting_level() -> usize {
        NESTING_LEVEL.get()
    }

    /// Returns the process-wide memory protection key, if one was allocated
    ///
    /// # Panics
    /// In debug builds, if no protection-key backend has been requested yet
    pub fn memory_protection_key() -> Option<i32> {
        debug_assert!(
            pkey::is_initialized(),
            "memory protection key read before initialization"
        );
        pkey::key().map(pkey::MemoryProtectionKey::get)
    }

    /// Returns true if the current thread may write to pages tagged with the
    /// process-wide protection key
    pub fn is_pku_writable() -> bool {
        match *Runtime::global().backend() {
            b @ crate::Backend::ProtectionKey(..) => b.is_writable(),
            _ => false,
        }
    }

    /// Implicitly enters the scope
    ///
    /// This is exposed for other scope types that affect executable page
    /// permissions; every call must be balanced by [`Self::set_executable`].
    #[inline]
    pub(crate) fn set_writable(runtime: &Runtime) {
        let n = NESTING_LEVEL.get();
        let addr = std::ptr::from_ref(runtime).addr();
        if n == 0 {
            OWNER.set(addr);
            runtime.backend().set_writable();
        } else {
            debug_assert_eq!(
                OWNER.get(),
                addr,
                "write scope opened on a different runtime than the \
                 enclosing one"
            );
        }
        NESTING_LEVEL.set(n + 1);
    }

    /// Implicitly exits the scope
    ///
    /// # Panics
    /// If no scope is open on this thread
    #[inline]
    pub(crate) fn set_executable(runtime: &Runtime) {
        let n = NESTING_LEVEL.get();
        assert!(n > 0, "write scope closed more times than it was opened");
        if n == 1 {
            runtime.backend().set_executable();
            OWNER.set(0);
        }
        NESTING_LEVEL.set(n - 1);
    }
}

impl Drop for RwxMemoryWriteScope {
    #[inline]
    fn drop(&mut self) {
        Self::set_executable(self.runtime);
    }
}

/// Scope with the same shape as [`RwxMemoryWriteScope`] but no effect
///
/// This is used where a write scope type is required but no permission
/// switch should happen.
#[must_use]
pub struct NopRwxMemoryWriteScope {
    _marker: std::marker::PhantomData<*const ()>,
}

impl NopRwxMemoryWriteScope {
    /// Builds a scope that does nothing
    #[inline]
    pub fn new(_reason: &'static str) -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

/// Same as [`RwxMemoryWriteScope`], but never inlined
///
/// Useful from tests and from other crates that can't see the scope's
/// thread-local state directly.
#[must_use]
pub struct RwxMemoryWriteScopeForTesting(RwxMemoryWriteScope);

impl RwxMemoryWriteScopeForTesting {
    /// Opens a scope on the process-wide [`Runtime`]
    #[inline(never)]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(RwxMemoryWriteScope::new("for testing"))
    }

    /// Opens a scope on the given [`Runtime`]
    #[inline(never)]
    pub(crate) fn new_in(runtime: &'static Runtime) -> Self {
        Self(RwxMemoryWriteScope::new_in(runtime, "for testing"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Backend, Config, backend::recording};

    fn recording() -> &'static Runtime {
        Box::leak(Box::new(Runtime::with_backend(
            Config::default(),
            Backend::Recording,
        )))
    }

    #[test]
    fn nested_scopes() {
        let rt = recording();
        let a = RwxMemoryWriteScope::new_in(rt, "outer");
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
        assert_eq!(recording::get().writable_calls, 1);
        assert!(recording::get().writable);

        let b = RwxMemoryWriteScope::new_in(rt, "inner");
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 2);
        assert_eq!(recording::get().writable_calls, 1);

        drop(b);
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
        assert_eq!(recording::get().executable_calls, 0);
        assert!(recording::get().writable);

        drop(a);
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
        let r = recording::get();
        assert_eq!(r.writable_calls, 1);
        assert_eq!(r.executable_calls, 1);
        assert!(!r.writable);
    }

    #[test]
    fn one_switch_per_run() {
        let rt = recording();
        for depth in 1..5 {
            let before = recording::get();
            {
                let _scopes: Vec<_> = (0..depth)
                    .map(|_| RwxMemoryWriteScope::new_in(rt, "run"))
                    .collect();
                assert_eq!(RwxMemoryWriteScope::nesting_level(), depth);
            }
            let after = recording::get();
            assert_eq!(after.writable_calls - before.writable_calls, 1);
            assert_eq!(after.executable_calls - before.executable_calls, 1);
        }
    }

    #[test]
    fn closed_on_unwind() {
        let rt = recording();
        let r = std::panic::catch_unwind(|| {
            let _scope = RwxMemoryWriteScope::new_in(rt, "about to panic");
            panic!("oh no");
        });
        assert!(r.is_err());
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
        assert!(!recording::get().writable);
    }

    #[test]
    fn threads_are_independent() {
        let rt = recording();
        let _scope = RwxMemoryWriteScope::new_in(rt, "main thread");
        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
                assert_eq!(recording::get(), recording::Record::default());
                let _scope = RwxMemoryWriteScope::new_in(rt, "worker");
                assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
                assert_eq!(recording::get().writable_calls, 1);
            });
        });
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
        assert_eq!(recording::get().writable_calls, 1);
    }

    #[test]
    #[should_panic(expected = "closed more times")]
    fn unbalanced_exit() {
        RwxMemoryWriteScope::set_executable(recording());
    }

    #[test]
    fn protection_key_accessor() {
        let r = pkey::initialize().map(pkey::MemoryProtectionKey::get);
        assert_eq!(RwxMemoryWriteScope::memory_protection_key(), r.ok());
    }

    #[test]
    fn nop_and_testing_scopes() {
        let rt = recording();
        {
            let _nop = NopRwxMemoryWriteScope::new("nothing to see here");
            assert_eq!(RwxMemoryWriteScope::nesting_level(), 0);
        }
        {
            let _scope = RwxMemoryWriteScopeForTesting::new_in(rt);
            assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
        }
        assert_eq!(recording::get().executable_calls, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "different runtime")]
    fn mixed_runtimes() {
        let _outer = RwxMemoryWriteScope::new_in(
            Box::leak(Box::new(Runtime::with_backend(
                Config::default(),
                Backend::Unsupported,
            ))),
            "outer",
        );
        let _inner = RwxMemoryWriteScope::new_in(recording(), "inner");
    }

    #[test]
    fn public_scopes_share_the_global_runtime() {
        let rt = Runtime::global();
        let _outer = RwxMemoryWriteScope::new("outer");
        assert_eq!(OWNER.get(), std::ptr::from_ref(rt).addr());
        {
            let _inner = RwxMemoryWriteScopeForTesting::new();
            assert_eq!(RwxMemoryWriteScope::nesting_level(), 2);
        }
        assert_eq!(RwxMemoryWriteScope::nesting_level(), 1);
    }
}
