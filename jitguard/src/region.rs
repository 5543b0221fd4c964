//! Write scopes tied to a specific code region
//!
//! A [`CodeSpaceWriteScope`] is what JIT call sites open around a patch.  It
//! remembers which region is being written on this thread, so that reopening
//! the same region is free, and it decides how write access is granted:
//!
//! - With a fast backend (or with per-region protection turned off), every
//!   region shares the thread-wide [`RwxMemoryWriteScope`] toggle.
//! - Without a fast backend and with
//!   [`Config::write_protect_code_memory`](crate::Config) set, each region's
//!   own writer refcount decides whether its pages are writable, so regions
//!   are protected independently of each other.
//!
//! Call sites don't need to know which of the two is active.
use crate::{Mode, Runtime, RwxMemoryWriteScope};
use std::cell::Cell;

/// A unit of JIT code memory with its own writer refcount
///
/// Only used when write scopes switch per region.  Writers may live on
/// several threads at once, so implementations must update the refcount
/// atomically.
///
/// Regions are told apart by address (see [`RegionKey::of`]), so a region
/// must not be nested at offset zero of another region.
pub trait CodeRegion: Sync {
    /// Registers a writer, making the region writable if it is the first one
    fn add_writer(&self);

    /// Unregisters a writer, making the region executable if it was the last
    fn remove_writer(&self);
}

/// Identity of the region being written on the current thread
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionKey {
    /// A scope is open, but its caller did not name a region
    Anonymous,
    /// A scope is open for the region at this address
    Region(usize),
}

impl RegionKey {
    /// Builds the key for the given region
    ///
    /// Regions are identified by the address of their data, not by type.
    /// Two regions that share an address get the same key: distinct
    /// zero-sized regions, or a region stored as the first field of another
    /// region (such as a `#[repr(C)]` struct whose first field is itself a
    /// [`CodeRegion`]).  Opening a scope on one of them while the other is
    /// current counts as reentry, and does not register a second writer.
    pub fn of(region: Option<&dyn CodeRegion>) -> Self {
        match region {
            Some(r) => {
                RegionKey::Region(std::ptr::from_ref(r).cast::<()>().addr())
            }
            None => RegionKey::Anonymous,
        }
    }
}

thread_local! {
    /// Region of the innermost open [`CodeSpaceWriteScope`], if any
    static CURRENT_REGION: Cell<Option<RegionKey>> =
        const { Cell::new(None) };

    /// Address of the [`Runtime`] used by the outermost open scope
    static OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Holding a `CodeSpaceWriteScope` allows writes to a code region
///
/// ```
/// use jitguard::{CodeRegion, CodeSpaceWriteScope};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// struct Region(AtomicUsize);
/// impl CodeRegion for Region {
///     fn add_writer(&self) {
///         self.0.fetch_add(1, Ordering::AcqRel);
///     }
///     fn remove_writer(&self) {
///         self.0.fetch_sub(1, Ordering::AcqRel);
///     }
/// }
///
/// let region = Region(AtomicUsize::new(0));
/// assert!(!CodeSpaceWriteScope::is_open());
/// {
///     let _scope = CodeSpaceWriteScope::for_region(&region);
///     assert!(CodeSpaceWriteScope::is_open());
///     // ...patch code here...
/// }
/// assert!(!CodeSpaceWriteScope::is_open());
/// ```
#[must_use = "code pages are only writable while the scope is held"]
pub struct CodeSpaceWriteScope<'a> {
    runtime: &'static Runtime,

    /// Region passed to the constructor, if any
    region: Option<&'a dyn CodeRegion>,

    /// Identity of `region`
    key: RegionKey,

    /// Value of the thread's current region when this scope was opened
    previous: Option<RegionKey>,

    /// Marker to make the type `!Send`
    _marker: std::marker::PhantomData<*const ()>,
}
static_assertions::assert_not_impl_any!(
    CodeSpaceWriteScope<'static>: Send,
    Sync
);

impl<'a> CodeSpaceWriteScope<'a> {
    /// Opens a scope on the process-wide [`Runtime`]
    ///
    /// Passing `None` is allowed only when write scopes do not switch per
    /// region.
    #[inline]
    pub fn new(region: Option<&'a dyn CodeRegion>) -> Self {
        Self::new_in(Runtime::global(), region)
    }

    /// Opens a scope for the given region
    #[inline]
    pub fn for_region<R: CodeRegion>(region: &'a R) -> Self {
        Self::new(Some(region))
    }

    /// Opens a scope without naming a region
    #[inline]
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Opens a scope on the given [`Runtime`]
    pub(crate) fn new_in(
        runtime: &'static Runtime,
        region: Option<&'a dyn CodeRegion>,
    ) -> Self {
        debug_assert!(
            region.is_some() || !runtime.switches_per_region(),
            "a code region is required when switching per region"
        );
        let key = RegionKey::of(region);
        let previous = CURRENT_REGION.get();
        let addr = std::ptr::from_ref(runtime).addr();
        if previous.is_none() {
            OWNER.set(addr);
        } else {
            debug_assert_eq!(
                OWNER.get(),
                addr,
                "code space write scope opened on a different runtime than \
                 the enclosing one"
            );
        }
        let out = Self {
            runtime,
            region,
            key,
            previous,
            _marker: std::marker::PhantomData,
        };
        if previous == Some(key) {
            return out;
        }
        CURRENT_REGION.set(Some(key));
        if previous.is_none() || runtime.switches_per_region() {
            out.set_writable();
        }
        out
    }

    /// Returns true if a `CodeSpaceWriteScope` is open on this thread
    pub fn is_open() -> bool {
        CURRENT_REGION.get().is_some()
    }

    /// Returns true if the process-wide runtime switches per region
    pub fn switches_per_region() -> bool {
        Runtime::global().switches_per_region()
    }

    fn set_writable(&self) {
        match self.runtime.mode() {
            Mode::Global => RwxMemoryWriteScope::set_writable(self.runtime),
            Mode::PerRegion => {
                if let Some(r) = self.region {
                    r.add_writer()
                }
            }
        }
    }

    fn set_executable(&self) {
        match self.runtime.mode() {
            Mode::Global => RwxMemoryWriteScope::set_executable(self.runtime),
            Mode::PerRegion => {
                if let Some(r) = self.region {
                    r.remove_writer()
                }
            }
        }
    }
}

impl Drop for CodeSpaceWriteScope<'_> {
    fn drop(&mut self) {
        let current = CURRENT_REGION.get();
        if self.previous == Some(self.key) {
            debug_assert_eq!(
                current, self.previous,
                "code space write scopes closed out of order"
            );
            return;
        }
        debug_assert_eq!(
            current,
            Some(self.key),
            "code space write scopes closed out of order"
        );
        if self.previous.is_none() || self.runtime.switches_per_region() {
            self.set_executable();
        }
        if self.previous.is_none() {
            OWNER.set(0);
        }
        CURRENT_REGION.set(self.previous);
    }
}
