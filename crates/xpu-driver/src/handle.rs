//! Native handle newtypes and owned kernel artifacts.
//!
//! Raw Level Zero handles are `*mut c_void`; the newtypes make them
//! `Send + Sync` and hashable so they can live in the session registry.
//! `Module` and `Kernel` own their native object and release it on drop.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Result, XpuError};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(*mut c_void);

        // Level Zero handles are plain identifiers, safe to move across threads.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub fn from_raw(raw: *mut c_void) -> Self {
                Self(raw)
            }

            /// Build a handle from an integer address (used by fakes and the host layer).
            pub fn from_addr(addr: usize) -> Self {
                Self(addr as *mut c_void)
            }

            pub fn as_raw(self) -> *mut c_void {
                self.0
            }

            pub fn addr(self) -> usize {
                self.0 as usize
            }

            pub fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.addr())
            }
        }
    };
}

native_handle!(
    /// `ze_driver_handle_t`.
    DriverHandle
);
native_handle!(
    /// `ze_context_handle_t`.
    ContextHandle
);
native_handle!(
    /// `ze_device_handle_t`.
    DeviceHandle
);
native_handle!(
    /// `ze_module_handle_t`.
    ModuleHandle
);
native_handle!(
    /// `ze_kernel_handle_t`.
    KernelHandle
);

/// Opaque identity of a host-side execution queue.
///
/// The binding layer never dereferences it; it only keys the queue map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

impl QueueHandle {
    /// Validate a raw queue address. Zero and addresses wider than a pointer
    /// are rejected.
    pub fn from_raw(raw: u64) -> Result<Self> {
        if raw == 0 {
            return Err(XpuError::InvalidArgument("queue handle is null".into()));
        }
        if usize::try_from(raw).is_err() {
            return Err(XpuError::InvalidArgument(format!(
                "queue handle {:#x} does not fit in a pointer",
                raw
            )));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// An executable module ("kernel bundle"). Destroyed exactly once, when the
/// last owner (including every `Kernel` created from it) is dropped.
pub struct Module {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    handle: ModuleHandle,
    driver: Arc<dyn Driver>,
}

impl Module {
    /// Take ownership of a freshly created native module.
    pub fn from_owned(driver: Arc<dyn Driver>, handle: ModuleHandle) -> Self {
        Self { inner: Arc::new(ModuleInner { handle, driver }) }
    }

    pub fn handle(&self) -> ModuleHandle {
        self.inner.handle
    }

    /// Create the named kernel from this module. On failure nothing is leaked:
    /// the module stays owned by `self`.
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        let handle = self.inner.driver.create_kernel(self.inner.handle, name)?;
        Ok(Kernel {
            handle,
            name: name.to_string(),
            module: Arc::clone(&self.inner),
        })
    }
}

impl Clone for Module {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module").field("handle", &self.inner.handle).finish()
    }
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            self.driver.destroy_module(self.handle);
        }
    }
}

/// A kernel entry point. Keeps its module alive.
pub struct Kernel {
    handle: KernelHandle,
    name: String,
    module: Arc<ModuleInner>,
}

impl Kernel {
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_handle(&self) -> ModuleHandle {
        self.module.handle
    }

    /// Query the kernel's compile-time properties.
    pub fn properties(&self) -> Result<crate::driver::KernelProperties> {
        self.module.driver.kernel_properties(self.handle)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("module", &self.module.handle)
            .finish()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            self.module.driver.destroy_kernel(self.handle);
        }
    }
}
