//! # xpu-driver
//!
//! Level Zero glue for Intel GPUs: device discovery, context resolution,
//! capability queries and kernel-binary loading.
//!
//! Provides:
//! - Runtime-loaded Level Zero entry points (no build-time oneAPI dependency)
//! - `DriverSession`: device registry and queue-to-context map
//! - Owned `Module` / `Kernel` handles released exactly once on drop
//! - SPIR-V loading with a one-shot large-GRF rebuild for heavy spilling

pub mod config;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod loader;
pub mod properties;
pub mod session;

#[cfg(test)]
mod mock;

pub use config::LoaderConfig;
pub use driver::{Driver, LevelZero, ModuleFormat, QueueBinding};
pub use error::{Result, XpuError};
pub use handle::{ContextHandle, DeviceHandle, Kernel, KernelHandle, Module, ModuleHandle, QueueHandle};
pub use loader::{LoadRequest, LoadedKernel, LARGE_GRF_FLAG, MAX_REG_SPILL};
pub use properties::DeviceProperties;
pub use session::{DriverSession, RegisteredDevice};
