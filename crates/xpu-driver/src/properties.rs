//! Static hardware capability record for a registered device.

use serde::Serialize;

use crate::driver::Driver;
use crate::error::Result;
use crate::handle::DeviceHandle;

/// Capability figures the kernel compiler tunes against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceProperties {
    /// Shared local memory per work-group, in bytes.
    pub max_shared_mem: u32,
    /// Slices × sub-slices per slice.
    pub multiprocessor_count: u32,
    /// Core clock, MHz.
    pub sm_clock_rate: u32,
    /// Clock of the first memory module, MHz.
    pub mem_clock_rate: u32,
    /// Bus width of the first memory module, bits.
    pub mem_bus_width: u32,
    pub max_work_group_size: u32,
    /// Supported sub-group sizes, in driver order.
    pub sub_group_sizes: Vec<u32>,
}

impl DeviceProperties {
    /// Query the driver. Every call goes to the driver; nothing is cached.
    pub fn query(driver: &dyn Driver, device: DeviceHandle) -> Result<Self> {
        let core = driver.device_properties(device)?;
        let compute = driver.compute_properties(device)?;
        let memory = driver.memory_properties(device)?;

        // Only the first memory module is reported.
        let (mem_clock_rate, mem_bus_width) = memory
            .first()
            .map(|m| (m.max_clock_rate, m.max_bus_width))
            .unwrap_or((0, 0));

        Ok(Self {
            max_shared_mem: compute.max_shared_local_memory,
            multiprocessor_count: core.num_slices.saturating_mul(core.num_subslices_per_slice),
            sm_clock_rate: core.core_clock_rate,
            mem_clock_rate,
            mem_bus_width,
            max_work_group_size: compute.max_total_group_size,
            sub_group_sizes: compute.sub_group_sizes,
        })
    }
}
