//! Scripted in-memory driver for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::driver::{
    ComputeProperties, CoreProperties, Driver, KernelProperties, MemoryProperties, ModuleFormat,
    QueueBinding,
};
use crate::error::{Result, XpuError};
use crate::ffi::ZeResult;
use crate::handle::{ContextHandle, DeviceHandle, KernelHandle, ModuleHandle, QueueHandle};
use crate::loader::LARGE_GRF_FLAG;

/// Arguments of one `create_module` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Build {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub format: ModuleFormat,
    pub flags: String,
}

pub(crate) struct FakeDriver {
    devices: Vec<DeviceHandle>,
    next_handle: AtomicUsize,
    state: Mutex<FakeState>,
}

struct FakeState {
    calls: usize,
    bindings: usize,
    queue_devices: HashMap<QueueHandle, Vec<DeviceHandle>>,
    memory: Vec<MemoryProperties>,
    spills: u32,
    spills_large_grf: u32,
    fail_module: Option<ZeResult>,
    fail_kernel: Option<ZeResult>,
    fail_properties: Option<ZeResult>,
    builds: Vec<Build>,
    module_flags: HashMap<ModuleHandle, String>,
    kernel_module: HashMap<KernelHandle, ModuleHandle>,
    destroyed_modules: Vec<ModuleHandle>,
    destroyed_kernels: Vec<KernelHandle>,
}

fn driver_error(call: &'static str, code: ZeResult) -> XpuError {
    XpuError::Driver { call, code, build_log: None }
}

impl FakeDriver {
    pub fn with_devices(n: usize) -> Self {
        Self {
            devices: (0..n).map(|i| DeviceHandle::from_addr(0x100 * (i + 1))).collect(),
            next_handle: AtomicUsize::new(0x1_0000),
            state: Mutex::new(FakeState {
                calls: 0,
                bindings: 0,
                queue_devices: HashMap::new(),
                memory: vec![MemoryProperties {
                    max_clock_rate: 3200,
                    max_bus_width: 4096,
                    total_size: 64 << 30,
                }],
                spills: 0,
                spills_large_grf: 0,
                fail_module: None,
                fail_kernel: None,
                fail_properties: None,
                builds: Vec::new(),
                module_flags: HashMap::new(),
                kernel_module: HashMap::new(),
                destroyed_modules: Vec::new(),
                destroyed_kernels: Vec::new(),
            }),
        }
    }

    pub fn device(&self, i: usize) -> DeviceHandle {
        self.devices[i]
    }

    /// Restrict what `bind_queue` reports for one queue.
    pub fn set_queue_devices(&self, queue: QueueHandle, devices: Vec<DeviceHandle>) {
        self.state.lock().queue_devices.insert(queue, devices);
    }

    pub fn set_memory(&self, memory: Vec<MemoryProperties>) {
        self.state.lock().memory = memory;
    }

    /// Spill counts for default builds and for large-GRF builds.
    pub fn set_spills(&self, default: u32, large_grf: u32) {
        let mut st = self.state.lock();
        st.spills = default;
        st.spills_large_grf = large_grf;
    }

    pub fn fail_module_create(&self, code: ZeResult) {
        self.state.lock().fail_module = Some(code);
    }

    pub fn fail_kernel_create(&self, code: ZeResult) {
        self.state.lock().fail_kernel = Some(code);
    }

    pub fn fail_properties(&self, code: ZeResult) {
        self.state.lock().fail_properties = Some(code);
    }

    /// Number of non-destroy driver calls made so far.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    pub fn bindings(&self) -> usize {
        self.state.lock().bindings
    }

    pub fn builds(&self) -> Vec<Build> {
        self.state.lock().builds.clone()
    }

    pub fn destroyed_modules(&self) -> Vec<ModuleHandle> {
        self.state.lock().destroyed_modules.clone()
    }

    pub fn destroyed_kernels(&self) -> Vec<KernelHandle> {
        self.state.lock().destroyed_kernels.clone()
    }

    fn fresh(&self) -> usize {
        self.next_handle.fetch_add(0x10, Ordering::Relaxed)
    }
}

impl Driver for FakeDriver {
    fn bind_queue(&self, queue: QueueHandle) -> Result<QueueBinding> {
        let context = ContextHandle::from_addr(self.fresh());
        let mut st = self.state.lock();
        st.calls += 1;
        st.bindings += 1;
        let devices = st
            .queue_devices
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| self.devices.clone());
        Ok(QueueBinding { context, devices })
    }

    fn device_properties(&self, _device: DeviceHandle) -> Result<CoreProperties> {
        let mut st = self.state.lock();
        st.calls += 1;
        if let Some(code) = st.fail_properties {
            return Err(driver_error("zeDeviceGetProperties", code));
        }
        Ok(CoreProperties {
            name: "Fake Xe GPU".into(),
            num_slices: 8,
            num_subslices_per_slice: 4,
            core_clock_rate: 1600,
        })
    }

    fn compute_properties(&self, _device: DeviceHandle) -> Result<ComputeProperties> {
        self.state.lock().calls += 1;
        Ok(ComputeProperties {
            max_total_group_size: 1024,
            max_shared_local_memory: 128 * 1024,
            sub_group_sizes: vec![16, 32],
        })
    }

    fn memory_properties(&self, _device: DeviceHandle) -> Result<Vec<MemoryProperties>> {
        let mut st = self.state.lock();
        st.calls += 1;
        Ok(st.memory.clone())
    }

    fn create_module(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        format: ModuleFormat,
        _image: &[u8],
        build_flags: &str,
    ) -> Result<ModuleHandle> {
        let handle = ModuleHandle::from_addr(self.fresh());
        let mut st = self.state.lock();
        st.calls += 1;
        st.builds.push(Build { context, device, format, flags: build_flags.to_string() });
        if let Some(code) = st.fail_module {
            return Err(XpuError::Driver {
                call: "zeModuleCreate",
                code,
                build_log: Some("error: fake build failure".into()),
            });
        }
        st.module_flags.insert(handle, build_flags.to_string());
        Ok(handle)
    }

    fn create_kernel(&self, module: ModuleHandle, _name: &str) -> Result<KernelHandle> {
        let handle = KernelHandle::from_addr(self.fresh());
        let mut st = self.state.lock();
        st.calls += 1;
        if let Some(code) = st.fail_kernel {
            return Err(driver_error("zeKernelCreate", code));
        }
        st.kernel_module.insert(handle, module);
        Ok(handle)
    }

    fn kernel_properties(&self, kernel: KernelHandle) -> Result<KernelProperties> {
        let mut st = self.state.lock();
        st.calls += 1;
        let large_grf = st
            .kernel_module
            .get(&kernel)
            .and_then(|m| st.module_flags.get(m))
            .map(|flags| flags.contains(LARGE_GRF_FLAG))
            .unwrap_or(false);
        let spill_mem_size = if large_grf { st.spills_large_grf } else { st.spills };
        Ok(KernelProperties { num_kernel_args: 3, private_mem_size: 0, spill_mem_size })
    }

    fn destroy_kernel(&self, kernel: KernelHandle) {
        self.state.lock().destroyed_kernels.push(kernel);
    }

    fn destroy_module(&self, module: ModuleHandle) {
        self.state.lock().destroyed_modules.push(module);
    }
}
