//! Driver session: device registry and queue-to-context map.
//!
//! A session replaces process-wide globals. Everything the host-facing
//! operations share (registered devices, bound queues, the native device
//! list) lives here and is mutated only through `&mut self`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LoaderConfig;
use crate::driver::{Driver, QueueBinding};
use crate::error::{Result, XpuError};
use crate::handle::{ContextHandle, DeviceHandle, QueueHandle};
use crate::loader::{self, LoadRequest, LoadedKernel};
use crate::properties::DeviceProperties;

/// A device discovered through a queue. Its index in the registry is the
/// device id seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredDevice {
    /// Queue the device was discovered through.
    pub queue: QueueHandle,
    /// Context kernels for this device are built in.
    pub context: ContextHandle,
    pub native: DeviceHandle,
}

/// Resolves the loader configuration at the point of use.
type ConfigSource = Box<dyn Fn() -> LoaderConfig + Send + Sync>;

pub struct DriverSession {
    driver: Arc<dyn Driver>,
    config: ConfigSource,
    registry: Vec<RegisteredDevice>,
    native_devices: Vec<DeviceHandle>,
    queues: HashMap<QueueHandle, QueueBinding>,
}

impl DriverSession {
    /// Session whose loader configuration is re-read from the process
    /// environment on every load.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_config(driver, LoaderConfig::from_env)
    }

    /// Session with a custom configuration source, consulted on every load.
    pub fn with_config(
        driver: Arc<dyn Driver>,
        config: impl Fn() -> LoaderConfig + Send + Sync + 'static,
    ) -> Self {
        Self {
            driver,
            config: Box::new(config),
            registry: Vec::new(),
            native_devices: Vec::new(),
            queues: HashMap::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// The loader configuration as it currently resolves.
    pub fn config(&self) -> LoaderConfig {
        (self.config)()
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    pub fn devices(&self) -> &[RegisteredDevice] {
        &self.registry
    }

    /// Native device handles in enumeration order, as refreshed by `init_context`.
    pub fn native_devices(&self) -> &[DeviceHandle] {
        &self.native_devices
    }

    pub fn binding(&self, queue: QueueHandle) -> Option<&QueueBinding> {
        self.queues.get(&queue)
    }

    /// Discover the devices of `queue` and register the ones not yet known.
    ///
    /// Returns the number of devices associated with the queue.
    pub fn init_devices(&mut self, queue: QueueHandle) -> Result<usize> {
        let binding = match self.queues.entry(queue) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => e.insert(self.driver.bind_queue(queue)?).clone(),
        };

        for &native in &binding.devices {
            if self.registry.iter().any(|d| d.native == native) {
                continue;
            }
            self.registry.push(RegisteredDevice { queue, context: binding.context, native });
            self.native_devices.push(native);
        }

        tracing::debug!(
            "queue {:#x}: {} devices, {} registered",
            queue.raw(),
            binding.devices.len(),
            self.registry.len()
        );
        Ok(binding.devices.len())
    }

    /// Resolve the native context of `queue`, binding it on first use.
    pub fn init_context(&mut self, queue: QueueHandle) -> Result<ContextHandle> {
        if let Some(binding) = self.queues.get(&queue) {
            return Ok(binding.context);
        }

        let binding = self.driver.bind_queue(queue)?;
        // Clamped: the refreshed list may be shorter or longer than ours.
        let n = binding.devices.len().min(self.native_devices.len());
        self.native_devices[..n].copy_from_slice(&binding.devices[..n]);

        let context = binding.context;
        self.queues.insert(queue, binding);
        tracing::debug!("queue {:#x} -> context {:?}", queue.raw(), context);
        Ok(context)
    }

    /// Look up a registered device by host-visible id.
    pub fn device(&self, device_id: i64) -> Result<&RegisteredDevice> {
        usize::try_from(device_id)
            .ok()
            .and_then(|idx| self.registry.get(idx))
            .ok_or_else(|| {
                tracing::error!("Device is not found: {}", device_id);
                XpuError::DeviceNotFound { device_id, count: self.registry.len() }
            })
    }

    /// Hardware capability record for a registered device.
    pub fn device_properties(&self, device_id: i64) -> Result<DeviceProperties> {
        let device = self.device(device_id)?;
        DeviceProperties::query(self.driver.as_ref(), device.native)
    }

    /// Build a kernel image for a registered device.
    pub fn load_binary(&self, device_id: i64, request: &LoadRequest<'_>) -> Result<LoadedKernel> {
        let device = self.device(device_id)?;
        let config = self.config();
        loader::load(
            &self.driver,
            device.context,
            device.native,
            config.module_format(),
            request,
            config.debug,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use crate::config::ENV_GEN_NATIVE_CODE;
    use crate::driver::ModuleFormat;
    use crate::loader::MAX_REG_SPILL;
    use crate::mock::FakeDriver;

    fn session(devices: usize) -> (Arc<FakeDriver>, DriverSession) {
        session_with(devices, LoaderConfig::default())
    }

    fn session_with(devices: usize, config: LoaderConfig) -> (Arc<FakeDriver>, DriverSession) {
        let fake = Arc::new(FakeDriver::with_devices(devices));
        let s = DriverSession::with_config(fake.clone(), move || config);
        (fake, s)
    }

    fn queue(raw: u64) -> QueueHandle {
        QueueHandle::from_raw(raw).unwrap()
    }

    fn request(flags: &str) -> LoadRequest<'_> {
        LoadRequest { name: "kernel", image: b"\x03\x02\x23\x07", shared: true, build_flags: flags }
    }

    #[test]
    fn test_init_devices_registers_in_order() {
        let (fake, mut s) = session(2);
        assert_eq!(s.init_devices(queue(0x10)).unwrap(), 2);
        assert_eq!(s.device_count(), 2);
        assert_eq!(s.devices()[0].native, fake.device(0));
        assert_eq!(s.devices()[1].native, fake.device(1));
        assert_eq!(s.native_devices(), &[fake.device(0), fake.device(1)]);
    }

    #[test]
    fn test_init_devices_twice_same_queue() {
        let (fake, mut s) = session(2);
        s.init_devices(queue(0x10)).unwrap();
        let before = s.devices().to_vec();
        assert_eq!(s.init_devices(queue(0x10)).unwrap(), 2);
        assert_eq!(s.devices(), before.as_slice());
        assert_eq!(fake.bindings(), 1);
    }

    #[test]
    fn test_overlapping_queues_append_only() {
        let (fake, mut s) = session(3);
        let (q1, q2) = (queue(0x10), queue(0x20));
        fake.set_queue_devices(q1, vec![fake.device(0), fake.device(1)]);
        fake.set_queue_devices(q2, vec![fake.device(1), fake.device(2)]);

        s.init_devices(q1).unwrap();
        let first = s.devices().to_vec();
        assert_eq!(s.init_devices(q2).unwrap(), 2);

        assert_eq!(s.device_count(), 3);
        assert_eq!(&s.devices()[..2], first.as_slice());
        assert_eq!(s.devices()[2].native, fake.device(2));
        assert_eq!(s.devices()[2].queue, q2);
    }

    #[test]
    fn test_init_context_is_cached() {
        let (fake, mut s) = session(1);
        let q = queue(0x10);
        let ctx = s.init_context(q).unwrap();
        assert_eq!(s.init_context(q).unwrap(), ctx);
        assert_eq!(fake.bindings(), 1);
        assert_eq!(s.binding(q).unwrap().context, ctx);
    }

    #[test]
    fn test_init_context_matches_init_devices_context() {
        let (_fake, mut s) = session(1);
        let q = queue(0x10);
        s.init_devices(q).unwrap();
        let ctx = s.init_context(q).unwrap();
        assert_eq!(s.devices()[0].context, ctx);
    }

    #[test]
    fn test_init_context_refresh_is_clamped() {
        let (fake, mut s) = session(3);
        let (q1, q2) = (queue(0x10), queue(0x20));
        fake.set_queue_devices(q1, vec![fake.device(0), fake.device(1)]);
        s.init_devices(q1).unwrap();

        // A longer refreshed list only overwrites what exists.
        fake.set_queue_devices(q2, vec![fake.device(2), fake.device(1), fake.device(0)]);
        s.init_context(q2).unwrap();
        assert_eq!(s.native_devices(), &[fake.device(2), fake.device(1)]);
        // The registry itself is untouched.
        assert_eq!(s.devices()[0].native, fake.device(0));
    }

    #[test]
    fn test_init_context_before_devices_leaves_list_empty() {
        let (_fake, mut s) = session(2);
        s.init_context(queue(0x10)).unwrap();
        assert!(s.native_devices().is_empty());
        assert_eq!(s.device_count(), 0);
    }

    #[test]
    fn test_properties_repeatable() {
        let (fake, mut s) = session(1);
        s.init_devices(queue(0x10)).unwrap();
        let a = s.device_properties(0).unwrap();
        let calls = fake.calls();
        let b = s.device_properties(0).unwrap();
        assert_eq!(a, b);
        // No caching: the second read queried the driver again.
        assert_eq!(fake.calls(), calls + 3);
    }

    #[test]
    fn test_out_of_range_never_calls_driver() {
        let (fake, mut s) = session(1);
        s.init_devices(queue(0x10)).unwrap();
        let calls = fake.calls();

        for id in [1, 2, -1, i64::MAX] {
            assert!(matches!(
                s.device_properties(id),
                Err(XpuError::DeviceNotFound { device_id, count: 1 }) if device_id == id
            ));
            assert!(matches!(
                s.load_binary(id, &request("")),
                Err(XpuError::DeviceNotFound { .. })
            ));
        }
        assert_eq!(fake.calls(), calls);
    }

    #[test]
    fn test_empty_registry_rejects_id_zero() {
        let (_fake, s) = session(1);
        assert!(matches!(s.device_properties(0), Err(XpuError::DeviceNotFound { count: 0, .. })));
    }

    #[test]
    fn test_load_binary_uses_registered_context() {
        let (fake, mut s) = session(1);
        s.init_devices(queue(0x10)).unwrap();
        let registered = s.devices()[0];
        // A later queue binds a fresh context; loads stay on the registered one.
        let other = s.init_context(queue(0x20)).unwrap();
        assert_ne!(other, registered.context);

        fake.set_spills(MAX_REG_SPILL + 1, 12);
        let loaded = s.load_binary(0, &request("")).unwrap();
        assert!(loaded.recompiled);
        assert_eq!(loaded.n_spills, 12);

        let builds = fake.builds();
        assert_eq!(builds.len(), 2);
        for build in &builds {
            assert_eq!(build.context, registered.context);
            assert_eq!(build.device, registered.native);
        }
        assert_eq!(builds[0].format, ModuleFormat::SpirV);
    }

    #[test]
    fn test_load_binary_rereads_config_each_call() {
        let vars: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let fake = Arc::new(FakeDriver::with_devices(1));
        let source = vars.clone();
        let mut s = DriverSession::with_config(fake.clone(), move || {
            let vars = source.lock();
            LoaderConfig::from_lookup(|key| vars.get(key).cloned())
        });
        s.init_devices(queue(0x10)).unwrap();

        s.load_binary(0, &request("")).unwrap();
        vars.lock().insert(ENV_GEN_NATIVE_CODE.to_string(), "1".to_string());
        s.load_binary(0, &request("")).unwrap();

        let formats: Vec<_> = fake.builds().iter().map(|b| b.format).collect();
        assert_eq!(formats, vec![ModuleFormat::SpirV, ModuleFormat::Native]);
        assert_eq!(s.config().module_format(), ModuleFormat::Native);
    }

    #[test]
    fn test_load_binary_native_from_config() {
        let config = LoaderConfig { native_code: true, debug: false };
        let (fake, mut s) = session_with(1, config);
        s.init_devices(queue(0x10)).unwrap();
        fake.set_spills(MAX_REG_SPILL * 10, 0);
        let loaded = s.load_binary(0, &request("")).unwrap();
        assert!(!loaded.recompiled);
        let builds = fake.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].format, ModuleFormat::Native);
        assert_eq!(builds[0].flags, "");
    }
}
