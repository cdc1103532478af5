//! # xpu-python
//!
//! PyO3 bindings for xpu-driver → `import spirv_utils` in Python.
//!
//! Provides:
//! - `init_devices(queue)` / `init_context(queue)`: queue discovery
//! - `get_device_properties(device_id)`: capability dict
//! - `load_binary(...)`: module + kernel load with the large-GRF fallback
//! - `spirv_utils.KernelBundle` / `spirv_utils.Kernel`: owned native handles

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use pyo3::exceptions::{PyIndexError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

use xpu_driver::{
    DriverSession, Kernel, LevelZero, LoadRequest, Module, QueueHandle, XpuError,
};

// ============================================================================
// Session
// ============================================================================

/// The process-wide session. Calls from different Python threads serialize on
/// the mutex; the GIL is released while it is held. `TRITON_*` variables are
/// read on each `load_binary`, not when the session is created.
static SESSION: OnceLock<Result<Mutex<DriverSession>, String>> = OnceLock::new();

fn session() -> PyResult<&'static Mutex<DriverSession>> {
    SESSION
        .get_or_init(|| match LevelZero::new() {
            Ok(lz) => Ok(Mutex::new(DriverSession::new(Arc::new(lz)))),
            Err(e) => {
                tracing::warn!("Level Zero unavailable: {}", e);
                Err(e.to_string())
            }
        })
        .as_ref()
        .map_err(|reason| PyRuntimeError::new_err(reason.clone()))
}

fn to_py_err(err: XpuError) -> PyErr {
    match &err {
        XpuError::InvalidArgument(_) => PyValueError::new_err(err.to_string()),
        XpuError::DeviceNotFound { .. } => PyIndexError::new_err(err.to_string()),
        XpuError::Driver { .. } | XpuError::NotAvailable(_) => {
            PyRuntimeError::new_err(err.to_string())
        }
    }
}

fn queue_handle(queue: &Bound<'_, PyAny>) -> PyResult<QueueHandle> {
    let raw: u64 = queue.extract().map_err(|_| {
        to_py_err(XpuError::InvalidArgument(format!(
            "expected a queue address as a non-negative int, got {}",
            queue.get_type().name().map(|n| n.to_string()).unwrap_or_default()
        )))
    })?;
    QueueHandle::from_raw(raw).map_err(to_py_err)
}

// ============================================================================
// Kernel handles
// ============================================================================

/// An executable module. The native module is destroyed once this object and
/// every `Kernel` made from it are collected.
#[pyclass(name = "KernelBundle", module = "spirv_utils", frozen)]
struct PyKernelBundle {
    inner: Module,
}

#[pymethods]
impl PyKernelBundle {
    /// Native `ze_module_handle_t` address.
    #[getter]
    fn handle(&self) -> usize {
        self.inner.handle().addr()
    }

    fn __repr__(&self) -> String {
        format!("KernelBundle(handle={:#x})", self.inner.handle().addr())
    }
}

/// A kernel entry point.
#[pyclass(name = "Kernel", module = "spirv_utils", frozen)]
struct PyKernel {
    inner: Kernel,
}

#[pymethods]
impl PyKernel {
    /// Native `ze_kernel_handle_t` address.
    #[getter]
    fn handle(&self) -> usize {
        self.inner.handle().addr()
    }

    #[getter]
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn __repr__(&self) -> String {
        format!("Kernel(name={:?}, handle={:#x})", self.inner.name(), self.inner.handle().addr())
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Load provided SPV into ZE driver.
///
/// Returns `(bundle, kernel, n_regs, n_spills)`.
#[pyfunction]
fn load_binary(
    py: Python<'_>,
    name: &str,
    binary: &[u8],
    shared: i32,
    build_flags: &str,
    device_id: i64,
) -> PyResult<(Py<PyKernelBundle>, Py<PyKernel>, u32, u32)> {
    let session = session()?;
    let request = LoadRequest { name, image: binary, shared: shared != 0, build_flags };
    let loaded = py
        .allow_threads(|| session.lock().load_binary(device_id, &request))
        .map_err(to_py_err)?;

    let bundle = Py::new(py, PyKernelBundle { inner: loaded.module })?;
    let kernel = Py::new(py, PyKernel { inner: loaded.kernel })?;
    Ok((bundle, kernel, loaded.n_regs, loaded.n_spills))
}

/// Get the properties for a given device.
#[pyfunction]
fn get_device_properties(py: Python<'_>, device_id: i64) -> PyResult<Bound<'_, PyDict>> {
    let session = session()?;
    let props = py
        .allow_threads(|| session.lock().device_properties(device_id))
        .map_err(to_py_err)?;

    let dict = PyDict::new_bound(py);
    dict.set_item("max_shared_mem", props.max_shared_mem)?;
    dict.set_item("multiprocessor_count", props.multiprocessor_count)?;
    dict.set_item("sm_clock_rate", props.sm_clock_rate)?;
    dict.set_item("mem_clock_rate", props.mem_clock_rate)?;
    dict.set_item("mem_bus_width", props.mem_bus_width)?;
    dict.set_item("max_work_group_size", props.max_work_group_size)?;
    dict.set_item("sub_group_sizes", PyTuple::new_bound(py, props.sub_group_sizes.iter()))?;
    Ok(dict)
}

/// Initialize the ZE GPU context.
///
/// `queue` is used as an identity key only. The returned context is created
/// and owned by this module, not taken from a SYCL queue at that address.
#[pyfunction]
fn init_context(py: Python<'_>, queue: &Bound<'_, PyAny>) -> PyResult<usize> {
    let queue = queue_handle(queue)?;
    let session = session()?;
    let context = py
        .allow_threads(|| session.lock().init_context(queue))
        .map_err(to_py_err)?;
    Ok(context.addr())
}

/// Initialize the ZE GPU devices and return device count.
#[pyfunction]
fn init_devices(py: Python<'_>, queue: &Bound<'_, PyAny>) -> PyResult<usize> {
    let queue = queue_handle(queue)?;
    let session = session()?;
    py.allow_threads(|| session.lock().init_devices(queue))
        .map_err(to_py_err)
}

/// Number of devices registered so far.
#[pyfunction]
fn device_count(py: Python<'_>) -> PyResult<usize> {
    let session = session()?;
    Ok(py.allow_threads(|| session.lock().device_count()))
}

// ============================================================================
// Module entry point
// ============================================================================

/// Whether the recompilation notice reaches the installed level is decided per
/// load from `TRITON_DEBUG`.
fn init_logging() {
    // The host process may already own a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(xpu_driver::loader::NOTICE_LEVEL)
        .with_writer(std::io::stderr)
        .try_init();
}

#[pymodule]
fn spirv_utils(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_logging();

    m.add_class::<PyKernelBundle>()?;
    m.add_class::<PyKernel>()?;
    m.add_function(wrap_pyfunction!(load_binary, m)?)?;
    m.add_function(wrap_pyfunction!(get_device_properties, m)?)?;
    m.add_function(wrap_pyfunction!(init_context, m)?)?;
    m.add_function(wrap_pyfunction!(init_devices, m)?)?;
    m.add_function(wrap_pyfunction!(device_count, m)?)?;
    Ok(())
}
