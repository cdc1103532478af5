//! Runtime-loaded Level Zero function pointers via dlopen.
//!
//! This avoids pinning to a specific oneAPI release: works with any driver
//! install that ships the Level Zero loader (`libze_loader.so.1`).
//! Only the slice of the API needed for device queries and module loading is
//! mirrored here.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::sync::OnceLock;

use libloading::Library;

use crate::error::XpuError;

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// A `ze_result_t` status code.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZeResult(pub u32);

impl ZeResult {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(0x1);
    pub const ERROR_DEVICE_LOST: Self = Self(0x7000_0001);
    pub const ERROR_OUT_OF_HOST_MEMORY: Self = Self(0x7000_0002);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: Self = Self(0x7000_0003);
    pub const ERROR_MODULE_BUILD_FAILURE: Self = Self(0x7000_0004);
    pub const ERROR_MODULE_LINK_FAILURE: Self = Self(0x7000_0005);
    pub const ERROR_DEVICE_REQUIRES_RESET: Self = Self(0x7000_0006);
    pub const ERROR_DEVICE_IN_LOW_POWER_STATE: Self = Self(0x7000_0007);
    pub const ERROR_INSUFFICIENT_PERMISSIONS: Self = Self(0x7001_0000);
    pub const ERROR_NOT_AVAILABLE: Self = Self(0x7001_0001);
    pub const ERROR_DEPENDENCY_UNAVAILABLE: Self = Self(0x7002_0000);
    pub const ERROR_UNINITIALIZED: Self = Self(0x7800_0001);
    pub const ERROR_UNSUPPORTED_VERSION: Self = Self(0x7800_0002);
    pub const ERROR_UNSUPPORTED_FEATURE: Self = Self(0x7800_0003);
    pub const ERROR_INVALID_ARGUMENT: Self = Self(0x7800_0004);
    pub const ERROR_INVALID_NULL_HANDLE: Self = Self(0x7800_0005);
    pub const ERROR_HANDLE_OBJECT_IN_USE: Self = Self(0x7800_0006);
    pub const ERROR_INVALID_NULL_POINTER: Self = Self(0x7800_0007);
    pub const ERROR_INVALID_SIZE: Self = Self(0x7800_0008);
    pub const ERROR_UNSUPPORTED_SIZE: Self = Self(0x7800_0009);
    pub const ERROR_UNSUPPORTED_ALIGNMENT: Self = Self(0x7800_000a);
    pub const ERROR_INVALID_SYNCHRONIZATION_OBJECT: Self = Self(0x7800_000b);
    pub const ERROR_INVALID_ENUMERATION: Self = Self(0x7800_000c);
    pub const ERROR_UNSUPPORTED_ENUMERATION: Self = Self(0x7800_000d);
    pub const ERROR_UNSUPPORTED_IMAGE_FORMAT: Self = Self(0x7800_000e);
    pub const ERROR_INVALID_NATIVE_BINARY: Self = Self(0x7800_000f);
    pub const ERROR_INVALID_GLOBAL_NAME: Self = Self(0x7800_0010);
    pub const ERROR_INVALID_KERNEL_NAME: Self = Self(0x7800_0011);
    pub const ERROR_INVALID_FUNCTION_NAME: Self = Self(0x7800_0012);
    pub const ERROR_INVALID_GROUP_SIZE_DIMENSION: Self = Self(0x7800_0013);
    pub const ERROR_INVALID_GLOBAL_WIDTH_DIMENSION: Self = Self(0x7800_0014);
    pub const ERROR_INVALID_KERNEL_ARGUMENT_INDEX: Self = Self(0x7800_0015);
    pub const ERROR_INVALID_KERNEL_ARGUMENT_SIZE: Self = Self(0x7800_0016);
    pub const ERROR_INVALID_KERNEL_ATTRIBUTE_VALUE: Self = Self(0x7800_0017);
    pub const ERROR_INVALID_MODULE_UNLINKED: Self = Self(0x7800_0018);
    pub const ERROR_INVALID_COMMAND_LIST_TYPE: Self = Self(0x7800_0019);
    pub const ERROR_OVERLAPPING_REGIONS: Self = Self(0x7800_001a);
    pub const ERROR_UNKNOWN: Self = Self(0x7fff_fffe);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// The `ZE_RESULT_*` spelling of this code.
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "ZE_RESULT_SUCCESS",
            Self::NOT_READY => "ZE_RESULT_NOT_READY",
            Self::ERROR_DEVICE_LOST => "ZE_RESULT_ERROR_DEVICE_LOST",
            Self::ERROR_OUT_OF_HOST_MEMORY => "ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY",
            Self::ERROR_OUT_OF_DEVICE_MEMORY => "ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ERROR_MODULE_BUILD_FAILURE => "ZE_RESULT_ERROR_MODULE_BUILD_FAILURE",
            Self::ERROR_MODULE_LINK_FAILURE => "ZE_RESULT_ERROR_MODULE_LINK_FAILURE",
            Self::ERROR_DEVICE_REQUIRES_RESET => "ZE_RESULT_ERROR_DEVICE_REQUIRES_RESET",
            Self::ERROR_DEVICE_IN_LOW_POWER_STATE => "ZE_RESULT_ERROR_DEVICE_IN_LOW_POWER_STATE",
            Self::ERROR_INSUFFICIENT_PERMISSIONS => "ZE_RESULT_ERROR_INSUFFICIENT_PERMISSIONS",
            Self::ERROR_NOT_AVAILABLE => "ZE_RESULT_ERROR_NOT_AVAILABLE",
            Self::ERROR_DEPENDENCY_UNAVAILABLE => "ZE_RESULT_ERROR_DEPENDENCY_UNAVAILABLE",
            Self::ERROR_UNINITIALIZED => "ZE_RESULT_ERROR_UNINITIALIZED",
            Self::ERROR_UNSUPPORTED_VERSION => "ZE_RESULT_ERROR_UNSUPPORTED_VERSION",
            Self::ERROR_UNSUPPORTED_FEATURE => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
            Self::ERROR_INVALID_ARGUMENT => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
            Self::ERROR_INVALID_NULL_HANDLE => "ZE_RESULT_ERROR_INVALID_NULL_HANDLE",
            Self::ERROR_HANDLE_OBJECT_IN_USE => "ZE_RESULT_ERROR_HANDLE_OBJECT_IN_USE",
            Self::ERROR_INVALID_NULL_POINTER => "ZE_RESULT_ERROR_INVALID_NULL_POINTER",
            Self::ERROR_INVALID_SIZE => "ZE_RESULT_ERROR_INVALID_SIZE",
            Self::ERROR_UNSUPPORTED_SIZE => "ZE_RESULT_ERROR_UNSUPPORTED_SIZE",
            Self::ERROR_UNSUPPORTED_ALIGNMENT => "ZE_RESULT_ERROR_UNSUPPORTED_ALIGNMENT",
            Self::ERROR_INVALID_SYNCHRONIZATION_OBJECT => {
                "ZE_RESULT_ERROR_INVALID_SYNCHRONIZATION_OBJECT"
            }
            Self::ERROR_INVALID_ENUMERATION => "ZE_RESULT_ERROR_INVALID_ENUMERATION",
            Self::ERROR_UNSUPPORTED_ENUMERATION => "ZE_RESULT_ERROR_UNSUPPORTED_ENUMERATION",
            Self::ERROR_UNSUPPORTED_IMAGE_FORMAT => "ZE_RESULT_ERROR_UNSUPPORTED_IMAGE_FORMAT",
            Self::ERROR_INVALID_NATIVE_BINARY => "ZE_RESULT_ERROR_INVALID_NATIVE_BINARY",
            Self::ERROR_INVALID_GLOBAL_NAME => "ZE_RESULT_ERROR_INVALID_GLOBAL_NAME",
            Self::ERROR_INVALID_KERNEL_NAME => "ZE_RESULT_ERROR_INVALID_KERNEL_NAME",
            Self::ERROR_INVALID_FUNCTION_NAME => "ZE_RESULT_ERROR_INVALID_FUNCTION_NAME",
            Self::ERROR_INVALID_GROUP_SIZE_DIMENSION => {
                "ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION"
            }
            Self::ERROR_INVALID_GLOBAL_WIDTH_DIMENSION => {
                "ZE_RESULT_ERROR_INVALID_GLOBAL_WIDTH_DIMENSION"
            }
            Self::ERROR_INVALID_KERNEL_ARGUMENT_INDEX => {
                "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_INDEX"
            }
            Self::ERROR_INVALID_KERNEL_ARGUMENT_SIZE => {
                "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_SIZE"
            }
            Self::ERROR_INVALID_KERNEL_ATTRIBUTE_VALUE => {
                "ZE_RESULT_ERROR_INVALID_KERNEL_ATTRIBUTE_VALUE"
            }
            Self::ERROR_INVALID_MODULE_UNLINKED => "ZE_RESULT_ERROR_INVALID_MODULE_UNLINKED",
            Self::ERROR_INVALID_COMMAND_LIST_TYPE => "ZE_RESULT_ERROR_INVALID_COMMAND_LIST_TYPE",
            Self::ERROR_OVERLAPPING_REGIONS => "ZE_RESULT_ERROR_OVERLAPPING_REGIONS",
            Self::ERROR_UNKNOWN => "ZE_RESULT_ERROR_UNKNOWN",
            _ => "ZE_RESULT_UNRECOGNIZED",
        }
    }
}

impl fmt::Display for ZeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.name(), self.0)
    }
}

impl fmt::Debug for ZeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Opaque handles and enums
// ---------------------------------------------------------------------------

pub type ZeDriverHandle = *mut c_void;
pub type ZeDeviceHandle = *mut c_void;
pub type ZeContextHandle = *mut c_void;
pub type ZeModuleHandle = *mut c_void;
pub type ZeModuleBuildLogHandle = *mut c_void;
pub type ZeKernelHandle = *mut c_void;

pub type ZeStructureType = u32;
pub const ZE_STRUCTURE_TYPE_DEVICE_PROPERTIES: ZeStructureType = 0x3;
pub const ZE_STRUCTURE_TYPE_DEVICE_COMPUTE_PROPERTIES: ZeStructureType = 0x4;
pub const ZE_STRUCTURE_TYPE_DEVICE_MEMORY_PROPERTIES: ZeStructureType = 0x7;
pub const ZE_STRUCTURE_TYPE_CONTEXT_DESC: ZeStructureType = 0xd;
pub const ZE_STRUCTURE_TYPE_MODULE_DESC: ZeStructureType = 0x1b;
pub const ZE_STRUCTURE_TYPE_KERNEL_DESC: ZeStructureType = 0x1d;
pub const ZE_STRUCTURE_TYPE_KERNEL_PROPERTIES: ZeStructureType = 0x1e;

pub type ZeModuleFormat = u32;
pub const ZE_MODULE_FORMAT_IL_SPIRV: ZeModuleFormat = 0;
pub const ZE_MODULE_FORMAT_NATIVE: ZeModuleFormat = 1;

pub const ZE_MAX_DEVICE_NAME: usize = 256;
pub const ZE_MAX_DEVICE_UUID_SIZE: usize = 16;
pub const ZE_SUBGROUPSIZE_COUNT: usize = 8;
pub const ZE_MAX_KERNEL_UUID_SIZE: usize = 16;
pub const ZE_MAX_MODULE_UUID_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Descriptor / property structs
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct ZeDeviceProperties {
    pub stype: ZeStructureType,
    pub p_next: *mut c_void,
    pub device_type: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub flags: u32,
    pub subdevice_id: u32,
    pub core_clock_rate: u32,
    pub max_mem_alloc_size: u64,
    pub max_hardware_contexts: u32,
    pub max_command_queue_priority: u32,
    pub num_threads_per_eu: u32,
    pub physical_eu_simd_width: u32,
    pub num_eus_per_subslice: u32,
    pub num_subslices_per_slice: u32,
    pub num_slices: u32,
    pub timer_resolution: u64,
    pub timestamp_valid_bits: u32,
    pub kernel_timestamp_valid_bits: u32,
    pub uuid: [u8; ZE_MAX_DEVICE_UUID_SIZE],
    pub name: [c_char; ZE_MAX_DEVICE_NAME],
}

#[repr(C)]
pub struct ZeDeviceComputeProperties {
    pub stype: ZeStructureType,
    pub p_next: *mut c_void,
    pub max_total_group_size: u32,
    pub max_group_size_x: u32,
    pub max_group_size_y: u32,
    pub max_group_size_z: u32,
    pub max_group_count_x: u32,
    pub max_group_count_y: u32,
    pub max_group_count_z: u32,
    pub max_shared_local_memory: u32,
    pub num_sub_group_sizes: u32,
    pub sub_group_sizes: [u32; ZE_SUBGROUPSIZE_COUNT],
}

#[repr(C)]
pub struct ZeDeviceMemoryProperties {
    pub stype: ZeStructureType,
    pub p_next: *mut c_void,
    pub flags: u32,
    pub max_clock_rate: u32,
    pub max_bus_width: u32,
    pub total_size: u64,
    pub name: *const c_char,
}

#[repr(C)]
pub struct ZeContextDesc {
    pub stype: ZeStructureType,
    pub p_next: *const c_void,
    pub flags: u32,
}

#[repr(C)]
pub struct ZeModuleDesc {
    pub stype: ZeStructureType,
    pub p_next: *const c_void,
    pub format: ZeModuleFormat,
    pub input_size: usize,
    pub p_input_module: *const u8,
    pub p_build_flags: *const c_char,
    pub p_constants: *const c_void,
}

#[repr(C)]
pub struct ZeKernelDesc {
    pub stype: ZeStructureType,
    pub p_next: *const c_void,
    pub flags: u32,
    pub p_kernel_name: *const c_char,
}

#[repr(C)]
pub struct ZeGroupCount {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

#[repr(C)]
pub struct ZeKernelUuid {
    pub kid: [u8; ZE_MAX_KERNEL_UUID_SIZE],
    pub mid: [u8; ZE_MAX_MODULE_UUID_SIZE],
}

#[repr(C)]
pub struct ZeKernelProperties {
    pub stype: ZeStructureType,
    pub p_next: *mut c_void,
    pub num_kernel_args: u32,
    pub required_group_size: ZeGroupCount,
    pub required_num_sub_groups: u32,
    pub required_subgroup_size: u32,
    pub max_subgroup_size: u32,
    pub max_num_subgroups: u32,
    pub local_mem_size: u32,
    pub private_mem_size: u32,
    pub spill_mem_size: u32,
    pub uuid: ZeKernelUuid,
}

/// Zero-initialize a plain-old-data FFI struct and stamp its `stype`.
macro_rules! ze_struct {
    ($ty:ty, $stype:expr) => {{
        // SAFETY: every mirrored struct is repr(C) plain data for which
        // all-zero bytes (null pointers, zero integers) is a valid value.
        let mut value: $ty = unsafe { std::mem::zeroed() };
        value.stype = $stype;
        value
    }};
}
pub(crate) use ze_struct;

// ---------------------------------------------------------------------------
// Level Zero API function signatures
// ---------------------------------------------------------------------------

type FnZeInit = unsafe extern "C" fn(u32) -> ZeResult;
type FnZeDriverGet = unsafe extern "C" fn(*mut u32, *mut ZeDriverHandle) -> ZeResult;
type FnZeDeviceGet = unsafe extern "C" fn(
    ZeDriverHandle, *mut u32, *mut ZeDeviceHandle,
) -> ZeResult;
type FnZeDeviceGetProperties = unsafe extern "C" fn(
    ZeDeviceHandle, *mut ZeDeviceProperties,
) -> ZeResult;
type FnZeDeviceGetComputeProperties = unsafe extern "C" fn(
    ZeDeviceHandle, *mut ZeDeviceComputeProperties,
) -> ZeResult;
type FnZeDeviceGetMemoryProperties = unsafe extern "C" fn(
    ZeDeviceHandle, *mut u32, *mut ZeDeviceMemoryProperties,
) -> ZeResult;
type FnZeContextCreate = unsafe extern "C" fn(
    ZeDriverHandle, *const ZeContextDesc, *mut ZeContextHandle,
) -> ZeResult;
type FnZeContextDestroy = unsafe extern "C" fn(ZeContextHandle) -> ZeResult;
type FnZeModuleCreate = unsafe extern "C" fn(
    ZeContextHandle,
    ZeDeviceHandle,
    *const ZeModuleDesc,
    *mut ZeModuleHandle,
    *mut ZeModuleBuildLogHandle,   // optional build log (may be null)
) -> ZeResult;
type FnZeModuleDestroy = unsafe extern "C" fn(ZeModuleHandle) -> ZeResult;
type FnZeModuleBuildLogGetString = unsafe extern "C" fn(
    ZeModuleBuildLogHandle, *mut usize, *mut c_char,
) -> ZeResult;
type FnZeModuleBuildLogDestroy = unsafe extern "C" fn(ZeModuleBuildLogHandle) -> ZeResult;
type FnZeKernelCreate = unsafe extern "C" fn(
    ZeModuleHandle, *const ZeKernelDesc, *mut ZeKernelHandle,
) -> ZeResult;
type FnZeKernelDestroy = unsafe extern "C" fn(ZeKernelHandle) -> ZeResult;
type FnZeKernelGetProperties = unsafe extern "C" fn(
    ZeKernelHandle, *mut ZeKernelProperties,
) -> ZeResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct ZeApi {
    _lib: Library,
    pub ze_init: FnZeInit,
    pub ze_driver_get: FnZeDriverGet,
    pub ze_device_get: FnZeDeviceGet,
    pub ze_device_get_properties: FnZeDeviceGetProperties,
    pub ze_device_get_compute_properties: FnZeDeviceGetComputeProperties,
    pub ze_device_get_memory_properties: FnZeDeviceGetMemoryProperties,
    pub ze_context_create: FnZeContextCreate,
    pub ze_context_destroy: FnZeContextDestroy,
    pub ze_module_create: FnZeModuleCreate,
    pub ze_module_destroy: FnZeModuleDestroy,
    pub ze_module_build_log_get_string: FnZeModuleBuildLogGetString,
    pub ze_module_build_log_destroy: FnZeModuleBuildLogDestroy,
    pub ze_kernel_create: FnZeKernelCreate,
    pub ze_kernel_destroy: FnZeKernelDestroy,
    pub ze_kernel_get_properties: FnZeKernelGetProperties,
}

// Safety: the loaded function pointers are process-global and the Level Zero
// loader is internally synchronized.
unsafe impl Send for ZeApi {}
unsafe impl Sync for ZeApi {}

#[cfg(windows)]
const LOADER_NAMES: &[&str] = &["ze_loader.dll"];
#[cfg(not(windows))]
const LOADER_NAMES: &[&str] = &["libze_loader.so.1", "libze_loader.so"];

static ZE_API: OnceLock<Result<ZeApi, String>> = OnceLock::new();

impl ZeApi {
    fn open_library() -> Result<Library, String> {
        let mut last_err = String::from("no loader candidates");
        for name in LOADER_NAMES {
            match unsafe { Library::new(name) } {
                Ok(lib) => return Ok(lib),
                Err(e) => last_err = format!("{}: {}", name, e),
            }
        }
        Err(last_err)
    }

    fn try_load() -> Result<Self, String> {
        let lib = Self::open_library()?;
        let missing = |e: libloading::Error| e.to_string();
        unsafe {
            let api = ZeApi {
                ze_init: *lib.get::<FnZeInit>(b"zeInit\0").map_err(missing)?,
                ze_driver_get: *lib.get::<FnZeDriverGet>(b"zeDriverGet\0").map_err(missing)?,
                ze_device_get: *lib.get::<FnZeDeviceGet>(b"zeDeviceGet\0").map_err(missing)?,
                ze_device_get_properties: *lib
                    .get::<FnZeDeviceGetProperties>(b"zeDeviceGetProperties\0")
                    .map_err(missing)?,
                ze_device_get_compute_properties: *lib
                    .get::<FnZeDeviceGetComputeProperties>(b"zeDeviceGetComputeProperties\0")
                    .map_err(missing)?,
                ze_device_get_memory_properties: *lib
                    .get::<FnZeDeviceGetMemoryProperties>(b"zeDeviceGetMemoryProperties\0")
                    .map_err(missing)?,
                ze_context_create: *lib
                    .get::<FnZeContextCreate>(b"zeContextCreate\0")
                    .map_err(missing)?,
                ze_context_destroy: *lib
                    .get::<FnZeContextDestroy>(b"zeContextDestroy\0")
                    .map_err(missing)?,
                ze_module_create: *lib
                    .get::<FnZeModuleCreate>(b"zeModuleCreate\0")
                    .map_err(missing)?,
                ze_module_destroy: *lib
                    .get::<FnZeModuleDestroy>(b"zeModuleDestroy\0")
                    .map_err(missing)?,
                ze_module_build_log_get_string: *lib
                    .get::<FnZeModuleBuildLogGetString>(b"zeModuleBuildLogGetString\0")
                    .map_err(missing)?,
                ze_module_build_log_destroy: *lib
                    .get::<FnZeModuleBuildLogDestroy>(b"zeModuleBuildLogDestroy\0")
                    .map_err(missing)?,
                ze_kernel_create: *lib
                    .get::<FnZeKernelCreate>(b"zeKernelCreate\0")
                    .map_err(missing)?,
                ze_kernel_destroy: *lib
                    .get::<FnZeKernelDestroy>(b"zeKernelDestroy\0")
                    .map_err(missing)?,
                ze_kernel_get_properties: *lib
                    .get::<FnZeKernelGetProperties>(b"zeKernelGetProperties\0")
                    .map_err(missing)?,
                _lib: lib,
            };
            Ok(api)
        }
    }
}

/// Get the runtime-loaded Level Zero API.
pub fn ze_api() -> Result<&'static ZeApi, XpuError> {
    ZE_API
        .get_or_init(ZeApi::try_load)
        .as_ref()
        .map_err(|reason| XpuError::NotAvailable(reason.clone()))
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Check a Level Zero return code.
pub fn check_ze(code: ZeResult, call: &'static str) -> Result<(), XpuError> {
    if code.is_success() {
        Ok(())
    } else {
        Err(XpuError::Driver { call, code, build_log: None })
    }
}
