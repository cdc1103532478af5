//! Kernel-binary loading with the large-GRF spill fallback.
//!
//! A SPIR-V kernel that spills more than `MAX_REG_SPILL` bytes, and whose
//! build flags leave the register-file mode to the compiler, is rebuilt once
//! with 256 GRF per thread. There is no further escalation.

use std::fmt;
use std::sync::Arc;

use crate::driver::{Driver, ModuleFormat};
use crate::error::Result;
use crate::handle::{ContextHandle, DeviceHandle, Kernel, Module};

/// Spill size above which a SPIR-V kernel is rebuilt in large-GRF mode.
pub const MAX_REG_SPILL: u32 = 1000;

/// Build flag selecting the large register file.
pub const LARGE_GRF_FLAG: &str = "-cl-intel-256-GRF-per-thread";

const GRF_MODE_FLAGS: [&str; 3] = [
    "-cl-intel-256-GRF-per-thread",
    "-cl-intel-128-GRF-per-thread",
    "-cl-intel-enable-auto-large-GRF-mode",
];

/// Inputs of a `load_binary` call.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    /// Kernel entry point to extract.
    pub name: &'a str,
    /// SPIR-V or native image.
    pub image: &'a [u8],
    /// Accepted from the host; it has no effect on the build.
    pub shared: bool,
    pub build_flags: &'a str,
}

/// A loaded module and kernel, plus the compiler's register figures.
#[derive(Debug)]
pub struct LoadedKernel {
    pub module: Module,
    pub kernel: Kernel,
    /// Always 0: the driver does not report register usage.
    pub n_regs: u32,
    pub n_spills: u32,
    /// The large-GRF rebuild ran.
    pub recompiled: bool,
}

/// Whether the build flags already pick a register-file mode.
pub fn grf_mode_specified(build_flags: &str) -> bool {
    GRF_MODE_FLAGS.iter().any(|flag| build_flags.contains(flag))
}

/// Build `request` for `device` in `context`.
///
/// Every native object created along the way is owned immediately, so an
/// error at any step releases whatever was built before it.
pub fn load(
    driver: &Arc<dyn Driver>,
    context: ContextHandle,
    device: DeviceHandle,
    format: ModuleFormat,
    request: &LoadRequest<'_>,
    debug: bool,
) -> Result<LoadedKernel> {
    tracing::debug!(
        "loading kernel \"{}\" ({} bytes, {:?}, shared={}) flags=\"{}\"",
        request.name,
        request.image.len(),
        format,
        request.shared,
        request.build_flags,
    );

    let (mut module, mut kernel, mut n_spills) =
        build(driver, context, device, format, request.image, request.build_flags, request.name)?;
    let mut recompiled = false;

    if format == ModuleFormat::SpirV
        && !grf_mode_specified(request.build_flags)
        && n_spills > MAX_REG_SPILL
    {
        notice(
            debug,
            format_args!(
                "(I): Detected {} spills, recompiling kernel \"{}\" using large GRF mode",
                n_spills, request.name
            ),
        );

        let flags = format!("{} {}", request.build_flags, LARGE_GRF_FLAG);
        let (m, k, s) = build(driver, context, device, format, request.image, &flags, request.name)?;
        // The first build's kernel and module are released here.
        kernel = k;
        module = m;
        n_spills = s;
        recompiled = true;

        notice(debug, format_args!("(I): Kernel has now {} spills", n_spills));
    }

    Ok(LoadedKernel { module, kernel, n_regs: 0, n_spills, recompiled })
}

fn build(
    driver: &Arc<dyn Driver>,
    context: ContextHandle,
    device: DeviceHandle,
    format: ModuleFormat,
    image: &[u8],
    build_flags: &str,
    name: &str,
) -> Result<(Module, Kernel, u32)> {
    let handle = driver.create_module(context, device, format, image, build_flags)?;
    let module = Module::from_owned(Arc::clone(driver), handle);
    let kernel = module.create_kernel(name)?;
    let n_spills = kernel.properties()?.spill_mem_size;
    Ok((module, kernel, n_spills))
}

/// Level the large-GRF notice is emitted at when `TRITON_DEBUG` is set.
/// Without it the notice drops to `debug`, below a subscriber installed here.
pub const NOTICE_LEVEL: tracing::Level = tracing::Level::INFO;

fn notice(debug: bool, msg: fmt::Arguments<'_>) {
    if debug {
        tracing::info!("{}", msg);
    } else {
        tracing::debug!("{}", msg);
    }
}
