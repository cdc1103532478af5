use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;

use xpu_driver::{
    DeviceProperties, DriverSession, LevelZero, LoadRequest, LoaderConfig, ModuleFormat,
    QueueHandle, XpuError,
};

/// Queue identity the CLI binds all devices through.
const CLI_QUEUE: u64 = 0x1;

#[derive(Parser)]
#[command(
    name = "xpu",
    about = "Probe Intel GPUs through Level Zero",
    long_about = "Enumerate Level Zero devices, print the capability figures the kernel\ncompiler tunes against, and try loading kernel images.\n\nHonors TRITON_XPU_GEN_NATIVE_CODE and TRITON_DEBUG like the Python module.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List devices and their properties
    Devices {
        /// Print a JSON array instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load a kernel image and report its spill figures
    Load {
        /// Path to the SPIR-V (or native, with TRITON_XPU_GEN_NATIVE_CODE=1) image
        image: PathBuf,
        /// Kernel entry point name
        #[arg(long)]
        kernel: String,
        /// Driver build flags
        #[arg(long, default_value = "")]
        flags: String,
        /// Device id
        #[arg(long, default_value = "0")]
        device: i64,
        /// Print a JSON object instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = LoaderConfig::from_env();
    init_logging(&config);

    let result = match cli.command {
        Commands::Devices { json } => cmd_devices(json),
        Commands::Load { image, kernel, flags, device, json } => {
            cmd_load(&image, &kernel, &flags, device, json)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoaderConfig) {
    let level = if config.debug { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}

#[derive(Serialize)]
struct DeviceReport {
    id: usize,
    name: String,
    #[serde(flatten)]
    properties: DeviceProperties,
}

#[derive(Serialize)]
struct LoadReport<'a> {
    kernel: &'a str,
    format: ModuleFormat,
    n_spills: u32,
    recompiled: bool,
}

fn print_json(value: &impl Serialize) -> Result<(), XpuError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| XpuError::InvalidArgument(format!("cannot encode report: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn open_session() -> Result<DriverSession, XpuError> {
    let lz = LevelZero::new()?;
    let mut session = DriverSession::new(Arc::new(lz));
    session.init_devices(QueueHandle::from_raw(CLI_QUEUE)?)?;
    Ok(session)
}

fn cmd_devices(json: bool) -> Result<(), XpuError> {
    let session = open_session()?;

    let mut reports = Vec::with_capacity(session.device_count());
    for (id, dev) in session.devices().iter().enumerate() {
        let name = session.driver().device_properties(dev.native)?.name;
        let properties = session.device_properties(id as i64)?;
        reports.push(DeviceReport { id, name, properties });
    }
    if json {
        return print_json(&reports);
    }

    println!("{} device(s)", reports.len());
    for DeviceReport { id, name, properties: props } in &reports {
        let native = session.devices()[*id].native;
        println!();
        println!("[{}] {} ({:?})", id, name, native);
        println!("  multiprocessor_count  {}", props.multiprocessor_count);
        println!("  sm_clock_rate         {} MHz", props.sm_clock_rate);
        println!("  max_shared_mem        {} bytes", props.max_shared_mem);
        println!("  max_work_group_size   {}", props.max_work_group_size);
        println!("  sub_group_sizes       {:?}", props.sub_group_sizes);
        println!("  mem_clock_rate        {} MHz", props.mem_clock_rate);
        println!("  mem_bus_width         {} bits", props.mem_bus_width);
    }
    Ok(())
}

fn cmd_load(
    image: &Path,
    kernel: &str,
    flags: &str,
    device: i64,
    json: bool,
) -> Result<(), XpuError> {
    let bytes = std::fs::read(image).map_err(|e| {
        XpuError::InvalidArgument(format!("cannot read {}: {}", image.display(), e))
    })?;
    let session = open_session()?;

    let request = LoadRequest { name: kernel, image: &bytes, shared: false, build_flags: flags };
    let format = session.config().module_format();
    let loaded = session.load_binary(device, &request)?;
    let report = LoadReport {
        kernel: loaded.kernel.name(),
        format,
        n_spills: loaded.n_spills,
        recompiled: loaded.recompiled,
    };
    if json {
        return print_json(&report);
    }

    println!("kernel      {}", report.kernel);
    println!("format      {:?}", report.format);
    println!("spills      {} bytes", report.n_spills);
    println!("large GRF   {}", if report.recompiled { "yes (rebuilt)" } else { "no" });
    Ok(())
}
