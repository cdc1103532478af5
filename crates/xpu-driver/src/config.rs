//! Environment-driven loader configuration.

use crate::driver::ModuleFormat;

/// Selects native machine code instead of SPIR-V for `load_binary`.
pub const ENV_GEN_NATIVE_CODE: &str = "TRITON_XPU_GEN_NATIVE_CODE";

/// Enables diagnostic messages (e.g. the large-GRF recompilation notice).
pub const ENV_DEBUG: &str = "TRITON_DEBUG";

/// Knobs read from the process environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Kernel images are device machine code rather than SPIR-V.
    pub native_code: bool,

    /// Emit diagnostic messages at `info` level.
    pub debug: bool,
}

impl LoaderConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).as_deref().and_then(parse_env_bool).unwrap_or(false);
        Self {
            native_code: flag(ENV_GEN_NATIVE_CODE),
            debug: flag(ENV_DEBUG),
        }
    }

    /// Format that `load_binary` hands to the driver.
    pub fn module_format(&self) -> ModuleFormat {
        if self.native_code {
            ModuleFormat::Native
        } else {
            ModuleFormat::SpirV
        }
    }
}

/// Parse a boolean-like environment value. Unrecognized values are `None`.
pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
