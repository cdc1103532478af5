//! Error types for driver-binding operations.

use crate::ffi::ZeResult;

/// Result type for driver-binding operations.
pub type Result<T> = std::result::Result<T, XpuError>;

/// Errors surfaced by the binding layer.
#[derive(Debug, thiserror::Error)]
pub enum XpuError {
    /// The Level Zero loader library could not be opened or is incomplete.
    #[error("Level Zero not available: {0}")]
    NotAvailable(String),

    /// A malformed handle or argument, rejected before any driver call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Device id outside the registry.
    #[error("device {device_id} is not found ({count} devices registered)")]
    DeviceNotFound { device_id: i64, count: usize },

    /// A driver call returned a non-success status.
    #[error("{call} failed: {code}{}", build_log_suffix(.build_log))]
    Driver {
        call: &'static str,
        code: ZeResult,
        build_log: Option<String>,
    },
}

fn build_log_suffix(log: &Option<String>) -> String {
    match log.as_deref().map(str::trim) {
        Some(log) if !log.is_empty() => format!("\n{}", log),
        _ => String::new(),
    }
}

impl XpuError {
    /// The driver status code, if this error came from a driver call.
    pub fn driver_code(&self) -> Option<ZeResult> {
        match self {
            XpuError::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}
