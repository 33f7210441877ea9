//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant here is fatal to the caller: this layer has no retry or
/// degraded-mode path. Errors propagate to the load/boot code that detects
/// them and terminate the process with the diagnostic.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    // Device selection failures terminate the process with these messages;
    // the missing-extension case must name the extension, not just the GPU.
    #[test]
    fn device_selection_errors_name_the_cause() {
        let missing =
            GpuError::ExtensionNotSupported("VK_KHR_acceleration_structure".to_string());
        assert_eq!(
            missing.to_string(),
            "Required extension not supported: VK_KHR_acceleration_structure"
        );
        assert_eq!(
            GpuError::NoSuitableDevice.to_string(),
            "No suitable GPU found"
        );
    }
}
