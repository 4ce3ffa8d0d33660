//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Swapchain staleness is not an error at this layer; it is reported as an
/// acquire/present outcome and handled by recreation.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A driver call failed with a status unrelated to swapchain staleness.
    #[error("{call} failed: {result:?}")]
    Vulkan {
        /// Name of the failing driver call.
        call: &'static str,
        /// Status returned by the driver.
        result: vk::Result,
    },

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No physical device satisfies the requirements.
    #[error("No suitable GPU found (candidates: {0})")]
    NoSuitableDevice(String),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// A fixed-size pool ran out of room.
    #[error("{resource} capacity exhausted: requested {requested}, capacity {capacity}")]
    CapacityExhausted {
        /// What ran out (e.g. `"descriptor sets"`, `"ConstantBuffer descriptors"`).
        resource: String,
        /// Total that would have been in use after the request.
        requested: u32,
        /// Declared budget.
        capacity: u32,
    },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Wrap a driver status with the name of the call that produced it.
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        Self::Vulkan { call, result }
    }

    /// Returns `true` for pool exhaustion errors.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}

/// Attach the failing call name to a raw `vk::Result`.
pub(crate) trait VkResultExt<T> {
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::vulkan(call, result))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_names_call_and_status() {
        let err = GpuError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        let msg = err.to_string();
        assert!(msg.contains("vkQueueSubmit"));
        assert!(msg.contains("DEVICE_LOST"));
    }

    #[test]
    fn capacity_is_flagged() {
        let err = GpuError::CapacityExhausted {
            resource: "descriptor sets".to_string(),
            requested: 5,
            capacity: 4,
        };
        assert!(err.is_capacity());
        assert!(!GpuError::InvalidState("x".into()).is_capacity());
    }
}
