//! GPU context layer for the Ember engine.
//!
//! This crate provides:
//! - Vulkan instance, device and queue selection
//! - Per-frame command pools with batched submission
//! - Descriptor pools with declared budgets
//! - Swapchain management with automatic recreation
//! - A headless driver for running the frame protocol without a GPU
//!
//! Everything above [`driver::Driver`] is generic over the backend, so
//! renderers can be tested against [`HeadlessDriver`] and shipped on
//! [`VulkanDriver`].

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod driver;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod instance;
pub mod queue;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use ash::vk;
pub use capabilities::{DeviceFeatures, DeviceRequirements, GpuVendor, PhysicalDeviceInfo};
pub use command::{CommandBuffer, CommandBufferHandle, CommandPool};
pub use context::{
    FrameBegin, FrameEnd, FrameInfo, FrameStats, GraphicsConfig, GraphicsContext, WindowResized,
    MAX_FRAMES_IN_FLIGHT,
};
pub use descriptors::{
    DescriptorPool, DescriptorPoolBudget, DescriptorSet, DescriptorSetHandle, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorType,
};
pub use driver::{AcquireOutcome, Driver, ImageBarrier, PresentOutcome};
pub use error::{GpuError, Result};
#[cfg(any(test, feature = "headless"))]
pub use headless::{GpuCompletion, HeadlessConfig, HeadlessDriver, HeadlessSurface};
pub use queue::{QueueCapabilities, QueueCapability, QueueFamily, QueueFamilyContainer};
pub use swapchain::Swapchain;
pub use vulkan::VulkanDriver;
