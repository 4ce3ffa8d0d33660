//! The driver seam.
//!
//! Everything above this trait (pools, swapchain, [`GraphicsContext`]) talks
//! to the GPU only through [`Driver`]. Handles are plain `ash::vk` handles;
//! the driver owns the device and the surface.
//!
//! [`GraphicsContext`]: crate::context::GraphicsContext

use crate::descriptors::DescriptorBinding;
use crate::error::Result;
use crate::queue::QueueContainer;
use ash::vk;

/// Result of polling the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; the semaphore will be signaled.
    Acquired(u32),
    /// An image was acquired but the swapchain no longer matches the surface.
    Suboptimal(u32),
    /// No image is available yet.
    NotReady,
    /// The swapchain can no longer be used.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Surface properties queried from the device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Parameters for swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainDesc<'a> {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Families sharing the images. More than one selects concurrent sharing.
    pub queue_family_indices: &'a [u32],
    pub old_swapchain: vk::SwapchainKHR,
}

/// A single color attachment render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorPassDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
}

/// A layout transition for a single-mip color or depth image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageBarrier {
    /// Transition a color image between layouts with the given scopes.
    pub fn color(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: (vk::PipelineStageFlags, vk::AccessFlags),
        dst: (vk::PipelineStageFlags, vk::AccessFlags),
    ) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout,
            new_layout,
            src_access: src.1,
            dst_access: dst.1,
            src_stage: src.0,
            dst_stage: dst.0,
        }
    }
}

/// Device operations used by the context layer.
///
/// Methods returning `Result` fail only on fatal driver errors; swapchain
/// staleness is reported through [`AcquireOutcome`] and [`PresentOutcome`].
/// Destroy methods must only be called for objects created by the same driver
/// that the GPU no longer uses.
pub trait Driver: Send + Sync + 'static {
    /// Queues owned by the logical device.
    fn queues(&self) -> &QueueContainer;

    /// Block until all queues are idle.
    fn wait_idle(&self) -> Result<()>;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `false` if `timeout_ns` elapsed before the fence signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn fence_status(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Create a transient command pool for `family_index`.
    fn create_command_pool(&self, family_index: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Reset the pool, releasing the memory of every buffer allocated from it.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    /// Allocate `count` primary command buffers.
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    /// Begin one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    );
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_set_viewport_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D);

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;

    fn surface_support(&self) -> Result<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc<'_>) -> Result<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_render_pass(&self, desc: &ColorPassDesc) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachment: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome>;
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;
}
