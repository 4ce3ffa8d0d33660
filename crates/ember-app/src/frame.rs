//! Per-frame context for rendering.

use ember_gpu::vk;
use ember_gpu::FrameInfo;

/// The frame currently being recorded.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Slot, image and extent reported by `begin_frame`.
    pub info: FrameInfo,
    /// Delta time since last frame in seconds.
    pub dt: f32,
}

impl FrameContext {
    pub(crate) fn new(info: FrameInfo, dt: f32) -> Self {
        Self { info, dt }
    }

    /// Index of the acquired swapchain image.
    pub fn image_index(&self) -> u32 {
        self.info.image_index
    }

    pub fn frame_number(&self) -> u64 {
        self.info.frame_number
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }
}
