//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ember_gpu::vk;
use ember_gpu::{GraphicsConfig, GraphicsContext, VulkanDriver};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// Frame orchestration over the window's device.
    ///
    /// Declared before `window` so the surface is destroyed first.
    pub graphics: GraphicsContext<VulkanDriver>,
    /// The window handle.
    pub window: Arc<Window>,
    /// Frames presented.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the device and graphics context for `window`.
    pub(crate) fn new(window: Arc<Window>, config: &GraphicsConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width.max(1),
            height: size.height.max(1),
        };

        let driver = Arc::new(VulkanDriver::new(window.as_ref(), config)?);
        let graphics = GraphicsContext::new(driver, config, extent)?;

        Ok(Self {
            graphics,
            window,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.graphics.swapchain().extent()
    }
}
