//! Swapchain management.
//!
//! A [`Swapchain`] owns the presentable images, one view and framebuffer per
//! image, and the main render pass they are compatible with. It is rebuilt in
//! place by [`Swapchain::recreate`] and destroyed when dropped.

use crate::driver::{AcquireOutcome, ColorPassDesc, Driver, PresentOutcome, SwapchainDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Image count requested when the surface allows it.
pub const PREFERRED_IMAGE_COUNT: u32 = 3;

/// Acquisition never blocks; a busy presentation engine is reported as
/// [`AcquireOutcome::NotReady`].
pub const ACQUIRE_TIMEOUT_NS: u64 = 0;

/// Swapchain wrapper.
pub struct Swapchain<D: Driver> {
    driver: Arc<D>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    window_extent: vk::Extent2D,
    current_image: Option<u32>,
    recreate_count: u32,
}

impl<D: Driver> Swapchain<D> {
    /// Create the swapchain for the driver's surface.
    ///
    /// `window_extent` bounds the image size when the surface does not
    /// dictate one.
    pub fn new(driver: &Arc<D>, window_extent: vk::Extent2D) -> Result<Self> {
        let mut swapchain = Self {
            driver: Arc::clone(driver),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            window_extent,
            current_image: None,
            recreate_count: 0,
        };
        if !swapchain.build()? {
            return Err(GpuError::InvalidState(
                "cannot create a swapchain for a window with no area".to_string(),
            ));
        }
        Ok(swapchain)
    }

    /// Build swapchain, views, render pass and framebuffers.
    /// Returns `false` without touching anything if the surface has no area.
    fn build(&mut self) -> Result<bool> {
        let support = self.driver.surface_support()?;
        let extent = calculate_extent(&support.capabilities, self.window_extent);
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("Surface has no area, keeping current swapchain");
            return Ok(false);
        }

        let surface_format = select_surface_format(&support.formats).ok_or_else(|| {
            GpuError::InvalidState("surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&support.present_modes);
        let min_image_count = select_image_count(&support.capabilities);

        let queues = self.driver.queues();
        let graphics_family = queues.graphics().family().index();
        let present_family = queues.present().family().index();
        let queue_families: Vec<u32> = if graphics_family == present_family {
            vec![graphics_family]
        } else {
            vec![graphics_family, present_family]
        };

        let swapchain = self.driver.create_swapchain(&SwapchainDesc {
            surface_format,
            present_mode,
            extent,
            min_image_count,
            pre_transform: support.capabilities.current_transform,
            queue_family_indices: &queue_families,
            old_swapchain: vk::SwapchainKHR::null(),
        })?;
        self.swapchain = swapchain;
        self.surface_format = surface_format;
        self.present_mode = present_mode;
        self.extent = extent;

        self.images = self.driver.swapchain_images(swapchain)?;
        self.render_pass = self.driver.create_render_pass(&main_render_pass_desc(surface_format.format))?;
        for &image in &self.images {
            let view = self.driver.create_image_view(image, surface_format.format)?;
            self.image_views.push(view);
            let framebuffer = self.driver.create_framebuffer(self.render_pass, view, extent)?;
            self.framebuffers.push(framebuffer);
        }

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            surface_format.format,
            present_mode
        );
        Ok(true)
    }

    fn destroy_resources(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.driver.destroy_framebuffer(framebuffer);
        }
        for view in self.image_views.drain(..) {
            self.driver.destroy_image_view(view);
        }
        if self.render_pass != vk::RenderPass::null() {
            self.driver.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }

    /// Tear down and rebuild everything after the device goes idle.
    ///
    /// Returns `false` if the surface has no area (a minimized window); the
    /// existing swapchain is kept until a usable size arrives.
    pub fn recreate(&mut self) -> Result<bool> {
        self.driver.wait_idle()?;

        let support = self.driver.surface_support()?;
        let extent = calculate_extent(&support.capabilities, self.window_extent);
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("Skipping swapchain recreation for zero-sized surface");
            return Ok(false);
        }

        self.current_image = None;
        self.destroy_resources();
        if !self.build()? {
            return Err(GpuError::InvalidState(
                "surface lost its area during swapchain recreation".to_string(),
            ));
        }
        self.recreate_count += 1;
        tracing::info!(count = self.recreate_count, "Swapchain recreated");
        Ok(true)
    }

    /// Record the window size used when the surface does not fix the extent.
    pub fn set_window_extent(&mut self, extent: vk::Extent2D) {
        self.window_extent = extent;
    }

    pub fn window_extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    /// Poll for the next image, signaling `signal` when it is ready.
    ///
    /// # Panics
    /// If an image is already acquired and has not been presented.
    pub fn acquire_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        assert!(
            self.current_image.is_none(),
            "swapchain image acquired twice without an intervening present"
        );
        let outcome = self
            .driver
            .acquire_next_image(self.swapchain, ACQUIRE_TIMEOUT_NS, signal)?;
        if let AcquireOutcome::Acquired(index) = outcome {
            self.current_image = Some(index);
        }
        Ok(outcome)
    }

    /// Present the acquired image on `queue` once `wait` signals.
    ///
    /// # Panics
    /// If no image is acquired.
    pub fn present_image(&mut self, queue: vk::Queue, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let Some(index) = self.current_image.take() else {
            panic!("present called without an acquired swapchain image");
        };
        self.driver.queue_present(queue, self.swapchain, index, wait)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// The render pass every framebuffer is compatible with.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn current_image_index(&self) -> Option<u32> {
        self.current_image
    }

    pub fn is_image_acquired(&self) -> bool {
        self.current_image.is_some()
    }

    /// Framebuffer of the acquired image.
    pub fn current_framebuffer(&self) -> Option<vk::Framebuffer> {
        self.current_image.map(|index| self.framebuffer(index))
    }

    /// Number of successful rebuilds since creation.
    pub fn recreate_count(&self) -> u32 {
        self.recreate_count
    }
}

impl<D: Driver> Drop for Swapchain<D> {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}

/// Clear on load, store, and hand the image to presentation.
pub fn main_render_pass_desc(format: vk::Format) -> ColorPassDesc {
    ColorPassDesc {
        format,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Select the best surface format: sRGB if offered, else the first one.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let srgb = available.iter().find(|format| {
        matches!(
            format.format,
            vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
        ) && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    if let Some(format) = srgb {
        return Some(*format);
    }

    let fallback = available.first().copied();
    if let Some(format) = fallback {
        tracing::warn!("No sRGB surface format, falling back to {:?}", format.format);
    }
    fallback
}

/// Select the best present mode: MAILBOX if offered, else FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        tracing::warn!("MAILBOX present mode unavailable, using FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Requested image count: at least [`PREFERRED_IMAGE_COUNT`], within the
/// surface limits. A `max_image_count` of zero means unbounded.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count.max(PREFERRED_IMAGE_COUNT);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessConfig, HeadlessDriver};
    use ash::vk::Handle;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        }
    }

    #[test]
    fn prefers_srgb_format() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_SRGB
        );
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            select_surface_format(&formats).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_preference() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_limits() {
        assert_eq!(select_image_count(&caps(2, 8)), 3);
        assert_eq!(select_image_count(&caps(4, 8)), 4);
        assert_eq!(select_image_count(&caps(1, 2)), 2);
        assert_eq!(select_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn extent_uses_surface_or_clamped_window() {
        let mut c = caps(2, 8);
        assert_eq!(calculate_extent(&c, extent(800, 600)), extent(800, 600));
        assert_eq!(calculate_extent(&c, extent(9000, 0)), extent(4096, 1));

        c.current_extent = extent(1280, 720);
        assert_eq!(calculate_extent(&c, extent(800, 600)), extent(1280, 720));
    }

    #[test]
    fn creation_builds_framebuffer_per_image() {
        let driver = Arc::new(HeadlessDriver::default());
        let swapchain = Swapchain::new(&driver, extent(1920, 1080)).unwrap();

        assert_eq!(swapchain.extent(), extent(1920, 1080));
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.format(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_ne!(swapchain.render_pass().as_raw(), 0);
        for index in 0..swapchain.image_count() {
            assert_ne!(swapchain.framebuffer(index).as_raw(), 0);
        }
        assert_eq!(
            driver.last_render_pass(),
            Some(main_render_pass_desc(vk::Format::B8G8R8A8_SRGB))
        );
        assert_eq!(swapchain.recreate_count(), 0);
    }

    #[test]
    fn separate_present_family_uses_concurrent_sharing() {
        use crate::queue::{QueueCapabilities, QueueFamily};

        let config = HeadlessConfig::default().with_queue_families(vec![
            QueueFamily::new(
                0,
                4,
                QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                64,
            ),
            QueueFamily::new(1, 1, QueueCapabilities::PRESENT, 0),
        ]);
        let driver = Arc::new(HeadlessDriver::new(config));
        let _swapchain = Swapchain::new(&driver, extent(640, 480)).unwrap();
        assert_eq!(driver.last_swapchain_queue_families(), vec![0, 1]);
    }

    #[test]
    fn recreate_is_idempotent_under_stable_surface() {
        let driver = Arc::new(HeadlessDriver::default());
        let mut swapchain = Swapchain::new(&driver, extent(1024, 768)).unwrap();

        assert!(swapchain.recreate().unwrap());
        let first = (swapchain.image_count(), swapchain.extent());
        assert!(swapchain.recreate().unwrap());
        let second = (swapchain.image_count(), swapchain.extent());

        assert_eq!(first, second);
        assert_eq!(swapchain.recreate_count(), 2);
    }

    #[test]
    fn zero_sized_window_keeps_swapchain() {
        let driver = Arc::new(HeadlessDriver::default());
        let mut swapchain = Swapchain::new(&driver, extent(800, 600)).unwrap();
        let handle = swapchain.handle();

        driver.set_window_extent(0, 0);
        swapchain.set_window_extent(extent(0, 0));
        assert!(!swapchain.recreate().unwrap());
        assert_eq!(swapchain.handle(), handle);
        assert_eq!(swapchain.recreate_count(), 0);
    }

    #[test]
    fn acquire_then_present() {
        let driver = Arc::new(HeadlessDriver::default());
        let mut swapchain = Swapchain::new(&driver, extent(800, 600)).unwrap();
        let queue = driver.queues().present().handle();

        let outcome = swapchain.acquire_image(vk::Semaphore::null()).unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired(0));
        assert!(swapchain.is_image_acquired());
        assert_eq!(swapchain.current_framebuffer(), Some(swapchain.framebuffer(0)));

        let outcome = swapchain.present_image(queue, vk::Semaphore::null()).unwrap();
        assert_eq!(outcome, PresentOutcome::Presented);
        assert!(!swapchain.is_image_acquired());
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn double_acquire_panics() {
        let driver = Arc::new(HeadlessDriver::default());
        let mut swapchain = Swapchain::new(&driver, extent(800, 600)).unwrap();
        swapchain.acquire_image(vk::Semaphore::null()).unwrap();
        let _ = swapchain.acquire_image(vk::Semaphore::null());
    }

    #[test]
    #[should_panic(expected = "without an acquired swapchain image")]
    fn present_without_acquire_panics() {
        let driver = Arc::new(HeadlessDriver::default());
        let mut swapchain = Swapchain::new(&driver, extent(800, 600)).unwrap();
        let _ = swapchain.present_image(vk::Queue::null(), vk::Semaphore::null());
    }

    #[test]
    fn drop_releases_everything() {
        let driver = Arc::new(HeadlessDriver::default());
        let swapchain = Swapchain::new(&driver, extent(800, 600)).unwrap();
        assert!(driver.live_object_count() > 0);
        drop(swapchain);
        assert_eq!(driver.live_object_count(), 0);
    }
}
