//! Graphics context: device, swapchain and frames in flight.
//!
//! [`GraphicsContext`] drives the per-frame protocol consumed by renderers:
//!
//! ```text
//! begin_frame()            wait slot fence, reset slot pools, acquire image
//!   get_current_frame_command_pool(..).get_command_buffer()
//!   ... record ...
//!   submit_command_buffer(cb)
//! end_frame()              submit batches, signal fence, present
//! ```
//!
//! A stale swapchain at acquire or present rebuilds the swapchain and every
//! frame slot; the frame is reported as [`FrameBegin::Recreated`] or
//! [`FrameEnd::Recreated`] and its work is dropped.

use crate::capabilities::DeviceRequirements;
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptors::{DescriptorPool, DescriptorPoolBudget};
use crate::driver::{AcquireOutcome, Driver, PresentOutcome, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::frame::FrameSlot;
use crate::queue::{QueueCapability, QueueFamily};
use crate::swapchain::Swapchain;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Graphics context configuration.
#[derive(Debug, Clone)]
pub struct GraphicsConfig {
    /// Frames the CPU may record ahead of the GPU. Must be at least 1.
    pub frames_in_flight: usize,
    /// Capacity of the shared descriptor pool.
    pub descriptor_budget: DescriptorPoolBudget,
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable validation layers.
    pub validation: bool,
    /// What the physical device must support.
    pub requirements: DeviceRequirements,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            descriptor_budget: DescriptorPoolBudget::default(),
            app_name: "Ember".to_string(),
            validation: cfg!(debug_assertions),
            requirements: DeviceRequirements::default(),
        }
    }
}

impl GraphicsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_descriptor_budget(mut self, budget: DescriptorPoolBudget) -> Self {
        self.descriptor_budget = budget;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn with_requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// New framebuffer size reported by the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowResized {
    pub width: u32,
    pub height: u32,
}

/// Information about the frame that was just begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame slot in `0..frames_in_flight`.
    pub frame_index: usize,
    /// Acquired swapchain image.
    pub image_index: u32,
    /// Frames presented or attempted before this one.
    pub frame_number: u64,
    pub extent: vk::Extent2D,
}

/// Result of [`GraphicsContext::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBegin {
    /// Record and submit, then call [`GraphicsContext::end_frame`].
    Ready(FrameInfo),
    /// The swapchain was rebuilt; try again next iteration.
    Recreated,
    /// The window has no area; nothing can be presented.
    Skipped,
}

/// Result of [`GraphicsContext::end_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    Presented,
    /// Presentation failed and the swapchain was rebuilt. The frame is lost.
    Recreated,
}

/// Work submitted by the last completed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub command_buffers: u32,
    pub commands: u32,
}

/// Top-level GPU orchestrator.
pub struct GraphicsContext<D: Driver> {
    // Fields drop in declaration order: slots, descriptor pool, swapchain, driver.
    pending: Vec<CommandBuffer<D>>,
    frames: Vec<FrameSlot<D>>,
    descriptor_pool: DescriptorPool<D>,
    swapchain: Swapchain<D>,
    driver: Arc<D>,
    frames_in_flight: usize,
    current_frame: usize,
    frame_number: u64,
    in_frame: bool,
    minimized: bool,
    stats: FrameStats,
}

impl<D: Driver> GraphicsContext<D> {
    /// Build the swapchain, descriptor pool and frame slots on `driver`.
    ///
    /// # Panics
    /// If `config.frames_in_flight` is zero.
    pub fn new(driver: Arc<D>, config: &GraphicsConfig, window_extent: vk::Extent2D) -> Result<Self> {
        assert!(
            config.frames_in_flight >= 1,
            "frames_in_flight must be at least 1"
        );

        let swapchain = Swapchain::new(&driver, window_extent)?;
        let descriptor_pool = DescriptorPool::new(&driver, config.descriptor_budget)?;
        let frames = build_frames(&driver, config.frames_in_flight)?;

        tracing::info!(
            frames_in_flight = config.frames_in_flight,
            families = ?driver.queues().family_indices_in_use(),
            "Graphics context created"
        );

        Ok(Self {
            pending: Vec::new(),
            frames,
            descriptor_pool,
            swapchain,
            driver,
            frames_in_flight: config.frames_in_flight,
            current_frame: 0,
            frame_number: 0,
            in_frame: false,
            minimized: false,
            stats: FrameStats::default(),
        })
    }

    /// Start a frame.
    ///
    /// Blocks until the slot about to be reused is retired by the GPU, resets
    /// its command pools and polls for the next swapchain image.
    ///
    /// # Panics
    /// If called again before [`end_frame`](Self::end_frame).
    pub fn begin_frame(&mut self) -> Result<FrameBegin> {
        assert!(!self.in_frame, "begin_frame called twice without end_frame");
        if self.minimized {
            return Ok(FrameBegin::Skipped);
        }

        let slot = &mut self.frames[self.current_frame];
        slot.wait()?;
        slot.reset_command_pools()?;
        let image_available = slot.image_available();

        match self.swapchain.acquire_image(image_available)? {
            AcquireOutcome::Acquired(image_index) => {
                self.in_frame = true;
                Ok(FrameBegin::Ready(FrameInfo {
                    frame_index: self.current_frame,
                    image_index,
                    frame_number: self.frame_number,
                    extent: self.swapchain.extent(),
                }))
            }
            outcome => {
                tracing::debug!(?outcome, "Swapchain acquire failed, recreating");
                self.recreate()?;
                Ok(FrameBegin::Recreated)
            }
        }
    }

    /// Queue a recorded command buffer for submission at [`end_frame`](Self::end_frame).
    ///
    /// # Panics
    /// Outside of a frame, or if recording has not ended.
    pub fn submit_command_buffer(&mut self, command_buffer: CommandBuffer<D>) {
        assert!(self.in_frame, "command buffer submitted outside of a frame");
        assert!(
            command_buffer.is_executable(),
            "command buffer submitted while still recording"
        );
        debug_assert!(
            self.frames[self.current_frame]
                .command_pool(command_buffer.handle().family_index())
                .is_some_and(|pool| pool.resolve(command_buffer.handle()) == command_buffer.raw()),
            "command buffer does not belong to the current frame"
        );
        self.pending.push(command_buffer);
    }

    /// Submit the frame's work and present the acquired image.
    ///
    /// # Panics
    /// If no frame was begun.
    pub fn end_frame(&mut self) -> Result<FrameEnd> {
        assert!(self.in_frame, "end_frame called without begin_frame");
        self.in_frame = false;

        self.submit_pending()?;

        let render_finished = self.frames[self.current_frame].render_finished();
        let present_queue = self.driver.queues().present().handle();
        let outcome = self.swapchain.present_image(present_queue, render_finished)?;

        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        self.frame_number += 1;

        match outcome {
            PresentOutcome::Presented => Ok(FrameEnd::Presented),
            outcome => {
                tracing::debug!(?outcome, "Present failed, recreating");
                self.recreate()?;
                Ok(FrameEnd::Recreated)
            }
        }
    }

    fn submit_pending(&mut self) -> Result<()> {
        let mut batches: BTreeMap<u32, Vec<vk::CommandBuffer>> = BTreeMap::new();
        let mut stats = FrameStats::default();
        for command_buffer in self.pending.drain(..) {
            stats.command_buffers += 1;
            stats.commands += command_buffer.command_count();
            batches
                .entry(command_buffer.handle().family_index())
                .or_default()
                .push(command_buffer.raw());
        }

        let queues = self.driver.queues();
        let graphics = queues.graphics();
        let slot = &self.frames[self.current_frame];

        let mut waits = vec![slot.image_available()];
        let mut wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let mut graphics_buffers = Vec::new();

        for (family, buffers) in batches {
            if family == graphics.family().index() {
                graphics_buffers = buffers;
                continue;
            }
            let queue = queues.by_family_index(family).ok_or_else(|| {
                GpuError::InvalidState(format!("no queue for family {family}"))
            })?;
            let signal = slot.family_semaphore(family).ok_or_else(|| {
                GpuError::InvalidState(format!("no semaphore for family {family}"))
            })?;
            self.driver.queue_submit(
                queue.handle(),
                &SubmitBatch {
                    command_buffers: &buffers,
                    signal_semaphores: &[signal],
                    ..Default::default()
                },
            )?;
            waits.push(signal);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }

        // The fence covers every submission made under this slot.
        slot.in_flight().reset()?;
        self.driver.queue_submit(
            graphics.handle(),
            &SubmitBatch {
                command_buffers: &graphics_buffers,
                wait_semaphores: &waits,
                wait_stages: &wait_stages,
                signal_semaphores: &[slot.render_finished()],
                fence: Some(slot.in_flight().handle()),
            },
        )?;

        self.stats = stats;
        Ok(())
    }

    /// Rebuild the swapchain and every frame slot.
    fn recreate(&mut self) -> Result<()> {
        self.pending.clear();
        self.in_frame = false;

        if !self.swapchain.recreate()? {
            self.minimized = true;
            return Ok(());
        }

        self.frames.clear();
        self.frames = build_frames(&self.driver, self.frames_in_flight)?;
        self.current_frame = 0;
        Ok(())
    }

    /// React to a new window size.
    ///
    /// # Panics
    /// If called between [`begin_frame`](Self::begin_frame) and
    /// [`end_frame`](Self::end_frame).
    pub fn on_window_resize(&mut self, event: WindowResized) -> Result<()> {
        assert!(!self.in_frame, "window resize handled mid-frame");
        self.swapchain.set_window_extent(vk::Extent2D {
            width: event.width,
            height: event.height,
        });

        if event.width == 0 || event.height == 0 {
            tracing::debug!("Window minimized, pausing frames");
            self.minimized = true;
            return Ok(());
        }

        self.minimized = false;
        self.recreate()
    }

    /// Block until the GPU is idle.
    pub fn wait_for_device(&self) -> Result<()> {
        self.driver.wait_idle()
    }

    /// Command pool of the current frame for the queue serving `capability`.
    ///
    /// With `exclusive`, a family dedicated to `capability` is used when the
    /// device has one.
    ///
    /// # Panics
    /// Outside of a frame.
    pub fn get_current_frame_command_pool(
        &mut self,
        capability: QueueCapability,
        exclusive: bool,
    ) -> &mut CommandPool<D> {
        assert!(self.in_frame, "command pool requested outside of a frame");
        let family = self.driver.queues().get(capability, exclusive).family().index();
        match self.frames[self.current_frame].command_pool_mut(family) {
            Some(pool) => pool,
            None => unreachable!("frame slot has no command pool for family {family}"),
        }
    }

    /// Allocator for persistent descriptor sets.
    pub fn get_descriptor_pool(&mut self) -> &mut DescriptorPool<D> {
        &mut self.descriptor_pool
    }

    /// Render pass compatible with every swapchain framebuffer.
    pub fn get_main_render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    /// Framebuffer of the image acquired by [`begin_frame`](Self::begin_frame).
    ///
    /// # Panics
    /// If no image is acquired.
    pub fn get_main_framebuffer(&self) -> vk::Framebuffer {
        match self.swapchain.current_framebuffer() {
            Some(framebuffer) => framebuffer,
            None => panic!("main framebuffer requested without an acquired image"),
        }
    }

    /// Work submitted by the last completed frame.
    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Frames presented or attempted since creation.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }
}

impl<D: Driver> Drop for GraphicsContext<D> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.wait_idle() {
            tracing::error!("Device wait failed during shutdown: {err}");
        }
    }
}

fn build_frames<D: Driver>(driver: &Arc<D>, count: usize) -> Result<Vec<FrameSlot<D>>> {
    let queues = driver.queues();
    let families: Vec<QueueFamily> = queues
        .family_indices_in_use()
        .into_iter()
        .filter_map(|index| queues.by_family_index(index).map(|queue| *queue.family()))
        .collect();
    let graphics_family = queues.graphics().family().index();

    (0..count)
        .map(|_| FrameSlot::new(driver, &families, graphics_family))
        .collect()
}
