//! Deterministic in-memory driver.
//!
//! [`HeadlessDriver`] fabricates handles, simulates a window surface and a
//! GPU that either completes work at submission or only when told to, and
//! records what was asked of it. Semaphore misuse (waiting on something never
//! signaled) and unknown destroys are collected as violations rather than
//! panicking, so tests can assert on them.

use crate::descriptors::DescriptorBinding;
use crate::driver::{
    AcquireOutcome, ColorPassDesc, Driver, ImageBarrier, PresentOutcome, SubmitBatch,
    SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, Result};
use crate::queue::{
    select_exclusive_queue_families, select_queue_families, QueueCapabilities, QueueContainer,
    QueueFamily, QueueFamilyContainer,
};
use crate::swapchain::calculate_extent;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// When submitted work is considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuCompletion {
    /// Every submission completes as soon as it is made.
    #[default]
    Immediate,
    /// Submissions complete only through
    /// [`HeadlessDriver::complete_next_submission`] or a device-idle wait.
    Manual,
}

/// Simulated surface properties.
#[derive(Debug, Clone)]
pub struct HeadlessSurface {
    pub min_image_count: u32,
    pub max_image_count: u32,
    pub min_image_extent: vk::Extent2D,
    pub max_image_extent: vk::Extent2D,
    /// Whether the surface reports the window size as its current extent.
    /// If not, the extent is left to the swapchain (`u32::MAX`).
    pub fixed_extent: bool,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Default for HeadlessSurface {
    fn default() -> Self {
        Self {
            min_image_count: 2,
            max_image_count: 8,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 8192,
                height: 8192,
            },
            fixed_extent: true,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }
}

/// Headless driver configuration.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub queue_families: Vec<QueueFamily>,
    pub window_extent: vk::Extent2D,
    pub surface: HeadlessSurface,
    pub completion: GpuCompletion,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            queue_families: vec![
                QueueFamily::new(0, 16, QueueCapabilities::all(), 64),
                QueueFamily::new(1, 2, QueueCapabilities::TRANSFER, 64),
            ],
            window_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            surface: HeadlessSurface::default(),
            completion: GpuCompletion::Immediate,
        }
    }
}

impl HeadlessConfig {
    pub fn with_queue_families(mut self, families: Vec<QueueFamily>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_window_extent(mut self, width: u32, height: u32) -> Self {
        self.window_extent = vk::Extent2D { width, height };
        self
    }

    pub fn with_surface(mut self, surface: HeadlessSurface) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_completion(mut self, completion: GpuCompletion) -> Self {
        self.completion = completion;
        self
    }
}

/// A submission as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Semaphore,
    Fence,
    CommandPool,
    DescriptorSetLayout,
    DescriptorPool,
    Swapchain,
    ImageView,
    RenderPass,
    Framebuffer,
}

#[derive(Debug)]
struct SwapchainState {
    extent: vk::Extent2D,
    image_count: u32,
    next_image: u32,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    swapchains: HashMap<u64, SwapchainState>,
    in_flight: VecDeque<Option<vk::Fence>>,
    window_extent: vk::Extent2D,
    acquire_injections: VecDeque<AcquireOutcome>,
    present_injections: VecDeque<PresentOutcome>,
    submissions: Vec<SubmitRecord>,
    violations: Vec<String>,
    recorded_commands: u64,
    descriptor_sets_allocated: u64,
    swapchains_created: u64,
    acquires: u64,
    presents: u64,
    blocked_fence_waits: u64,
    last_render_pass: Option<ColorPassDesc>,
    last_swapchain_families: Vec<u32>,
}

impl State {
    fn fabricate<H: Handle>(&mut self, kind: ObjectKind) -> H {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, kind);
        H::from_raw(raw)
    }

    fn raw_handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn destroy(&mut self, raw: u64, kind: ObjectKind) {
        match self.live.remove(&raw) {
            Some(found) if found == kind => {}
            Some(found) => self
                .violations
                .push(format!("destroyed {found:?} 0x{raw:x} as {kind:?}")),
            None => self
                .violations
                .push(format!("destroyed unknown {kind:?} 0x{raw:x}")),
        }
    }

    fn signal(&mut self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() {
            self.semaphores.insert(semaphore.as_raw(), true);
        }
    }

    fn consume(&mut self, semaphore: vk::Semaphore, waiter: &str) {
        if semaphore == vk::Semaphore::null() {
            return;
        }
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violations.push(format!(
                "{waiter} waits on unsignaled semaphore 0x{:x}",
                semaphore.as_raw()
            )),
            None => self.violations.push(format!(
                "{waiter} waits on unknown semaphore 0x{:x}",
                semaphore.as_raw()
            )),
        }
    }

    fn retire_next(&mut self) -> bool {
        match self.in_flight.pop_front() {
            Some(fence) => {
                if let Some(fence) = fence {
                    self.fences.insert(fence.as_raw(), true);
                }
                true
            }
            None => false,
        }
    }
}

/// In-memory [`Driver`] for tests and headless runs.
pub struct HeadlessDriver {
    queues: QueueContainer,
    surface: HeadlessSurface,
    completion: GpuCompletion,
    state: Mutex<State>,
    retired: Condvar,
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessDriver {
    /// Create a driver whose queues are selected from `config.queue_families`.
    ///
    /// # Panics
    /// If the families do not cover every queue capability.
    pub fn new(config: HeadlessConfig) -> Self {
        let container: QueueFamilyContainer = config.queue_families.into_iter().collect();
        let shared = match select_queue_families(&container) {
            Ok(shared) => shared,
            Err(err) => panic!("headless queue families are incomplete: {err}"),
        };
        let exclusive = select_exclusive_queue_families(&container, &shared);
        let queues = QueueContainer::new(&shared, &exclusive, |index| {
            vk::Queue::from_raw(0x1000 + u64::from(index))
        });

        tracing::debug!(families = ?queues.family_indices_in_use(), "Headless driver created");

        Self {
            queues,
            surface: config.surface,
            completion: config.completion,
            state: Mutex::new(State {
                next_handle: 0x10_0000,
                window_extent: config.window_extent,
                ..State::default()
            }),
            retired: Condvar::new(),
        }
    }

    /// Change the simulated window size. Existing swapchains become stale.
    pub fn set_window_extent(&self, width: u32, height: u32) {
        self.state.lock().window_extent = vk::Extent2D { width, height };
    }

    pub fn window_extent(&self) -> vk::Extent2D {
        self.state.lock().window_extent
    }

    /// Return `outcome` from the next acquire instead of simulating one.
    pub fn inject_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_injections.push_back(outcome);
    }

    /// Return `outcome` from the next present instead of simulating one.
    pub fn inject_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_injections.push_back(outcome);
    }

    /// Finish the oldest outstanding submission. Returns `false` if none.
    pub fn complete_next_submission(&self) -> bool {
        let retired = self.state.lock().retire_next();
        self.retired.notify_all();
        retired
    }

    /// Finish every outstanding submission.
    pub fn complete_all_submissions(&self) {
        let mut state = self.state.lock();
        while state.retire_next() {}
        drop(state);
        self.retired.notify_all();
    }

    pub fn pending_submission_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Objects created and not yet destroyed.
    pub fn live_object_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn recorded_command_count(&self) -> u64 {
        self.state.lock().recorded_commands
    }

    pub fn descriptor_set_allocation_count(&self) -> u64 {
        self.state.lock().descriptor_sets_allocated
    }

    pub fn swapchain_create_count(&self) -> u64 {
        self.state.lock().swapchains_created
    }

    pub fn acquire_count(&self) -> u64 {
        self.state.lock().acquires
    }

    /// Successful presents.
    pub fn present_count(&self) -> u64 {
        self.state.lock().presents
    }

    /// Fence waits that had to block because the fence was unsignaled.
    pub fn blocked_fence_waits(&self) -> u64 {
        self.state.lock().blocked_fence_waits
    }

    pub fn last_render_pass(&self) -> Option<ColorPassDesc> {
        self.state.lock().last_render_pass
    }

    pub fn last_swapchain_queue_families(&self) -> Vec<u32> {
        self.state.lock().last_swapchain_families.clone()
    }

    fn surface_capabilities(&self, window_extent: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        let current_extent = if self.surface.fixed_extent {
            window_extent
        } else {
            vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            }
        };
        vk::SurfaceCapabilitiesKHR {
            min_image_count: self.surface.min_image_count,
            max_image_count: self.surface.max_image_count,
            current_extent,
            min_image_extent: self.surface.min_image_extent,
            max_image_extent: self.surface.max_image_extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    /// Whether a swapchain of `extent` still matches the surface.
    fn is_stale(&self, state: &State, extent: vk::Extent2D) -> bool {
        let caps = self.surface_capabilities(state.window_extent);
        calculate_extent(&caps, state.window_extent) != extent
    }

    fn record_command(&self) {
        self.state.lock().recorded_commands += 1;
    }
}

impl Driver for HeadlessDriver {
    fn queues(&self) -> &QueueContainer {
        &self.queues
    }

    fn wait_idle(&self) -> Result<()> {
        self.complete_all_submissions();
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore: vk::Semaphore = state.fabricate(ObjectKind::Semaphore);
        state.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore.as_raw());
        state.destroy(semaphore.as_raw(), ObjectKind::Semaphore);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence: vk::Fence = state.fabricate(ObjectKind::Fence);
        state.fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.destroy(fence.as_raw(), ObjectKind::Fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let mut blocked = false;
        loop {
            match state.fences.get(&fence.as_raw()) {
                Some(true) => return Ok(true),
                Some(false) => {}
                None => return Err(GpuError::vulkan("vkWaitForFences", vk::Result::ERROR_UNKNOWN)),
            }
            if timeout_ns == 0 {
                return Ok(false);
            }
            if !blocked {
                blocked = true;
                state.blocked_fence_waits += 1;
            }
            if timeout_ns == u64::MAX {
                self.retired.wait(&mut state);
            } else if self
                .retired
                .wait_for(&mut state, Duration::from_nanos(timeout_ns))
                .timed_out()
            {
                return Ok(state.fences.get(&fence.as_raw()).copied().unwrap_or(false));
            }
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or_else(|| GpuError::vulkan("vkGetFenceStatus", vk::Result::ERROR_UNKNOWN))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_flight.contains(&Some(fence)) {
            state
                .violations
                .push(format!("reset fence 0x{:x} while in use", fence.as_raw()));
        }
        match state.fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::vulkan("vkResetFences", vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn create_command_pool(&self, _family_index: u32) -> Result<vk::CommandPool> {
        Ok(self.state.lock().fabricate(ObjectKind::CommandPool))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().destroy(pool.as_raw(), ObjectKind::CommandPool);
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool) -> Result<()> {
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count).map(|_| state.raw_handle()).collect())
    }

    fn begin_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        _command_buffer: vk::CommandBuffer,
        _render_pass: vk::RenderPass,
        _framebuffer: vk::Framebuffer,
        _extent: vk::Extent2D,
        _clear_color: [f32; 4],
    ) {
        self.record_command();
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.record_command();
    }

    fn cmd_image_barrier(&self, _command_buffer: vk::CommandBuffer, _barrier: &ImageBarrier) {
        self.record_command();
    }

    fn cmd_set_viewport_scissor(&self, _command_buffer: vk::CommandBuffer, _extent: vk::Extent2D) {
        self.record_command();
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()> {
        let mut state = self.state.lock();
        for &semaphore in batch.wait_semaphores {
            state.consume(semaphore, "queue submit");
        }
        for &semaphore in batch.signal_semaphores {
            state.signal(semaphore);
        }
        state.submissions.push(SubmitRecord {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence: batch.fence,
        });
        state.in_flight.push_back(batch.fence);
        if self.completion == GpuCompletion::Immediate {
            state.retire_next();
            drop(state);
            self.retired.notify_all();
        }
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.state.lock().fabricate(ObjectKind::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .lock()
            .destroy(layout.as_raw(), ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        Ok(self.state.lock().fabricate(ObjectKind::DescriptorPool))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state
            .lock()
            .destroy(pool.as_raw(), ObjectKind::DescriptorPool);
    }

    fn reset_descriptor_pool(&self, _pool: vk::DescriptorPool) -> Result<()> {
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        state.descriptor_sets_allocated += 1;
        Ok(state.raw_handle())
    }

    fn surface_support(&self) -> Result<SurfaceSupport> {
        let window_extent = self.state.lock().window_extent;
        Ok(SurfaceSupport {
            capabilities: self.surface_capabilities(window_extent),
            formats: self.surface.formats.clone(),
            present_modes: self.surface.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc<'_>) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let swapchain: vk::SwapchainKHR = state.fabricate(ObjectKind::Swapchain);
        state.swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                extent: desc.extent,
                image_count: desc.min_image_count,
                next_image: 0,
            },
        );
        state.swapchains_created += 1;
        state.last_swapchain_families = desc.queue_family_indices.to_vec();
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain.as_raw());
        state.destroy(swapchain.as_raw(), ObjectKind::Swapchain);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let mut state = self.state.lock();
        let count = state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.image_count)
            .ok_or_else(|| {
                GpuError::vulkan("vkGetSwapchainImagesKHR", vk::Result::ERROR_UNKNOWN)
            })?;
        Ok((0..count).map(|_| state.raw_handle()).collect())
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        Ok(self.state.lock().fabricate(ObjectKind::ImageView))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroy(view.as_raw(), ObjectKind::ImageView);
    }

    fn create_render_pass(&self, desc: &ColorPassDesc) -> Result<vk::RenderPass> {
        let mut state = self.state.lock();
        state.last_render_pass = Some(*desc);
        Ok(state.fabricate(ObjectKind::RenderPass))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .lock()
            .destroy(render_pass.as_raw(), ObjectKind::RenderPass);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachment: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(self.state.lock().fabricate(ObjectKind::Framebuffer))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state
            .lock()
            .destroy(framebuffer.as_raw(), ObjectKind::Framebuffer);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        state.acquires += 1;

        let outcome = if let Some(injected) = state.acquire_injections.pop_front() {
            injected
        } else {
            let Some(chain) = state.swapchains.get(&swapchain.as_raw()) else {
                return Err(GpuError::vulkan(
                    "vkAcquireNextImageKHR",
                    vk::Result::ERROR_UNKNOWN,
                ));
            };
            if self.is_stale(&state, chain.extent) {
                AcquireOutcome::OutOfDate
            } else {
                AcquireOutcome::Acquired(chain.next_image)
            }
        };

        if let AcquireOutcome::Acquired(index) | AcquireOutcome::Suboptimal(index) = outcome {
            if let Some(chain) = state.swapchains.get_mut(&swapchain.as_raw()) {
                chain.next_image = (index + 1) % chain.image_count.max(1);
            }
            state.signal(signal);
        }
        Ok(outcome)
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        _image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        state.consume(wait, "present");

        let outcome = if let Some(injected) = state.present_injections.pop_front() {
            injected
        } else {
            let stale = match state.swapchains.get(&swapchain.as_raw()) {
                Some(chain) => self.is_stale(&state, chain.extent),
                None => true,
            };
            if stale {
                PresentOutcome::OutOfDate
            } else {
                PresentOutcome::Presented
            }
        };
        if outcome == PresentOutcome::Presented {
            state.presents += 1;
        }
        Ok(outcome)
    }
}
