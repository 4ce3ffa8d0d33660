//! Command buffer management.
//!
//! A [`CommandPool`] owns a dense array of driver command buffers that grows
//! in small batches and is recycled in bulk by [`CommandPool::reset`].
//! Callers receive [`CommandBuffer`] recorders identified by a
//! [`CommandBufferHandle`]; handles from before the last reset are stale.

use crate::driver::{Driver, ImageBarrier};
use crate::error::{GpuError, Result};
use crate::queue::QueueFamily;
use ash::vk;
use std::sync::Arc;

/// Number of command buffers requested from the driver when a pool grows.
pub const COMMAND_BUFFER_ALLOCATE_BATCH: u32 = 4;

/// Command buffers a pool can hand out between two resets.
pub const MAX_COMMAND_BUFFERS_PER_POOL: u32 = 64;

/// Identifies a command buffer within its pool's current reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    family: u32,
    generation: u32,
    index: u32,
}

impl CommandBufferHandle {
    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Transient command pool for a single queue family.
pub struct CommandPool<D: Driver> {
    driver: Arc<D>,
    pool: vk::CommandPool,
    family: QueueFamily,
    buffers: Vec<vk::CommandBuffer>,
    next_free: usize,
    generation: u32,
}

impl<D: Driver> CommandPool<D> {
    /// Create a new command pool.
    pub fn new(driver: &Arc<D>, family: QueueFamily) -> Result<Self> {
        let pool = driver.create_command_pool(family.index())?;
        Ok(Self {
            driver: Arc::clone(driver),
            pool,
            family,
            buffers: Vec::new(),
            next_free: 0,
            generation: 0,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn family(&self) -> &QueueFamily {
        &self.family
    }

    /// Current reset cycle. Incremented by every [`reset`](Self::reset).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Command buffers allocated from the driver over the pool's lifetime.
    pub fn allocated_count(&self) -> usize {
        self.buffers.len()
    }

    /// Command buffers handed out since the last reset.
    pub fn in_use_count(&self) -> usize {
        self.next_free
    }

    /// Take the next free command buffer, growing the pool if needed.
    ///
    /// The returned buffer is in the initial state and is valid until the
    /// next reset of this pool.
    pub fn get_command_buffer(&mut self) -> Result<CommandBuffer<D>> {
        if self.next_free == MAX_COMMAND_BUFFERS_PER_POOL as usize {
            return Err(GpuError::CapacityExhausted {
                resource: format!("command buffers (family {})", self.family.index()),
                requested: MAX_COMMAND_BUFFERS_PER_POOL + 1,
                capacity: MAX_COMMAND_BUFFERS_PER_POOL,
            });
        }

        if self.next_free == self.buffers.len() {
            self.grow()?;
        }

        let index = self.next_free;
        self.next_free += 1;

        Ok(CommandBuffer {
            driver: Arc::clone(&self.driver),
            raw: self.buffers[index],
            handle: CommandBufferHandle {
                family: self.family.index(),
                generation: self.generation,
                index: index as u32,
            },
            state: RecordingState::Initial,
            command_count: 0,
        })
    }

    fn grow(&mut self) -> Result<()> {
        let remaining = MAX_COMMAND_BUFFERS_PER_POOL - self.buffers.len() as u32;
        let count = COMMAND_BUFFER_ALLOCATE_BATCH.min(remaining);
        let new_buffers = self.driver.allocate_command_buffers(self.pool, count)?;
        self.buffers.extend(new_buffers);
        tracing::debug!(
            family = self.family.index(),
            allocated = self.buffers.len(),
            "Command pool grew"
        );
        Ok(())
    }

    /// Raw buffer behind `handle`.
    ///
    /// Stale handles are a caller error and only checked in debug builds.
    pub fn resolve(&self, handle: CommandBufferHandle) -> vk::CommandBuffer {
        debug_assert_eq!(handle.family, self.family.index(), "handle from another pool");
        debug_assert_eq!(
            handle.generation, self.generation,
            "command buffer used after its pool was reset"
        );
        self.buffers[handle.index as usize]
    }

    /// Recycle every buffer handed out since the previous reset.
    ///
    /// The GPU must have finished executing all of them.
    pub fn reset(&mut self) -> Result<()> {
        self.driver.reset_command_pool(self.pool)?;
        self.next_free = 0;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }
}

impl<D: Driver> Drop for CommandPool<D> {
    fn drop(&mut self) {
        // Buffers are freed together with the pool.
        self.driver.destroy_command_pool(self.pool);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    InRenderPass,
    Executable,
}

/// A command buffer being recorded for the current frame.
///
/// Consumed by [`GraphicsContext::submit_command_buffer`](crate::context::GraphicsContext::submit_command_buffer).
pub struct CommandBuffer<D: Driver> {
    driver: Arc<D>,
    raw: vk::CommandBuffer,
    handle: CommandBufferHandle,
    state: RecordingState,
    command_count: u32,
}

impl<D: Driver> CommandBuffer<D> {
    pub fn handle(&self) -> CommandBufferHandle {
        self.handle
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Commands recorded so far, excluding begin/end.
    pub fn command_count(&self) -> u32 {
        self.command_count
    }

    /// Recording has ended and the buffer can be submitted.
    pub fn is_executable(&self) -> bool {
        self.state == RecordingState::Executable
    }

    /// Begin one-time-submit recording.
    pub fn begin(&mut self) -> Result<()> {
        assert_eq!(self.state, RecordingState::Initial, "command buffer already begun");
        self.driver.begin_command_buffer(self.raw)?;
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Begin a render pass over the full `extent`, clearing to `clear_color`.
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        self.expect_state(RecordingState::Recording, "begin_render_pass");
        self.driver
            .cmd_begin_render_pass(self.raw, render_pass, framebuffer, extent, clear_color);
        self.state = RecordingState::InRenderPass;
        self.command_count += 1;
    }

    pub fn end_render_pass(&mut self) {
        self.expect_state(RecordingState::InRenderPass, "end_render_pass");
        self.driver.cmd_end_render_pass(self.raw);
        self.state = RecordingState::Recording;
        self.command_count += 1;
    }

    /// Record a pipeline barrier with a single image transition.
    pub fn image_barrier(&mut self, barrier: &ImageBarrier) {
        self.expect_state(RecordingState::Recording, "image_barrier");
        self.driver.cmd_image_barrier(self.raw, barrier);
        self.command_count += 1;
    }

    /// Set viewport and scissor to cover `extent`.
    pub fn set_viewport_scissor(&mut self, extent: vk::Extent2D) {
        assert!(
            matches!(
                self.state,
                RecordingState::Recording | RecordingState::InRenderPass
            ),
            "set_viewport_scissor outside of recording"
        );
        self.driver.cmd_set_viewport_scissor(self.raw, extent);
        self.command_count += 1;
    }

    /// Finish recording.
    pub fn end(&mut self) -> Result<()> {
        self.expect_state(RecordingState::Recording, "end");
        self.driver.end_command_buffer(self.raw)?;
        self.state = RecordingState::Executable;
        Ok(())
    }

    fn expect_state(&self, expected: RecordingState, op: &str) {
        assert_eq!(self.state, expected, "{op} called in state {:?}", self.state);
    }
}

impl<D: Driver> std::fmt::Debug for CommandBuffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("command_count", &self.command_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDriver;
    use crate::queue::QueueCapabilities;
    use ash::vk::Handle;

    fn pool() -> (Arc<HeadlessDriver>, CommandPool<HeadlessDriver>) {
        let driver = Arc::new(HeadlessDriver::default());
        let family = QueueFamily::new(0, 1, QueueCapabilities::all(), 64);
        let pool = CommandPool::new(&driver, family).unwrap();
        (driver, pool)
    }

    #[test]
    fn grows_in_batches() {
        let (_driver, mut pool) = pool();
        let _a = pool.get_command_buffer().unwrap();
        assert_eq!(pool.allocated_count(), 4);

        for _ in 0..4 {
            pool.get_command_buffer().unwrap();
        }
        assert_eq!(pool.allocated_count(), 8);
        assert_eq!(pool.in_use_count(), 5);
    }

    #[test]
    fn reset_recycles_buffers_and_bumps_generation() {
        let (_driver, mut pool) = pool();
        let first = pool.get_command_buffer().unwrap();
        let raw = first.raw();
        assert_eq!(first.handle().generation(), 0);

        pool.reset().unwrap();
        let again = pool.get_command_buffer().unwrap();
        assert_eq!(again.raw(), raw);
        assert_eq!(again.handle().generation(), 1);
        assert_eq!(again.handle().index(), 0);
        assert_eq!(pool.allocated_count(), 4);
        assert_eq!(pool.resolve(again.handle()), raw);
    }

    #[test]
    fn capacity_is_bounded_per_cycle() {
        let (_driver, mut pool) = pool();
        for _ in 0..MAX_COMMAND_BUFFERS_PER_POOL {
            pool.get_command_buffer().unwrap();
        }
        let err = pool.get_command_buffer().unwrap_err();
        assert!(err.is_capacity());

        pool.reset().unwrap();
        assert!(pool.get_command_buffer().is_ok());
        assert_eq!(pool.allocated_count(), MAX_COMMAND_BUFFERS_PER_POOL as usize);
    }

    #[test]
    fn recording_counts_commands() {
        let (driver, mut pool) = pool();
        let mut cb = pool.get_command_buffer().unwrap();
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };

        cb.begin().unwrap();
        cb.begin_render_pass(
            vk::RenderPass::from_raw(1),
            vk::Framebuffer::from_raw(2),
            extent,
            [0.0, 0.0, 0.0, 1.0],
        );
        cb.set_viewport_scissor(extent);
        cb.end_render_pass();
        assert!(!cb.is_executable());
        cb.end().unwrap();

        assert!(cb.is_executable());
        assert_eq!(cb.command_count(), 3);
        assert_eq!(driver.recorded_command_count(), 3);
    }

    #[test]
    #[should_panic(expected = "begin_render_pass called in state Initial")]
    fn render_pass_requires_begin() {
        let (_driver, mut pool) = pool();
        let mut cb = pool.get_command_buffer().unwrap();
        cb.begin_render_pass(
            vk::RenderPass::null(),
            vk::Framebuffer::null(),
            vk::Extent2D::default(),
            [0.0; 4],
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "used after its pool was reset")]
    fn stale_handle_is_caught_in_debug() {
        let (_driver, mut pool) = pool();
        let stale = pool.get_command_buffer().unwrap().handle();
        pool.reset().unwrap();
        pool.resolve(stale);
    }

    #[test]
    fn dropping_pool_destroys_it() {
        let (driver, pool) = pool();
        assert_eq!(driver.live_object_count(), 1);
        drop(pool);
        assert_eq!(driver.live_object_count(), 0);
    }
}
