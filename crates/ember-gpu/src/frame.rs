//! Per-frame-in-flight resources.

use crate::command::CommandPool;
use crate::driver::Driver;
use crate::error::{GpuError, Result};
use crate::queue::QueueFamily;
use crate::sync::{Fence, Semaphore, FENCE_WAIT_FOREVER};
use ash::vk;
use std::sync::Arc;

/// Resources owned by one frame in flight.
///
/// Nothing here may be reused until [`FrameSlot::wait`] has returned, which
/// guarantees the GPU finished every submission made under this slot.
pub struct FrameSlot<D: Driver> {
    command_pools: Vec<CommandPool<D>>,
    /// Signaled by each non-graphics family's batch, waited on by the graphics batch.
    family_semaphores: Vec<(u32, Semaphore<D>)>,
    image_available: Semaphore<D>,
    render_finished: Semaphore<D>,
    in_flight: Fence<D>,
}

impl<D: Driver> FrameSlot<D> {
    /// Create a slot with one command pool per family in `families`.
    pub fn new(driver: &Arc<D>, families: &[QueueFamily], graphics_family: u32) -> Result<Self> {
        let command_pools = families
            .iter()
            .map(|family| CommandPool::new(driver, *family))
            .collect::<Result<Vec<_>>>()?;
        let family_semaphores = families
            .iter()
            .filter(|family| family.index() != graphics_family)
            .map(|family| Ok((family.index(), Semaphore::new(driver)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            command_pools,
            family_semaphores,
            image_available: Semaphore::new(driver)?,
            render_finished: Semaphore::new(driver)?,
            in_flight: Fence::new(driver, true)?,
        })
    }

    /// Block until the GPU has finished this slot's previous submissions.
    pub fn wait(&self) -> Result<()> {
        if self.in_flight.wait(FENCE_WAIT_FOREVER)? {
            Ok(())
        } else {
            Err(GpuError::InvalidState(
                "unbounded frame fence wait timed out".to_string(),
            ))
        }
    }

    /// Recycle every command buffer handed out under this slot.
    pub fn reset_command_pools(&mut self) -> Result<()> {
        for pool in &mut self.command_pools {
            pool.reset()?;
        }
        Ok(())
    }

    pub fn command_pool(&self, family_index: u32) -> Option<&CommandPool<D>> {
        self.command_pools
            .iter()
            .find(|pool| pool.family().index() == family_index)
    }

    pub fn command_pool_mut(&mut self, family_index: u32) -> Option<&mut CommandPool<D>> {
        self.command_pools
            .iter_mut()
            .find(|pool| pool.family().index() == family_index)
    }

    pub fn family_semaphore(&self, family_index: u32) -> Option<vk::Semaphore> {
        self.family_semaphores
            .iter()
            .find(|(family, _)| *family == family_index)
            .map(|(_, semaphore)| semaphore.handle())
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available.handle()
    }

    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished.handle()
    }

    pub fn in_flight(&self) -> &Fence<D> {
        &self.in_flight
    }
}
