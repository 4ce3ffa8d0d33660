//! Synchronization primitives.

use crate::driver::Driver;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Timeout used at frame boundaries. The wait is a hard stall point.
pub const FENCE_WAIT_FOREVER: u64 = u64::MAX;

/// GPU to CPU signal. Destroyed when dropped.
pub struct Fence<D: Driver> {
    driver: Arc<D>,
    fence: vk::Fence,
}

impl<D: Driver> Fence<D> {
    /// Create a fence, optionally already signaled.
    pub fn new(driver: &Arc<D>, signaled: bool) -> Result<Self> {
        let fence = driver.create_fence(signaled)?;
        Ok(Self {
            driver: Arc::clone(driver),
            fence,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Wait for the fence. Returns `false` if the timeout elapsed first.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        self.driver.wait_for_fence(self.fence, timeout_ns)
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.driver.fence_status(self.fence)
    }

    /// Reset to unsignaled.
    pub fn reset(&self) -> Result<()> {
        self.driver.reset_fence(self.fence)
    }
}

impl<D: Driver> Drop for Fence<D> {
    fn drop(&mut self) {
        self.driver.destroy_fence(self.fence);
    }
}

/// GPU to GPU signal. Destroyed when dropped.
pub struct Semaphore<D: Driver> {
    driver: Arc<D>,
    semaphore: vk::Semaphore,
}

impl<D: Driver> Semaphore<D> {
    pub fn new(driver: &Arc<D>) -> Result<Self> {
        let semaphore = driver.create_semaphore()?;
        Ok(Self {
            driver: Arc::clone(driver),
            semaphore,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl<D: Driver> Drop for Semaphore<D> {
    fn drop(&mut self) {
        self.driver.destroy_semaphore(self.semaphore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDriver;

    #[test]
    fn fence_lifecycle() {
        let driver = Arc::new(HeadlessDriver::default());
        let fence = Fence::new(&driver, true).unwrap();
        assert!(fence.is_signaled().unwrap());
        assert!(fence.wait(0).unwrap());

        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
        assert!(!fence.wait(0).unwrap());
    }

    #[test]
    fn dropping_releases_driver_objects() {
        let driver = Arc::new(HeadlessDriver::default());
        {
            let _fence = Fence::new(&driver, false).unwrap();
            let _semaphore = Semaphore::new(&driver).unwrap();
            assert_eq!(driver.live_object_count(), 2);
        }
        assert_eq!(driver.live_object_count(), 0);
    }
}
