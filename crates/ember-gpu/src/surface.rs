//! Window surface for the Vulkan driver.
//!
//! Hides the raw-window-handle plumbing from the rest of the crate.

use crate::driver::SurfaceSupport;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A presentable surface and its extension loader.
pub struct Surface {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The instance must be valid and have the extensions required by the
    /// window's display enabled. The window must outlive the surface.
    pub unsafe fn from_window<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(format!("{e:?}")))?;

        Ok(Self {
            surface,
            loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }

    /// Whether `family_index` on `physical_device` can present to this surface.
    ///
    /// # Safety
    /// The physical device must belong to the instance the surface was created with.
    pub unsafe fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family_index: u32,
    ) -> Result<bool> {
        unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                family_index,
                self.surface,
            )
        }
        .call("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    /// Query capabilities, formats and present modes.
    ///
    /// # Safety
    /// The physical device must belong to the instance the surface was created with.
    pub unsafe fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    pub unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}
