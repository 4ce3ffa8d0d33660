//! Physical device description and selection.
//!
//! The Vulkan driver enumerates physical devices into plain
//! [`PhysicalDeviceInfo`] records; selection is a pure function over them.

use crate::error::{GpuError, Result};
use crate::queue::QueueFamilyContainer;
use ash::vk;
use std::collections::HashSet;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// The subset of device features the context layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub depth_clamp: bool,
    pub depth_bias_clamp: bool,
    pub geometry_shader: bool,
}

impl DeviceFeatures {
    /// Every feature enabled.
    pub const ALL: Self = Self {
        sampler_anisotropy: true,
        depth_clamp: true,
        depth_bias_clamp: true,
        geometry_shader: true,
    };

    pub fn from_vk(features: &vk::PhysicalDeviceFeatures) -> Self {
        Self {
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            depth_clamp: features.depth_clamp == vk::TRUE,
            depth_bias_clamp: features.depth_bias_clamp == vk::TRUE,
            geometry_shader: features.geometry_shader == vk::TRUE,
        }
    }

    /// Features to enable at device creation.
    pub fn to_vk(self) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(self.sampler_anisotropy)
            .depth_clamp(self.depth_clamp)
            .depth_bias_clamp(self.depth_bias_clamp)
            .geometry_shader(self.geometry_shader)
    }

    /// Names of features requested by `self` that `available` lacks.
    pub fn missing_from(self, available: Self) -> Vec<&'static str> {
        [
            (self.sampler_anisotropy, available.sampler_anisotropy, "samplerAnisotropy"),
            (self.depth_clamp, available.depth_clamp, "depthClamp"),
            (self.depth_bias_clamp, available.depth_bias_clamp, "depthBiasClamp"),
            (self.geometry_shader, available.geometry_shader, "geometryShader"),
        ]
        .into_iter()
        .filter(|(wanted, has, _)| *wanted && !*has)
        .map(|(_, _, name)| name)
        .collect()
    }
}

/// What a physical device must provide to be selected.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Device features that must be supported (and are enabled on the device).
    pub features: DeviceFeatures,
    /// Device extension names that must be supported (and are enabled).
    pub extensions: Vec<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            features: DeviceFeatures::ALL,
            extensions: vec!["VK_KHR_swapchain".to_string()],
        }
    }
}

impl DeviceRequirements {
    /// Add a required extension.
    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    /// Replace the required feature set.
    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }
}

/// Everything selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub device_local_memory_mb: u64,
    pub features: DeviceFeatures,
    pub extensions: HashSet<String>,
    pub queue_families: QueueFamilyContainer,
    /// The surface offers at least one format and one present mode.
    pub surface_adequate: bool,
}

impl PhysicalDeviceInfo {
    /// Why this device cannot be used, or `None` if it is suitable.
    pub fn unsuitability(&self, requirements: &DeviceRequirements) -> Option<String> {
        if self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Some(format!("not a discrete GPU ({:?})", self.device_type));
        }
        if !self.queue_families.has_all_capabilities() {
            return Some(format!(
                "queue families only cover {:?}",
                self.queue_families.capabilities()
            ));
        }
        let missing_features = requirements.features.missing_from(self.features);
        if !missing_features.is_empty() {
            return Some(format!("missing features {missing_features:?}"));
        }
        let missing_extensions: Vec<&str> = requirements
            .extensions
            .iter()
            .filter(|ext| !self.extensions.contains(ext.as_str()))
            .map(String::as_str)
            .collect();
        if !missing_extensions.is_empty() {
            return Some(format!("missing extensions {missing_extensions:?}"));
        }
        if !self.surface_adequate {
            return Some("surface has no formats or present modes".to_string());
        }
        None
    }

    /// Get a human-readable summary of the device.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, 0x{:04x}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.device_id,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Select the first device, in enumeration order, that meets `requirements`.
pub fn select_physical_device<'a>(
    candidates: &'a [PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
) -> Result<&'a PhysicalDeviceInfo> {
    for candidate in candidates {
        match candidate.unsuitability(requirements) {
            None => return Ok(candidate),
            Some(reason) => tracing::debug!("Rejecting {}: {}", candidate.name, reason),
        }
    }

    let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
    Err(GpuError::NoSuitableDevice(names.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueCapabilities, QueueFamily};
    use ash::vk::Handle;

    fn device(name: &str, raw: u64) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: name.to_string(),
            vendor: GpuVendor::Nvidia,
            device_id: 0x2204,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            device_local_memory_mb: 8192,
            features: DeviceFeatures::ALL,
            extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
            queue_families: [QueueFamily::new(0, 16, QueueCapabilities::all(), 64)]
                .into_iter()
                .collect(),
            surface_adequate: true,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn integrated_gpu_is_rejected() {
        let mut igpu = device("igpu", 1);
        igpu.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let dgpu = device("dgpu", 2);

        let candidates = [igpu, dgpu];
        let chosen = select_physical_device(&candidates, &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "dgpu");
    }

    #[test]
    fn missing_feature_or_extension_is_rejected() {
        let mut no_geom = device("no-geom", 1);
        no_geom.features.geometry_shader = false;
        let mut no_swapchain = device("no-swapchain", 2);
        no_swapchain.extensions.clear();

        let reqs = DeviceRequirements::default();
        assert!(no_geom.unsuitability(&reqs).unwrap().contains("geometryShader"));
        assert!(no_swapchain.unsuitability(&reqs).unwrap().contains("VK_KHR_swapchain"));

        let err = select_physical_device(&[no_geom, no_swapchain], &reqs).unwrap_err();
        assert!(matches!(err, GpuError::NoSuitableDevice(ref names) if names.contains("no-geom")));
    }

    #[test]
    fn incomplete_queue_families_are_rejected() {
        let mut d = device("no-present", 1);
        d.queue_families = [QueueFamily::new(
            0,
            1,
            QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
            0,
        )]
        .into_iter()
        .collect();
        assert!(d.unsuitability(&DeviceRequirements::default()).is_some());
    }

    #[test]
    fn first_suitable_device_wins() {
        let mut igpu = device("igpu", 1);
        igpu.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let first = device("first", 2);
        let mut second = device("second", 3);
        second.device_local_memory_mb = 24576;

        let candidates = [igpu, first, second];
        let chosen = select_physical_device(&candidates, &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "first");
    }

    #[test]
    fn relaxed_requirements_accept_more_devices() {
        let mut d = device("no-geom", 1);
        d.features.geometry_shader = false;
        let reqs = DeviceRequirements::default().with_features(DeviceFeatures {
            geometry_shader: false,
            ..DeviceFeatures::ALL
        });
        assert!(d.unsuitability(&reqs).is_none());
    }
}
