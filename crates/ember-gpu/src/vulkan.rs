//! [`Driver`] implementation on top of `ash`.

use crate::capabilities::{
    select_physical_device, DeviceFeatures, DeviceRequirements, GpuVendor, PhysicalDeviceInfo,
};
use crate::context::GraphicsConfig;
use crate::descriptors::DescriptorBinding;
use crate::driver::{
    AcquireOutcome, ColorPassDesc, Driver, ImageBarrier, PresentOutcome, SubmitBatch,
    SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::create_instance;
use crate::queue::{
    select_exclusive_queue_families, select_queue_families, QueueCapabilities, QueueContainer,
    QueueFamily, QueueFamilyContainer,
};
use crate::surface::Surface;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashSet;
use std::ffi::{c_char, CString};
use std::sync::atomic::{AtomicBool, Ordering};

static DEVICE_EXISTS: AtomicBool = AtomicBool::new(false);

/// Proof that this process holds the only logical device.
struct DeviceToken;

impl DeviceToken {
    fn acquire() -> Self {
        assert!(
            !DEVICE_EXISTS.swap(true, Ordering::AcqRel),
            "only one graphics device may exist at a time"
        );
        Self
    }
}

impl Drop for DeviceToken {
    fn drop(&mut self) {
        DEVICE_EXISTS.store(false, Ordering::Release);
    }
}

/// Vulkan device, surface and queues for one window.
pub struct VulkanDriver {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    surface: Surface,
    physical_device: PhysicalDeviceInfo,
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    queues: QueueContainer,
    _token: DeviceToken,
}

impl VulkanDriver {
    /// Create the instance, surface and logical device for `window`.
    ///
    /// # Panics
    /// If another `VulkanDriver` is alive.
    pub fn new<W>(window: &W, config: &GraphicsConfig) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let token = DeviceToken::acquire();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance = unsafe { create_instance(&entry, &config.app_name, display, config.validation) }?;

        let surface = match unsafe { Surface::from_window(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let (physical_device, device, queues) =
            match unsafe { create_device(&instance, &surface, &config.requirements) } {
                Ok(created) => created,
                Err(err) => {
                    unsafe {
                        surface.destroy();
                        instance.destroy_instance(None);
                    }
                    return Err(err);
                }
            };

        tracing::info!("Selected GPU: {}", physical_device.summary());
        tracing::info!(families = ?queues.family_indices_in_use(), "Logical device created");

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            surface,
            physical_device,
            device,
            swapchain_loader,
            queues,
            _token: token,
        })
    }

    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface.destroy();
            self.instance.destroy_instance(None);
        }
    }
}

/// Describe every physical device for selection.
///
/// # Safety
/// The surface must belong to `instance`.
unsafe fn enumerate_devices(
    instance: &ash::Instance,
    surface: &Surface,
) -> Result<Vec<PhysicalDeviceInfo>> {
    let handles = unsafe { instance.enumerate_physical_devices() }
        .call("vkEnumeratePhysicalDevices")?;

    let mut devices = Vec::with_capacity(handles.len());
    for handle in handles {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };
        let memory = unsafe { instance.get_physical_device_memory_properties(handle) };

        let extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(handle) }
                .call("vkEnumerateDeviceExtensionProperties")?
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok())
                .filter_map(|name| name.to_str().ok().map(String::from))
                .collect();

        let family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let mut queue_families = QueueFamilyContainer::new();
        for (index, props) in (0u32..).zip(family_properties.iter()) {
            let present = unsafe { surface.supports_present(handle, index) }?;
            queue_families.add_family(QueueFamily::new(
                index,
                props.queue_count,
                QueueCapabilities::from_vk(props.queue_flags, present),
                props.timestamp_valid_bits,
            ));
        }

        let surface_adequate = unsafe { surface.support(handle) }
            .is_ok_and(|support| !support.formats.is_empty() && !support.present_modes.is_empty());

        let device_local_memory_mb: u64 = memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        devices.push(PhysicalDeviceInfo {
            handle,
            name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_id: properties.device_id,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            features: DeviceFeatures::from_vk(&features),
            extensions,
            queue_families,
            surface_adequate,
        });
    }
    Ok(devices)
}

/// Select a physical device and create the logical device with one queue
/// per family in use.
///
/// # Safety
/// The surface must belong to `instance`.
unsafe fn create_device(
    instance: &ash::Instance,
    surface: &Surface,
    requirements: &DeviceRequirements,
) -> Result<(PhysicalDeviceInfo, ash::Device, QueueContainer)> {
    let candidates = unsafe { enumerate_devices(instance, surface) }?;
    let chosen = select_physical_device(&candidates, requirements)?.clone();

    let shared = select_queue_families(&chosen.queue_families)?;
    let exclusive = select_exclusive_queue_families(&chosen.queue_families, &shared);
    let mut families = shared.family_indices();
    families.extend(exclusive.family_indices());
    families.sort_unstable();
    families.dedup();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = requirements
        .extensions
        .iter()
        .map(|name| CString::new(name.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?;
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = requirements.features.to_vk();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(chosen.handle, &device_create_info, None) }
        .call("vkCreateDevice")?;

    let queues = QueueContainer::new(&shared, &exclusive, |family| unsafe {
        device.get_device_queue(family, 0)
    });

    Ok((chosen, device, queues))
}

impl Driver for VulkanDriver {
    fn queues(&self) -> &QueueContainer {
        &self.queues
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&create_info, None) }.call("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }.call("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(GpuError::vulkan("vkWaitForFences", result)),
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(fence) }.call("vkGetFenceStatus")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }.call("vkResetFences")
    }

    fn create_command_pool(&self, family_index: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&create_info, None) }.call("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }
        .call("vkResetCommandPool")
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .call("vkAllocateCommandBuffers")
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .call("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }.call("vkEndCommandBuffer")
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_image_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(barrier.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn cmd_set_viewport_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores);
        let fence = batch.fence.unwrap_or_else(vk::Fence::null);
        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }.call("vkQueueSubmit")
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type.to_vk())
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .call("vkCreateDescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .call("vkCreateDescriptorPool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .call("vkResetDescriptorPool")
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .call("vkAllocateDescriptorSets")?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("driver returned no descriptor set".to_string()))
    }

    fn surface_support(&self) -> Result<SurfaceSupport> {
        unsafe { self.surface.support(self.physical_device.handle) }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc<'_>) -> Result<vk::SwapchainKHR> {
        let sharing_mode = if desc.queue_family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(desc.queue_family_indices)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .call("vkCreateSwapchainKHR")
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .call("vkGetSwapchainImagesKHR")
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        unsafe { self.device.create_image_view(&view_info, None) }.call("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_render_pass(&self, desc: &ColorPassDesc) -> Result<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription::default()
            .format(desc.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(desc.load_op)
            .store_op(desc.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(desc.initial_layout)
            .final_layout(desc.final_layout)];
        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];
        // Layout transition must wait for the image-available semaphore.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe { self.device.create_render_pass(&create_info, None) }.call("vkCreateRenderPass")
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachment: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let attachments = [attachment];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&create_info, None) }.call("vkCreateFramebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Acquired(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::NOT_READY | vk::Result::TIMEOUT) => Ok(AcquireOutcome::NotReady),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(result) => Err(GpuError::vulkan("vkAcquireNextImageKHR", result)),
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(GpuError::vulkan("vkQueuePresentKHR", result)),
        }
    }
}
