//! Descriptor set management.
//!
//! [`DescriptorPool`] is a bump allocator over a fixed per-type budget. The
//! budget is enforced here, before the driver is asked for anything, so
//! exhaustion is reported deterministically as a capacity error.

use crate::driver::Driver;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Kind of resource bound at a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    ConstantBuffer,
    ConstantBufferDynamic,
    StorageBuffer,
    StorageBufferDynamic,
    Sampler,
    CombinedTextureSampler,
    SampledTexture,
    StorageTexture,
}

const DESCRIPTOR_TYPE_COUNT: usize = 8;

impl DescriptorType {
    pub const ALL: [Self; DESCRIPTOR_TYPE_COUNT] = [
        Self::ConstantBuffer,
        Self::ConstantBufferDynamic,
        Self::StorageBuffer,
        Self::StorageBufferDynamic,
        Self::Sampler,
        Self::CombinedTextureSampler,
        Self::SampledTexture,
        Self::StorageTexture,
    ];

    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::ConstantBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::CombinedTextureSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            count,
            stages,
        });
        self
    }

    /// Add a constant (uniform) buffer binding.
    pub fn constant_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::ConstantBuffer, 1, stages)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::StorageBuffer, 1, stages)
    }

    /// Add a combined texture/sampler binding.
    pub fn combined_texture_sampler(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::CombinedTextureSampler, 1, stages)
    }

    /// Add a sampled texture binding.
    pub fn sampled_texture(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::SampledTexture, 1, stages)
    }

    /// Add a storage texture binding.
    pub fn storage_texture(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::StorageTexture, 1, stages)
    }

    /// Add a sampler binding.
    pub fn sampler(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorType::Sampler, 1, stages)
    }

    /// Build the descriptor set layout.
    ///
    /// Fails with [`GpuError::CapacityExhausted`] when the descriptor count of
    /// one type does not fit in a `u32`.
    pub fn build<D: Driver>(self, driver: &Arc<D>) -> Result<DescriptorSetLayout<D>> {
        let mut usage = [0u32; DESCRIPTOR_TYPE_COUNT];
        for binding in &self.bindings {
            let slot = &mut usage[binding.descriptor_type.slot()];
            *slot = slot
                .checked_add(binding.count)
                .ok_or_else(|| GpuError::CapacityExhausted {
                    resource: format!("{:?} descriptors per set", binding.descriptor_type),
                    requested: u32::MAX,
                    capacity: u32::MAX,
                })?;
        }
        let layout = driver.create_descriptor_set_layout(&self.bindings)?;
        Ok(DescriptorSetLayout {
            driver: Arc::clone(driver),
            layout,
            bindings: self.bindings,
            usage,
        })
    }
}

/// A descriptor set layout together with its per-type descriptor usage.
pub struct DescriptorSetLayout<D: Driver> {
    driver: Arc<D>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
    usage: [u32; DESCRIPTOR_TYPE_COUNT],
}

impl<D: Driver> DescriptorSetLayout<D> {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Descriptors of `descriptor_type` one set of this layout consumes.
    pub fn usage(&self, descriptor_type: DescriptorType) -> u32 {
        self.usage[descriptor_type.slot()]
    }
}

impl<D: Driver> Drop for DescriptorSetLayout<D> {
    fn drop(&mut self) {
        self.driver.destroy_descriptor_set_layout(self.layout);
    }
}

/// Capacity of a [`DescriptorPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolBudget {
    pub max_sets: u32,
    per_type: [u32; DESCRIPTOR_TYPE_COUNT],
}

impl Default for DescriptorPoolBudget {
    fn default() -> Self {
        Self::new(128)
            .with(DescriptorType::ConstantBuffer, 64)
            .with(DescriptorType::CombinedTextureSampler, 64)
            .with(DescriptorType::Sampler, 64)
            .with(DescriptorType::SampledTexture, 64)
    }
}

impl DescriptorPoolBudget {
    /// A budget of `max_sets` sets with no descriptors of any type.
    pub fn new(max_sets: u32) -> Self {
        Self {
            max_sets,
            per_type: [0; DESCRIPTOR_TYPE_COUNT],
        }
    }

    /// Set the number of descriptors of `descriptor_type`.
    pub fn with(mut self, descriptor_type: DescriptorType, count: u32) -> Self {
        self.per_type[descriptor_type.slot()] = count;
        self
    }

    pub fn get(&self, descriptor_type: DescriptorType) -> u32 {
        self.per_type[descriptor_type.slot()]
    }

    /// Driver pool sizes for every type with a non-zero budget.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        DescriptorType::ALL
            .into_iter()
            .filter(|ty| self.get(*ty) > 0)
            .map(|ty| {
                vk::DescriptorPoolSize::default()
                    .ty(ty.to_vk())
                    .descriptor_count(self.get(ty))
            })
            .collect()
    }
}

/// Identifies a descriptor set within its pool's current reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle {
    generation: u32,
    index: u32,
}

impl DescriptorSetHandle {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A descriptor set issued by a [`DescriptorPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    pub handle: DescriptorSetHandle,
    pub raw: vk::DescriptorSet,
}

/// Bump allocator for descriptor sets.
pub struct DescriptorPool<D: Driver> {
    driver: Arc<D>,
    pool: vk::DescriptorPool,
    budget: DescriptorPoolBudget,
    sets: Vec<vk::DescriptorSet>,
    used: [u32; DESCRIPTOR_TYPE_COUNT],
    generation: u32,
}

impl<D: Driver> DescriptorPool<D> {
    /// Create a new descriptor pool.
    pub fn new(driver: &Arc<D>, budget: DescriptorPoolBudget) -> Result<Self> {
        let pool = driver.create_descriptor_pool(budget.max_sets, &budget.pool_sizes())?;
        tracing::debug!(max_sets = budget.max_sets, "Created descriptor pool");
        Ok(Self {
            driver: Arc::clone(driver),
            pool,
            budget,
            sets: Vec::new(),
            used: [0; DESCRIPTOR_TYPE_COUNT],
            generation: 0,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn budget(&self) -> &DescriptorPoolBudget {
        &self.budget
    }

    /// Sets issued since the last reset.
    pub fn allocated_sets(&self) -> u32 {
        self.sets.len() as u32
    }

    /// Descriptors of `descriptor_type` issued since the last reset.
    pub fn used(&self, descriptor_type: DescriptorType) -> u32 {
        self.used[descriptor_type.slot()]
    }

    /// Allocate the next set for `layout`.
    ///
    /// Fails with [`GpuError::CapacityExhausted`] when the set count or any
    /// per-type budget would be exceeded; the pool is left unchanged.
    pub fn get_descriptor_set(&mut self, layout: &DescriptorSetLayout<D>) -> Result<DescriptorSet> {
        let requested_sets = self.allocated_sets() + 1;
        if requested_sets > self.budget.max_sets {
            return Err(GpuError::CapacityExhausted {
                resource: "descriptor sets".to_string(),
                requested: requested_sets,
                capacity: self.budget.max_sets,
            });
        }

        for ty in DescriptorType::ALL {
            let needed = layout.usage(ty);
            if needed == 0 {
                continue;
            }
            let capacity = self.budget.get(ty);
            match self.used(ty).checked_add(needed) {
                Some(requested) if requested <= capacity => {}
                requested => {
                    return Err(GpuError::CapacityExhausted {
                        resource: format!("{ty:?} descriptors"),
                        requested: requested.unwrap_or(u32::MAX),
                        capacity,
                    });
                }
            }
        }

        let raw = self.driver.allocate_descriptor_set(self.pool, layout.handle())?;
        // Every sum was bounded by its budget above.
        for ty in DescriptorType::ALL {
            self.used[ty.slot()] += layout.usage(ty);
        }
        let index = self.sets.len() as u32;
        self.sets.push(raw);

        Ok(DescriptorSet {
            handle: DescriptorSetHandle {
                generation: self.generation,
                index,
            },
            raw,
        })
    }

    /// Raw set behind `handle`. Stale handles are only checked in debug builds.
    pub fn resolve(&self, handle: DescriptorSetHandle) -> vk::DescriptorSet {
        debug_assert_eq!(
            handle.generation, self.generation,
            "descriptor set used after its pool was reset"
        );
        self.sets[handle.index as usize]
    }

    /// Invalidate every set issued by this pool.
    pub fn reset(&mut self) -> Result<()> {
        self.driver.reset_descriptor_pool(self.pool)?;
        self.sets.clear();
        self.used = [0; DESCRIPTOR_TYPE_COUNT];
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }
}

impl<D: Driver> Drop for DescriptorPool<D> {
    fn drop(&mut self) {
        self.driver.destroy_descriptor_pool(self.pool);
    }
}
