// Descriptor pools, layouts, and sets
//
// A pool is a fixed-capacity arena of a declared resource-type mix; this
// engine uses uniform buffers and combined image samplers. Capacity is
// checked client-side before asking the driver, so exhaustion fails
// predictably with a catchable error instead of corrupting bookkeeping.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::error::CapacityError;

use super::slots::{SlotId, Slots};
use super::DeviceContext;

/// The two descriptor kinds this engine binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    CombinedImageSampler,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::CombinedImageSampler => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
        }
    }
}

/// Opaque handle to a pool owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(SlotId);

/// Device-independent capacity bookkeeping for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLedger {
    capacity: u32,
    allocated: u32,
}

impl PoolLedger {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    /// Reserve room for `count` more sets, or report exhaustion without
    /// changing any state.
    pub fn try_reserve(&mut self, count: u32) -> Result<(), CapacityError> {
        if self.allocated + count > self.capacity {
            return Err(CapacityError::DescriptorPool {
                capacity: self.capacity,
                allocated: self.allocated,
                requested: count,
            });
        }
        self.allocated += count;
        Ok(())
    }

    pub fn release(&mut self, count: u32) {
        self.allocated = self.allocated.saturating_sub(count);
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

struct Pool {
    handle: vk::DescriptorPool,
    ledger: PoolLedger,
    allow_free: bool,
}

pub struct DescriptorManager {
    pools: Slots<Pool>,
    layouts: Vec<vk::DescriptorSetLayout>,
    device: Arc<DeviceContext>,
}

impl DescriptorManager {
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            pools: Slots::new("descriptor pool"),
            layouts: Vec::new(),
            device,
        }
    }

    /// Create a pool sized for `max_sets` sets of one descriptor kind.
    /// `allow_free` opts into per-set freeing; without it `free_sets`
    /// refuses and capacity is only returned by destroying the pool.
    pub fn create_pool(
        &mut self,
        kind: DescriptorKind,
        max_sets: u32,
        allow_free: bool,
    ) -> Result<PoolId> {
        let pool_sizes = [vk::DescriptorPoolSize::builder()
            .ty(kind.to_vk())
            .descriptor_count(max_sets)
            .build()];

        let flags = if allow_free {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets)
            .flags(flags);

        let handle = unsafe { self.device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        log::debug!("Created descriptor pool: {:?} x{}", kind, max_sets);

        Ok(PoolId(self.pools.insert(Pool {
            handle,
            ledger: PoolLedger::new(max_sets),
            allow_free,
        })))
    }

    /// Build a reusable binding-slot declaration. The manager owns the
    /// layout and destroys it on drop.
    pub fn create_layout(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let layout = unsafe {
            self.device
                .device
                .create_descriptor_set_layout(&layout_info, None)
        }
        .context("Failed to create descriptor set layout")?;

        self.layouts.push(layout);
        Ok(layout)
    }

    pub fn allocate_set(
        &mut self,
        pool: PoolId,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        Ok(self.allocate_sets(pool, layout, 1)?.remove(0))
    }

    /// Allocate `count` sets against the pool's declared capacity. The
    /// client-side ledger is consulted first so exceeding `max_sets` yields
    /// a `CapacityError` and leaves the pool usable.
    pub fn allocate_sets(
        &mut self,
        pool: PoolId,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let pool_state = self.pools.get_mut(pool.0)?;
        pool_state.ledger.try_reserve(count)?;
        let pool_handle = pool_state.handle;

        let layouts = vec![layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool_handle)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) };

        match sets {
            Ok(sets) => Ok(sets),
            Err(e) => {
                // Driver-side failure: give the reservation back
                self.pools.get_mut(pool.0)?.ledger.release(count);
                Err(e).context("Failed to allocate descriptor sets")
            }
        }
    }

    /// Return sets to a pool created with `allow_free`, releasing their
    /// capacity. Refused for other pools.
    pub fn free_sets(&mut self, pool: PoolId, sets: &[vk::DescriptorSet]) -> Result<()> {
        let pool_state = self.pools.get_mut(pool.0)?;
        if !pool_state.allow_free {
            anyhow::bail!("Descriptor pool was not created with free support");
        }
        let pool_handle = pool_state.handle;

        unsafe { self.device.device.free_descriptor_sets(pool_handle, sets) }
            .context("Failed to free descriptor sets")?;
        self.pools.get_mut(pool.0)?.ledger.release(sets.len() as u32);
        Ok(())
    }

    /// Write a buffer region into one binding of a set.
    pub fn update_buffer_set(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        kind: DescriptorKind,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(range)
            .build()];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(kind.to_vk())
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Write an image + sampler pair into one binding of a set.
    pub fn update_image_set(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let image_info = [vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(view)
            .sampler(sampler)
            .build()];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn allocated_sets(&self, pool: PoolId) -> Result<u32> {
        Ok(self.pools.get(pool.0)?.ledger.allocated())
    }
}

/// Binding-slot declaration for a uniform buffer.
pub fn uniform_buffer_binding(
    binding: u32,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

/// Binding-slot declaration for a combined image sampler.
pub fn sampler_binding(
    binding: u32,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

impl Drop for DescriptorManager {
    fn drop(&mut self) {
        unsafe {
            for pool in self.pools.iter() {
                self.device.device.destroy_descriptor_pool(pool.handle, None);
            }
            for &layout in &self.layouts {
                self.device.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_allows_exactly_max_sets() {
        let mut ledger = PoolLedger::new(4);
        for _ in 0..4 {
            ledger.try_reserve(1).unwrap();
        }
        assert_eq!(ledger.allocated(), 4);
    }

    #[test]
    fn ledger_rejects_one_past_capacity_without_corruption() {
        let mut ledger = PoolLedger::new(4);
        for _ in 0..4 {
            ledger.try_reserve(1).unwrap();
        }

        let err = ledger.try_reserve(1).unwrap_err();
        assert_eq!(
            err,
            CapacityError::DescriptorPool {
                capacity: 4,
                allocated: 4,
                requested: 1,
            }
        );
        // The failed reservation left the count untouched
        assert_eq!(ledger.allocated(), 4);
    }

    #[test]
    fn ledger_rejects_batch_straddling_capacity() {
        let mut ledger = PoolLedger::new(4);
        ledger.try_reserve(3).unwrap();
        assert!(ledger.try_reserve(2).is_err());
        assert_eq!(ledger.allocated(), 3);
        ledger.try_reserve(1).unwrap();
    }

    #[test]
    fn ledger_release_returns_capacity() {
        let mut ledger = PoolLedger::new(2);
        ledger.try_reserve(2).unwrap();
        ledger.release(1);
        ledger.try_reserve(1).unwrap();
        assert_eq!(ledger.allocated(), 2);
    }

    #[test]
    fn capacity_failure_is_catchable_as_anyhow() {
        let mut ledger = PoolLedger::new(1);
        ledger.try_reserve(1).unwrap();

        let err: anyhow::Error = ledger.try_reserve(1).unwrap_err().into();
        assert!(err.downcast_ref::<CapacityError>().is_some());
    }
}
