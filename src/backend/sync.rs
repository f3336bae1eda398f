// Synchronization primitives
//
// Semaphores order GPU-to-GPU work across queue operations; fences tell the
// CPU when submitted work has finished so resources are safe to reuse. Both
// come from growing pools behind generation-checked ids.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::slots::{SlotId, Slots};
use super::DeviceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(SlotId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(SlotId);

pub struct SyncManager {
    semaphores: Slots<vk::Semaphore>,
    fences: Slots<vk::Fence>,
    device: Arc<DeviceContext>,
}

impl SyncManager {
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            semaphores: Slots::new("semaphore"),
            fences: Slots::new("fence"),
            device,
        }
    }

    pub fn allocate_semaphore(&mut self) -> Result<SemaphoreId> {
        Ok(self.allocate_semaphores(1)?.remove(0))
    }

    pub fn allocate_semaphores(&mut self, count: u32) -> Result<Vec<SemaphoreId>> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        (0..count)
            .map(|_| {
                let semaphore = unsafe {
                    self.device.device.create_semaphore(&semaphore_info, None)
                }
                .context("Failed to create semaphore")?;
                Ok(SemaphoreId(self.semaphores.insert(semaphore)))
            })
            .collect()
    }

    pub fn allocate_fence(&mut self) -> Result<FenceId> {
        Ok(self.allocate_fences(1)?.remove(0))
    }

    /// Fences are created signaled so the first wait on them does not block.
    pub fn allocate_fences(&mut self, count: u32) -> Result<Vec<FenceId>> {
        let fence_info =
            vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        (0..count)
            .map(|_| {
                let fence = unsafe { self.device.device.create_fence(&fence_info, None) }
                    .context("Failed to create fence")?;
                Ok(FenceId(self.fences.insert(fence)))
            })
            .collect()
    }

    pub fn semaphore(&self, id: SemaphoreId) -> Result<vk::Semaphore> {
        Ok(*self.semaphores.get(id.0)?)
    }

    pub fn fence(&self, id: FenceId) -> Result<vk::Fence> {
        Ok(*self.fences.get(id.0)?)
    }

    /// Block until the fence signals. A timeout means the GPU appears hung;
    /// this design treats that as fatal rather than recoverable.
    pub fn wait_for_fence(&self, id: FenceId, timeout: u64) -> Result<()> {
        let fence = self.fence(id)?;
        let result = unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                anyhow::bail!(
                    "Fence wait exceeded {} ms (GPU appears hung)",
                    timeout / 1_000_000
                )
            }
            Err(e) => Err(e).context("Failed to wait for fence"),
        }
    }

    /// Reset only after a successful wait, before reuse in a new submission.
    pub fn reset_fence(&self, id: FenceId) -> Result<()> {
        let fence = self.fence(id)?;
        unsafe { self.device.device.reset_fences(&[fence]) }
            .context("Failed to reset fence")?;
        Ok(())
    }

    /// Round-robin advance through the fence pool for double/triple-buffer
    /// pacing.
    pub fn next_fence(&self, id: FenceId) -> Result<FenceId> {
        Ok(FenceId(self.fences.cycle_next(id.0)?))
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        unsafe {
            for &semaphore in self.semaphores.iter() {
                self.device.device.destroy_semaphore(semaphore, None);
            }
            for &fence in self.fences.iter() {
                self.device.device.destroy_fence(fence, None);
            }
        }
    }
}
