// Command buffer pooling
//
// One command pool per device context, flagged so individual buffers can be
// reset. Buffers are tracked behind generation-checked ids: an id must be
// re-resolved through the manager on every use, and ids issued before a pool
// reset fail to resolve instead of aliasing a recycled buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::slots::{SlotId, Slots};
use super::DeviceContext;

/// Opaque, generation-checked handle to a pooled command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId(SlotId);

pub struct CommandManager {
    pool: vk::CommandPool,
    buffers: Slots<vk::CommandBuffer>,
    device: Arc<DeviceContext>,
}

impl CommandManager {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            buffers: Slots::new("command buffer"),
            device,
        })
    }

    pub fn allocate_buffer(&mut self) -> Result<CommandBufferId> {
        Ok(self.allocate_buffers(1)?.remove(0))
    }

    pub fn allocate_buffers(&mut self, count: u32) -> Result<Vec<CommandBufferId>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(buffers
            .into_iter()
            .map(|buffer| CommandBufferId(self.buffers.insert(buffer)))
            .collect())
    }

    /// Resolve an id to the live handle. Ids do not survive `reset_pool` or
    /// `free_buffer`; stale ones yield an error here.
    pub fn buffer(&self, id: CommandBufferId) -> Result<vk::CommandBuffer> {
        Ok(*self.buffers.get(id.0)?)
    }

    pub fn free_buffer(&mut self, id: CommandBufferId) -> Result<()> {
        self.free_buffers(&[id])
    }

    pub fn free_buffers(&mut self, ids: &[CommandBufferId]) -> Result<()> {
        let mut handles = Vec::with_capacity(ids.len());
        for &id in ids {
            handles.push(self.buffers.remove(id.0)?);
        }
        unsafe { self.device.device.free_command_buffers(self.pool, &handles) };
        Ok(())
    }

    /// Begin recording with a one-time-submit usage hint.
    pub fn begin(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.device.begin_command_buffer(command_buffer, &begin_info) }
            .context("Failed to begin command buffer")?;
        Ok(())
    }

    pub fn end(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(command_buffer) }
            .context("Failed to end command buffer")?;
        Ok(())
    }

    /// Reset a single buffer for re-recording. The caller is responsible for
    /// the fence discipline: never reset a buffer whose guarding fence is
    /// unsignaled.
    pub fn reset(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")?;
        Ok(())
    }

    /// Fire-and-forget submission without synchronization. Used by the
    /// one-shot `execute` path which waits for queue idle afterwards.
    pub fn submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> Result<()> {
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
        }
        .context("Failed to submit command buffer")?;
        Ok(())
    }

    /// Release every buffer at once. All outstanding ids go stale.
    pub fn reset_pool(&mut self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }
        .context("Failed to reset command pool")?;

        let handles: Vec<_> = self.buffers.iter().copied().collect();
        if !handles.is_empty() {
            unsafe { self.device.device.free_command_buffers(self.pool, &handles) };
        }
        self.buffers.clear();
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for CommandManager {
    fn drop(&mut self) {
        // Destroying the pool frees any remaining buffers with it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
