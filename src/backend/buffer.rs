// GPU memory-backed buffers
//
// Vertex, index, uniform, and staging buffers. Device-local data is
// populated by staging through a host-visible buffer and an explicit copy
// command, never by direct mapping.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandManager;
use super::DeviceContext;

/// A buffer plus its memory allocation. Exclusively owned by whoever
/// constructed it; the allocation is freed on drop, which must not happen
/// while a fence guarding its last use is unsignaled.
pub struct Buffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    device: Arc<DeviceContext>,
}

impl Buffer {
    /// Create a buffer of `size` bytes with the given usage, backed by
    /// memory with the requested properties.
    pub fn new(
        device: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        anyhow::ensure!(size > 0, "Buffer size must be non-zero");

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index =
            find_memory_type(&device, requirements.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(Self {
            buffer,
            memory,
            size,
            device,
        })
    }

    /// Create a host-visible buffer and fill it with `data`.
    pub fn from_slice<T: Copy>(
        device: Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes = as_bytes(data);
        let buffer = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.upload_bytes(bytes, 0)?;
        Ok(buffer)
    }

    /// Standard path for device-local data: stage through a host-visible
    /// buffer and issue a one-shot copy into fast memory. The staging buffer
    /// is discarded once the copy has completed.
    ///
    /// TRANSFER_SRC is added alongside TRANSFER_DST so the buffer can later
    /// be read back through a second staging copy.
    pub fn device_local_with_data(
        device: &Arc<DeviceContext>,
        commands: &mut CommandManager,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let size = bytes.len() as vk::DeviceSize;

        let staging = Self::new(
            device.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.upload_bytes(bytes, 0)?;

        let destination = Self::new(
            device.clone(),
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        device.execute(commands, |cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe {
                device
                    .device
                    .cmd_copy_buffer(cmd, staging.buffer, destination.buffer, &[region]);
            }
        })?;

        log::debug!("Uploaded {} bytes to device-local buffer", size);
        Ok(destination)
    }

    /// Copy `bytes` into host-visible (and coherent) memory at `offset`.
    pub fn upload_bytes(&self, bytes: &[u8], offset: vk::DeviceSize) -> Result<()> {
        anyhow::ensure!(
            offset + bytes.len() as vk::DeviceSize <= self.size,
            "Upload of {} bytes at offset {} exceeds buffer size {}",
            bytes.len(),
            offset,
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(
                    self.memory,
                    offset,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .context("Failed to map buffer memory")? as *mut u8;

            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Read the buffer's content back through a second staging copy.
    pub fn read_back(
        &self,
        device: &Arc<DeviceContext>,
        commands: &mut CommandManager,
    ) -> Result<Vec<u8>> {
        let staging = Self::new(
            device.clone(),
            self.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        device.execute(commands, |cmd| {
            let region = vk::BufferCopy::builder().size(self.size).build();
            unsafe {
                device
                    .device
                    .cmd_copy_buffer(cmd, self.buffer, staging.buffer, &[region]);
            }
        })?;

        let mut bytes = vec![0u8; self.size as usize];
        unsafe {
            let ptr = device
                .device
                .map_memory(staging.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map readback memory")? as *const u8;
            std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), self.size as usize);
            device.device.unmap_memory(staging.memory);
        }

        Ok(bytes)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Find a memory type matching the requirement bits and property flags.
pub fn find_memory_type(
    device: &DeviceContext,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let memory_properties = &device.memory_properties;

    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            data.as_ptr() as *const u8,
            std::mem::size_of_val(data),
        )
    }
}
