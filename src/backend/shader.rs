// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Binaries are read from the asset
// directory at startup; a missing or unreadable file is a setup failure.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::DeviceContext;

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &DeviceContext, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = ash::util::read_spv(&mut Cursor::new(code))
        .context("Shader bytecode is not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled SPIR-V shader from disk.
pub fn load_shader<P: AsRef<Path>>(device: &DeviceContext, path: P) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file: {:?}", path))?;
    create_shader_module(device, &bytes)
        .with_context(|| format!("Failed to build shader module from {:?}", path))
}
