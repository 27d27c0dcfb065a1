// Shader module loading
//
// Vulkan consumes SPIR-V bytecode compiled by an external build step;
// this layer only turns the opaque byte blobs into shader modules.

use anyhow::{ensure, Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Creates a shader module from a SPIR-V byte blob.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words
    ensure!(
        code.len() % 4 == 0 && !code.is_empty(),
        "SPIR-V blob has invalid length {}",
        code.len()
    );
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Failed to decode SPIR-V words")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
