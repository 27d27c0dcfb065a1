// Graphics pipeline creation and management
//
// The render pass and framebuffers for presenting, plus a declarative
// pipeline descriptor from which pipeline objects can be rebuilt at any
// time (startup or hot reload) given fresh SPIR-V blobs.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;

use super::shader;
use super::VulkanDevice;

/// Create a render pass with a single color attachment that ends up
/// ready for presentation.
pub fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create one framebuffer per swapchain image view.
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| {
            let attachments = &[image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")
            }
        })
        .collect()
}

/// Declarative pipeline state. Everything needed to rebuild the
/// pipeline object from fresh shader binaries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineDesc {
    pub topology: Topology,
    pub polygon_mode: PolygonMode,
    pub cull_backfaces: bool,
    pub alpha_blend: bool,
    pub vertex_stride: u32,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub push_constant_bytes: u32,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            topology: Topology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_backfaces: true,
            alpha_blend: false,
            vertex_stride: 0,
            vertex_attributes: Vec::new(),
            push_constant_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

impl Topology {
    fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
            Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolygonMode {
    Fill,
    Line,
}

impl PolygonMode {
    fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    fn to_vk(self) -> vk::Format {
        match self {
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// Create the pipeline layout for a descriptor. Layouts do not depend
/// on shader binaries, so one layout outlives any number of rebuilds.
pub fn create_pipeline_layout(
    device: &VulkanDevice,
    desc: &PipelineDesc,
) -> Result<vk::PipelineLayout> {
    let mut layout_info = vk::PipelineLayoutCreateInfo::builder();

    let push_constant_ranges;
    if desc.push_constant_bytes > 0 {
        push_constant_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(desc.push_constant_bytes)
            .build()];
        layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
    }

    unsafe {
        device
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

/// Build a graphics pipeline from a descriptor and vertex/fragment
/// SPIR-V blobs. The shader modules only live for the duration of the
/// call.
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
    vert_spv: &[u8],
    frag_spv: &[u8],
) -> Result<vk::Pipeline> {
    let vert_module = shader::create_shader_module(device, vert_spv)?;
    let frag_module = shader::create_shader_module(device, frag_spv).map_err(|e| {
        unsafe { device.device.destroy_shader_module(vert_module, None) };
        e
    })?;

    let result = build_pipeline(device, render_pass, extent, layout, desc, vert_module, frag_module);

    unsafe {
        device.device.destroy_shader_module(vert_module, None);
        device.device.destroy_shader_module(frag_module, None);
    }

    result
}

fn build_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let entry_point = std::ffi::CString::new("main").unwrap();

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_module)
        .name(&entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_module)
        .name(&entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input from the descriptor
    let bindings = if desc.vertex_stride > 0 {
        vec![vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(desc.vertex_stride)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()]
    } else {
        Vec::new()
    };
    let attributes: Vec<_> = desc
        .vertex_attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(attr.location)
                .format(attr.format.to_vk())
                .offset(attr.offset)
                .build()
        })
        .collect();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology.to_vk())
        .primitive_restart_enable(false);

    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode.to_vk())
        .line_width(1.0)
        .cull_mode(if desc.cull_backfaces {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = if desc.alpha_blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
            .context("Failed to create graphics pipeline")?
    };

    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_defaults_are_minimal() {
        let desc = PipelineDesc::default();
        assert_eq!(desc.topology, Topology::TriangleList);
        assert_eq!(desc.vertex_stride, 0);
        assert!(desc.vertex_attributes.is_empty());
        assert_eq!(desc.push_constant_bytes, 0);
    }

    #[test]
    fn desc_parses_from_toml() {
        let desc: PipelineDesc = toml::from_str(
            r#"
            topology = "triangle_strip"
            polygon_mode = "line"
            cull_backfaces = false
            vertex_stride = 24
            vertex_attributes = [
                { location = 0, format = "float32x3", offset = 0 },
                { location = 1, format = "float32x3", offset = 12 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(desc.topology, Topology::TriangleStrip);
        assert_eq!(desc.polygon_mode, PolygonMode::Line);
        assert!(!desc.cull_backfaces);
        assert_eq!(desc.vertex_attributes.len(), 2);
        assert_eq!(desc.vertex_attributes[1].offset, 12);
    }

    #[test]
    fn vertex_format_maps_to_vk() {
        assert_eq!(VertexFormat::Float32x2.to_vk(), vk::Format::R32G32_SFLOAT);
        assert_eq!(
            VertexFormat::Float32x4.to_vk(),
            vk::Format::R32G32B32A32_SFLOAT
        );
        assert_eq!(
            Topology::PointList.to_vk(),
            vk::PrimitiveTopology::POINT_LIST
        );
    }
}
