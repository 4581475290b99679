use std::collections::HashMap;
use std::ffi::CString;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::types::{BindingKind, BindingLayoutDesc, PipelineDesc};
use crate::renderer::contexts::device_ctx::vulkan::conv;
use crate::renderer::error::{configuration_error, driver_error, DriverResultExt};
use crate::renderer::resources::material::PolygonMode;

#[derive(Debug, Clone, Copy)]
pub struct LayoutPair {
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

/// Set and pipeline layouts, shared by every pipeline and binding set of the same shape.
#[derive(Default)]
pub struct LayoutCache {
    layouts: HashMap<BindingLayoutDesc, LayoutPair>,
}

impl LayoutCache {
    pub fn get_or_create(&mut self, device: &ash::Device, desc: &BindingLayoutDesc) -> Result<LayoutPair> {
        if let Some(pair) = self.layouts.get(desc) {
            return Ok(*pair);
        }
        const OP: &str = "create binding layout";
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .entries
            .iter()
            .map(|entry| {
                let stages = match entry.kind {
                    BindingKind::UniformBuffer { .. } => vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    BindingKind::SampledImage | BindingKind::Sampler => vk::ShaderStageFlags::FRAGMENT,
                };
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(conv::descriptor_type(entry.kind))
                    .descriptor_count(1)
                    .stage_flags(stages)
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        }
        .driver_err(OP)?;
        let set_layouts = [set_layout];
        let pipeline_layout = match unsafe {
            device.create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts), None)
        } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err).driver_err(OP);
            }
        };
        let pair = LayoutPair {
            set_layout,
            pipeline_layout,
        };
        self.layouts.insert(desc.clone(), pair);
        Ok(pair)
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, pair) in self.layouts.drain() {
            unsafe {
                device.destroy_pipeline_layout(pair.pipeline_layout, None);
                device.destroy_descriptor_set_layout(pair.set_layout, None);
            }
        }
    }
}

pub struct VkPipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// Builds a dynamic-rendering graphics pipeline with dynamic viewport and scissor.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    layouts: &mut LayoutCache,
    desc: &PipelineDesc,
    fill_mode_non_solid: bool,
) -> Result<VkPipeline> {
    const OP: &str = "create_pipeline";
    if desc.state.polygon_mode == PolygonMode::Line && !fill_mode_non_solid {
        return Err(configuration_error(
            OP,
            format!("`{}`: wireframe fill is not supported on this device", desc.label),
        ));
    }
    let layout = layouts.get_or_create(device, &desc.binding_layout)?;

    let program = &desc.program;
    let vertex_module = shader_module(device, program.vertex_spirv())?;
    let fragment_module = match shader_module(device, program.fragment_spirv()) {
        Ok(module) => module,
        Err(err) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(err);
        }
    };
    let result = build(device, layout.pipeline_layout, desc, vertex_module, fragment_module);
    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }
    Ok(VkPipeline {
        raw: result?,
        layout: layout.pipeline_layout,
    })
}

fn shader_module(device: &ash::Device, spirv: &[u32]) -> Result<vk::ShaderModule> {
    unsafe { device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None) }
        .driver_err("create_shader_module")
}

fn build(
    device: &ash::Device,
    pipeline_layout: vk::PipelineLayout,
    desc: &PipelineDesc,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let program = &desc.program;
    let vertex_entry =
        CString::new(program.vertex_entry()).map_err(|e| configuration_error("create_pipeline", e.to_string()))?;
    let fragment_entry =
        CString::new(program.fragment_entry()).map_err(|e| configuration_error("create_pipeline", e.to_string()))?;
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(&vertex_entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(&fragment_entry),
    ];

    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_buffers
        .iter()
        .enumerate()
        .map(|(slot, layout)| vk::VertexInputBindingDescription {
            binding: slot as u32,
            stride: layout.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_buffers
        .iter()
        .enumerate()
        .flat_map(|(slot, layout)| {
            layout.attributes.iter().map(move |attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: slot as u32,
                format: conv::vertex_format(attribute.format),
                offset: attribute.offset,
            })
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(conv::topology(desc.topology));
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let state = &desc.state;
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(conv::polygon_mode(state.polygon_mode))
        .cull_mode(conv::cull_mode(state.cull))
        .front_face(conv::front_face(state.front_face))
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = match desc.depth_format {
        Some(_) => vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_test && state.depth_write)
            .depth_compare_op(conv::compare_op(state.depth_compare))
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0),
        None => vk::PipelineDepthStencilStateCreateInfo::default(),
    };
    let blend_attachments = [conv::blend_attachment(state.blend)];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [conv::texture_format(desc.color_format)];
    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(
            desc.depth_format
                .map(conv::texture_format)
                .unwrap_or(vk::Format::UNDEFINED),
        );

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(pipeline_layout)
        .push_next(&mut rendering);

    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) }
        .map_err(|(_, err)| err)
        .driver_err("create_pipeline")?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| driver_error("create_pipeline", "driver returned no pipeline"))
}
