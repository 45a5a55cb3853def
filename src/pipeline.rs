//! Pipeline assembly.
//!
//! Descriptor-set layouts are derived purely from program reflections: the
//! union of bindings across stages, which must agree on type and count
//! wherever they overlap, with sets contiguous from 0. Pipelines are then
//! built with the fixed function state this renderer commits to: no vertex
//! input (programs fetch from storage buffers), triangle lists, dynamic
//! viewport/scissor, a GREATER depth compare (reverse depth), and one fixed
//! alpha-blend state replicated across every color target.

use ash::vk;
use smallvec::SmallVec;

use crate::device::Device;
use crate::memory::GpuAllocator;
use crate::program::Program;
use crate::render_pass::RenderPass;
use crate::resource::{ObjectId, ObjectKind};
use crate::spirv::{Reflection, UniformKind};
use crate::types::{DepthState, SpecConstant, StencilOpState};
use crate::utils;

pub const MAX_DESCRIPTOR_SETS: usize = 8;
pub const SETS_PER_POOL: u32 = 32;

pub fn to_vk_descriptor_type(kind: UniformKind) -> vk::DescriptorType {
    match kind {
        UniformKind::Sampler => vk::DescriptorType::SAMPLER,
        UniformKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        UniformKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        UniformKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        UniformKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        UniformKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        UniformKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        UniformKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        UniformKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

#[derive(Clone, Debug, Default)]
pub struct SetLayoutSpec {
    pub bindings: Vec<LayoutBinding>,
}

/// Pure layout derivation: a function of the reflections only, independent
/// of frame number or any prior state.
pub fn derive_set_layouts(reflections: &[&Reflection]) -> Vec<SetLayoutSpec> {
    let mut used_sets = 0usize;
    for reflection in reflections {
        for uniform in &reflection.uniforms {
            assert!(
                (uniform.set as usize) < MAX_DESCRIPTOR_SETS,
                "descriptor set index {} is out of range",
                uniform.set
            );
            used_sets = used_sets.max(uniform.set as usize + 1);
        }
    }

    let mut specs: Vec<SetLayoutSpec> = (0..used_sets).map(|_| SetLayoutSpec::default()).collect();
    for reflection in reflections {
        let stage = match reflection.stage {
            crate::spirv::ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            crate::spirv::ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            crate::spirv::ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        };
        for uniform in &reflection.uniforms {
            let descriptor_type = to_vk_descriptor_type(uniform.kind);
            let spec = &mut specs[uniform.set as usize];
            match spec
                .bindings
                .iter_mut()
                .find(|b| b.binding == uniform.binding)
            {
                Some(existing) => {
                    assert!(
                        existing.descriptor_type == descriptor_type
                            && existing.descriptor_count == uniform.descriptor_count,
                        "binding (set {}, binding {}) disagrees between shader stages",
                        uniform.set,
                        uniform.binding
                    );
                    existing.stage_flags |= stage;
                }
                None => spec.bindings.push(LayoutBinding {
                    binding: uniform.binding,
                    descriptor_type,
                    descriptor_count: uniform.descriptor_count,
                    stage_flags: stage,
                }),
            }
        }
    }

    for (it, spec) in specs.iter_mut().enumerate() {
        assert!(
            !spec.bindings.is_empty(),
            "empty descriptor set {} in between non-empty ones",
            it
        );
        spec.bindings.sort_by_key(|b| b.binding);
    }
    specs
}

/// Aggregates a layout's descriptor counts by type, scaled by the number of
/// sets one pool should serve.
pub fn pool_sizes_for(spec: &SetLayoutSpec) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in &spec.bindings {
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += binding.descriptor_count * SETS_PER_POOL,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: binding.descriptor_count * SETS_PER_POOL,
            }),
        }
    }
    sizes
}

pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    pub bindings: SmallVec<[LayoutBinding; 8]>,
    pub pool_sizes: SmallVec<[vk::DescriptorPoolSize; 8]>,
}

impl DescriptorSetLayout {
    pub fn binding(&self, binding: u32) -> &LayoutBinding {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .unwrap_or_else(|| panic!("binding {} is not part of this set layout", binding))
    }
}

pub struct Pipeline {
    pub object: ObjectId,
    pub bind_point: vk::PipelineBindPoint,
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layouts: SmallVec<[DescriptorSetLayout; MAX_DESCRIPTOR_SETS]>,
}

pub struct StageInfo<'a> {
    pub program: &'a Program,
    pub constants: &'a [SpecConstant],
}

pub struct GraphicsPipelineCreateInfo<'a> {
    pub render_pass: &'a RenderPass,
    pub vertex: StageInfo<'a>,
    pub fragment: StageInfo<'a>,
    pub front_stencil: Option<StencilOpState>,
    pub back_stencil: Option<StencilOpState>,
    pub depth: DepthState,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub sampling: vk::SampleCountFlags,
}

struct Specialization {
    entries: Vec<vk::SpecializationMapEntry>,
    data: Vec<u8>,
}

impl Specialization {
    fn new(constants: &[SpecConstant]) -> Specialization {
        let mut entries = Vec::with_capacity(constants.len());
        let mut data = Vec::with_capacity(constants.len() * 4);
        for (it, constant) in constants.iter().enumerate() {
            entries.push(vk::SpecializationMapEntry {
                constant_id: constant.constant_id,
                offset: (it * 4) as u32,
                size: 4,
            });
            data.extend_from_slice(&constant.value.bits().to_ne_bytes());
        }
        Specialization { entries, data }
    }

    fn info(&self) -> vk::SpecializationInfo {
        vk::SpecializationInfo::builder()
            .map_entries(&self.entries)
            .data(&self.data)
            .build()
    }
}

fn create_layouts(
    device: &Device,
    reflections: &[&Reflection],
) -> (
    vk::PipelineLayout,
    SmallVec<[DescriptorSetLayout; MAX_DESCRIPTOR_SETS]>,
) {
    let specs = derive_set_layouts(reflections);
    let mut set_layouts: SmallVec<[DescriptorSetLayout; MAX_DESCRIPTOR_SETS]> = SmallVec::new();
    for spec in &specs {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = spec
            .bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                descriptor_count: b.descriptor_count,
                stage_flags: b.stage_flags,
                p_immutable_samplers: std::ptr::null(),
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        let handle = unsafe {
            device
                .raw()
                .create_descriptor_set_layout(&create_info, device.callbacks())
                .expect("vkCreateDescriptorSetLayout failed")
        };
        set_layouts.push(DescriptorSetLayout {
            handle,
            bindings: SmallVec::from_vec(spec.bindings.clone()),
            pool_sizes: SmallVec::from_vec(pool_sizes_for(spec)),
        });
    }

    let handles: SmallVec<[vk::DescriptorSetLayout; MAX_DESCRIPTOR_SETS]> =
        set_layouts.iter().map(|l| l.handle).collect();
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&handles);
    let layout = unsafe {
        device
            .raw()
            .create_pipeline_layout(&layout_info, device.callbacks())
            .expect("vkCreatePipelineLayout failed")
    };
    (layout, set_layouts)
}

impl Pipeline {
    pub fn new_graphics(device: &Device, info: &GraphicsPipelineCreateInfo) -> Pipeline {
        let vertex_reflection = &info.vertex.program.reflection;
        let fragment_reflection = &info.fragment.program.reflection;
        assert!(
            !vertex_reflection.has_non_builtin_inputs,
            "vertex shader inputs are not supported; fetch vertex data from storage buffers"
        );
        assert!(
            !vertex_reflection.has_push_constants && !fragment_reflection.has_push_constants,
            "push constants are not supported"
        );

        let (layout, set_layouts) =
            create_layouts(device, &[vertex_reflection, fragment_reflection]);

        let vertex_spec = Specialization::new(info.vertex.constants);
        let fragment_spec = Specialization::new(info.fragment.constants);
        let vertex_spec_info = vertex_spec.info();
        let fragment_spec_info = fragment_spec.info();
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(info.vertex.program.handle)
                .name(&info.vertex.program.entry_point)
                .specialization_info(&vertex_spec_info)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(info.fragment.program.handle)
                .name(&info.fragment.program.entry_point)
                .specialization_info(&fragment_spec_info)
                .build(),
        ];

        // programs fetch everything from storage buffers
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder().build();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false)
            .build();
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(info.polygon_mode)
            .cull_mode(info.cull_mode)
            .front_face(info.front_face)
            .depth_bias_enable(false)
            .line_width(1.0)
            .build();
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(utils::pick_sample_count(
                info.sampling,
                device.supported_framebuffer_sample_counts(),
            ))
            .build();

        // Reverse depth everywhere, so the compare op is hard-coded to
        // GREATER. Changing this requires reevaluating the projection
        // matrices and the render pass depth clear values.
        let stencil_enabled =
            device.has_stencil() && (info.front_stencil.is_some() || info.back_stencil.is_some());
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(info.depth.test_enabled)
            .depth_write_enable(info.depth.write_enabled)
            .depth_compare_op(vk::CompareOp::GREATER)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(stencil_enabled)
            .front(
                info.front_stencil
                    .as_ref()
                    .map(utils::to_vk_stencil_op_state)
                    .unwrap_or_default(),
            )
            .back(
                info.back_stencil
                    .as_ref()
                    .map(utils::to_vk_stencil_op_state)
                    .unwrap_or_default(),
            )
            .build();

        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        };
        let blend_attachments =
            vec![blend_attachment; info.render_pass.num_color_attachments as usize];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(info.render_pass.handle)
            .subpass(0);
        let handle = unsafe {
            device
                .raw()
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    &[create_info.build()],
                    device.callbacks(),
                )
                .expect("vkCreateGraphicsPipelines failed")[0]
        };

        Pipeline {
            object: ObjectId::new(ObjectKind::GraphicsPipeline),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            handle,
            layout,
            set_layouts,
        }
    }

    pub fn new_compute(device: &Device, stage: &StageInfo) -> Pipeline {
        let reflection = &stage.program.reflection;
        assert!(
            !reflection.has_push_constants,
            "push constants are not supported"
        );

        let (layout, set_layouts) = create_layouts(device, &[reflection]);

        let spec = Specialization::new(stage.constants);
        let spec_info = spec.info();
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(stage.program.handle)
            .name(&stage.program.entry_point)
            .specialization_info(&spec_info)
            .build();
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info)
            .layout(layout);
        let handle = unsafe {
            device
                .raw()
                .create_compute_pipelines(
                    vk::PipelineCache::null(),
                    &[create_info.build()],
                    device.callbacks(),
                )
                .expect("vkCreateComputePipelines failed")[0]
        };

        Pipeline {
            object: ObjectId::new(ObjectKind::ComputePipeline),
            bind_point: vk::PipelineBindPoint::COMPUTE,
            handle,
            layout,
            set_layouts,
        }
    }

    /// Creates a fresh descriptor pool sized for `set`.
    pub fn create_descriptor_pool(&self, device: &Device, set: u32) -> vk::DescriptorPool {
        let layout = &self.set_layouts[set as usize];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&layout.pool_sizes);
        unsafe {
            device
                .raw()
                .create_descriptor_pool(&create_info, device.callbacks())
                .expect("vkCreateDescriptorPool failed")
        }
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        unsafe {
            for layout in &self.set_layouts {
                device
                    .raw()
                    .destroy_descriptor_set_layout(layout.handle, device.callbacks());
            }
            device.raw().destroy_pipeline(self.handle, device.callbacks());
            device
                .raw()
                .destroy_pipeline_layout(self.layout, device.callbacks());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::{ShaderStage, Uniform};
    use crate::types::ComputeWorkgroupSize;

    fn reflection(stage: ShaderStage, uniforms: Vec<Uniform>) -> Reflection {
        Reflection {
            stage,
            entry_point: "main".into(),
            uniforms,
            has_non_builtin_inputs: false,
            has_push_constants: false,
            workgroup_size: ComputeWorkgroupSize::default(),
        }
    }

    fn uniform(set: u32, binding: u32, kind: UniformKind, count: u32) -> Uniform {
        Uniform {
            set,
            binding,
            kind,
            descriptor_count: count,
        }
    }

    #[test]
    fn merges_bindings_across_stages() {
        let vertex = reflection(
            ShaderStage::Vertex,
            vec![uniform(0, 0, UniformKind::UniformBuffer, 1)],
        );
        let fragment = reflection(
            ShaderStage::Fragment,
            vec![
                uniform(0, 0, UniformKind::UniformBuffer, 1),
                uniform(0, 1, UniformKind::CombinedImageSampler, 1),
            ],
        );
        let specs = derive_set_layouts(&[&vertex, &fragment]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].bindings.len(), 2);
        let shared = &specs[0].bindings[0];
        assert_eq!(shared.binding, 0);
        assert_eq!(
            shared.stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        let fragment_only = &specs[0].bindings[1];
        assert_eq!(fragment_only.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn derivation_is_pure() {
        let compute = reflection(
            ShaderStage::Compute,
            vec![
                uniform(0, 0, UniformKind::StorageBuffer, 1),
                uniform(1, 2, UniformKind::StorageImage, 1),
                uniform(1, 0, UniformKind::UniformBuffer, 1),
            ],
        );
        let first = derive_set_layouts(&[&compute]);
        let second = derive_set_layouts(&[&compute]);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.bindings, b.bindings);
        }
        // bindings come out ordered
        assert_eq!(first[1].bindings[0].binding, 0);
        assert_eq!(first[1].bindings[1].binding, 2);
    }

    #[test]
    #[should_panic]
    fn mismatched_types_across_stages_panic() {
        let vertex = reflection(
            ShaderStage::Vertex,
            vec![uniform(0, 0, UniformKind::UniformBuffer, 1)],
        );
        let fragment = reflection(
            ShaderStage::Fragment,
            vec![uniform(0, 0, UniformKind::StorageBuffer, 1)],
        );
        derive_set_layouts(&[&vertex, &fragment]);
    }

    #[test]
    #[should_panic]
    fn holes_between_sets_panic() {
        let compute = reflection(
            ShaderStage::Compute,
            vec![uniform(1, 0, UniformKind::StorageBuffer, 1)],
        );
        derive_set_layouts(&[&compute]);
    }

    #[test]
    fn pool_sizes_aggregate_by_type() {
        let spec = SetLayoutSpec {
            bindings: vec![
                LayoutBinding {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 4,
                    stage_flags: vk::ShaderStageFlags::FRAGMENT,
                },
                LayoutBinding {
                    binding: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 1,
                    stage_flags: vk::ShaderStageFlags::FRAGMENT,
                },
                LayoutBinding {
                    binding: 2,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 1,
                    stage_flags: vk::ShaderStageFlags::FRAGMENT,
                },
            ],
        };
        let sizes = pool_sizes_for(&spec);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[0].descriptor_count, 5 * SETS_PER_POOL);
        assert_eq!(sizes[1].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[1].descriptor_count, SETS_PER_POOL);
    }
}
