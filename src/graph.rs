//! The frame graph: pass recording and end-of-frame execution.
//!
//! Recording only appends descriptions; nothing touches the GPU until
//! `end_frame`, which acquires the swap-chain image, resolves render
//! passes, framebuffers, and pipelines through time-keyed caches, records
//! one command buffer per pass with the image-layout barriers each pass
//! needs, chains submissions through the dependency masks, and presents.
//!
//! Derived objects live in caches keyed by everything that went into
//! creating them. An entry untouched for more than `OBJECT_LIFETIME_FRAMES`
//! frames is destroyed at the next `begin_frame`.

use ash::vk;
use fxhash::FxHashMap;
use log::trace;
use smallvec::SmallVec;

use crate::command_buffer::QueueUsage;
use crate::device::Device;
use crate::frame::FrameManager;
use crate::framebuffer::{Framebuffer, FramebufferInfo};
use crate::memory::{MemoryManager, Pools};
use crate::pipeline::{GraphicsPipelineCreateInfo, Pipeline, StageInfo};
use crate::pool::Handle;
use crate::program::Program;
use crate::render_pass::{RenderPass, RenderPassAttachmentInfo, RenderPassInfo};
use crate::resource::{unref, Resource};
use crate::texture::Texture;
use crate::types::{
    BindInfo, BindingValue, ComputePassInfo, CullMode, DispatchInfo, DrawInfo, FrontFace,
    GraphicsPassInfo, PassDependencies, PolygonMode, ProgramRef, ProgramWithConstants,
    SamplingType, StencilOpState, TextureRef, MAX_PASS_DEPENDENCIES,
    MAX_SPECIALIZATION_CONSTANTS,
};
use crate::utils;

pub const OBJECT_LIFETIME_FRAMES: u64 = 20;
pub const MAX_POOLS_IN_ARRAY: usize = 64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum GraphContext {
    BetweenFrames,
    InFrame,
    InPass,
}

pub(crate) enum GraphCommand {
    Draw(DrawInfo),
    Dispatch(DispatchInfo),
    Bind(BindInfo),
}

pub(crate) enum PassDesc {
    Graphics {
        info: GraphicsPassInfo,
        render_pass_info: RenderPassInfo,
    },
    Compute {
        info: ComputePassInfo,
    },
}

struct GraphPass {
    desc: PassDesc,
    commands: Vec<GraphCommand>,
}

impl GraphPass {
    fn dependencies(&self) -> PassDependencies {
        match &self.desc {
            PassDesc::Graphics { info, .. } => info.dependencies,
            PassDesc::Compute { info } => info.dependencies,
        }
    }
}

struct Timed<T> {
    value: T,
    frame: u64,
}

/// Hashable identity of a program + specialization constants pair.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    program: ProgramRef,
    constants: SmallVec<[(u32, u32); MAX_SPECIALIZATION_CONSTANTS]>,
}

fn program_key(program: &ProgramWithConstants) -> ProgramKey {
    ProgramKey {
        program: program.program,
        constants: program
            .constants
            .iter()
            .map(|c| (c.constant_id, c.value.bits()))
            .collect(),
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct GraphicsPipelineKey {
    render_pass: Handle<RenderPass>,
    vertex: ProgramKey,
    fragment: ProgramKey,
    front_stencil: Option<StencilOpState>,
    back_stencil: Option<StencilOpState>,
    depth_test: bool,
    depth_write: bool,
    polygon_mode: PolygonMode,
    cull_mode: CullMode,
    front_face: FrontFace,
    sampling: SamplingType,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ComputePipelineKey {
    program: ProgramKey,
}

struct DescriptorPoolSlot {
    handle: vk::DescriptorPool,
    last_alloc_ok: bool,
}

#[derive(Default)]
struct DescriptorPoolArray {
    pools: Vec<DescriptorPoolSlot>,
    last_frame: u64,
}

pub struct Graph {
    context: GraphContext,
    passes: Vec<GraphPass>,
    render_passes: FxHashMap<crate::render_pass::RenderPassKey, Timed<Handle<RenderPass>>>,
    framebuffers: FxHashMap<FramebufferInfo, Timed<Handle<Framebuffer>>>,
    graphics_pipelines: FxHashMap<GraphicsPipelineKey, Timed<Handle<Pipeline>>>,
    compute_pipelines: FxHashMap<ComputePipelineKey, Timed<Handle<Pipeline>>>,
    /// Keyed by `(pipeline, frame slot)` so resetting a slot's descriptors
    /// stays proportional to the pipelines used that frame.
    descriptor_pools: FxHashMap<(Handle<Pipeline>, u64), DescriptorPoolArray>,
}

/// A cache entry is expired once it has gone unused for more than the
/// lifetime window.
pub(crate) fn is_expired(last_touched: u64, current_frame: u64) -> bool {
    current_frame - last_touched > OBJECT_LIFETIME_FRAMES
}

/// Checks that a dependency mask only names passes recorded earlier.
pub(crate) fn validate_pass_dependencies(pass_index: usize, dependencies: PassDependencies) {
    assert!(
        pass_index < MAX_PASS_DEPENDENCIES,
        "too many passes in one frame ({} max)",
        MAX_PASS_DEPENDENCIES
    );
    let allowed = (1u64 << pass_index) - 1;
    assert!(
        dependencies & !allowed == 0,
        "pass {} depends on a pass that is not recorded yet",
        pass_index
    );
}

/// Merges a desired layout into a texture's planned layout. Conflicting
/// intents fall back to GENERAL, which every access can live with.
pub(crate) fn merge_planned_layout(
    existing: Option<vk::ImageLayout>,
    desired: vk::ImageLayout,
) -> vk::ImageLayout {
    match existing {
        None => desired,
        Some(layout) if layout == desired => layout,
        Some(_) => vk::ImageLayout::GENERAL,
    }
}

fn texture_handle(pools: &Pools, texture: TextureRef) -> Handle<Texture> {
    assert!(!texture.is_swap_chain);
    let handle = Handle::new(texture.index, texture.generation);
    let _ = unref(pools, handle);
    handle
}

fn program<'a>(pools: &'a Pools, re: ProgramRef) -> &'a Program {
    unref(pools, Handle::new(re.index, re.generation))
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            context: GraphContext::BetweenFrames,
            passes: Vec::new(),
            render_passes: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            graphics_pipelines: FxHashMap::default(),
            compute_pipelines: FxHashMap::default(),
            descriptor_pools: FxHashMap::default(),
        }
    }

    /// Drops cache entries that have not been touched for the lifetime
    /// window and destroys their backing objects.
    pub fn begin_frame(&mut self, device: &Device, mem: &mut MemoryManager, current_frame: u64) {
        assert_eq!(self.context, GraphContext::BetweenFrames);

        let mut dead_pools = Vec::new();
        self.descriptor_pools.retain(|_, array| {
            if is_expired(array.last_frame, current_frame) {
                dead_pools.append(&mut array.pools);
                false
            } else {
                true
            }
        });
        for pool in dead_pools {
            unsafe {
                device
                    .raw()
                    .destroy_descriptor_pool(pool.handle, device.callbacks());
            }
        }

        evict_cache(&mut self.graphics_pipelines, device, mem, current_frame);
        evict_cache(&mut self.compute_pipelines, device, mem, current_frame);
        evict_cache(&mut self.framebuffers, device, mem, current_frame);
        evict_cache(&mut self.render_passes, device, mem, current_frame);

        self.passes.clear();
        self.context = GraphContext::InFrame;
    }

    pub fn begin_graphics_pass(
        &mut self,
        device: &Device,
        pools: &Pools,
        info: GraphicsPassInfo,
    ) -> PassDependencies {
        assert_eq!(self.context, GraphContext::InFrame);
        let pass_index = self.passes.len();
        validate_pass_dependencies(pass_index, info.dependencies);
        assert!(info.render_targets.len() <= crate::types::MAX_PASS_RENDER_TARGETS);
        assert_eq!(
            info.depth.test_enabled || info.depth.write_enabled,
            info.depth_stencil_target.is_some(),
            "depth test/write requires a depth-stencil target, and a depth-stencil \
             target requires depth test or write"
        );

        let mut color_attachments: SmallVec<
            [RenderPassAttachmentInfo; crate::types::MAX_PASS_RENDER_TARGETS],
        > = SmallVec::new();
        for target in &info.render_targets {
            let format = if target.texture.is_swap_chain {
                device.swap_chain().surface_format.format
            } else {
                pools
                    .textures
                    .access(texture_handle(pools, target.texture))
                    .unwrap()
                    .format
            };
            let is_default_clear = target.clear_color == [0.0; 4];
            assert!(
                is_default_clear || utils::is_float_sampled_format(format),
                "clear values are only supported for floating-point render targets"
            );
            for component in target.clear_color {
                assert!(
                    (0.0..=1.0).contains(&component),
                    "clear values must be in [0.0, 1.0]"
                );
            }
            color_attachments.push(RenderPassAttachmentInfo {
                format,
                load_op: utils::to_vk_load_op(target.load_op),
                sampling: vk::SampleCountFlags::TYPE_1,
                clear_color: target.clear_color,
            });
        }
        let depth_stencil_attachment = info.depth_stencil_target.as_ref().map(|target| {
            // depth targets always carry the device's depth-stencil format
            let _ = texture_handle(pools, target.texture);
            RenderPassAttachmentInfo {
                format: device.depth_stencil_format(),
                load_op: utils::to_vk_load_op(target.load_op),
                sampling: vk::SampleCountFlags::TYPE_1,
                clear_color: [0.0; 4],
            }
        });
        let has_depth = depth_stencil_attachment.is_some();
        let render_pass_info = RenderPassInfo {
            color_attachments,
            depth_stencil_attachment,
            depth_read: has_depth,
            depth_write: has_depth,
        };

        self.passes.push(GraphPass {
            desc: PassDesc::Graphics {
                info,
                render_pass_info,
            },
            commands: Vec::new(),
        });
        self.context = GraphContext::InPass;
        1u64 << pass_index
    }

    pub fn begin_compute_pass(&mut self, info: ComputePassInfo) -> PassDependencies {
        assert_eq!(self.context, GraphContext::InFrame);
        let pass_index = self.passes.len();
        validate_pass_dependencies(pass_index, info.dependencies);
        self.passes.push(GraphPass {
            desc: PassDesc::Compute { info },
            commands: Vec::new(),
        });
        self.context = GraphContext::InPass;
        1u64 << pass_index
    }

    pub fn end_pass(&mut self) {
        assert_eq!(self.context, GraphContext::InPass);
        self.context = GraphContext::InFrame;
    }

    pub fn bind(&mut self, info: BindInfo) {
        assert_eq!(self.context, GraphContext::InPass);
        assert!(
            !info.bindings.is_empty(),
            "a bind command without bindings is empty"
        );
        assert!(info.bindings.len() <= crate::types::MAX_BINDINGS);
        self.current_pass().commands.push(GraphCommand::Bind(info));
    }

    pub fn draw(&mut self, info: DrawInfo) {
        assert_eq!(self.context, GraphContext::InPass);
        self.current_pass().commands.push(GraphCommand::Draw(info));
    }

    pub fn dispatch(&mut self, info: DispatchInfo) {
        assert_eq!(self.context, GraphContext::InPass);
        self.current_pass()
            .commands
            .push(GraphCommand::Dispatch(info));
    }

    fn current_pass(&mut self) -> &mut GraphPass {
        self.passes.last_mut().expect("no pass is being recorded")
    }

    /// Executes the recorded frame and presents the swap-chain image.
    pub fn end_frame(
        &mut self,
        device: &Device,
        mem: &mut MemoryManager,
        frames: &mut FrameManager,
    ) {
        assert_eq!(self.context, GraphContext::InFrame);
        let current_frame = frames.frame_number;
        let slot_index = frames.active_slot_index();

        //
        // Acquire the next swap-chain image and wait for the last frame
        // that used this image index
        //
        let image_available = frames.active_slot().image_available;
        let (image_index, _) = unsafe {
            device
                .swapchain_loader
                .acquire_next_image(
                    device.swap_chain().handle,
                    u64::MAX,
                    image_available,
                    vk::Fence::null(),
                )
                .expect("vkAcquireNextImageKHR failed")
        };
        if let Some(previous_slot) = frames.image_to_slot[image_index as usize] {
            if let Some(&last) = frames.slots[previous_slot].command_buffers.last() {
                let fence = mem
                    .pools
                    .command_buffers
                    .access(last)
                    .expect("frame slot holds a dead command buffer")
                    .fence;
                unsafe {
                    device
                        .raw()
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .expect("vkWaitForFences failed");
                }
            }
        }
        frames.image_to_slot[image_index as usize] = Some(slot_index);

        let passes = std::mem::take(&mut self.passes);
        let num_passes = passes.len();
        trace!("executing frame {} with {} passes", current_frame, num_passes);

        //
        // Resolve render passes
        //
        let mut frame_render_passes: Vec<Option<Handle<RenderPass>>> =
            Vec::with_capacity(num_passes);
        for pass in &passes {
            match &pass.desc {
                PassDesc::Compute { .. } => frame_render_passes.push(None),
                PassDesc::Graphics {
                    render_pass_info, ..
                } => {
                    let key = render_pass_info.key();
                    let handle = match self.render_passes.get_mut(&key) {
                        Some(timed) => {
                            timed.frame = current_frame;
                            timed.value
                        }
                        None => {
                            let object = RenderPass::new(device, render_pass_info);
                            let handle = mem.pools.render_passes.take(object);
                            self.render_passes.insert(
                                key,
                                Timed {
                                    value: handle,
                                    frame: current_frame,
                                },
                            );
                            handle
                        }
                    };
                    frame_render_passes.push(Some(handle));
                }
            }
        }

        //
        // Resolve framebuffers
        //
        let mut frame_framebuffers: Vec<Option<Handle<Framebuffer>>> =
            Vec::with_capacity(num_passes);
        for (it, pass) in passes.iter().enumerate() {
            match &pass.desc {
                PassDesc::Compute { .. } => frame_framebuffers.push(None),
                PassDesc::Graphics { info, .. } => {
                    let render_pass = frame_render_passes[it].unwrap();
                    let mut textures: SmallVec<[Handle<Texture>; 9]> = SmallVec::new();
                    for target in &info.render_targets {
                        if target.texture.is_swap_chain {
                            textures.push(device.swap_chain_texture(image_index));
                        } else {
                            textures.push(texture_handle(&mem.pools, target.texture));
                        }
                    }
                    if let Some(depth) = &info.depth_stencil_target {
                        textures.push(texture_handle(&mem.pools, depth.texture));
                    }
                    let key = FramebufferInfo {
                        render_pass,
                        textures,
                    };
                    let handle = match self.framebuffers.get_mut(&key) {
                        Some(timed) => {
                            timed.frame = current_frame;
                            timed.value
                        }
                        None => {
                            let object = Framebuffer::new(device, &mem.pools, &key);
                            let handle = mem.pools.framebuffers.take(object);
                            self.framebuffers.insert(
                                key,
                                Timed {
                                    value: handle,
                                    frame: current_frame,
                                },
                            );
                            handle
                        }
                    };
                    frame_framebuffers.push(Some(handle));
                }
            }
        }

        //
        // Resolve pipelines
        //
        let mut frame_pipelines: Vec<Handle<Pipeline>> = Vec::with_capacity(num_passes);
        for (it, pass) in passes.iter().enumerate() {
            let handle = match &pass.desc {
                PassDesc::Compute { info } => {
                    let key = ComputePipelineKey {
                        program: program_key(&info.program),
                    };
                    match self.compute_pipelines.get_mut(&key) {
                        Some(timed) => {
                            timed.frame = current_frame;
                            timed.value
                        }
                        None => {
                            let object = {
                                let stage = StageInfo {
                                    program: program(&mem.pools, info.program.program),
                                    constants: &info.program.constants,
                                };
                                Pipeline::new_compute(device, &stage)
                            };
                            let handle = mem.pools.pipelines.take(object);
                            self.compute_pipelines.insert(
                                key,
                                Timed {
                                    value: handle,
                                    frame: current_frame,
                                },
                            );
                            handle
                        }
                    }
                }
                PassDesc::Graphics { info, .. } => {
                    let render_pass = frame_render_passes[it].unwrap();
                    let key = GraphicsPipelineKey {
                        render_pass,
                        vertex: program_key(&info.vertex_program),
                        fragment: program_key(&info.fragment_program),
                        front_stencil: info.front_stencil,
                        back_stencil: info.back_stencil,
                        depth_test: info.depth.test_enabled,
                        depth_write: info.depth.write_enabled,
                        polygon_mode: info.polygon_mode,
                        cull_mode: info.cull_mode,
                        front_face: info.front_face,
                        sampling: info.sampling,
                    };
                    match self.graphics_pipelines.get_mut(&key) {
                        Some(timed) => {
                            timed.frame = current_frame;
                            timed.value
                        }
                        None => {
                            let object = {
                                let create_info = GraphicsPipelineCreateInfo {
                                    render_pass: mem
                                        .pools
                                        .render_passes
                                        .access(render_pass)
                                        .unwrap(),
                                    vertex: StageInfo {
                                        program: program(&mem.pools, info.vertex_program.program),
                                        constants: &info.vertex_program.constants,
                                    },
                                    fragment: StageInfo {
                                        program: program(
                                            &mem.pools,
                                            info.fragment_program.program,
                                        ),
                                        constants: &info.fragment_program.constants,
                                    },
                                    front_stencil: info.front_stencil,
                                    back_stencil: info.back_stencil,
                                    depth: info.depth,
                                    polygon_mode: utils::to_vk_polygon_mode(info.polygon_mode),
                                    cull_mode: utils::to_vk_cull_mode(info.cull_mode),
                                    front_face: utils::to_vk_front_face(info.front_face),
                                    sampling: utils::to_vk_sample_count(info.sampling),
                                };
                                Pipeline::new_graphics(device, &create_info)
                            };
                            let handle = mem.pools.pipelines.take(object);
                            self.graphics_pipelines.insert(
                                key,
                                Timed {
                                    value: handle,
                                    frame: current_frame,
                                },
                            );
                            handle
                        }
                    }
                }
            };
            frame_pipelines.push(handle);
        }

        //
        // Reset the descriptor pools owned by the current frame slot
        //
        for (key, array) in self.descriptor_pools.iter_mut() {
            if key.1 != slot_index as u64 {
                continue;
            }
            for pool in &mut array.pools {
                pool.last_alloc_ok = true;
                unsafe {
                    device
                        .raw()
                        .reset_descriptor_pool(pool.handle, vk::DescriptorPoolResetFlags::empty())
                        .expect("vkResetDescriptorPool failed");
                }
            }
        }

        //
        // Record and submit one command buffer per pass
        //
        let mut present_waits: PassDependencies = 0;
        for (it, pass) in passes.iter().enumerate() {
            present_waits |= 1u64 << it;

            let pipeline_handle = frame_pipelines[it];
            self.descriptor_pools
                .entry((pipeline_handle, slot_index as u64))
                .or_default()
                .last_frame = current_frame;

            let usage = match pass.desc {
                PassDesc::Compute { .. } => QueueUsage::COMPUTE,
                PassDesc::Graphics { .. } => QueueUsage::GRAPHICS | QueueUsage::TRANSFER,
            };
            let cmd_handle = frames.get_cmd(device, mem, usage);
            let cmd_vk = mem.pools.command_buffers.access(cmd_handle).unwrap().handle;

            //
            // Plan the target layout of every texture this pass touches
            //
            let mut plan: Vec<(Handle<Texture>, vk::ImageLayout)> = Vec::new();
            if let PassDesc::Graphics { .. } = pass.desc {
                let framebuffer = mem
                    .pools
                    .framebuffers
                    .access(frame_framebuffers[it].unwrap())
                    .unwrap();
                let render_pass = mem
                    .pools
                    .render_passes
                    .access(frame_render_passes[it].unwrap())
                    .unwrap();
                for (tex_it, &texture) in framebuffer.textures.iter().enumerate() {
                    let layout = render_pass.attachment_layouts[tex_it];
                    let existing = plan.iter().find(|(h, _)| *h == texture).map(|(_, l)| *l);
                    let merged = merge_planned_layout(existing, layout);
                    match plan.iter_mut().find(|(h, _)| *h == texture) {
                        Some(entry) => entry.1 = merged,
                        None => plan.push((texture, merged)),
                    }
                }
            }
            for command in &pass.commands {
                let GraphCommand::Bind(bind) = command else {
                    continue;
                };
                for binding in &bind.bindings {
                    let BindingValue::Texture { texture, .. } = binding.value else {
                        continue;
                    };
                    let handle = if texture.is_swap_chain {
                        device.swap_chain_texture(image_index)
                    } else {
                        texture_handle(&mem.pools, texture)
                    };
                    let format = mem.pools.textures.access(handle).unwrap().format;
                    let desired = if utils::is_depth_stencil_format(format) {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                    let existing = plan.iter().find(|(h, _)| *h == handle).map(|(_, l)| *l);
                    let merged = merge_planned_layout(existing, desired);
                    match plan.iter_mut().find(|(h, _)| *h == handle) {
                        Some(entry) => entry.1 = merged,
                        None => plan.push((handle, merged)),
                    }
                }
            }

            //
            // Emit one barrier batch for every planned transition
            //
            let mut barriers: Vec<vk::ImageMemoryBarrier> = Vec::new();
            let mut src_stages = vk::PipelineStageFlags::empty();
            let mut dst_stages = vk::PipelineStageFlags::empty();
            for &(planned_handle, target_layout) in &plan {
                let texture = mem.pools.textures.access_mut(planned_handle).unwrap();
                if texture.current_layout == target_layout {
                    continue;
                }
                barriers.push(
                    vk::ImageMemoryBarrier::builder()
                        .src_access_mask(utils::image_layout_to_access_flags(
                            texture.current_layout,
                        ))
                        .dst_access_mask(utils::image_layout_to_access_flags(target_layout))
                        .old_layout(texture.current_layout)
                        .new_layout(target_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(texture.image)
                        .subresource_range(texture.full_subresource_range)
                        .build(),
                );
                src_stages |= utils::image_layout_to_pipeline_stage_flags(texture.current_layout);
                dst_stages |= utils::image_layout_to_pipeline_stage_flags(target_layout);
                texture.current_layout = target_layout;
            }
            if !barriers.is_empty() {
                unsafe {
                    device.raw().cmd_pipeline_barrier(
                        cmd_vk,
                        src_stages,
                        dst_stages,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &barriers,
                    );
                }
            }

            //
            // Begin the pass and bind the pipeline
            //
            if let PassDesc::Graphics { .. } = pass.desc {
                let framebuffer = mem
                    .pools
                    .framebuffers
                    .access(frame_framebuffers[it].unwrap())
                    .unwrap();
                let render_pass = mem
                    .pools
                    .render_passes
                    .access(frame_render_passes[it].unwrap())
                    .unwrap();
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: framebuffer.extent.width as f32,
                    height: framebuffer.extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                let render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: framebuffer.extent,
                };
                let begin_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(render_pass.handle)
                    .framebuffer(framebuffer.handle)
                    .render_area(render_area)
                    .clear_values(&render_pass.clear_values);
                unsafe {
                    device.raw().cmd_set_viewport(cmd_vk, 0, &[viewport]);
                    device.raw().cmd_set_scissor(cmd_vk, 0, &[render_area]);
                    device.raw().cmd_begin_render_pass(
                        cmd_vk,
                        &begin_info,
                        vk::SubpassContents::INLINE,
                    );
                }
            }
            {
                let pipeline = mem.pools.pipelines.access(pipeline_handle).unwrap();
                unsafe {
                    device
                        .raw()
                        .cmd_bind_pipeline(cmd_vk, pipeline.bind_point, pipeline.handle);
                }
            }

            //
            // Replay the recorded commands
            //
            for command in &pass.commands {
                match command {
                    GraphCommand::Draw(draw) => unsafe {
                        device
                            .raw()
                            .cmd_draw(cmd_vk, draw.num_vertices, draw.num_instances, 0, 0);
                    },
                    GraphCommand::Dispatch(dispatch) => unsafe {
                        device.raw().cmd_dispatch(
                            cmd_vk,
                            dispatch.group_count_x,
                            dispatch.group_count_y,
                            dispatch.group_count_z,
                        );
                    },
                    GraphCommand::Bind(bind) => {
                        self.record_bind(
                            device,
                            mem,
                            frames,
                            pipeline_handle,
                            slot_index,
                            current_frame,
                            image_index,
                            cmd_vk,
                            bind,
                        );
                    }
                }
            }

            if let PassDesc::Graphics { .. } = pass.desc {
                unsafe { device.raw().cmd_end_render_pass(cmd_vk) };
            }

            //
            // Submit, waiting on every pass named in the dependency mask
            //
            let dependencies = pass.dependencies();
            let mut execute_after: SmallVec<[vk::Semaphore; 8]> = SmallVec::new();
            for dep in 0..MAX_PASS_DEPENDENCIES {
                if dependencies & (1u64 << dep) == 0 {
                    continue;
                }
                assert!(dep < it, "pass depends on a later pass");
                let dep_handle = frames.slots[slot_index].command_buffers[dep];
                execute_after.push(
                    mem.pools
                        .command_buffers
                        .access(dep_handle)
                        .unwrap()
                        .semaphore,
                );
                present_waits &= !(1u64 << dep);
            }
            let cmd = mem.pools.command_buffers.access(cmd_handle).unwrap();
            cmd.submit(device, &execute_after, &[]);
        }

        //
        // Transition the swap-chain image for presentation and present,
        // waiting on every pass whose output feeds no later pass
        //
        {
            let transition_handle = frames.get_cmd(device, mem, QueueUsage::TRANSFER);
            let transition_vk = mem
                .pools
                .command_buffers
                .access(transition_handle)
                .unwrap()
                .handle;
            let swap_texture_handle = device.swap_chain_texture(image_index);
            {
                let texture = mem.pools.textures.access_mut(swap_texture_handle).unwrap();
                let barrier = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(utils::image_layout_to_access_flags(texture.current_layout))
                    .dst_access_mask(utils::image_layout_to_access_flags(
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    ))
                    .old_layout(texture.current_layout)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.image)
                    .subresource_range(texture.full_subresource_range);
                unsafe {
                    device.raw().cmd_pipeline_barrier(
                        transition_vk,
                        utils::image_layout_to_pipeline_stage_flags(texture.current_layout),
                        utils::image_layout_to_pipeline_stage_flags(
                            vk::ImageLayout::PRESENT_SRC_KHR,
                        ),
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier.build()],
                    );
                }
                texture.current_layout = vk::ImageLayout::PRESENT_SRC_KHR;
            }

            let mut execute_after: SmallVec<[vk::Semaphore; 8]> = SmallVec::new();
            for dep in 0..num_passes {
                if present_waits & (1u64 << dep) == 0 {
                    continue;
                }
                let dep_handle = frames.slots[slot_index].command_buffers[dep];
                execute_after.push(
                    mem.pools
                        .command_buffers
                        .access(dep_handle)
                        .unwrap()
                        .semaphore,
                );
            }
            let wait_semaphores = [frames.slots[slot_index].image_available];
            let transition_cmd = mem.pools.command_buffers.access(transition_handle).unwrap();
            transition_cmd.submit(device, &execute_after, &wait_semaphores);

            let present_wait = [transition_cmd.semaphore];
            let swapchains = [device.swap_chain().handle];
            let image_indices = [image_index];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&present_wait)
                .swapchains(&swapchains)
                .image_indices(&image_indices);
            unsafe {
                device
                    .swapchain_loader
                    .queue_present(device.queue(QueueUsage::PRESENT).handle, &present_info)
                    .expect("vkQueuePresentKHR failed");
            }
        }

        self.context = GraphContext::BetweenFrames;
    }

    /// Allocates and writes one descriptor set for a bind command, then
    /// binds it.
    #[allow(clippy::too_many_arguments)]
    fn record_bind(
        &mut self,
        device: &Device,
        mem: &MemoryManager,
        frames: &FrameManager,
        pipeline_handle: Handle<Pipeline>,
        slot_index: usize,
        current_frame: u64,
        image_index: u32,
        cmd_vk: vk::CommandBuffer,
        bind: &BindInfo,
    ) {
        let pipeline = mem.pools.pipelines.access(pipeline_handle).unwrap();
        assert!(
            (bind.set as usize) < pipeline.set_layouts.len(),
            "descriptor set index {} is out of range for this pipeline",
            bind.set
        );
        let set_layout = &pipeline.set_layouts[bind.set as usize];

        //
        // Allocate a descriptor set, skipping pools that already failed
        // this frame; one recovery attempt with a fresh pool
        //
        let array = self
            .descriptor_pools
            .get_mut(&(pipeline_handle, slot_index as u64))
            .expect("descriptor pool array was not prepared for this pass");
        let layouts = [set_layout.handle];
        let mut descriptor_set = vk::DescriptorSet::null();
        for pool in array.pools.iter_mut() {
            if !pool.last_alloc_ok {
                continue;
            }
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool.handle)
                .set_layouts(&layouts);
            match unsafe { device.raw().allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    descriptor_set = sets[0];
                    break;
                }
                Err(_) => pool.last_alloc_ok = false,
            }
        }
        if descriptor_set == vk::DescriptorSet::null() {
            assert!(
                array.pools.len() < MAX_POOLS_IN_ARRAY,
                "descriptor pool array overflow"
            );
            let handle = pipeline.create_descriptor_pool(device, bind.set);
            array.pools.push(DescriptorPoolSlot {
                handle,
                last_alloc_ok: true,
            });
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(handle)
                .set_layouts(&layouts);
            descriptor_set = unsafe {
                device
                    .raw()
                    .allocate_descriptor_sets(&alloc_info)
                    .expect("descriptor allocation failed from a fresh pool")[0]
            };
        }

        //
        // Build the writes. Image and buffer info arrays are filled first
        // so the write structs can point into them.
        //
        let num_bindings = bind.bindings.len();
        let mut image_infos: SmallVec<[vk::DescriptorImageInfo; 8]> =
            smallvec::smallvec![vk::DescriptorImageInfo::default(); num_bindings];
        let mut buffer_infos: SmallVec<[vk::DescriptorBufferInfo; 8]> =
            smallvec::smallvec![vk::DescriptorBufferInfo::default(); num_bindings];
        for (b_it, binding) in bind.bindings.iter().enumerate() {
            match binding.value {
                BindingValue::Texture { texture, sampler } => {
                    let handle = if texture.is_swap_chain {
                        device.swap_chain_texture(image_index)
                    } else {
                        texture_handle(&mem.pools, texture)
                    };
                    let texture = mem.pools.textures.access(handle).unwrap();
                    let sampler = unref(
                        &mem.pools,
                        Handle::<crate::sampler::Sampler>::new(sampler.index, sampler.generation),
                    );
                    image_infos[b_it] = vk::DescriptorImageInfo {
                        sampler: sampler.handle,
                        image_view: texture.view,
                        image_layout: texture.current_layout,
                    };
                }
                BindingValue::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    if buffer.is_scratch {
                        assert_eq!(
                            buffer.generation as u64, current_frame,
                            "scratch buffers are only valid in the frame they were created"
                        );
                        let slot = &frames.slots[slot_index];
                        let view = slot.scratch_views[buffer.index as usize];
                        assert!(offset < view.size, "scratch binding offset is too big");
                        assert!(
                            size <= view.size - offset,
                            "scratch binding size is too big"
                        );
                        let range = if size != 0 { size } else { view.size - offset };
                        buffer_infos[b_it] = vk::DescriptorBufferInfo {
                            buffer: slot.scratch.handle,
                            offset: view.offset + offset,
                            range,
                        };
                    } else {
                        let buffer_obj = unref(
                            &mem.pools,
                            Handle::<crate::buffer::Buffer>::new(buffer.index, buffer.generation),
                        );
                        assert!(
                            offset < buffer_obj.memory.size,
                            "buffer binding offset is too big"
                        );
                        assert!(
                            size <= buffer_obj.memory.size - offset,
                            "buffer binding size is too big"
                        );
                        let range = if size != 0 { size } else { vk::WHOLE_SIZE };
                        buffer_infos[b_it] = vk::DescriptorBufferInfo {
                            buffer: buffer_obj.handle,
                            offset,
                            range,
                        };
                    }
                }
            }
        }
        let mut writes: SmallVec<[vk::WriteDescriptorSet; 8]> = SmallVec::new();
        for (b_it, binding) in bind.bindings.iter().enumerate() {
            let descriptor_type = set_layout.binding(binding.binding).descriptor_type;
            let mut write = vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                p_next: std::ptr::null(),
                dst_set: descriptor_set,
                dst_binding: binding.binding,
                dst_array_element: 0,
                descriptor_count: 1,
                descriptor_type,
                p_image_info: std::ptr::null(),
                p_buffer_info: std::ptr::null(),
                p_texel_buffer_view: std::ptr::null(),
            };
            match binding.value {
                BindingValue::Texture { .. } => write.p_image_info = &image_infos[b_it],
                BindingValue::Buffer { .. } => write.p_buffer_info = &buffer_infos[b_it],
            }
            writes.push(write);
        }
        unsafe {
            device.raw().update_descriptor_sets(&writes, &[]);
            device.raw().cmd_bind_descriptor_sets(
                cmd_vk,
                pipeline.bind_point,
                pipeline.layout,
                bind.set,
                &[descriptor_set],
                &[],
            );
        }
    }

    /// Destroys the descriptor pools and forgets the caches. Cached render
    /// passes, framebuffers, and pipelines are destroyed through their
    /// pools at teardown.
    pub fn destroy(&mut self, device: &Device) {
        for (_, array) in self.descriptor_pools.drain() {
            for pool in array.pools {
                unsafe {
                    device
                        .raw()
                        .destroy_descriptor_pool(pool.handle, device.callbacks());
                }
            }
        }
        self.render_passes.clear();
        self.framebuffers.clear();
        self.graphics_pipelines.clear();
        self.compute_pipelines.clear();
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

fn evict_cache<K, R>(
    cache: &mut FxHashMap<K, Timed<Handle<R>>>,
    device: &Device,
    mem: &mut MemoryManager,
    current_frame: u64,
) where
    K: Eq + std::hash::Hash,
    R: Resource,
{
    let mut dead: Vec<Handle<R>> = Vec::new();
    cache.retain(|_, timed| {
        if is_expired(timed.frame, current_frame) {
            dead.push(timed.value);
            false
        } else {
            true
        }
    });
    for handle in dead {
        let object = R::pool_mut(&mut mem.pools).release(handle);
        object.destroy(device, &mut mem.gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_entries_age_out_after_the_lifetime_window() {
        let _ = pretty_env_logger::try_init();
        let touched = 100u64;
        assert!(!is_expired(touched, touched + OBJECT_LIFETIME_FRAMES));
        assert!(is_expired(touched, touched + OBJECT_LIFETIME_FRAMES + 1));
    }

    #[test]
    fn dependency_masks_must_point_backwards() {
        validate_pass_dependencies(0, 0);
        validate_pass_dependencies(3, 0b101);
        validate_pass_dependencies(63, (1u64 << 63) - 1);
    }

    #[test]
    #[should_panic]
    fn forward_dependency_panics() {
        validate_pass_dependencies(2, 0b100);
    }

    #[test]
    #[should_panic]
    fn pass_64_is_rejected() {
        validate_pass_dependencies(64, 0);
    }

    #[test]
    fn planned_layouts_promote_conflicts_to_general() {
        use vk::ImageLayout as L;
        assert_eq!(
            merge_planned_layout(None, L::SHADER_READ_ONLY_OPTIMAL),
            L::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            merge_planned_layout(
                Some(L::SHADER_READ_ONLY_OPTIMAL),
                L::SHADER_READ_ONLY_OPTIMAL
            ),
            L::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            merge_planned_layout(
                Some(L::COLOR_ATTACHMENT_OPTIMAL),
                L::SHADER_READ_ONLY_OPTIMAL
            ),
            L::GENERAL
        );
        assert_eq!(
            merge_planned_layout(
                Some(L::SHADER_READ_ONLY_OPTIMAL),
                L::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            ),
            L::GENERAL
        );
    }

    #[test]
    fn present_waits_keep_only_terminal_passes() {
        // P0 <- P1 <- P2: presentation should wait on P2 alone
        let deps = [0u64, 0b001, 0b010];
        let mut waits = 0u64;
        for (it, &mask) in deps.iter().enumerate() {
            waits |= 1 << it;
            waits &= !mask;
        }
        assert_eq!(waits, 0b100);

        // a diamond: P3 reads P1 and P2, P0 feeds both
        let deps = [0u64, 0b0001, 0b0001, 0b0110];
        let mut waits = 0u64;
        for (it, &mask) in deps.iter().enumerate() {
            waits |= 1 << it;
            waits &= !mask;
        }
        assert_eq!(waits, 0b1000);
    }
}
