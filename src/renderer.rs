//! Public rendering API.
//!
//! A thin veneer over the device, memory manager, frame ring, graveyard,
//! and graph. All calls must come from one thread; the only concurrent
//! actor is the GPU, ordered through semaphores and fences.

use ash::vk;
use config::Config;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::buffer::{Buffer, BufferInfo};
use crate::command_buffer::{CommandBuffer, QueueUsage};
use crate::data::DataProvider;
use crate::device::{Device, DeviceInfo};
use crate::frame::FrameManager;
use crate::graph::Graph;
use crate::graveyard::Graveyard;
use crate::memory::MemoryManager;
use crate::pool::Handle;
use crate::program::Program;
use crate::resource::unref;
use crate::sampler::Sampler;
use crate::texture::{Texture, TextureCreateInfo};
use crate::types::{
    BindInfo, BufferRef, ComputePassInfo, ComputeWorkgroupSize, DispatchInfo, DrawInfo,
    GraphicsPassInfo, MemoryBufferInfo, PassDependencies, ProgramInfo, ProgramRef, SamplerInfo,
    SamplerRef, TextureFormat, TextureInfo, TextureRef, TextureSize,
};
use crate::utils;

pub struct RendererInfo<'a> {
    pub config: &'a Config,
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
    pub window_extent: (u32, u32),
}

pub struct Renderer {
    device: Device,
    mem: MemoryManager,
    frames: FrameManager,
    graph: Graph,
    graveyard: Graveyard,
}

impl Renderer {
    pub fn new(info: &RendererInfo) -> Renderer {
        let mut device = Device::new(&DeviceInfo {
            config: info.config,
            display_handle: info.display_handle,
            window_handle: info.window_handle,
        });
        let mut mem = MemoryManager::new(&device);
        device.create_swap_chain(&mut mem, info.window_extent);
        let frames = FrameManager::new(&device, &mut mem);
        Renderer {
            device,
            mem,
            frames,
            graph: Graph::new(),
            graveyard: Graveyard::new(),
        }
    }

    /// Starts a frame. Returns false when the window has zero extent (the
    /// application should skip rendering entirely). Detecting a changed
    /// extent rebuilds the swap chain before the frame begins.
    pub fn begin_frame(&mut self, window_extent: (u32, u32)) -> bool {
        if window_extent.0 == 0 && window_extent.1 == 0 {
            return false;
        }
        let current = self.device.swap_chain().extent;
        if current.width != window_extent.0 || current.height != window_extent.1 {
            self.device.wait_idle();
            self.device.destroy_swap_chain(&mut self.mem);
            self.device.create_swap_chain(&mut self.mem, window_extent);
        }
        self.frames.advance(&self.device, &mut self.mem);
        self.graph
            .begin_frame(&self.device, &mut self.mem, self.frames.frame_number);
        true
    }

    /// Executes every recorded pass and presents.
    pub fn end_frame(&mut self) {
        self.graph
            .end_frame(&self.device, &mut self.mem, &mut self.frames);
    }

    /// Returns `1 << pass_index`, usable as a dependency bit by later
    /// passes in this frame.
    pub fn begin_graphics_pass(&mut self, info: GraphicsPassInfo) -> PassDependencies {
        self.graph
            .begin_graphics_pass(&self.device, &self.mem.pools, info)
    }

    pub fn begin_compute_pass(&mut self, info: ComputePassInfo) -> PassDependencies {
        self.graph.begin_compute_pass(info)
    }

    pub fn end_pass(&mut self) {
        self.graph.end_pass();
    }

    pub fn bind(&mut self, info: BindInfo) {
        self.graph.bind(info);
    }

    pub fn draw(&mut self, info: DrawInfo) {
        self.graph.draw(info);
    }

    pub fn dispatch(&mut self, info: DispatchInfo) {
        self.graph.dispatch(info);
    }

    pub fn program(&mut self, info: &ProgramInfo) -> ProgramRef {
        let program = Program::new(&self.device, &info.data);
        let handle = self.mem.pools.programs.take(program);
        ProgramRef {
            index: handle.index,
            generation: handle.generation,
        }
    }

    pub fn texture(&mut self, info: &TextureInfo) -> TextureRef {
        let format = match info.format {
            TextureFormat::DepthStencil => self.device.depth_stencil_format(),
            other => utils::to_vk_texture_format(other),
        };
        let mut usage = vk::ImageUsageFlags::SAMPLED;
        if info.data.is_valid() {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if info.format == TextureFormat::DepthStencil {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        let texture = Texture::new(
            &self.device,
            &mut self.mem,
            &TextureCreateInfo {
                format,
                extent: vk::Extent3D {
                    width: info.width,
                    height: info.height,
                    depth: 1,
                },
                usage,
                sampling: vk::SampleCountFlags::TYPE_1,
                data: info.data.clone(),
            },
        );
        let handle = self.mem.pools.textures.take(texture);
        TextureRef {
            index: handle.index,
            generation: handle.generation,
            is_swap_chain: false,
        }
    }

    /// Sentinel handle resolved to the acquired swap-chain image each
    /// frame.
    pub fn swap_chain_texture(&self) -> TextureRef {
        TextureRef {
            index: 0,
            generation: 0,
            is_swap_chain: true,
        }
    }

    pub fn memory_buffer(&mut self, info: &MemoryBufferInfo) -> BufferRef {
        assert!(info.data.is_valid(), "memory buffers need a size or contents");
        let size = info.data.size() as u64;
        let buffer = Buffer::new(
            &self.device,
            &mut self.mem.gpu,
            &BufferInfo {
                size,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                visibility: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        );
        let handle = self.mem.pools.buffers.take(buffer);
        if let Some(bytes) = info.data.fetch() {
            self.write_to(handle, 0, &bytes);
        }
        BufferRef {
            index: handle.index,
            generation: handle.generation,
            is_scratch: false,
        }
    }

    /// Sub-allocates from the current frame's scratch buffer. The handle's
    /// generation is the frame number; using it in any later frame is
    /// detected and aborts.
    pub fn scratch_memory_buffer(&mut self, info: &MemoryBufferInfo) -> BufferRef {
        let index = self.frames.alloc_scratch(&info.data);
        let frame = self.frames.frame_number;
        assert!(frame <= u32::MAX as u64);
        BufferRef {
            index,
            generation: frame as u32,
            is_scratch: true,
        }
    }

    pub fn sampler(&mut self, info: &SamplerInfo) -> SamplerRef {
        let sampler = Sampler::new(&self.device, info);
        let handle = self.mem.pools.samplers.take(sampler);
        SamplerRef {
            index: handle.index,
            generation: handle.generation,
        }
    }

    /// Synchronous write into a persistent buffer, through the staging
    /// buffer when the destination is not host visible.
    pub fn write(&mut self, buffer: BufferRef, offset: u64, data: &DataProvider) {
        assert!(!buffer.is_scratch, "scratch buffers take their contents at creation");
        let bytes = data.fetch().expect("write needs actual contents");
        let handle: Handle<Buffer> = Handle::new(buffer.index, buffer.generation);
        {
            let target = unref(&self.mem.pools, handle);
            assert!(
                offset + bytes.len() as u64 <= target.memory.size,
                "write overruns the buffer"
            );
        }
        self.write_to(handle, offset, &bytes);
    }

    fn write_to(&mut self, handle: Handle<Buffer>, offset: u64, bytes: &[u8]) {
        let target = unref(&self.mem.pools, handle);
        if let Some(mapped) = target.mapped() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    mapped.add(offset as usize),
                    bytes.len(),
                );
            }
            return;
        }

        let target_handle = target.handle;
        let staging = self.mem.staging();
        let staging_size = staging.memory.size as usize;
        let staging_vk = staging.handle;
        let staging_mapped = staging.mapped().expect("staging buffer is not mapped");
        let num_copies = bytes.len().div_ceil(staging_size);
        for it in 0..num_copies {
            let chunk_offset = it * staging_size;
            let copy_size = (bytes.len() - chunk_offset).min(staging_size);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(chunk_offset),
                    staging_mapped,
                    copy_size,
                );
            }
            let cmd = CommandBuffer::new(&self.device, QueueUsage::TRANSFER);
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset + chunk_offset as u64,
                size: copy_size as u64,
            };
            unsafe {
                self.device
                    .raw()
                    .cmd_copy_buffer(cmd.handle, staging_vk, target_handle, &[region]);
            }
            cmd.submit(&self.device, &[], &[]);
            unsafe {
                self.device
                    .raw()
                    .wait_for_fences(&[cmd.fence], true, u64::MAX)
                    .expect("vkWaitForFences failed");
            }
            cmd.destroy_standalone(&self.device);
        }
    }

    pub fn texture_size(&self, texture: TextureRef) -> TextureSize {
        if texture.is_swap_chain {
            let extent = self.device.swap_chain().extent;
            TextureSize {
                x: extent.width,
                y: extent.height,
                z: 1,
            }
        } else {
            let texture = unref::<Texture>(
                &self.mem.pools,
                Handle::new(texture.index, texture.generation),
            );
            TextureSize {
                x: texture.extent.width,
                y: texture.extent.height,
                z: texture.extent.depth,
            }
        }
    }

    /// Reflection data is returned unconditionally; non-compute programs
    /// yield zeroes.
    pub fn workgroup_size(&self, program: ProgramRef) -> ComputeWorkgroupSize {
        let program = unref::<Program>(
            &self.mem.pools,
            Handle::new(program.index, program.generation),
        );
        program.reflection.workgroup_size
    }

    pub fn destroy_program(&mut self, program: ProgramRef) {
        let frame = self.frames.frame_number;
        self.graveyard.submit_program(
            &mut self.mem,
            Handle::new(program.index, program.generation),
            frame,
        );
    }

    pub fn destroy_texture(&mut self, texture: TextureRef) {
        assert!(!texture.is_swap_chain, "the swap-chain texture is not yours to destroy");
        let frame = self.frames.frame_number;
        self.graveyard.submit_texture(
            &mut self.mem,
            Handle::new(texture.index, texture.generation),
            frame,
        );
    }

    pub fn destroy_buffer(&mut self, buffer: BufferRef) {
        assert!(!buffer.is_scratch, "scratch buffers are reclaimed automatically");
        let frame = self.frames.frame_number;
        self.graveyard.submit_buffer(
            &mut self.mem,
            Handle::new(buffer.index, buffer.generation),
            frame,
        );
    }

    pub fn destroy_sampler(&mut self, sampler: SamplerRef) {
        let frame = self.frames.frame_number;
        self.graveyard.submit_sampler(
            &mut self.mem,
            Handle::new(sampler.index, sampler.generation),
            frame,
        );
    }

    /// Reaps graveyard entries whose frames have retired. Call once per
    /// application update, outside the frame.
    pub fn update(&mut self) {
        self.graveyard
            .update(&self.device, &mut self.mem, &self.frames);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.device.wait_idle();
        self.graph.destroy(&self.device);
        self.graveyard.clear();

        for slot in std::mem::take(&mut self.frames.slots) {
            unsafe {
                self.device
                    .raw()
                    .destroy_semaphore(slot.image_available, self.device.callbacks());
            }
            slot.scratch.destroy(&self.device, &mut self.mem.gpu);
        }
        self.device.destroy_swap_chain(&mut self.mem);

        for cmd in self.mem.pools.command_buffers.drain() {
            cmd.destroy_standalone(&self.device);
        }
        for framebuffer in self.mem.pools.framebuffers.drain() {
            framebuffer.destroy(&self.device, &mut self.mem.gpu);
        }
        for pipeline in self.mem.pools.pipelines.drain() {
            pipeline.destroy(&self.device, &mut self.mem.gpu);
        }
        for render_pass in self.mem.pools.render_passes.drain() {
            render_pass.destroy(&self.device, &mut self.mem.gpu);
        }
        for texture in self.mem.pools.textures.drain() {
            texture.destroy(&self.device, &mut self.mem.gpu);
        }
        for sampler in self.mem.pools.samplers.drain() {
            sampler.destroy(&self.device, &mut self.mem.gpu);
        }
        for buffer in self.mem.pools.buffers.drain() {
            buffer.destroy(&self.device, &mut self.mem.gpu);
        }
        for program in self.mem.pools.programs.drain() {
            program.destroy(&self.device, &mut self.mem.gpu);
        }
        let staging = self.mem.take_staging();
        staging.destroy(&self.device, &mut self.mem.gpu);

        self.mem.gpu.free_all(&self.device);
        self.device.destroy();
    }
}
