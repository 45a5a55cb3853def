//! Textures: images, views, and the layout the graph last left them in.

use ash::vk;

use crate::command_buffer::{CommandBuffer, QueueUsage};
use crate::data::DataProvider;
use crate::device::Device;
use crate::memory::{GpuAllocation, GpuAllocationRequest, GpuAllocator, MemoryManager};
use crate::resource::{ObjectId, ObjectKind};
use crate::utils;

pub struct TextureCreateInfo {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub sampling: vk::SampleCountFlags,
    pub data: DataProvider,
}

pub struct Texture {
    pub object: ObjectId,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: Option<GpuAllocation>,
    /// Layout the last recorded barrier left the image in. Mutated by the
    /// graph during pass recording.
    pub current_layout: vk::ImageLayout,
    pub full_subresource_range: vk::ImageSubresourceRange,
    owns_image: bool,
}

impl Texture {
    pub fn new(device: &Device, mem: &mut MemoryManager, info: &TextureCreateInfo) -> Texture {
        let aspect = utils::aspect_mask_for_format(info.format);
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(info.sampling)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            device
                .raw()
                .create_image(&image_info, device.callbacks())
                .expect("vkCreateImage failed")
        };
        let requirements = unsafe { device.raw().get_image_memory_requirements(image) };
        let memory = mem.gpu.allocate(
            device,
            GpuAllocationRequest {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        );
        unsafe {
            device
                .raw()
                .bind_image_memory(image, memory.memory, memory.offset)
                .expect("vkBindImageMemory failed");
        }
        let full_subresource_range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.format)
            .subresource_range(full_subresource_range);
        let view = unsafe {
            device
                .raw()
                .create_image_view(&view_info, device.callbacks())
                .expect("vkCreateImageView failed")
        };

        let mut texture = Texture {
            object: ObjectId::new(ObjectKind::Texture),
            extent: info.extent,
            format: info.format,
            image,
            view,
            memory: Some(memory),
            current_layout: vk::ImageLayout::UNDEFINED,
            full_subresource_range,
            owns_image: true,
        };
        if let Some(bytes) = info.data.fetch() {
            texture.upload(device, mem, &bytes);
        }
        texture
    }

    /// Wraps a swap-chain image. The image and view stay owned by the swap
    /// chain; only the layout bookkeeping lives here.
    pub fn from_swap_chain(
        extent: vk::Extent2D,
        format: vk::Format,
        image: vk::Image,
        view: vk::ImageView,
    ) -> Texture {
        Texture {
            object: ObjectId::new(ObjectKind::Texture),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            image,
            view,
            memory: None,
            current_layout: vk::ImageLayout::UNDEFINED,
            full_subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            owns_image: false,
        }
    }

    /// Synchronous upload through the staging buffer.
    fn upload(&mut self, device: &Device, mem: &MemoryManager, bytes: &[u8]) {
        let staging = mem.staging();
        assert!(
            bytes.len() as u64 <= staging.memory.size,
            "texture contents exceed the staging buffer"
        );
        let mapped = staging.mapped().expect("staging buffer is not mapped");
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped, bytes.len()) };

        let cmd = CommandBuffer::new(device, QueueUsage::TRANSFER);
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.full_subresource_range);
        let copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.full_subresource_range.aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: self.extent,
        };
        unsafe {
            device.raw().cmd_pipeline_barrier(
                cmd.handle,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
            device.raw().cmd_copy_buffer_to_image(
                cmd.handle,
                staging.handle,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }
        cmd.submit(device, &[], &[]);
        unsafe {
            device
                .raw()
                .wait_for_fences(&[cmd.fence], true, u64::MAX)
                .expect("vkWaitForFences failed");
        }
        cmd.destroy_standalone(device);
        self.current_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }

    pub fn destroy(self, device: &Device, gpu: &mut GpuAllocator) {
        if self.owns_image {
            unsafe {
                device
                    .raw()
                    .destroy_image_view(self.view, device.callbacks());
                device.raw().destroy_image(self.image, device.callbacks());
            }
            if let Some(memory) = self.memory {
                gpu.deallocate(device, memory);
            }
        }
    }
}
