//! One-shot command buffers.
//!
//! Every command buffer is recorded once, submitted once, and destroyed
//! when its frame slot comes around again. Each carries its own semaphore
//! and fence; the semaphore chains pass-to-pass dependencies and the fence
//! gates reuse of the frame slot and the graveyard.

use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::device::Device;
use crate::memory::GpuAllocator;
use crate::resource::{ObjectId, ObjectKind};

pub const MAX_EXECUTE_AFTER: usize = 64;
pub const MAX_WAIT_SEMAPHORES: usize = 64;

bitflags! {
    pub struct QueueUsage: u32 {
        const GRAPHICS = 0x1;
        const TRANSFER = 0x2;
        const COMPUTE = 0x4;
        const PRESENT = 0x8;
    }
}

pub struct CommandBuffer {
    pub object: ObjectId,
    pub pool: vk::CommandPool,
    pub queue: vk::Queue,
    pub handle: vk::CommandBuffer,
    pub semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

impl CommandBuffer {
    /// Allocates the command buffer and its sync objects and begins
    /// recording with ONE_TIME_SUBMIT.
    pub fn new(device: &Device, usage: QueueUsage) -> CommandBuffer {
        assert!(!usage.is_empty());
        let queue = device.queue(usage);
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(queue.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let handle = unsafe {
            device
                .raw()
                .allocate_command_buffers(&allocate_info)
                .expect("vkAllocateCommandBuffers failed")[0]
        };
        let semaphore = unsafe {
            device
                .raw()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), device.callbacks())
                .expect("vkCreateSemaphore failed")
        };
        let fence = unsafe {
            device
                .raw()
                .create_fence(&vk::FenceCreateInfo::default(), device.callbacks())
                .expect("vkCreateFence failed")
        };
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .raw()
                .begin_command_buffer(handle, &begin_info)
                .expect("vkBeginCommandBuffer failed");
        }
        CommandBuffer {
            object: ObjectId::new(ObjectKind::CommandBuffer),
            pool: queue.command_pool,
            queue: queue.handle,
            handle,
            semaphore,
            fence,
        }
    }

    /// Ends recording and submits. `execute_after` are signal semaphores of
    /// prior command buffers this one must run behind; `wait_semaphores` are
    /// explicit extra waits (e.g. image-available). Every wait uses an
    /// ALL_COMMANDS stage mask; finer stages are a known optimization
    /// opportunity.
    pub fn submit(
        &self,
        device: &Device,
        execute_after: &[vk::Semaphore],
        wait_semaphores: &[vk::Semaphore],
    ) {
        assert!(execute_after.len() <= MAX_EXECUTE_AFTER);
        assert!(wait_semaphores.len() <= MAX_WAIT_SEMAPHORES);
        unsafe {
            device
                .raw()
                .end_command_buffer(self.handle)
                .expect("vkEndCommandBuffer failed");
        }

        let mut waits: SmallVec<[vk::Semaphore; 16]> = SmallVec::new();
        waits.extend_from_slice(execute_after);
        waits.extend_from_slice(wait_semaphores);
        let stages: SmallVec<[vk::PipelineStageFlags; 16]> =
            waits.iter().map(|_| vk::PipelineStageFlags::ALL_COMMANDS).collect();

        let command_buffers = [self.handle];
        let signal_semaphores = [self.semaphore];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            device
                .raw()
                .queue_submit(self.queue, &[submit_info.build()], self.fence)
                .expect("vkQueueSubmit failed");
        }
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        self.destroy_standalone(device);
    }

    pub fn destroy_standalone(self, device: &Device) {
        unsafe {
            device
                .raw()
                .destroy_semaphore(self.semaphore, device.callbacks());
            device.raw().destroy_fence(self.fence, device.callbacks());
            device.raw().free_command_buffers(self.pool, &[self.handle]);
        }
    }
}
