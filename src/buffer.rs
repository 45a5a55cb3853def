//! Device memory buffers.

use ash::vk;

use crate::device::Device;
use crate::memory::{GpuAllocation, GpuAllocationRequest, GpuAllocator};
use crate::resource::{ObjectId, ObjectKind};

pub struct BufferInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub visibility: vk::MemoryPropertyFlags,
}

pub struct Buffer {
    pub object: ObjectId,
    pub handle: vk::Buffer,
    pub memory: GpuAllocation,
}

impl Buffer {
    pub fn new(device: &Device, gpu: &mut GpuAllocator, info: &BufferInfo) -> Buffer {
        let create_info = vk::BufferCreateInfo::builder()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe {
            device
                .raw()
                .create_buffer(&create_info, device.callbacks())
                .expect("vkCreateBuffer failed")
        };
        let requirements = unsafe { device.raw().get_buffer_memory_requirements(handle) };
        let memory = gpu.allocate(
            device,
            GpuAllocationRequest {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
                properties: info.visibility,
            },
        );
        unsafe {
            device
                .raw()
                .bind_buffer_memory(handle, memory.memory, memory.offset)
                .expect("vkBindBufferMemory failed");
        }
        Buffer {
            object: ObjectId::new(ObjectKind::MemoryBuffer),
            handle,
            memory,
        }
    }

    /// Host pointer to the start of the buffer, if its memory is mapped.
    pub fn mapped(&self) -> Option<*mut u8> {
        if self.memory.mapped.is_null() {
            None
        } else {
            Some(self.memory.mapped)
        }
    }

    pub fn destroy(self, device: &Device, gpu: &mut GpuAllocator) {
        unsafe { device.raw().destroy_buffer(self.handle, device.callbacks()) };
        gpu.deallocate(device, self.memory);
    }
}
