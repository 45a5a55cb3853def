//! The in-flight frame ring.
//!
//! Each of the two slots owns an image-available semaphore, the ordered
//! list of command buffers recorded during its cycle, and a host-visible
//! scratch buffer that ephemeral uniform/storage bindings are linearly
//! sub-allocated from. A slot is recycled when the ring wraps back onto it,
//! after waiting on the fence of its last submission.

use ash::vk;
use log::trace;

use crate::buffer::{Buffer, BufferInfo};
use crate::command_buffer::{CommandBuffer, QueueUsage};
use crate::data::DataProvider;
use crate::device::Device;
use crate::memory::MemoryManager;
use crate::pool::Handle;

pub const NUM_FRAMES_IN_FLIGHT: u64 = 2;
pub const MAX_SWAP_CHAIN_IMAGES: usize = 16;
pub const SCRATCH_BUFFER_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Copy, Clone, Debug)]
pub struct ScratchView {
    pub offset: u64,
    pub size: u64,
}

pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub command_buffers: Vec<Handle<CommandBuffer>>,
    pub scratch: Buffer,
    pub scratch_views: Vec<ScratchView>,
    pub scratch_top: u64,
}

pub struct FrameManager {
    pub slots: Vec<FrameSlot>,
    /// Which frame slot last used each swap-chain image index.
    pub image_to_slot: [Option<usize>; MAX_SWAP_CHAIN_IMAGES],
    pub frame_number: u64,
    pub scratch_alignment: u64,
}

/// Rounds `value` up to the next multiple of `alignment`.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if value % alignment == 0 {
        value
    } else {
        (value / alignment) * alignment + alignment
    }
}

impl FrameManager {
    pub fn new(device: &Device, mem: &mut MemoryManager) -> FrameManager {
        let limits = device.limits();
        let scratch_alignment = limits
            .min_texel_buffer_offset_alignment
            .max(limits.min_uniform_buffer_offset_alignment)
            .max(limits.min_storage_buffer_offset_alignment);

        let mut slots = Vec::with_capacity(NUM_FRAMES_IN_FLIGHT as usize);
        for _ in 0..NUM_FRAMES_IN_FLIGHT {
            let image_available = unsafe {
                device
                    .raw()
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), device.callbacks())
                    .expect("vkCreateSemaphore failed")
            };
            let scratch = Buffer::new(
                device,
                &mut mem.gpu,
                &BufferInfo {
                    size: SCRATCH_BUFFER_SIZE,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::UNIFORM_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_SRC
                        | vk::BufferUsageFlags::TRANSFER_DST,
                    visibility: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                },
            );
            slots.push(FrameSlot {
                image_available,
                command_buffers: Vec::new(),
                scratch,
                scratch_views: Vec::new(),
                scratch_top: 0,
            });
        }

        FrameManager {
            slots,
            image_to_slot: [None; MAX_SWAP_CHAIN_IMAGES],
            frame_number: 0,
            scratch_alignment,
        }
    }

    pub fn active_slot_index(&self) -> usize {
        (self.frame_number % NUM_FRAMES_IN_FLIGHT) as usize
    }

    pub fn active_slot(&self) -> &FrameSlot {
        &self.slots[self.active_slot_index()]
    }

    /// Bumps the frame number, waits for the previous cycle of the incoming
    /// slot to retire, and recycles its command buffers and scratch space.
    pub fn advance(&mut self, device: &Device, mem: &mut MemoryManager) {
        self.frame_number += 1;
        let slot = &mut self.slots[(self.frame_number % NUM_FRAMES_IN_FLIGHT) as usize];

        if let Some(&last) = slot.command_buffers.last() {
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
        for handle in slot.command_buffers.drain(..) {
            let cmd = mem.pools.command_buffers.release(handle);
            cmd.destroy_standalone(device);
        }

        slot.scratch_views.clear();
        slot.scratch_top = 0;
        trace!("frame {} begins", self.frame_number);
    }

    /// Allocates a command buffer for this frame and appends it to the
    /// active slot's submission list.
    pub fn get_cmd(
        &mut self,
        device: &Device,
        mem: &mut MemoryManager,
        usage: QueueUsage,
    ) -> Handle<CommandBuffer> {
        let cmd = CommandBuffer::new(device, usage);
        let handle = mem.pools.command_buffers.take(cmd);
        let index = self.active_slot_index();
        self.slots[index].command_buffers.push(handle);
        handle
    }

    /// Sub-allocates from the active slot's scratch buffer and returns the
    /// view index. The data provider's bytes, if any, are copied in.
    /// Running out of scratch space is a hard error; the buffer is not
    /// resized mid-frame.
    pub fn alloc_scratch(&mut self, data: &DataProvider) -> u32 {
        assert!(data.is_valid(), "scratch allocation needs a data provider");
        let size = data.size() as u64;
        let alignment = self.scratch_alignment;
        let index = self.active_slot_index();
        let slot = &mut self.slots[index];

        let base = align_up(slot.scratch_top, alignment);
        assert!(
            base <= slot.scratch.memory.size && slot.scratch.memory.size - base >= size,
            "out of scratch memory: {} bytes requested, {} available",
            size,
            slot.scratch.memory.size.saturating_sub(base)
        );
        slot.scratch_top = base + size;
        slot.scratch_views.push(ScratchView { offset: base, size });

        if let Some(bytes) = data.fetch() {
            let mapped = slot
                .scratch
                .mapped()
                .expect("scratch buffer is not host visible");
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    mapped.add(base as usize),
                    bytes.len(),
                );
            }
        }

        (slot.scratch_views.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_is_identity_on_aligned_values() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(512, 256), 512);
    }

    #[test]
    fn align_up_rounds_to_next_boundary() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn scratch_offsets_pack_with_alignment() {
        // simulate the allocation arithmetic without a device
        let alignment = 256u64;
        let capacity = 1024u64;
        let mut top = 0u64;
        let mut views = Vec::new();
        for size in [100u64, 300, 256] {
            let base = align_up(top, alignment);
            assert!(capacity - base >= size);
            top = base + size;
            views.push((base, size));
        }
        assert_eq!(views, vec![(0, 100), (256, 300), (768, 256)]);
        // an exact fit succeeds, one more byte does not
        let base = align_up(top, alignment);
        assert_eq!(base, 1024);
        assert!(capacity - base < 1);
    }
}
