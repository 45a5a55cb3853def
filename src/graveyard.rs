//! Deferred destruction.
//!
//! Destroying a resource while the GPU may still read it is a use-after-free
//! on the device timeline, so `destroy` only files the handle here together
//! with the frame number it was retired in. Entries are reaped once their
//! owning frame slot has cycled `NUM_FRAMES_IN_FLIGHT` times or its last
//! command buffer's fence reports completion.

use log::trace;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::frame::{FrameManager, NUM_FRAMES_IN_FLIGHT};
use crate::memory::MemoryManager;
use crate::pool::Handle;
use crate::program::Program;
use crate::resource::{Resource, IN_GRAVEYARD};
use crate::sampler::Sampler;
use crate::texture::Texture;

struct Entry<R> {
    handle: Handle<R>,
    frame: u64,
}

#[derive(Default)]
pub struct Graveyard {
    programs: Vec<Entry<Program>>,
    samplers: Vec<Entry<Sampler>>,
    buffers: Vec<Entry<Buffer>>,
    textures: Vec<Entry<Texture>>,
}

impl Graveyard {
    pub fn new() -> Graveyard {
        Graveyard::default()
    }

    pub fn submit_program(&mut self, mem: &mut MemoryManager, handle: Handle<Program>, frame: u64) {
        flag::<Program>(mem, handle);
        self.programs.push(Entry { handle, frame });
    }

    pub fn submit_sampler(&mut self, mem: &mut MemoryManager, handle: Handle<Sampler>, frame: u64) {
        flag::<Sampler>(mem, handle);
        self.samplers.push(Entry { handle, frame });
    }

    pub fn submit_buffer(&mut self, mem: &mut MemoryManager, handle: Handle<Buffer>, frame: u64) {
        flag::<Buffer>(mem, handle);
        self.buffers.push(Entry { handle, frame });
    }

    pub fn submit_texture(&mut self, mem: &mut MemoryManager, handle: Handle<Texture>, frame: u64) {
        flag::<Texture>(mem, handle);
        self.textures.push(Entry { handle, frame });
    }

    /// Reaps every entry whose frame has provably retired.
    pub fn update(&mut self, device: &Device, mem: &mut MemoryManager, frames: &FrameManager) {
        update_queue(device, mem, frames, &mut self.programs);
        update_queue(device, mem, frames, &mut self.samplers);
        update_queue(device, mem, frames, &mut self.buffers);
        update_queue(device, mem, frames, &mut self.textures);
    }

    /// Drops the bookkeeping without destroying anything; teardown destroys
    /// pool contents wholesale.
    pub fn clear(&mut self) {
        self.programs.clear();
        self.samplers.clear();
        self.buffers.clear();
        self.textures.clear();
    }
}

fn flag<R: Resource>(mem: &mut MemoryManager, handle: Handle<R>) {
    let object = R::pool_mut(&mut mem.pools)
        .access_mut(handle)
        .expect("submitted a dead handle to the graveyard")
        .object_mut();
    assert!(
        object.flags & IN_GRAVEYARD == 0,
        "resource was already submitted for destruction"
    );
    object.flags |= IN_GRAVEYARD;
}

fn update_queue<R: Resource>(
    device: &Device,
    mem: &mut MemoryManager,
    frames: &FrameManager,
    queue: &mut Vec<Entry<R>>,
) {
    let mut it = 0;
    while it < queue.len() {
        let entry = &queue[it];
        let age = frames.frame_number - entry.frame;
        let finished = if age >= NUM_FRAMES_IN_FLIGHT {
            // the slot has been waited on and recycled since
            true
        } else {
            let slot = &frames.slots[(entry.frame % NUM_FRAMES_IN_FLIGHT) as usize];
            match slot.command_buffers.last() {
                None => true,
                Some(&last) => {
                    let fence = mem
                        .pools
                        .command_buffers
                        .access(last)
                        .expect("frame slot holds a dead command buffer")
                        .fence;
                    unsafe {
                        device
                            .raw()
                            .get_fence_status(fence)
                            .expect("vkGetFenceStatus failed")
                    }
                }
            }
        };
        if finished {
            let entry = queue.swap_remove(it);
            let object = R::pool_mut(&mut mem.pools).release(entry.handle);
            trace!("graveyard reaps {:?}", object.object());
            object.destroy(device, &mut mem.gpu);
        } else {
            it += 1;
        }
    }
}
