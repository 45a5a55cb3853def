//! Per-kind resource dispatch.
//!
//! The graveyard and the public unref path need to go from a handle kind to
//! "its pool" and "how to destroy it" without knowing the concrete type at
//! the call site; the `Resource` trait is that dispatch table.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::Buffer;
use crate::command_buffer::CommandBuffer;
use crate::device::Device;
use crate::framebuffer::Framebuffer;
use crate::memory::{GpuAllocator, Pools};
use crate::pipeline::Pipeline;
use crate::pool::{Handle, ObjectPool};
use crate::program::Program;
use crate::render_pass::RenderPass;
use crate::sampler::Sampler;
use crate::texture::Texture;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ObjectKind {
    Program,
    Texture,
    Sampler,
    MemoryBuffer,
    RenderPass,
    Framebuffer,
    GraphicsPipeline,
    ComputePipeline,
    CommandBuffer,
}

pub const IN_GRAVEYARD: u32 = 0x1;

/// Identity carried by every renderer object: the kind, a unique index, and
/// lifetime flags.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjectId {
    pub kind: ObjectKind,
    pub unique_index: u64,
    pub flags: u32,
}

impl ObjectId {
    pub fn new(kind: ObjectKind) -> ObjectId {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ObjectId {
            kind,
            unique_index: COUNTER.fetch_add(1, Ordering::Relaxed),
            flags: 0,
        }
    }

    pub fn is_in_graveyard(&self) -> bool {
        self.flags & IN_GRAVEYARD != 0
    }
}

pub trait Resource: Sized {
    fn object(&self) -> &ObjectId;
    fn object_mut(&mut self) -> &mut ObjectId;
    fn pool(pools: &Pools) -> &ObjectPool<Self>;
    fn pool_mut(pools: &mut Pools) -> &mut ObjectPool<Self>;
    fn destroy(self, device: &Device, gpu: &mut GpuAllocator);
}

macro_rules! impl_resource {
    ($ty:ty, $field:ident) => {
        impl Resource for $ty {
            fn object(&self) -> &ObjectId {
                &self.object
            }
            fn object_mut(&mut self) -> &mut ObjectId {
                &mut self.object
            }
            fn pool(pools: &Pools) -> &ObjectPool<Self> {
                &pools.$field
            }
            fn pool_mut(pools: &mut Pools) -> &mut ObjectPool<Self> {
                &mut pools.$field
            }
            fn destroy(self, device: &Device, gpu: &mut GpuAllocator) {
                <$ty>::destroy(self, device, gpu);
            }
        }
    };
}

impl_resource!(Program, programs);
impl_resource!(Texture, textures);
impl_resource!(Sampler, samplers);
impl_resource!(Buffer, buffers);
impl_resource!(RenderPass, render_passes);
impl_resource!(Framebuffer, framebuffers);
impl_resource!(Pipeline, pipelines);
impl_resource!(CommandBuffer, command_buffers);

/// Resolves a handle, asserting it is live and not awaiting destruction.
pub fn unref<R: Resource>(pools: &Pools, handle: Handle<R>) -> &R {
    let value = R::pool(pools)
        .access(handle)
        .expect("handle is either invalid or expired");
    assert!(
        !value.object().is_in_graveyard(),
        "handle points at an object already submitted for destruction"
    );
    value
}

pub fn unref_mut<R: Resource>(pools: &mut Pools, handle: Handle<R>) -> &mut R {
    let value = R::pool_mut(pools)
        .access_mut(handle)
        .expect("handle is either invalid or expired");
    assert!(
        !value.object().is_in_graveyard(),
        "handle points at an object already submitted for destruction"
    );
    value
}
