//! Framebuffers pairing a derived render pass with resolved textures.

use ash::vk;
use smallvec::SmallVec;

use crate::device::Device;
use crate::memory::{GpuAllocator, Pools};
use crate::pool::Handle;
use crate::render_pass::RenderPass;
use crate::resource::{ObjectId, ObjectKind};
use crate::texture::Texture;

const MAX_TEXTURES: usize = 9;

/// Cache key and construction input in one: the pass and the exact texture
/// handles (generation included, so a rebuilt swap chain yields new keys).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FramebufferInfo {
    pub render_pass: Handle<RenderPass>,
    pub textures: SmallVec<[Handle<Texture>; MAX_TEXTURES]>,
}

pub struct Framebuffer {
    pub object: ObjectId,
    pub handle: vk::Framebuffer,
    pub render_pass: Handle<RenderPass>,
    pub textures: SmallVec<[Handle<Texture>; MAX_TEXTURES]>,
    pub extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(device: &Device, pools: &Pools, info: &FramebufferInfo) -> Framebuffer {
        let render_pass = pools
            .render_passes
            .access(info.render_pass)
            .expect("framebuffer references a dead render pass");
        assert_eq!(render_pass.num_attachments() as usize, info.textures.len());

        let mut views: SmallVec<[vk::ImageView; MAX_TEXTURES]> = SmallVec::new();
        let mut extent = None;
        for &handle in &info.textures {
            let texture = pools
                .textures
                .access(handle)
                .expect("framebuffer references a dead texture");
            let texture_extent = vk::Extent2D {
                width: texture.extent.width,
                height: texture.extent.height,
            };
            match extent {
                None => extent = Some(texture_extent),
                Some(previous) => assert_eq!(
                    previous, texture_extent,
                    "all framebuffer attachments must share the same extent"
                ),
            }
            views.push(texture.view);
        }
        let extent = extent.expect("framebuffer needs at least one attachment");

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = unsafe {
            device
                .raw()
                .create_framebuffer(&create_info, device.callbacks())
                .expect("vkCreateFramebuffer failed")
        };

        Framebuffer {
            object: ObjectId::new(ObjectKind::Framebuffer),
            handle,
            render_pass: info.render_pass,
            textures: info.textures.clone(),
            extent,
        }
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        unsafe {
            device
                .raw()
                .destroy_framebuffer(self.handle, device.callbacks());
        }
    }
}
