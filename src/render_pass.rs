//! Render pass derivation.
//!
//! A graphics pass description boils down to one subpass that writes every
//! color attachment and reads+writes the optional depth attachment. Store
//! op is always STORE. Attachments are declared with their working layouts
//! as both initial and final layout; the graph transitions each texture to
//! the attachment layout with an explicit barrier before the pass begins.

use ash::vk;
use ordered_float::OrderedFloat;
use smallvec::SmallVec;

use crate::device::Device;
use crate::memory::GpuAllocator;
use crate::resource::{ObjectId, ObjectKind};
use crate::types::MAX_PASS_RENDER_TARGETS;
use crate::utils;

const MAX_ATTACHMENTS: usize = MAX_PASS_RENDER_TARGETS + 1;

#[derive(Clone, Debug)]
pub struct RenderPassAttachmentInfo {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub sampling: vk::SampleCountFlags,
    pub clear_color: [f32; 4],
}

/// Everything that determines the derived render pass. Also the cache key
/// input: two infos producing the same key must produce interchangeable
/// render passes.
#[derive(Clone, Debug)]
pub struct RenderPassInfo {
    pub color_attachments: SmallVec<[RenderPassAttachmentInfo; MAX_PASS_RENDER_TARGETS]>,
    pub depth_stencil_attachment: Option<RenderPassAttachmentInfo>,
    pub depth_read: bool,
    pub depth_write: bool,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AttachmentKey {
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    sampling: vk::SampleCountFlags,
    clear: [OrderedFloat<f32>; 4],
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RenderPassKey {
    colors: SmallVec<[AttachmentKey; MAX_PASS_RENDER_TARGETS]>,
    depth: Option<AttachmentKey>,
    depth_read: bool,
    depth_write: bool,
}

fn attachment_key(info: &RenderPassAttachmentInfo) -> AttachmentKey {
    AttachmentKey {
        format: info.format,
        load_op: info.load_op,
        sampling: info.sampling,
        clear: [
            OrderedFloat(info.clear_color[0]),
            OrderedFloat(info.clear_color[1]),
            OrderedFloat(info.clear_color[2]),
            OrderedFloat(info.clear_color[3]),
        ],
    }
}

impl RenderPassInfo {
    pub fn key(&self) -> RenderPassKey {
        RenderPassKey {
            colors: self.color_attachments.iter().map(attachment_key).collect(),
            depth: self.depth_stencil_attachment.as_ref().map(attachment_key),
            depth_read: self.depth_read,
            depth_write: self.depth_write,
        }
    }

    pub fn num_attachments(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_stencil_attachment.is_some())
    }
}

pub struct RenderPass {
    pub object: ObjectId,
    pub handle: vk::RenderPass,
    /// Working layout per attachment, in attachment order (colors then
    /// depth). The graph transitions each attachment texture into this
    /// layout before beginning the pass.
    pub attachment_layouts: SmallVec<[vk::ImageLayout; MAX_ATTACHMENTS]>,
    pub clear_values: SmallVec<[vk::ClearValue; MAX_ATTACHMENTS]>,
    pub num_color_attachments: u32,
    pub has_depth_stencil: bool,
}

impl RenderPass {
    pub fn new(device: &Device, info: &RenderPassInfo) -> RenderPass {
        let mut descriptions: SmallVec<[vk::AttachmentDescription; MAX_ATTACHMENTS]> =
            SmallVec::new();
        let mut attachment_layouts: SmallVec<[vk::ImageLayout; MAX_ATTACHMENTS]> = SmallVec::new();
        let mut clear_values: SmallVec<[vk::ClearValue; MAX_ATTACHMENTS]> = SmallVec::new();

        for attachment in &info.color_attachments {
            let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            descriptions.push(vk::AttachmentDescription {
                flags: vk::AttachmentDescriptionFlags::empty(),
                format: attachment.format,
                samples: attachment.sampling,
                load_op: attachment.load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: layout,
                final_layout: layout,
            });
            attachment_layouts.push(layout);
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: attachment.clear_color,
                },
            });
        }
        if let Some(depth) = &info.depth_stencil_attachment {
            let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
            descriptions.push(vk::AttachmentDescription {
                flags: vk::AttachmentDescriptionFlags::empty(),
                format: depth.format,
                samples: depth.sampling,
                load_op: depth.load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: depth.load_op,
                stencil_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: layout,
                final_layout: layout,
            });
            attachment_layouts.push(layout);
            // reverse depth: cleared depth is the far plane, which is 0
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.0,
                    stencil: 0,
                },
            });
        }

        let color_refs: SmallVec<[vk::AttachmentReference; MAX_PASS_RENDER_TARGETS]> = info
            .color_attachments
            .iter()
            .enumerate()
            .map(|(it, _)| vk::AttachmentReference {
                attachment: it as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: info.color_attachments.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if info.depth_stencil_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses);
        let handle = unsafe {
            device
                .raw()
                .create_render_pass(&create_info, device.callbacks())
                .expect("vkCreateRenderPass failed")
        };

        RenderPass {
            object: ObjectId::new(ObjectKind::RenderPass),
            handle,
            attachment_layouts,
            clear_values,
            num_color_attachments: info.color_attachments.len() as u32,
            has_depth_stencil: info.depth_stencil_attachment.is_some(),
        }
    }

    pub fn num_attachments(&self) -> u32 {
        self.num_color_attachments + u32::from(self.has_depth_stencil)
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        unsafe {
            device
                .raw()
                .destroy_render_pass(self.handle, device.callbacks());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn color(format: vk::Format, clear: [f32; 4]) -> RenderPassAttachmentInfo {
        RenderPassAttachmentInfo {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            sampling: vk::SampleCountFlags::TYPE_1,
            clear_color: clear,
        }
    }

    #[test]
    fn equal_infos_produce_equal_keys() {
        let a = RenderPassInfo {
            color_attachments: smallvec![color(vk::Format::B8G8R8A8_SRGB, [0.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
            depth_read: false,
            depth_write: false,
        };
        let b = RenderPassInfo {
            color_attachments: smallvec![color(vk::Format::B8G8R8A8_SRGB, [0.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
            depth_read: false,
            depth_write: false,
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn clear_color_changes_the_key() {
        let a = RenderPassInfo {
            color_attachments: smallvec![color(vk::Format::B8G8R8A8_SRGB, [0.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
            depth_read: false,
            depth_write: false,
        };
        let b = RenderPassInfo {
            color_attachments: smallvec![color(vk::Format::B8G8R8A8_SRGB, [1.0, 0.0, 0.0, 1.0])],
            depth_stencil_attachment: None,
            depth_read: false,
            depth_write: false,
        };
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn depth_presence_changes_the_key() {
        let colors: SmallVec<[RenderPassAttachmentInfo; MAX_PASS_RENDER_TARGETS]> =
            smallvec![color(vk::Format::B8G8R8A8_SRGB, [0.0; 4])];
        let without = RenderPassInfo {
            color_attachments: colors.clone(),
            depth_stencil_attachment: None,
            depth_read: false,
            depth_write: false,
        };
        let with = RenderPassInfo {
            color_attachments: colors,
            depth_stencil_attachment: Some(RenderPassAttachmentInfo {
                format: vk::Format::D24_UNORM_S8_UINT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                sampling: vk::SampleCountFlags::TYPE_1,
                clear_color: [0.0; 4],
            }),
            depth_read: true,
            depth_write: true,
        };
        assert_ne!(without.key(), with.key());
        assert_eq!(with.num_attachments(), 2);
    }
}
