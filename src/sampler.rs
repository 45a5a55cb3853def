//! Sampler objects.

use ash::vk;

use crate::device::Device;
use crate::memory::GpuAllocator;
use crate::resource::{ObjectId, ObjectKind};
use crate::types::SamplerInfo;
use crate::utils;

pub struct Sampler {
    pub object: ObjectId,
    pub handle: vk::Sampler,
}

impl Sampler {
    pub fn new(device: &Device, info: &SamplerInfo) -> Sampler {
        let anisotropy_supported = device.features().sampler_anisotropy != 0;
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(utils::to_vk_filter(info.mag_filter))
            .min_filter(utils::to_vk_filter(info.min_filter))
            .mipmap_mode(utils::to_vk_mipmap_mode(info.mipmap_mode))
            .address_mode_u(utils::to_vk_address_mode(info.address_mode_u))
            .address_mode_v(utils::to_vk_address_mode(info.address_mode_v))
            .address_mode_w(utils::to_vk_address_mode(info.address_mode_w))
            .mip_lod_bias(info.mip_lod_bias)
            .anisotropy_enable(info.anisotropy_enable && anisotropy_supported)
            .max_anisotropy(info.max_anisotropy)
            .compare_enable(info.compare_enabled)
            .compare_op(utils::to_vk_compare_op(info.compare_op))
            .min_lod(info.min_lod)
            .max_lod(info.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false);
        let handle = unsafe {
            device
                .raw()
                .create_sampler(&create_info, device.callbacks())
                .expect("vkCreateSampler failed")
        };
        Sampler {
            object: ObjectId::new(ObjectKind::Sampler),
            handle,
        }
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        unsafe { device.raw().destroy_sampler(self.handle, device.callbacks()) };
    }
}
