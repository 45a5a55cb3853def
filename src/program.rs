//! Shader programs: a shader module plus its reflection.

use std::ffi::CString;

use ash::vk;

use crate::data::DataProvider;
use crate::device::Device;
use crate::memory::GpuAllocator;
use crate::resource::{ObjectId, ObjectKind};
use crate::spirv::{self, Reflection};

pub struct Program {
    pub object: ObjectId,
    pub handle: vk::ShaderModule,
    pub reflection: Reflection,
    /// NUL-terminated entry point name, kept alive for pipeline creation.
    pub entry_point: CString,
}

impl Program {
    pub fn new(device: &Device, data: &DataProvider) -> Program {
        let bytes = data.fetch().expect("program data provider is empty");
        let reflection = spirv::reflect(&bytes)
            .unwrap_or_else(|e| panic!("failed to reflect shader module: {:?}", e));
        let words = spirv::words_from_bytes(&bytes)
            .unwrap_or_else(|e| panic!("failed to decode shader module: {:?}", e));
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let handle = unsafe {
            device
                .raw()
                .create_shader_module(&create_info, device.callbacks())
                .expect("vkCreateShaderModule failed")
        };
        let entry_point = CString::new(reflection.entry_point.clone())
            .expect("entry point name contains a NUL byte");
        Program {
            object: ObjectId::new(ObjectKind::Program),
            handle,
            reflection,
            entry_point,
        }
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        match self.reflection.stage {
            spirv::ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            spirv::ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            spirv::ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    pub fn destroy(self, device: &Device, _gpu: &mut GpuAllocator) {
        unsafe {
            device
                .raw()
                .destroy_shader_module(self.handle, device.callbacks());
        }
    }
}
