//! Translation tables between API enums and Vulkan, plus the layout
//! transition helpers the graph uses when planning barriers.

use ash::vk;

use crate::types::{
    CompareOp, CullMode, FrontFace, PolygonMode, RenderTargetLoadOp, SamplerAddressMode,
    SamplerFilter, SamplerMipmapMode, SamplingType, StencilOp, StencilOpState, TextureFormat,
};

pub fn to_vk_load_op(op: RenderTargetLoadOp) -> vk::AttachmentLoadOp {
    match op {
        RenderTargetLoadOp::Load => vk::AttachmentLoadOp::LOAD,
        RenderTargetLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        RenderTargetLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn to_vk_polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn to_vk_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn to_vk_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
    }
}

pub fn to_vk_sample_count(sampling: SamplingType) -> vk::SampleCountFlags {
    match sampling {
        SamplingType::X1 => vk::SampleCountFlags::TYPE_1,
        SamplingType::X2 => vk::SampleCountFlags::TYPE_2,
        SamplingType::X4 => vk::SampleCountFlags::TYPE_4,
        SamplingType::X8 => vk::SampleCountFlags::TYPE_8,
        SamplingType::X16 => vk::SampleCountFlags::TYPE_16,
        SamplingType::X32 => vk::SampleCountFlags::TYPE_32,
        SamplingType::X64 => vk::SampleCountFlags::TYPE_64,
    }
}

pub fn to_vk_stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub fn to_vk_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn to_vk_stencil_op_state(state: &StencilOpState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: to_vk_stencil_op(state.fail_op),
        pass_op: to_vk_stencil_op(state.pass_op),
        depth_fail_op: to_vk_stencil_op(state.depth_fail_op),
        compare_op: to_vk_compare_op(state.compare_op),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

pub fn to_vk_filter(filter: SamplerFilter) -> vk::Filter {
    match filter {
        SamplerFilter::Nearest => vk::Filter::NEAREST,
        SamplerFilter::Linear => vk::Filter::LINEAR,
    }
}

pub fn to_vk_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn to_vk_mipmap_mode(mode: SamplerMipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

/// `TextureFormat::DepthStencil` has no fixed Vulkan format; the device
/// resolves it, so it must not reach this function.
pub fn to_vk_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R8Srgb => vk::Format::R8_SRGB,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::DepthStencil => panic!("depth-stencil format is resolved by the device"),
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn is_stencil_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    is_depth_format(format) || is_stencil_format(format)
}

/// True for formats whose sampled values are floating point; clear colors
/// are only accepted for these.
pub fn is_float_sampled_format(format: vk::Format) -> bool {
    !matches!(
        format,
        vk::Format::R8_UINT
            | vk::Format::R8_SINT
            | vk::Format::R8G8_UINT
            | vk::Format::R8G8_SINT
            | vk::Format::R8G8B8A8_UINT
            | vk::Format::R8G8B8A8_SINT
            | vk::Format::R16_UINT
            | vk::Format::R16_SINT
            | vk::Format::R32_UINT
            | vk::Format::R32_SINT
            | vk::Format::R32G32B32A32_UINT
            | vk::Format::R32G32B32A32_SINT
    ) && !is_depth_stencil_format(format)
}

pub fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    let mut aspect = vk::ImageAspectFlags::empty();
    if is_depth_format(format) {
        aspect |= vk::ImageAspectFlags::DEPTH;
    }
    if is_stencil_format(format) {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    if aspect.is_empty() {
        aspect = vk::ImageAspectFlags::COLOR;
    }
    aspect
}

pub fn image_layout_to_access_flags(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::GENERAL => vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::MEMORY_WRITE,
        // Presentation is ordered by semaphores; no memory dependency needed
        // past this point.
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        _ => panic!("unsupported image layout: {:?}", layout),
    }
}

pub fn image_layout_to_pipeline_stage_flags(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::GENERAL => vk::PipelineStageFlags::ALL_COMMANDS,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        _ => panic!("unsupported image layout: {:?}", layout),
    }
}

/// Largest supported sample count that does not exceed the desired one.
pub fn pick_sample_count(
    desired: vk::SampleCountFlags,
    supported: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    if supported.contains(desired) {
        return desired;
    }
    let desired_bits = desired.as_raw();
    let mut best = vk::SampleCountFlags::TYPE_1.as_raw();
    let mut bit = 1u32;
    while bit < desired_bits {
        if supported.as_raw() & bit != 0 {
            best = bit;
        }
        bit <<= 1;
    }
    vk::SampleCountFlags::from_raw(best)
}

pub fn memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&it| {
        (type_bits & (1 << it)) != 0
            && props.memory_types[it as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_falls_back_to_largest_supported() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(
            pick_sample_count(vk::SampleCountFlags::TYPE_4, supported),
            vk::SampleCountFlags::TYPE_4
        );
        assert_eq!(
            pick_sample_count(vk::SampleCountFlags::TYPE_16, supported),
            vk::SampleCountFlags::TYPE_4
        );
        assert_eq!(
            pick_sample_count(vk::SampleCountFlags::TYPE_1, vk::SampleCountFlags::TYPE_1),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn depth_formats_are_classified() {
        assert!(is_depth_stencil_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(is_depth_stencil_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_stencil_format(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(
            aspect_mask_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn clear_colors_only_for_float_formats() {
        assert!(is_float_sampled_format(vk::Format::B8G8R8A8_SRGB));
        assert!(is_float_sampled_format(vk::Format::R32G32B32A32_SFLOAT));
        assert!(!is_float_sampled_format(vk::Format::R32_UINT));
        assert!(!is_float_sampled_format(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn undefined_layout_has_no_access() {
        assert_eq!(
            image_layout_to_access_flags(vk::ImageLayout::UNDEFINED),
            vk::AccessFlags::empty()
        );
        assert_eq!(
            image_layout_to_pipeline_stage_flags(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
    }
}
