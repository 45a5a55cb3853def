//! Camera matrices and packed colors.
//!
//! The whole renderer uses reverse depth: projection matrices map the near
//! plane to 1 and the far plane to 0, and every pipeline is created with a
//! `GREATER` depth compare. Changing one side of this contract requires
//! changing the other (and the depth clear value) in lockstep.

pub use nalgebra_glm as glm;

pub type Float4 = glm::Vec4;
pub type Float4x4 = glm::Mat4;

/// RGBA8 color packed into a single `u32`, least significant byte is red.
pub type ColorPacked = u32;
pub type ColorUnpacked = Float4;

pub fn pack_color(color: ColorUnpacked) -> ColorPacked {
    let r = (color.x.clamp(0.0, 1.0) * 255.0) as u32;
    let g = (color.y.clamp(0.0, 1.0) * 255.0) as u32;
    let b = (color.z.clamp(0.0, 1.0) * 255.0) as u32;
    let a = (color.w.clamp(0.0, 1.0) * 255.0) as u32;
    r | (g << 8) | (b << 16) | (a << 24)
}

pub fn unpack_color(color: ColorPacked) -> ColorUnpacked {
    glm::vec4(
        (color & 0xff) as f32 / 255.0,
        ((color >> 8) & 0xff) as f32 / 255.0,
        ((color >> 16) & 0xff) as f32 / 255.0,
        ((color >> 24) & 0xff) as f32 / 255.0,
    )
}

/// Reverse-depth perspective projection (near plane maps to 1, far plane
/// to 0), y-down clip space. Forward is positive z, up is positive y.
///
/// See <https://vincent-p.github.io/posts/vulkan_perspective_matrix/>.
pub fn perspective(fov_deg: f32, aspect: f32, near: f32, far: f32) -> Float4x4 {
    let focal_length = 1.0 / (fov_deg.to_radians() / 2.0).tan();
    let x = focal_length / aspect;
    let y = -focal_length;
    let a = near / (near - far);
    let b = a * -far;
    #[rustfmt::skip]
    let m = Float4x4::new(
        x,   0.0, 0.0, 0.0,
        0.0, y,   0.0, 0.0,
        0.0, 0.0, a,   b,
        0.0, 0.0, 1.0, 0.0,
    );
    m
}

/// Reverse-depth orthographic projection matching [`perspective`]'s clip
/// space conventions.
pub fn orthographic(
    left: f32,
    right: f32,
    bottom: f32,
    top: f32,
    near: f32,
    far: f32,
) -> Float4x4 {
    let far_m_near = far - near;
    let right_m_left = right - left;
    let bottom_m_top = bottom - top;
    #[rustfmt::skip]
    let m = Float4x4::new(
        2.0 / right_m_left, 0.0,                0.0,            -(right + left) / right_m_left,
        0.0,                2.0 / bottom_m_top, 0.0,            -(bottom + top) / bottom_m_top,
        0.0,                0.0,                1.0 / far_m_near, -near / far_m_near,
        0.0,                0.0,                0.0,             1.0,
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_z(m: &Float4x4, z: f32) -> f32 {
        let clip = m * glm::vec4(0.0, 0.0, z, 1.0);
        clip.z / clip.w
    }

    #[test]
    fn perspective_is_reverse_z() {
        let m = perspective(60.0, 1.0, 0.1, 100.0);
        assert!((project_z(&m, 0.1) - 1.0).abs() < 1e-5);
        assert!(project_z(&m, 100.0).abs() < 1e-5);
        // depth decreases monotonically with distance
        assert!(project_z(&m, 1.0) > project_z(&m, 10.0));
    }

    #[test]
    fn orthographic_is_reverse_z_at_bounds() {
        let m = orthographic(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0);
        // z is remapped affinely across [near, far]
        let near = project_z(&m, 0.0);
        let far = project_z(&m, 10.0);
        assert!((far - near - 1.0).abs() < 1e-5);
    }

    #[test]
    fn color_pack_round_trips_on_quantized_inputs() {
        for packed in [0u32, 0xffff_ffff, 0x0102_03ff, 0x8040_20ff] {
            assert_eq!(pack_color(unpack_color(packed)), packed);
        }
        let c = glm::vec4(0.25, 0.5, 0.75, 1.0);
        let round = unpack_color(pack_color(c));
        for it in 0..4 {
            assert!((round[it] - c[it]).abs() <= 1.0 / 255.0);
        }
    }

    #[test]
    fn matrix_inverse_round_trips() {
        let m = perspective(75.0, 16.0 / 9.0, 0.05, 200.0);
        let id = glm::inverse(&m) * m;
        for row in 0..4 {
            for col in 0..4 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert!((id[(row, col)] - expected).abs() < 1e-4);
            }
        }
    }
}
