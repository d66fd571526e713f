/// Data-Oriented Cull Camera
///
/// Pure data plus free functions. The culling pipeline consumes the view
/// matrix, the frustum planes and the projection coefficients derived here;
/// it never mutates the camera.
///
/// Projection is reverse-Z with an infinite far plane: depth is
/// `znear / view_distance`, 1.0 at the near plane and 0.0 at infinity.
use cgmath::{InnerSpace, Matrix4, Point3, Vector3, Vector4};

use crate::constants::camera::{FOVY_RADIANS, ZNEAR};

/// Camera data as a plain old data structure
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraData {
    pub position: [f32; 3],
    pub yaw_radians: f32,
    pub pitch_radians: f32,
    pub aspect_ratio: f32,
    pub fovy_radians: f32,
    pub znear: f32,
    /// Distance cull plane. 0.0 disables it.
    pub zfar: f32,
}

/// Initialize camera data looking down -Z from the origin
pub fn init_camera(width: u32, height: u32) -> CameraData {
    CameraData {
        position: [0.0, 0.0, 0.0],
        yaw_radians: -std::f32::consts::FRAC_PI_2,
        pitch_radians: 0.0,
        aspect_ratio: width as f32 / height.max(1) as f32,
        fovy_radians: FOVY_RADIANS,
        znear: ZNEAR,
        zfar: 0.0,
    }
}

/// Camera at `position` oriented towards `target`
pub fn look_at(position: Point3<f32>, target: Point3<f32>, aspect_ratio: f32) -> CameraData {
    let direction = (target - position).normalize();
    CameraData {
        position: position.into(),
        yaw_radians: direction.z.atan2(direction.x),
        pitch_radians: direction.y.clamp(-1.0, 1.0).asin(),
        aspect_ratio,
        fovy_radians: FOVY_RADIANS,
        znear: ZNEAR,
        zfar: 0.0,
    }
}

/// Calculate forward vector from camera orientation
pub fn calculate_forward_vector(yaw_rad: f32, pitch_rad: f32) -> Vector3<f32> {
    let (sin_yaw, cos_yaw) = yaw_rad.sin_cos();
    let (sin_pitch, cos_pitch) = pitch_rad.sin_cos();

    Vector3::new(cos_pitch * cos_yaw, sin_pitch, cos_pitch * sin_yaw)
}

/// Build view matrix from camera data
pub fn build_view_matrix(camera: &CameraData) -> Matrix4<f32> {
    let position = Point3::from(camera.position);
    let forward = calculate_forward_vector(camera.yaw_radians, camera.pitch_radians);

    // Straight up or down makes unit_y degenerate as the up vector
    let up = if forward.y.abs() > 0.999 {
        Vector3::unit_z()
    } else {
        Vector3::unit_y()
    };

    Matrix4::look_at_rh(position, position + forward, up)
}

/// Reverse-Z infinite perspective projection
pub fn build_projection_matrix(camera: &CameraData) -> Matrix4<f32> {
    let f = 1.0 / (camera.fovy_radians * 0.5).tan();
    #[rustfmt::skip]
    let projection = Matrix4::new(
        f / camera.aspect_ratio, 0.0, 0.0, 0.0,
        0.0, f, 0.0, 0.0,
        0.0, 0.0, 0.0, -1.0,
        0.0, 0.0, camera.znear, 0.0,
    );
    projection
}

/// `[P00, P11, znear, zfar]` as the sphere projection in the kernels expects
pub fn projection_coefficients(camera: &CameraData) -> [f32; 4] {
    let projection = build_projection_matrix(camera);
    [projection.x.x, projection.y.y, camera.znear, camera.zfar]
}

/// World-space frustum planes (left, right, bottom, top, near, far) as
/// normalized `(n, d)` with `dot(n, p) + d >= 0` inside
pub fn extract_frustum_planes(camera: &CameraData) -> [[f32; 4]; 6] {
    let view_proj = build_projection_matrix(camera) * build_view_matrix(camera);
    let row = |i: usize| Vector4::new(view_proj.x[i], view_proj.y[i], view_proj.z[i], view_proj.w[i]);
    let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

    let far = if camera.zfar > 0.0 {
        let forward = calculate_forward_vector(camera.yaw_radians, camera.pitch_radians);
        let position = Vector3::from(camera.position);
        Vector4::new(-forward.x, -forward.y, -forward.z, forward.dot(position) + camera.zfar)
    } else {
        // Infinite far plane: always inside
        Vector4::new(0.0, 0.0, 0.0, 1.0)
    };

    let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 - r2, far].map(|p| [p.x, p.y, p.z, p.w]);

    // Normalize planes
    for plane in &mut planes {
        let length = (plane[0] * plane[0] + plane[1] * plane[1] + plane[2] * plane[2]).sqrt();
        if length > 0.0 {
            plane[0] /= length;
            plane[1] /= length;
            plane[2] /= length;
            plane[3] /= length;
        }
    }

    planes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inside(planes: &[[f32; 4]; 6], p: Vector3<f32>, radius: f32) -> bool {
        planes
            .iter()
            .all(|pl| pl[0] * p.x + pl[1] * p.y + pl[2] * p.z + pl[3] > -radius)
    }

    #[test]
    fn forward_points_down_negative_z_by_default() {
        let camera = init_camera(1920, 1080);
        let forward = calculate_forward_vector(camera.yaw_radians, camera.pitch_radians);
        assert!((forward - Vector3::new(0.0, 0.0, -1.0)).magnitude() < 1e-5);
    }

    #[test]
    fn reverse_z_depth_is_znear_over_distance() {
        let camera = init_camera(100, 100);
        let view_proj = build_projection_matrix(&camera) * build_view_matrix(&camera);
        let clip = view_proj * Vector4::new(0.0, 0.0, -10.0, 1.0);
        assert!((clip.z / clip.w - camera.znear / 10.0).abs() < 1e-6);
    }

    #[test]
    fn frustum_planes_classify_points() {
        let camera = look_at(Point3::new(0.0, 0.0, 5.0), Point3::new(0.0, 0.0, 0.0), 1.0);
        let planes = extract_frustum_planes(&camera);

        assert!(inside(&planes, Vector3::new(0.0, 0.0, 0.0), 0.1));
        assert!(!inside(&planes, Vector3::new(0.0, 0.0, 10.0), 0.1), "behind the camera");
        assert!(!inside(&planes, Vector3::new(50.0, 0.0, 0.0), 0.1), "far off to the side");
        assert!(inside(&planes, Vector3::new(0.0, 0.0, -10_000.0), 0.1), "infinite far plane");
    }

    #[test]
    fn far_plane_limits_distance_when_set() {
        let mut camera = init_camera(1, 1);
        camera.zfar = 100.0;
        let planes = extract_frustum_planes(&camera);
        assert!(inside(&planes, Vector3::new(0.0, 0.0, -50.0), 0.5));
        assert!(!inside(&planes, Vector3::new(0.0, 0.0, -150.0), 0.5));
    }
}
