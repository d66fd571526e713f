/// Visibility tests shared by the CPU reference kernels
///
/// Mirrors the WGSL in `shaders/common.wgsl` operation for operation:
/// bounding-sphere frustum, normal-cone and pyramid occlusion tests, and the
/// per-triangle clip-space tests.
use cgmath::{InnerSpace, Matrix4, Vector3, Vector4};

use super::gpu_types::{GpuCullData, GpuObject};
use crate::constants::flags;

/// Read-only view of a pyramid mip chain
#[derive(Debug, Clone, Copy)]
pub struct PyramidView<'a> {
    pub width: u32,
    pub height: u32,
    pub mips: &'a [Vec<f32>],
}

impl<'a> PyramidView<'a> {
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    pub fn texel(&self, level: u32, x: u32, y: u32) -> f32 {
        let (w, _) = self.level_size(level);
        self.mips[level as usize][(y * w + x) as usize]
    }

    /// Farthest depth over a uv rectangle, read at the mip where the
    /// rectangle spans at most two texels per axis
    pub fn farthest_depth(&self, uv: [f32; 4]) -> f32 {
        let [min_u, min_v, max_u, max_v] = uv.map(|c| c.clamp(0.0, 1.0));
        let extent = ((max_u - min_u) * self.width as f32).max((max_v - min_v) * self.height as f32);
        let last = self.mips.len() as u32 - 1;
        let level = (extent.max(1.0).log2().floor() as u32).min(last);

        let (w, h) = self.level_size(level);
        let x0 = ((min_u * w as f32).floor() as u32).min(w - 1);
        let x1 = ((max_u * w as f32).floor() as u32).min(w - 1);
        let y0 = ((min_v * h as f32).floor() as u32).min(h - 1);
        let y1 = ((max_v * h as f32).floor() as u32).min(h - 1);

        let mut depth = f32::MAX;
        for y in y0..=y1 {
            for x in x0..=x1 {
                depth = depth.min(self.texel(level, x, y));
            }
        }
        depth
    }
}

fn matrix(m: &[[f32; 4]; 4]) -> Matrix4<f32> {
    Matrix4::from(*m)
}

/// World-space center and radius of a local sphere under an object transform
pub fn world_sphere(object: &GpuObject, sphere: [f32; 4]) -> (Vector3<f32>, f32) {
    let center = matrix(&object.model) * Vector4::new(sphere[0], sphere[1], sphere[2], 1.0);
    (center.truncate(), sphere[3] * object.scale)
}

pub fn frustum_visible(data: &GpuCullData, center: Vector3<f32>, radius: f32) -> bool {
    data.frustum_planes
        .iter()
        .all(|p| p[0] * center.x + p[1] * center.y + p[2] * center.z + p[3] > -radius)
}

/// Whether every triangle of the cluster faces away from the camera
pub fn cone_culled(data: &GpuCullData, object: &GpuObject, cone: [f32; 4], center: Vector3<f32>, radius: f32) -> bool {
    let model = matrix(&object.model);
    let axis = (model * Vector4::new(cone[0], cone[1], cone[2], 0.0)).truncate();
    if axis.magnitude2() == 0.0 {
        return false;
    }
    let axis = axis.normalize();
    let camera = Vector3::new(data.camera_position[0], data.camera_position[1], data.camera_position[2]);
    let to_center = center - camera;
    to_center.dot(axis) >= cone[3] * to_center.magnitude() + radius
}

/// UV-space bounds of a view-space sphere (z positive forward), or `None`
/// when it touches the near plane
pub fn project_sphere(c: Vector3<f32>, r: f32, znear: f32, p00: f32, p11: f32) -> Option<[f32; 4]> {
    if c.z < r + znear {
        return None;
    }

    let cr = c * r;
    let czr2 = c.z * c.z - r * r;

    let vx = (c.x * c.x + czr2).sqrt();
    let min_x = (vx * c.x - cr.z) / (vx * c.z + cr.x);
    let max_x = (vx * c.x + cr.z) / (vx * c.z - cr.x);

    let vy = (c.y * c.y + czr2).sqrt();
    let min_y = (vy * c.y - cr.z) / (vy * c.z + cr.y);
    let max_y = (vy * c.y + cr.z) / (vy * c.z - cr.y);

    // NDC y points up, texture v points down
    Some([
        min_x * p00 * 0.5 + 0.5,
        0.5 - max_y * p11 * 0.5,
        max_x * p00 * 0.5 + 0.5,
        0.5 - min_y * p11 * 0.5,
    ])
}

pub fn sphere_occlusion_visible(data: &GpuCullData, pyramid: &PyramidView, center: Vector3<f32>, radius: f32) -> bool {
    let view = matrix(&data.view) * center.extend(1.0);
    let c = Vector3::new(view.x, view.y, -view.z);
    let [p00, p11, znear, _] = data.projection;

    match project_sphere(c, radius, znear, p00, p11) {
        Some(uv) => znear / (c.z - radius) >= pyramid.farthest_depth(uv),
        None => true,
    }
}

/// Frustum and, when a pyramid is given, occlusion test of a world sphere
pub fn sphere_visible(data: &GpuCullData, pyramid: Option<&PyramidView>, center: Vector3<f32>, radius: f32) -> bool {
    if data.flags & flags::CULL_FRUSTUM != 0 && !frustum_visible(data, center, radius) {
        return false;
    }
    match pyramid {
        Some(pyramid) if data.flags & flags::CULL_OCCLUSION != 0 => {
            sphere_occlusion_visible(data, pyramid, center, radius)
        }
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangleFate {
    Drawn,
    /// Rejected by a test that does not depend on the pyramid
    Rejected,
    Occluded,
}

impl TriangleFate {
    /// Resolved triangles never need a second look this frame
    pub fn is_resolved(self) -> bool {
        !matches!(self, TriangleFate::Occluded)
    }
}

pub fn triangle_fate(data: &GpuCullData, pyramid: Option<&PyramidView>, clip: [Vector4<f32>; 3]) -> TriangleFate {
    if data.flags & flags::CULL_TRIANGLES == 0 {
        return TriangleFate::Drawn;
    }
    // Clip-space half-spaces hold for vertices on either side of the camera
    let outside = |f: fn(&Vector4<f32>) -> bool| clip.iter().all(f);
    if outside(|v| v.w <= 1e-6) {
        return TriangleFate::Rejected;
    }
    if data.flags & flags::CULL_FRUSTUM != 0
        && (outside(|v| v.x < -v.w) || outside(|v| v.x > v.w) || outside(|v| v.y < -v.w) || outside(|v| v.y > v.w))
    {
        return TriangleFate::Rejected;
    }
    // Crossing the near plane: keep rather than clip
    if clip.iter().any(|v| v.w <= 1e-6) {
        return TriangleFate::Drawn;
    }
    let ndc = clip.map(|v| v.truncate() / v.w);

    let [a, b, c] = ndc;
    let area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    if area <= 0.0 {
        return TriangleFate::Rejected;
    }

    if let Some(pyramid) = pyramid {
        if data.flags & flags::CULL_OCCLUSION != 0 {
            let min_x = a.x.min(b.x).min(c.x);
            let max_x = a.x.max(b.x).max(c.x);
            let min_y = a.y.min(b.y).min(c.y);
            let max_y = a.y.max(b.y).max(c.y);
            let uv = [min_x * 0.5 + 0.5, 0.5 - max_y * 0.5, max_x * 0.5 + 0.5, 0.5 - min_y * 0.5];
            let nearest = a.z.max(b.z).max(c.z);
            if nearest < pyramid.farthest_depth(uv) {
                return TriangleFate::Occluded;
            }
        }
    }
    TriangleFate::Drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{build_projection_matrix, build_view_matrix, extract_frustum_planes, init_camera, projection_coefficients};
    use bytemuck::Zeroable;

    fn cull_data(flags: u32) -> GpuCullData {
        let camera = init_camera(64, 64);
        let view = build_view_matrix(&camera);
        let mut data = GpuCullData::zeroed();
        data.view = view.into();
        data.view_proj = (build_projection_matrix(&camera) * view).into();
        data.frustum_planes = extract_frustum_planes(&camera);
        data.projection = projection_coefficients(&camera);
        data.flags = flags;
        data
    }

    fn flat_pyramid(depth: f32) -> Vec<Vec<f32>> {
        (0..7).map(|l| vec![depth; (64usize >> l) * (64usize >> l)]).collect()
    }

    #[test]
    fn sphere_behind_occluder_is_hidden() {
        let data = cull_data(flags::CULL_FRUSTUM | flags::CULL_OCCLUSION);
        // Occluder at distance 5 covers the whole view
        let mips = flat_pyramid(data.projection[2] / 5.0);
        let pyramid = PyramidView { width: 64, height: 64, mips: &mips };

        assert!(!sphere_visible(&data, Some(&pyramid), Vector3::new(0.0, 0.0, -20.0), 1.0));
        assert!(sphere_visible(&data, Some(&pyramid), Vector3::new(0.0, 0.0, -3.0), 1.0));
        // Without a pyramid only the frustum applies
        assert!(sphere_visible(&data, None, Vector3::new(0.0, 0.0, -20.0), 1.0));
    }

    #[test]
    fn projected_sphere_is_centered() {
        let uv = project_sphere(Vector3::new(0.0, 0.0, 10.0), 1.0, 0.1, 1.0, 1.0).unwrap();
        assert!((uv[0] + uv[2] - 1.0).abs() < 1e-5);
        assert!((uv[1] + uv[3] - 1.0).abs() < 1e-5);
        assert!(uv[0] < 0.5 && uv[2] > 0.5);
        assert!(project_sphere(Vector3::new(0.0, 0.0, 0.5), 1.0, 0.1, 1.0, 1.0).is_none());
    }

    #[test]
    fn cone_culls_clusters_facing_away() {
        let data = cull_data(flags::CULL_CONE);
        let object = GpuObject {
            model: Matrix4::from_scale(1.0f32).into(),
            scale: 1.0,
            ..GpuObject::default()
        };
        let center = Vector3::new(0.0, 0.0, -10.0);
        // Normals point away from the camera at the origin
        assert!(cone_culled(&data, &object, [0.0, 0.0, -1.0, 0.0], center, 1.0));
        assert!(!cone_culled(&data, &object, [0.0, 0.0, 1.0, 0.0], center, 1.0));
        // Open cone never culls
        assert!(!cone_culled(&data, &object, [0.0, 0.0, -1.0, 1.0], center, 1.0));
    }

    #[test]
    fn triangle_winding_and_frustum() {
        let data = cull_data(flags::CULL_TRIANGLES | flags::CULL_FRUSTUM);
        let v = |x: f32, y: f32| Vector4::new(x, y, 0.5, 1.0);
        let front = [v(0.0, 0.0), v(0.5, 0.0), v(0.0, 0.5)];
        let back = [v(0.0, 0.0), v(0.0, 0.5), v(0.5, 0.0)];
        let outside = [v(2.0, 0.0), v(3.0, 0.0), v(2.0, 1.0)];
        assert_eq!(triangle_fate(&data, None, front), TriangleFate::Drawn);
        assert_eq!(triangle_fate(&data, None, back), TriangleFate::Rejected);
        assert_eq!(triangle_fate(&data, None, outside), TriangleFate::Rejected);

        let pass_through = cull_data(0);
        assert_eq!(triangle_fate(&pass_through, None, back), TriangleFate::Drawn);
    }

    #[test]
    fn triangle_behind_camera_is_rejected() {
        let project = |data: &GpuCullData, p: [f32; 3]| matrix(&data.view_proj) * Vector4::new(p[0], p[1], p[2], 1.0);
        for cull_flags in [flags::CULL_TRIANGLES, flags::CULL_TRIANGLES | flags::CULL_FRUSTUM] {
            let data = cull_data(cull_flags);
            let behind = [[-1.0, -1.0, 5.0], [1.0, -1.0, 5.0], [0.0, 1.0, 5.0]].map(|p| project(&data, p));
            assert!(behind.iter().all(|v| v.w < 0.0));
            assert_eq!(triangle_fate(&data, None, behind), TriangleFate::Rejected);

            // One vertex behind the camera: straddles the near plane
            let straddling = [[-0.5, 0.0, -5.0], [0.5, 0.0, -5.0], [0.0, 0.5, 1.0]].map(|p| project(&data, p));
            assert_eq!(triangle_fate(&data, None, straddling), TriangleFate::Drawn);
        }
    }

    #[test]
    fn triangle_behind_occluder_is_occluded() {
        let data = cull_data(flags::CULL_TRIANGLES | flags::CULL_OCCLUSION);
        let mips = flat_pyramid(0.5);
        let pyramid = PyramidView { width: 64, height: 64, mips: &mips };
        let tri = |z: f32| [Vector4::new(0.0, 0.0, z, 1.0), Vector4::new(0.1, 0.0, z, 1.0), Vector4::new(0.0, 0.1, z, 1.0)];
        assert_eq!(triangle_fate(&data, Some(&pyramid), tri(0.25)), TriangleFate::Occluded);
        assert_eq!(triangle_fate(&data, Some(&pyramid), tri(0.75)), TriangleFate::Drawn);
        assert!(!TriangleFate::Occluded.is_resolved());
    }
}
