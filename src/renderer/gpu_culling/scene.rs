/// Scene geometry consumed by the culling pipeline
///
/// Meshes are split into meshlets on the CPU, packed into flat GPU arrays and
/// uploaded once. Render objects reference meshes by handle; the packed
/// layout replaces handles with dense indices.
use std::collections::HashMap;

use cgmath::{InnerSpace, Matrix4, Vector3};

use super::arena::{Arena, Handle};
use super::commands::CommandList;
use super::gpu_types::{GpuMesh, GpuMeshlet, GpuObject};
use super::resources::{BufferHandle, BufferUsage, CullContext};
use crate::config::CullLimits;
use crate::constants::meshlet;
use crate::error::{CullError, CullResult};

/// Cluster of at most `MAX_TRIANGLES` triangles over at most `MAX_VERTICES` vertices
#[derive(Debug, Clone)]
pub struct Meshlet {
    /// Mesh-local vertex indices
    pub vertices: Vec<u32>,
    /// Indices into `vertices`
    pub triangles: Vec<[u8; 3]>,
    pub center: [f32; 3],
    pub radius: f32,
    pub cone_axis: [f32; 3],
    /// Sine of the normal cone spread; 1.0 never culls
    pub cone_cutoff: f32,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub meshlets: Vec<Meshlet>,
    pub center: [f32; 3],
    pub radius: f32,
}

impl Mesh {
    /// Split an indexed triangle list into meshlets, in submission order
    pub fn from_triangles(positions: Vec<[f32; 3]>, indices: &[u32], max_triangles: u32) -> Self {
        let max_triangles = max_triangles.clamp(1, meshlet::MAX_TRIANGLES) as usize;
        let max_vertices = meshlet::MAX_VERTICES as usize;

        let mut meshlets = Vec::new();
        let mut vertices: Vec<u32> = Vec::new();
        let mut local: HashMap<u32, u8> = HashMap::new();
        let mut triangles: Vec<[u8; 3]> = Vec::new();

        for triangle in indices.chunks_exact(3) {
            let new_vertices = triangle.iter().filter(|&&v| !local.contains_key(&v)).count();
            if triangles.len() == max_triangles || vertices.len() + new_vertices > max_vertices {
                meshlets.push(finish_meshlet(&positions, std::mem::take(&mut vertices), std::mem::take(&mut triangles)));
                local.clear();
            }

            let mut corner = [0u8; 3];
            for (slot, &vertex) in corner.iter_mut().zip(triangle) {
                *slot = *local.entry(vertex).or_insert_with(|| {
                    vertices.push(vertex);
                    (vertices.len() - 1) as u8
                });
            }
            triangles.push(corner);
        }
        if !triangles.is_empty() {
            meshlets.push(finish_meshlet(&positions, vertices, triangles));
        }

        let (center, radius) = bounding_sphere(&positions);
        Self {
            positions,
            meshlets,
            center,
            radius,
        }
    }

    /// Axis-aligned cube centered at the origin, faces wound counter-clockwise from outside
    pub fn cube(half_extent: f32) -> Self {
        let h = half_extent;
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];

        let mut positions = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = positions.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                positions.push([
                    h * (normal[0] + su * u[0] + sv * v[0]),
                    h * (normal[1] + su * u[1] + sv * v[1]),
                    h * (normal[2] + su * u[2] + sv * v[2]),
                ]);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::from_triangles(positions, &indices, meshlet::MAX_TRIANGLES)
    }

    /// Flat grid in the XY plane facing +Z, `cells` x `cells` quads
    pub fn grid(cells: u32, half_extent: f32, max_triangles: u32) -> Self {
        let cells = cells.max(1);
        let step = 2.0 * half_extent / cells as f32;
        let row = cells + 1;

        let mut positions = Vec::with_capacity((row * row) as usize);
        for y in 0..row {
            for x in 0..row {
                positions.push([-half_extent + x as f32 * step, -half_extent + y as f32 * step, 0.0]);
            }
        }

        let mut indices = Vec::with_capacity((cells * cells * 6) as usize);
        for y in 0..cells {
            for x in 0..cells {
                let i = y * row + x;
                indices.extend_from_slice(&[i, i + 1, i + row + 1, i, i + row + 1, i + row]);
            }
        }
        Self::from_triangles(positions, &indices, max_triangles)
    }

    pub fn triangle_count(&self) -> usize {
        self.meshlets.iter().map(|m| m.triangles.len()).sum()
    }
}

fn bounding_sphere(points: &[[f32; 3]]) -> ([f32; 3], f32) {
    if points.is_empty() {
        return ([0.0; 3], 0.0);
    }
    let mut min = Vector3::from(points[0]);
    let mut max = min;
    for p in points {
        let p = Vector3::from(*p);
        min = Vector3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
        max = Vector3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
    }
    let center = (min + max) * 0.5;
    let radius = points
        .iter()
        .map(|p| (Vector3::from(*p) - center).magnitude())
        .fold(0.0f32, f32::max);
    (center.into(), radius)
}

fn finish_meshlet(positions: &[[f32; 3]], vertices: Vec<u32>, triangles: Vec<[u8; 3]>) -> Meshlet {
    let points: Vec<[f32; 3]> = vertices.iter().map(|&v| positions[v as usize]).collect();
    let (center, radius) = bounding_sphere(&points);

    let normals: Vec<Vector3<f32>> = triangles
        .iter()
        .filter_map(|t| {
            let a = Vector3::from(points[t[0] as usize]);
            let b = Vector3::from(points[t[1] as usize]);
            let c = Vector3::from(points[t[2] as usize]);
            let n = (b - a).cross(c - a);
            (n.magnitude2() > 0.0).then(|| n.normalize())
        })
        .collect();

    let sum = normals.iter().fold(Vector3::new(0.0, 0.0, 0.0), |acc, n| acc + n);
    let (cone_axis, cone_cutoff) = if normals.is_empty() || sum.magnitude2() == 0.0 {
        ([0.0, 0.0, 0.0], 1.0)
    } else {
        let axis = sum.normalize();
        let min_dot = normals.iter().map(|n| n.dot(axis)).fold(1.0f32, f32::min);
        if min_dot <= 0.0 {
            // Normals span a hemisphere or more
            (axis.into(), 1.0)
        } else {
            (axis.into(), (1.0 - min_dot * min_dot).sqrt())
        }
    };

    Meshlet {
        vertices,
        triangles,
        center,
        radius,
        cone_axis,
        cone_cutoff,
    }
}

/// Mesh instance placed in the world
#[derive(Debug, Clone, Copy)]
pub struct RenderObject {
    pub mesh: Handle<Mesh>,
    pub material: u32,
    pub transform: Matrix4<f32>,
}

#[derive(Default)]
pub struct Scene {
    pub meshes: Arena<Mesh>,
    pub objects: Arena<RenderObject>,
}

/// Flat arrays in upload order
#[derive(Debug, Default, Clone)]
pub struct PackedScene {
    pub objects: Vec<GpuObject>,
    pub meshes: Vec<GpuMesh>,
    pub meshlets: Vec<GpuMeshlet>,
    pub vertices: Vec<[f32; 4]>,
    pub meshlet_data: Vec<u32>,
    /// Sum of meshlet counts over all objects
    pub meshlet_instances: u32,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> Handle<Mesh> {
        self.meshes.insert(mesh)
    }

    pub fn add_object(&mut self, mesh: Handle<Mesh>, transform: Matrix4<f32>) -> CullResult<Handle<RenderObject>> {
        if !self.meshes.contains(mesh) {
            return Err(CullError::StaleHandle {
                kind: "mesh",
                index: mesh.index(),
                generation: mesh.generation(),
            });
        }
        Ok(self.objects.insert(RenderObject {
            mesh,
            material: 0,
            transform,
        }))
    }

    pub fn pack(&self) -> CullResult<PackedScene> {
        let mut packed = PackedScene::default();
        let mut mesh_index: HashMap<Handle<Mesh>, u32> = HashMap::new();

        for (handle, mesh) in self.meshes.iter() {
            mesh_index.insert(handle, packed.meshes.len() as u32);

            let vertex_base = packed.vertices.len() as u32;
            packed
                .vertices
                .extend(mesh.positions.iter().map(|p| [p[0], p[1], p[2], 1.0]));

            packed.meshes.push(GpuMesh {
                bounding_sphere: [mesh.center[0], mesh.center[1], mesh.center[2], mesh.radius],
                meshlet_offset: packed.meshlets.len() as u32,
                meshlet_count: mesh.meshlets.len() as u32,
                _padding: [0; 2],
            });

            for m in &mesh.meshlets {
                packed.meshlets.push(GpuMeshlet {
                    bounding_sphere: [m.center[0], m.center[1], m.center[2], m.radius],
                    cone_axis_cutoff: [m.cone_axis[0], m.cone_axis[1], m.cone_axis[2], m.cone_cutoff],
                    data_offset: packed.meshlet_data.len() as u32,
                    vertex_count: m.vertices.len() as u32,
                    triangle_count: m.triangles.len() as u32,
                    _padding: 0,
                });
                packed.meshlet_data.extend(m.vertices.iter().map(|v| vertex_base + v));
                packed
                    .meshlet_data
                    .extend(m.triangles.iter().map(|t| t[0] as u32 | (t[1] as u32) << 8 | (t[2] as u32) << 16));
            }
        }

        for (_, object) in self.objects.iter() {
            let mesh = *mesh_index.get(&object.mesh).ok_or(CullError::StaleHandle {
                kind: "mesh",
                index: object.mesh.index(),
                generation: object.mesh.generation(),
            })?;
            let m = object.transform;
            let scale = [m.x, m.y, m.z]
                .iter()
                .map(|axis| axis.truncate().magnitude())
                .fold(0.0f32, f32::max);

            packed.objects.push(GpuObject {
                model: m.into(),
                mesh,
                material: object.material,
                meshlet_instance_offset: packed.meshlet_instances,
                scale,
            });
            packed.meshlet_instances += packed.meshes[mesh as usize].meshlet_count;
        }

        Ok(packed)
    }
}

/// Device buffers holding a packed scene, read-only to the pipeline
#[derive(Debug, Clone, Copy)]
pub struct SceneBuffers {
    pub objects: BufferHandle,
    pub meshes: BufferHandle,
    pub meshlets: BufferHandle,
    pub vertices: BufferHandle,
    pub meshlet_data: BufferHandle,
    pub object_count: u32,
    pub meshlet_instances: u32,
}

impl SceneBuffers {
    /// Allocate buffers sized to `packed`, checking it against the limits
    pub fn create(ctx: &mut CullContext, packed: &PackedScene, limits: &CullLimits) -> CullResult<Self> {
        let check = |resource: &str, requested: u64, capacity: u64| {
            if requested > capacity {
                Err(CullError::CapacityExceeded {
                    resource: resource.to_string(),
                    requested,
                    capacity,
                })
            } else {
                Ok(())
            }
        };
        check("objects", packed.objects.len() as u64, limits.max_objects as u64)?;
        check("meshlet instances", packed.meshlet_instances as u64, limits.max_meshlets as u64)?;
        let largest = packed.meshlets.iter().map(|m| m.triangle_count).max().unwrap_or(0);
        check("meshlet triangles", largest as u64, limits.meshlet_max_triangles as u64)?;

        let usage = BufferUsage::STORAGE | BufferUsage::COPY_DST;
        let resources = &mut ctx.resources;
        let buffers = Self {
            objects: resources.create_buffer("scene objects", bytes_of_len::<GpuObject>(packed.objects.len()), usage),
            meshes: resources.create_buffer("scene meshes", bytes_of_len::<GpuMesh>(packed.meshes.len()), usage),
            meshlets: resources.create_buffer("scene meshlets", bytes_of_len::<GpuMeshlet>(packed.meshlets.len()), usage),
            vertices: resources.create_buffer("scene vertices", bytes_of_len::<[f32; 4]>(packed.vertices.len()), usage),
            meshlet_data: resources.create_buffer("scene meshlet data", bytes_of_len::<u32>(packed.meshlet_data.len()), usage),
            object_count: packed.objects.len() as u32,
            meshlet_instances: packed.meshlet_instances,
        };

        log::info!(
            "[SceneBuffers] {} objects, {} meshes, {} meshlets, {} meshlet instances",
            packed.objects.len(),
            packed.meshes.len(),
            packed.meshlets.len(),
            packed.meshlet_instances
        );
        Ok(buffers)
    }

    /// Record the host writes that fill the buffers
    pub fn upload(&self, ctx: &CullContext, packed: &PackedScene, list: &mut CommandList) -> CullResult<()> {
        let mut write = |handle: BufferHandle, bytes: &[u8]| -> CullResult<()> {
            if !bytes.is_empty() {
                let slice = ctx.resources.whole(handle)?.sub(0, bytes.len() as u64);
                list.write_buffer(slice, bytes);
            }
            Ok(())
        };
        write(self.objects, bytemuck::cast_slice(&packed.objects))?;
        write(self.meshes, bytemuck::cast_slice(&packed.meshes))?;
        write(self.meshlets, bytemuck::cast_slice(&packed.meshlets))?;
        write(self.vertices, bytemuck::cast_slice(&packed.vertices))?;
        write(self.meshlet_data, bytemuck::cast_slice(&packed.meshlet_data))?;
        Ok(())
    }

    /// Upper bound on meshlets one pass can emit
    pub fn potential_meshlet_count(&self) -> u32 {
        self.meshlet_instances
    }
}

fn bytes_of_len<T>(len: usize) -> u64 {
    (std::mem::size_of::<T>() * len) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_fits_one_meshlet_with_open_cone() {
        let cube = Mesh::cube(1.0);
        assert_eq!(cube.meshlets.len(), 1);
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(cube.meshlets[0].cone_cutoff, 1.0);
        assert!((cube.radius - 3.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn grid_splits_by_triangle_budget() {
        // 8x8 cells = 128 triangles
        let grid = Mesh::grid(8, 1.0, 32);
        assert_eq!(grid.triangle_count(), 128);
        assert!(grid.meshlets.iter().all(|m| m.triangles.len() <= 32));
        assert!(grid.meshlets.iter().all(|m| m.vertices.len() <= meshlet::MAX_VERTICES as usize));

        // Flat grid: tight cone around +Z
        let first = &grid.meshlets[0];
        assert!((first.cone_axis[2] - 1.0).abs() < 1e-5);
        assert!(first.cone_cutoff < 1e-3);
    }

    #[test]
    fn packing_assigns_instance_offsets() {
        let mut scene = Scene::new();
        let grid = scene.add_mesh(Mesh::grid(8, 1.0, 32));
        let cube = scene.add_mesh(Mesh::cube(1.0));
        scene.add_object(grid, Matrix4::from_scale(2.0)).unwrap();
        scene.add_object(cube, Matrix4::from_translation(Vector3::new(0.0, 0.0, -3.0))).unwrap();
        scene.add_object(grid, Matrix4::from_nonuniform_scale(1.0, 3.0, 1.0)).unwrap();

        let packed = scene.pack().unwrap();
        let grid_meshlets = packed.meshes[0].meshlet_count;
        assert_eq!(packed.objects[1].meshlet_instance_offset, grid_meshlets);
        assert_eq!(packed.objects[2].meshlet_instance_offset, grid_meshlets + 1);
        assert_eq!(packed.meshlet_instances, 2 * grid_meshlets + 1);
        assert_eq!(packed.objects[0].scale, 2.0);
        assert_eq!(packed.objects[2].scale, 3.0);

        // Vertex indices in meshlet data are global
        let cube_meshlet = &packed.meshlets[packed.meshes[1].meshlet_offset as usize];
        let first_vertex = packed.meshlet_data[cube_meshlet.data_offset as usize];
        assert!(first_vertex >= scene.meshes.iter().next().unwrap().1.positions.len() as u32);
    }

    #[test]
    fn oversized_scene_is_rejected() {
        let mut scene = Scene::new();
        let cube = scene.add_mesh(Mesh::cube(1.0));
        for _ in 0..3 {
            scene.add_object(cube, Matrix4::from_scale(1.0)).unwrap();
        }
        let packed = scene.pack().unwrap();
        let limits = CullLimits {
            max_objects: 2,
            ..CullLimits::default()
        };
        let result = SceneBuffers::create(&mut CullContext::new(), &packed, &limits);
        assert!(matches!(result, Err(CullError::CapacityExceeded { .. })));
    }
}
