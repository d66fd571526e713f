/// GPU-visible data layouts
///
/// Every struct here is shared byte-for-byte between the WGSL kernels in
/// `shaders/` and the CPU reference kernels.
use bytemuck::{Pod, Zeroable};

/// Per-frame cull state, one slot per buffered frame
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct GpuCullData {
    pub view: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    /// left, right, bottom, top, near, far
    pub frustum_planes: [[f32; 4]; 6],
    pub camera_position: [f32; 4],
    /// P00, P11, znear, zfar
    pub projection: [f32; 4],
    pub pyramid_size: [f32; 2],
    pub pyramid_mips: u32,
    /// `constants::flags::CULL_*`
    pub flags: u32,
    pub object_count: u32,
    pub max_command_count: u32,
    pub commands_per_batch: u32,
    pub sub_batch_count: u32,
    /// Word offsets into the shared visibility buffer
    pub meshlet_visibility_base: u32,
    pub triangle_visibility_base: u32,
    pub triangle_groups_per_meshlet: u32,
    pub meshlet_max_triangles: u32,
    /// Words per ring slot in the batch draw buffer
    pub batch_draw_stride: u32,
    /// Words per ring slot in the batch index buffer
    pub batch_index_stride: u32,
    /// Words per pass region in a dispatch argument buffer
    pub dispatch_region_words: u32,
    pub max_meshlets: u32,
}

/// Uniform slots are bound at 256-byte aligned offsets
pub const CULL_DATA_STRIDE: u64 = 512;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct GpuObject {
    pub model: [[f32; 4]; 4],
    pub mesh: u32,
    pub material: u32,
    /// First slot of this object's meshlets in the per-instance visibility arrays
    pub meshlet_instance_offset: u32,
    /// Largest axis scale of `model`
    pub scale: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct GpuMesh {
    /// Local-space center and radius
    pub bounding_sphere: [f32; 4],
    pub meshlet_offset: u32,
    pub meshlet_count: u32,
    pub _padding: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct GpuMeshlet {
    pub bounding_sphere: [f32; 4],
    /// Axis in xyz, cutoff in w
    pub cone_axis_cutoff: [f32; 4],
    /// Word offset into the meshlet data buffer: vertex indices, then packed triangles
    pub data_offset: u32,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub _padding: u32,
}

/// Output of meshlet cull, input of triangle cull
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct MeshletDrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    /// Object index
    pub first_instance: u32,
    /// Global meshlet index
    pub meshlet_index: u32,
    /// Meshlet instance slot (object offset + local meshlet)
    pub instance_index: u32,
    /// `constants::flags::COMMAND_RETEST`
    pub flags: u32,
}

/// Indexed indirect draw as the rasterizer consumes it
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DrawIndexedIndirect {
    pub index_count: u32,
    pub instance_count: u32,
    /// Absolute offset into the batch index buffer
    pub first_index: u32,
    pub base_vertex: i32,
    /// Object index
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchIndirectArgs {
    pub fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

/// Leading words of a dispatch argument region
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchHeader {
    /// Visible meshlets clamped to the command capacity
    pub command_count: u32,
    /// Batches with at least one command
    pub batch_count: u32,
    pub _padding: [u32; 2],
}

/// Leading words of a batch ring slot
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BatchCounters {
    pub draw_count: u32,
    pub index_cursor: u32,
    pub _padding: [u32; 2],
}

pub const WORDS_PER_DISPATCH_HEADER: u32 = 4;
pub const WORDS_PER_DISPATCH_ARGS: u32 = 3;
/// Clear, cull and compact arguments of one sub-batch
pub const DISPATCH_ARGS_PER_BATCH: u32 = 3;
pub const WORDS_PER_BATCH_COUNTERS: u32 = 4;
pub const WORDS_PER_DRAW: u32 = 5;
pub const WORDS_PER_MESHLET_COMMAND: u32 = 8;
