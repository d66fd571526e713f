// Meshlet Cull Constants - SINGLE SOURCE OF TRUTH
//
// Static capacity bounds of the culling pipeline. Every buffer the pipeline
// allocates is sized from these at initialization. Kernels receive the same
// values through the per-frame cull data, so CPU and GPU agree.
//
// Changing any value here means re-sizing every dependent buffer; there is
// no growth path after initialization.

/// Culling capacity bounds
pub mod culling {
    /// Maximum number of render objects the mesh cull stage can address
    pub const MAX_OBJECTS: u32 = 16_384;

    /// Maximum number of meshlet instances (object x meshlet) in a scene
    pub const MAX_MESHLETS: u32 = 262_144;

    /// Hardware budget for a single multi-draw-indirect call
    pub const MAX_DRAW_INDIRECT_CALLS: u32 = 16_384;

    /// Commands one CullDrawBatch can hold. One batch is one indirect draw call.
    pub const MAX_COMMANDS_PER_BATCH: u32 = MAX_DRAW_INDIRECT_CALLS;

    /// Capacity of the compacted meshlet command buffer: the indirect-call
    /// budget plus one batch of slack
    pub const MAX_COMMAND_COUNT: u32 = MAX_DRAW_INDIRECT_CALLS + MAX_COMMANDS_PER_BATCH;

    /// Number of sub-batches needed to cover MAX_COMMAND_COUNT
    pub const SUB_BATCH_COUNT: u32 = MAX_COMMAND_COUNT.div_ceil(MAX_COMMANDS_PER_BATCH);

    /// Frames in flight
    pub const BUFFERED_FRAMES: u32 = 2;

    /// Batch scratch slots in the ring
    pub const CULL_DRAW_BATCH_OVERLAP: u32 = 2;
}

/// Meshlet geometry budget
pub mod meshlet {
    /// Maximum triangles per meshlet
    pub const MAX_TRIANGLES: u32 = 124;

    /// Maximum unique vertices per meshlet
    pub const MAX_VERTICES: u32 = 64;

    /// Triangles tested together by one subgroup-sized sweep; also the width
    /// of one triangle visibility word
    pub const TRIANGLE_GROUP_SIZE: u32 = 32;

    /// Upper bound on triangle groups the triangle kernel tracks per meshlet
    pub const MAX_TRIANGLE_GROUPS: u32 = 8;
}

/// Compute workgroup sizes. Must match the WGSL kernels.
pub mod workgroup {
    /// Mesh cull, batch clear, batch compact, dispatch preparation
    pub const LINEAR: u32 = 64;

    /// Meshlet cull threads per object
    pub const MESHLET: u32 = 64;

    /// Triangle cull threads per command
    pub const TRIANGLE: u32 = super::meshlet::TRIANGLE_GROUP_SIZE;

    /// Depth reduction tile edge
    pub const REDUCE_TILE: u32 = 8;
}

/// Visibility flag bits
pub mod flags {
    /// Mesh visible this frame
    pub const MESH_VISIBLE: u32 = 1;

    /// Mesh recovered by the reocclusion pass
    pub const MESH_RECOVERED: u32 = 2;

    /// Meshlet command re-tests only triangles not drawn yet
    pub const COMMAND_RETEST: u32 = 1;

    /// Cull data toggles
    pub const CULL_FRUSTUM: u32 = 1;
    pub const CULL_OCCLUSION: u32 = 2;
    pub const CULL_CONE: u32 = 4;
    pub const CULL_TRIANGLES: u32 = 8;
}

/// Camera defaults
pub mod camera {
    pub const ZNEAR: f32 = 0.1;
    pub const FOVY_RADIANS: f32 = std::f32::consts::FRAC_PI_3;
}
