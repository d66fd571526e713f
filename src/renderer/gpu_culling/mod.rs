/// GPU-driven visibility culling
///
/// Two-pass occlusion culling over a meshlet scene: mesh cull, meshlet cull,
/// on-device dispatch argument preparation and a batched triangle cull that
/// compacts surviving triangles into indirect draws for the rasterizer.
///
/// Key components:
/// - Depth pyramid built from the previous frame's depth
/// - Per-frame cull data and visibility state on the device
/// - Stages that record into a backend-neutral command list
/// - A wgpu executor and a CPU reference executor with hazard validation

pub mod arena;
pub mod batch_cull;
pub mod commands;
pub mod cull_data;
pub mod cull_math;
pub mod depth_pyramid;
pub mod dispatch_args;
pub mod gpu_executor;
pub mod gpu_types;
pub mod hazards;
pub mod mesh_cull;
pub mod meshlet_cull;
pub mod pipeline;
pub mod reference;
pub mod resources;
pub mod scene;

pub use arena::{Arena, Handle};
pub use batch_cull::{BatchLayout, BatchRing, BatchTicket, CullDrawBatch, SceneBatchCull};
pub use commands::{
    Access, Barrier, BarrierTarget, Binding, CommandList, Consume, CullOp, CullPass, Dispatch, DispatchSize,
    IndirectDrawSource, Kernel, KernelParams, Stage,
};
pub use cull_data::{CullDataBuffers, VisibilityLayout};
pub use depth_pyramid::{pyramid_dimensions, DepthPyramid, PyramidSampler};
pub use dispatch_args::{batch_command_count, DispatchArgsLayout, DispatchArgsPrep};
pub use gpu_executor::{GpuCullExecutor, GpuStorage};
pub use gpu_types::{DrawIndexedIndirect, GpuCullData, GpuMesh, GpuMeshlet, GpuObject, MeshletDrawCommand};
pub use hazards::HazardTracker;
pub use mesh_cull::MeshCull;
pub use meshlet_cull::MeshletCull;
pub use pipeline::{CullPipeline, FrameSummary};
pub use reference::{ReferenceExecutor, ReferenceStats, ReferenceStorage};
pub use resources::{
    BufferDesc, BufferHandle, BufferSlice, BufferUsage, CullContext, ResourceRegistry, TextureDesc, TextureFormat,
    TextureHandle, TextureLayout,
};
pub use scene::{Mesh, Meshlet, PackedScene, RenderObject, Scene, SceneBuffers};
